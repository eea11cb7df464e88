//! 단조 시계 추상화.
//!
//! 백오프, 요청 한도, 세션 갱신 기한은 모두 이 트레이트를 통해 현재 시각을 얻습니다.
//! 기본 구현은 tokio 시계를 사용하므로 `start_paused` 테스트에서 시간을 제어할 수 있고,
//! 동기 테스트에서는 [`ManualClock`]으로 시간을 직접 진행시킵니다.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// 현재 시각 제공자.
pub trait Clock: Send + Sync + 'static {
    /// 단조 증가 시각.
    fn now(&self) -> Instant;

    /// 벽시계 시각.
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// tokio 시계 기반 기본 구현.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 수동으로 진행시키는 테스트용 시계.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// 현재 시각에서 시작하는 시계를 생성합니다.
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// 시간을 진행시킵니다.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
