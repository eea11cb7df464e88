//! 재연결 백오프.
//!
//! 백오프 상태는 명시적인 값([`BackoffState`])이며 순수 함수로만 진행됩니다.
//! 현재 시각과 지터는 호출자가 주입하므로 실제 시간 없이 검증할 수 있습니다.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use trader_core::StreamConfig;

/// 지터 표본 공급자.
pub trait JitterSource: Send + Sync {
    /// `[0.0, 1.0)` 범위의 값.
    fn sample(&self) -> f64;
}

/// `rand` 기반 지터.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// 고정 지터 (테스트용).
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// 지수 백오프 정책.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// 첫 재시도 지연
    pub base: Duration,
    /// 최대 지연
    pub max: Duration,
    /// 시도당 배수
    pub multiplier: f64,
    /// 지터 비율 (0~1)
    pub jitter: f64,
}

impl BackoffPolicy {
    /// 스트림 설정에서 정책을 생성합니다.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.backoff_jitter,
        }
    }

    /// 지터 없는 `attempt`번째(1부터) 지연.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.base.as_millis() as f64 * factor;
        let max = self.max.as_millis() as f64;
        Duration::from_millis(millis.min(max) as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

/// 세션별 백오프 상태.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// 연속 실패 횟수
    pub attempt: u32,
    /// 다음 시도 가능 시각
    pub next_allowed_at: Option<Instant>,
    /// 직전 지연
    pub last_delay: Duration,
}

impl BackoffState {
    /// 초기 상태.
    pub fn new() -> Self {
        Self::default()
    }

    /// 실패를 기록하고 다음 상태와 이번 지연을 반환합니다.
    ///
    /// 지터는 `[d*(1-j), d]` 범위에서 적용되며, 지연은 최대값에 도달할 때까지
    /// 직전 지연보다 작아지지 않습니다.
    pub fn on_failure(
        self,
        policy: &BackoffPolicy,
        now: Instant,
        jitter: &dyn JitterSource,
    ) -> (BackoffState, Duration) {
        let attempt = self.attempt.saturating_add(1);
        let nominal = policy.nominal_delay(attempt);
        let shave = policy.jitter.clamp(0.0, 1.0) * jitter.sample();
        let jittered = nominal.mul_f64(1.0 - shave);
        let delay = jittered.max(self.last_delay).min(policy.max);

        let next = BackoffState {
            attempt,
            next_allowed_at: Some(now + delay),
            last_delay: delay,
        };
        (next, delay)
    }

    /// 성공적으로 연결을 유지한 뒤 상태를 초기화합니다.
    pub fn on_success(self) -> BackoffState {
        BackoffState::default()
    }

    /// 다음 시도까지 남은 시간.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_allowed_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }
}
