//! 요청 한도 관리자.
//!
//! 모든 거래소 요청은 전송 전에 하나 이상의 이름 있는 풀에서 가중치를 소비합니다.
//!
//! 제공 기능:
//! - 고정 구간 / 슬라이딩 구간 / 토큰 버킷 풀
//! - 전역 풀 + 엔드포인트별 풀 조합 (모두 가능할 때만 소비, 아니면 아무것도 소비하지 않음)
//! - `Block` 정책: 타임아웃 안에서 용량이 생길 때까지 대기
//! - `FailFast` 정책: 즉시 `RateLimitExceeded` 반환
//! - [`GovernedSender`]: 임의의 `RequestSender` 앞에 한도 검사를 붙이는 래퍼

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use trader_core::{Clock, PoolConfig, PoolWeight, RateLimitConfig, RateLimitPolicy, SystemClock, WindowKind};

use crate::traits::{ApiResponse, ExchangeResult, RequestSender, RequestSpec};
use crate::ExchangeError;

/// 토큰 버킷 부동소수 오차 허용치.
const TOKEN_EPSILON: f64 = 1e-9;

/// 풀별 사용량 기록.
#[derive(Debug)]
enum Window {
    Fixed { start: Instant, used: u32 },
    Sliding { log: VecDeque<(Instant, u32)>, used: u32 },
    Bucket { tokens: f64, last_refill: Instant },
}

#[derive(Debug)]
struct PoolState {
    capacity: u32,
    interval: Duration,
    window: Window,
}

impl PoolState {
    fn new(config: &PoolConfig, capacity: u32, now: Instant) -> Self {
        let window = match config.kind {
            WindowKind::FixedWindow => Window::Fixed { start: now, used: 0 },
            WindowKind::SlidingWindow => Window::Sliding {
                log: VecDeque::new(),
                used: 0,
            },
            WindowKind::TokenBucket => Window::Bucket {
                tokens: capacity as f64,
                last_refill: now,
            },
        };
        Self {
            capacity,
            interval: config.interval(),
            window,
        }
    }

    /// 시간 경과를 반영합니다.
    fn refresh(&mut self, now: Instant) {
        let interval = self.interval;
        let capacity = self.capacity as f64;
        match &mut self.window {
            Window::Fixed { start, used } => {
                let elapsed = now.saturating_duration_since(*start);
                if elapsed >= interval {
                    let periods = elapsed.as_nanos() / interval.as_nanos().max(1);
                    let advance = interval.as_nanos().saturating_mul(periods);
                    *start += Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX));
                    *used = 0;
                }
            }
            Window::Sliding { log, used } => {
                while let Some(&(at, weight)) = log.front() {
                    if at + interval > now {
                        break;
                    }
                    log.pop_front();
                    *used -= weight;
                }
            }
            Window::Bucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
                let rate = capacity / interval.as_secs_f64();
                *tokens = (*tokens + elapsed * rate).min(capacity);
                *last_refill = now;
            }
        }
    }

    fn has_room(&self, weight: u32) -> bool {
        match &self.window {
            Window::Fixed { used, .. } | Window::Sliding { used, .. } => {
                used + weight <= self.capacity
            }
            Window::Bucket { tokens, .. } => *tokens + TOKEN_EPSILON >= weight as f64,
        }
    }

    fn available(&self) -> u32 {
        match &self.window {
            Window::Fixed { used, .. } | Window::Sliding { used, .. } => {
                self.capacity.saturating_sub(*used)
            }
            Window::Bucket { tokens, .. } => (*tokens + TOKEN_EPSILON).floor() as u32,
        }
    }

    /// `weight`만큼 용량이 생길 때까지 걸리는 시간. `refresh` 이후에 호출합니다.
    fn wait_time(&self, weight: u32, now: Instant) -> Duration {
        if self.has_room(weight) {
            return Duration::ZERO;
        }
        match &self.window {
            Window::Fixed { start, .. } => (*start + self.interval).saturating_duration_since(now),
            Window::Sliding { log, used } => {
                let mut freed = 0u32;
                for &(at, w) in log {
                    freed += w;
                    if used - freed + weight <= self.capacity {
                        return (at + self.interval).saturating_duration_since(now);
                    }
                }
                self.interval
            }
            Window::Bucket { tokens, .. } => {
                let rate = self.capacity as f64 / self.interval.as_secs_f64();
                Duration::from_secs_f64(((weight as f64 - tokens) / rate).max(0.0))
            }
        }
    }

    fn consume(&mut self, weight: u32, now: Instant) {
        match &mut self.window {
            Window::Fixed { used, .. } => *used += weight,
            Window::Sliding { log, used } => {
                log.push_back((now, weight));
                *used += weight;
            }
            Window::Bucket { tokens, .. } => *tokens -= weight as f64,
        }
    }
}

/// 승인된 요청 허가.
#[derive(Debug, Clone, PartialEq)]
pub struct RatePermit {
    /// 엔드포인트 분류
    pub limit_id: String,
    /// 소비한 풀과 가중치
    pub charges: Vec<(String, u32)>,
    /// 대기한 시간
    pub waited: Duration,
}

/// 거절 사유.
enum Denial {
    /// 대기하면 가능
    Wait { pool: String, wait: Duration },
    /// 풀 전체 용량보다 큼
    TooLarge { pool: String, weight: u32, capacity: u32 },
}

/// 여러 풀을 관리하는 요청 한도 관리자.
pub struct RateGovernor {
    pools: Mutex<HashMap<String, PoolState>>,
    global_pools: Vec<String>,
    endpoints: HashMap<String, Vec<PoolWeight>>,
    policy: RateLimitPolicy,
    acquire_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RateGovernor {
    /// 설정으로 생성합니다.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// 시계를 지정해 생성합니다.
    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let pools = config
            .pools
            .iter()
            .map(|pool| {
                let capacity = config.effective_capacity(pool);
                (pool.name.clone(), PoolState::new(pool, capacity, now))
            })
            .collect();
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| (e.limit_id.clone(), e.pools.clone()))
            .collect();

        Self {
            pools: Mutex::new(pools),
            global_pools: config.global_pools.clone(),
            endpoints,
            policy: config.policy,
            acquire_timeout: config.acquire_timeout(),
            clock,
        }
    }

    /// 설정된 정책으로 허가를 얻습니다.
    pub async fn acquire(&self, limit_id: &str, weight: u32) -> ExchangeResult<RatePermit> {
        match self.policy {
            RateLimitPolicy::Block => {
                self.acquire_with_timeout(limit_id, weight, self.acquire_timeout)
                    .await
            }
            RateLimitPolicy::FailFast => self.try_acquire(limit_id, weight),
        }
    }

    /// 대기 없이 허가를 시도합니다.
    pub fn try_acquire(&self, limit_id: &str, weight: u32) -> ExchangeResult<RatePermit> {
        let charges = self.charges(limit_id, weight);
        match self.reserve(&charges) {
            Ok(()) => Ok(RatePermit {
                limit_id: limit_id.to_string(),
                charges,
                waited: Duration::ZERO,
            }),
            Err(denial) => Err(denial_error(denial)),
        }
    }

    /// 최대 `timeout`까지 기다리며 허가를 얻습니다.
    ///
    /// 필요한 대기 시간이 남은 시간을 넘으면 즉시 실패합니다.
    pub async fn acquire_with_timeout(
        &self,
        limit_id: &str,
        weight: u32,
        timeout: Duration,
    ) -> ExchangeResult<RatePermit> {
        let charges = self.charges(limit_id, weight);
        let started = self.clock.now();
        let deadline = started + timeout;

        loop {
            match self.reserve(&charges) {
                Ok(()) => {
                    return Ok(RatePermit {
                        limit_id: limit_id.to_string(),
                        charges,
                        waited: self.clock.now().saturating_duration_since(started),
                    });
                }
                Err(Denial::Wait { pool, wait }) => {
                    let now = self.clock.now();
                    if now + wait > deadline {
                        warn!(
                            pool = %pool,
                            limit_id,
                            weight,
                            wait_ms = wait.as_millis() as u64,
                            "Rate limit wait exceeds acquire timeout"
                        );
                        return Err(ExchangeError::RateLimitExceeded {
                            pool,
                            retry_after: Some(wait),
                        });
                    }
                    debug!(
                        pool = %pool,
                        limit_id,
                        wait_ms = wait.as_millis() as u64,
                        "Waiting for rate limit capacity"
                    );
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
                Err(denial) => return Err(denial_error(denial)),
            }
        }
    }

    /// 풀의 현재 남은 용량.
    pub fn available(&self, pool: &str) -> Option<u32> {
        let now = self.clock.now();
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.get_mut(pool).map(|state| {
            state.refresh(now);
            state.available()
        })
    }

    /// 요청이 소비할 풀과 가중치를 계산합니다.
    ///
    /// 등록되지 않은 엔드포인트는 전역 풀만 소비합니다.
    fn charges(&self, limit_id: &str, weight: u32) -> Vec<(String, u32)> {
        let mut charges: BTreeMap<String, u32> = BTreeMap::new();
        for pool in &self.global_pools {
            *charges.entry(pool.clone()).or_default() += weight;
        }
        match self.endpoints.get(limit_id) {
            Some(links) => {
                for link in links {
                    *charges.entry(link.pool.clone()).or_default() += link.weight.unwrap_or(weight);
                }
            }
            None if !self.endpoints.is_empty() => {
                debug!(limit_id, "Unknown endpoint class, applying global pools only");
            }
            None => {}
        }
        charges.into_iter().filter(|(_, w)| *w > 0).collect()
    }

    /// 모든 풀에 여유가 있으면 한꺼번에 소비합니다.
    fn reserve(&self, charges: &[(String, u32)]) -> Result<(), Denial> {
        let now = self.clock.now();
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());

        let mut longest: Option<(String, Duration)> = None;
        for (name, weight) in charges {
            let Some(state) = pools.get_mut(name) else {
                continue;
            };
            if *weight > state.capacity {
                return Err(Denial::TooLarge {
                    pool: name.clone(),
                    weight: *weight,
                    capacity: state.capacity,
                });
            }
            state.refresh(now);
            if !state.has_room(*weight) {
                let wait = state.wait_time(*weight, now);
                if longest.as_ref().map_or(true, |(_, w)| wait > *w) {
                    longest = Some((name.clone(), wait));
                }
            }
        }

        if let Some((pool, wait)) = longest {
            return Err(Denial::Wait { pool, wait });
        }

        for (name, weight) in charges {
            if let Some(state) = pools.get_mut(name) {
                state.consume(*weight, now);
            }
        }
        Ok(())
    }
}

fn denial_error(denial: Denial) -> ExchangeError {
    match denial {
        Denial::Wait { pool, wait } => ExchangeError::RateLimitExceeded {
            pool,
            retry_after: Some(wait),
        },
        Denial::TooLarge {
            pool,
            weight,
            capacity,
        } => ExchangeError::WeightExceedsCapacity {
            pool,
            weight,
            capacity,
        },
    }
}

/// 요청 한도를 거쳐 전송하는 `RequestSender`.
#[derive(Clone)]
pub struct GovernedSender {
    inner: Arc<dyn RequestSender>,
    governor: Arc<RateGovernor>,
}

impl GovernedSender {
    /// 새 래퍼를 생성합니다.
    pub fn new(inner: Arc<dyn RequestSender>, governor: Arc<RateGovernor>) -> Self {
        Self { inner, governor }
    }

    /// 공유 한도 관리자.
    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }
}

#[async_trait]
impl RequestSender for GovernedSender {
    async fn send_request(&self, spec: RequestSpec) -> ExchangeResult<ApiResponse> {
        let permit = self.governor.acquire(&spec.limit_id, spec.weight).await?;
        if !permit.waited.is_zero() {
            debug!(
                limit_id = %permit.limit_id,
                waited_ms = permit.waited.as_millis() as u64,
                "Request delayed by rate limit"
            );
        }
        self.inner.send_request(spec).await
    }
}
