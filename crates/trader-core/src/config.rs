//! 동기화 설정.
//!
//! 설정 파일(TOML)과 `SYNC__` 접두사 환경 변수에서 로드합니다.
//! 예: `SYNC__POLLER__INTERVAL_MS=30000`
//!
//! 모든 필드에 기본값이 있으므로 빈 파일로도 실행할 수 있습니다.

use crate::error::{TraderError, TraderResult};
use crate::logging::LogConfig;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// 동기화 전체 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 계정 이름 (로그와 관측 이벤트에 사용)
    #[serde(default = "default_account")]
    pub account: String,
    /// 클라이언트 주문 ID 접두사
    #[serde(default = "default_order_id_prefix")]
    pub client_order_id_prefix: String,
    /// 로깅 설정
    #[serde(default)]
    pub logging: LogConfig,
    /// 요청 한도 설정
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 스트림 세션 설정
    #[serde(default)]
    pub stream: StreamConfig,
    /// 주문 추적 설정
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// 정합성 폴러 설정
    #[serde(default)]
    pub poller: PollerConfig,
}

fn default_account() -> String {
    "default".to_string()
}

fn default_order_id_prefix() -> String {
    "sync-".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            account: default_account(),
            client_order_id_prefix: default_order_id_prefix(),
            logging: LogConfig::default(),
            rate_limit: RateLimitConfig::default(),
            stream: StreamConfig::default(),
            tracker: TrackerConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

// ==================== 요청 한도 ====================

/// 한도 초과 시 동작.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// 용량이 생길 때까지 대기 (타임아웃 있음)
    #[default]
    Block,
    /// 즉시 `RateLimitExceeded` 반환
    FailFast,
}

/// 풀 용량 보충 방식.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// 고정 구간마다 전체 용량 초기화
    FixedWindow,
    /// 최근 `interval` 동안의 사용량 합계로 제한
    #[default]
    SlidingWindow,
    /// 연속적인 토큰 보충
    TokenBucket,
}

/// 이름 있는 한도 풀.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 풀 이름
    pub name: String,
    /// 구간당 최대 가중치
    pub capacity: u32,
    /// 구간 길이 (밀리초)
    pub interval_ms: u64,
    /// 보충 방식
    #[serde(default)]
    pub kind: WindowKind,
}

impl PoolConfig {
    /// 새 풀 설정을 생성합니다.
    pub fn new(name: impl Into<String>, capacity: u32, interval: Duration, kind: WindowKind) -> Self {
        Self {
            name: name.into(),
            capacity,
            interval_ms: interval.as_millis() as u64,
            kind,
        }
    }

    /// 구간 길이.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// 엔드포인트가 소비하는 풀과 가중치.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolWeight {
    /// 풀 이름
    pub pool: String,
    /// 고정 가중치. 없으면 요청 가중치를 사용합니다.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl PoolWeight {
    /// 요청 가중치를 그대로 쓰는 연결을 생성합니다.
    pub fn request(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            weight: None,
        }
    }

    /// 고정 가중치 연결을 생성합니다.
    pub fn fixed(pool: impl Into<String>, weight: u32) -> Self {
        Self {
            pool: pool.into(),
            weight: Some(weight),
        }
    }
}

/// 엔드포인트 분류별 한도 연결.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 엔드포인트 분류 (요청의 `limit_id`)
    pub limit_id: String,
    /// 추가로 소비하는 풀
    #[serde(default)]
    pub pools: Vec<PoolWeight>,
}

/// 요청 한도 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 한도 초과 시 동작
    #[serde(default)]
    pub policy: RateLimitPolicy,
    /// `Block` 정책의 최대 대기 시간 (밀리초)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// 각 풀 용량에서 덜어낼 안전 여유 비율 (0~100)
    #[serde(default)]
    pub safety_margin_pct: Decimal,
    /// 풀 목록
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,
    /// 모든 요청이 소비하는 풀 이름
    #[serde(default = "default_global_pools")]
    pub global_pools: Vec<String>,
    /// 엔드포인트별 추가 풀
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_pools() -> Vec<PoolConfig> {
    vec![PoolConfig::new(
        "request_weight",
        1200,
        Duration::from_secs(60),
        WindowKind::SlidingWindow,
    )]
}

fn default_global_pools() -> Vec<String> {
    vec!["request_weight".to_string()]
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            policy: RateLimitPolicy::Block,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            safety_margin_pct: Decimal::ZERO,
            pools: default_pools(),
            global_pools: default_global_pools(),
            endpoints: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// `Block` 정책의 최대 대기 시간.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// 안전 여유를 적용한 풀의 실제 용량.
    ///
    /// 여유를 적용해도 최소 1은 남깁니다.
    pub fn effective_capacity(&self, pool: &PoolConfig) -> u32 {
        if self.safety_margin_pct <= Decimal::ZERO {
            return pool.capacity;
        }
        let keep = (dec!(100) - self.safety_margin_pct).max(Decimal::ZERO) / dec!(100);
        let scaled = (Decimal::from(pool.capacity) * keep).floor();
        scaled.to_u32().unwrap_or(0).max(1).min(pool.capacity)
    }
}

// ==================== 스트림 세션 ====================

/// 스트림 세션 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// 메시지가 없을 때 ping을 보내기까지의 시간 (밀리초)
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// ping 이후 응답을 기다리는 시간 (밀리초)
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,
    /// 자격증명 갱신 주기 (밀리초)
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
    /// 재연결 백오프 시작 지연 (밀리초)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 재연결 백오프 최대 지연 (밀리초)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 백오프 배수
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 지터 비율 (0.0~1.0). 지연은 `[d*(1-j), d]` 범위에서 선택됩니다.
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    /// 이 시간 이상 유지된 세션이 끊기면 백오프를 초기화합니다 (밀리초)
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,
    /// 원시 메시지 큐 용량
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// 연결 종료 대기 시간 (밀리초)
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}
fn default_keepalive_timeout_ms() -> u64 {
    10_000
}
fn default_renew_interval_ms() -> u64 {
    60_000
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_jitter() -> f64 {
    0.2
}
fn default_stable_after_ms() -> u64 {
    60_000
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_close_timeout_ms() -> u64 {
    5_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            renew_interval_ms: default_renew_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: default_backoff_jitter(),
            stable_after_ms: default_stable_after_ms(),
            queue_capacity: default_queue_capacity(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl StreamConfig {
    /// ping 전 무응답 허용 시간.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// ping 응답 대기 시간.
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    /// 자격증명 갱신 주기.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    /// 연결 종료 대기 시간.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// 안정 세션 기준 시간.
    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}

// ==================== 주문 추적 ====================

/// 주문 추적 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// 분실 처리 전 허용하는 "주문 없음" 응답 횟수
    #[serde(default = "default_lost_order_limit")]
    pub lost_order_limit: u32,
    /// 접수 확인 없이 기다리는 폴링 주기 수
    #[serde(default = "default_unconfirmed_cycles")]
    pub unconfirmed_cycles: u32,
    /// 체결량 반올림 허용 오차
    #[serde(default = "default_fill_tolerance")]
    pub fill_tolerance: Decimal,
    /// 최종 상태 주문 보관 시간 (초)
    #[serde(default = "default_finished_retention_secs")]
    pub finished_retention_secs: u64,
}

fn default_lost_order_limit() -> u32 {
    3
}
fn default_unconfirmed_cycles() -> u32 {
    3
}
fn default_fill_tolerance() -> Decimal {
    dec!(0.00000001)
}
fn default_finished_retention_secs() -> u64 {
    3600
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            lost_order_limit: default_lost_order_limit(),
            unconfirmed_cycles: default_unconfirmed_cycles(),
            fill_tolerance: default_fill_tolerance(),
            finished_retention_secs: default_finished_retention_secs(),
        }
    }
}

impl TrackerConfig {
    /// 최종 상태 주문 보관 시간.
    pub fn finished_retention(&self) -> Duration {
        Duration::from_secs(self.finished_retention_secs)
    }
}

// ==================== 정합성 폴러 ====================

/// 정합성 폴러 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// 스트림이 정상일 때의 폴링 주기 (밀리초)
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// 스트림이 조용할 때의 짧은 폴링 주기 (밀리초)
    #[serde(default = "default_short_interval_ms")]
    pub short_interval_ms: u64,
    /// 이 시간 동안 스트림 메시지가 없으면 짧은 주기를 사용합니다 (밀리초)
    #[serde(default = "default_stream_silence_ms")]
    pub stream_silence_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    120_000
}
fn default_short_interval_ms() -> u64 {
    5_000
}
fn default_stream_silence_ms() -> u64 {
    60_000
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            short_interval_ms: default_short_interval_ms(),
            stream_silence_ms: default_stream_silence_ms(),
        }
    }
}

impl PollerConfig {
    /// 긴 폴링 주기.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// 짧은 폴링 주기.
    pub fn short_interval(&self) -> Duration {
        Duration::from_millis(self.short_interval_ms)
    }

    /// 스트림 무응답 판단 기준.
    pub fn stream_silence(&self) -> Duration {
        Duration::from_millis(self.stream_silence_ms)
    }
}

// ==================== 로드/검증 ====================

impl SyncConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> TraderResult<Self> {
        let builder = config::Config::builder()
            // 파일에서 로드
            .add_source(config::File::from(path.as_ref()))
            // 환경 변수로 오버라이드
            .add_source(
                config::Environment::with_prefix("SYNC")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: SyncConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 로드합니다. 환경 변수는 적용하지 않습니다.
    pub fn from_toml_str(toml: &str) -> TraderResult<Self> {
        let config: SyncConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 설정 값의 일관성을 검사합니다.
    pub fn validate(&self) -> TraderResult<()> {
        let rate = &self.rate_limit;
        let mut names = HashSet::new();
        for pool in &rate.pools {
            if pool.capacity == 0 || pool.interval_ms == 0 {
                return Err(TraderError::Config(format!(
                    "pool '{}' must have positive capacity and interval",
                    pool.name
                )));
            }
            if !names.insert(pool.name.as_str()) {
                return Err(TraderError::Config(format!(
                    "duplicate pool '{}'",
                    pool.name
                )));
            }
        }

        let linked = rate
            .endpoints
            .iter()
            .flat_map(|e| e.pools.iter().map(|p| p.pool.as_str()));
        for name in rate.global_pools.iter().map(String::as_str).chain(linked) {
            if !names.contains(name) {
                return Err(TraderError::Config(format!("unknown pool '{}'", name)));
            }
        }

        if rate.safety_margin_pct < Decimal::ZERO || rate.safety_margin_pct >= dec!(100) {
            return Err(TraderError::Config(format!(
                "safety_margin_pct out of range: {}",
                rate.safety_margin_pct
            )));
        }

        let stream = &self.stream;
        if stream.queue_capacity == 0 {
            return Err(TraderError::Config("stream.queue_capacity must be positive".into()));
        }
        let timings = [
            ("keepalive_interval_ms", stream.keepalive_interval_ms),
            ("keepalive_timeout_ms", stream.keepalive_timeout_ms),
            ("renew_interval_ms", stream.renew_interval_ms),
            ("close_timeout_ms", stream.close_timeout_ms),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, value)| *value == 0) {
            return Err(TraderError::Config(format!("stream.{} must be positive", name)));
        }
        if stream.backoff_base_ms == 0 || stream.backoff_max_ms < stream.backoff_base_ms {
            return Err(TraderError::Config(
                "stream backoff requires 0 < backoff_base_ms <= backoff_max_ms".into(),
            ));
        }
        if stream.backoff_multiplier < 1.0 || !(0.0..=1.0).contains(&stream.backoff_jitter) {
            return Err(TraderError::Config(
                "stream backoff requires multiplier >= 1 and jitter in [0, 1]".into(),
            ));
        }

        if self.tracker.fill_tolerance < Decimal::ZERO {
            return Err(TraderError::Config("tracker.fill_tolerance must not be negative".into()));
        }
        if self.tracker.lost_order_limit == 0 {
            return Err(TraderError::Config("tracker.lost_order_limit must be positive".into()));
        }

        if self.poller.interval_ms == 0 || self.poller.short_interval_ms == 0 {
            return Err(TraderError::Config("poller intervals must be positive".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tracker.lost_order_limit, 3);
        assert_eq!(config.stream.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.poller.short_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_toml() {
        let toml = r#"
            account = "binance-main"

            [rate_limit]
            policy = "fail_fast"
            global_pools = ["weight"]

            [[rate_limit.pools]]
            name = "weight"
            capacity = 1200
            interval_ms = 60000

            [[rate_limit.pools]]
            name = "orders"
            capacity = 10
            interval_ms = 1000
            kind = "fixed_window"

            [[rate_limit.endpoints]]
            limit_id = "create_order"
            pools = [{ pool = "orders", weight = 1 }]

            [tracker]
            fill_tolerance = "0.0001"

            [poller]
            interval_ms = 30000
        "#;

        let config = SyncConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.account, "binance-main");
        assert_eq!(config.rate_limit.policy, RateLimitPolicy::FailFast);
        assert_eq!(config.rate_limit.pools.len(), 2);
        assert_eq!(config.rate_limit.pools[1].kind, WindowKind::FixedWindow);
        assert_eq!(
            config.rate_limit.endpoints[0].pools[0],
            PoolWeight::fixed("orders", 1)
        );
        assert_eq!(config.tracker.fill_tolerance, dec!(0.0001));
        assert_eq!(config.poller.interval(), Duration::from_secs(30));
        // 지정하지 않은 섹션은 기본값
        assert_eq!(config.stream.queue_capacity, 1000);
    }

    #[test]
    fn test_load_sample_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/sync.toml");
        let config = SyncConfig::load(&path).unwrap();

        assert_eq!(config.account, "binance-main");
        assert_eq!(config.rate_limit.safety_margin_pct, dec!(5));
        assert_eq!(config.rate_limit.endpoints[0].limit_id, "create_order");
        assert_eq!(config.stream.renew_interval_ms, 1_800_000);
        assert_eq!(config.tracker.finished_retention(), Duration::from_secs(3600));
    }

    #[test]
    fn test_unknown_pool_rejected() {
        let mut config = SyncConfig::default();
        config.rate_limit.endpoints.push(EndpointConfig {
            limit_id: "create_order".to_string(),
            pools: vec![PoolWeight::request("missing")],
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = SyncConfig::default();
        config.stream.backoff_max_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_stream_timings_rejected() {
        for field in ["keepalive_interval_ms", "keepalive_timeout_ms", "renew_interval_ms", "close_timeout_ms"] {
            let mut config = SyncConfig::default();
            match field {
                "keepalive_interval_ms" => config.stream.keepalive_interval_ms = 0,
                "keepalive_timeout_ms" => config.stream.keepalive_timeout_ms = 0,
                "renew_interval_ms" => config.stream.renew_interval_ms = 0,
                _ => config.stream.close_timeout_ms = 0,
            }
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains(field), "{}: {}", field, err);
        }
    }

    #[test]
    fn test_effective_capacity_with_margin() {
        let mut rate = RateLimitConfig::default();
        let pool = PoolConfig::new("p", 10, Duration::from_secs(1), WindowKind::FixedWindow);
        assert_eq!(rate.effective_capacity(&pool), 10);

        rate.safety_margin_pct = dec!(25);
        assert_eq!(rate.effective_capacity(&pool), 7);

        rate.safety_margin_pct = dec!(99.9);
        assert_eq!(rate.effective_capacity(&pool), 1);
    }
}
