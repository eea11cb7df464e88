//! 거래소 통신 에러 타입.

use std::time::Duration;
use thiserror::Error;

/// 요청 실패 분류.
///
/// 거래소별 요청 계층이 응답 코드를 보고 분류합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    /// 일시적 실패 (5xx, 과부하 등) - 재시도 대상
    Transient,
    /// 거래소가 요청을 거부함 (잔고 부족, 잘못된 파라미터 등) - 최종 실패
    Rejected,
    /// 대상 주문이 존재하지 않음
    NotFound,
}

impl RequestErrorKind {
    /// HTTP 상태 코드로 기본 분류를 결정합니다.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => RequestErrorKind::NotFound,
            400..=499 if status != 408 && status != 429 => RequestErrorKind::Rejected,
            _ => RequestErrorKind::Transient,
        }
    }
}

/// 거래소 관련 에러.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// 연결 실패/네트워크 에러
    #[error("Transport error: {0}")]
    Transport(String),

    /// 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 타임아웃
    #[error("Timeout: {0}")]
    Timeout(String),

    /// WebSocket 프로토콜 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 요청 한도 초과
    #[error("Rate limit exceeded on pool '{pool}'")]
    RateLimitExceeded {
        pool: String,
        /// 용량이 생길 때까지 예상 대기 시간
        retry_after: Option<Duration>,
    },

    /// 요청 가중치가 풀 전체 용량보다 큼
    #[error("Weight {weight} exceeds capacity {capacity} of pool '{pool}'")]
    WeightExceedsCapacity {
        pool: String,
        weight: u32,
        capacity: u32,
    },

    /// 거래소가 반환한 요청 에러
    #[error("Request failed ({status}): {body}")]
    Request {
        status: u16,
        body: String,
        kind: RequestErrorKind,
    },

    /// 인증/권한 에러
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    Parse(String),

    /// 지원되지 않는 작업
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// 종료 중
    #[error("Shutting down")]
    Shutdown,
}

impl ExchangeError {
    /// 요청 에러를 상태 코드 기본 분류로 생성합니다.
    pub fn request(status: u16, body: impl Into<String>) -> Self {
        ExchangeError::Request {
            status,
            body: body.into(),
            kind: RequestErrorKind::from_status(status),
        }
    }

    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Transport(_)
            | ExchangeError::Disconnected(_)
            | ExchangeError::Timeout(_)
            | ExchangeError::WebSocket(_)
            | ExchangeError::RateLimitExceeded { .. } => true,
            ExchangeError::Request { kind, .. } => *kind == RequestErrorKind::Transient,
            _ => false,
        }
    }

    /// 연결 계층 에러인지 확인 (세션 재연결 대상).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_)
                | ExchangeError::Disconnected(_)
                | ExchangeError::Timeout(_)
                | ExchangeError::WebSocket(_)
        )
    }

    /// 인증 에러인지 확인.
    pub fn is_auth_error(&self) -> bool {
        match self {
            ExchangeError::Unauthorized(_) => true,
            ExchangeError::Request { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    /// 거래소가 요청을 최종 거부했는지 확인.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            ExchangeError::Request {
                kind: RequestErrorKind::Rejected,
                ..
            }
        )
    }

    /// 대상 주문이 없다는 응답인지 확인.
    pub fn is_order_not_found(&self) -> bool {
        matches!(
            self,
            ExchangeError::Request {
                kind: RequestErrorKind::NotFound,
                ..
            }
        )
    }

    /// 권장 재시도 대기 시간.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_decode() {
            ExchangeError::Parse(err.to_string())
        } else {
            ExchangeError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ExchangeError::Disconnected(err.to_string())
            }
            WsError::Io(e) => ExchangeError::Transport(e.to_string()),
            WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                ExchangeError::Unauthorized(format!("handshake rejected: {}", response.status()))
            }
            other => ExchangeError::WebSocket(other.to_string()),
        }
    }
}
