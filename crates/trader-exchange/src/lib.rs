//! 거래소 경계 및 전송 계층.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - 거래소 경계 trait (요청 전송, 인증, 스트림 연결, 이벤트 정규화, 주문 코덱)
//! - 요청 한도 관리자 (고정 윈도우, 슬라이딩 윈도우, 토큰 버킷)
//! - 인증 스트림 세션 관리자 (재연결, 백오프, 자격증명 갱신)
//! - reqwest 기반 REST 전송기와 tokio-tungstenite 기반 WebSocket 연결

pub mod auth;
pub mod backoff;
pub mod error;
pub mod governor;
pub mod http;
pub mod session;
pub mod traits;
pub mod websocket;

pub use auth::ListenKeyAuthenticator;
pub use backoff::{BackoffPolicy, BackoffState, FixedJitter, JitterSource, RandomJitter};
pub use error::*;
pub use governor::{GovernedSender, RateGovernor, RatePermit};
pub use http::HttpRequestSender;
pub use session::{SessionState, StreamActivity, StreamMessage, StreamSessionManager};
pub use traits::*;
pub use websocket::{WsConnection, WsStreamConnector, CREDENTIAL_PLACEHOLDER};
