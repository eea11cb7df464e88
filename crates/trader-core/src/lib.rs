//! # Trader Core
//!
//! 거래소 주문 동기화의 공통 기반을 제공합니다.
//!
//! 이 크레이트는 다른 크레이트가 공유하는 기본 요소를 제공합니다:
//! - 주문, 체결, 정규화 이벤트 도메인 모델
//! - 거래 쌍과 Decimal 타입
//! - 설정 로드 (`SyncConfig`)
//! - 로깅 초기화
//! - 단조 시계와 관측 이벤트 싱크

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod types;

pub use clock::*;
pub use config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use observability::*;
pub use types::*;
