//! 주문 상태 동기화.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - 주문 상태 전이와 정합성 규칙 (`state_machine`)
//! - 주문 트래커: 스트림 이벤트/스냅샷 반영, 변경 알림
//! - 정합성 폴러: 주기적 REST 스냅샷 조회
//! - 주문 동기화 서비스: 구성요소 조립과 주문 생성/취소
//!
//! # 예제
//!
//! ```rust,ignore
//! use trader_execution::OrderSyncService;
//!
//! let service = OrderSyncService::builder(config)
//!     .sender(sender)
//!     .authenticator(authenticator)
//!     .connector(connector)
//!     .parser(parser)
//!     .codec(codec)
//!     .build()?;
//! service.start().await?;
//!
//! let (_, mut updates) = service.tracker().subscribe_channel();
//! let handle = service.place_order(params).await?;
//! ```

pub mod reconciliation;
pub mod service;
pub mod state_machine;
pub mod tracker;

pub use reconciliation::{PollStats, ReconciliationPoller};
pub use service::{OrderSyncService, OrderSyncServiceBuilder, ServiceError, ServiceResult};
pub use state_machine::{Observation, OrderRecord, Transition};
pub use tracker::{
    CancelResult, ListenerId, OrderHandle, OrderTracker, OrderUpdateListener, TrackerError,
};
