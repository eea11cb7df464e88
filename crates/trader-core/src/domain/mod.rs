//! 주문 동기화 도메인 모델.

mod event;
mod order;
mod trade;

pub use event::*;
pub use order::*;
pub use trade::*;
