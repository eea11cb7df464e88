//! 주문 타입 및 생명주기 상태.
//!
//! 이 모듈은 주문 동기화에 필요한 주문 관련 타입을 정의합니다:
//! - `Side` - 주문 방향 (매수/매도)
//! - `OrderType` - 주문 유형
//! - `OrderState` - 주문 생명주기 상태와 진행 순위
//! - `UpdateSource` - 마지막 갱신 출처
//! - `OrderParams` - 주문 생성 파라미터
//! - `Order` - 추적 중인 주문 엔티티
//! - `OrderSnapshot` - 외부에 제공되는 읽기 전용 사본

use crate::domain::TradeFill;
use crate::types::{Fee, Price, Quantity, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 거래소가 허용하는 클라이언트 주문 ID 최대 길이.
pub const MAX_CLIENT_ORDER_ID_LEN: usize = 36;

/// 주문 방향 (매수 또는 매도).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// 시장가 주문
    Market,
    /// 지정가 주문
    Limit,
    /// 메이커 전용 지정가 주문
    LimitMaker,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::LimitMaker => write!(f, "LIMIT_MAKER"),
        }
    }
}

/// 주문 생명주기 상태.
///
/// ```text
/// PendingCreate → Open ⇄ PartiallyFilled → Filled
/// Open/PartiallyFilled → PendingCancel → Canceled
/// PendingCreate → Failed (생성 거부, 분실)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// 생성 요청 전/응답 대기 중
    PendingCreate,
    /// 거래소에 접수됨
    Open,
    /// 부분 체결됨
    PartiallyFilled,
    /// 취소 요청 후 확인 대기 중
    PendingCancel,
    /// 전량 체결됨
    Filled,
    /// 취소됨
    Canceled,
    /// 거부 또는 분실
    Failed,
}

impl OrderState {
    /// 생명주기 진행 순위.
    ///
    /// 더 큰 순위만 기존 상태를 덮어쓸 수 있습니다. 최종 상태는 모두 같은 순위입니다.
    pub fn progress_rank(&self) -> u8 {
        match self {
            OrderState::PendingCreate => 0,
            OrderState::Open => 1,
            OrderState::PartiallyFilled => 2,
            OrderState::PendingCancel => 3,
            OrderState::Filled | OrderState::Canceled | OrderState::Failed => 4,
        }
    }

    /// 최종 상태인지 확인합니다.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Failed
        )
    }

    /// 아직 진행 중인 주문인지 확인합니다.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// 거래소가 주문을 접수한 이후 상태인지 확인합니다.
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, OrderState::PendingCreate)
    }

    /// 로그용 이름.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::PendingCreate => "pending_create",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::PendingCancel => "pending_cancel",
            OrderState::Filled => "filled",
            OrderState::Canceled => "canceled",
            OrderState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 주문 상태 갱신의 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// 로컬 등록
    Local,
    /// REST 요청 응답 (생성/취소 결과)
    Rest,
    /// 실시간 스트림 이벤트
    Stream,
    /// 주기적 스냅샷 조회
    Snapshot,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateSource::Local => "local",
            UpdateSource::Rest => "rest",
            UpdateSource::Stream => "stream",
            UpdateSource::Snapshot => "snapshot",
        };
        f.write_str(s)
    }
}

/// 새 주문 생성을 위한 파라미터.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    /// 거래 쌍
    pub symbol: Symbol,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    pub order_type: OrderType,
    /// 요청 수량
    pub amount: Quantity,
    /// 지정가 (시장가 주문은 없음)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
}

impl OrderParams {
    /// 지정가 매수 파라미터를 생성합니다.
    pub fn limit_buy(symbol: Symbol, amount: Quantity, price: Price) -> Self {
        Self {
            symbol,
            side: Side::Buy,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
        }
    }

    /// 지정가 매도 파라미터를 생성합니다.
    pub fn limit_sell(symbol: Symbol, amount: Quantity, price: Price) -> Self {
        Self {
            symbol,
            side: Side::Sell,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
        }
    }

    /// 시장가 매수 파라미터를 생성합니다.
    pub fn market_buy(symbol: Symbol, amount: Quantity) -> Self {
        Self {
            symbol,
            side: Side::Buy,
            order_type: OrderType::Market,
            amount,
            price: None,
        }
    }

    /// 시장가 매도 파라미터를 생성합니다.
    pub fn market_sell(symbol: Symbol, amount: Quantity) -> Self {
        Self {
            symbol,
            side: Side::Sell,
            order_type: OrderType::Market,
            amount,
            price: None,
        }
    }

    /// 파라미터 유효성을 검사합니다. 문제가 있으면 사유를 반환합니다.
    pub fn validate(&self) -> Result<(), String> {
        if self.amount <= Decimal::ZERO {
            return Err(format!("amount must be positive: {}", self.amount));
        }
        match (self.order_type, self.price) {
            (OrderType::Limit | OrderType::LimitMaker, None) => {
                Err(format!("{} order requires a price", self.order_type))
            }
            (_, Some(price)) if price <= Decimal::ZERO => {
                Err(format!("price must be positive: {}", price))
            }
            _ => Ok(()),
        }
    }
}

/// 새 클라이언트 주문 ID를 생성합니다.
///
/// `prefix` + UUID(하이픈 제거) 형식이며 거래소 길이 제한에 맞춰 자릅니다.
pub fn new_client_order_id(prefix: &str) -> String {
    let mut id = format!("{}{}", prefix, Uuid::new_v4().simple());
    id.truncate(MAX_CLIENT_ORDER_ID_LEN);
    id
}

/// 추적 중인 주문.
///
/// 트래커만 이 값을 변경하며, 외부에는 [`OrderSnapshot`] 사본으로만 노출됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// 클라이언트 주문 ID (불변)
    pub client_order_id: String,
    /// 거래소 주문 ID (한 번 설정되면 변경되지 않음)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<String>,
    /// 거래 쌍
    pub symbol: Symbol,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    pub order_type: OrderType,
    /// 요청 가격
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    /// 요청 수량
    pub amount: Quantity,
    /// 누적 체결 수량
    pub filled_amount: Quantity,
    /// 누적 수수료
    pub cumulative_fee: Fee,
    /// 현재 상태
    pub state: OrderState,
    /// 분실 처리 여부 (`Failed`와 함께 설정됨)
    #[serde(default)]
    pub lost: bool,
    /// 실패 사유
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// 생성 시각
    pub created_at: DateTime<Utc>,
    /// 마지막 변경 시각
    pub updated_at: DateTime<Utc>,
    /// 마지막 반영된 갱신 출처
    pub last_update_source: UpdateSource,
    /// 마지막 반영된 갱신의 거래소 시각
    pub last_update_at: DateTime<Utc>,
}

impl Order {
    /// 파라미터로부터 `PendingCreate` 상태의 주문을 생성합니다.
    pub fn new(client_order_id: impl Into<String>, params: OrderParams) -> Self {
        let now = Utc::now();
        Self {
            client_order_id: client_order_id.into(),
            exchange_order_id: None,
            symbol: params.symbol,
            side: params.side,
            order_type: params.order_type,
            price: params.price,
            amount: params.amount,
            filled_amount: Decimal::ZERO,
            cumulative_fee: Decimal::ZERO,
            state: OrderState::PendingCreate,
            lost: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            last_update_source: UpdateSource::Local,
            last_update_at: now,
        }
    }

    /// 남은 수량을 반환합니다.
    pub fn remaining_amount(&self) -> Quantity {
        (self.amount - self.filled_amount).max(Decimal::ZERO)
    }

    /// 허용 오차 내에서 전량 체결되었는지 확인합니다.
    pub fn is_fully_filled(&self, tolerance: Decimal) -> bool {
        self.filled_amount + tolerance >= self.amount
    }

    /// 체결 비율 (0~1).
    pub fn fill_ratio(&self) -> Decimal {
        if self.amount.is_zero() {
            return Decimal::ZERO;
        }
        self.filled_amount / self.amount
    }
}

/// 외부에 제공되는 주문의 읽기 전용 사본.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// 주문 상태
    #[serde(flatten)]
    pub order: Order,
    /// 반영된 체결 목록 (체결 ID 순)
    pub trades: Vec<TradeFill>,
}

impl OrderSnapshot {
    /// 평균 체결 가격. 체결이 없으면 `None`.
    pub fn average_fill_price(&self) -> Option<Price> {
        if self.order.filled_amount.is_zero() {
            return None;
        }
        let notional: Decimal = self.trades.iter().map(|t| t.price * t.amount).sum();
        Some(notional / self.order.filled_amount)
    }
}

impl std::ops::Deref for OrderSnapshot {
    type Target = Order;

    fn deref(&self) -> &Self::Target {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    #[test]
    fn test_progress_rank_ordering() {
        assert!(OrderState::PendingCreate.progress_rank() < OrderState::Open.progress_rank());
        assert!(OrderState::Open.progress_rank() < OrderState::PartiallyFilled.progress_rank());
        assert!(
            OrderState::PartiallyFilled.progress_rank() < OrderState::PendingCancel.progress_rank()
        );
        assert_eq!(
            OrderState::Filled.progress_rank(),
            OrderState::Canceled.progress_rank()
        );
        assert_eq!(
            OrderState::Failed.progress_rank(),
            OrderState::Filled.progress_rank()
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Canceled.is_terminal());
        assert!(OrderState::Failed.is_terminal());
        assert!(OrderState::PendingCancel.is_active());
        assert!(!OrderState::PendingCreate.is_acknowledged());
        assert!(OrderState::Open.is_acknowledged());
    }

    #[test]
    fn test_params_validation() {
        assert!(OrderParams::limit_buy(btc(), dec!(1), dec!(100)).validate().is_ok());
        assert!(OrderParams::market_sell(btc(), dec!(0.5)).validate().is_ok());
        assert!(OrderParams::limit_buy(btc(), dec!(0), dec!(100)).validate().is_err());

        let mut params = OrderParams::limit_sell(btc(), dec!(1), dec!(100));
        params.price = None;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_client_order_id_length() {
        let id = new_client_order_id("sync-");
        assert!(id.starts_with("sync-"));
        assert_eq!(id.len(), MAX_CLIENT_ORDER_ID_LEN);
        assert_ne!(id, new_client_order_id("sync-"));

        let short = new_client_order_id("");
        assert_eq!(short.len(), 32);
    }

    #[test]
    fn test_new_order_defaults() {
        let order = Order::new("c1", OrderParams::limit_buy(btc(), dec!(2), dec!(100)));
        assert_eq!(order.state, OrderState::PendingCreate);
        assert_eq!(order.filled_amount, Decimal::ZERO);
        assert_eq!(order.remaining_amount(), dec!(2));
        assert_eq!(order.last_update_source, UpdateSource::Local);
        assert!(order.exchange_order_id.is_none());
        assert!(!order.is_fully_filled(dec!(0.0001)));
    }

    #[test]
    fn test_snapshot_average_price() {
        let mut order = Order::new("c1", OrderParams::limit_buy(btc(), dec!(2), dec!(100)));
        order.filled_amount = dec!(2);
        let snapshot = OrderSnapshot {
            order,
            trades: vec![
                TradeFill::new("t1", dec!(100), dec!(1)),
                TradeFill::new("t2", dec!(110), dec!(1)),
            ],
        };
        assert_eq!(snapshot.average_fill_price(), Some(dec!(105)));
        assert_eq!(snapshot.fill_ratio(), dec!(1));
    }
}
