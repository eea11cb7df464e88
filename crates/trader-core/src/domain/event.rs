//! 정규화된 거래소 이벤트와 주문 변경 알림.
//!
//! 거래소별 파서는 원시 메시지를 [`NormalizedEvent`]로 변환하고,
//! 스냅샷 조회 결과는 [`OrderStatusReport`]로 변환합니다.
//! 트래커는 변경이 반영될 때마다 [`OrderUpdate`]를 한 번 발행합니다.

use crate::domain::{OrderState, TradeFill, UpdateSource};
use crate::types::{Fee, Quantity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 이벤트가 가리키는 주문 식별자.
///
/// 스트림 이벤트는 클라이언트 ID, 거래소 ID 중 하나만 가질 수 있습니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    /// 클라이언트 주문 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    /// 거래소 주문 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<String>,
}

impl OrderRef {
    /// 클라이언트 ID로 참조를 생성합니다.
    pub fn client(client_order_id: impl Into<String>) -> Self {
        Self {
            client_order_id: Some(client_order_id.into()),
            exchange_order_id: None,
        }
    }

    /// 거래소 ID로 참조를 생성합니다.
    pub fn exchange(exchange_order_id: impl Into<String>) -> Self {
        Self {
            client_order_id: None,
            exchange_order_id: Some(exchange_order_id.into()),
        }
    }

    /// 거래소 ID를 추가합니다.
    pub fn with_exchange_id(mut self, exchange_order_id: impl Into<String>) -> Self {
        self.exchange_order_id = Some(exchange_order_id.into());
        self
    }
}

impl std::fmt::Display for OrderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.client_order_id, &self.exchange_order_id) {
            (Some(c), Some(e)) => write!(f, "{}({})", c, e),
            (Some(c), None) => write!(f, "{}", c),
            (None, Some(e)) => write!(f, "exchange:{}", e),
            (None, None) => write!(f, "<unknown>"),
        }
    }
}

/// 거래소 독립적인 스트림 이벤트.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedEvent {
    /// 주문 상태 변경
    StatusChange {
        order: OrderRef,
        state: OrderState,
        /// 거래소가 보고한 누적 체결량 (검증용)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cumulative_filled: Option<Quantity>,
        timestamp: DateTime<Utc>,
    },
    /// 체결 발생
    Fill {
        order: OrderRef,
        trade: TradeFill,
    },
    /// 주문 거부
    Rejection {
        order: OrderRef,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl NormalizedEvent {
    /// 이벤트가 가리키는 주문.
    pub fn order_ref(&self) -> &OrderRef {
        match self {
            NormalizedEvent::StatusChange { order, .. }
            | NormalizedEvent::Fill { order, .. }
            | NormalizedEvent::Rejection { order, .. } => order,
        }
    }

    /// 이벤트 발생 시각.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            NormalizedEvent::StatusChange { timestamp, .. }
            | NormalizedEvent::Rejection { timestamp, .. } => *timestamp,
            NormalizedEvent::Fill { trade, .. } => trade.timestamp,
        }
    }

    /// 로그용 이벤트 종류.
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::StatusChange { .. } => "status_change",
            NormalizedEvent::Fill { .. } => "fill",
            NormalizedEvent::Rejection { .. } => "rejection",
        }
    }
}

/// REST 조회로 얻은 주문의 권위 있는 상태.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    /// 클라이언트 주문 ID (응답에 포함된 경우)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    /// 거래소 주문 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<String>,
    /// 보고된 상태
    pub state: OrderState,
    /// 보고된 체결 목록
    #[serde(default)]
    pub trades: Vec<TradeFill>,
    /// 거래소가 보고한 누적 체결량 (검증용)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_filled: Option<Quantity>,
    /// 조회 시각
    pub timestamp: DateTime<Utc>,
}

impl OrderStatusReport {
    /// 체결 없는 보고서를 생성합니다.
    pub fn new(state: OrderState) -> Self {
        Self {
            client_order_id: None,
            exchange_order_id: None,
            state,
            trades: Vec::new(),
            reported_filled: None,
            timestamp: Utc::now(),
        }
    }

    /// 거래소 주문 ID를 설정합니다.
    pub fn with_exchange_id(mut self, exchange_order_id: impl Into<String>) -> Self {
        self.exchange_order_id = Some(exchange_order_id.into());
        self
    }

    /// 클라이언트 주문 ID를 설정합니다.
    pub fn with_client_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.client_order_id = Some(client_order_id.into());
        self
    }

    /// 체결을 추가합니다.
    pub fn with_trade(mut self, trade: TradeFill) -> Self {
        self.trades.push(trade);
        self
    }

    /// 거래소 누적 체결량을 설정합니다.
    pub fn with_reported_filled(mut self, filled: Quantity) -> Self {
        self.reported_filled = Some(filled);
        self
    }
}

/// 주문 변경 알림.
///
/// 반영된 호출 하나당 정확히 한 번 발행됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// 클라이언트 주문 ID
    pub client_order_id: String,
    /// 거래소 주문 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<String>,
    /// 이전 상태
    pub previous_state: OrderState,
    /// 새 상태
    pub state: OrderState,
    /// 이번 변경으로 늘어난 체결량
    pub filled_delta: Quantity,
    /// 이번 변경으로 늘어난 수수료
    pub fee_delta: Fee,
    /// 누적 체결량
    pub cumulative_filled: Quantity,
    /// 누적 수수료
    pub cumulative_fee: Fee,
    /// 변경을 일으킨 출처
    pub source: UpdateSource,
    /// 분실로 종료되었는지 여부
    #[serde(default)]
    pub lost: bool,
    /// 실패/거부 사유
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// 알림 생성 시각
    pub timestamp: DateTime<Utc>,
}

impl OrderUpdate {
    /// 체결량 변화가 있는 알림인지 확인합니다.
    pub fn is_fill(&self) -> bool {
        !self.filled_delta.is_zero()
    }

    /// 상태가 바뀐 알림인지 확인합니다.
    pub fn is_state_change(&self) -> bool {
        self.previous_state != self.state
    }
}
