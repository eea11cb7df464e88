//! 체결(trade) 기록.
//!
//! 체결은 거래소 체결 ID로 식별되며, 같은 ID는 주문 누적값에 한 번만 반영됩니다.

use crate::types::{Fee, Price, Quantity};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 주문에 속한 개별 체결.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFill {
    /// 거래소 체결 ID (중복 제거 키)
    pub trade_id: String,
    /// 체결 가격
    pub price: Price,
    /// 체결 수량
    pub amount: Quantity,
    /// 수수료
    pub fee: Fee,
    /// 수수료 자산
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_asset: Option<String>,
    /// 체결 시각
    pub timestamp: DateTime<Utc>,
}

impl TradeFill {
    /// 수수료 없는 체결을 생성합니다.
    pub fn new(trade_id: impl Into<String>, price: Price, amount: Quantity) -> Self {
        Self {
            trade_id: trade_id.into(),
            price,
            amount,
            fee: Decimal::ZERO,
            fee_asset: None,
            timestamp: Utc::now(),
        }
    }

    /// 수수료를 설정합니다.
    pub fn with_fee(mut self, fee: Fee, asset: impl Into<String>) -> Self {
        self.fee = fee;
        self.fee_asset = Some(asset.into());
        self
    }

    /// 체결 시각을 설정합니다.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 체결 금액 (가격 × 수량).
    pub fn notional(&self) -> Decimal {
        self.price * self.amount
    }

    /// 같은 체결 ID의 두 관측이 동일한 내용인지 확인합니다.
    ///
    /// 스트림과 REST 응답의 시각 표기는 다를 수 있으므로 시각은 비교하지 않습니다.
    pub fn same_contents(&self, other: &TradeFill) -> bool {
        self.trade_id == other.trade_id
            && self.price == other.price
            && self.amount == other.amount
            && self.fee == other.fee
            && self.fee_asset == other.fee_asset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_fill_builder() {
        let fill = TradeFill::new("T1", dec!(100), dec!(0.4)).with_fee(dec!(0.01), "USDT");
        assert_eq!(fill.notional(), dec!(40));
        assert_eq!(fill.fee_asset.as_deref(), Some("USDT"));
    }

    #[test]
    fn test_same_contents_ignores_timestamp() {
        let a = TradeFill::new("T1", dec!(100), dec!(1));
        let b = a.clone().with_timestamp(a.timestamp + chrono::Duration::seconds(5));
        assert!(a.same_contents(&b));

        let c = TradeFill::new("T1", dec!(100), dec!(2));
        assert!(!a.same_contents(&c));
    }
}
