//! 정밀한 금융 계산을 위한 Decimal 유틸리티.

use rust_decimal::Decimal;

/// 금융 정밀도를 위한 가격 타입.
pub type Price = Decimal;

/// 주문/체결 수량 타입.
pub type Quantity = Decimal;

/// 수수료 금액 타입.
pub type Fee = Decimal;

/// Decimal 연산을 위한 확장 트레이트.
pub trait DecimalExt {
    /// 양수인지 확인합니다.
    fn is_positive(&self) -> bool;

    /// `other`와의 차이가 `tolerance` 이하인지 확인합니다.
    fn approx_eq(&self, other: Decimal, tolerance: Decimal) -> bool;

    /// `limit + tolerance`를 넘지 않는지 확인합니다.
    fn within_limit(&self, limit: Decimal, tolerance: Decimal) -> bool;
}

impl DecimalExt for Decimal {
    fn is_positive(&self) -> bool {
        *self > Decimal::ZERO
    }

    fn approx_eq(&self, other: Decimal, tolerance: Decimal) -> bool {
        (*self - other).abs() <= tolerance
    }

    fn within_limit(&self, limit: Decimal, tolerance: Decimal) -> bool {
        *self <= limit + tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_approx_eq() {
        assert!(dec!(1.0000001).approx_eq(dec!(1), dec!(0.000001)));
        assert!(!dec!(1.01).approx_eq(dec!(1), dec!(0.000001)));
    }

    #[test]
    fn test_within_limit() {
        assert!(dec!(10.0000005).within_limit(dec!(10), dec!(0.000001)));
        assert!(!dec!(10.1).within_limit(dec!(10), dec!(0.000001)));
        assert!(DecimalExt::is_positive(&dec!(3)));
        assert!(!DecimalExt::is_positive(&Decimal::ZERO));
    }
}
