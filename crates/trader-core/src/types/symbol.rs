//! 거래 쌍(trading pair) 정의.
//!
//! 거래소마다 표기법이 다르므로 (`BTC-USDT`, `BTCUSDT`, `BTC/USDT`) 내부에서는
//! 기준/호가 자산을 분리해서 보관하고, 거래소 표기는 선택적으로 함께 저장합니다.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 거래 쌍.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    /// 기준 자산 (예: BTC)
    pub base: String,
    /// 호가 자산 (예: USDT)
    pub quote: String,
    /// 거래소별 심볼 형식 (선택)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_symbol: Option<String>,
}

impl Symbol {
    /// 새 거래 쌍을 생성합니다.
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
            exchange_symbol: None,
        }
    }

    /// 거래소별 심볼 형식을 설정합니다.
    pub fn with_exchange_symbol(mut self, exchange_symbol: impl Into<String>) -> Self {
        self.exchange_symbol = Some(exchange_symbol.into());
        self
    }

    /// "BASE/QUOTE" 또는 "BASE-QUOTE" 형식을 파싱합니다.
    pub fn parse(s: &str) -> Option<Self> {
        let (base, quote) = s.split_once('/').or_else(|| s.split_once('-'))?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }

    /// 거래소 요청에 사용할 심볼을 반환합니다.
    ///
    /// 거래소 형식이 지정되지 않았으면 `BASEQUOTE`를 사용합니다.
    pub fn exchange_code(&self) -> String {
        self.exchange_symbol
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.base, self.quote))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}
