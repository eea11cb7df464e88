//! 주문 상태 전이와 정합성 규칙.
//!
//! 스트림 이벤트, 스냅샷 조회, REST 응답은 모두 [`Observation`]으로 변환되어
//! 같은 규칙으로 반영됩니다. 이 모듈은 I/O나 잠금 없이 값만 다룹니다.
//!
//! 규칙:
//! - 상태는 진행 순위가 더 높을 때만 바뀝니다 (최종 상태는 더 이상 바뀌지 않음)
//! - 누적 체결량/수수료는 항상 체결 ID별 체결 맵의 합입니다
//! - 이미 반영된 체결 ID는 무시하고, 내용이 다르면 충돌로 기록합니다
//! - 요청 수량 + 허용 오차를 넘는 체결은 거부합니다

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use trader_core::{
    NormalizedEvent, Order, OrderSnapshot, OrderState, OrderStatusReport, OrderUpdate, TradeFill,
    UpdateSource,
};

/// 주문 하나에 대한 관측 결과.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// 거래소 주문 ID
    pub exchange_order_id: Option<String>,
    /// 보고된 상태 (체결만 있는 경우 `None`)
    pub state: Option<OrderState>,
    /// 보고된 체결 목록
    pub trades: Vec<TradeFill>,
    /// 거래소가 보고한 누적 체결량
    pub reported_filled: Option<Decimal>,
    /// 실패 사유
    pub reason: Option<String>,
    /// 거래소 기준 시각
    pub timestamp: DateTime<Utc>,
    /// 출처
    pub source: UpdateSource,
}

impl Observation {
    fn empty(source: UpdateSource, timestamp: DateTime<Utc>) -> Self {
        Self {
            exchange_order_id: None,
            state: None,
            trades: Vec::new(),
            reported_filled: None,
            reason: None,
            timestamp,
            source,
        }
    }

    /// 상태만 담은 관측.
    pub fn state(state: OrderState, source: UpdateSource, timestamp: DateTime<Utc>) -> Self {
        Self {
            state: Some(state),
            ..Self::empty(source, timestamp)
        }
    }

    /// 거래소 주문 ID를 설정합니다.
    pub fn with_exchange_id(mut self, exchange_order_id: impl Into<String>) -> Self {
        self.exchange_order_id = Some(exchange_order_id.into());
        self
    }

    /// 실패 사유를 설정합니다.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// 스트림 이벤트를 변환합니다.
    pub fn from_event(event: &NormalizedEvent) -> Self {
        let exchange_order_id = event.order_ref().exchange_order_id.clone();
        match event {
            NormalizedEvent::StatusChange {
                state,
                cumulative_filled,
                timestamp,
                ..
            } => Self {
                exchange_order_id,
                state: Some(*state),
                reported_filled: *cumulative_filled,
                ..Self::empty(UpdateSource::Stream, *timestamp)
            },
            NormalizedEvent::Fill { trade, .. } => Self {
                exchange_order_id,
                trades: vec![trade.clone()],
                ..Self::empty(UpdateSource::Stream, trade.timestamp)
            },
            NormalizedEvent::Rejection {
                reason, timestamp, ..
            } => Self {
                exchange_order_id,
                state: Some(OrderState::Failed),
                reason: Some(reason.clone()),
                ..Self::empty(UpdateSource::Stream, *timestamp)
            },
        }
    }

    /// 스냅샷 조회 결과를 변환합니다.
    pub fn from_report(report: &OrderStatusReport) -> Self {
        Self {
            exchange_order_id: report.exchange_order_id.clone(),
            state: Some(report.state),
            trades: report.trades.clone(),
            reported_filled: report.reported_filled,
            reason: None,
            timestamp: report.timestamp,
            source: UpdateSource::Snapshot,
        }
    }
}

/// 관측 반영 결과.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    /// 변경이 있으면 발행할 알림
    pub update: Option<OrderUpdate>,
    /// 기록할 정합성 충돌 설명
    pub conflicts: Vec<String>,
}

impl Transition {
    /// 변경이 없었는지 확인합니다.
    pub fn is_noop(&self) -> bool {
        self.update.is_none()
    }
}

/// 트래커가 보관하는 주문 레코드.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    /// 주문 상태
    pub order: Order,
    /// 체결 ID별 체결
    pub trades: BTreeMap<String, TradeFill>,
    /// 연속 "주문 없음" 응답 횟수
    pub not_found_count: u32,
    /// 접수 확인 없이 지난 폴링 주기 수
    pub unconfirmed_cycles: u32,
}

impl OrderRecord {
    /// 새 레코드를 생성합니다.
    pub fn new(order: Order) -> Self {
        Self {
            order,
            trades: BTreeMap::new(),
            not_found_count: 0,
            unconfirmed_cycles: 0,
        }
    }

    /// 외부 제공용 사본.
    pub fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            order: self.order.clone(),
            trades: self.trades.values().cloned().collect(),
        }
    }

    // ==================== 전이 ====================

    /// 관측 결과를 반영합니다.
    pub fn apply(
        &mut self,
        observation: &Observation,
        tolerance: Decimal,
        now: DateTime<Utc>,
    ) -> Transition {
        let mut conflicts = Vec::new();

        // 거래소 주문 ID는 한 번 정해지면 바뀌지 않음
        let mut assigned_exchange_id = false;
        if let Some(reported) = &observation.exchange_order_id {
            match &self.order.exchange_order_id {
                Some(current) if current != reported => {
                    conflicts.push(format!(
                        "exchange order id mismatch: tracked {}, reported {}",
                        current, reported
                    ));
                    return Transition {
                        update: None,
                        conflicts,
                    };
                }
                Some(_) => {}
                None => {
                    self.order.exchange_order_id = Some(reported.clone());
                    assigned_exchange_id = true;
                }
            }
        }

        let previous_state = self.order.state;
        let previous_filled = self.order.filled_amount;
        let previous_fee = self.order.cumulative_fee;

        self.merge_trades(&observation.trades, tolerance, &mut conflicts);
        self.recompute_totals();

        if let Some(reported) = observation.reported_filled {
            if (reported - self.order.filled_amount).abs() > tolerance {
                conflicts.push(format!(
                    "reported cumulative fill {} differs from trade sum {}",
                    reported, self.order.filled_amount
                ));
            }
        }

        let next_state = self.next_state(observation.state, tolerance);
        if next_state != previous_state {
            self.order.state = next_state;
            if next_state == OrderState::Failed {
                self.order.failure_reason = observation.reason.clone();
            }
        }

        let changed = assigned_exchange_id
            || next_state != previous_state
            || self.order.filled_amount != previous_filled
            || self.order.cumulative_fee != previous_fee;
        if !changed {
            return Transition {
                update: None,
                conflicts,
            };
        }

        self.touch(observation.source, observation.timestamp, now);
        Transition {
            update: Some(self.update_from(
                previous_state,
                previous_filled,
                previous_fee,
                observation.source,
                observation.reason.clone(),
            )),
            conflicts,
        }
    }

    /// 생성 요청 거부를 반영합니다. `PendingCreate`에서만 적용됩니다.
    pub fn fail_creation(&mut self, reason: &str, now: DateTime<Utc>) -> Option<OrderUpdate> {
        if self.order.state != OrderState::PendingCreate {
            return None;
        }
        self.force_state(OrderState::Failed, Some(reason.to_string()), UpdateSource::Rest, now)
    }

    /// 취소 요청 시작을 반영합니다.
    ///
    /// 접수된 미체결 주문만 `PendingCancel`로 바뀝니다.
    /// 이미 `PendingCancel`이면 변경 없이 `Ok(None)`을 반환합니다.
    pub fn begin_cancel(&mut self, now: DateTime<Utc>) -> Result<Option<OrderUpdate>, OrderState> {
        match self.order.state {
            OrderState::Open | OrderState::PartiallyFilled => {
                Ok(self.force_state(OrderState::PendingCancel, None, UpdateSource::Local, now))
            }
            OrderState::PendingCancel => Ok(None),
            other => Err(other),
        }
    }

    /// 취소 거부를 반영합니다. `PendingCancel`을 체결 상황에 맞는 상태로 되돌립니다.
    pub fn revert_cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Option<OrderUpdate> {
        if self.order.state != OrderState::PendingCancel {
            return None;
        }
        let restored = if self.order.filled_amount.is_zero() {
            OrderState::Open
        } else {
            OrderState::PartiallyFilled
        };
        self.force_state(restored, Some(reason.to_string()), UpdateSource::Rest, now)
    }

    /// "주문 없음" 응답을 반영합니다.
    ///
    /// 누적 횟수가 `limit`에 도달하면 주문을 분실로 보고 `Failed`로 전환합니다.
    pub fn record_not_found(&mut self, limit: u32, now: DateTime<Utc>) -> Option<OrderUpdate> {
        if self.order.state.is_terminal() {
            return None;
        }
        self.not_found_count += 1;
        if self.not_found_count < limit {
            return None;
        }
        self.order.lost = true;
        self.force_state(
            OrderState::Failed,
            Some(format!(
                "order not found on exchange after {} attempts",
                self.not_found_count
            )),
            UpdateSource::Snapshot,
            now,
        )
    }

    // ==================== 내부 ====================

    fn merge_trades(&mut self, trades: &[TradeFill], tolerance: Decimal, conflicts: &mut Vec<String>) {
        for trade in trades {
            if let Some(existing) = self.trades.get(&trade.trade_id) {
                if !existing.same_contents(trade) {
                    conflicts.push(format!(
                        "trade {} observed with different contents (kept amount {}, got {})",
                        trade.trade_id, existing.amount, trade.amount
                    ));
                }
                continue;
            }

            if trade.amount <= Decimal::ZERO || trade.fee < Decimal::ZERO {
                conflicts.push(format!(
                    "trade {} refused: amount {} fee {}",
                    trade.trade_id, trade.amount, trade.fee
                ));
                continue;
            }

            let filled: Decimal = self.trades.values().map(|t| t.amount).sum();
            if filled + trade.amount > self.order.amount + tolerance {
                conflicts.push(format!(
                    "trade {} would overfill: filled {} + {} > amount {}",
                    trade.trade_id, filled, trade.amount, self.order.amount
                ));
                continue;
            }

            self.trades.insert(trade.trade_id.clone(), trade.clone());
        }
    }

    fn recompute_totals(&mut self) {
        self.order.filled_amount = self.trades.values().map(|t| t.amount).sum();
        self.order.cumulative_fee = self.trades.values().map(|t| t.fee).sum();
    }

    fn next_state(&self, reported: Option<OrderState>, tolerance: Decimal) -> OrderState {
        let current = self.order.state;
        if current.is_terminal() {
            return current;
        }

        let mut next = match reported {
            Some(state) if state.progress_rank() > current.progress_rank() => state,
            _ => current,
        };

        if next.is_active() && self.order.filled_amount > Decimal::ZERO {
            if self.order.is_fully_filled(tolerance) {
                next = OrderState::Filled;
            } else if matches!(next, OrderState::PendingCreate | OrderState::Open) {
                next = OrderState::PartiallyFilled;
            }
        }
        next
    }

    fn force_state(
        &mut self,
        state: OrderState,
        reason: Option<String>,
        source: UpdateSource,
        now: DateTime<Utc>,
    ) -> Option<OrderUpdate> {
        let previous_state = self.order.state;
        if previous_state == state {
            return None;
        }
        self.order.state = state;
        if state == OrderState::Failed {
            self.order.failure_reason = reason.clone();
        }
        self.touch(source, now, now);
        Some(self.update_from(
            previous_state,
            self.order.filled_amount,
            self.order.cumulative_fee,
            source,
            reason,
        ))
    }

    fn touch(&mut self, source: UpdateSource, observed_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.order.updated_at = now;
        self.order.last_update_source = source;
        self.order.last_update_at = observed_at;
    }

    fn update_from(
        &self,
        previous_state: OrderState,
        previous_filled: Decimal,
        previous_fee: Decimal,
        source: UpdateSource,
        reason: Option<String>,
    ) -> OrderUpdate {
        OrderUpdate {
            client_order_id: self.order.client_order_id.clone(),
            exchange_order_id: self.order.exchange_order_id.clone(),
            previous_state,
            state: self.order.state,
            filled_delta: self.order.filled_amount - previous_filled,
            fee_delta: self.order.cumulative_fee - previous_fee,
            cumulative_filled: self.order.filled_amount,
            cumulative_fee: self.order.cumulative_fee,
            source,
            lost: self.order.lost,
            reason,
            timestamp: self.order.updated_at,
        }
    }
}
