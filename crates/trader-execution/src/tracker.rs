//! 주문 트래커.
//!
//! 제공 기능:
//! - 추적 중인 주문의 정본(canonical) 보관
//! - 스트림 이벤트와 스냅샷 조회 결과 반영
//! - REST 생성/취소 결과 반영
//! - 분실 주문 판정
//! - 변경 알림 발행 및 구독 관리
//!
//! 주문마다 비동기 뮤텍스를 두어 같은 주문의 갱신은 순서대로 처리되고,
//! 다른 주문의 갱신은 동시에 진행됩니다. 알림은 주문 잠금을 쥔 채로 발행되므로
//! 한 주문의 알림 순서는 반영 순서와 같습니다.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use trader_core::{
    Clock, EventSink, NormalizedEvent, ObservabilityEvent, Order, OrderParams, OrderRef,
    OrderSnapshot, OrderState, OrderStatusReport, OrderUpdate, SystemClock, TracingSink,
    TrackerConfig, UpdateSource,
};

use crate::state_machine::{Observation, OrderRecord, Transition};

/// 트래커 에러 타입.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("Order already tracked: {0}")]
    AlreadyTracked(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Invalid order parameters for {client_order_id}: {reason}")]
    InvalidParams {
        client_order_id: String,
        reason: String,
    },

    #[error("Order {client_order_id} cannot be canceled in state {state}")]
    NotCancelable {
        client_order_id: String,
        state: OrderState,
    },
}

/// 주문 변경 알림 수신자.
pub trait OrderUpdateListener: Send + Sync {
    /// 반영된 변경 하나당 한 번 호출됩니다.
    fn on_update(&self, update: &OrderUpdate);
}

impl OrderUpdateListener for mpsc::UnboundedSender<OrderUpdate> {
    fn on_update(&self, update: &OrderUpdate) {
        // 수신 측이 닫혔으면 무시
        let _ = self.send(update.clone());
    }
}

/// 구독 식별자.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 추적 시작된 주문의 핸들.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    /// 클라이언트 주문 ID
    pub client_order_id: String,
}

impl OrderHandle {
    /// 클라이언트 주문 ID.
    pub fn id(&self) -> &str {
        &self.client_order_id
    }
}

/// 취소 요청 결과.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelResult {
    /// 거래소가 취소를 수락함
    Accepted,
    /// 거래소가 취소를 거부함 (사유)
    Rejected(String),
    /// 거래소에 주문이 없음
    NotFound,
}

type RecordMap = HashMap<String, Arc<Mutex<OrderRecord>>>;

/// 주문 트래커.
pub struct OrderTracker {
    orders: RwLock<RecordMap>,
    exchange_ids: RwLock<HashMap<String, String>>,
    listeners: std::sync::RwLock<Vec<(ListenerId, Arc<dyn OrderUpdateListener>)>>,
    next_listener_id: AtomicU64,
    config: TrackerConfig,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl OrderTracker {
    /// 새 트래커를 생성합니다.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            exchange_ids: RwLock::new(HashMap::new()),
            listeners: std::sync::RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            config,
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// 관측 이벤트 싱크를 설정합니다.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// 시계를 설정합니다.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 트래커 설정.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ==================== 구독 ====================

    /// 변경 알림을 구독합니다.
    pub fn subscribe(&self, listener: Arc<dyn OrderUpdateListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// 채널로 변경 알림을 구독합니다.
    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<OrderUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(Arc::new(tx)), rx)
    }

    /// 구독을 해지합니다. 해지된 구독이 있었으면 `true`.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    // ==================== 등록 ====================

    /// `PendingCreate` 상태로 주문 추적을 시작합니다.
    ///
    /// 생성 요청을 보내기 전에 호출해야 합니다.
    pub async fn start_tracking(
        &self,
        client_order_id: impl Into<String>,
        params: OrderParams,
    ) -> Result<OrderHandle, TrackerError> {
        let client_order_id = client_order_id.into();
        params
            .validate()
            .map_err(|reason| TrackerError::InvalidParams {
                client_order_id: client_order_id.clone(),
                reason,
            })?;

        let mut orders = self.orders.write().await;
        if orders.contains_key(&client_order_id) {
            return Err(TrackerError::AlreadyTracked(client_order_id));
        }

        let mut order = Order::new(client_order_id.clone(), params);
        let now = self.clock.wall();
        order.created_at = now;
        order.updated_at = now;
        order.last_update_at = now;

        info!(
            client_order_id = %client_order_id,
            symbol = %order.symbol,
            side = %order.side,
            amount = %order.amount,
            "Order tracking started"
        );

        orders.insert(
            client_order_id.clone(),
            Arc::new(Mutex::new(OrderRecord::new(order))),
        );
        Ok(OrderHandle { client_order_id })
    }

    // ==================== 반영 ====================

    /// 스트림 이벤트를 반영합니다.
    ///
    /// 추적하지 않는 주문의 이벤트는 무시합니다. 같은 이벤트를 다시 받으면 변경이 없습니다.
    pub async fn process_stream_event(&self, event: &NormalizedEvent) -> Option<OrderUpdate> {
        let Some(record) = self.resolve(event.order_ref()).await else {
            self.sink.record(ObservabilityEvent::UnknownOrder {
                order: event.order_ref().to_string(),
                event_kind: event.kind(),
            });
            return None;
        };

        let observation = Observation::from_event(event);
        let mut record = record.lock().await;
        self.apply_locked(&mut record, &observation).await
    }

    /// 스냅샷 조회 결과를 반영합니다.
    ///
    /// 진행 순위가 낮은 (오래된) 보고는 변경 없이 무시됩니다.
    pub async fn process_snapshot(
        &self,
        client_order_id: &str,
        report: &OrderStatusReport,
    ) -> Result<Option<OrderUpdate>, TrackerError> {
        let record = self.record(client_order_id).await?;
        let mut record = record.lock().await;
        // 거래소에서 조회되었으므로 분실 카운트 초기화
        record.not_found_count = 0;
        Ok(self.apply_locked(&mut record, &Observation::from_report(report)).await)
    }

    /// 주문 참조로 대상을 찾아 스냅샷 결과를 반영합니다. 대상이 없으면 `None`.
    pub async fn process_report(&self, report: &OrderStatusReport) -> Option<OrderUpdate> {
        let order_ref = OrderRef {
            client_order_id: report.client_order_id.clone(),
            exchange_order_id: report.exchange_order_id.clone(),
        };
        let record = self.resolve(&order_ref).await?;
        let mut record = record.lock().await;
        record.not_found_count = 0;
        self.apply_locked(&mut record, &Observation::from_report(report)).await
    }

    /// 생성 요청 성공 응답을 반영합니다 (`Open`, 거래소 주문 ID 설정).
    pub async fn mark_created(
        &self,
        client_order_id: &str,
        exchange_order_id: &str,
    ) -> Result<Option<OrderUpdate>, TrackerError> {
        let record = self.record(client_order_id).await?;
        let mut record = record.lock().await;
        let observation = Observation::state(OrderState::Open, UpdateSource::Rest, self.clock.wall())
            .with_exchange_id(exchange_order_id);
        Ok(self.apply_locked(&mut record, &observation).await)
    }

    /// 생성 요청 거부를 반영합니다.
    pub async fn mark_create_failed(
        &self,
        client_order_id: &str,
        reason: &str,
    ) -> Result<Option<OrderUpdate>, TrackerError> {
        let record = self.record(client_order_id).await?;
        let mut record = record.lock().await;
        let update = record.fail_creation(reason, self.clock.wall());
        if update.is_some() {
            warn!(client_order_id, reason, "Order creation failed");
        }
        Ok(self.emit(update))
    }

    /// 취소 요청 시작을 반영합니다 (`PendingCancel`).
    pub async fn mark_cancel_requested(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderUpdate>, TrackerError> {
        let record = self.record(client_order_id).await?;
        let mut record = record.lock().await;
        let update = record
            .begin_cancel(self.clock.wall())
            .map_err(|state| TrackerError::NotCancelable {
                client_order_id: client_order_id.to_string(),
                state,
            })?;
        Ok(self.emit(update))
    }

    /// 취소 요청 결과를 반영합니다.
    pub async fn mark_cancel_result(
        &self,
        client_order_id: &str,
        result: CancelResult,
    ) -> Result<Option<OrderUpdate>, TrackerError> {
        match result {
            CancelResult::Accepted => {
                let record = self.record(client_order_id).await?;
                let mut record = record.lock().await;
                let observation =
                    Observation::state(OrderState::Canceled, UpdateSource::Rest, self.clock.wall());
                Ok(self.apply_locked(&mut record, &observation).await)
            }
            CancelResult::Rejected(reason) => {
                let record = self.record(client_order_id).await?;
                let mut record = record.lock().await;
                warn!(client_order_id, reason = %reason, "Cancel request rejected");
                let update = record.revert_cancel(&reason, self.clock.wall());
                Ok(self.emit(update))
            }
            CancelResult::NotFound => self.process_order_not_found(client_order_id).await,
        }
    }

    /// 거래소가 주문을 찾지 못했다는 응답을 반영합니다.
    ///
    /// 설정된 횟수에 도달하면 주문을 분실로 보고 `Failed`로 전환합니다.
    pub async fn process_order_not_found(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderUpdate>, TrackerError> {
        let record = self.record(client_order_id).await?;
        let mut record = record.lock().await;
        let update = record.record_not_found(self.config.lost_order_limit, self.clock.wall());

        match &update {
            Some(_) => self.sink.record(ObservabilityEvent::LostOrder {
                client_order_id: client_order_id.to_string(),
                not_found_count: record.not_found_count,
            }),
            None => debug!(
                client_order_id,
                not_found_count = record.not_found_count,
                "Order not found on exchange"
            ),
        }
        Ok(self.emit(update))
    }

    // ==================== 조회 ====================

    /// 클라이언트 주문 ID로 주문 사본을 조회합니다.
    pub async fn get_order(&self, client_order_id: &str) -> Option<OrderSnapshot> {
        let record = self.orders.read().await.get(client_order_id).cloned()?;
        let record = record.lock().await;
        Some(record.snapshot())
    }

    /// 거래소 주문 ID로 주문 사본을 조회합니다.
    pub async fn get_order_by_exchange_id(&self, exchange_order_id: &str) -> Option<OrderSnapshot> {
        let client_order_id = self.exchange_ids.read().await.get(exchange_order_id).cloned()?;
        self.get_order(&client_order_id).await
    }

    /// 최종 상태가 아닌 주문 사본 목록.
    pub async fn active_orders(&self) -> Vec<OrderSnapshot> {
        let mut result = Vec::new();
        for record in self.all_records().await {
            let record = record.lock().await;
            if record.order.state.is_active() {
                result.push(record.snapshot());
            }
        }
        result
    }

    /// 추적 중인 주문 수.
    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    /// 추적 중인 주문이 없는지 확인.
    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }

    /// 이번 폴링 주기에 개별 조회할 주문 목록.
    ///
    /// `PendingCreate` 주문은 주기마다 카운트가 증가하며,
    /// 설정된 유예 주기를 넘긴 뒤에만 대상에 포함됩니다.
    pub async fn poll_targets(&self) -> Vec<Order> {
        let mut targets = Vec::new();
        for record in self.all_records().await {
            let mut record = record.lock().await;
            match record.order.state {
                OrderState::PendingCreate => {
                    record.unconfirmed_cycles += 1;
                    if record.unconfirmed_cycles > self.config.unconfirmed_cycles {
                        targets.push(record.order.clone());
                    }
                }
                state if state.is_active() => targets.push(record.order.clone()),
                _ => {}
            }
        }
        targets
    }

    /// 최종 상태로 `older_than` 이상 지난 주문을 정리합니다. 정리한 수를 반환합니다.
    pub async fn cleanup_finished(&self, older_than: Duration) -> usize {
        let cutoff = self.clock.wall()
            - chrono::Duration::milliseconds(older_than.as_millis().min(i64::MAX as u128) as i64);

        let mut orders = self.orders.write().await;
        let mut removed = Vec::new();
        for (client_order_id, record) in orders.iter() {
            // 쓰기 잠금 중이므로 다른 작업이 이 레코드를 기다리고 있을 수 있음
            let Ok(record) = record.try_lock() else {
                continue;
            };
            if record.order.state.is_terminal() && record.order.updated_at <= cutoff {
                removed.push((
                    client_order_id.clone(),
                    record.order.exchange_order_id.clone(),
                ));
            }
        }

        let mut exchange_ids = self.exchange_ids.write().await;
        for (client_order_id, exchange_order_id) in &removed {
            orders.remove(client_order_id);
            if let Some(exchange_order_id) = exchange_order_id {
                exchange_ids.remove(exchange_order_id);
            }
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "Finished orders cleaned up");
        }
        removed.len()
    }

    // ==================== 내부 ====================

    async fn record(&self, client_order_id: &str) -> Result<Arc<Mutex<OrderRecord>>, TrackerError> {
        self.orders
            .read()
            .await
            .get(client_order_id)
            .cloned()
            .ok_or_else(|| TrackerError::OrderNotFound(client_order_id.to_string()))
    }

    async fn resolve(&self, order_ref: &OrderRef) -> Option<Arc<Mutex<OrderRecord>>> {
        if let Some(client_order_id) = &order_ref.client_order_id {
            if let Some(record) = self.orders.read().await.get(client_order_id).cloned() {
                return Some(record);
            }
        }
        let exchange_order_id = order_ref.exchange_order_id.as_ref()?;
        let client_order_id = self.exchange_ids.read().await.get(exchange_order_id).cloned()?;
        self.orders.read().await.get(&client_order_id).cloned()
    }

    async fn all_records(&self) -> Vec<Arc<Mutex<OrderRecord>>> {
        self.orders.read().await.values().cloned().collect()
    }

    async fn apply_locked(
        &self,
        record: &mut OrderRecord,
        observation: &Observation,
    ) -> Option<OrderUpdate> {
        let had_exchange_id = record.order.exchange_order_id.is_some();
        let Transition { update, conflicts } =
            record.apply(observation, self.config.fill_tolerance, self.clock.wall());

        for detail in conflicts {
            self.sink.record(ObservabilityEvent::ReconciliationConflict {
                client_order_id: record.order.client_order_id.clone(),
                detail,
            });
        }

        if !had_exchange_id {
            if let Some(exchange_order_id) = &record.order.exchange_order_id {
                self.exchange_ids
                    .write()
                    .await
                    .insert(exchange_order_id.clone(), record.order.client_order_id.clone());
            }
        }

        self.emit(update)
    }

    fn emit(&self, update: Option<OrderUpdate>) -> Option<OrderUpdate> {
        let update = update?;
        debug!(
            client_order_id = %update.client_order_id,
            previous_state = %update.previous_state,
            state = %update.state,
            filled_delta = %update.filled_delta,
            source = %update.source,
            "Order updated"
        );

        let listeners: Vec<Arc<dyn OrderUpdateListener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_update(&update);
        }
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use trader_core::{MemorySink, Symbol, TradeFill};

    fn params() -> OrderParams {
        OrderParams::limit_buy(Symbol::new("BTC", "USDT"), dec!(1), dec!(100))
    }

    fn tracker_with_sink() -> (OrderTracker, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let tracker = OrderTracker::new(TrackerConfig::default()).with_sink(sink.clone());
        (tracker, sink)
    }

    fn fill_event(client_order_id: &str, trade_id: &str, amount: rust_decimal::Decimal) -> NormalizedEvent {
        NormalizedEvent::Fill {
            order: OrderRef::client(client_order_id),
            trade: TradeFill::new(trade_id, dec!(100), amount),
        }
    }

    #[tokio::test]
    async fn test_start_tracking_rejects_duplicates() {
        let (tracker, _) = tracker_with_sink();
        let handle = tracker.start_tracking("c1", params()).await.unwrap();
        assert_eq!(handle.id(), "c1");

        let err = tracker.start_tracking("c1", params()).await.unwrap_err();
        assert_eq!(err, TrackerError::AlreadyTracked("c1".to_string()));

        let order = tracker.get_order("c1").await.unwrap();
        assert_eq!(order.state, OrderState::PendingCreate);
    }

    #[tokio::test]
    async fn test_start_tracking_validates_params() {
        let (tracker, _) = tracker_with_sink();
        let mut bad = params();
        bad.amount = dec!(0);
        let err = tracker.start_tracking("c1", bad).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidParams { .. }));
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_replayed_event_notifies_once() {
        let (tracker, _) = tracker_with_sink();
        let (_, mut rx) = tracker.subscribe_channel();
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();

        let event = fill_event("c1", "T1", dec!(0.4));
        assert!(tracker.process_stream_event(&event).await.is_some());
        assert!(tracker.process_stream_event(&event).await.is_none());

        let created = rx.recv().await.unwrap();
        assert_eq!(created.state, OrderState::Open);
        let filled = rx.recv().await.unwrap();
        assert_eq!(filled.filled_delta, dec!(0.4));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_on_one_order_are_serialized() {
        let tracker = Arc::new(OrderTracker::new(TrackerConfig::default()));
        let (_, mut rx) = tracker.subscribe_channel();
        let amount = dec!(10);
        let order = OrderParams::limit_buy(Symbol::new("BTC", "USDT"), amount, dec!(100));
        tracker.start_tracking("c1", order).await.unwrap();

        // 같은 체결을 스트림 두 번과 스냅샷 한 번으로 동시에 전달
        let mut tasks = Vec::new();
        for i in 0..10 {
            let trade_id = format!("T{i}");
            for _ in 0..2 {
                let tracker = tracker.clone();
                let event = fill_event("c1", &trade_id, dec!(1));
                tasks.push(tokio::spawn(async move {
                    tracker.process_stream_event(&event).await;
                }));
            }
            let tracker = tracker.clone();
            let report = OrderStatusReport::new(OrderState::PartiallyFilled)
                .with_trade(TradeFill::new(trade_id, dec!(100), dec!(1)));
            tasks.push(tokio::spawn(async move {
                tracker.process_snapshot("c1", &report).await.unwrap();
            }));
        }
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert_eq!(updates.len(), 10);
        assert!(updates.iter().all(|u| u.filled_delta == dec!(1)));
        // 알림 순서가 반영 순서와 같음
        for (i, update) in updates.iter().enumerate() {
            assert_eq!(update.cumulative_filled, rust_decimal::Decimal::from(i as u32 + 1));
        }
        assert_eq!(updates.last().unwrap().state, OrderState::Filled);

        let order = tracker.get_order("c1").await.unwrap();
        assert_eq!(order.filled_amount, amount);
        assert_eq!(order.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_resolve_by_exchange_id() {
        let (tracker, _) = tracker_with_sink();
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();

        let event = NormalizedEvent::StatusChange {
            order: OrderRef::exchange("E1"),
            state: OrderState::Canceled,
            cumulative_filled: None,
            timestamp: Utc::now(),
        };
        let update = tracker.process_stream_event(&event).await.unwrap();
        assert_eq!(update.client_order_id, "c1");

        let order = tracker.get_order_by_exchange_id("E1").await.unwrap();
        assert_eq!(order.state, OrderState::Canceled);
    }

    #[tokio::test]
    async fn test_unknown_order_event_is_recorded() {
        let (tracker, sink) = tracker_with_sink();
        let event = fill_event("missing", "T1", dec!(1));
        assert!(tracker.process_stream_event(&event).await.is_none());
        assert_eq!(sink.count("unknown_order"), 1);
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_notify() {
        let (tracker, _) = tracker_with_sink();
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();
        tracker
            .process_stream_event(&fill_event("c1", "T1", dec!(0.4)))
            .await
            .unwrap();

        let (_, mut rx) = tracker.subscribe_channel();
        let stale = OrderStatusReport::new(OrderState::Open).with_exchange_id("E1");
        assert!(tracker.process_snapshot("c1", &stale).await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(
            tracker.get_order("c1").await.unwrap().state,
            OrderState::PartiallyFilled
        );
    }

    #[tokio::test]
    async fn test_cancel_flow() {
        let (tracker, _) = tracker_with_sink();
        tracker.start_tracking("c1", params()).await.unwrap();

        let err = tracker.mark_cancel_requested("c1").await.unwrap_err();
        assert!(matches!(err, TrackerError::NotCancelable { .. }));

        tracker.mark_created("c1", "E1").await.unwrap();
        let update = tracker.mark_cancel_requested("c1").await.unwrap().unwrap();
        assert_eq!(update.state, OrderState::PendingCancel);

        let update = tracker
            .mark_cancel_result("c1", CancelResult::Accepted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.previous_state, OrderState::PendingCancel);
        assert_eq!(update.state, OrderState::Canceled);
        assert!(tracker.active_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_rejected_restores_state() {
        let (tracker, _) = tracker_with_sink();
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();
        tracker
            .process_stream_event(&fill_event("c1", "T1", dec!(0.2)))
            .await;
        tracker.mark_cancel_requested("c1").await.unwrap();

        let update = tracker
            .mark_cancel_result("c1", CancelResult::Rejected("too late".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.state, OrderState::PartiallyFilled);
    }

    #[tokio::test]
    async fn test_lost_order_after_limit() {
        let (tracker, sink) = tracker_with_sink();
        let (_, mut rx) = tracker.subscribe_channel();
        tracker.start_tracking("c1", params()).await.unwrap();

        for _ in 0..2 {
            assert!(tracker.process_order_not_found("c1").await.unwrap().is_none());
        }
        let update = tracker.process_order_not_found("c1").await.unwrap().unwrap();
        assert_eq!(update.state, OrderState::Failed);
        assert!(update.lost);
        assert_eq!(sink.count("lost_order"), 1);

        let notified = rx.recv().await.unwrap();
        assert!(notified.lost);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_resets_not_found_count() {
        let (tracker, _) = tracker_with_sink();
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.process_order_not_found("c1").await.unwrap();
        tracker.process_order_not_found("c1").await.unwrap();

        let report = OrderStatusReport::new(OrderState::Open).with_exchange_id("E1");
        tracker.process_snapshot("c1", &report).await.unwrap();

        assert!(tracker.process_order_not_found("c1").await.unwrap().is_none());
        assert_eq!(tracker.get_order("c1").await.unwrap().state, OrderState::Open);
    }

    #[tokio::test]
    async fn test_poll_targets_respect_grace_cycles() {
        let (tracker, _) = tracker_with_sink();
        tracker.start_tracking("pending", params()).await.unwrap();
        tracker.start_tracking("open", params()).await.unwrap();
        tracker.mark_created("open", "E1").await.unwrap();

        // 기본 유예 주기 3회 동안은 접수된 주문만 조회
        for _ in 0..3 {
            let targets = tracker.poll_targets().await;
            assert_eq!(targets.len(), 1);
            assert_eq!(targets[0].client_order_id, "open");
        }
        assert_eq!(tracker.poll_targets().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let (tracker, _) = tracker_with_sink();
        let (id, mut rx) = tracker.subscribe_channel();
        assert!(tracker.unsubscribe(id));
        assert!(!tracker.unsubscribe(id));

        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_finished() {
        let (tracker, _) = tracker_with_sink();
        tracker.start_tracking("done", params()).await.unwrap();
        tracker.start_tracking("live", params()).await.unwrap();
        tracker.mark_created("done", "E1").await.unwrap();
        tracker.mark_created("live", "E2").await.unwrap();
        tracker
            .mark_cancel_result("done", CancelResult::Accepted)
            .await
            .unwrap();

        assert_eq!(tracker.cleanup_finished(Duration::from_secs(3600)).await, 0);
        assert_eq!(tracker.cleanup_finished(Duration::ZERO).await, 1);
        assert!(tracker.get_order("done").await.is_none());
        assert!(tracker.get_order_by_exchange_id("E1").await.is_none());
        assert!(tracker.get_order("live").await.is_some());
    }

    #[tokio::test]
    async fn test_conflict_is_recorded() {
        let (tracker, sink) = tracker_with_sink();
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();
        tracker
            .process_stream_event(&fill_event("c1", "T1", dec!(0.4)))
            .await;
        tracker
            .process_stream_event(&fill_event("c1", "T1", dec!(0.9)))
            .await;
        assert_eq!(sink.count("reconciliation_conflict"), 1);
        assert_eq!(tracker.get_order("c1").await.unwrap().filled_amount, dec!(0.4));
    }
}
