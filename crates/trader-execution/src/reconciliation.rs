//! 정합성 폴러.
//!
//! 주기적으로 REST 스냅샷을 조회하여 트래커에 반영합니다.
//! 스트림이 일정 시간 조용하면 짧은 주기로, 그렇지 않으면 긴 주기로 조회합니다.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use trader_core::{
    Clock, EventSink, ObservabilityEvent, Order, OrderStatusReport, PollerConfig, SystemClock,
    TracingSink,
};
use trader_exchange::{ExchangeError, OrderCodec, RequestSender, StreamActivity};

use crate::tracker::OrderTracker;

/// 폴링 주기 하나의 결과.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// 조회한 주문 수 (일괄 조회로 확인된 주문 포함)
    pub queried: usize,
    /// 변경이 반영된 주문 수
    pub updated: usize,
    /// "주문 없음" 응답 수
    pub not_found: usize,
    /// 실패한 요청 수
    pub failed: usize,
}

/// 정합성 폴러.
pub struct ReconciliationPoller {
    account: String,
    tracker: Arc<OrderTracker>,
    sender: Arc<dyn RequestSender>,
    codec: Arc<dyn OrderCodec>,
    config: PollerConfig,
    activity: Option<Arc<dyn StreamActivity>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl ReconciliationPoller {
    /// 새 폴러를 생성합니다.
    ///
    /// `sender`는 요청 한도를 거치는 전송기여야 합니다.
    pub fn new(
        account: impl Into<String>,
        tracker: Arc<OrderTracker>,
        sender: Arc<dyn RequestSender>,
        codec: Arc<dyn OrderCodec>,
        config: PollerConfig,
    ) -> Self {
        Self {
            account: account.into(),
            tracker,
            sender,
            codec,
            config,
            activity: None,
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// 스트림 활동 정보를 연결합니다.
    pub fn with_activity(mut self, activity: Arc<dyn StreamActivity>) -> Self {
        self.activity = Some(activity);
        self
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

    /// 다음 폴링까지의 대기 시간.
    pub fn next_interval(&self) -> Duration {
        let Some(activity) = &self.activity else {
            return self.config.interval();
        };
        match activity.last_message_at() {
            Some(last) if self.clock.now().saturating_duration_since(last) <= self.config.stream_silence() => {
                self.config.interval()
            }
            _ => self.config.short_interval(),
        }
    }

    /// 종료될 때까지 주기적으로 폴링합니다.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(account = %self.account, "Reconciliation poller started");
        loop {
            let wait = self.next_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(wait) => {}
            }

            let stats = tokio::select! {
                _ = shutdown.cancelled() => break,
                stats = self.poll_once() => stats,
            };
            if stats.queried > 0 {
                debug!(
                    account = %self.account,
                    queried = stats.queried,
                    updated = stats.updated,
                    not_found = stats.not_found,
                    failed = stats.failed,
                    "Poll cycle finished"
                );
            }
        }
        info!(account = %self.account, "Reconciliation poller stopped");
    }

    /// 폴링 주기 하나를 실행합니다.
    ///
    /// 요청 실패는 기록만 하고 다음 주기에 다시 시도합니다.
    pub async fn poll_once(&self) -> PollStats {
        let mut stats = PollStats::default();
        let targets = self.tracker.poll_targets().await;
        let mut confirmed = HashSet::new();

        if let Some(spec) = self.codec.open_orders_request() {
            let reports = match self.sender.send_request(spec).await {
                Ok(response) => self.codec.parse_open_orders_response(&response),
                Err(e) => Err(e),
            };
            match reports {
                Ok(reports) => {
                    for report in reports {
                        let Some(update) = self.tracker.process_report(&report).await else {
                            if let Some(id) = self.matching_target(&targets, &report) {
                                confirmed.insert(id);
                            }
                            continue;
                        };
                        stats.updated += 1;
                        confirmed.insert(update.client_order_id);
                    }
                    stats.queried += confirmed.len();
                }
                Err(e) => {
                    stats.failed += 1;
                    self.record_failure(&e);
                }
            }
        }

        let pending: Vec<&Order> = targets
            .iter()
            .filter(|order| !confirmed.contains(&order.client_order_id))
            .collect();
        let results = join_all(pending.iter().map(|order| self.query_order(order))).await;

        for result in results {
            stats.queried += 1;
            match result {
                QueryOutcome::Updated => stats.updated += 1,
                QueryOutcome::Unchanged => {}
                QueryOutcome::NotFound => stats.not_found += 1,
                QueryOutcome::Failed => stats.failed += 1,
            }
        }
        stats
    }

    async fn query_order(&self, order: &Order) -> QueryOutcome {
        let spec = self.codec.status_request(order);
        let report = match self.sender.send_request(spec).await {
            Ok(response) => self.codec.parse_status_response(&response),
            Err(e) => Err(e),
        };

        match report {
            Ok(report) => match self.tracker.process_snapshot(&order.client_order_id, &report).await {
                Ok(Some(_)) => QueryOutcome::Updated,
                Ok(None) => QueryOutcome::Unchanged,
                // 조회 중 정리된 주문
                Err(_) => QueryOutcome::Unchanged,
            },
            Err(e) if e.is_order_not_found() => {
                match self.tracker.process_order_not_found(&order.client_order_id).await {
                    Ok(_) => QueryOutcome::NotFound,
                    Err(_) => QueryOutcome::Unchanged,
                }
            }
            Err(e) => {
                debug!(
                    client_order_id = %order.client_order_id,
                    error = %e,
                    "Order status query failed"
                );
                self.record_failure(&e);
                QueryOutcome::Failed
            }
        }
    }

    fn matching_target(&self, targets: &[Order], report: &OrderStatusReport) -> Option<String> {
        targets
            .iter()
            .find(|order| {
                report.client_order_id.as_deref() == Some(order.client_order_id.as_str())
                    || (report.exchange_order_id.is_some()
                        && report.exchange_order_id == order.exchange_order_id)
            })
            .map(|order| order.client_order_id.clone())
    }

    fn record_failure(&self, error: &ExchangeError) {
        self.sink.record(ObservabilityEvent::PollFailed {
            account: self.account.clone(),
            error: error.to_string(),
        });
    }
}

enum QueryOutcome {
    Updated,
    Unchanged,
    NotFound,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use trader_core::{
        ManualClock, MemorySink, OrderParams, OrderState, OrderStatusReport, Symbol,
        TrackerConfig, TradeFill,
    };
    use trader_exchange::{ApiResponse, ExchangeResult, RequestSpec};

    /// 경로별 응답을 돌려주는 전송기.
    struct ScriptedSender {
        responses: Mutex<Vec<(String, ExchangeResult<ApiResponse>)>>,
        paths: Mutex<Vec<String>>,
    }

    impl ScriptedSender {
        fn new() -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                paths: Mutex::new(Vec::new()),
            }
        }

        fn respond(&self, path: &str, result: ExchangeResult<ApiResponse>) {
            self.responses.lock().unwrap().push((path.to_string(), result));
        }

        fn paths(&self) -> Vec<String> {
            self.paths.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RequestSender for ScriptedSender {
        async fn send_request(&self, spec: RequestSpec) -> ExchangeResult<ApiResponse> {
            let path = match spec.query.first() {
                Some((_, id)) => format!("{}?{}", spec.path, id),
                None => spec.path.clone(),
            };
            self.paths.lock().unwrap().push(path.clone());
            let mut responses = self.responses.lock().unwrap();
            match responses.iter().position(|(p, _)| *p == path) {
                Some(idx) => responses.remove(idx).1,
                None => Err(ExchangeError::request(404, "unknown order")),
            }
        }
    }

    /// 응답 본문을 그대로 보고서로 해석하는 코덱.
    struct JsonCodec {
        batch: bool,
    }

    impl OrderCodec for JsonCodec {
        fn create_request(&self, client_order_id: &str, _params: &OrderParams) -> RequestSpec {
            RequestSpec::post("/order").with_query("id", client_order_id)
        }

        fn parse_create_response(&self, response: &ApiResponse) -> ExchangeResult<String> {
            Ok(response.str_field("orderId")?.to_string())
        }

        fn cancel_request(&self, order: &Order) -> RequestSpec {
            RequestSpec::delete("/order").with_query("id", order.client_order_id.clone())
        }

        fn status_request(&self, order: &Order) -> RequestSpec {
            RequestSpec::get("/order").with_query("id", order.client_order_id.clone())
        }

        fn parse_status_response(&self, response: &ApiResponse) -> ExchangeResult<OrderStatusReport> {
            response.json()
        }

        fn open_orders_request(&self) -> Option<RequestSpec> {
            self.batch.then(|| RequestSpec::get("/openOrders"))
        }

        fn parse_open_orders_response(
            &self,
            response: &ApiResponse,
        ) -> ExchangeResult<Vec<OrderStatusReport>> {
            response.json()
        }
    }

    struct FixedActivity(Option<Instant>);

    impl StreamActivity for FixedActivity {
        fn last_message_at(&self) -> Option<Instant> {
            self.0
        }
    }

    fn params() -> OrderParams {
        OrderParams::limit_buy(Symbol::new("BTC", "USDT"), dec!(1), dec!(100))
    }

    fn report_body(report: &OrderStatusReport) -> ExchangeResult<ApiResponse> {
        Ok(ApiResponse::ok(serde_json::to_value(report).unwrap()))
    }

    fn poller(
        tracker: Arc<OrderTracker>,
        sender: Arc<ScriptedSender>,
        batch: bool,
    ) -> ReconciliationPoller {
        ReconciliationPoller::new(
            "main",
            tracker,
            sender,
            Arc::new(JsonCodec { batch }),
            PollerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_individual_query_applies_snapshot() {
        let tracker = Arc::new(OrderTracker::new(TrackerConfig::default()));
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();

        let sender = Arc::new(ScriptedSender::new());
        let report = OrderStatusReport::new(OrderState::Filled)
            .with_exchange_id("E1")
            .with_trade(TradeFill::new("T1", dec!(100), dec!(1)));
        sender.respond("/order?c1", report_body(&report));

        let stats = poller(tracker.clone(), sender, false).poll_once().await;
        assert_eq!(stats.queried, 1);
        assert_eq!(stats.updated, 1);

        let order = tracker.get_order("c1").await.unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.filled_amount, dec!(1));
    }

    #[tokio::test]
    async fn test_batch_query_skips_individual_requests() {
        let tracker = Arc::new(OrderTracker::new(TrackerConfig::default()));
        for (id, eid) in [("c1", "E1"), ("c2", "E2")] {
            tracker.start_tracking(id, params()).await.unwrap();
            tracker.mark_created(id, eid).await.unwrap();
        }

        let sender = Arc::new(ScriptedSender::new());
        // c1만 미체결 목록에 있음, c2는 개별 조회로 취소 확인
        let open = vec![OrderStatusReport::new(OrderState::Open)
            .with_client_id("c1")
            .with_exchange_id("E1")];
        sender.respond(
            "/openOrders",
            Ok(ApiResponse::ok(serde_json::to_value(&open).unwrap())),
        );
        let canceled = OrderStatusReport::new(OrderState::Canceled).with_exchange_id("E2");
        sender.respond("/order?c2", report_body(&canceled));

        let stats = poller(tracker.clone(), sender.clone(), true).poll_once().await;
        assert_eq!(stats.queried, 2);
        assert_eq!(stats.updated, 1);
        assert_eq!(sender.paths(), vec!["/openOrders".to_string(), "/order?c2".to_string()]);
        assert_eq!(tracker.get_order("c2").await.unwrap().state, OrderState::Canceled);
    }

    #[tokio::test]
    async fn test_not_found_leads_to_lost_order() {
        let sink = Arc::new(MemorySink::new());
        let tracker = Arc::new(
            OrderTracker::new(TrackerConfig::default()).with_sink(sink.clone()),
        );
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();

        let sender = Arc::new(ScriptedSender::new());
        let poller = poller(tracker.clone(), sender, false);
        for _ in 0..3 {
            let stats = poller.poll_once().await;
            assert_eq!(stats.not_found, 1);
        }

        let order = tracker.get_order("c1").await.unwrap();
        assert_eq!(order.state, OrderState::Failed);
        assert!(order.lost);
        assert_eq!(sink.count("lost_order"), 1);

        // 최종 상태이므로 더 이상 조회하지 않음
        assert_eq!(poller.poll_once().await, PollStats::default());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_next_cycle() {
        let sink = Arc::new(MemorySink::new());
        let tracker = Arc::new(OrderTracker::new(TrackerConfig::default()));
        tracker.start_tracking("c1", params()).await.unwrap();
        tracker.mark_created("c1", "E1").await.unwrap();

        let sender = Arc::new(ScriptedSender::new());
        sender.respond("/order?c1", Err(ExchangeError::Timeout("read".to_string())));
        let poller = poller(tracker.clone(), sender.clone(), false).with_sink(sink.clone());

        let stats = poller.poll_once().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(sink.count("poll_failed"), 1);
        assert_eq!(tracker.get_order("c1").await.unwrap().state, OrderState::Open);

        let report = OrderStatusReport::new(OrderState::Canceled).with_exchange_id("E1");
        sender.respond("/order?c1", report_body(&report));
        let stats = poller.poll_once().await;
        assert_eq!(stats.updated, 1);
        assert_eq!(tracker.get_order("c1").await.unwrap().state, OrderState::Canceled);
    }

    #[tokio::test]
    async fn test_pending_create_waits_for_grace_cycles() {
        let tracker = Arc::new(OrderTracker::new(TrackerConfig::default()));
        tracker.start_tracking("c1", params()).await.unwrap();

        let sender = Arc::new(ScriptedSender::new());
        let poller = poller(tracker.clone(), sender.clone(), false);
        for _ in 0..3 {
            assert_eq!(poller.poll_once().await.queried, 0);
        }
        assert!(sender.paths().is_empty());

        // 유예 이후 "주문 없음"이 분실 판정으로 이어짐
        for _ in 0..3 {
            poller.poll_once().await;
        }
        let order = tracker.get_order("c1").await.unwrap();
        assert_eq!(order.state, OrderState::Failed);
        assert!(order.lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_follows_stream_activity() {
        let clock = Arc::new(ManualClock::new());
        let tracker = Arc::new(OrderTracker::new(TrackerConfig::default()));
        let sender = Arc::new(ScriptedSender::new());
        let config = PollerConfig::default();

        let silent = poller(tracker.clone(), sender.clone(), false)
            .with_activity(Arc::new(FixedActivity(None)))
            .with_clock(clock.clone());
        assert_eq!(silent.next_interval(), config.short_interval());

        let active = poller(tracker.clone(), sender.clone(), false)
            .with_activity(Arc::new(FixedActivity(Some(clock.now()))))
            .with_clock(clock.clone());
        assert_eq!(active.next_interval(), config.interval());

        clock.advance(config.stream_silence() + Duration::from_secs(1));
        assert_eq!(active.next_interval(), config.short_interval());

        let detached = poller(tracker, sender, false);
        assert_eq!(detached.next_interval(), config.interval());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let tracker = Arc::new(OrderTracker::new(TrackerConfig::default()));
        let sender = Arc::new(ScriptedSender::new());
        let poller = Arc::new(poller(tracker, sender, false));
        let shutdown = CancellationToken::new();

        let handle = {
            let poller = poller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { poller.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
