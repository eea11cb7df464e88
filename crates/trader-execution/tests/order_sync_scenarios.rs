//! 주문 동기화 시나리오 테스트.
//!
//! ## 테스트 목적
//! 1. 스트림과 스냅샷이 같은 체결을 보고해도 체결 알림이 한 번만 발생하는지
//! 2. 접수 확인이 없는 주문이 분실 처리되는지
//! 3. 요청 한도가 모든 요청에 적용되는지
//! 4. 서비스 전체 경로(세션 → 큐 → 파서 → 트래커 → 알림)가 동작하는지

use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use trader_core::{
    MemorySink, NormalizedEvent, Order, OrderParams, OrderRef, OrderState, OrderStatusReport,
    PoolConfig, PollerConfig, RateLimitConfig, Symbol, SyncConfig, TrackerConfig, TradeFill,
    UpdateSource, WindowKind,
};
use trader_exchange::{
    ApiResponse, EventParser, ExchangeError, ExchangeResult, GovernedSender, OrderCodec,
    RateGovernor, RawMessage, RequestSender, RequestSpec, SessionAuthenticator, SessionCredential,
    StreamConnection, StreamConnector,
};
use trader_execution::{OrderSyncService, OrderTracker, ReconciliationPoller};

// =============================================================================
// 테스트 도우미
// =============================================================================

fn btc_params(amount: rust_decimal::Decimal) -> OrderParams {
    OrderParams::limit_buy(Symbol::new("BTC", "USDT"), amount, dec!(30000))
}

fn fill(client_order_id: &str, trade_id: &str, amount: rust_decimal::Decimal) -> NormalizedEvent {
    NormalizedEvent::Fill {
        order: OrderRef::client(client_order_id).with_exchange_id("E1"),
        trade: TradeFill::new(trade_id, dec!(30000), amount).with_fee(dec!(0.001), "BNB"),
    }
}

/// 생성 요청에는 거래소 주문 ID를, 나머지 요청에는 "주문 없음"을 돌려주는 전송기.
struct ExchangeStub {
    requests: Mutex<Vec<RequestSpec>>,
}

impl ExchangeStub {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl RequestSender for ExchangeStub {
    async fn send_request(&self, spec: RequestSpec) -> ExchangeResult<ApiResponse> {
        let is_create = spec.path == "/api/v3/order" && spec.body.is_some();
        let is_listen_key = spec.path == "/api/v3/userDataStream";
        self.requests.lock().unwrap().push(spec);
        if is_create {
            Ok(ApiResponse::ok(serde_json::json!({"orderId": "E1"})))
        } else if is_listen_key {
            Ok(ApiResponse::ok(serde_json::json!({"listenKey": "lk-1"})))
        } else {
            Err(ExchangeError::request(404, r#"{"code":-2013}"#))
        }
    }
}

struct JsonCodec;

impl OrderCodec for JsonCodec {
    fn create_request(&self, client_order_id: &str, params: &OrderParams) -> RequestSpec {
        RequestSpec::post("/api/v3/order").with_body(serde_json::json!({
            "newClientOrderId": client_order_id,
            "symbol": params.symbol.exchange_code(),
            "quantity": params.amount.to_string(),
        }))
    }

    fn parse_create_response(&self, response: &ApiResponse) -> ExchangeResult<String> {
        Ok(response.str_field("orderId")?.to_string())
    }

    fn cancel_request(&self, order: &Order) -> RequestSpec {
        RequestSpec::delete("/api/v3/order").with_query("origClientOrderId", order.client_order_id.clone())
    }

    fn status_request(&self, order: &Order) -> RequestSpec {
        RequestSpec::get("/api/v3/order")
            .with_limit_id("order_status")
            .with_weight(2)
            .with_query("origClientOrderId", order.client_order_id.clone())
    }

    fn parse_status_response(&self, response: &ApiResponse) -> ExchangeResult<OrderStatusReport> {
        response.json()
    }
}

/// 텍스트 메시지를 `NormalizedEvent` JSON으로 해석하는 파서.
struct JsonEventParser;

impl EventParser for JsonEventParser {
    fn parse_event(&self, message: &RawMessage) -> Option<NormalizedEvent> {
        serde_json::from_str(message.as_text()?).ok()
    }
}

struct StaticKey;

#[async_trait]
impl SessionAuthenticator for StaticKey {
    async fn obtain(&self, sender: &dyn RequestSender) -> ExchangeResult<SessionCredential> {
        let response = sender
            .send_request(RequestSpec::post("/api/v3/userDataStream"))
            .await?;
        Ok(SessionCredential::new(response.str_field("listenKey")?))
    }

    async fn renew(
        &self,
        _sender: &dyn RequestSender,
        _credential: &SessionCredential,
    ) -> ExchangeResult<()> {
        Ok(())
    }

    async fn release(
        &self,
        _sender: &dyn RequestSender,
        _credential: &SessionCredential,
    ) -> ExchangeResult<()> {
        Ok(())
    }
}

/// 테스트가 보낸 메시지를 그대로 전달하는 연결 생성기.
struct ChannelConnector {
    rx: Mutex<Option<mpsc::UnboundedReceiver<RawMessage>>>,
}

struct ChannelConnection {
    rx: mpsc::UnboundedReceiver<RawMessage>,
}

#[async_trait]
impl StreamConnector for ChannelConnector {
    async fn connect(
        &self,
        _credential: &SessionCredential,
    ) -> ExchangeResult<Box<dyn StreamConnection>> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ExchangeError::Disconnected("already used".to_string()))?;
        Ok(Box::new(ChannelConnection { rx }))
    }
}

#[async_trait]
impl StreamConnection for ChannelConnection {
    async fn next_message(&mut self) -> Option<ExchangeResult<RawMessage>> {
        self.rx.recv().await.map(Ok)
    }

    async fn ping(&mut self) -> ExchangeResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> ExchangeResult<()> {
        Ok(())
    }
}

// =============================================================================
// 시나리오
// =============================================================================

/// T1(40%)이 스트림과 스냅샷으로 두 번 보고되고 T2(60%)가 스트림으로 도착하는 경우.
#[tokio::test]
async fn test_stream_and_snapshot_report_same_trade_once() {
    let tracker = OrderTracker::new(TrackerConfig::default());
    let (_, mut updates) = tracker.subscribe_channel();

    tracker.start_tracking("O1", btc_params(dec!(1.0))).await.unwrap();
    tracker.mark_created("O1", "E1").await.unwrap();
    assert_eq!(updates.recv().await.unwrap().state, OrderState::Open);

    let t1 = fill("O1", "T1", dec!(0.4));
    let first = tracker.process_stream_event(&t1).await.unwrap();
    assert_eq!(first.state, OrderState::PartiallyFilled);
    assert_eq!(first.filled_delta, dec!(0.4));

    let NormalizedEvent::Fill { trade, .. } = &t1 else {
        unreachable!()
    };
    let snapshot = OrderStatusReport::new(OrderState::PartiallyFilled)
        .with_exchange_id("E1")
        .with_trade(trade.clone())
        .with_reported_filled(dec!(0.4));
    assert!(tracker.process_snapshot("O1", &snapshot).await.unwrap().is_none());

    let second = tracker
        .process_stream_event(&fill("O1", "T2", dec!(0.6)))
        .await
        .unwrap();
    assert_eq!(second.previous_state, OrderState::PartiallyFilled);
    assert_eq!(second.state, OrderState::Filled);
    assert_eq!(second.cumulative_filled, dec!(1.0));
    assert_eq!(second.cumulative_fee, dec!(0.002));

    let fills: Vec<_> = std::iter::from_fn(|| updates.try_recv().ok())
        .filter(|u| u.is_fill())
        .collect();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].source, UpdateSource::Stream);
    assert_eq!(fills[1].source, UpdateSource::Stream);
}

/// 접수 확인이 끝내 오지 않은 주문은 분실 처리되어 최종 알림이 한 번 발생합니다.
#[tokio::test]
async fn test_unconfirmed_order_becomes_lost() {
    let sink = Arc::new(MemorySink::new());
    let tracker = Arc::new(OrderTracker::new(TrackerConfig::default()).with_sink(sink.clone()));
    let (_, mut updates) = tracker.subscribe_channel();
    tracker.start_tracking("O2", btc_params(dec!(1))).await.unwrap();

    let sender = Arc::new(ExchangeStub::new());
    let poller = ReconciliationPoller::new(
        "main",
        tracker.clone(),
        sender.clone(),
        Arc::new(JsonCodec),
        PollerConfig::default(),
    );

    // 유예 3주기 + "주문 없음" 3회
    for _ in 0..6 {
        poller.poll_once().await;
    }

    let update = updates.recv().await.unwrap();
    assert_eq!(update.state, OrderState::Failed);
    assert!(update.lost);
    assert!(updates.try_recv().is_err());
    assert_eq!(sender.request_count(), 3);
    assert_eq!(sink.count("lost_order"), 1);
}

/// 용량 5/1초 풀에서 여섯 번째 요청은 윈도우 이내로 대기합니다.
#[tokio::test(start_paused = true)]
async fn test_governor_blocks_sixth_request_within_window() {
    let config = RateLimitConfig {
        pools: vec![PoolConfig::new(
            "request_weight",
            5,
            Duration::from_secs(1),
            WindowKind::SlidingWindow,
        )],
        ..RateLimitConfig::default()
    };
    let governor = Arc::new(RateGovernor::new(&config));
    let sender = GovernedSender::new(Arc::new(ExchangeStub::new()), governor.clone());

    let start = Instant::now();
    for _ in 0..5 {
        let _ = sender.send_request(RequestSpec::get("/api/v3/order")).await;
    }
    assert_eq!(start.elapsed(), Duration::ZERO);

    let _ = sender.send_request(RequestSpec::get("/api/v3/order")).await;
    let waited = start.elapsed();
    assert!(waited > Duration::ZERO);
    assert!(waited <= Duration::from_secs(1));
}

/// 서비스 전체 경로: 주문 생성 → 스트림 체결 → 알림 → 종료.
#[tokio::test]
async fn test_service_applies_stream_events() {
    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    let sender = Arc::new(ExchangeStub::new());
    let sink = Arc::new(MemorySink::new());

    let service = OrderSyncService::builder(SyncConfig::default())
        .sender(sender.clone())
        .authenticator(Arc::new(StaticKey))
        .connector(Arc::new(ChannelConnector {
            rx: Mutex::new(Some(stream_rx)),
        }))
        .parser(Arc::new(JsonEventParser))
        .codec(Arc::new(JsonCodec))
        .sink(sink)
        .build()
        .unwrap();

    let (_, mut updates) = service.tracker().subscribe_channel();
    service.start().await.unwrap();

    let handle = service.place_order(btc_params(dec!(1))).await.unwrap();
    let created = timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.state, OrderState::Open);

    for (trade_id, amount) in [("T1", dec!(0.4)), ("T1", dec!(0.4)), ("T2", dec!(0.6))] {
        let event = fill(handle.id(), trade_id, amount);
        stream_tx
            .send(RawMessage::Text(serde_json::to_string(&event).unwrap()))
            .unwrap();
    }
    stream_tx.send(RawMessage::Text("{\"e\":\"outboundAccountPosition\"}".to_string())).unwrap();

    let partial = timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial.state, OrderState::PartiallyFilled);
    let filled = timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(filled.state, OrderState::Filled);
    assert_eq!(filled.cumulative_filled, dec!(1));

    let order = service.get_order(handle.id()).await.unwrap();
    assert_eq!(order.trades.len(), 2);
    assert_eq!(order.average_fill_price(), Some(dec!(30000)));

    service.shutdown().await;
    assert!(!service.session().is_running());
    assert!(updates.try_recv().is_err());
}
