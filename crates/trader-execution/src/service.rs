//! 주문 동기화 서비스.
//!
//! 요청 한도 관리자, 스트림 세션, 트래커, 폴러를 하나의 설정으로 조립하고
//! 백그라운드 작업(세션 루프, 큐 소비 루프, 폴러)을 관리합니다.
//!
//! 주문 생성/취소 요청도 이 서비스를 통해 보내며, 생성 요청 전에 반드시
//! 추적을 시작하므로 응답보다 먼저 도착한 스트림 이벤트도 유실되지 않습니다.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trader_core::{
    new_client_order_id, Clock, EventSink, OrderParams, OrderSnapshot, SyncConfig, SystemClock,
    TraderError, TracingSink,
};
use trader_exchange::{
    EventParser, ExchangeError, GovernedSender, JitterSource, OrderCodec, RandomJitter,
    RateGovernor, RequestSender, SessionAuthenticator, StreamConnector, StreamMessage,
    StreamSessionManager,
};

use crate::reconciliation::ReconciliationPoller;
use crate::tracker::{
    CancelResult, ListenerId, OrderHandle, OrderTracker, OrderUpdateListener, TrackerError,
};

/// 작업 종료 대기 시 세션 종료 타임아웃에 더하는 여유 시간.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// 서비스 에러 타입.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] TraderError),

    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    #[error("Service already started")]
    AlreadyStarted,

    #[error("Service is shut down")]
    ShutDown,

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Order {client_order_id} rejected: {source}")]
    Rejected {
        client_order_id: String,
        #[source]
        source: ExchangeError,
    },

    #[error("Request for order {client_order_id} failed: {source}")]
    Request {
        client_order_id: String,
        #[source]
        source: ExchangeError,
    },
}

/// 서비스 작업을 위한 Result 타입.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// [`OrderSyncService`] 빌더.
pub struct OrderSyncServiceBuilder {
    config: SyncConfig,
    sender: Option<Arc<dyn RequestSender>>,
    authenticator: Option<Arc<dyn SessionAuthenticator>>,
    connector: Option<Arc<dyn StreamConnector>>,
    parser: Option<Arc<dyn EventParser>>,
    codec: Option<Arc<dyn OrderCodec>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterSource>,
}

impl OrderSyncServiceBuilder {
    /// 설정으로 빌더를 생성합니다.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            sender: None,
            authenticator: None,
            connector: None,
            parser: None,
            codec: None,
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            jitter: Arc::new(RandomJitter),
        }
    }

    /// 서명된 요청을 보내는 전송기. 요청 한도 관리자로 감싸서 사용합니다.
    pub fn sender(mut self, sender: Arc<dyn RequestSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// 세션 자격증명 발급기.
    pub fn authenticator(mut self, authenticator: Arc<dyn SessionAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// 스트림 연결 생성기.
    pub fn connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// 스트림 메시지 파서.
    pub fn parser(mut self, parser: Arc<dyn EventParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// 주문 요청 코덱.
    pub fn codec(mut self, codec: Arc<dyn OrderCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// 관측 이벤트 싱크.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// 시계.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 백오프 지터 소스.
    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// 서비스를 조립합니다.
    pub fn build(self) -> ServiceResult<OrderSyncService> {
        self.config.validate()?;

        let raw_sender = self.sender.ok_or(ServiceError::MissingComponent("sender"))?;
        let authenticator = self
            .authenticator
            .ok_or(ServiceError::MissingComponent("authenticator"))?;
        let connector = self
            .connector
            .ok_or(ServiceError::MissingComponent("connector"))?;
        let parser = self.parser.ok_or(ServiceError::MissingComponent("parser"))?;
        let codec = self.codec.ok_or(ServiceError::MissingComponent("codec"))?;

        let governor = Arc::new(RateGovernor::with_clock(
            &self.config.rate_limit,
            self.clock.clone(),
        ));
        let sender: Arc<dyn RequestSender> =
            Arc::new(GovernedSender::new(raw_sender, governor.clone()));

        let session = Arc::new(
            StreamSessionManager::new(
                self.config.account.clone(),
                self.config.stream.clone(),
                sender.clone(),
                authenticator,
                connector,
            )
            .with_sink(self.sink.clone())
            .with_clock(self.clock.clone())
            .with_jitter(self.jitter),
        );

        let tracker = Arc::new(
            OrderTracker::new(self.config.tracker.clone())
                .with_sink(self.sink.clone())
                .with_clock(self.clock.clone()),
        );

        let poller = Arc::new(
            ReconciliationPoller::new(
                self.config.account.clone(),
                tracker.clone(),
                sender.clone(),
                codec.clone(),
                self.config.poller.clone(),
            )
            .with_activity(session.clone())
            .with_sink(self.sink)
            .with_clock(self.clock),
        );

        Ok(OrderSyncService {
            config: self.config,
            governor,
            sender,
            session,
            tracker,
            poller,
            parser,
            codec,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// 주문 동기화 서비스.
pub struct OrderSyncService {
    config: SyncConfig,
    governor: Arc<RateGovernor>,
    sender: Arc<dyn RequestSender>,
    session: Arc<StreamSessionManager>,
    tracker: Arc<OrderTracker>,
    poller: Arc<ReconciliationPoller>,
    parser: Arc<dyn EventParser>,
    codec: Arc<dyn OrderCodec>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderSyncService {
    /// 빌더를 생성합니다.
    pub fn builder(config: SyncConfig) -> OrderSyncServiceBuilder {
        OrderSyncServiceBuilder::new(config)
    }

    // ==================== 생명주기 ====================

    /// 세션 루프, 큐 소비 루프, 폴러를 시작합니다.
    pub async fn start(&self) -> ServiceResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ServiceError::ShutDown);
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(ServiceError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(self.config.stream.queue_capacity);

        let session = self.session.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { session.run(tx, token).await }));

        let tracker = self.tracker.clone();
        let parser = self.parser.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(drain_loop(rx, parser, tracker, token)));

        let poller = self.poller.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { poller.run(token).await }));

        info!(account = %self.config.account, "Order sync service started");
        Ok(())
    }

    /// 모든 작업을 중지하고 종료를 기다립니다.
    ///
    /// 세션은 연결을 닫고 자격증명을 반납한 뒤 종료됩니다.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let wait = self.config.stream.close_timeout() + SHUTDOWN_GRACE;
        for mut handle in handles {
            if timeout(wait, &mut handle).await.is_err() {
                warn!(account = %self.config.account, "Background task did not stop in time, aborting");
                handle.abort();
            }
        }
        info!(account = %self.config.account, "Order sync service stopped");
    }

    /// 종료 신호 토큰.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ==================== 주문 요청 ====================

    /// 주문을 생성합니다.
    ///
    /// 추적을 먼저 시작한 뒤 요청을 보냅니다. 거래소가 거부하면 주문은 `Failed`가 되고
    /// 에러를 반환합니다. 일시적 실패면 주문은 `PendingCreate`로 남아 폴러가 확인합니다.
    pub async fn place_order(&self, params: OrderParams) -> ServiceResult<OrderHandle> {
        if self.shutdown.is_cancelled() {
            return Err(ServiceError::ShutDown);
        }

        let client_order_id = new_client_order_id(&self.config.client_order_id_prefix);
        let request = self.codec.create_request(&client_order_id, &params);
        let handle = self
            .tracker
            .start_tracking(client_order_id.clone(), params)
            .await?;

        let result = match self.sender.send_request(request).await {
            Ok(response) => self.codec.parse_create_response(&response),
            Err(e) => Err(e),
        };

        match result {
            Ok(exchange_order_id) => {
                self.tracker
                    .mark_created(&client_order_id, &exchange_order_id)
                    .await?;
                debug!(client_order_id = %client_order_id, exchange_order_id = %exchange_order_id, "Order created");
                Ok(handle)
            }
            Err(e) if e.is_rejected() || e.is_auth_error() => {
                self.tracker
                    .mark_create_failed(&client_order_id, &e.to_string())
                    .await?;
                Err(ServiceError::Rejected {
                    client_order_id,
                    source: e,
                })
            }
            Err(e) => {
                warn!(
                    client_order_id = %client_order_id,
                    error = %e,
                    "Order create request failed, waiting for confirmation"
                );
                Ok(handle)
            }
        }
    }

    /// 주문을 취소합니다.
    pub async fn cancel_order(&self, client_order_id: &str) -> ServiceResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ServiceError::ShutDown);
        }

        self.tracker.mark_cancel_requested(client_order_id).await?;
        let order = self
            .tracker
            .get_order(client_order_id)
            .await
            .ok_or_else(|| TrackerError::OrderNotFound(client_order_id.to_string()))?;

        let request = self.codec.cancel_request(&order);
        match self.sender.send_request(request).await {
            Ok(_) => {
                self.tracker
                    .mark_cancel_result(client_order_id, CancelResult::Accepted)
                    .await?;
                Ok(())
            }
            Err(e) if e.is_order_not_found() => {
                self.tracker
                    .mark_cancel_result(client_order_id, CancelResult::NotFound)
                    .await?;
                Ok(())
            }
            Err(e) if e.is_rejected() => {
                self.tracker
                    .mark_cancel_result(client_order_id, CancelResult::Rejected(e.to_string()))
                    .await?;
                Err(ServiceError::Rejected {
                    client_order_id: client_order_id.to_string(),
                    source: e,
                })
            }
            Err(e) => {
                // 취소가 반영되었을 수 있으므로 PendingCancel로 두고 폴러가 확인
                Err(ServiceError::Request {
                    client_order_id: client_order_id.to_string(),
                    source: e,
                })
            }
        }
    }

    // ==================== 조회/구독 ====================

    /// 주문 사본을 조회합니다.
    pub async fn get_order(&self, client_order_id: &str) -> Option<OrderSnapshot> {
        self.tracker.get_order(client_order_id).await
    }

    /// 진행 중인 주문 목록.
    pub async fn active_orders(&self) -> Vec<OrderSnapshot> {
        self.tracker.active_orders().await
    }

    /// 변경 알림을 구독합니다.
    pub fn subscribe(&self, listener: Arc<dyn OrderUpdateListener>) -> ListenerId {
        self.tracker.subscribe(listener)
    }

    /// 구독을 해지합니다.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.tracker.unsubscribe(id)
    }

    /// 오래된 최종 상태 주문을 정리합니다.
    pub async fn cleanup_finished(&self) -> usize {
        self.tracker
            .cleanup_finished(self.config.tracker.finished_retention())
            .await
    }

    /// 스트림 재연결을 요청합니다.
    pub fn request_reconnect(&self) {
        self.session.request_reconnect();
    }

    /// 트래커.
    pub fn tracker(&self) -> &Arc<OrderTracker> {
        &self.tracker
    }

    /// 세션 관리자.
    pub fn session(&self) -> &Arc<StreamSessionManager> {
        &self.session
    }

    /// 폴러.
    pub fn poller(&self) -> &Arc<ReconciliationPoller> {
        &self.poller
    }

    /// 요청 한도 관리자.
    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }
}

/// 큐에서 원시 메시지를 꺼내 정규화한 뒤 트래커에 반영합니다.
async fn drain_loop(
    mut rx: mpsc::Receiver<StreamMessage>,
    parser: Arc<dyn EventParser>,
    tracker: Arc<OrderTracker>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match parser.parse_event(&message.message) {
            Some(event) => {
                tracker.process_stream_event(&event).await;
            }
            None => debug!(session_id = message.session_id, "Stream message ignored"),
        }
    }
    debug!("Stream drain loop stopped");
}
