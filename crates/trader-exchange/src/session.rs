//! 인증된 스트림 세션 관리자.
//!
//! 계정당 하나의 스트림 연결을 소유하고 수명주기를 관리합니다:
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Active ⇄ Renewing
//!      ↑                                          │
//!      └──────────── 백오프 후 재연결 ◀────────────┘ (I/O 실패, keepalive 타임아웃, 갱신 실패)
//! ```
//!
//! - 자격증명은 요청 한도를 거치는 `RequestSender`로 발급/갱신/반납합니다.
//! - 수신한 메시지는 용량이 제한된 큐로 전달합니다. 큐가 가득 차면 생산자가 대기합니다.
//! - 새 세션은 이전 세션을 완전히 정리한 뒤에만 시작합니다 (읽기 중단, 연결 종료, 자격증명 반납).
//! - 재연결 요청은 병합됩니다: 대기 중인 요청이 있는 동안의 추가 요청은 무시됩니다.
//! - 연결/인증 실패는 관측 이벤트로만 기록되고 호출자에게 전파되지 않습니다.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trader_core::{Clock, EventSink, ObservabilityEvent, StreamConfig, SystemClock, TracingSink};

use crate::backoff::{BackoffPolicy, BackoffState, JitterSource, RandomJitter};
use crate::traits::{
    RawMessage, RequestSender, SessionAuthenticator, SessionCredential, StreamConnection,
    StreamConnector,
};
use crate::ExchangeError;

/// 세션 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 연결 없음 (백오프 대기 포함)
    Disconnected,
    /// 자격증명 발급 및 연결 중
    Connecting,
    /// 전송 계층 인증 중
    Authenticating,
    /// 메시지 수신 중
    Active,
    /// 자격증명 갱신 중
    Renewing,
}

impl SessionState {
    /// 로그용 이름.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Renewing => "renewing",
        }
    }
}

/// 큐로 전달되는 스트림 메시지.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// 원시 메시지
    pub message: RawMessage,
    /// 수신 시각
    pub received_at: Instant,
    /// 메시지를 받은 세션 번호 (1부터 증가)
    pub session_id: u32,
}

/// 스트림 활동 조회.
///
/// 폴러는 스트림이 조용한지 보고 폴링 주기를 조절합니다.
pub trait StreamActivity: Send + Sync {
    /// 마지막 데이터 메시지 수신 시각.
    fn last_message_at(&self) -> Option<Instant>;
}

/// 세션 종료 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureStage {
    Obtain,
    Connect,
    Authenticate,
    Stream,
    Renew,
}

/// 세션 하나가 끝난 이유.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    OutputClosed,
    ReconnectRequested,
    Failed {
        stage: FailureStage,
        error: ExchangeError,
    },
}

/// 스트림 세션 관리자.
pub struct StreamSessionManager {
    account: String,
    config: StreamConfig,
    policy: BackoffPolicy,
    sender: Arc<dyn RequestSender>,
    authenticator: Arc<dyn SessionAuthenticator>,
    connector: Arc<dyn StreamConnector>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterSource>,
    state_tx: watch::Sender<SessionState>,
    reconnect: Notify,
    reconnect_pending: AtomicBool,
    running: AtomicBool,
    last_message: Mutex<Option<Instant>>,
    connect_attempts: AtomicU32,
}

impl StreamSessionManager {
    /// 새 세션 관리자를 생성합니다.
    ///
    /// `sender`는 요청 한도를 거치는 전송기여야 합니다 (`GovernedSender`).
    pub fn new(
        account: impl Into<String>,
        config: StreamConfig,
        sender: Arc<dyn RequestSender>,
        authenticator: Arc<dyn SessionAuthenticator>,
        connector: Arc<dyn StreamConnector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            account: account.into(),
            policy: BackoffPolicy::from_config(&config),
            config,
            sender,
            authenticator,
            connector,
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            jitter: Arc::new(RandomJitter),
            state_tx,
            reconnect: Notify::new(),
            reconnect_pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_message: Mutex::new(None),
            connect_attempts: AtomicU32::new(0),
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

    /// 지터 공급자를 설정합니다.
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    // ==================== 조회 ====================

    /// 계정 이름.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// 현재 세션 상태.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// 세션 상태 변경 구독.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// 지금까지의 연결 시도 횟수.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// 세션 루프가 실행 중인지 확인합니다.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ==================== 제어 ====================

    /// 현재 세션을 폐기하고 새로 연결하도록 요청합니다.
    ///
    /// 이미 대기 중인 요청이 있으면 병합됩니다.
    pub fn request_reconnect(&self) {
        if !self.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!(account = %self.account, "Reconnect requested");
            self.reconnect.notify_one();
        }
    }

    /// 세션 루프를 실행합니다. `shutdown`이 취소되거나 `output`이 닫히면 반환합니다.
    ///
    /// 계정당 하나의 루프만 실행할 수 있으며, 이미 실행 중이면 즉시 반환합니다.
    pub async fn run(&self, output: mpsc::Sender<StreamMessage>, shutdown: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(account = %self.account, "Stream session loop already running");
            return;
        }

        info!(account = %self.account, "스트림 세션 루프 시작");
        let mut backoff = BackoffState::new();
        let mut session_id = 0u32;

        while !shutdown.is_cancelled() {
            session_id = session_id.wrapping_add(1);
            let (end, active_since) = self.run_session(session_id, &output, &shutdown).await;
            self.set_state(SessionState::Disconnected);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::OutputClosed => {
                    warn!(account = %self.account, "Stream output queue closed, stopping session loop");
                    break;
                }
                SessionEnd::ReconnectRequested => {
                    info!(account = %self.account, "재연결 요청으로 세션 교체");
                    backoff = backoff.on_success();
                }
                SessionEnd::Failed { stage, error } => {
                    let now = self.clock.now();
                    if active_since.is_some_and(|at| now.duration_since(at) >= self.config.stable_after()) {
                        backoff = backoff.on_success();
                    }
                    self.record_failure(stage, &error);

                    let (next, delay) = backoff.on_failure(&self.policy, now, self.jitter.as_ref());
                    backoff = next;
                    self.sink.record(ObservabilityEvent::ReconnectScheduled {
                        account: self.account.clone(),
                        attempt: backoff.attempt,
                        delay,
                    });

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(SessionState::Disconnected);
        self.running.store(false, Ordering::SeqCst);
        info!(account = %self.account, "스트림 세션 루프 종료");
    }

    // ==================== 세션 ====================

    /// 세션 하나를 수립하고 끝날 때까지 유지합니다.
    ///
    /// 반환 전에 연결을 닫고 자격증명을 반납합니다.
    async fn run_session(
        &self,
        session_id: u32,
        output: &mpsc::Sender<StreamMessage>,
        shutdown: &CancellationToken,
    ) -> (SessionEnd, Option<Instant>) {
        // 연결 전 요청은 이번 연결로 충족됨
        self.reconnect_pending.store(false, Ordering::SeqCst);
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Connecting);

        let obtained = tokio::select! {
            _ = shutdown.cancelled() => return (SessionEnd::Shutdown, None),
            r = self.authenticator.obtain(self.sender.as_ref()) => r,
        };
        let credential = match obtained {
            Ok(credential) => credential,
            Err(error) => {
                let end = SessionEnd::Failed {
                    stage: FailureStage::Obtain,
                    error,
                };
                return (end, None);
            }
        };
        debug!(account = %self.account, session_id, "세션 자격증명 발급 완료");

        let connected = tokio::select! {
            _ = shutdown.cancelled() => Err(None),
            r = self.connector.connect(&credential) => r.map_err(Some),
        };
        let mut connection = match connected {
            Ok(connection) => connection,
            Err(error) => {
                let deadline = Instant::now() + self.config.close_timeout();
                self.release_credential(&credential, deadline).await;
                let end = match error {
                    Some(error) => SessionEnd::Failed {
                        stage: FailureStage::Connect,
                        error,
                    },
                    None => SessionEnd::Shutdown,
                };
                return (end, None);
            }
        };

        self.set_state(SessionState::Authenticating);
        let authenticated = tokio::select! {
            _ = shutdown.cancelled() => Err(None),
            r = connection.authenticate(&credential) => r.map_err(Some),
        };

        let (end, active_since) = match authenticated {
            Ok(()) => {
                self.set_state(SessionState::Active);
                info!(account = %self.account, session_id, "스트림 세션 연결 성공");
                let active_since = self.clock.now();
                let end = self
                    .drive(session_id, connection.as_mut(), &credential, output, shutdown)
                    .await;
                (end, Some(active_since))
            }
            Err(Some(error)) => (
                SessionEnd::Failed {
                    stage: FailureStage::Authenticate,
                    error,
                },
                None,
            ),
            Err(None) => (SessionEnd::Shutdown, None),
        };

        self.retire(connection, &credential).await;
        (end, active_since)
    }

    /// 활성 세션의 수신/keepalive/갱신 루프.
    async fn drive(
        &self,
        session_id: u32,
        connection: &mut dyn StreamConnection,
        credential: &SessionCredential,
        output: &mpsc::Sender<StreamMessage>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let keepalive_interval = self.config.keepalive_interval();
        let keepalive_timeout = self.config.keepalive_timeout();
        let renew_interval = self.config.renew_interval();

        let mut last_activity = self.clock.now();
        let mut ping_sent_at: Option<Instant> = None;
        let mut renew_at = credential.renew_deadline(renew_interval);

        loop {
            let liveness_deadline = match ping_sent_at {
                Some(sent) => sent + keepalive_timeout,
                None => last_activity + keepalive_interval,
            };

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return SessionEnd::Shutdown,

                _ = self.reconnect.notified() => {
                    if self.reconnect_pending.swap(false, Ordering::SeqCst) {
                        return SessionEnd::ReconnectRequested;
                    }
                }

                received = connection.next_message() => {
                    let message = match received {
                        Some(Ok(message)) => message,
                        Some(Err(error)) => {
                            return SessionEnd::Failed { stage: FailureStage::Stream, error };
                        }
                        None => {
                            return SessionEnd::Failed {
                                stage: FailureStage::Stream,
                                error: ExchangeError::Disconnected("stream closed by server".to_string()),
                            };
                        }
                    };

                    let now = self.clock.now();
                    last_activity = now;
                    ping_sent_at = None;
                    if message == RawMessage::Pong {
                        continue;
                    }
                    self.touch(now);

                    let item = StreamMessage { message, received_at: now, session_id };
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                        sent = output.send(item) => {
                            if sent.is_err() {
                                return SessionEnd::OutputClosed;
                            }
                        }
                    }
                }

                _ = sleep_until(liveness_deadline) => {
                    if ping_sent_at.is_some() {
                        warn!(account = %self.account, session_id, "Keepalive 응답 없음, 재연결");
                        return SessionEnd::Failed {
                            stage: FailureStage::Stream,
                            error: ExchangeError::Timeout("keepalive timed out".to_string()),
                        };
                    }
                    debug!(account = %self.account, session_id, "Ping 전송");
                    let pinged = tokio::select! {
                        _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                        r = connection.ping() => r,
                    };
                    if let Err(error) = pinged {
                        return SessionEnd::Failed { stage: FailureStage::Stream, error };
                    }
                    ping_sent_at = Some(self.clock.now());
                }

                _ = sleep_until(renew_at) => {
                    self.set_state(SessionState::Renewing);
                    let renewed = tokio::select! {
                        _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                        r = self.authenticator.renew(self.sender.as_ref(), credential) => r,
                    };
                    match renewed {
                        Ok(()) => {
                            self.sink.record(ObservabilityEvent::CredentialRenewed {
                                account: self.account.clone(),
                            });
                            let interval = credential
                                .renew_after
                                .map_or(renew_interval, |d| d.min(renew_interval));
                            renew_at = self.clock.now() + interval;
                            self.set_state(SessionState::Active);
                        }
                        Err(error) => {
                            return SessionEnd::Failed { stage: FailureStage::Renew, error };
                        }
                    }
                }
            }
        }
    }

    /// 연결을 닫고 자격증명을 반납합니다.
    ///
    /// 두 작업은 동시에 진행되며 `close_timeout` 하나의 마감을 공유합니다.
    async fn retire(&self, mut connection: Box<dyn StreamConnection>, credential: &SessionCredential) {
        let deadline = Instant::now() + self.config.close_timeout();
        let ((), closed) = tokio::join!(
            self.release_credential(credential, deadline),
            timeout_at(deadline, connection.close()),
        );
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(account = %self.account, error = %e, "Error while closing stream"),
            Err(_) => debug!(account = %self.account, "Stream close timed out"),
        }
        drop(connection);
    }

    async fn release_credential(&self, credential: &SessionCredential, deadline: Instant) {
        let released = timeout_at(
            deadline,
            self.authenticator.release(self.sender.as_ref(), credential),
        )
        .await;
        let error = match released {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "release timed out".to_string(),
        };
        self.sink.record(ObservabilityEvent::CredentialReleaseFailed {
            account: self.account.clone(),
            error,
        });
    }

    fn record_failure(&self, stage: FailureStage, error: &ExchangeError) {
        let account = self.account.clone();
        let error_text = error.to_string();
        let event = match stage {
            FailureStage::Renew => ObservabilityEvent::RenewalFailed {
                account,
                error: error_text,
            },
            FailureStage::Obtain | FailureStage::Authenticate => ObservabilityEvent::AuthError {
                account,
                error: error_text,
            },
            FailureStage::Connect | FailureStage::Stream if error.is_auth_error() => {
                ObservabilityEvent::AuthError {
                    account,
                    error: error_text,
                }
            }
            FailureStage::Connect | FailureStage::Stream => ObservabilityEvent::TransportError {
                account,
                error: error_text,
            },
        };
        self.sink.record(event);
    }

    fn set_state(&self, state: SessionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.sink.record(ObservabilityEvent::SessionState {
                account: self.account.clone(),
                state: state.as_str(),
            });
        }
    }

    fn touch(&self, now: Instant) {
        *self.last_message.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }
}

impl StreamActivity for StreamSessionManager {
    fn last_message_at(&self) -> Option<Instant> {
        *self.last_message.lock().unwrap_or_else(|e| e.into_inner())
    }
}
