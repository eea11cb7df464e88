//! 거래소 경계 trait 정의.
//!
//! 코어는 거래소별 서명, 페이로드 형식, 메시지 스키마를 알지 못합니다.
//! 대신 아래 trait으로 요청을 보내고, 원시 스트림 메시지를 받고, 이를 정규화합니다.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use trader_core::{NormalizedEvent, Order, OrderParams, OrderStatusReport};

use crate::ExchangeError;

/// 거래소 작업을 위한 Result 타입.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

// ==================== 요청 ====================

/// HTTP 메서드.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// 거래소 요청 명세.
///
/// `limit_id`와 `weight`는 요청 한도 관리에 사용됩니다.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    /// HTTP 메서드
    pub method: HttpMethod,
    /// 기본 URL 기준 경로
    pub path: String,
    /// 엔드포인트 분류 (요청 한도 키)
    pub limit_id: String,
    /// 요청 가중치
    pub weight: u32,
    /// 쿼리 파라미터
    pub query: Vec<(String, String)>,
    /// 추가 헤더
    pub headers: Vec<(String, String)>,
    /// JSON 본문
    pub body: Option<serde_json::Value>,
}

impl RequestSpec {
    /// 새 요청을 생성합니다. `limit_id`는 경로와 같고 가중치는 1입니다.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method,
            limit_id: path.clone(),
            path,
            weight: 1,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// GET 요청.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    /// POST 요청.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    /// PUT 요청.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    /// DELETE 요청.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    /// 엔드포인트 분류를 설정합니다.
    pub fn with_limit_id(mut self, limit_id: impl Into<String>) -> Self {
        self.limit_id = limit_id.into();
        self
    }

    /// 가중치를 설정합니다.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// 쿼리 파라미터를 추가합니다.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// 헤더를 추가합니다.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// JSON 본문을 설정합니다.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// 성공한 요청의 응답.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP 상태 코드
    pub status: u16,
    /// JSON 본문 (본문이 없으면 `Null`)
    pub body: serde_json::Value,
}

impl ApiResponse {
    /// 200 응답을 생성합니다.
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    /// 본문을 역직렬화합니다.
    pub fn json<T: DeserializeOwned>(&self) -> ExchangeResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// 본문의 문자열 필드를 읽습니다.
    pub fn str_field(&self, name: &str) -> ExchangeResult<&str> {
        self.body
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::Parse(format!("missing string field '{}'", name)))
    }
}

/// 요청 전송 계층.
///
/// 서명과 페이로드 형식은 구현체의 책임입니다. 실패 시 `ExchangeError::Request`로
/// 상태 코드와 분류(일시적/거부/없음)를 전달합니다.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// 요청을 전송합니다.
    async fn send_request(&self, spec: RequestSpec) -> ExchangeResult<ApiResponse>;
}

// ==================== 스트림 ====================

/// 스트림에서 받은 원시 메시지.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    /// 텍스트 프레임
    Text(String),
    /// 바이너리 프레임
    Binary(Vec<u8>),
    /// ping 응답
    Pong,
}

impl RawMessage {
    /// 텍스트 내용 (바이너리는 UTF-8일 때만).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawMessage::Text(s) => Some(s),
            RawMessage::Binary(b) => std::str::from_utf8(b).ok(),
            RawMessage::Pong => None,
        }
    }

    /// JSON으로 파싱합니다.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        self.as_text().and_then(|s| serde_json::from_str(s).ok())
    }
}

/// 스트림 세션 자격증명 (listen key, 세션 토큰 등).
#[derive(Clone)]
pub struct SessionCredential {
    token: Arc<SecretString>,
    /// 발급 시각
    pub obtained_at: Instant,
    /// 거래소가 지정한 갱신 주기 (없으면 설정값 사용)
    pub renew_after: Option<Duration>,
}

impl SessionCredential {
    /// 새 자격증명을 생성합니다.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(SecretString::from(token.into())),
            obtained_at: Instant::now(),
            renew_after: None,
        }
    }

    /// 갱신 주기를 설정합니다.
    pub fn with_renew_after(mut self, renew_after: Duration) -> Self {
        self.renew_after = Some(renew_after);
        self
    }

    /// 토큰 원문.
    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }

    /// 다음 갱신 기한.
    pub fn renew_deadline(&self, default_interval: Duration) -> Instant {
        let interval = self
            .renew_after
            .map_or(default_interval, |d| d.min(default_interval));
        self.obtained_at + interval
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &"[REDACTED]")
            .field("renew_after", &self.renew_after)
            .finish()
    }
}

/// 스트림 자격증명의 발급/갱신/반납.
///
/// 세션 관리자는 요청 한도를 거치는 `sender`를 전달합니다.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    /// 새 자격증명을 발급받습니다.
    async fn obtain(&self, sender: &dyn RequestSender) -> ExchangeResult<SessionCredential>;

    /// 자격증명을 갱신합니다. 실패하면 세션을 새로 만듭니다.
    async fn renew(
        &self,
        sender: &dyn RequestSender,
        credential: &SessionCredential,
    ) -> ExchangeResult<()>;

    /// 자격증명을 반납합니다. 실패는 무시됩니다.
    async fn release(
        &self,
        sender: &dyn RequestSender,
        credential: &SessionCredential,
    ) -> ExchangeResult<()>;
}

/// 열린 스트림 연결.
#[async_trait]
pub trait StreamConnection: Send {
    /// 다음 메시지를 기다립니다. 연결이 닫히면 `None`.
    ///
    /// 취소 안전해야 합니다: 반환 전에 future가 drop되어도 메시지를 잃지 않아야 합니다.
    async fn next_message(&mut self) -> Option<ExchangeResult<RawMessage>>;

    /// keepalive ping을 전송합니다.
    async fn ping(&mut self) -> ExchangeResult<()>;

    /// 전송 계층 인증 (로그인 메시지 등). 기본은 아무것도 하지 않습니다.
    async fn authenticate(&mut self, _credential: &SessionCredential) -> ExchangeResult<()> {
        Ok(())
    }

    /// 연결을 닫습니다.
    async fn close(&mut self) -> ExchangeResult<()>;
}

/// 스트림 연결 생성기.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// 자격증명으로 새 연결을 엽니다.
    async fn connect(
        &self,
        credential: &SessionCredential,
    ) -> ExchangeResult<Box<dyn StreamConnection>>;
}

/// 원시 메시지를 정규화 이벤트로 변환합니다.
///
/// 관련 없거나 해석할 수 없는 메시지는 `None`을 반환합니다.
pub trait EventParser: Send + Sync {
    /// 메시지를 변환합니다.
    fn parse_event(&self, message: &RawMessage) -> Option<NormalizedEvent>;
}

// ==================== 주문 요청 ====================

/// 거래소별 주문 요청 생성과 응답 해석.
pub trait OrderCodec: Send + Sync {
    /// 주문 생성 요청.
    fn create_request(&self, client_order_id: &str, params: &OrderParams) -> RequestSpec;

    /// 생성 응답에서 거래소 주문 ID를 읽습니다.
    fn parse_create_response(&self, response: &ApiResponse) -> ExchangeResult<String>;

    /// 주문 취소 요청.
    fn cancel_request(&self, order: &Order) -> RequestSpec;

    /// 단건 상태 조회 요청.
    fn status_request(&self, order: &Order) -> RequestSpec;

    /// 단건 상태 응답을 해석합니다.
    fn parse_status_response(&self, response: &ApiResponse) -> ExchangeResult<OrderStatusReport>;

    /// 미체결 주문 일괄 조회 요청. 지원하지 않으면 `None`.
    fn open_orders_request(&self) -> Option<RequestSpec> {
        None
    }

    /// 일괄 조회 응답을 해석합니다.
    fn parse_open_orders_response(
        &self,
        _response: &ApiResponse,
    ) -> ExchangeResult<Vec<OrderStatusReport>> {
        Err(ExchangeError::NotSupported("open orders query".to_string()))
    }
}
