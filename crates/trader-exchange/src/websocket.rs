//! WebSocket 스트림 전송 계층.
//!
//! 자격증명이 URL에 포함되는 방식(`wss://host/ws/{credential}`)과
//! 연결 후 로그인 메시지를 보내는 방식을 모두 지원합니다.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::traits::{
    ExchangeResult, RawMessage, SessionCredential, StreamConnection, StreamConnector,
};
use crate::ExchangeError;

/// URL/로그인 템플릿의 자격증명 자리표시자.
pub const CREDENTIAL_PLACEHOLDER: &str = "{credential}";

/// 기본 연결 타임아웃.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// WebSocket 연결 생성기.
#[derive(Debug, Clone)]
pub struct WsStreamConnector {
    url_template: String,
    login_template: Option<String>,
    connect_timeout: Duration,
}

impl WsStreamConnector {
    /// URL 템플릿으로 생성합니다. `{credential}`은 자격증명으로 치환됩니다.
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            login_template: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// 연결 직후 보낼 로그인 메시지 템플릿을 설정합니다.
    pub fn with_login_message(mut self, template: impl Into<String>) -> Self {
        self.login_template = Some(template.into());
        self
    }

    /// 연결 타임아웃을 설정합니다.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// 자격증명이 적용된 URL.
    pub fn url_for(&self, credential: &SessionCredential) -> String {
        self.url_template
            .replace(CREDENTIAL_PLACEHOLDER, credential.expose())
    }

    /// 자격증명 없이 로그에 남길 수 있는 URL.
    fn redacted_url(&self) -> String {
        self.url_template.replace(CREDENTIAL_PLACEHOLDER, "***")
    }
}

#[async_trait]
impl StreamConnector for WsStreamConnector {
    async fn connect(
        &self,
        credential: &SessionCredential,
    ) -> ExchangeResult<Box<dyn StreamConnection>> {
        info!("WebSocket 연결 중: {}", self.redacted_url());

        let url = self.url_for(credential);
        let (stream, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ExchangeError::Timeout(format!("WebSocket 연결 타임아웃: {}", self.redacted_url())))??;

        debug!("WebSocket 연결 성공");
        Ok(Box::new(WsConnection {
            stream,
            login_template: self.login_template.clone(),
        }))
    }
}

/// 열린 WebSocket 연결.
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    login_template: Option<String>,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn next_message(&mut self) -> Option<ExchangeResult<RawMessage>> {
        loop {
            // Ping에 대한 Pong은 tungstenite가 다음 읽기/쓰기 때 자동으로 전송
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(RawMessage::Text(text))),
                Ok(Message::Binary(data)) => return Some(Ok(RawMessage::Binary(data))),
                Ok(Message::Pong(_)) => return Some(Ok(RawMessage::Pong)),
                Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    warn!("서버에서 연결 종료 요청: {:?}", frame);
                    return None;
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn ping(&mut self) -> ExchangeResult<()> {
        self.stream.send(Message::Ping(vec![])).await?;
        Ok(())
    }

    async fn authenticate(&mut self, credential: &SessionCredential) -> ExchangeResult<()> {
        let Some(template) = &self.login_template else {
            return Ok(());
        };
        let login = template.replace(CREDENTIAL_PLACEHOLDER, credential.expose());
        self.stream.send(Message::Text(login)).await?;
        debug!("로그인 메시지 전송");
        Ok(())
    }

    async fn close(&mut self) -> ExchangeResult<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
