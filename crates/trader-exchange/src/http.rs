//! reqwest 기반 REST 요청 전송기.

use async_trait::async_trait;
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::traits::{ApiResponse, ExchangeResult, HttpMethod, RequestSender, RequestSpec};
use crate::ExchangeError;

/// 기본 요청 타임아웃 (초).
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// REST 요청 전송기.
///
/// 거래소별 서명은 하지 않습니다. API 키처럼 모든 요청에 붙는 헤더만 관리합니다.
pub struct HttpRequestSender {
    client: Client,
    base_url: String,
    default_headers: Vec<(String, SecretString)>,
}

impl fmt::Debug for HttpRequestSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.default_headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("HttpRequestSender")
            .field("base_url", &self.base_url)
            .field("default_headers", &header_names)
            .finish()
    }
}

impl HttpRequestSender {
    /// 기본 타임아웃으로 생성합니다.
    pub fn new(base_url: impl Into<String>) -> ExchangeResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// 요청 타임아웃을 지정해 생성합니다.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_headers: Vec::new(),
        })
    }

    /// 모든 요청에 붙는 헤더를 추가합니다. 값은 로그에 노출되지 않습니다.
    pub fn with_default_header(mut self, name: impl Into<String>, value: SecretString) -> Self {
        self.default_headers.push((name.into(), value));
        self
    }

    /// 기본 URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[async_trait]
impl RequestSender for HttpRequestSender {
    async fn send_request(&self, spec: RequestSpec) -> ExchangeResult<ApiResponse> {
        let url = format!("{}{}", self.base_url, spec.path);
        debug!(method = %spec.method, path = %spec.path, limit_id = %spec.limit_id, "Sending request");

        let mut request = self.client.request(Self::method(spec.method), &url);
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        for (name, value) in &self.default_headers {
            request = request.header(name.as_str(), value.expose_secret());
        }
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        if !(200..300).contains(&status) {
            warn!(status, path = %spec.path, body = %text, "Request failed");
            return Err(ExchangeError::request(status, text));
        }

        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        Ok(ApiResponse { status, body })
    }
}
