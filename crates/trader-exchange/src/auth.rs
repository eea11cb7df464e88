//! Listen key 방식 스트림 인증.
//!
//! 처리 기능:
//! - listen key 발급 (POST)
//! - listen key 유지 (PUT, 주기적 호출)
//! - listen key 반납 (DELETE)
//!
//! 모든 요청은 세션 관리자가 넘겨주는 요청 한도 전송기를 통해 나갑니다.
//! 서명이 필요한 헤더(API 키 등)는 생성 시 지정합니다.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RequestErrorKind;
use crate::traits::{
    ApiResponse, ExchangeResult, RequestSender, RequestSpec, SessionAuthenticator,
    SessionCredential,
};
use crate::ExchangeError;

/// 기본 listen key 필드 이름.
const DEFAULT_KEY_FIELD: &str = "listenKey";

/// Listen key 인증기.
#[derive(Debug, Clone)]
pub struct ListenKeyAuthenticator {
    path: String,
    limit_id: String,
    weight: u32,
    key_field: String,
    headers: Vec<(String, String)>,
    renew_after: Option<Duration>,
}

impl ListenKeyAuthenticator {
    /// 경로를 지정해 생성합니다. 발급/유지/반납 모두 같은 경로를 사용합니다.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            limit_id: path.clone(),
            path,
            weight: 1,
            key_field: DEFAULT_KEY_FIELD.to_string(),
            headers: Vec::new(),
            renew_after: None,
        }
    }

    /// 요청 한도 분류와 가중치를 설정합니다.
    pub fn with_limit(mut self, limit_id: impl Into<String>, weight: u32) -> Self {
        self.limit_id = limit_id.into();
        self.weight = weight;
        self
    }

    /// 응답/쿼리에서 사용할 키 필드 이름을 설정합니다.
    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    /// 모든 요청에 붙일 헤더를 추가합니다.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// 거래소가 요구하는 갱신 주기를 설정합니다.
    pub fn with_renew_after(mut self, renew_after: Duration) -> Self {
        self.renew_after = Some(renew_after);
        self
    }

    fn request(&self, spec: RequestSpec) -> RequestSpec {
        let spec = spec.with_limit_id(self.limit_id.clone()).with_weight(self.weight);
        self.headers
            .iter()
            .fold(spec, |spec, (k, v)| spec.with_header(k.clone(), v.clone()))
    }

    fn keyed(&self, spec: RequestSpec, credential: &SessionCredential) -> RequestSpec {
        self.request(spec)
            .with_query(self.key_field.clone(), credential.expose().to_string())
    }

    /// 유지 응답에 에러 코드가 있으면 실패로 처리합니다.
    fn check_renew_response(&self, response: &ApiResponse) -> ExchangeResult<()> {
        match response.body.get("code") {
            Some(code) if !code.is_null() => Err(ExchangeError::Request {
                status: response.status,
                body: response.body.to_string(),
                kind: RequestErrorKind::Rejected,
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SessionAuthenticator for ListenKeyAuthenticator {
    async fn obtain(&self, sender: &dyn RequestSender) -> ExchangeResult<SessionCredential> {
        let response = sender
            .send_request(self.request(RequestSpec::post(self.path.clone())))
            .await?;
        let key = response.str_field(&self.key_field)?;
        if key.is_empty() {
            return Err(ExchangeError::Unauthorized("empty listen key".to_string()));
        }
        debug!(path = %self.path, "Obtained listen key");

        let credential = SessionCredential::new(key);
        Ok(match self.renew_after {
            Some(d) => credential.with_renew_after(d),
            None => credential,
        })
    }

    async fn renew(
        &self,
        sender: &dyn RequestSender,
        credential: &SessionCredential,
    ) -> ExchangeResult<()> {
        let response = sender
            .send_request(self.keyed(RequestSpec::put(self.path.clone()), credential))
            .await?;
        if let Err(e) = self.check_renew_response(&response) {
            warn!(path = %self.path, error = %e, "Failed to refresh listen key");
            return Err(e);
        }
        debug!(path = %self.path, "Refreshed listen key");
        Ok(())
    }

    async fn release(
        &self,
        sender: &dyn RequestSender,
        credential: &SessionCredential,
    ) -> ExchangeResult<()> {
        sender
            .send_request(self.keyed(RequestSpec::delete(self.path.clone()), credential))
            .await?;
        debug!(path = %self.path, "Released listen key");
        Ok(())
    }
}
