//! 관측 이벤트 싱크.
//!
//! 재연결, 인증 실패, 정합성 충돌, 분실 주문처럼 호출자에게 에러로 전달하지 않는
//! 상황을 기록합니다. 각 구성요소는 생성 시 `Arc<dyn EventSink>`를 주입받습니다.
//!
//! 제공 구현:
//! - [`TracingSink`] - tracing 로그로 출력 (기본값)
//! - [`MemorySink`] - 이벤트를 메모리에 보관 (테스트/진단용)

use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 관측 이벤트.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservabilityEvent {
    /// 세션 상태 전이
    SessionState { account: String, state: &'static str },
    /// 연결/읽기/쓰기 실패
    TransportError { account: String, error: String },
    /// 자격증명 발급 또는 전송 계층 인증 실패
    AuthError { account: String, error: String },
    /// 재연결 예약
    ReconnectScheduled {
        account: String,
        attempt: u32,
        delay: Duration,
    },
    /// 자격증명 갱신 성공
    CredentialRenewed { account: String },
    /// 자격증명 갱신 실패 (세션 폐기)
    RenewalFailed { account: String, error: String },
    /// 자격증명 반납 실패
    CredentialReleaseFailed { account: String, error: String },
    /// 스트림/스냅샷 내용 충돌
    ReconciliationConflict {
        client_order_id: String,
        detail: String,
    },
    /// 분실 주문 처리
    LostOrder {
        client_order_id: String,
        not_found_count: u32,
    },
    /// 추적하지 않는 주문에 대한 이벤트
    UnknownOrder { order: String, event_kind: &'static str },
    /// 폴링 요청 실패
    PollFailed { account: String, error: String },
}

impl ObservabilityEvent {
    /// 이벤트 종류 이름.
    pub fn name(&self) -> &'static str {
        match self {
            ObservabilityEvent::SessionState { .. } => "session_state",
            ObservabilityEvent::TransportError { .. } => "transport_error",
            ObservabilityEvent::AuthError { .. } => "auth_error",
            ObservabilityEvent::ReconnectScheduled { .. } => "reconnect_scheduled",
            ObservabilityEvent::CredentialRenewed { .. } => "credential_renewed",
            ObservabilityEvent::RenewalFailed { .. } => "renewal_failed",
            ObservabilityEvent::CredentialReleaseFailed { .. } => "credential_release_failed",
            ObservabilityEvent::ReconciliationConflict { .. } => "reconciliation_conflict",
            ObservabilityEvent::LostOrder { .. } => "lost_order",
            ObservabilityEvent::UnknownOrder { .. } => "unknown_order",
            ObservabilityEvent::PollFailed { .. } => "poll_failed",
        }
    }
}

/// 관측 이벤트 수신자.
pub trait EventSink: Send + Sync {
    /// 이벤트를 기록합니다. 호출자를 블로킹해서는 안 됩니다.
    fn record(&self, event: ObservabilityEvent);
}

/// tracing 로그로 출력하는 싱크.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ObservabilityEvent) {
        match event {
            ObservabilityEvent::SessionState { account, state } => {
                debug!(account = %account, state, "Stream session state changed");
            }
            ObservabilityEvent::TransportError { account, error } => {
                warn!(account = %account, error = %error, "Stream transport error");
            }
            ObservabilityEvent::AuthError { account, error } => {
                warn!(account = %account, error = %error, "Stream authentication failed");
            }
            ObservabilityEvent::ReconnectScheduled {
                account,
                attempt,
                delay,
            } => {
                info!(
                    account = %account,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting stream after backoff"
                );
            }
            ObservabilityEvent::CredentialRenewed { account } => {
                debug!(account = %account, "Session credential renewed");
            }
            ObservabilityEvent::RenewalFailed { account, error } => {
                warn!(account = %account, error = %error, "Session credential renewal failed, dropping session");
            }
            ObservabilityEvent::CredentialReleaseFailed { account, error } => {
                debug!(account = %account, error = %error, "Failed to release session credential");
            }
            ObservabilityEvent::ReconciliationConflict {
                client_order_id,
                detail,
            } => {
                warn!(client_order_id = %client_order_id, detail = %detail, "Reconciliation conflict");
            }
            ObservabilityEvent::LostOrder {
                client_order_id,
                not_found_count,
            } => {
                error!(client_order_id = %client_order_id, not_found_count, "Order lost, marking as failed");
            }
            ObservabilityEvent::UnknownOrder { order, event_kind } => {
                debug!(order = %order, event_kind, "Event for untracked order ignored");
            }
            ObservabilityEvent::PollFailed { account, error } => {
                warn!(account = %account, error = %error, "Order status poll failed, retrying next cycle");
            }
        }
    }
}

/// 이벤트를 메모리에 보관하는 싱크.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl MemorySink {
    /// 빈 싱크를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 기록된 이벤트 사본.
    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 주어진 종류의 이벤트 수.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    /// 기록을 비웁니다.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: ObservabilityEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemorySink::new();
        sink.record(ObservabilityEvent::LostOrder {
            client_order_id: "c1".to_string(),
            not_found_count: 3,
        });
        sink.record(ObservabilityEvent::PollFailed {
            account: "main".to_string(),
            error: "timeout".to_string(),
        });
        sink.record(ObservabilityEvent::LostOrder {
            client_order_id: "c2".to_string(),
            not_found_count: 3,
        });

        assert_eq!(sink.count("lost_order"), 2);
        assert_eq!(sink.count("poll_failed"), 1);
        assert_eq!(sink.events().len(), 3);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_tracing_sink_accepts_all_events() {
        let sink = TracingSink;
        sink.record(ObservabilityEvent::ReconnectScheduled {
            account: "main".to_string(),
            attempt: 2,
            delay: Duration::from_secs(2),
        });
        sink.record(ObservabilityEvent::SessionState {
            account: "main".to_string(),
            state: "active",
        });
    }
}
