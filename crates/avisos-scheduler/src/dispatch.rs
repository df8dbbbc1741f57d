//! Message dispatch: sends rendered messages through the provider client.
//! Each recipient is attempted independently: bounded timeout per attempt,
//! exponential backoff with jitter between attempts, no cross-recipient blocking.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde::Serialize;

use avisos_core::config::SchedulerConfig;
use avisos_core::error::ProviderError;
use avisos_core::message::OutboundMessage;
use avisos_core::model::{DedupScope, RuleKind};
use avisos_core::traits::DispatchClient;

/// Retry, timeout and pacing knobs for one dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
    pub spacing: Duration,
}

impl DispatchPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff(),
            timeout: config.dispatch_timeout(),
            concurrency: config.per_rule_concurrency.max(1),
            spacing: config.send_spacing(),
        }
    }

    /// Delay before attempt `attempt + 1`: `backoff * 2^(attempt-1)` plus up to 25% jitter.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = base.saturating_mul(1_u64 << exponent);
        let jitter = rand::thread_rng().gen_range(0..=delay / 4);
        Duration::from_millis(delay + jitter)
    }
}

/// Result of delivering to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecipientOutcome {
    Sent {
        recipient_id: String,
        appointment_id: Option<String>,
        message_id: String,
        attempts: u32,
    },
    Failed {
        recipient_id: String,
        appointment_id: Option<String>,
        error: String,
        attempts: u32,
        /// The provider refused the message; resending cannot succeed.
        permanent: bool,
    },
    /// Not attempted (already notified, or filtered out).
    Skipped { recipient_id: String, reason: String },
}

impl RecipientOutcome {
    pub fn recipient_id(&self) -> &str {
        match self {
            RecipientOutcome::Sent { recipient_id, .. }
            | RecipientOutcome::Failed { recipient_id, .. }
            | RecipientOutcome::Skipped { recipient_id, .. } => recipient_id,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, RecipientOutcome::Sent { .. })
    }
}

/// Per-rule delivery report.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub tenant_id: String,
    pub rule_id: String,
    pub rule_kind: RuleKind,
    pub scope: DedupScope,
    pub outcomes: Vec<RecipientOutcome>,
    /// Whether the rule-level `last_fired_at` was advanced.
    pub committed: bool,
}

impl DeliveryReport {
    pub fn new(tenant_id: &str, rule_id: &str, rule_kind: RuleKind, scope: DedupScope) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            rule_id: rule_id.to_string(),
            rule_kind,
            scope,
            outcomes: Vec::new(),
            committed: false,
        }
    }

    pub fn sent(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_sent()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, RecipientOutcome::Failed { .. }))
            .count()
    }

    /// Failures the provider refused outright.
    pub fn permanently_failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, RecipientOutcome::Failed { permanent: true, .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, RecipientOutcome::Skipped { .. }))
            .count()
    }
}

/// Sends messages through one provider client.
pub struct Dispatcher {
    client: Arc<dyn DispatchClient>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn DispatchClient>, policy: DispatchPolicy) -> Self {
        Self { client, policy }
    }

    /// Deliver every message. Outcomes come back in input order.
    pub async fn deliver(&self, messages: Vec<OutboundMessage>) -> Vec<RecipientOutcome> {
        if self.policy.spacing.is_zero() {
            return futures::stream::iter(messages)
                .map(|m| async move { self.deliver_one(&m).await })
                .buffered(self.policy.concurrency)
                .collect()
                .await;
        }

        let mut outcomes = Vec::with_capacity(messages.len());
        for (i, message) in messages.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.policy.spacing).await;
            }
            outcomes.push(self.deliver_one(message).await);
        }
        outcomes
    }

    async fn deliver_one(&self, message: &OutboundMessage) -> RecipientOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.policy.timeout,
                self.client.send(&message.address, message),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.policy.timeout)),
            };

            match result {
                Ok(ack) => {
                    tracing::debug!(
                        "✅ [{}/{}] sent to {} via {} ({})",
                        message.tenant_id,
                        message.rule_id,
                        message.recipient_id,
                        self.client.name(),
                        ack.message_id
                    );
                    return RecipientOutcome::Sent {
                        recipient_id: message.recipient_id.clone(),
                        appointment_id: message.appointment_id.clone(),
                        message_id: ack.message_id,
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.retry_delay(attempt);
                    tracing::warn!(
                        "🔄 [{}/{}] send to {} failed (attempt {}/{}): {e}; retrying in {:?}",
                        message.tenant_id,
                        message.rule_id,
                        message.recipient_id,
                        attempt,
                        self.policy.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "❌ [{}/{}] send to {} failed permanently after {} attempt(s): {e}",
                        message.tenant_id,
                        message.rule_id,
                        message.recipient_id,
                        attempt
                    );
                    return RecipientOutcome::Failed {
                        recipient_id: message.recipient_id.clone(),
                        appointment_id: message.appointment_id.clone(),
                        error: e.to_string(),
                        attempts: attempt,
                        permanent: !e.is_retryable(),
                    };
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeClient;
    use super::*;
    use avisos_core::message::MessageBody;
    use uuid::Uuid;

    fn policy() -> DispatchPolicy {
        DispatchPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
            concurrency: 4,
            spacing: Duration::ZERO,
        }
    }

    fn message(address: &str) -> OutboundMessage {
        OutboundMessage {
            correlation_id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            rule_id: "recordatorio".into(),
            rule_kind: RuleKind::Reminder,
            scope: DedupScope::Automatic,
            recipient_id: format!("c-{address}"),
            recipient_name: "Ana".into(),
            address: address.into(),
            appointment_id: Some("t1".into()),
            sender_id: None,
            body: MessageBody::Text { text: "hola".into() },
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let client = Arc::new(FakeClient::default());
        client.fail(
            "111",
            vec![
                ProviderError::Network("reset".into()),
                ProviderError::Rejected {
                    status: 503,
                    body: String::new(),
                },
            ],
        );
        let dispatcher = Dispatcher::new(client.clone(), policy());
        let outcomes = dispatcher.deliver(vec![message("111")]).await;
        assert!(matches!(outcomes[0], RecipientOutcome::Sent { attempts: 3, .. }));
        assert_eq!(client.count(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_block_siblings() {
        let client = Arc::new(FakeClient::default());
        client.fail(
            "222",
            vec![ProviderError::Rejected {
                status: 400,
                body: "invalid number".into(),
            }],
        );
        let dispatcher = Dispatcher::new(client.clone(), policy());
        let outcomes = dispatcher
            .deliver(vec![message("111"), message("222"), message("333")])
            .await;
        assert!(outcomes[0].is_sent());
        assert!(matches!(
            outcomes[1],
            RecipientOutcome::Failed {
                attempts: 1,
                permanent: true,
                ..
            }
        ));
        assert!(outcomes[2].is_sent());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let client = Arc::new(FakeClient::default());
        client.fail("111", vec![ProviderError::Network("down".into()); 5]);
        let dispatcher = Dispatcher::new(client.clone(), policy());
        let outcomes = dispatcher.deliver(vec![message("111")]).await;
        assert!(matches!(
            outcomes[0],
            RecipientOutcome::Failed {
                attempts: 3,
                permanent: false,
                ..
            }
        ));
        assert_eq!(client.count(), 0);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_slow_send_times_out() {
        let client = Arc::new(FakeClient {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let mut p = policy();
        p.max_attempts = 1;
        p.timeout = Duration::from_millis(20);
        let dispatcher = Dispatcher::new(client, p);
        let outcomes = dispatcher.deliver(vec![message("111")]).await;
        let RecipientOutcome::Failed { error, .. } = &outcomes[0] else {
            panic!("expected failure");
        };
        assert!(error.contains("timed out"));
    }

    #[test]
    fn test_retry_delay_grows() {
        let p = DispatchPolicy {
            backoff: Duration::from_millis(100),
            ..policy()
        };
        let first = p.retry_delay(1);
        let third = p.retry_delay(3);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
    }
}
