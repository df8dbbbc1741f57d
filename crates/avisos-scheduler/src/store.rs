//! In-memory configuration and booking store.
//!
//! Same conditional-write semantics as the SQLite store; used by tests and
//! for dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use avisos_core::document;
use avisos_core::error::{AvisosError, Result};
use avisos_core::model::{Agent, Appointment, NotificationConfig, Receipt};
use avisos_core::traits::{BookingStore, ConfigField, ConfigSnapshot, ConfigStore};

/// Overlay committed fire state on a freshly parsed config.
pub(crate) fn apply_fire_state(
    config: &mut NotificationConfig,
    fire_state: impl IntoIterator<Item = (String, DateTime<Utc>)>,
) {
    for (rule_id, fired_at) in fire_state {
        if let Some(rule) = config.rule_mut(&rule_id) {
            rule.last_fired_at = Some(fired_at);
        }
    }
}

/// Conditional-write check shared by both stores: `current` must equal
/// `expected` and `fired_at` must be strictly later.
pub(crate) fn fire_state_accepts(
    current: Option<DateTime<Utc>>,
    expected: Option<DateTime<Utc>>,
    fired_at: DateTime<Utc>,
) -> bool {
    current == expected && current.is_none_or(|c| fired_at > c)
}

#[derive(Default)]
struct Inner {
    documents: HashMap<String, Value>,
    fire_state: HashMap<(String, String), DateTime<Utc>>,
    agents: Vec<Agent>,
    appointments: HashMap<String, Appointment>,
    unavailable: bool,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(AvisosError::resolution("store unavailable"));
        }
        Ok(())
    }

    fn load(
        &self,
        tenant_id: &str,
        doc: &Value,
    ) -> std::result::Result<NotificationConfig, avisos_core::ConfigurationError> {
        let mut config = NotificationConfig::from_document(doc)?;
        apply_fire_state(
            &mut config,
            self.fire_state
                .iter()
                .filter(|((t, _), _)| t == tenant_id)
                .map(|((_, r), at)| (r.clone(), *at)),
        );
        Ok(config)
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_agent(&self, agent: Agent) {
        let mut inner = self.inner.lock().await;
        inner.agents.retain(|a| a.id != agent.id || a.tenant_id != agent.tenant_id);
        inner.agents.push(agent);
    }

    pub async fn add_appointment(&self, appointment: Appointment) {
        self.inner
            .lock()
            .await
            .appointments
            .insert(appointment.id.clone(), appointment);
    }

    pub async fn appointment(&self, id: &str) -> Option<Appointment> {
        self.inner.lock().await.appointments.get(id).cloned()
    }

    /// Simulate an unreachable backend: every read fails with a resolution error.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_config(&self, tenant_id: &str) -> Result<Option<NotificationConfig>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        match inner.documents.get(tenant_id) {
            None => Ok(None),
            Some(doc) => Ok(Some(inner.load(tenant_id, doc)?)),
        }
    }

    async fn all_configs(&self) -> Result<Vec<ConfigSnapshot>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let mut tenants: Vec<&String> = inner.documents.keys().collect();
        tenants.sort();
        Ok(tenants
            .into_iter()
            .map(|tenant_id| ConfigSnapshot {
                tenant_id: tenant_id.clone(),
                config: inner.load(tenant_id, &inner.documents[tenant_id]),
            })
            .collect())
    }

    async fn set_last_fired(
        &self,
        tenant_id: &str,
        rule_id: &str,
        expected: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let key = (tenant_id.to_string(), rule_id.to_string());
        let current = match inner.fire_state.get(&key) {
            Some(at) => Some(*at),
            // Fall back to a value seeded in the document itself.
            None => inner
                .documents
                .get(tenant_id)
                .and_then(|doc| NotificationConfig::from_document(doc).ok())
                .and_then(|c| c.rule(rule_id).and_then(|r| r.last_fired_at)),
        };
        if !fire_state_accepts(current, expected, fired_at) {
            return Ok(false);
        }
        inner.fire_state.insert(key, fired_at);
        Ok(true)
    }

    async fn clear_field(&self, tenant_id: &str, field: &ConfigField) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let doc = inner
            .documents
            .get_mut(tenant_id)
            .ok_or_else(|| AvisosError::store(format!("unknown tenant '{tenant_id}'")))?;
        document::clear_field(doc, field)?;
        if matches!(field, ConfigField::DailyAgentRule) {
            let key = (
                tenant_id.to_string(),
                avisos_core::model::DAILY_AGENT_RULE_ID.to_string(),
            );
            inner.fire_state.remove(&key);
        }
        Ok(())
    }

    async fn put_document(&self, doc: &Value) -> Result<String> {
        let config = NotificationConfig::from_document(doc)?;
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.documents.insert(config.tenant_id.clone(), doc.clone());
        Ok(config.tenant_id)
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn active_agents(&self, tenant_id: &str) -> Result<Vec<Agent>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner
            .agents
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.active)
            .cloned()
            .collect())
    }

    async fn appointments_between(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let mut found: Vec<Appointment> = inner
            .appointments
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.start_time >= from && a.start_time < to)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn record_receipt(&self, appointment_id: &str, receipt: &Receipt) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let appt = inner
            .appointments
            .get_mut(appointment_id)
            .ok_or_else(|| AvisosError::store(format!("unknown appointment '{appointment_id}'")))?;
        Ok(appt.upsert_receipt(receipt.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avisos_core::model::{AppointmentStatus, DedupScope, RuleKind};
    use chrono::TimeZone;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "tenant_id": "acme",
            "daily_agent_rule": {
                "kind": "digest",
                "recipients": {"type": "all_agents"},
                "schedule": {"type": "fixed_time_of_day", "at": "09:00"},
                "message": {"type": "free_text", "text": "Hola {agente}"}
            }
        })
    }

    #[tokio::test]
    async fn test_conditional_last_fired() {
        let store = MemoryStore::new();
        store.put_document(&doc()).await.unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();

        assert!(store.set_last_fired("acme", "daily_agents", None, t1).await.unwrap());
        // Stale expectation loses.
        assert!(!store.set_last_fired("acme", "daily_agents", None, t2).await.unwrap());
        // Never backward.
        assert!(!store.set_last_fired("acme", "daily_agents", Some(t1), t1).await.unwrap());
        assert!(store.set_last_fired("acme", "daily_agents", Some(t1), t2).await.unwrap());

        let config = store.get_config("acme").await.unwrap().unwrap();
        assert_eq!(config.daily_agent_rule.unwrap().last_fired_at, Some(t2));
    }

    #[tokio::test]
    async fn test_put_document_validates_tenant() {
        let store = MemoryStore::new();
        assert!(store.put_document(&json!({"rules": []})).await.is_err());
        assert_eq!(store.put_document(&doc()).await.unwrap(), "acme");
        assert!(store.get_config("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receipts_insert_once() {
        let store = MemoryStore::new();
        store
            .add_appointment(Appointment {
                id: "t1".into(),
                tenant_id: "acme".into(),
                start_time: Utc::now(),
                status: AppointmentStatus::Pending,
                agent_id: None,
                client: None,
                guests: vec![],
                details: Default::default(),
                receipts: vec![],
            })
            .await;
        let rejected = Receipt::rejected(
            RuleKind::Reminder,
            "c1",
            DedupScope::Automatic,
            Utc::now(),
            "provider rejected message (400)",
        );
        let receipt = Receipt::sent(
            RuleKind::Reminder,
            "c1",
            DedupScope::Automatic,
            Utc::now(),
            Some("wamid.1".into()),
        );
        assert!(store.record_receipt("t1", &rejected).await.unwrap());
        assert!(store.record_receipt("t1", &receipt).await.unwrap());
        assert!(!store.record_receipt("t1", &receipt).await.unwrap());
        assert!(!store.record_receipt("t1", &rejected).await.unwrap());
        let receipts = store.appointment("t1").await.unwrap().receipts;
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].message_id.as_deref(), Some("wamid.1"));
    }

    #[tokio::test]
    async fn test_clear_daily_rule() {
        let store = MemoryStore::new();
        store.put_document(&doc()).await.unwrap();
        store
            .clear_field("acme", &ConfigField::DailyAgentRule)
            .await
            .unwrap();
        let config = store.get_config("acme").await.unwrap().unwrap();
        assert!(config.daily_agent_rule.is_none());
    }
}
