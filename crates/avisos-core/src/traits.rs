//! Boundary traits: the configuration store, the booking read-model, the
//! provider's template catalog and its send API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{ConfigurationError, ProviderError, Result};
use crate::message::{DeliveryAck, OutboundMessage, TemplateDefinition};
use crate::model::{Agent, Appointment, NotificationConfig, Receipt};

/// One tenant's configuration as read in a snapshot: either loaded, or rejected
/// at the load boundary.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub tenant_id: String,
    pub config: std::result::Result<NotificationConfig, ConfigurationError>,
}

/// Named fields that administrative tooling may clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigField {
    /// Remove the daily agent rule entirely.
    DailyAgentRule,
    /// Blank a free-text rule's message, leaving it in "template only" state.
    RuleMessageText { rule_id: String },
    /// Fall back to the engine's default sender.
    SenderId,
}

/// Persisted per-tenant notification configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load and validate one tenant. `Ok(None)` when the tenant has no document.
    async fn get_config(&self, tenant_id: &str) -> Result<Option<NotificationConfig>>;

    /// Snapshot of every tenant.
    async fn all_configs(&self) -> Result<Vec<ConfigSnapshot>>;

    /// Conditional write of a rule's `last_fired_at`.
    ///
    /// Succeeds only if the stored value still equals `expected` and `fired_at`
    /// does not move it backward. Returns `false` when another writer won.
    async fn set_last_fired(
        &self,
        tenant_id: &str,
        rule_id: &str,
        expected: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn clear_field(&self, tenant_id: &str, field: &ConfigField) -> Result<()>;

    /// Insert or replace a raw document. Returns the tenant id it was stored under.
    async fn put_document(&self, document: &Value) -> Result<String>;
}

/// Read access to the booking subsystem, plus receipt writes.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn active_agents(&self, tenant_id: &str) -> Result<Vec<Agent>>;

    /// Appointments with `from <= start_time < to`.
    async fn appointments_between(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>>;

    /// Insert-if-absent. Returns `false` when an equal receipt already exists.
    async fn record_receipt(&self, appointment_id: &str, receipt: &Receipt) -> Result<bool>;
}

/// Provider registry of approved templates.
#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn template_definition(
        &self,
        name: &str,
        language: &str,
    ) -> Result<Option<TemplateDefinition>>;
}

/// Provider send API.
#[async_trait]
pub trait DispatchClient: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        address: &str,
        message: &OutboundMessage,
    ) -> std::result::Result<DeliveryAck, ProviderError>;
}
