//! Recipients and outbound messages: what flows from resolution to dispatch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{DedupScope, ParameterKind, Receipt, RuleKind};

/// Variables available to a message template, keyed by binding name.
pub type RenderContext = BTreeMap<String, String>;

/// A concrete, contactable recipient plus everything needed to render its message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Agent or contact id.
    pub id: String,
    pub name: String,
    /// Normalized phone number.
    pub address: String,
    /// Set for per-appointment recipients; receipts attach to this appointment.
    pub appointment_id: Option<String>,
    pub context: RenderContext,
    /// Receipts already attached to the appointment when it was read.
    #[serde(default)]
    pub prior_receipts: Vec<Receipt>,
}

/// Provider-side template definition, as approved in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    pub language: String,
    /// Ordered parameter kinds the template body expects.
    pub parameters: Vec<ParameterKind>,
}

/// A template parameter with its value bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundParameter {
    pub kind: ParameterKind,
    pub value: String,
}

/// Rendered payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    Template {
        name: String,
        language: String,
        parameters: Vec<BoundParameter>,
    },
}

/// Fully rendered message, ready for the dispatch client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub correlation_id: Uuid,
    pub tenant_id: String,
    pub rule_id: String,
    pub rule_kind: RuleKind,
    pub scope: DedupScope,
    pub recipient_id: String,
    pub recipient_name: String,
    pub address: String,
    pub appointment_id: Option<String>,
    /// Provider sender override (WhatsApp phone-number id).
    pub sender_id: Option<String>,
    pub body: MessageBody,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub message_id: String,
}
