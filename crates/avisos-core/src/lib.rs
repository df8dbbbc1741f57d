//! # Avisos Core
//!
//! Shared vocabulary of the notification engine: the per-tenant configuration
//! model, its load-boundary validation, the error taxonomy, engine settings and
//! the traits behind which the configuration store, booking data and messaging
//! provider live.

pub mod config;
pub mod document;
pub mod error;
pub mod message;
pub mod model;
pub mod phone;
pub mod traits;

pub use config::AvisosConfig;
pub use error::{AvisosError, ConfigurationError, ProviderError, Result};
pub use message::{
    BoundParameter, DeliveryAck, MessageBody, OutboundMessage, Recipient, RenderContext,
    TemplateDefinition,
};
pub use model::{
    Agent, Appointment, AppointmentCriteria, AppointmentStatus, Contact, DayOffset, DedupScope,
    DigestDetail, MessageSpec, NotificationConfig, NotificationRule, ParameterKind, Receipt,
    ReceiptOutcome, RecipientSelector, RuleKind, Schedule, TemplateParameter, TimeOfDay,
};
pub use traits::{
    BookingStore, ConfigField, ConfigSnapshot, ConfigStore, DispatchClient, TemplateCatalog,
};
