//! # Avisos Scheduler
//!
//! Per-tenant notification scheduling and template dispatch.
//!
//! ## Design Principles
//! - Pure window matching over an injected `now`: testable without a clock
//! - SQLite persistence, so dedup state survives restarts
//! - Two-phase ticks: nothing is sent unless every recipient resolved
//! - Conditional `last_fired_at` writes: concurrent workers never double-fire
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio timer, minute boundaries)
//!   └── tick(now) → every tenant → every enabled rule
//!         ├── WindowMatcher: FixedTimeOfDay | RelativeWindow | DaysBeforeAppointment
//!         ├── DedupTracker: last_fired_at + per-appointment receipts + claims
//!         ├── RecipientResolver → agents | clients (BookingStore)
//!         ├── Renderer: free text | provider template (TemplateCatalog)
//!         └── Dispatcher → DispatchClient (WhatsApp Cloud API)
//!                ├── bounded concurrency, per-attempt timeout
//!                └── retry with exponential backoff on retryable errors
//!
//! ControlHandle
//!   ├── trigger(tenant, rule, recipient?): manual scope, bypasses window
//!   ├── dedup_state(tenant)
//!   └── set_tick_period(period)
//! ```

pub mod control;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod persistence;
pub mod render;
pub mod resolver;
pub mod store;
pub mod window;

pub use control::ControlHandle;
pub use dedup::{ClaimKey, DedupSnapshot, DedupTracker};
pub use dispatch::{DeliveryReport, DispatchPolicy, Dispatcher, RecipientOutcome};
pub use engine::{RuleError, SchedulerEngine, TickReport, spawn_scheduler};
pub use persistence::SqliteStore;
pub use resolver::RecipientResolver;
pub use store::MemoryStore;
pub use window::Firing;
