//! Notification configuration and booking data model.
//!
//! Every variant here is already validated. Loosely-typed documents coming out of
//! the store go through [`crate::document`] first.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Largest accepted `DaysBeforeAppointment` offset.
pub const MAX_DAYS_BEFORE: u32 = 14;

/// Rule id used for the tenant's daily agent digest.
pub const DAILY_AGENT_RULE_ID: &str = "daily_agents";

/// Wall-clock minute, serialized as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour as u32
    }

    pub fn minute(&self) -> u32 {
        self.minute as u32
    }

    /// Minutes since local midnight.
    pub fn minute_of_day(&self) -> u32 {
        self.hour() * 60 + self.minute()
    }
}

impl FromStr for TimeOfDay {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidTimeOfDay(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Domain label of a rule. Not used for control flow, only for receipts and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleKind {
    Reminder,
    Digest,
    Confirmation,
    Other(String),
}

impl RuleKind {
    pub fn as_str(&self) -> &str {
        match self {
            RuleKind::Reminder => "reminder",
            RuleKind::Digest => "digest",
            RuleKind::Confirmation => "confirmation",
            RuleKind::Other(s) => s,
        }
    }
}

impl From<String> for RuleKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "reminder" | "recordatorio" => RuleKind::Reminder,
            "digest" | "resumen" => RuleKind::Digest,
            "confirmation" | "confirmacion" => RuleKind::Confirmation,
            _ => RuleKind::Other(s),
        }
    }
}

impl From<&str> for RuleKind {
    fn from(s: &str) -> Self {
        RuleKind::from(s.to_string())
    }
}

impl From<RuleKind> for String {
    fn from(k: RuleKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which calendar day a relative window targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayOffset {
    #[default]
    #[serde(alias = "hoy")]
    Today,
    #[serde(alias = "manana")]
    Tomorrow,
}

impl DayOffset {
    pub fn days(&self) -> u32 {
        match self {
            DayOffset::Today => 0,
            DayOffset::Tomorrow => 1,
        }
    }
}

/// When a rule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Once a day at `at`, tenant-local.
    FixedTimeOfDay {
        at: TimeOfDay,
        /// 0 = Sunday .. 6 = Saturday. Empty means every day.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        weekdays: Vec<u8>,
        /// Which day's appointments the firing covers, relative to today.
        #[serde(default)]
        look_ahead_days: u32,
    },
    /// Selects today's or tomorrow's appointments. `active = false` never matches.
    RelativeWindow { day_offset: DayOffset, active: bool },
    /// Per appointment: fires on the local date `start - days`.
    DaysBeforeAppointment {
        days: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        not_before: Option<TimeOfDay>,
    },
}

impl Schedule {
    pub fn name(&self) -> &'static str {
        match self {
            Schedule::FixedTimeOfDay { .. } => "fixed_time_of_day",
            Schedule::RelativeWindow { .. } => "relative_window",
            Schedule::DaysBeforeAppointment { .. } => "days_before_appointment",
        }
    }

    /// Rules deduplicated per calendar day (rule-level `last_fired_at`).
    pub fn is_daily(&self) -> bool {
        !matches!(self, Schedule::DaysBeforeAppointment { .. })
    }
}

/// Appointment lifecycle state as written by the booking subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    #[serde(alias = "pendiente")]
    Pending,
    #[serde(alias = "confirmado")]
    Confirmed,
    #[serde(alias = "no_confirmado")]
    Unconfirmed,
    #[serde(alias = "cancelado")]
    Cancelled,
    #[serde(alias = "completado")]
    Completed,
    #[serde(alias = "no_asistio")]
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Unconfirmed => "unconfirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

fn default_statuses() -> Vec<AppointmentStatus> {
    vec![AppointmentStatus::Pending, AppointmentStatus::Confirmed]
}

/// Filter applied to appointments before they become recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentCriteria {
    #[serde(default = "default_statuses")]
    pub statuses: Vec<AppointmentStatus>,
}

impl Default for AppointmentCriteria {
    fn default() -> Self {
        Self {
            statuses: default_statuses(),
        }
    }
}

impl AppointmentCriteria {
    pub fn accepts(&self, status: AppointmentStatus) -> bool {
        self.statuses.contains(&status)
    }
}

/// One per-appointment field listed in an agent digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestDetail {
    BookingTime,
    ClientName,
    ClientPhone,
    Origin,
    Destination,
    InternalNotes,
}

impl DigestDetail {
    /// Listed when a rule does not choose.
    pub fn defaults() -> Vec<Self> {
        vec![
            DigestDetail::BookingTime,
            DigestDetail::ClientName,
            DigestDetail::Origin,
            DigestDetail::Destination,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestDetail::BookingTime => "booking_time",
            DigestDetail::ClientName => "client_name",
            DigestDetail::ClientPhone => "client_phone",
            DigestDetail::Origin => "origin",
            DigestDetail::Destination => "destination",
            DigestDetail::InternalNotes => "internal_notes",
        }
    }
}

impl FromStr for DigestDetail {
    type Err = ConfigurationError;

    /// Accepts the snake_case names and the legacy Spanish keys.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "booking_time" | "horaReserva" => Ok(DigestDetail::BookingTime),
            "client_name" | "nombreCliente" => Ok(DigestDetail::ClientName),
            "client_phone" | "telefonoCliente" => Ok(DigestDetail::ClientPhone),
            "origin" | "origen" => Ok(DigestDetail::Origin),
            "destination" | "destino" => Ok(DigestDetail::Destination),
            "internal_notes" | "notasInternas" => Ok(DigestDetail::InternalNotes),
            other => Err(ConfigurationError::UnknownDigestDetail(other.to_string())),
        }
    }
}

/// Who receives a rule's messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipientSelector {
    AllAgents {
        /// Restrict to these agents. Empty means every active agent.
        #[serde(default, skip_serializing_if = "Vec::is_empty", alias = "agentesEspecificos")]
        agent_ids: Vec<String>,
        /// Skip agents without appointments in the window.
        #[serde(default)]
        only_with_appointments: bool,
        /// Per-appointment fields in the digest list, in display order.
        #[serde(default = "DigestDetail::defaults")]
        details: Vec<DigestDetail>,
    },
    ClientsWithAppointmentMatching {
        #[serde(default)]
        criteria: AppointmentCriteria,
        /// Restrict to these contacts. Empty means every participant.
        #[serde(default, skip_serializing_if = "Vec::is_empty", alias = "clientesEspecificos")]
        client_ids: Vec<String>,
    },
}

impl RecipientSelector {
    pub fn all_agents() -> Self {
        RecipientSelector::AllAgents {
            agent_ids: Vec::new(),
            only_with_appointments: false,
            details: DigestDetail::defaults(),
        }
    }

    pub fn clients() -> Self {
        RecipientSelector::ClientsWithAppointmentMatching {
            criteria: AppointmentCriteria::default(),
            client_ids: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecipientSelector::AllAgents { .. } => "all_agents",
            RecipientSelector::ClientsWithAppointmentMatching { .. } => {
                "clients_with_appointment_matching"
            }
        }
    }
}

/// Type of a provider template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    #[default]
    Text,
    Currency,
    DateTime,
}

impl ParameterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterKind::Text => "text",
            ParameterKind::Currency => "currency",
            ParameterKind::DateTime => "date_time",
        }
    }
}

/// One ordered template parameter: its kind and the context variable feeding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParameter {
    #[serde(default)]
    pub kind: ParameterKind,
    pub binding: String,
}

impl TemplateParameter {
    pub fn text(binding: &str) -> Self {
        Self {
            kind: ParameterKind::Text,
            binding: binding.to_string(),
        }
    }
}

/// What a rule sends. Exactly one variant is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageSpec {
    /// Empty text is a valid "template only" state that renders to nothing.
    FreeText {
        #[serde(default)]
        text: String,
    },
    ProviderTemplate {
        name: String,
        language: String,
        #[serde(default)]
        parameters: Vec<TemplateParameter>,
    },
}

/// A single notification rule of a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: String,
    pub kind: RuleKind,
    pub enabled: bool,
    pub recipients: RecipientSelector,
    pub schedule: Schedule,
    pub message: MessageSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// A rule that failed validation at load time. Logged every tick until fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRule {
    pub rule_id: String,
    pub error: ConfigurationError,
}

/// Per-tenant notification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub tenant_id: String,
    /// IANA zone name. `None` uses the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Provider sender (WhatsApp phone-number id). `None` uses the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_agent_rule: Option<NotificationRule>,
    #[serde(default)]
    pub rules: Vec<NotificationRule>,
    #[serde(skip)]
    pub rejected: Vec<RejectedRule>,
}

impl NotificationConfig {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            timezone: None,
            sender_id: None,
            daily_agent_rule: None,
            rules: Vec::new(),
            rejected: Vec::new(),
        }
    }

    /// Daily rule first, then the rule list in stored order.
    pub fn all_rules(&self) -> impl Iterator<Item = &NotificationRule> {
        self.daily_agent_rule.iter().chain(self.rules.iter())
    }

    pub fn rule(&self, rule_id: &str) -> Option<&NotificationRule> {
        self.all_rules().find(|r| r.id == rule_id)
    }

    pub fn rule_mut(&mut self, rule_id: &str) -> Option<&mut NotificationRule> {
        self.daily_agent_rule
            .iter_mut()
            .chain(self.rules.iter_mut())
            .find(|r| r.id == rule_id)
    }

    /// Resolve the tenant zone, falling back to `default`.
    pub fn tz(&self, default: chrono_tz::Tz) -> Result<chrono_tz::Tz, ConfigurationError> {
        match &self.timezone {
            None => Ok(default),
            Some(name) => name
                .parse::<chrono_tz::Tz>()
                .map_err(|_| ConfigurationError::UnknownTimezone(name.clone())),
        }
    }
}

/// Named contact on an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Staff member who can receive digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Which dedup state a send belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    Automatic,
    Manual,
}

impl DedupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupScope::Automatic => "automatic",
            DedupScope::Manual => "manual",
        }
    }
}

impl FromStr for DedupScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(DedupScope::Automatic),
            "manual" => Ok(DedupScope::Manual),
            other => Err(format!("unknown dedup scope '{other}'")),
        }
    }
}

/// How a notification attempt ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptOutcome {
    #[default]
    Sent,
    /// Refused by the provider with a non-retryable error.
    Rejected,
}

impl ReceiptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptOutcome::Sent => "sent",
            ReceiptOutcome::Rejected => "rejected",
        }
    }
}

impl FromStr for ReceiptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(ReceiptOutcome::Sent),
            "rejected" => Ok(ReceiptOutcome::Rejected),
            other => Err(format!("unknown receipt outcome '{other}'")),
        }
    }
}

/// Durable record that a rule already handled one participant of an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub rule_kind: RuleKind,
    pub recipient_id: String,
    pub scope: DedupScope,
    /// When the attempt finished.
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub outcome: ReceiptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Receipt {
    pub fn sent(
        rule_kind: RuleKind,
        recipient_id: &str,
        scope: DedupScope,
        sent_at: DateTime<Utc>,
        message_id: Option<String>,
    ) -> Self {
        Self {
            rule_kind,
            recipient_id: recipient_id.to_string(),
            scope,
            sent_at,
            message_id,
            outcome: ReceiptOutcome::Sent,
            error: None,
        }
    }

    pub fn rejected(
        rule_kind: RuleKind,
        recipient_id: &str,
        scope: DedupScope,
        at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            rule_kind,
            recipient_id: recipient_id.to_string(),
            scope,
            sent_at: at,
            message_id: None,
            outcome: ReceiptOutcome::Rejected,
            error: Some(error.into()),
        }
    }

    /// Whether this receipt settles the recipient on tenant-local `today`.
    /// A delivery settles it for good; a rejection only for the day it happened.
    pub fn settles(&self, today: NaiveDate, tz: chrono_tz::Tz) -> bool {
        match self.outcome {
            ReceiptOutcome::Sent => true,
            ReceiptOutcome::Rejected => self.sent_at.with_timezone(&tz).date_naive() == today,
        }
    }

    fn matches(&self, kind: &RuleKind, recipient_id: &str, scope: DedupScope) -> bool {
        &self.rule_kind == kind && self.recipient_id == recipient_id && self.scope == scope
    }
}

/// Booking owned by the reservation subsystem. Read-only here except for receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub tenant_id: String,
    pub start_time: DateTime<Utc>,
    pub status: AppointmentStatus,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub client: Option<Contact>,
    /// Extra participants, e.g. a guest travelling with the client.
    #[serde(default)]
    pub guests: Vec<Contact>,
    /// Free-form booking fields (origin, destination, notes).
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    #[serde(default)]
    pub receipts: Vec<Receipt>,
}

impl Appointment {
    /// Client first, then guests.
    pub fn participants(&self) -> impl Iterator<Item = &Contact> {
        self.client.iter().chain(self.guests.iter())
    }

    /// Whether the rule already delivered to this participant.
    pub fn has_receipt(&self, kind: &RuleKind, recipient_id: &str, scope: DedupScope) -> bool {
        self.receipts
            .iter()
            .any(|r| r.outcome == ReceiptOutcome::Sent && r.matches(kind, recipient_id, scope))
    }

    /// Store a receipt with insert-once semantics for deliveries: a later
    /// rejection or delivery replaces an earlier rejection, nothing replaces a
    /// delivery. Returns whether the receipt was stored.
    pub fn upsert_receipt(&mut self, receipt: Receipt) -> bool {
        let existing = self
            .receipts
            .iter_mut()
            .find(|r| r.matches(&receipt.rule_kind, &receipt.recipient_id, receipt.scope));
        match existing {
            Some(r) if r.outcome == ReceiptOutcome::Sent => false,
            Some(r) => {
                *r = receipt;
                true
            }
            None => {
                self.receipts.push(receipt);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_of_day_parse() {
        let t: TimeOfDay = "09:05".parse().unwrap();
        assert_eq!(t.hour(), 9);
        assert_eq!(t.minute(), 5);
        assert_eq!(t.to_string(), "09:05");
        assert_eq!("6:30".parse::<TimeOfDay>().unwrap().minute_of_day(), 390);

        for bad in ["24:00", "12:60", "1200", "12:5", "", "ab:cd"] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_rule_kind_legacy_names() {
        assert_eq!(RuleKind::from("confirmacion"), RuleKind::Confirmation);
        assert_eq!(RuleKind::from("recordatorio"), RuleKind::Reminder);
        assert_eq!(RuleKind::from("follow_up"), RuleKind::Other("follow_up".into()));
        assert_eq!(RuleKind::Digest.to_string(), "digest");
    }

    #[test]
    fn test_status_aliases() {
        let s: AppointmentStatus = serde_json::from_str("\"no_confirmado\"").unwrap();
        assert_eq!(s, AppointmentStatus::Unconfirmed);
        let criteria = AppointmentCriteria::default();
        assert!(criteria.accepts(AppointmentStatus::Pending));
        assert!(!criteria.accepts(AppointmentStatus::Cancelled));
    }

    #[test]
    fn test_participants_and_receipts() {
        let appt = Appointment {
            id: "a1".into(),
            tenant_id: "acme".into(),
            start_time: Utc::now(),
            status: AppointmentStatus::Confirmed,
            agent_id: None,
            client: Some(Contact {
                id: "c1".into(),
                name: "Ana".into(),
                phone: Some("5491100000001".into()),
            }),
            guests: vec![Contact {
                id: "c2".into(),
                name: "Luis".into(),
                phone: None,
            }],
            details: BTreeMap::new(),
            receipts: vec![Receipt::sent(
                RuleKind::Reminder,
                "c1",
                DedupScope::Automatic,
                Utc::now(),
                None,
            )],
        };
        let ids: Vec<_> = appt.participants().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["c1", "c2"]);
        assert!(appt.has_receipt(&RuleKind::Reminder, "c1", DedupScope::Automatic));
        assert!(!appt.has_receipt(&RuleKind::Reminder, "c1", DedupScope::Manual));
        assert!(!appt.has_receipt(&RuleKind::Reminder, "c2", DedupScope::Automatic));
    }

    #[test]
    fn test_rejection_is_replaced_by_delivery_but_not_vice_versa() {
        use chrono::TimeZone;
        let tz = chrono_tz::America::Argentina::Buenos_Aires;
        let day1 = Utc.with_ymd_and_hms(2024, 5, 9, 13, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 5, 10, 13, 0, 0).unwrap();
        let mut appt = Appointment {
            id: "t1".into(),
            tenant_id: "acme".into(),
            start_time: day2,
            status: AppointmentStatus::Pending,
            agent_id: None,
            client: None,
            guests: vec![],
            details: BTreeMap::new(),
            receipts: vec![],
        };

        let rejected =
            Receipt::rejected(RuleKind::Reminder, "c1", DedupScope::Automatic, day1, "400");
        assert!(rejected.settles(day1.with_timezone(&tz).date_naive(), tz));
        assert!(!rejected.settles(day2.with_timezone(&tz).date_naive(), tz));

        assert!(appt.upsert_receipt(rejected));
        assert!(!appt.has_receipt(&RuleKind::Reminder, "c1", DedupScope::Automatic));

        let sent = Receipt::sent(RuleKind::Reminder, "c1", DedupScope::Automatic, day2, None);
        assert!(appt.upsert_receipt(sent.clone()));
        assert!(appt.has_receipt(&RuleKind::Reminder, "c1", DedupScope::Automatic));
        assert!(!appt.upsert_receipt(sent));
        assert_eq!(appt.receipts.len(), 1);
    }
}
