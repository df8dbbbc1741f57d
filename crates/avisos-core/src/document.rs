//! Load-boundary validation of stored configuration documents.
//!
//! Administrative tooling writes these documents directly and leaves them in
//! partially migrated states, so nothing here assumes well-formed input:
//! - unknown or legacy fields are ignored;
//! - a broken rule is rejected on its own, its siblings still load;
//! - only a missing tenant id or an unknown timezone rejects the whole document.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigurationError;
use crate::model::{
    DAILY_AGENT_RULE_ID, DayOffset, DigestDetail, MAX_DAYS_BEFORE, MessageSpec,
    NotificationConfig, NotificationRule, RecipientSelector, RejectedRule, RuleKind, Schedule,
    TimeOfDay,
};
use crate::traits::ConfigField;

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(alias = "empresaId")]
    tenant_id: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default, alias = "phoneNumberId")]
    sender_id: Option<String>,
    #[serde(default)]
    daily_agent_rule: Option<Value>,
    #[serde(default)]
    rules: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    id: Option<String>,
    kind: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    recipients: RecipientSelector,
    schedule: RawSchedule,
    message: MessageSpec,
    #[serde(default)]
    last_fired_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawSchedule {
    FixedTimeOfDay {
        at: String,
        #[serde(default)]
        weekdays: Vec<u8>,
        #[serde(default)]
        look_ahead_days: Option<serde_json::Number>,
    },
    RelativeWindow {
        day_offset: DayOffset,
        active: bool,
    },
    DaysBeforeAppointment {
        days: serde_json::Number,
        #[serde(default)]
        not_before: Option<String>,
    },
}

impl NotificationConfig {
    /// Parse and validate a stored document.
    ///
    /// Returns an error only when the tenant itself cannot be identified or its
    /// timezone is unknown. Individual bad rules end up in `rejected`.
    pub fn from_document(doc: &Value) -> Result<Self, ConfigurationError> {
        let raw: RawConfig = serde_json::from_value(doc.clone())
            .map_err(|e| ConfigurationError::MalformedDocument(e.to_string()))?;

        let tenant_id = raw
            .tenant_id
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigurationError::MalformedDocument("missing tenant_id".into()))?;

        let mut config = NotificationConfig::new(&tenant_id);
        config.timezone = raw.timezone.filter(|tz| !tz.trim().is_empty());
        config.sender_id = raw.sender_id.filter(|s| !s.trim().is_empty());
        // Fails on an unknown zone.
        config.tz(chrono_tz::UTC)?;

        if let Some(value) = raw.daily_agent_rule.filter(|v| !v.is_null()) {
            match parse_rule(&value, Some(DAILY_AGENT_RULE_ID)).and_then(check_daily_rule) {
                Ok(rule) => config.daily_agent_rule = Some(rule),
                Err(error) => config.rejected.push(RejectedRule {
                    rule_id: DAILY_AGENT_RULE_ID.to_string(),
                    error,
                }),
            }
        }

        for (index, value) in raw.rules.iter().enumerate() {
            match parse_rule(value, None) {
                Ok(rule) => {
                    if config.rule(&rule.id).is_some() {
                        config.rejected.push(RejectedRule {
                            rule_id: rule.id.clone(),
                            error: ConfigurationError::MalformedRule {
                                rule: rule.id,
                                reason: "duplicate rule id".into(),
                            },
                        });
                    } else {
                        config.rules.push(rule);
                    }
                }
                Err(error) => config.rejected.push(RejectedRule {
                    rule_id: rule_label(value, index),
                    error,
                }),
            }
        }

        Ok(config)
    }
}

/// Best-effort identifier for a rule that failed to parse.
fn rule_label(value: &Value, index: usize) -> String {
    value
        .get("id")
        .or_else(|| value.get("kind"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("rules[{index}]"))
}

fn parse_rule(
    value: &Value,
    fixed_id: Option<&str>,
) -> Result<NotificationRule, ConfigurationError> {
    let label = fixed_id
        .map(str::to_string)
        .unwrap_or_else(|| rule_label(value, 0));
    let malformed = |reason: String| ConfigurationError::MalformedRule {
        rule: label.clone(),
        reason,
    };

    let mut value = value.clone();
    if let Some(details) = value.pointer_mut("/recipients/details") {
        *details = normalize_details(details, &label)?;
    }
    let raw: RawRule = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

    let id = match fixed_id {
        Some(id) => id.to_string(),
        None => raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| raw.kind.clone()),
    };

    let schedule = validate_schedule(raw.schedule, &label)?;
    check_pairing(&schedule, &raw.recipients)?;
    check_selector(&raw.recipients, &label)?;
    check_message(&raw.message, &label)?;

    Ok(NotificationRule {
        id,
        kind: RuleKind::from(raw.kind),
        enabled: raw.enabled,
        recipients: raw.recipients,
        schedule,
        message: raw.message,
        last_fired_at: raw.last_fired_at,
    })
}

fn validate_schedule(raw: RawSchedule, label: &str) -> Result<Schedule, ConfigurationError> {
    match raw {
        RawSchedule::FixedTimeOfDay {
            at,
            weekdays,
            look_ahead_days,
        } => {
            let at: TimeOfDay = at.parse()?;
            if let Some(&bad) = weekdays.iter().find(|d| **d > 6) {
                return Err(ConfigurationError::InvalidWeekday(bad));
            }
            let look_ahead_days = match look_ahead_days {
                None => 0,
                Some(n) => whole_days(&n, label)?,
            };
            Ok(Schedule::FixedTimeOfDay {
                at,
                weekdays,
                look_ahead_days,
            })
        }
        RawSchedule::RelativeWindow { day_offset, active } => {
            Ok(Schedule::RelativeWindow { day_offset, active })
        }
        RawSchedule::DaysBeforeAppointment { days, not_before } => {
            let days = whole_days(&days, label)?;
            let not_before = not_before
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<TimeOfDay>())
                .transpose()?;
            Ok(Schedule::DaysBeforeAppointment { days, not_before })
        }
    }
}

/// Accept only whole, small, non-negative day counts. Never guess a correction.
fn whole_days(n: &serde_json::Number, label: &str) -> Result<u32, ConfigurationError> {
    let days = match n.as_i64() {
        Some(days) => days,
        None => {
            return Err(ConfigurationError::MalformedRule {
                rule: label.to_string(),
                reason: format!("day offset {n} is not a whole number"),
            });
        }
    };
    if days < 0 || days > MAX_DAYS_BEFORE as i64 {
        return Err(ConfigurationError::DaysBeforeOutOfRange(days));
    }
    Ok(days as u32)
}

fn check_pairing(
    schedule: &Schedule,
    selector: &RecipientSelector,
) -> Result<(), ConfigurationError> {
    if let (Schedule::DaysBeforeAppointment { .. }, RecipientSelector::AllAgents { .. }) =
        (schedule, selector)
    {
        return Err(ConfigurationError::UnsupportedPairing {
            schedule: schedule.name().to_string(),
            selector: selector.name().to_string(),
        });
    }
    Ok(())
}

/// Digest details come either as a list of names or, in older documents, as an
/// object of flags (`{"origen": true, "notasInternas": false}`). Both become a
/// duplicate-free list of snake_case names; unknown names are rejected.
fn normalize_details(value: &Value, label: &str) -> Result<Value, ConfigurationError> {
    let names: Vec<&str> = match value {
        Value::Null => return Ok(serde_json::json!(DigestDetail::defaults())),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().ok_or_else(|| ConfigurationError::MalformedRule {
                    rule: label.to_string(),
                    reason: format!("digest detail {item} is not a name"),
                })
            })
            .collect::<Result<_, _>>()?,
        Value::Object(flags) => flags
            .iter()
            .filter(|(_, on)| on.as_bool().unwrap_or(false))
            .map(|(name, _)| name.as_str())
            .collect(),
        other => {
            return Err(ConfigurationError::MalformedRule {
                rule: label.to_string(),
                reason: format!("digest details must be a list or an object, got {other}"),
            });
        }
    };
    let mut details: Vec<DigestDetail> = Vec::with_capacity(names.len());
    for name in names {
        let detail: DigestDetail = name.parse()?;
        if !details.contains(&detail) {
            details.push(detail);
        }
    }
    // Flag objects carry no order of their own.
    if value.is_object() {
        details.sort();
    }
    Ok(serde_json::json!(details))
}

fn check_selector(selector: &RecipientSelector, label: &str) -> Result<(), ConfigurationError> {
    let ids = match selector {
        RecipientSelector::AllAgents { agent_ids, .. } => agent_ids,
        RecipientSelector::ClientsWithAppointmentMatching { client_ids, .. } => client_ids,
    };
    if ids.iter().any(|id| id.trim().is_empty()) {
        return Err(ConfigurationError::MalformedRule {
            rule: label.to_string(),
            reason: format!("{} lists a blank id", selector.name()),
        });
    }
    Ok(())
}

fn check_message(message: &MessageSpec, label: &str) -> Result<(), ConfigurationError> {
    if let MessageSpec::ProviderTemplate {
        name,
        language,
        parameters,
    } = message
    {
        let reason = if name.trim().is_empty() {
            Some("template name is empty".to_string())
        } else if language.trim().is_empty() {
            Some("template language is empty".to_string())
        } else {
            parameters
                .iter()
                .position(|p| p.binding.trim().is_empty())
                .map(|i| format!("template parameter #{i} has no binding"))
        };
        if let Some(reason) = reason {
            return Err(ConfigurationError::MalformedRule {
                rule: label.to_string(),
                reason,
            });
        }
    }
    Ok(())
}

fn check_daily_rule(rule: NotificationRule) -> Result<NotificationRule, ConfigurationError> {
    if matches!(rule.recipients, RecipientSelector::AllAgents { .. }) {
        return Ok(rule);
    }
    Err(ConfigurationError::UnsupportedPairing {
        schedule: format!("daily agent rule ({})", rule.schedule.name()),
        selector: rule.recipients.name().to_string(),
    })
}

/// Remove or blank one named field of a stored document in place.
///
/// Clearing a field that is already absent is a no-op.
pub fn clear_field(doc: &mut Value, field: &ConfigField) -> Result<(), ConfigurationError> {
    let obj = doc.as_object_mut().ok_or_else(|| {
        ConfigurationError::MalformedDocument("document is not an object".into())
    })?;
    match field {
        ConfigField::DailyAgentRule => {
            obj.remove("daily_agent_rule");
        }
        ConfigField::SenderId => {
            obj.remove("sender_id");
            obj.remove("phoneNumberId");
        }
        ConfigField::RuleMessageText { rule_id } => {
            let Some(rules) = obj.get_mut("rules").and_then(Value::as_array_mut) else {
                return Ok(());
            };
            let target = rules.iter_mut().find(|r| {
                let id = r.get("id").and_then(Value::as_str).filter(|s| !s.trim().is_empty());
                id.or_else(|| r.get("kind").and_then(Value::as_str)) == Some(rule_id.as_str())
            });
            if let Some(message) = target.and_then(|r| r.get_mut("message")) {
                if message.get("type").and_then(Value::as_str) == Some("free_text") {
                    message["text"] = Value::String(String::new());
                }
            }
        }
    }
    Ok(())
}
