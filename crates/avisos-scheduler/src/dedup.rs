//! Dedup tracker: at-most-once delivery per scheduling period.
//!
//! Three layers, from cheapest to most durable:
//! - exclusive claims: an in-process, TTL-bounded lock on one (tenant, rule, scope, unit);
//! - rule-level `last_fired_at`, advanced by a conditional write in the config store;
//! - per-appointment receipts keyed by (appointment, rule kind, recipient, scope).
//!   A delivery settles the recipient for good, a provider rejection only for
//!   the local day it happened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use avisos_core::error::{AvisosError, Result};
use avisos_core::message::Recipient;
use avisos_core::model::{DedupScope, NotificationConfig, NotificationRule, Receipt, RuleKind};
use avisos_core::traits::{BookingStore, ConfigStore};

use crate::window;

/// One unit of exclusive work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClaimKey {
    pub tenant_id: String,
    pub rule_id: String,
    pub scope: DedupScope,
    /// Target date for automatic runs, recipient filter for manual ones.
    pub unit: String,
}

impl ClaimKey {
    pub fn new(tenant_id: &str, rule_id: &str, scope: DedupScope, unit: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            rule_id: rule_id.to_string(),
            scope,
            unit: unit.into(),
        }
    }
}

impl std::fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id,
            self.rule_id,
            self.scope.as_str(),
            self.unit
        )
    }
}

struct Claim {
    token: u64,
    acquired_at: Instant,
}

#[derive(Default)]
struct ClaimTable {
    held: HashMap<ClaimKey, Claim>,
    next_token: u64,
}

/// Held claim. Released on drop unless it already expired and was taken over.
pub struct ClaimGuard {
    table: Arc<Mutex<ClaimTable>>,
    key: ClaimKey,
    token: u64,
}

impl std::fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl ClaimGuard {
    pub fn key(&self) -> &ClaimKey {
        &self.key
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            if table.held.get(&self.key).is_some_and(|c| c.token == self.token) {
                table.held.remove(&self.key);
            }
        }
    }
}

/// Diagnostic view of one rule's dedup state.
#[derive(Debug, Clone, Serialize)]
pub struct RuleDedupState {
    pub rule_id: String,
    pub kind: RuleKind,
    pub enabled: bool,
    pub schedule: &'static str,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Whether the automatic path would still fire today.
    pub can_fire: bool,
    pub active_claims: Vec<String>,
}

/// Per-tenant diagnostic snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DedupSnapshot {
    pub tenant_id: String,
    pub at: DateTime<Utc>,
    pub rules: Vec<RuleDedupState>,
    pub rejected_rules: Vec<String>,
}

/// Dedup state shared by every worker of one engine.
pub struct DedupTracker {
    claims: Arc<Mutex<ClaimTable>>,
    claim_ttl: Duration,
}

impl DedupTracker {
    pub fn new(claim_ttl: Duration) -> Self {
        Self {
            claims: Arc::new(Mutex::new(ClaimTable::default())),
            claim_ttl,
        }
    }

    /// Rule-level gate. Daily rules fire at most once per tenant-local calendar
    /// day; per-appointment rules always pass and are gated by receipts.
    pub fn should_fire(&self, rule: &NotificationRule, now: DateTime<Utc>, tz: Tz) -> bool {
        if !rule.schedule.is_daily() {
            return true;
        }
        match rule.last_fired_at {
            None => true,
            Some(last) => {
                last < now && window::local_date(last, tz) != window::local_date(now, tz)
            }
        }
    }

    /// Whether `recipient` still needs this rule's notification in `scope` at `now`.
    /// Recipients without an appointment carry no receipts.
    pub fn receipt_pending(
        recipient: &Recipient,
        kind: &RuleKind,
        scope: DedupScope,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> bool {
        let today = window::local_date(now, tz);
        !recipient.prior_receipts.iter().any(|r| {
            &r.rule_kind == kind
                && r.recipient_id == recipient.id
                && r.scope == scope
                && r.settles(today, tz)
        })
    }

    /// Acquire an exclusive claim. Fails with [`AvisosError::Race`] while another
    /// live claim holds the key; claims older than the TTL are taken over.
    pub fn try_claim(&self, key: ClaimKey) -> Result<ClaimGuard> {
        let mut table = self
            .claims
            .lock()
            .map_err(|_| AvisosError::Race(format!("claim table poisoned ({key})")))?;

        if let Some(existing) = table.held.get(&key) {
            if existing.acquired_at.elapsed() < self.claim_ttl {
                return Err(AvisosError::Race(key.to_string()));
            }
            tracing::warn!("⏳ Claim {key} expired, taking over");
        }

        table.next_token += 1;
        let token = table.next_token;
        table.held.insert(
            key.clone(),
            Claim {
                token,
                acquired_at: Instant::now(),
            },
        );
        Ok(ClaimGuard {
            table: Arc::clone(&self.claims),
            key,
            token,
        })
    }

    /// Live claims of one tenant, rendered as strings.
    pub fn active_claims(&self, tenant_id: &str) -> Vec<String> {
        let Ok(table) = self.claims.lock() else {
            return Vec::new();
        };
        let mut claims: Vec<String> = table
            .held
            .iter()
            .filter(|(k, c)| k.tenant_id == tenant_id && c.acquired_at.elapsed() < self.claim_ttl)
            .map(|(k, _)| k.to_string())
            .collect();
        claims.sort();
        claims
    }

    /// Commit a daily firing. Conditional on the `last_fired_at` the rule was
    /// evaluated with; `false` means another writer got there first.
    pub async fn record_fired(
        &self,
        store: &dyn ConfigStore,
        tenant_id: &str,
        rule: &NotificationRule,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let won = store
            .set_last_fired(tenant_id, &rule.id, rule.last_fired_at, now)
            .await?;
        if won {
            tracing::debug!("📌 [{tenant_id}/{}] last_fired_at → {now}", rule.id);
        } else {
            tracing::warn!(
                "⚠️ [{tenant_id}/{}] last_fired_at changed concurrently, not overwritten",
                rule.id
            );
        }
        Ok(won)
    }

    /// Attach a receipt to an appointment. `false` when an equal receipt exists.
    pub async fn record_receipt(
        &self,
        store: &dyn BookingStore,
        appointment_id: &str,
        receipt: &Receipt,
    ) -> Result<bool> {
        store.record_receipt(appointment_id, receipt).await
    }

    /// Load one tenant from `configs` and snapshot it. Needs no dispatch client,
    /// so it also serves processes that never send.
    pub async fn tenant_snapshot(
        &self,
        configs: &dyn ConfigStore,
        tenant_id: &str,
        default_tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<DedupSnapshot> {
        let config = configs
            .get_config(tenant_id)
            .await?
            .ok_or_else(|| AvisosError::not_found(format!("tenant '{tenant_id}'")))?;
        let tz = config.tz(default_tz)?;
        Ok(self.snapshot(&config, now, tz))
    }

    /// Diagnostic snapshot for one tenant's configuration.
    pub fn snapshot(
        &self,
        config: &NotificationConfig,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> DedupSnapshot {
        let claims = self.active_claims(&config.tenant_id);
        let rules = config
            .all_rules()
            .map(|rule| {
                let prefix = format!("{}/{}/", config.tenant_id, rule.id);
                RuleDedupState {
                    rule_id: rule.id.clone(),
                    kind: rule.kind.clone(),
                    enabled: rule.enabled,
                    schedule: rule.schedule.name(),
                    last_fired_at: rule.last_fired_at,
                    can_fire: rule.enabled && self.should_fire(rule, now, tz),
                    active_claims: claims
                        .iter()
                        .filter(|c| c.starts_with(&prefix))
                        .cloned()
                        .collect(),
                }
            })
            .collect();
        DedupSnapshot {
            tenant_id: config.tenant_id.clone(),
            at: now,
            rules,
            rejected_rules: config
                .rejected
                .iter()
                .map(|r| format!("{}: {}", r.rule_id, r.error))
                .collect(),
        }
    }
}
