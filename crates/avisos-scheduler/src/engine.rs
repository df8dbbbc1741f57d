//! Scheduler Engine: evaluates every tenant's rules on each tick and drives
//! matching rules through resolve → render → dispatch → commit.
//!
//! A tick runs in two phases so a store outage never leaves partial state:
//! 1. claim + resolve every due (tenant, rule); any resolution error abandons
//!    the tick and releases all claims before a single message is sent;
//! 2. render + dispatch + commit receipts and `last_fired_at`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;

use avisos_core::config::SchedulerConfig;
use avisos_core::error::{AvisosError, ConfigurationError, Result};
use avisos_core::message::{Recipient, TemplateDefinition};
use avisos_core::model::{
    DedupScope, MessageSpec, NotificationConfig, NotificationRule, Receipt, Schedule,
};
use avisos_core::phone;
use avisos_core::traits::{BookingStore, ConfigStore, DispatchClient, TemplateCatalog};

use crate::dedup::{ClaimGuard, ClaimKey, DedupSnapshot, DedupTracker};
use crate::dispatch::{DeliveryReport, DispatchPolicy, Dispatcher, RecipientOutcome};
use crate::render::{self, RenderMeta};
use crate::resolver::{RecipientResolver, ResolveRequest};
use crate::window::{self, Firing};

/// A rule that could not be evaluated this tick.
#[derive(Debug, Clone, Serialize)]
pub struct RuleError {
    pub tenant_id: String,
    pub rule_id: String,
    pub error: String,
}

/// Summary of one tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    /// Set when a resolution error abandoned the tick.
    pub abandoned: Option<String>,
    pub deliveries: Vec<DeliveryReport>,
    pub rule_errors: Vec<RuleError>,
    /// Units skipped because another worker held the claim.
    pub races: Vec<String>,
}

impl TickReport {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            abandoned: None,
            deliveries: Vec::new(),
            rule_errors: Vec::new(),
            races: Vec::new(),
        }
    }

    pub fn messages_sent(&self) -> usize {
        self.deliveries.iter().map(DeliveryReport::sent).sum()
    }

    pub fn delivery(&self, tenant_id: &str, rule_id: &str) -> Option<&DeliveryReport> {
        self.deliveries
            .iter()
            .find(|d| d.tenant_id == tenant_id && d.rule_id == rule_id)
    }
}

/// One (tenant, rule) that passed the window gate.
struct Unit {
    tenant_id: String,
    sender_id: Option<String>,
    tz: Tz,
    rule: NotificationRule,
    firing: Firing,
}

impl Unit {
    fn tag(&self) -> String {
        format!("{}/{}", self.tenant_id, self.rule.id)
    }

    fn rule_error(&self, error: impl ToString) -> RuleError {
        RuleError {
            tenant_id: self.tenant_id.clone(),
            rule_id: self.rule.id.clone(),
            error: error.to_string(),
        }
    }
}

/// A claimed unit with its recipients resolved.
struct Prepared {
    unit: Unit,
    recipients: Vec<Recipient>,
    definition: Option<TemplateDefinition>,
    _claim: ClaimGuard,
}

enum Prep {
    Ready(Prepared),
    Raced(String),
    AlreadyFired,
    Invalid(RuleError),
}

/// The notification scheduling engine.
pub struct SchedulerEngine {
    configs: Arc<dyn ConfigStore>,
    bookings: Arc<dyn BookingStore>,
    catalog: Arc<dyn TemplateCatalog>,
    resolver: RecipientResolver,
    dedup: DedupTracker,
    dispatcher: Dispatcher,
    default_tz: Tz,
    max_workers: usize,
}

impl SchedulerEngine {
    pub fn new(
        settings: &SchedulerConfig,
        configs: Arc<dyn ConfigStore>,
        bookings: Arc<dyn BookingStore>,
        catalog: Arc<dyn TemplateCatalog>,
        client: Arc<dyn DispatchClient>,
    ) -> Result<Self> {
        Ok(Self {
            configs,
            resolver: RecipientResolver::new(Arc::clone(&bookings)),
            bookings,
            catalog,
            dedup: DedupTracker::new(settings.claim_ttl()),
            dispatcher: Dispatcher::new(client, DispatchPolicy::from_config(settings)),
            default_tz: settings.timezone()?,
            max_workers: settings.max_workers.max(1),
        })
    }

    pub fn dedup(&self) -> &DedupTracker {
        &self.dedup
    }

    /// Evaluate every tenant at `now`. Never fails: errors end up in the report.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::new(now);

        let snapshots = match self.configs.all_configs().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("🛑 Tick {now} abandoned: configuration store unavailable: {e}");
                report.abandoned = Some(e.to_string());
                return report;
            }
        };

        let mut units = Vec::new();
        for snapshot in snapshots {
            let config = match snapshot.config {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("⚠️ [{}] configuration rejected: {e}", snapshot.tenant_id);
                    report.rule_errors.push(RuleError {
                        tenant_id: snapshot.tenant_id,
                        rule_id: "*".into(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            self.collect_units(config, now, &mut units, &mut report);
        }

        if units.is_empty() {
            tracing::debug!("⏰ Tick {now}: nothing due");
            return report;
        }
        tracing::info!("⏰ Tick {now}: {} rule(s) due", units.len());

        // Phase 1: claim + resolve. The first resolution error drops every
        // prepared unit, which releases its claim.
        let prepared: Vec<Prep> = match futures::stream::iter(units)
            .map(|unit| self.prepare(unit, now))
            .buffer_unordered(self.max_workers)
            .try_collect()
            .await
        {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("🛑 Tick {now} abandoned: {e}");
                report.abandoned = Some(e.to_string());
                return report;
            }
        };

        let mut ready = Vec::new();
        for prep in prepared {
            match prep {
                Prep::Ready(p) => ready.push(p),
                Prep::Raced(key) => {
                    tracing::debug!("🔒 {key} is being handled by another worker, skipped");
                    report.races.push(key);
                }
                Prep::AlreadyFired => {}
                Prep::Invalid(err) => report.rule_errors.push(err),
            }
        }

        // Phase 2: render + dispatch + commit.
        let results: Vec<std::result::Result<DeliveryReport, RuleError>> =
            futures::stream::iter(ready)
                .map(|p| async move {
                    let (tenant_id, rule_id) = (p.unit.tenant_id.clone(), p.unit.rule.id.clone());
                    self.execute(p, DedupScope::Automatic, now).await.map_err(|e| {
                        tracing::warn!("⚠️ [{tenant_id}/{rule_id}] skipped this tick: {e}");
                        RuleError {
                            tenant_id,
                            rule_id,
                            error: e.to_string(),
                        }
                    })
                })
                .buffer_unordered(self.max_workers)
                .collect()
                .await;

        for result in results {
            match result {
                Ok(delivery) => report.deliveries.push(delivery),
                Err(err) => report.rule_errors.push(err),
            }
        }
        report
    }

    fn collect_units(
        &self,
        config: NotificationConfig,
        now: DateTime<Utc>,
        units: &mut Vec<Unit>,
        report: &mut TickReport,
    ) {
        for rejected in &config.rejected {
            tracing::warn!(
                "⚠️ [{}/{}] rule rejected at load: {}",
                config.tenant_id,
                rejected.rule_id,
                rejected.error
            );
            report.rule_errors.push(RuleError {
                tenant_id: config.tenant_id.clone(),
                rule_id: rejected.rule_id.clone(),
                error: rejected.error.to_string(),
            });
        }

        let tz = match config.tz(self.default_tz) {
            Ok(tz) => tz,
            Err(e) => {
                report.rule_errors.push(RuleError {
                    tenant_id: config.tenant_id.clone(),
                    rule_id: "*".into(),
                    error: e.to_string(),
                });
                return;
            }
        };

        for rule in config.all_rules().filter(|r| r.enabled) {
            let firing = window::evaluate(&rule.schedule, now, tz);
            if firing.is_idle() || !self.dedup.should_fire(rule, now, tz) {
                continue;
            }
            units.push(Unit {
                tenant_id: config.tenant_id.clone(),
                sender_id: config.sender_id.clone(),
                tz,
                rule: rule.clone(),
                firing,
            });
        }
    }

    /// Phase 1 for one unit. `Err` only for resolution failures.
    async fn prepare(&self, mut unit: Unit, now: DateTime<Utc>) -> Result<Prep> {
        let claim_unit = match unit.firing {
            Firing::Daily { today, .. } => today.to_string(),
            Firing::PerAppointment { target_date } => target_date.to_string(),
            Firing::Idle => return Ok(Prep::AlreadyFired),
        };
        let key = ClaimKey::new(&unit.tenant_id, &unit.rule.id, DedupScope::Automatic, claim_unit);
        let claim = match self.dedup.try_claim(key) {
            Ok(claim) => claim,
            Err(AvisosError::Race(key)) => return Ok(Prep::Raced(key)),
            Err(e) => return Err(e),
        };

        // Another worker may have committed between the snapshot and the claim.
        if unit.rule.schedule.is_daily() {
            let fresh = match self.configs.get_config(&unit.tenant_id).await {
                Ok(config) => config,
                Err(AvisosError::Configuration(e)) => return Ok(Prep::Invalid(unit.rule_error(e))),
                Err(e) => return Err(AvisosError::resolution(e.to_string())),
            };
            match fresh.as_ref().and_then(|c| c.rule(&unit.rule.id)) {
                Some(rule) if rule.enabled && self.dedup.should_fire(rule, now, unit.tz) => {
                    unit.rule.last_fired_at = rule.last_fired_at;
                }
                _ => return Ok(Prep::AlreadyFired),
            }
        }

        let definition = match self.template_definition(&unit.rule.message).await {
            Ok(def) => def,
            Err(e) => {
                tracing::warn!("⚠️ [{}] template catalog lookup failed: {e}", unit.tag());
                return Ok(Prep::Invalid(unit.rule_error(e)));
            }
        };

        let request = resolve_request(&unit, now);
        let recipients = self.resolver.resolve(&unit.rule.recipients, &request).await?;
        tracing::debug!("[{}] {} recipient(s) resolved", unit.tag(), recipients.len());

        Ok(Prep::Ready(Prepared {
            unit,
            recipients,
            definition,
            _claim: claim,
        }))
    }

    async fn template_definition(
        &self,
        message: &MessageSpec,
    ) -> Result<Option<TemplateDefinition>> {
        match message {
            MessageSpec::ProviderTemplate { name, language, .. } => {
                self.catalog.template_definition(name, language).await
            }
            MessageSpec::FreeText { .. } => Ok(None),
        }
    }

    /// Phase 2 for one unit. Rendering is all-or-nothing: a configuration error
    /// on any recipient skips the whole rule before anything is sent.
    async fn execute(
        &self,
        prepared: Prepared,
        scope: DedupScope,
        now: DateTime<Utc>,
    ) -> std::result::Result<DeliveryReport, ConfigurationError> {
        let Prepared {
            unit,
            recipients,
            definition,
            _claim,
        } = prepared;
        let rule = &unit.rule;
        let mut report = DeliveryReport::new(&unit.tenant_id, &rule.id, rule.kind.clone(), scope);

        let mut messages = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            if recipient.appointment_id.is_some()
                && !DedupTracker::receipt_pending(recipient, &rule.kind, scope, now, unit.tz)
            {
                report.outcomes.push(RecipientOutcome::Skipped {
                    recipient_id: recipient.id.clone(),
                    reason: "already notified".into(),
                });
                continue;
            }
            let message = render::render(
                &rule.message,
                definition.as_ref(),
                &recipient.context,
                RenderMeta {
                    tenant_id: &unit.tenant_id,
                    rule,
                    scope,
                    sender_id: unit.sender_id.as_deref(),
                    recipient,
                },
            )?;
            messages.push(message);
        }

        let outcomes = self.dispatcher.deliver(messages).await;
        for outcome in &outcomes {
            // Permanent rejections are recorded too, so the recipient is not
            // retried on every tick of the same day.
            let (appointment_id, receipt) = match outcome {
                RecipientOutcome::Sent {
                    recipient_id,
                    appointment_id: Some(appointment_id),
                    message_id,
                    ..
                } => (
                    appointment_id,
                    Receipt::sent(
                        rule.kind.clone(),
                        recipient_id,
                        scope,
                        now,
                        Some(message_id.clone()),
                    ),
                ),
                RecipientOutcome::Failed {
                    recipient_id,
                    appointment_id: Some(appointment_id),
                    error,
                    permanent: true,
                    ..
                } => (
                    appointment_id,
                    Receipt::rejected(rule.kind.clone(), recipient_id, scope, now, error.clone()),
                ),
                _ => continue,
            };
            let recipient_id = &receipt.recipient_id;
            match self
                .dedup
                .record_receipt(self.bookings.as_ref(), appointment_id, &receipt)
                .await
            {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    "⚠️ [{}] receipt for {recipient_id} on {appointment_id} already existed",
                    unit.tag()
                ),
                Err(e) => tracing::error!(
                    "❌ [{}] failed to record receipt for {recipient_id} on {appointment_id}: {e}",
                    unit.tag()
                ),
            }
        }
        report.outcomes.extend(outcomes);

        if scope == DedupScope::Automatic && rule.schedule.is_daily() && report.sent() > 0 {
            report.committed = match self
                .dedup
                .record_fired(self.configs.as_ref(), &unit.tenant_id, rule, now)
                .await
            {
                Ok(won) => won,
                Err(e) => {
                    tracing::error!("❌ [{}] failed to commit last_fired_at: {e}", unit.tag());
                    false
                }
            };
        }

        tracing::info!(
            "📣 [{}] {} sent, {} failed ({} rejected), {} skipped ({})",
            unit.tag(),
            report.sent(),
            report.failed(),
            report.permanently_failed(),
            report.skipped(),
            scope.as_str()
        );
        Ok(report)
    }

    /// Manual "send now" for one rule, optionally narrowed to one recipient
    /// (id or phone). Bypasses the window gate; uses the manual dedup scope and
    /// never touches the automatic `last_fired_at`.
    pub async fn trigger_manual(
        &self,
        tenant_id: &str,
        rule_id: &str,
        recipient: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryReport> {
        let config = self
            .configs
            .get_config(tenant_id)
            .await?
            .ok_or_else(|| AvisosError::not_found(format!("tenant '{tenant_id}'")))?;
        if let Some(rejected) = config.rejected.iter().find(|r| r.rule_id == rule_id) {
            return Err(rejected.error.clone().into());
        }
        let rule = config.rule(rule_id).cloned().ok_or_else(|| {
            AvisosError::not_found(format!("rule '{rule_id}' of tenant '{tenant_id}'"))
        })?;
        let tz = config.tz(self.default_tz)?;

        let claim = self.dedup.try_claim(ClaimKey::new(
            tenant_id,
            rule_id,
            DedupScope::Manual,
            recipient.unwrap_or("*"),
        ))?;

        let target_date = window::target_date(&rule.schedule, now, tz);
        let firing = if rule.schedule.is_daily() {
            Firing::Daily {
                today: window::local_date(now, tz),
                target_date,
            }
        } else {
            Firing::PerAppointment { target_date }
        };
        let unit = Unit {
            tenant_id: tenant_id.to_string(),
            sender_id: config.sender_id.clone(),
            tz,
            rule,
            firing,
        };

        tracing::info!(
            "👆 [{}] manual trigger (recipient: {})",
            unit.tag(),
            recipient.unwrap_or("all")
        );

        let definition = self.template_definition(&unit.rule.message).await?;
        let request = resolve_request(&unit, now);
        let mut recipients = self.resolver.resolve(&unit.rule.recipients, &request).await?;
        if let Some(wanted) = recipient {
            let wanted_phone = phone::normalize(wanted);
            recipients.retain(|r| r.id == wanted || Some(&r.address) == wanted_phone.as_ref());
            if recipients.is_empty() {
                tracing::warn!("⚠️ [{}] no recipient matches '{wanted}'", unit.tag());
            }
        }

        let prepared = Prepared {
            unit,
            recipients,
            definition,
            _claim: claim,
        };
        Ok(self.execute(prepared, DedupScope::Manual, now).await?)
    }

    /// Current dedup state of one tenant, for diagnostics.
    pub async fn dedup_state(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<DedupSnapshot> {
        self.dedup
            .tenant_snapshot(self.configs.as_ref(), tenant_id, self.default_tz, now)
            .await
    }
}

fn resolve_request<'a>(unit: &'a Unit, now: DateTime<Utc>) -> ResolveRequest<'a> {
    let days_before = match unit.rule.schedule {
        Schedule::DaysBeforeAppointment { days, .. } => Some(days),
        _ => None,
    };
    ResolveRequest {
        tenant_id: &unit.tenant_id,
        tz: unit.tz,
        now,
        target_date: unit
            .firing
            .target_date()
            .unwrap_or_else(|| window::local_date(now, unit.tz)),
        days_before,
    }
}

/// Time left until the next multiple of `period` since the Unix epoch.
/// With a 60s period this lands on wall-clock minute boundaries.
pub fn until_next_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let next = (now_ms.div_euclid(period_ms) + 1) * period_ms;
    Duration::from_millis((next - now_ms) as u64)
}

/// Spawn the scheduler loop as a background tokio task.
/// Ticks on period boundaries; the period follows [`ControlHandle::set_tick_period`].
///
/// [`ControlHandle::set_tick_period`]: crate::control::ControlHandle::set_tick_period
pub fn spawn_scheduler(
    engine: Arc<SchedulerEngine>,
    control: &crate::control::ControlHandle,
) -> tokio::task::JoinHandle<()> {
    let mut period_rx = control.subscribe();
    tokio::spawn(async move {
        tracing::info!(
            "⏰ Scheduler started (tick every {}s)",
            period_rx.borrow().as_secs()
        );
        loop {
            let period = *period_rx.borrow_and_update();
            let wait = until_next_boundary(Utc::now(), period);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = period_rx.changed() => {
                    if changed.is_err() {
                        tracing::info!("⏹️ Scheduler control dropped, stopping");
                        break;
                    }
                    tracing::info!("⏱️ Tick period set to {}s", period_rx.borrow().as_secs());
                    continue;
                }
            }

            let report = engine.tick(Utc::now()).await;
            if report.messages_sent() > 0 || !report.rule_errors.is_empty() {
                tracing::info!(
                    "📊 Tick done: {} message(s) sent, {} rule error(s), {} race(s)",
                    report.messages_sent(),
                    report.rule_errors.len(),
                    report.races.len()
                );
            }
        }
    })
}
