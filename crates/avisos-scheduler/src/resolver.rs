//! Recipient resolver: expands a selector into concrete, contactable recipients.
//!
//! Read-only: re-resolving with the same inputs yields the same recipients.
//! Receipts are copied onto each recipient; filtering on them happens downstream.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use avisos_core::error::{AvisosError, Result};
use avisos_core::message::{Recipient, RenderContext};
use avisos_core::model::{
    Agent, Appointment, AppointmentCriteria, Contact, DigestDetail, RecipientSelector,
};
use avisos_core::phone;
use avisos_core::traits::BookingStore;

use crate::window;

const NO_APPOINTMENTS: &str = "No hay turnos programados";
const NO_CLIENT: &str = "Sin cliente";

/// Appointment detail keys read by digest details.
const ORIGIN_KEY: &str = "origen";
const DESTINATION_KEY: &str = "destino";
const NOTES_KEY: &str = "notas_internas";

/// Inputs of one resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub tenant_id: &'a str,
    pub tz: Tz,
    pub now: DateTime<Utc>,
    /// Local date whose appointments are selected.
    pub target_date: NaiveDate,
    /// Set for `DaysBeforeAppointment(n)` rules: appointments must be exactly `n` days out.
    pub days_before: Option<u32>,
}

pub struct RecipientResolver {
    bookings: Arc<dyn BookingStore>,
}

impl RecipientResolver {
    pub fn new(bookings: Arc<dyn BookingStore>) -> Self {
        Self { bookings }
    }

    /// Expand `selector` for the request's target date.
    ///
    /// Store failures surface as [`AvisosError::Resolution`]; recipients with no
    /// usable phone number are logged and left out.
    pub async fn resolve(
        &self,
        selector: &RecipientSelector,
        req: &ResolveRequest<'_>,
    ) -> Result<Vec<Recipient>> {
        let (from, to) = window::day_bounds(req.target_date, req.tz);
        let mut appointments = self
            .bookings
            .appointments_between(req.tenant_id, from, to)
            .await
            .map_err(as_resolution)?;
        appointments
            .sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));

        match selector {
            RecipientSelector::AllAgents {
                agent_ids,
                only_with_appointments,
                details,
            } => {
                let agents = self
                    .bookings
                    .active_agents(req.tenant_id)
                    .await
                    .map_err(as_resolution)?;
                let digest = DigestOptions {
                    agent_ids,
                    only_with_appointments: *only_with_appointments,
                    details,
                };
                Ok(agent_recipients(agents, &digest, &appointments, req))
            }
            RecipientSelector::ClientsWithAppointmentMatching {
                criteria,
                client_ids,
            } => Ok(client_recipients(&appointments, criteria, client_ids, req)),
        }
    }
}

fn as_resolution(e: AvisosError) -> AvisosError {
    match e {
        AvisosError::Resolution(_) => e,
        other => AvisosError::resolution(other.to_string()),
    }
}

fn usable_address(tenant_id: &str, who: &str, id: &str, raw: Option<&str>) -> Option<String> {
    let address = raw.and_then(phone::normalize);
    if address.is_none() {
        tracing::warn!("📵 [{tenant_id}] {who} '{id}' has no usable phone number, skipped");
    }
    address
}

/// The `AllAgents` selector's options, borrowed from the rule.
struct DigestOptions<'a> {
    agent_ids: &'a [String],
    only_with_appointments: bool,
    details: &'a [DigestDetail],
}

fn agent_recipients(
    agents: Vec<Agent>,
    digest: &DigestOptions<'_>,
    appointments: &[Appointment],
    req: &ResolveRequest<'_>,
) -> Vec<Recipient> {
    let criteria = AppointmentCriteria::default();
    let wanted = |a: &Agent| digest.agent_ids.is_empty() || digest.agent_ids.contains(&a.id);
    let mut agents: Vec<Agent> = agents.into_iter().filter(|a| a.active && wanted(a)).collect();
    agents.sort_by(|a, b| a.id.cmp(&b.id));

    let mut recipients = Vec::new();
    for agent in agents {
        let own: Vec<&Appointment> = appointments
            .iter()
            .filter(|a| a.agent_id.as_deref() == Some(agent.id.as_str()))
            .filter(|a| criteria.accepts(a.status))
            .collect();
        if digest.only_with_appointments && own.is_empty() {
            tracing::debug!(
                "[{}] agent '{}' has no appointments, skipped",
                req.tenant_id,
                agent.id
            );
            continue;
        }
        let phone = agent.phone.as_deref();
        let Some(address) = usable_address(req.tenant_id, "agent", &agent.id, phone) else {
            continue;
        };

        let mut context = RenderContext::new();
        context.insert("agente".into(), agent.name.clone());
        context.insert("nombre_agente".into(), agent.name.clone());
        context.insert("nombre".into(), agent.name.clone());
        context.insert("fecha".into(), req.target_date.format("%d/%m/%Y").to_string());
        context.insert("cantidad_turnos".into(), own.len().to_string());
        let list = appointment_list(&own, digest.details, req.tz);
        context.insert("turnos".into(), list.clone());
        context.insert("appointment_list".into(), list);

        recipients.push(Recipient {
            id: agent.id,
            name: agent.name,
            address,
            appointment_id: None,
            context,
            prior_receipts: Vec::new(),
        });
    }
    recipients
}

/// `1. 09:30 - Ana | Origen: X | Destino: Y || 2. ...`
///
/// Time and client name lead each line and the other `details` follow, each
/// group in the order given. Blank values are left out.
pub fn appointment_list(
    appointments: &[&Appointment],
    details: &[DigestDetail],
    tz: Tz,
) -> String {
    if appointments.is_empty() {
        return NO_APPOINTMENTS.to_string();
    }
    appointments
        .iter()
        .enumerate()
        .map(|(i, appt)| digest_line(i + 1, appt, details, tz))
        .collect::<Vec<_>>()
        .join(" || ")
}

fn digest_line(n: usize, appt: &Appointment, details: &[DigestDetail], tz: Tz) -> String {
    let detail = |key: &str| {
        appt.details
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut lead = Vec::new();
    let mut extra = Vec::new();
    for d in details {
        match d {
            DigestDetail::BookingTime => {
                lead.push(appt.start_time.with_timezone(&tz).format("%H:%M").to_string())
            }
            DigestDetail::ClientName => lead.push(
                appt.client
                    .as_ref()
                    .map_or(NO_CLIENT.to_string(), |c| c.name.clone()),
            ),
            DigestDetail::ClientPhone => {
                let phone = appt.client.as_ref().and_then(|c| c.phone.as_deref());
                if let Some(phone) = phone.filter(|p| !p.trim().is_empty()) {
                    extra.push(format!("Tel: {phone}"));
                }
            }
            DigestDetail::Origin => {
                extra.extend(detail(ORIGIN_KEY).map(|v| format!("Origen: {v}")))
            }
            DigestDetail::Destination => {
                extra.extend(detail(DESTINATION_KEY).map(|v| format!("Destino: {v}")))
            }
            DigestDetail::InternalNotes => {
                extra.extend(detail(NOTES_KEY).map(|v| format!("Notas: {v}")))
            }
        }
    }

    let mut line = format!("{n}.");
    if !lead.is_empty() {
        line.push(' ');
        line.push_str(&lead.join(" - "));
    }
    for part in extra {
        line.push_str(" | ");
        line.push_str(&part);
    }
    line
}

fn client_recipients(
    appointments: &[Appointment],
    criteria: &AppointmentCriteria,
    client_ids: &[String],
    req: &ResolveRequest<'_>,
) -> Vec<Recipient> {
    let mut recipients = Vec::new();
    for appt in appointments {
        if !criteria.accepts(appt.status) || appt.start_time <= req.now {
            continue;
        }
        if let Some(days) = req.days_before {
            if !window::appointment_due(days, appt.start_time, req.now, req.tz) {
                continue;
            }
        }
        for contact in appt.participants() {
            if !client_ids.is_empty() && !client_ids.contains(&contact.id) {
                continue;
            }
            let Some(address) =
                usable_address(req.tenant_id, "contact", &contact.id, contact.phone.as_deref())
            else {
                continue;
            };
            recipients.push(Recipient {
                id: contact.id.clone(),
                name: contact.name.clone(),
                address,
                appointment_id: Some(appt.id.clone()),
                context: client_context(appt, contact, req.tz),
                prior_receipts: appt.receipts.clone(),
            });
        }
    }
    recipients
}

fn client_context(appt: &Appointment, contact: &Contact, tz: Tz) -> RenderContext {
    let local = appt.start_time.with_timezone(&tz);
    let mut context: RenderContext = appt
        .details
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    context.insert("nombre".into(), contact.name.clone());
    context.insert("cliente".into(), contact.name.clone());
    context.insert("nombre_cliente".into(), contact.name.clone());
    context.insert("fecha".into(), local.format("%d/%m/%Y").to_string());
    context.insert("hora".into(), local.format("%H:%M").to_string());
    context.insert("fecha_hora".into(), local.format("%d/%m/%Y %H:%M").to_string());
    context.insert("estado".into(), appt.status.as_str().to_string());
    context.insert("turno_id".into(), appt.id.clone());
    context
}
