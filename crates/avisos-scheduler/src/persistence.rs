//! SQLite-backed configuration and booking store.
//! Documents are kept exactly as administrative tooling writes them; fire state
//! and receipts live in their own tables so every engine write is conditional.
//!
//! rusqlite is synchronous, so every async store call runs its queries on the
//! blocking thread pool.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde_json::Value;

use avisos_core::document;
use avisos_core::error::{AvisosError, ConfigurationError, Result};
use avisos_core::model::{
    Agent, Appointment, AppointmentStatus, Contact, DedupScope, NotificationConfig, Receipt,
    ReceiptOutcome,
};
use avisos_core::traits::{BookingStore, ConfigField, ConfigSnapshot, ConfigStore};

use crate::store::{apply_fire_state, fire_state_accepts};

/// Lexicographically sortable UTC timestamp.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> AvisosError + '_ {
    move |e| AvisosError::store(format!("{context}: {e}"))
}

fn resolution_err(context: &str) -> impl Fn(rusqlite::Error) -> AvisosError + '_ {
    move |e| AvisosError::resolution(format!("{context}: {e}"))
}

fn lock(conn: &Mutex<rusqlite::Connection>) -> Result<MutexGuard<'_, rusqlite::Connection>> {
    conn.lock()
        .map_err(|_| AvisosError::store("connection mutex poisoned"))
}

/// SQLite store for configs, fire state, agents, appointments and receipts.
pub struct SqliteStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStore {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err("busy_timeout"))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        lock(&self.conn)
    }

    /// Run `f` with the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| AvisosError::store(format!("spawn: {e}")))?
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            -- One loosely-typed document per tenant
            CREATE TABLE IF NOT EXISTS notification_configs (
                tenant_id TEXT PRIMARY KEY,
                document TEXT NOT NULL,          -- JSON, as written by tooling
                updated_at TEXT NOT NULL
            );

            -- Rule-level dedup, advanced only by conditional writes
            CREATE TABLE IF NOT EXISTS rule_fire_state (
                tenant_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                last_fired_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, rule_id)
            );

            CREATE TABLE IF NOT EXISTS agents (
                tenant_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                phone TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (tenant_id, id)
            );

            CREATE TABLE IF NOT EXISTS appointments (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                status TEXT NOT NULL,
                agent_id TEXT,
                client TEXT,                     -- JSON contact
                guests TEXT NOT NULL DEFAULT '[]',   -- JSON array of contacts
                details TEXT NOT NULL DEFAULT '{}'   -- JSON object
            );
            CREATE INDEX IF NOT EXISTS idx_appointments_tenant_start
                ON appointments(tenant_id, start_time);

            -- Per-appointment dedup
            CREATE TABLE IF NOT EXISTS appointment_receipts (
                appointment_id TEXT NOT NULL,
                rule_kind TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                scope TEXT NOT NULL,             -- 'automatic', 'manual'
                sent_at TEXT NOT NULL,
                message_id TEXT,
                outcome TEXT NOT NULL DEFAULT 'sent',   -- 'sent', 'rejected'
                error TEXT,
                PRIMARY KEY (appointment_id, rule_kind, recipient_id, scope)
            );
         ",
        )
        .map_err(db_err("Migration"))?;

        // Databases created before rejections were recorded.
        let _ = conn.execute(
            "ALTER TABLE appointment_receipts ADD COLUMN outcome TEXT NOT NULL DEFAULT 'sent'",
            [],
        );
        let _ = conn.execute("ALTER TABLE appointment_receipts ADD COLUMN error TEXT", []);
        Ok(())
    }

    // ─── Booking data ─────────────────────────────────────────

    pub fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO agents (tenant_id, id, name, phone, active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    agent.tenant_id,
                    agent.id,
                    agent.name,
                    agent.phone,
                    agent.active as i32
                ],
            )
            .map_err(db_err("Save agent"))?;
        Ok(())
    }

    /// Insert or replace an appointment. Existing receipts are kept.
    pub fn upsert_appointment(&self, appt: &Appointment) -> Result<()> {
        let client = appt.client.as_ref().map(serde_json::to_string).transpose()?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO appointments
                 (id, tenant_id, start_time, status, agent_id, client, guests, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    appt.id,
                    appt.tenant_id,
                    ts(appt.start_time),
                    appt.status.as_str(),
                    appt.agent_id,
                    client,
                    serde_json::to_string(&appt.guests)?,
                    serde_json::to_string(&appt.details)?,
                ],
            )
            .map_err(db_err("Save appointment"))?;
        Ok(())
    }

    fn receipts_for(conn: &rusqlite::Connection, appointment_id: &str) -> Result<Vec<Receipt>> {
        let mut stmt = conn
            .prepare(
                "SELECT rule_kind, recipient_id, scope, sent_at, message_id, outcome, error
                 FROM appointment_receipts WHERE appointment_id = ?1 ORDER BY sent_at",
            )
            .map_err(db_err("Load receipts"))?;
        let rows = stmt
            .query_map([appointment_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(db_err("Load receipts"))?;

        let mut receipts = Vec::new();
        for row in rows {
            let (kind, recipient_id, scope, sent_at, message_id, outcome, error) =
                row.map_err(db_err("Load receipts"))?;
            let (Ok(scope), Some(sent_at), Ok(outcome)) = (
                scope.parse::<DedupScope>(),
                parse_ts(&sent_at),
                outcome.parse::<ReceiptOutcome>(),
            ) else {
                tracing::warn!("⚠️ Skipping unreadable receipt on appointment {appointment_id}");
                continue;
            };
            receipts.push(Receipt {
                rule_kind: kind.into(),
                recipient_id,
                scope,
                sent_at,
                message_id,
                outcome,
                error,
            });
        }
        Ok(receipts)
    }

    // ─── Config documents ─────────────────────────────────────

    fn fire_state(
        conn: &rusqlite::Connection,
        tenant_id: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let mut stmt = conn
            .prepare("SELECT rule_id, last_fired_at FROM rule_fire_state WHERE tenant_id = ?1")
            .map_err(db_err("Load fire state"))?;
        let rows = stmt
            .query_map([tenant_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err("Load fire state"))?;
        let mut state = Vec::new();
        for row in rows {
            let (rule_id, at) = row.map_err(db_err("Load fire state"))?;
            if let Some(at) = parse_ts(&at) {
                state.push((rule_id, at));
            }
        }
        Ok(state)
    }

    fn load_config(
        conn: &rusqlite::Connection,
        tenant_id: &str,
        raw: &str,
    ) -> Result<std::result::Result<NotificationConfig, ConfigurationError>> {
        let doc: Value = match serde_json::from_str(raw) {
            Ok(doc) => doc,
            Err(e) => return Ok(Err(ConfigurationError::MalformedDocument(e.to_string()))),
        };
        let mut config = match NotificationConfig::from_document(&doc) {
            Ok(config) => config,
            Err(e) => return Ok(Err(e)),
        };
        apply_fire_state(&mut config, Self::fire_state(conn, tenant_id)?);
        Ok(Ok(config))
    }

    fn document(conn: &rusqlite::Connection, tenant_id: &str) -> Result<Option<String>> {
        conn.query_row(
            "SELECT document FROM notification_configs WHERE tenant_id = ?1",
            [tenant_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("Load config"))
    }
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn get_config(&self, tenant_id: &str) -> Result<Option<NotificationConfig>> {
        let tenant_id = tenant_id.to_string();
        self.blocking(move |conn| match Self::document(conn, &tenant_id)? {
            None => Ok(None),
            Some(raw) => Ok(Some(Self::load_config(conn, &tenant_id, &raw)??)),
        })
        .await
    }

    async fn all_configs(&self) -> Result<Vec<ConfigSnapshot>> {
        self.blocking(|conn| {
            let docs: Vec<(String, String)> = {
                let mut stmt = conn
                    .prepare(
                        "SELECT tenant_id, document FROM notification_configs ORDER BY tenant_id",
                    )
                    .map_err(db_err("Load configs"))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(db_err("Load configs"))?;
                rows.collect::<std::result::Result<_, _>>()
                    .map_err(db_err("Load configs"))?
            };
            docs.into_iter()
                .map(|(tenant_id, raw)| -> Result<ConfigSnapshot> {
                    let config = Self::load_config(conn, &tenant_id, &raw)?;
                    Ok(ConfigSnapshot { tenant_id, config })
                })
                .collect()
        })
        .await
    }

    async fn set_last_fired(
        &self,
        tenant_id: &str,
        rule_id: &str,
        expected: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let (tenant_id, rule_id) = (tenant_id.to_string(), rule_id.to_string());
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err("Begin"))?;

            let stored: Option<String> = tx
                .query_row(
                    "SELECT last_fired_at FROM rule_fire_state
                     WHERE tenant_id = ?1 AND rule_id = ?2",
                    [&tenant_id, &rule_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err("Load fire state"))?;

            let current = match stored {
                Some(s) => parse_ts(&s),
                // Fall back to a value seeded in the document itself.
                None => Self::document(&tx, &tenant_id)?
                    .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                    .and_then(|doc| NotificationConfig::from_document(&doc).ok())
                    .and_then(|c| c.rule(&rule_id).and_then(|r| r.last_fired_at)),
            };
            if !fire_state_accepts(current, expected, fired_at) {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO rule_fire_state (tenant_id, rule_id, last_fired_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(tenant_id, rule_id)
                 DO UPDATE SET last_fired_at = excluded.last_fired_at",
                rusqlite::params![tenant_id, rule_id, ts(fired_at)],
            )
            .map_err(db_err("Save fire state"))?;
            tx.commit().map_err(db_err("Commit"))?;
            Ok(true)
        })
        .await
    }

    async fn clear_field(&self, tenant_id: &str, field: &ConfigField) -> Result<()> {
        let (tenant_id, field) = (tenant_id.to_string(), field.clone());
        self.blocking(move |conn| {
            let raw = Self::document(conn, &tenant_id)?
                .ok_or_else(|| AvisosError::not_found(format!("tenant '{tenant_id}'")))?;
            let mut doc: Value = serde_json::from_str(&raw)?;
            document::clear_field(&mut doc, &field)?;
            conn.execute(
                "UPDATE notification_configs SET document = ?2, updated_at = ?3
                 WHERE tenant_id = ?1",
                rusqlite::params![tenant_id, doc.to_string(), ts(Utc::now())],
            )
            .map_err(db_err("Save config"))?;
            if matches!(field, ConfigField::DailyAgentRule) {
                conn.execute(
                    "DELETE FROM rule_fire_state WHERE tenant_id = ?1 AND rule_id = ?2",
                    [tenant_id.as_str(), avisos_core::model::DAILY_AGENT_RULE_ID],
                )
                .map_err(db_err("Clear fire state"))?;
            }
            Ok(())
        })
        .await
    }

    async fn put_document(&self, doc: &Value) -> Result<String> {
        let config = NotificationConfig::from_document(doc)?;
        for rejected in &config.rejected {
            tracing::warn!(
                "⚠️ [{}] rule '{}' stored but rejected: {}",
                config.tenant_id,
                rejected.rule_id,
                rejected.error
            );
        }
        let (tenant_id, raw) = (config.tenant_id, doc.to_string());
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO notification_configs (tenant_id, document, updated_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![tenant_id, raw, ts(Utc::now())],
            )
            .map_err(db_err("Save config"))?;
            Ok(tenant_id)
        })
        .await
    }
}

#[async_trait]
impl BookingStore for SqliteStore {
    async fn active_agents(&self, tenant_id: &str) -> Result<Vec<Agent>> {
        let tenant_id = tenant_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, phone FROM agents
                     WHERE tenant_id = ?1 AND active = 1 ORDER BY id",
                )
                .map_err(resolution_err("Load agents"))?;
            let rows = stmt
                .query_map([&tenant_id], |row| {
                    Ok(Agent {
                        id: row.get(0)?,
                        tenant_id: tenant_id.clone(),
                        name: row.get(1)?,
                        phone: row.get(2)?,
                        active: true,
                    })
                })
                .map_err(resolution_err("Load agents"))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(resolution_err("Load agents"))
        })
        .await
    }

    async fn appointments_between(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>> {
        type Row = (String, String, String, Option<String>, Option<String>, String, String);

        let tenant_id = tenant_id.to_string();
        self.blocking(move |conn| {
            let raw: Vec<Row> = {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, start_time, status, agent_id, client, guests, details
                         FROM appointments
                         WHERE tenant_id = ?1 AND start_time >= ?2 AND start_time < ?3
                         ORDER BY start_time, id",
                    )
                    .map_err(resolution_err("Load appointments"))?;
                let rows = stmt
                    .query_map(rusqlite::params![tenant_id, ts(from), ts(to)], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })
                    .map_err(resolution_err("Load appointments"))?;
                rows.collect::<std::result::Result<_, _>>()
                    .map_err(resolution_err("Load appointments"))?
            };

            let mut appointments = Vec::with_capacity(raw.len());
            for (id, start, status, agent_id, client, guests, details) in raw {
                let status: Option<AppointmentStatus> =
                    serde_json::from_value(Value::String(status)).ok();
                let (Some(start_time), Some(status)) = (parse_ts(&start), status) else {
                    tracing::warn!(
                        "⚠️ [{tenant_id}] appointment {id} has unreadable start/status, skipped"
                    );
                    continue;
                };
                let client: Option<Contact> = client.and_then(|c| serde_json::from_str(&c).ok());
                appointments.push(Appointment {
                    receipts: Self::receipts_for(conn, &id)?,
                    id,
                    tenant_id: tenant_id.clone(),
                    start_time,
                    status,
                    agent_id,
                    client,
                    guests: serde_json::from_str(&guests).unwrap_or_default(),
                    details: serde_json::from_str(&details).unwrap_or_default(),
                });
            }
            Ok(appointments)
        })
        .await
    }

    /// A delivery is never overwritten; an earlier rejection is.
    async fn record_receipt(&self, appointment_id: &str, receipt: &Receipt) -> Result<bool> {
        let (appointment_id, receipt) = (appointment_id.to_string(), receipt.clone());
        self.blocking(move |conn| {
            let changed = conn
                .execute(
                    "INSERT INTO appointment_receipts
                     (appointment_id, rule_kind, recipient_id, scope, sent_at, message_id,
                      outcome, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(appointment_id, rule_kind, recipient_id, scope) DO UPDATE SET
                        sent_at = excluded.sent_at,
                        message_id = excluded.message_id,
                        outcome = excluded.outcome,
                        error = excluded.error
                     WHERE appointment_receipts.outcome <> 'sent'",
                    rusqlite::params![
                        appointment_id,
                        receipt.rule_kind.as_str(),
                        receipt.recipient_id,
                        receipt.scope.as_str(),
                        ts(receipt.sent_at),
                        receipt.message_id,
                        receipt.outcome.as_str(),
                        receipt.error,
                    ],
                )
                .map_err(db_err("Save receipt"))?;
            Ok(changed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avisos_core::model::RuleKind;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn doc() -> Value {
        json!({
            "empresaId": "acme",
            "timezone": "America/Argentina/Buenos_Aires",
            "daily_agent_rule": {
                "kind": "digest",
                "recipients": {"type": "all_agents"},
                "schedule": {"type": "fixed_time_of_day", "at": "09:00"},
                "message": {"type": "provider_template", "name": "daily_digest", "language": "es"},
                "last_fired_at": "2024-03-03T12:00:00Z"
            }
        })
    }

    fn appointment(id: &str, start: DateTime<Utc>) -> Appointment {
        let mut details = BTreeMap::new();
        details.insert("origen".to_string(), "Corrientes".to_string());
        Appointment {
            id: id.into(),
            tenant_id: "acme".into(),
            start_time: start,
            status: AppointmentStatus::Confirmed,
            agent_id: Some("ag1".into()),
            client: Some(Contact {
                id: "c1".into(),
                name: "Ana".into(),
                phone: Some("5491100000001".into()),
            }),
            guests: vec![],
            details,
            receipts: vec![],
        }
    }

    #[tokio::test]
    async fn test_document_roundtrip_and_legacy_seed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("avisos.db")).unwrap();
        assert_eq!(store.put_document(&doc()).await.unwrap(), "acme");

        let seeded = Utc.with_ymd_and_hms(2024, 3, 3, 12, 0, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let config = store.get_config("acme").await.unwrap().unwrap();
        assert_eq!(config.daily_agent_rule.as_ref().unwrap().last_fired_at, Some(seeded));

        assert!(!store.set_last_fired("acme", "daily_agents", None, next).await.unwrap());
        assert!(store.set_last_fired("acme", "daily_agents", Some(seeded), next).await.unwrap());
        assert!(!store.set_last_fired("acme", "daily_agents", Some(seeded), next).await.unwrap());

        let snapshots = store.all_configs().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        let config = snapshots[0].config.as_ref().unwrap();
        assert_eq!(config.daily_agent_rule.as_ref().unwrap().last_fired_at, Some(next));
    }

    #[tokio::test]
    async fn test_malformed_document_is_isolated() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_document(&doc()).await.unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO notification_configs VALUES ('broken', '{not json', '')",
                [],
            )
            .unwrap();
        let snapshots = store.all_configs().await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().any(|s| s.tenant_id == "broken" && s.config.is_err()));
        assert!(snapshots.iter().any(|s| s.tenant_id == "acme" && s.config.is_ok()));
    }

    #[tokio::test]
    async fn test_appointments_window_and_receipts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inside = Utc.with_ymd_and_hms(2024, 5, 10, 18, 0, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2024, 5, 11, 3, 0, 0).unwrap();
        store.upsert_appointment(&appointment("t1", inside)).unwrap();
        store.upsert_appointment(&appointment("t2", outside)).unwrap();

        let receipt = Receipt::sent(
            RuleKind::Reminder,
            "c1",
            DedupScope::Automatic,
            inside,
            Some("wamid.1".into()),
        );
        assert!(store.record_receipt("t1", &receipt).await.unwrap());
        assert!(!store.record_receipt("t1", &receipt).await.unwrap());

        let from = Utc.with_ymd_and_hms(2024, 5, 10, 3, 0, 0).unwrap();
        let found = store.appointments_between("acme", from, outside).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "t1");
        assert_eq!(found[0].details["origen"], "Corrientes");
        assert!(found[0].has_receipt(&RuleKind::Reminder, "c1", DedupScope::Automatic));
    }

    #[tokio::test]
    async fn test_rejection_receipt_is_replaced_by_delivery() {
        let store = SqliteStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 10, 18, 0, 0).unwrap();
        store.upsert_appointment(&appointment("t1", start)).unwrap();

        let at = Utc.with_ymd_and_hms(2024, 5, 9, 13, 0, 0).unwrap();
        let rejected = Receipt::rejected(
            RuleKind::Reminder,
            "c1",
            DedupScope::Automatic,
            at,
            "provider rejected message (400): invalid number",
        );
        assert!(store.record_receipt("t1", &rejected).await.unwrap());

        let window = (start - chrono::Duration::hours(12), start + chrono::Duration::hours(1));
        let found = store.appointments_between("acme", window.0, window.1).await.unwrap();
        assert_eq!(found[0].receipts.len(), 1);
        assert_eq!(found[0].receipts[0].outcome, ReceiptOutcome::Rejected);
        assert!(!found[0].has_receipt(&RuleKind::Reminder, "c1", DedupScope::Automatic));

        let later = at + chrono::Duration::days(1);
        let sent = Receipt::sent(
            RuleKind::Reminder,
            "c1",
            DedupScope::Automatic,
            later,
            Some("wamid.9".into()),
        );
        assert!(store.record_receipt("t1", &sent).await.unwrap());
        // A later rejection never downgrades a delivery.
        assert!(!store.record_receipt("t1", &rejected).await.unwrap());

        let found = store.appointments_between("acme", window.0, window.1).await.unwrap();
        let receipt = &found[0].receipts[0];
        assert_eq!(found[0].receipts.len(), 1);
        assert_eq!(receipt.outcome, ReceiptOutcome::Sent);
        assert_eq!(receipt.message_id.as_deref(), Some("wamid.9"));
        assert!(receipt.error.is_none());
    }

    #[tokio::test]
    async fn test_legacy_receipts_table_gains_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avisos.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE appointment_receipts (
                    appointment_id TEXT NOT NULL,
                    rule_kind TEXT NOT NULL,
                    recipient_id TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    sent_at TEXT NOT NULL,
                    message_id TEXT,
                    PRIMARY KEY (appointment_id, rule_kind, recipient_id, scope)
                );
                INSERT INTO appointment_receipts VALUES
                    ('t1', 'reminder', 'c1', 'automatic', '2024-05-09T13:00:00.000Z', 'wamid.1');",
            )
            .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 10, 18, 0, 0).unwrap();
        store.upsert_appointment(&appointment("t1", start)).unwrap();
        let found = store
            .appointments_between("acme", start, start + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(found[0].receipts[0].outcome, ReceiptOutcome::Sent);
    }

    #[tokio::test]
    async fn test_agents_and_clear_sender() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut d = doc();
        d["phoneNumberId"] = json!("555");
        store.put_document(&d).await.unwrap();
        assert_eq!(
            store.get_config("acme").await.unwrap().unwrap().sender_id.as_deref(),
            Some("555")
        );
        store.clear_field("acme", &ConfigField::SenderId).await.unwrap();
        assert!(store.get_config("acme").await.unwrap().unwrap().sender_id.is_none());

        for (id, active) in [("ag1", true), ("ag2", false)] {
            store
                .upsert_agent(&Agent {
                    id: id.into(),
                    tenant_id: "acme".into(),
                    name: id.to_uppercase(),
                    phone: Some("5491100000009".into()),
                    active,
                })
                .unwrap();
        }
        let agents = store.active_agents("acme").await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "ag1");
    }
}
