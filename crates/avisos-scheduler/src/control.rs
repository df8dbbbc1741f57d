//! Operator controls over a running scheduler: manual triggers, dedup
//! inspection and the tick period.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use avisos_core::error::{AvisosError, Result};

use crate::dedup::DedupSnapshot;
use crate::dispatch::DeliveryReport;
use crate::engine::SchedulerEngine;

/// Handle shared between the scheduler loop and its operators.
///
/// Dropping every clone stops the loop started by [`crate::engine::spawn_scheduler`].
#[derive(Clone)]
pub struct ControlHandle {
    engine: Arc<SchedulerEngine>,
    period: Arc<watch::Sender<Duration>>,
}

impl ControlHandle {
    pub fn new(engine: Arc<SchedulerEngine>, period: Duration) -> Self {
        let (tx, _rx) = watch::channel(period);
        Self {
            engine,
            period: Arc::new(tx),
        }
    }

    /// Send one rule now, optionally to a single recipient (id or phone).
    pub async fn trigger(
        &self,
        tenant_id: &str,
        rule_id: &str,
        recipient: Option<&str>,
    ) -> Result<DeliveryReport> {
        self.engine
            .trigger_manual(tenant_id, rule_id, recipient, Utc::now())
            .await
    }

    pub async fn dedup_state(&self, tenant_id: &str) -> Result<DedupSnapshot> {
        self.engine.dedup_state(tenant_id, Utc::now()).await
    }

    /// Change the tick period. Takes effect at the next boundary.
    pub fn set_tick_period(&self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(AvisosError::Config("tick period must be positive".into()));
        }
        self.period.send_replace(period);
        tracing::info!("⏱️ Tick period → {}s", period.as_secs());
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        *self.period.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Duration> {
        self.period.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::FakeClient;
    use crate::engine::spawn_scheduler;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use avisos_core::config::SchedulerConfig;
    use avisos_core::message::TemplateDefinition;
    use avisos_core::traits::TemplateCatalog;

    struct NoTemplates;

    #[async_trait]
    impl TemplateCatalog for NoTemplates {
        async fn template_definition(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<TemplateDefinition>> {
            Ok(None)
        }
    }

    fn engine() -> Arc<SchedulerEngine> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(
            SchedulerEngine::new(
                &SchedulerConfig::default(),
                store.clone(),
                store,
                Arc::new(NoTemplates),
                Arc::new(FakeClient::default()),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_tick_period_updates() {
        let control = ControlHandle::new(engine(), Duration::from_secs(60));
        let mut rx = control.subscribe();
        assert!(control.set_tick_period(Duration::ZERO).is_err());
        assert_eq!(control.tick_period(), Duration::from_secs(60));

        control.set_tick_period(Duration::from_secs(30)).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_not_found() {
        let control = ControlHandle::new(engine(), Duration::from_secs(60));
        let trigger = control.trigger("nobody", "daily_agents", None).await;
        assert!(matches!(trigger, Err(AvisosError::NotFound(_))));
        let state = control.dedup_state("nobody").await;
        assert!(matches!(state, Err(AvisosError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_loop_stops_when_control_dropped() {
        let engine = engine();
        let control = ControlHandle::new(Arc::clone(&engine), Duration::from_secs(3600));
        let handle = spawn_scheduler(engine, &control);
        drop(control);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler loop should stop")
            .unwrap();
    }
}
