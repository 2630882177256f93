//! Monitor engine: owns the per-entity state cache and drives samples
//! through the state machine, the notification gate and the store.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::dispatch::{dispatch, DispatchReport};
use super::state::{ConfirmedTransition, EntityMonitorState, Observation, ProbeSample};
use super::MonitorError;
use crate::config::SharedSettings;
use crate::db::{DbError, MonitoredEndpoint, StateStore};
use crate::notify::{self, Delivery, Notifier};
use crate::probe::Prober;

/// Static engine options taken from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub concurrency: usize,
    pub freshness_window: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            concurrency: 50,
            freshness_window: Duration::from_secs(3600),
        }
    }
}

/// What processing one sample did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleReport {
    pub observation: Option<Observation>,
    pub transition: Option<ConfirmedTransition>,
    pub delivery: Option<Delivery>,
}

pub struct Monitor {
    prober: Arc<dyn Prober>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    settings: SharedSettings,
    states: DashMap<String, EntityMonitorState>,
    /// Entities deconfigured while a probe may still be running for them.
    forgotten: DashSet<String>,
    options: MonitorOptions,
}

impl Monitor {
    pub fn new(
        prober: Arc<dyn Prober>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        settings: SharedSettings,
        options: MonitorOptions,
    ) -> Self {
        Self {
            prober,
            store,
            notifier,
            settings,
            states: DashMap::new(),
            forgotten: DashSet::new(),
            options,
        }
    }

    /// Restore persisted states younger than the freshness window.
    ///
    /// Records that fail validation are dropped; those entities start over
    /// from `unknown`.
    pub async fn restore(&self) -> Result<usize, MonitorError> {
        let store = self.store.clone();
        let window = self.options.freshness_window;
        let states = tokio::task::spawn_blocking(move || store.load_all_fresher_than(window))
            .await
            .map_err(|e| MonitorError::Task(e.to_string()))?
            .map_err(|e| MonitorError::Storage(e.to_string()))?;

        let mut restored = 0;
        for state in states {
            if let Err(e) = state.validate() {
                tracing::warn!(entity_id = %state.entity_id, "Not restoring invalid state: {}", e);
                continue;
            }
            self.states.insert(state.entity_id.clone(), state);
            restored += 1;
        }

        tracing::info!("Restored {} entity states", restored);
        Ok(restored)
    }

    /// Probe every enabled endpoint once, at most `concurrency` at a time.
    pub async fn run_tick(self: &Arc<Self>, mut endpoints: Vec<MonitoredEndpoint>) -> DispatchReport {
        let mut seen = HashSet::with_capacity(endpoints.len());
        endpoints.retain(|e| e.enabled && seen.insert(e.entity_id.clone()));

        let this = Arc::clone(self);
        let report = dispatch(endpoints, self.options.concurrency, move |endpoint: MonitoredEndpoint| {
            let this = this.clone();
            async move { this.process_endpoint(&endpoint).await.map(|_| ()) }
        })
        .await;

        tracing::debug!(
            "Tick finished: {} processed, {} failed, {} workers",
            report.processed,
            report.failed,
            report.workers
        );
        report
    }

    /// Probe one endpoint and feed the result into its state machine.
    pub async fn process_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<SampleReport, MonitorError> {
        if !endpoint.enabled {
            return Ok(SampleReport::default());
        }

        let reachable = match self.prober.probe(&endpoint.host, endpoint.port).await {
            Ok(outcome) => match outcome.reachable() {
                Some(r) => Some(r),
                None => return Ok(SampleReport::default()),
            },
            Err(e) => {
                tracing::warn!(entity_id = %endpoint.entity_id, "Dropping probe result: {}", e);
                None
            }
        };

        self.apply_sample(ProbeSample {
            entity_id: endpoint.entity_id.clone(),
            observed_at: Utc::now(),
            reachable,
        })
        .await
    }

    /// Apply one sample to its entity.
    ///
    /// A sample without a reading leaves the bookkeeping untouched but still
    /// lets a due pending state confirm.
    pub async fn apply_sample(&self, sample: ProbeSample) -> Result<SampleReport, MonitorError> {
        let settings = self.settings.snapshot();
        let entity_id = sample.entity_id.as_str();
        let now = sample.observed_at;

        if !self.states.contains_key(entity_id) {
            if sample.reachable.is_none() || self.forgotten.contains(entity_id) {
                return Ok(SampleReport::default());
            }
            let initial = self.load_or_new(entity_id, now).await;
            self.states.entry(entity_id.to_string()).or_insert(initial);

            // forget() marks before it evicts, so one side always sees the other
            if self.forgotten.contains(entity_id) {
                self.states.remove(entity_id);
                return Ok(SampleReport::default());
            }
        }

        let (observation, transition, mut snapshot) = {
            let Some(mut entry) = self.states.get_mut(entity_id) else {
                // Evicted while loading
                return Ok(SampleReport::default());
            };

            if let Err(source) = entry.validate() {
                drop(entry);
                self.states.remove(entity_id);
                return Err(MonitorError::Invariant {
                    entity_id: entity_id.to_string(),
                    source,
                });
            }

            let observation = sample.reachable.map(|r| entry.observe(r, now));
            let transition = entry.confirm_due(now, settings.debounce());
            (observation, transition, entry.clone())
        };

        if let Some(Observation::Adopted(state)) = observation {
            tracing::info!(entity_id, "Initial state {}", state);
        }

        let Some(transition) = transition else {
            return Ok(SampleReport {
                observation,
                ..Default::default()
            });
        };

        tracing::info!(
            entity_id,
            switch_count = transition.switch_count,
            unstable_since = ?transition.instability_started_at,
            "Confirmed transition {} -> {}",
            transition.from,
            transition.to
        );

        let delivery = notify::deliver(
            self.notifier.as_ref(),
            &transition,
            snapshot.last_notified_at,
            now,
            settings.cooldown(),
        )
        .await;

        if delivery == Delivery::Sent {
            snapshot.mark_notified(now);
            if let Some(mut entry) = self.states.get_mut(entity_id) {
                entry.mark_notified(now);
            }
        }

        self.persist(snapshot).await;

        Ok(SampleReport {
            observation,
            transition: Some(transition),
            delivery: Some(delivery),
        })
    }

    /// Load a usable persisted state, or start from unknown.
    ///
    /// Unusable rows are deleted: their revision would otherwise outrank
    /// every save of the new state.
    async fn load_or_new(&self, entity_id: &str, now: chrono::DateTime<Utc>) -> EntityMonitorState {
        let store = self.store.clone();
        let id = entity_id.to_string();
        let window = self.options.freshness_window;

        let loaded = tokio::task::spawn_blocking(move || -> Result<Option<EntityMonitorState>, DbError> {
            let reason = match store.load(&id) {
                Ok(None) => return Ok(None),
                Ok(Some(persisted)) if !persisted.is_fresh(now, window) => "stale".to_string(),
                Ok(Some(persisted)) => match persisted.state.validate() {
                    Ok(()) => return Ok(Some(persisted.state)),
                    Err(e) => format!("invalid: {}", e),
                },
                Err(DbError::Decode(e)) => format!("unreadable: {}", e),
                Err(e) => return Err(e),
            };

            tracing::debug!(entity_id = %id, "Discarding persisted state ({})", reason);
            store.delete(&id)?;
            Ok(None)
        })
        .await;

        match loaded {
            Ok(Ok(Some(state))) => return state,
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::warn!(entity_id, "Failed to load state: {}", e),
            Err(e) => tracing::warn!(entity_id, "State load task failed: {}", e),
        }

        EntityMonitorState::new(entity_id)
    }

    /// Save one state; failures are left for the next periodic flush.
    async fn persist(&self, state: EntityMonitorState) {
        if self.forgotten.contains(&state.entity_id) {
            return;
        }
        let store = self.store.clone();
        let entity_id = state.entity_id.clone();
        match tokio::task::spawn_blocking(move || store.save(&state)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(entity_id = %entity_id, "Failed to save state: {}", e),
            Err(e) => tracing::error!(entity_id = %entity_id, "State save task failed: {}", e),
        }
    }

    /// Write every cached state in one batch. Returns how many rows changed.
    pub async fn flush(&self) -> Result<usize, MonitorError> {
        let states: Vec<EntityMonitorState> = self
            .states
            .iter()
            .filter(|e| !self.forgotten.contains(e.key()))
            .map(|e| e.value().clone())
            .collect();
        let store = self.store.clone();

        tokio::task::spawn_blocking(move || store.save_all(&states))
            .await
            .map_err(|e| MonitorError::Task(e.to_string()))?
            .map_err(|e| MonitorError::Storage(e.to_string()))
    }

    /// Final flush, abandoned after `timeout`.
    pub async fn flush_with_timeout(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.flush()).await {
            Ok(Ok(n)) => {
                tracing::info!("Flushed {} entity states", n);
                true
            }
            Ok(Err(e)) => {
                tracing::error!("Final state flush failed: {}", e);
                false
            }
            Err(_) => {
                tracing::error!("Final state flush timed out after {:?}", timeout);
                false
            }
        }
    }

    /// Start the periodic safety-net flush. Send on the returned channel to stop it.
    pub fn start_periodic_flush(self: &Arc<Self>, every: Duration) -> broadcast::Sender<()> {
        let (tx, mut rx) = broadcast::channel(1);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut interval = tokio::time::interval_at(start, every);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        match this.flush().await {
                            Ok(n) => tracing::debug!("Periodic flush saved {} states", n),
                            Err(e) => tracing::error!("Periodic flush failed: {}", e),
                        }
                    }
                }
            }
        });

        tx
    }

    /// Drop an entity whose monitoring was deconfigured, in memory and in the store.
    ///
    /// The entity stays ignored, including by probes already running, until
    /// [`Monitor::resume`] is called for it.
    pub async fn forget(&self, entity_id: &str) -> Result<(), MonitorError> {
        self.forgotten.insert(entity_id.to_string());
        self.states.remove(entity_id);

        let store = self.store.clone();
        let id = entity_id.to_string();
        tokio::task::spawn_blocking(move || store.delete(&id))
            .await
            .map_err(|e| MonitorError::Task(e.to_string()))?
            .map_err(|e| MonitorError::Storage(e.to_string()))
    }

    /// Accept samples again for an entity whose monitoring was re-enabled.
    pub fn resume(&self, entity_id: &str) {
        self.forgotten.remove(entity_id);
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityMonitorState> {
        self.states.get(entity_id).map(|e| e.value().clone())
    }

    /// All cached states, ordered by entity id.
    pub fn states(&self) -> Vec<EntityMonitorState> {
        let mut states: Vec<_> = self.states.iter().map(|e| e.value().clone()).collect();
        states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}
