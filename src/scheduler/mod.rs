//! Scheduler module for driving fleet-wide probe ticks.
//!
//! The tick interval is fixed when the scheduler (re)starts: either the
//! operator override or a step function of the fleet size at that moment.
//! At most one tick runs at a time, across restarts too; a tick that comes
//! due while the previous one is still running is skipped, not queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::SharedSettings;
use crate::db::{DbError, FleetSource};
use crate::monitor::Monitor;

/// Tick interval for a fleet, unless the override is set.
pub fn tick_interval(fleet_size: usize, interval_override: Option<Duration>) -> Duration {
    if let Some(interval) = interval_override {
        return interval;
    }

    match fleet_size {
        0..=49 => Duration::from_secs(2),
        50..=199 => Duration::from_secs(5),
        200..=999 => Duration::from_secs(10),
        _ => Duration::from_secs(30),
    }
}

/// Tick counters, shared with the running loop.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub ticks_started: AtomicU64,
    pub ticks_skipped: AtomicU64,
}

struct RunningLoop {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    interval: Duration,
}

/// The main scheduler that orchestrates fleet ticks.
pub struct Scheduler {
    monitor: Arc<Monitor>,
    fleet: Arc<dyn FleetSource>,
    settings: SharedSettings,
    stats: Arc<SchedulerStats>,
    running: Mutex<Option<RunningLoop>>,
    /// Set while a tick is probing. Shared by every loop this scheduler starts.
    in_flight: Arc<AtomicBool>,
    /// Handle of the most recently spawned tick.
    tick_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Create a new scheduler over the given fleet.
    pub fn new(monitor: Arc<Monitor>, fleet: Arc<dyn FleetSource>, settings: SharedSettings) -> Self {
        Self {
            monitor,
            fleet,
            settings,
            stats: Arc::new(SchedulerStats::default()),
            running: Mutex::new(None),
            in_flight: Arc::new(AtomicBool::new(false)),
            tick_task: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Interval of the running loop, if any.
    pub async fn current_interval(&self) -> Option<Duration> {
        self.running.lock().await.as_ref().map(|r| r.interval)
    }

    /// Start ticking. Returns the chosen interval.
    ///
    /// Does nothing but report the interval if already running.
    pub async fn start(&self) -> Result<Duration, DbError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.interval);
        }

        let fleet_size = count_enabled(self.fleet.clone()).await?;
        let interval = tick_interval(fleet_size, self.settings.snapshot().interval_override());

        tracing::info!(
            "Starting scheduler with {} endpoints, tick every {:?}",
            fleet_size,
            interval
        );

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_tick_loop(
            self.monitor.clone(),
            self.fleet.clone(),
            self.stats.clone(),
            self.in_flight.clone(),
            self.tick_task.clone(),
            interval,
            stop_rx,
        ));

        *running = Some(RunningLoop {
            stop_tx,
            handle,
            interval,
        });
        Ok(interval)
    }

    /// Stop ticking and wait for a tick already in flight to finish.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(r) = running.take() else {
            return;
        };

        let _ = r.stop_tx.send(());
        if let Err(e) = r.handle.await {
            tracing::error!("Scheduler loop ended abnormally: {}", e);
        }

        // The loop is gone, so no further tick can replace this handle
        let last_tick = self
            .tick_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tick) = last_tick {
            if !tick.is_finished() {
                tracing::info!("Waiting for the running tick to finish");
            }
            if let Err(e) = tick.await {
                tracing::error!("Tick ended abnormally: {}", e);
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Stop and start again, recomputing the interval from the current fleet.
    pub async fn restart(&self) -> Result<Duration, DbError> {
        self.stop().await;
        self.start().await
    }
}

async fn count_enabled(fleet: Arc<dyn FleetSource>) -> Result<usize, DbError> {
    let endpoints = tokio::task::spawn_blocking(move || fleet.list_endpoints())
        .await
        .map_err(|e| DbError::Task(e.to_string()))??;
    Ok(endpoints.iter().filter(|e| e.enabled).count())
}

/// Releases the in-flight flag when the tick task ends, even by panic.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_tick_loop(
    monitor: Arc<Monitor>,
    fleet: Arc<dyn FleetSource>,
    stats: Arc<SchedulerStats>,
    in_flight: Arc<AtomicBool>,
    tick_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                if in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Skipping tick: previous tick still running");
                    continue;
                }
                stats.ticks_started.fetch_add(1, Ordering::Relaxed);

                let guard = InFlightGuard(in_flight.clone());
                let monitor = monitor.clone();
                let fleet = fleet.clone();

                let tick = tokio::spawn(async move {
                    let _guard = guard;

                    let endpoints = match tokio::task::spawn_blocking(move || fleet.list_endpoints()).await {
                        Ok(Ok(endpoints)) => endpoints,
                        Ok(Err(e)) => {
                            tracing::error!("Failed to load fleet: {}", e);
                            return;
                        }
                        Err(e) => {
                            tracing::error!("Fleet query task failed: {}", e);
                            return;
                        }
                    };

                    monitor.run_tick(endpoints).await;
                });
                *tick_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(tick);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorSettings;
    use crate::db::{MonitoredEndpoint, PersistedState, StateStore};
    use crate::monitor::testing::TableProber;
    use crate::monitor::{EntityMonitorState, MonitorOptions};
    use crate::notify::LogNotifier;

    struct StaticFleet(Vec<MonitoredEndpoint>);

    impl FleetSource for StaticFleet {
        fn list_endpoints(&self) -> Result<Vec<MonitoredEndpoint>, DbError> {
            Ok(self.0.clone())
        }
    }

    /// Store that keeps nothing.
    struct NullStore;

    impl StateStore for NullStore {
        fn load(&self, _: &str) -> Result<Option<PersistedState>, DbError> {
            Ok(None)
        }
        fn load_all_fresher_than(&self, _: Duration) -> Result<Vec<EntityMonitorState>, DbError> {
            Ok(Vec::new())
        }
        fn save(&self, _: &EntityMonitorState) -> Result<(), DbError> {
            Ok(())
        }
        fn save_all(&self, states: &[EntityMonitorState]) -> Result<usize, DbError> {
            Ok(states.len())
        }
        fn delete(&self, _: &str) -> Result<(), DbError> {
            Ok(())
        }
    }

    fn fleet(n: usize) -> Vec<MonitoredEndpoint> {
        (0..n)
            .map(|i| MonitoredEndpoint {
                entity_id: format!("home-{}", i),
                host: format!("10.0.{}.{}", i / 250, i % 250),
                ..Default::default()
            })
            .collect()
    }

    fn scheduler(endpoints: Vec<MonitoredEndpoint>, prober: TableProber, settings: MonitorSettings) -> (Arc<TableProber>, Scheduler) {
        let prober = Arc::new(prober);
        let shared = SharedSettings::new(settings);
        let monitor = Arc::new(Monitor::new(
            prober.clone(),
            Arc::new(NullStore),
            Arc::new(LogNotifier),
            shared.clone(),
            MonitorOptions::default(),
        ));
        let sched = Scheduler::new(monitor, Arc::new(StaticFleet(endpoints)), shared);
        (prober, sched)
    }

    #[test]
    fn test_tick_interval_steps() {
        assert_eq!(tick_interval(0, None), Duration::from_secs(2));
        assert_eq!(tick_interval(49, None), Duration::from_secs(2));
        assert_eq!(tick_interval(50, None), Duration::from_secs(5));
        assert_eq!(tick_interval(199, None), Duration::from_secs(5));
        assert_eq!(tick_interval(200, None), Duration::from_secs(10));
        assert_eq!(tick_interval(999, None), Duration::from_secs(10));
        assert_eq!(tick_interval(1000, None), Duration::from_secs(30));
        assert_eq!(tick_interval(50_000, None), Duration::from_secs(30));
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(
            tick_interval(10_000, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
    }

    #[tokio::test]
    async fn test_interval_fixed_until_restart() {
        let mut endpoints = fleet(60);
        endpoints[0].enabled = false;
        let (_, sched) = scheduler(endpoints, TableProber::default(), MonitorSettings::default());

        assert_eq!(sched.start().await.unwrap(), Duration::from_secs(5));
        assert_eq!(sched.current_interval().await, Some(Duration::from_secs(5)));

        sched.settings.replace(MonitorSettings {
            interval_override_secs: 42,
            ..Default::default()
        });
        assert_eq!(sched.start().await.unwrap(), Duration::from_secs(5));
        assert_eq!(sched.restart().await.unwrap(), Duration::from_secs(42));

        sched.stop().await;
        assert_eq!(sched.current_interval().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_running_tick() {
        let prober = TableProber {
            delay: Some(Duration::from_millis(1_500)),
            ..Default::default()
        };
        let (prober, sched) = scheduler(fleet(1), prober, MonitorSettings::default());

        sched.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(prober.in_flight.load(Ordering::SeqCst), 1);

        sched.restart().await.unwrap();
        assert_eq!(prober.in_flight.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(prober.peak.load(Ordering::SeqCst), 1);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);

        sched.stop().await;
        assert_eq!(prober.in_flight.load(Ordering::SeqCst), 0);
        assert!(!sched.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_causes_skips_not_overlap() {
        let prober = TableProber {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let (prober, sched) = scheduler(fleet(3), prober, MonitorSettings::default());

        assert_eq!(sched.start().await.unwrap(), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(5_900)).await;
        sched.stop().await;

        // Ticks due at 0s, 2s, 4s: the first is still probing for the next two.
        let started = sched.stats().ticks_started.load(Ordering::Relaxed);
        let skipped = sched.stats().ticks_skipped.load(Ordering::Relaxed);
        assert_eq!(started, 1);
        assert!(skipped >= 2);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }
}
