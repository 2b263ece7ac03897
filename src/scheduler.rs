/// Per-profile cycle scheduler
///
/// Each profile gets its own monitor loop on a fixed interval. Cycles never
/// overlap for one profile: the loop awaits each cycle before the next tick,
/// and delayed ticks are absorbed rather than bursted. Every cycle, missed
/// or not, leaves an audit row so gaps in coverage are visible after the
/// fact.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::monitor::{self, CycleOutcome};
use crate::persistence::{NewTask, Store};
use crate::terminal::UiTerminal;

/// Scheduling parameters for one registry
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between cycles per profile
    pub interval: Duration,
    /// Hard deadline for one cycle; cycles past it are abandoned
    pub cycle_timeout: Duration,
    /// Slack past the interval before a gap counts as missed
    pub grace: Duration,
    /// Audit rows older than this are pruned
    pub retention_days: u32,
    /// Replacement sizing when the retired order carried no amount
    pub fallback_amount: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            cycle_timeout: Duration::from_secs(300),
            grace: Duration::from_secs(120),
            retention_days: 30,
            fallback_amount: 1.0,
        }
    }
}

/// Opens a terminal session for a profile. The dry-run and live drivers both
/// plug in here.
pub trait SessionFactory: Send + Sync {
    fn open(&self, profile: &str) -> Result<Arc<dyn UiTerminal>>;
}

/// Owns the running monitor loops, one per profile.
pub struct MonitorRegistry {
    store: Arc<Store>,
    factory: Arc<dyn SessionFactory>,
    config: SchedulerConfig,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MonitorRegistry {
    pub fn new(store: Arc<Store>, factory: Arc<dyn SessionFactory>, config: SchedulerConfig) -> Self {
        Self {
            store,
            factory,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Start the monitor loop for a profile. Fails if one is already running.
    pub fn start_profile(&self, profile: &str) -> Result<()> {
        let mut handles = self.lock_handles();
        if handles.contains_key(profile) {
            bail!("monitor for profile {profile} is already running");
        }
        let store = Arc::clone(&self.store);
        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let name = profile.to_string();
        info!(profile, interval_secs = config.interval.as_secs(), "starting monitor");
        let handle = tokio::spawn(async move {
            monitor_loop(store, factory, config, name).await;
        });
        handles.insert(profile.to_string(), handle);
        Ok(())
    }

    /// Stop the monitor loop for a profile, if running.
    pub fn stop_profile(&self, profile: &str) -> bool {
        if let Some(handle) = self.lock_handles().remove(profile) {
            handle.abort();
            info!(profile, "monitor stopped");
            true
        } else {
            false
        }
    }

    pub fn stop_all(&self) {
        let mut handles = self.lock_handles();
        for (profile, handle) in handles.drain() {
            handle.abort();
            info!(profile = %profile, "monitor stopped");
        }
    }

    pub fn running_profiles(&self) -> Vec<String> {
        self.lock_handles().keys().cloned().collect()
    }

    /// Run a single audited cycle for a profile, outside any loop.
    pub async fn run_once(&self, profile: &str) -> Result<CycleOutcome> {
        let scheduled_ms = Utc::now().timestamp_millis();
        let (outcome, task) =
            execute_cycle(&self.store, &*self.factory, &self.config, profile, scheduled_ms).await;
        self.store.record_task(&task)?;
        Ok(outcome)
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whole intervals skipped in a gap of `elapsed` since the last success.
/// The interval itself plus the grace window counts as on time.
fn missed_intervals(elapsed: Duration, interval: Duration, grace: Duration) -> u64 {
    if elapsed <= interval + grace || interval.is_zero() {
        return 0;
    }
    (elapsed.as_millis() / interval.as_millis()) as u64 - 1
}

async fn monitor_loop(
    store: Arc<Store>,
    factory: Arc<dyn SessionFactory>,
    config: SchedulerConfig,
    profile: String,
) {
    let mut ticker = tokio::time::interval(config.interval);
    // Absorb delay instead of bursting; combined with awaiting each cycle
    // below this guarantees at most one in-flight cycle per profile.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Survives restarts: the store remembers the last good cycle
    let mut last_success_ms = match store.last_success_ms(&profile) {
        Ok(ms) => ms,
        Err(e) => {
            warn!(profile, error = %e, "could not load last success; assuming none");
            None
        }
    };

    loop {
        ticker.tick().await;
        let now_ms = Utc::now().timestamp_millis();

        if let Some(last) = last_success_ms {
            let elapsed = Duration::from_millis((now_ms - last).max(0) as u64);
            let missed = missed_intervals(elapsed, config.interval, config.grace);
            if missed > 0 {
                // The cycle below doubles as the catch-up pass: it walks
                // every row and every open order regardless of how long the
                // gap was, so no separate recovery sweep is needed. Only the
                // audit rows for the skipped intervals are backfilled here.
                warn!(profile, missed, "missed cycles detected; recording and catching up");
                for i in 1..=missed {
                    let scheduled = last + (i as i64) * config.interval.as_millis() as i64;
                    let audit = NewTask {
                        profile_name: profile.clone(),
                        scheduled_ms: scheduled,
                        missed: true,
                        ..Default::default()
                    };
                    if let Err(e) = store.record_task(&audit) {
                        error!(profile, error = %e, "failed to record missed cycle");
                    }
                }
            }
        }

        let (_outcome, task) =
            execute_cycle(&store, &*factory, &config, &profile, now_ms).await;
        if task.success {
            last_success_ms = task.completion_ms;
        }
        if let Err(e) = store.record_task(&task) {
            error!(profile, error = %e, "failed to record cycle audit");
        }

        let cutoff = now_ms - (config.retention_days as i64) * 24 * 3600 * 1000;
        match store.prune_tasks(cutoff) {
            Ok(0) => {}
            Ok(n) => info!(profile, pruned = n, "pruned old audit rows"),
            Err(e) => warn!(profile, error = %e, "audit pruning failed"),
        }
    }
}

/// Run one timed cycle and build its audit row. The session is always closed,
/// timeout or not; the close itself is best effort.
async fn execute_cycle(
    store: &Store,
    factory: &dyn SessionFactory,
    config: &SchedulerConfig,
    profile: &str,
    scheduled_ms: i64,
) -> (CycleOutcome, NewTask) {
    let mut task = NewTask {
        profile_name: profile.to_string(),
        scheduled_ms,
        ..Default::default()
    };

    let terminal = match factory
        .open(profile)
        .with_context(|| format!("failed to open a session for {profile}"))
    {
        Ok(t) => t,
        Err(e) => {
            task.error_message = Some(format!("{e:#}"));
            task.completion_ms = Some(Utc::now().timestamp_millis());
            return (
                CycleOutcome::Failed {
                    reason: format!("{e:#}"),
                },
                task,
            );
        }
    };

    // Session open doubles as a login for registered profiles
    if let Err(e) = store.mark_profile_login(profile) {
        warn!(profile, error = %e, "failed to record profile login");
    }

    task.start_ms = Some(Utc::now().timestamp_millis());
    let outcome = match tokio::time::timeout(
        config.cycle_timeout,
        monitor::run_cycle(terminal.as_ref(), store, profile, config.fallback_amount),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            task.timed_out = true;
            CycleOutcome::Failed {
                reason: format!("cycle exceeded {}s", config.cycle_timeout.as_secs()),
            }
        }
    };

    if let Err(e) = terminal.close_session().await {
        warn!(profile, error = %e, "session close failed");
    }

    task.completion_ms = Some(Utc::now().timestamp_millis());
    task.success = outcome.is_success();
    task.rows_processed = outcome.rows_processed() as i64;
    if let CycleOutcome::Failed { reason } = &outcome {
        task.error_message = Some(reason.clone());
    }
    (outcome, task)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{DryRunTerminal, RowGroup};

    struct DryRunFactory {
        terminal: Arc<DryRunTerminal>,
    }

    impl SessionFactory for DryRunFactory {
        fn open(&self, _profile: &str) -> Result<Arc<dyn UiTerminal>> {
            Ok(Arc::clone(&self.terminal) as Arc<dyn UiTerminal>)
        }
    }

    struct FailingFactory;

    impl SessionFactory for FailingFactory {
        fn open(&self, profile: &str) -> Result<Arc<dyn UiTerminal>> {
            bail!("no session available for {profile}")
        }
    }

    fn registry(factory: Arc<dyn SessionFactory>) -> (MonitorRegistry, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry =
            MonitorRegistry::new(Arc::clone(&store), factory, SchedulerConfig::default());
        (registry, store)
    }

    #[test]
    fn missed_interval_arithmetic() {
        let interval = Duration::from_secs(300);
        let grace = Duration::from_secs(120);

        // On time and within grace: no misses
        assert_eq!(missed_intervals(Duration::from_secs(300), interval, grace), 0);
        assert_eq!(missed_intervals(Duration::from_secs(420), interval, grace), 0);
        // Past grace but less than two whole intervals: still nothing missed
        assert_eq!(missed_intervals(Duration::from_secs(421), interval, grace), 0);
        // Two intervals elapsed: one missed
        assert_eq!(missed_intervals(Duration::from_secs(600), interval, grace), 1);
        // Four intervals elapsed: three missed
        assert_eq!(missed_intervals(Duration::from_secs(1200), interval, grace), 3);
    }

    #[tokio::test]
    async fn run_once_records_an_audit_row() {
        let terminal = Arc::new(DryRunTerminal::new());
        terminal.set_rows(vec![RowGroup::default()]);
        let (registry, store) = registry(Arc::new(DryRunFactory {
            terminal: Arc::clone(&terminal),
        }));

        let outcome = registry.run_once("Saruman").await.unwrap();
        assert!(outcome.is_success());
        assert!(terminal.session_closed());

        let history = store.task_history("Saruman", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert!(!history[0].missed);
        assert!(!history[0].timed_out);
    }

    #[tokio::test]
    async fn session_open_failure_is_audited() {
        let (registry, store) = registry(Arc::new(FailingFactory));
        let outcome = registry.run_once("Saruman").await.unwrap();
        assert!(!outcome.is_success());

        let history = store.task_history("Saruman", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert!(
            history[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("no session available")
        );
    }

    #[tokio::test]
    async fn profile_loops_start_and_stop() {
        let terminal = Arc::new(DryRunTerminal::new());
        let (registry, _store) = registry(Arc::new(DryRunFactory { terminal }));

        registry.start_profile("Saruman").unwrap();
        assert!(registry.start_profile("Saruman").is_err());
        assert_eq!(registry.running_profiles(), vec!["Saruman".to_string()]);

        assert!(registry.stop_profile("Saruman"));
        assert!(!registry.stop_profile("Saruman"));
        assert!(registry.running_profiles().is_empty());
    }
}
