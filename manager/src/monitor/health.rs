//! Background health monitor
//!
//! One worker task polls agent connectivity at a configured interval and
//! keeps `MonitorState` current. The worker sleeps in short ticks so a stop
//! request is observed within well under a second, and a failing poll cycle
//! is contained: it is logged, appended to the state message, and the loop
//! keeps running. Worker liveness is the overriding invariant.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cloud::{AdminCredentialProvider, StatusSnapshot, StatusSource};
use crate::error::{Error, Result};
use crate::monitor::sinks::NotificationSink;

/// How often the worker checks for cancellation and elapsed intervals.
const TICK: Duration = Duration::from_millis(100);

/// Alert title used for every unhealthy dispatch.
const ALERT_TITLE: &str = "Bridge Agents Disconnected";

/// Health classification of the last completed poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "healthy"),
            HealthVerdict::Unhealthy => write!(f, "unhealthy"),
            HealthVerdict::Unknown => write!(f, "unknown"),
        }
    }
}

/// State owned by the monitor worker. External readers only ever see
/// snapshot clones.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub last_run: Option<DateTime<Utc>>,
    pub last_message: String,
    pub last_verdict: HealthVerdict,
    pub interval: Duration,
    pub only_pools: Vec<String>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            last_run: None,
            last_message: String::new(),
            last_verdict: HealthVerdict::Unknown,
            interval: Duration::from_secs(3600),
            only_pools: Vec::new(),
        }
    }
}

/// Configuration applied on `start`.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Only monitor agents in these pools; an allow-listed pool with zero
    /// members is itself an unhealthy condition. Empty means all agents.
    pub only_pools: Vec<String>,
}

/// Collaborators one poll cycle needs.
pub struct MonitorDeps {
    pub credentials: Arc<dyn AdminCredentialProvider>,
    pub source: Arc<dyn StatusSource>,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
}

/// The background health monitor. Constructed and owned by the composition
/// root; at most one worker is live per instance.
pub struct HealthMonitor {
    state: Arc<RwLock<MonitorState>>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    deps: Arc<MonitorDeps>,
}

impl HealthMonitor {
    pub fn new(deps: MonitorDeps) -> Self {
        Self {
            state: Arc::new(RwLock::new(MonitorState::default())),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            deps: Arc::new(deps),
        }
    }

    /// Start the worker. Fails with `AlreadyRunning` when a worker is live.
    pub fn start(&self, config: MonitorConfig) -> Result<()> {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return Err(Error::AlreadyRunning("health monitor".into()));
            }
        }

        {
            let mut state = self.state.write();
            state.interval = config.interval;
            state.only_pools = config.only_pools;
            state.last_run = None;
        }
        self.stop.store(false, Ordering::SeqCst);

        info!("starting background task to monitor bridge agent connection");
        let state = self.state.clone();
        let stop = self.stop.clone();
        let deps = self.deps.clone();
        *worker = Some(tokio::spawn(async move {
            Self::worker_loop(state, stop, deps).await;
        }));
        Ok(())
    }

    /// Signal the worker and wait for it to exit, then reset the state.
    /// The worker observes the signal within one tick.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let mut state = self.state.write();
        state.last_run = None;
        state.last_message.clear();
        state.last_verdict = HealthVerdict::Unknown;
        info!("background health monitor stopped");
    }

    /// Make the next tick treat the interval as elapsed.
    pub fn trigger_run_now(&self) {
        let mut state = self.state.write();
        state.last_run = None;
        state.last_message.clear();
    }

    /// Run one poll cycle immediately, outside the worker schedule.
    pub async fn run_once(&self) {
        self.state.write().last_run = Some(Utc::now());
        Self::run_cycle(&self.state, &self.deps).await;
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Snapshot of the current monitor state.
    pub fn snapshot(&self) -> MonitorState {
        self.state.read().clone()
    }

    async fn worker_loop(
        state: Arc<RwLock<MonitorState>>,
        stop: Arc<AtomicBool>,
        deps: Arc<MonitorDeps>,
    ) {
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(TICK).await;

            let due = {
                let state = state.read();
                match state.last_run {
                    None => true,
                    Some(last_run) => (Utc::now() - last_run)
                        .to_std()
                        .map(|elapsed| elapsed >= state.interval)
                        .unwrap_or(true),
                }
            };
            if due {
                state.write().last_run = Some(Utc::now());
                Self::run_cycle(&state, &deps).await;
            }
        }
        info!("health monitor worker has stopped");
    }

    /// One poll cycle. Never propagates an error: a failing cycle is
    /// logged, recorded in the state message, and the worker moves on.
    async fn run_cycle(state: &RwLock<MonitorState>, deps: &MonitorDeps) {
        let Some(credential) = deps.credentials.admin_credential() else {
            // Without an admin credential there is nothing to poll; the
            // verdict is left untouched.
            warn!("no admin credential available, skipping health check cycle");
            return;
        };
        info!("checking health of bridge agents");

        match deps.source.fetch(&credential).await {
            Ok(snapshot) => Self::evaluate(state, deps, snapshot).await,
            Err(e) => {
                error!(error = ?e, "error in health check cycle");
                let mut state = state.write();
                state.last_message.push_str(&format!("\nerror in health check cycle: {}", e));
            }
        }
    }

    async fn evaluate(state: &RwLock<MonitorState>, deps: &MonitorDeps, snapshot: StatusSnapshot) {
        let only_pools = state.read().only_pools.clone();
        let pools_display = if only_pools.is_empty() {
            "(all)".to_string()
        } else {
            only_pools.join(", ")
        };

        // Pool membership counts over the full report list; only
        // allow-listed pools are tracked, so empty-pool detection fires
        // only when an allow-list is configured.
        let mut pool_counts: BTreeMap<&str, usize> =
            only_pools.iter().map(|p| (p.as_str(), 0)).collect();
        let mut monitored = Vec::new();
        let mut disconnected = Vec::new();
        for report in &snapshot.reports {
            if let Some(count) = pool_counts.get_mut(report.pool_name.as_str()) {
                *count += 1;
            }
            if !only_pools.is_empty() && !only_pools.contains(&report.pool_name) {
                continue;
            }
            monitored.push(report);
            if !report.is_connected() {
                disconnected.push(report);
            }
        }
        let empty_pools: Vec<&str> = pool_counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(pool, _)| *pool)
            .collect();

        if disconnected.is_empty() && empty_pools.is_empty() {
            let message = format!(
                "all monitored agents healthy in pool {} for site {}",
                pools_display, snapshot.site_name
            );
            info!("{}", message);
            let mut state = state.write();
            state.last_verdict = HealthVerdict::Healthy;
            state.last_message = message;
            return;
        }

        let mut message = String::new();
        if !empty_pools.is_empty() {
            message.push_str(&format!(
                "detected empty pool for site *{}*\n",
                snapshot.site_name
            ));
            for pool in &empty_pools {
                message.push_str(&format!(" no agents in pool `{}`.", pool));
            }
        }
        if !disconnected.is_empty() {
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str(&format!(
                "detected unhealthy bridge agents for site *{}*\n",
                snapshot.site_name
            ));
            message.push_str(&format!(
                "unhealthy agents: {} of {} in pool: {}\n",
                disconnected.len(),
                monitored.len(),
                pools_display
            ));
            message.push_str(
                &disconnected
                    .iter()
                    .map(|a| format!("    {} {}, pool: {}", a.agent_name, a.status, a.pool_name))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
        warn!("{}", message);

        {
            let mut state = state.write();
            state.last_verdict = HealthVerdict::Unhealthy;
            state.last_message = message.clone();
        }

        if deps.sinks.is_empty() {
            let note = "\nno notification sinks configured";
            info!("{}", note.trim());
            state.write().last_message.push_str(note);
            return;
        }
        for sink in &deps.sinks {
            match sink.send(ALERT_TITLE, &message).await {
                Ok(()) => {
                    let note = format!("\n{} alert sent", sink.name());
                    state.write().last_message.push_str(&note);
                }
                Err(e) => {
                    error!(sink = sink.name(), error = %e, "failed to dispatch alert");
                    let note = format!("\n{} alert failed: {}", sink.name(), e);
                    state.write().last_message.push_str(&note);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{AgentCredential, AgentReport};
    use async_trait::async_trait;

    struct StubProvider(Option<AgentCredential>);

    impl AdminCredentialProvider for StubProvider {
        fn admin_credential(&self) -> Option<AgentCredential> {
            self.0.clone()
        }
    }

    fn admin() -> StubProvider {
        StubProvider(Some(AgentCredential {
            name: "admin-ops".to_string(),
            secret: "s".to_string(),
        }))
    }

    struct StaticSource(Vec<AgentReport>);

    #[async_trait]
    impl StatusSource for StaticSource {
        async fn fetch(&self, _credential: &AgentCredential) -> crate::error::Result<StatusSnapshot> {
            Ok(StatusSnapshot {
                site_name: "mysite".to_string(),
                reports: self.0.clone(),
            })
        }
    }

    struct FailingSource;

    #[async_trait]
    impl StatusSource for FailingSource {
        async fn fetch(&self, _credential: &AgentCredential) -> crate::error::Result<StatusSnapshot> {
            Err(Error::Other("control plane timeout".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, summary: &str, detail: &str) -> crate::error::Result<()> {
            self.sent.lock().push((summary.to_string(), detail.to_string()));
            Ok(())
        }
    }

    fn report(name: &str, pool: &str, status: &str) -> AgentReport {
        AgentReport {
            agent_name: name.to_string(),
            pool_name: pool.to_string(),
            status: status.to_string(),
        }
    }

    fn monitor_with(
        source: Arc<dyn StatusSource>,
        sinks: Vec<Arc<dyn NotificationSink>>,
        only_pools: Vec<String>,
    ) -> HealthMonitor {
        let monitor = HealthMonitor::new(MonitorDeps {
            credentials: Arc::new(admin()),
            source,
            sinks,
        });
        monitor.state.write().only_pools = only_pools;
        monitor
    }

    #[tokio::test]
    async fn all_connected_is_healthy_and_dispatches_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![
                report("agent1", "poolA", "CONNECTED"),
                report("agent2", "poolA", "CONNECTED"),
            ])),
            vec![sink.clone()],
            vec!["poolA".to_string()],
        );
        monitor.run_once().await;

        let state = monitor.snapshot();
        assert_eq!(state.last_verdict, HealthVerdict::Healthy);
        assert!(state.last_message.contains("all monitored agents healthy"));
        assert!(state.last_run.is_some());
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn disconnected_agent_is_unhealthy_and_alerts_every_sink_once() {
        let sink1 = Arc::new(RecordingSink::default());
        let sink2 = Arc::new(RecordingSink::default());
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![
                report("agent1", "poolA", "CONNECTED"),
                report("agent2", "poolA", "DISCONNECTED"),
            ])),
            vec![sink1.clone(), sink2.clone()],
            vec!["poolA".to_string()],
        );
        monitor.run_once().await;

        let state = monitor.snapshot();
        assert_eq!(state.last_verdict, HealthVerdict::Unhealthy);
        assert!(state.last_message.contains("agent2 DISCONNECTED, pool: poolA"));
        assert_eq!(sink1.sent.lock().len(), 1);
        assert_eq!(sink2.sent.lock().len(), 1);
        let (summary, detail) = sink1.sent.lock()[0].clone();
        assert_eq!(summary, ALERT_TITLE);
        assert!(detail.contains("unhealthy agents: 1 of 2"));
    }

    #[tokio::test]
    async fn empty_allow_listed_pool_is_unhealthy_even_when_agents_connect() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![report("agent1", "poolB", "CONNECTED")])),
            vec![sink.clone()],
            vec!["poolA".to_string()],
        );
        monitor.run_once().await;

        let state = monitor.snapshot();
        assert_eq!(state.last_verdict, HealthVerdict::Unhealthy);
        assert!(state.last_message.contains("no agents in pool `poolA`"));
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn no_allow_list_monitors_everything_without_empty_pool_checks() {
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![report("agent1", "poolB", "CONNECTED")])),
            Vec::new(),
            Vec::new(),
        );
        monitor.run_once().await;
        assert_eq!(monitor.snapshot().last_verdict, HealthVerdict::Healthy);
    }

    #[tokio::test]
    async fn missing_credential_skips_the_cycle_without_touching_the_verdict() {
        let monitor = HealthMonitor::new(MonitorDeps {
            credentials: Arc::new(StubProvider(None)),
            source: Arc::new(StaticSource(vec![report("agent1", "poolA", "DISCONNECTED")])),
            sinks: Vec::new(),
        });
        monitor.run_once().await;

        let state = monitor.snapshot();
        assert_eq!(state.last_verdict, HealthVerdict::Unknown);
        assert!(state.last_message.is_empty());
    }

    #[tokio::test]
    async fn a_failing_cycle_is_contained_and_recorded() {
        let monitor = HealthMonitor::new(MonitorDeps {
            credentials: Arc::new(admin()),
            source: Arc::new(FailingSource),
            sinks: Vec::new(),
        });
        monitor.run_once().await;

        let state = monitor.snapshot();
        assert!(state.last_message.contains("error in health check cycle"));
        assert_eq!(state.last_verdict, HealthVerdict::Unknown);

        // The monitor survives and keeps polling.
        monitor.run_once().await;
        assert!(monitor.snapshot().last_run.is_some());
    }

    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let monitor = monitor_with(Arc::new(StaticSource(Vec::new())), Vec::new(), Vec::new());
        let config = MonitorConfig {
            interval: Duration::from_secs(3600),
            only_pools: Vec::new(),
        };
        monitor.start(config.clone()).unwrap();
        assert!(monitor.is_running());
        assert!(matches!(
            monitor.start(config),
            Err(Error::AlreadyRunning(_))
        ));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn stop_joins_the_worker_within_the_tick_bound() {
        let monitor = monitor_with(Arc::new(StaticSource(Vec::new())), Vec::new(), Vec::new());
        monitor
            .start(MonitorConfig {
                interval: Duration::from_secs(3600),
                only_pools: Vec::new(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        tokio::time::timeout(Duration::from_secs(1), monitor.stop())
            .await
            .expect("worker did not observe the stop signal within one second");
        assert!(!monitor.is_running());
        assert_eq!(monitor.snapshot().last_verdict, HealthVerdict::Unknown);
    }

    #[tokio::test]
    async fn trigger_run_now_clears_the_schedule() {
        let monitor = monitor_with(Arc::new(StaticSource(Vec::new())), Vec::new(), Vec::new());
        monitor.run_once().await;
        assert!(monitor.snapshot().last_run.is_some());
        monitor.trigger_run_now();
        let state = monitor.snapshot();
        assert!(state.last_run.is_none());
        assert!(state.last_message.is_empty());
    }
}
