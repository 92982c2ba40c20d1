//! Watcher Supervisor
//!
//! One scheduling loop per network, each with a worker pool bounded by the
//! network's `max_concurrency`. An address is re-evaluated every
//! `block_time × poll_factor`; failures push it back with exponential backoff
//! and, after `alert_after` consecutive failures, raise an alert. The address
//! stays in rotation either way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;

use super::watcher::{DepositWatcher, PollReport};
use crate::common::config::CustodyConfig;
use crate::common::error::{CustodyError, Result};
use crate::common::log_alert;
use crate::storage::AddressStore;

/// Scheduling knobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_factor: f64,
    pub max_backoff: Duration,
    pub alert_after_failures: u32,
    /// Floor for the poll interval
    pub min_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_factor: 1.0,
            max_backoff: Duration::from_secs(300),
            alert_after_failures: 5,
            min_interval: Duration::from_millis(100),
        }
    }
}

impl From<&CustodyConfig> for SchedulerConfig {
    fn from(config: &CustodyConfig) -> Self {
        Self {
            poll_factor: config.poll_factor,
            max_backoff: config.max_backoff,
            alert_after_failures: config.alert_after_failures,
            ..Self::default()
        }
    }
}

/// `base × 2^failures`, capped at `max`
pub fn backoff_delay(base: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 1u32 << failures.min(16);
    base.saturating_mul(factor).min(max)
}

/// Per-address schedule
#[derive(Debug, Clone)]
struct AddressSchedule {
    next_due: Instant,
    failures: u32,
}

impl AddressSchedule {
    fn new(now: Instant) -> Self {
        Self {
            next_due: now,
            failures: 0,
        }
    }

    fn record_success(&mut self, now: Instant, interval: Duration) {
        self.failures = 0;
        self.next_due = now + interval;
    }

    /// Returns true when this failure should raise an alert
    fn record_failure(&mut self, now: Instant, interval: Duration, config: &SchedulerConfig) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.next_due = now + backoff_delay(interval, self.failures, config.max_backoff.max(interval));
        config.alert_after_failures > 0 && self.failures % config.alert_after_failures == 0
    }
}

/// Supervised set of per-network polling loops
pub struct WatcherSupervisor {
    watcher: Arc<DepositWatcher>,
    config: SchedulerConfig,
    shutdown: Option<watch::Sender<bool>>,
    loops: JoinSet<()>,
}

impl WatcherSupervisor {
    pub fn new(watcher: Arc<DepositWatcher>, config: SchedulerConfig) -> Self {
        Self {
            watcher,
            config,
            shutdown: None,
            loops: JoinSet::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Spawn one loop per active network
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(CustodyError::conflict("watcher already running"));
        }
        let (tx, rx) = watch::channel(false);

        let networks = self.watcher.networks().clone();
        for network_id in networks.network_ids() {
            let entries: Vec<_> = networks
                .entries_for_network(&network_id)
                .filter(|n| n.active)
                .collect();
            let block_time = entries.iter().map(|n| n.block_time_secs).min().unwrap_or(1);
            let workers = entries.iter().map(|n| n.max_concurrency).min().unwrap_or(1).max(1);
            let interval = Duration::from_secs_f64(block_time as f64 * self.config.poll_factor.max(0.0))
                .max(self.config.min_interval);

            tracing::info!(
                target: "custody::deposit",
                network_id = %network_id,
                interval_ms = interval.as_millis() as u64,
                workers,
                "Starting network watcher"
            );

            self.loops.spawn(network_loop(
                self.watcher.clone(),
                network_id,
                interval,
                workers,
                self.config.clone(),
                rx.clone(),
            ));
        }

        self.shutdown = Some(tx);
        Ok(())
    }

    /// Signal every loop and wait for them to exit
    pub async fn stop(&mut self) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };
        let _ = tx.send(true);
        while let Some(joined) = self.loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(target: "custody::deposit", error = %e, "Network watcher panicked");
            }
        }
        tracing::info!(target: "custody::deposit", "Deposit watcher stopped");
    }
}

async fn network_loop(
    watcher: Arc<DepositWatcher>,
    network_id: String,
    interval: Duration,
    workers: usize,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let pool = Arc::new(Semaphore::new(workers));
    let mut schedule: HashMap<String, AddressSchedule> = HashMap::new();
    let mut in_flight: JoinSet<(String, Result<PollReport>)> = JoinSet::new();
    let mut owners: HashMap<Id, String> = HashMap::new();
    let tick = interval.min(Duration::from_secs(1));

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Re-read the address set each pass so activation changes apply
        match watcher.store().list_active_addresses(&network_id).await {
            Ok(addresses) => {
                let now = Instant::now();
                schedule.retain(|id, _| addresses.iter().any(|a| &a.id == id));
                for address in addresses {
                    let entry = schedule
                        .entry(address.id.clone())
                        .or_insert_with(|| AddressSchedule::new(now));
                    if entry.next_due > now {
                        continue;
                    }
                    // Parked until the running evaluation reports back
                    entry.next_due = now + Duration::from_secs(86_400);

                    let watcher = watcher.clone();
                    let pool = pool.clone();
                    let address_id = address.id.clone();
                    let task = in_flight.spawn(async move {
                        let result = match pool.acquire_owned().await {
                            Ok(_permit) => watcher.poll_address(&address.id).await,
                            Err(_) => Err(CustodyError::internal("worker pool closed")),
                        };
                        (address.id, result)
                    });
                    owners.insert(task.id(), address_id);
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "custody::deposit",
                    network_id = %network_id,
                    error = %e,
                    "Failed to load active addresses"
                );
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            Some(joined) = in_flight.join_next_with_id() => {
                settle(&network_id, &mut schedule, &mut owners, joined, interval, &config);
                while let Some(joined) = in_flight.try_join_next_with_id() {
                    settle(&network_id, &mut schedule, &mut owners, joined, interval, &config);
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }
    }

    in_flight.shutdown().await;
    tracing::debug!(target: "custody::deposit", network_id = %network_id, "Network watcher exited");
}

/// Route a finished poll task back to its address. A task that panicked
/// counts as a failed evaluation so the address is not left parked.
fn settle(
    network_id: &str,
    schedule: &mut HashMap<String, AddressSchedule>,
    owners: &mut HashMap<Id, String>,
    joined: std::result::Result<(Id, (String, Result<PollReport>)), JoinError>,
    interval: Duration,
    config: &SchedulerConfig,
) {
    match joined {
        Ok((id, (address_id, result))) => {
            owners.remove(&id);
            handle_result(network_id, schedule, address_id, result, interval, config);
        }
        Err(e) => {
            let Some(address_id) = owners.remove(&e.id()) else {
                return;
            };
            tracing::error!(
                target: "custody::deposit",
                address_id = %address_id,
                network_id = %network_id,
                error = %e,
                "Address evaluation task aborted"
            );
            let err = CustodyError::internal(format!("evaluation task aborted: {}", e));
            handle_result(network_id, schedule, address_id, Err(err), interval, config);
        }
    }
}

fn handle_result(
    network_id: &str,
    schedule: &mut HashMap<String, AddressSchedule>,
    address_id: String,
    result: Result<PollReport>,
    interval: Duration,
    config: &SchedulerConfig,
) {
    let now = Instant::now();
    let entry = schedule
        .entry(address_id.clone())
        .or_insert_with(|| AddressSchedule::new(now));

    match result {
        Ok(report) => {
            if report.detected + report.completed + report.failed > 0 {
                tracing::debug!(
                    target: "custody::deposit",
                    address_id = %address_id,
                    detected = report.detected,
                    completed = report.completed,
                    failed = report.failed,
                    "Address evaluated"
                );
            }
            entry.record_success(now, interval);
        }
        Err(e) => {
            let alert = entry.record_failure(now, interval, config);
            tracing::warn!(
                target: "custody::deposit",
                address_id = %address_id,
                network_id = %network_id,
                failures = entry.failures,
                error = %e,
                "Address evaluation failed"
            );
            if alert {
                log_alert(
                    "deposit_watcher_failing",
                    &format!(
                        "{} consecutive evaluation failures for {}",
                        entry.failures, address_id
                    ),
                    serde_json::json!({
                        "address_id": address_id,
                        "network_id": network_id,
                        "failures": entry.failures,
                        "error": e.to_string(),
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 0, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_secs(16));
        assert_eq!(backoff_delay(base, 10, max), max);
        assert_eq!(backoff_delay(base, 40, max), max);
    }

    #[test]
    fn test_alert_every_n_failures() {
        let config = SchedulerConfig {
            alert_after_failures: 3,
            ..SchedulerConfig::default()
        };
        let now = Instant::now();
        let interval = Duration::from_secs(1);
        let mut schedule = AddressSchedule::new(now);

        let alerts: Vec<bool> = (0..6)
            .map(|_| schedule.record_failure(now, interval, &config))
            .collect();
        assert_eq!(alerts, vec![false, false, true, false, false, true]);

        schedule.record_success(now, interval);
        assert_eq!(schedule.failures, 0);
        assert_eq!(schedule.next_due, now + interval);
    }

    #[tokio::test]
    async fn test_panicked_evaluation_returns_to_rotation() {
        let config = SchedulerConfig::default();
        let interval = Duration::from_secs(1);
        let mut schedule = HashMap::new();
        let mut owners = HashMap::new();
        let parked = Instant::now() + Duration::from_secs(86_400);
        schedule.insert(
            "addr_1".to_string(),
            AddressSchedule {
                next_due: parked,
                failures: 0,
            },
        );

        let mut tasks: JoinSet<(String, Result<PollReport>)> = JoinSet::new();
        let task = tasks.spawn(async {
            let broken = true;
            if broken {
                panic!("evaluation blew up");
            }
            ("addr_1".to_string(), Ok(PollReport::default()))
        });
        owners.insert(task.id(), "addr_1".to_string());

        let joined = tasks.join_next_with_id().await.unwrap();
        assert!(joined.is_err());
        settle("eth-devnet", &mut schedule, &mut owners, joined, interval, &config);

        let entry = &schedule["addr_1"];
        assert_eq!(entry.failures, 1);
        assert!(entry.next_due < parked);
        assert!(owners.is_empty());
    }

    #[test]
    fn test_failure_pushes_next_due_back() {
        let config = SchedulerConfig::default();
        let now = Instant::now();
        let interval = Duration::from_secs(10);
        let mut schedule = AddressSchedule::new(now);
        schedule.record_failure(now, interval, &config);
        assert_eq!(schedule.next_due, now + Duration::from_secs(20));
    }
}
