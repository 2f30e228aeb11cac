//! Server pool: capacity, leases and health.
//!
//! The [`ResourcePool`] is the only place server load is mutated. Every
//! running task holds exactly one [`Allocation`] (a lease) on one server and
//! a server's current task count is the size of its lease set, so
//! `current <= max_concurrent_tasks` holds by construction.
//!
//! # Server States
//!
//! ```text
//!              allocate (last slot)
//!   AVAILABLE ────────────────────────► BUSY
//!       ▲  ◄──────────────────────────   │
//!       │           release              │
//!       │                                │ probe failed /
//!       │ probe succeeded                │ connection error
//!       │                                ▼
//!       └────────────────────────── UNREACHABLE
//!                                  (leases force-released)
//! ```
//!
//! # Placement
//!
//! See [`AllocationConfig`] for the available strategies. When no server
//! can take a task, [`ResourcePool::allocate`] returns `None`; the caller
//! keeps the task queued and waits on [`ResourcePool::changed`].
//!
//! # Resource history
//!
//! Every successful health probe is followed by a resource sample (load,
//! memory, disk) kept per server for a configurable window. See
//! [`ResourcePool::resource_history`].

mod resources;
mod strategy;

pub use resources::{ResourceSample, SAMPLE_SCRIPT};

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use self::resources::ResourceHistory;
use self::strategy::Slot;
use crate::TaskId;
use crate::config::{AllocationConfig, ServerConfig};
use crate::remote::RemoteExecutor;

/// Health of a server as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerHealth {
    /// Reachable with at least one free slot.
    Available,
    /// Reachable, every slot leased.
    Busy,
    /// Excluded from placement until a probe succeeds.
    Unreachable,
}

impl std::fmt::Display for ServerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerHealth::Available => "AVAILABLE",
            ServerHealth::Busy => "BUSY",
            ServerHealth::Unreachable => "UNREACHABLE",
        };
        f.write_str(s)
    }
}

/// A lease binding one task to one server slot.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub task: TaskId,
    pub server: ServerConfig,
    pub leased_at: DateTime<Utc>,
}

/// Point-in-time view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub host: String,
    pub description: Option<String>,
    pub health: ServerHealth,
    pub current_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub tasks: Vec<TaskId>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Most recent resource sample, if any was taken.
    pub resources: Option<ResourceSample>,
}

/// Aggregate view of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub strategy: &'static str,
    pub total_servers: usize,
    pub available: usize,
    pub busy: usize,
    pub unreachable: usize,
    pub running_tasks: usize,
    pub total_capacity: usize,
    pub cluster_load: f64,
    pub servers: Vec<ServerInfo>,
}

/// A lease that was dropped because its server became unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostLease {
    pub server: String,
    pub task: TaskId,
}

/// Outcome of one health-check round.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub unreachable: Vec<String>,
    /// Leases force-released by this round. The owners must be aborted.
    pub lost: Vec<LostLease>,
}

struct Server {
    config: ServerConfig,
    reachable: bool,
    leases: BTreeMap<TaskId, DateTime<Utc>>,
    last_checked: Option<DateTime<Utc>>,
    last_error: Option<String>,
    history: ResourceHistory,
}

impl Server {
    fn health(&self) -> ServerHealth {
        if !self.reachable {
            ServerHealth::Unreachable
        } else if self.leases.len() >= self.config.max_concurrent_tasks {
            ServerHealth::Busy
        } else {
            ServerHealth::Available
        }
    }

    fn slot(&self) -> Slot<'_> {
        Slot {
            name: &self.config.name,
            current: self.leases.len(),
            max: self.config.max_concurrent_tasks,
            reachable: self.reachable,
        }
    }

    fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.config.name.clone(),
            host: self.config.host.clone(),
            description: self.config.description.clone(),
            health: self.health(),
            current_tasks: self.leases.len(),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            tasks: self.leases.keys().cloned().collect(),
            last_checked: self.last_checked,
            last_error: self.last_error.clone(),
            resources: self.history.latest().cloned(),
        }
    }
}

struct PoolState {
    /// Keyed by name so every strategy sees servers in name order.
    servers: BTreeMap<String, Server>,
    cursor: usize,
}

/// Tracks servers, their capacity, load and health.
pub struct ResourcePool {
    state: Mutex<PoolState>,
    strategy: AllocationConfig,
    changed: Notify,
    history_window: chrono::Duration,
}

impl ResourcePool {
    /// Creates a pool in which every server starts AVAILABLE.
    ///
    /// # Example
    ///
    /// ```
    /// use labgrid::config::{AllocationConfig, ServerConfig};
    /// use labgrid::pool::ResourcePool;
    ///
    /// let pool = ResourcePool::new(
    ///     vec![ServerConfig::new("a", "10.0.0.1").with_capacity(2)],
    ///     AllocationConfig::LeastLoaded,
    /// );
    ///
    /// let lease = pool.allocate("task-1", 0).unwrap();
    /// assert_eq!(lease.server.name, "a");
    /// assert!(pool.release("a", "task-1"));
    /// assert!(!pool.release("a", "task-1"));
    /// ```
    pub fn new(servers: Vec<ServerConfig>, strategy: AllocationConfig) -> Self {
        let servers = servers
            .into_iter()
            .map(|config| {
                (
                    config.name.clone(),
                    Server {
                        config,
                        reachable: true,
                        leases: BTreeMap::new(),
                        last_checked: None,
                        last_error: None,
                        history: ResourceHistory::default(),
                    },
                )
            })
            .collect();

        Self {
            state: Mutex::new(PoolState { servers, cursor: 0 }),
            strategy,
            changed: Notify::new(),
            history_window: chrono::Duration::hours(24),
        }
    }

    /// How long resource samples are kept. Default: 24 hours.
    pub fn with_resource_history(mut self, window: chrono::Duration) -> Self {
        self.history_window = window;
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Notified whenever capacity may have become available.
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    pub fn strategy(&self) -> &AllocationConfig {
        &self.strategy
    }

    /// Leases a slot for `task` according to the configured strategy.
    ///
    /// Returns `None` if no reachable server has room for a task of this
    /// priority. A task that already holds a lease gets it back unchanged.
    pub fn allocate(&self, task: &str, priority: i32) -> Option<Allocation> {
        let mut state = self.lock();

        if let Some(server) = state.servers.values().find(|s| s.leases.contains_key(task)) {
            return Some(Allocation {
                task: task.to_string(),
                server: server.config.clone(),
                leased_at: server.leases[task],
            });
        }

        let PoolState { servers, cursor } = &mut *state;
        let slots: Vec<Slot<'_>> = servers.values().map(Server::slot).collect();
        let picked = strategy::select(&self.strategy, &slots, cursor, priority)?;
        let name = slots[picked].name.to_string();

        let server = servers.get_mut(&name)?;
        let leased_at = Utc::now();
        server.leases.insert(task.to_string(), leased_at);
        debug!(
            "Allocated {} to {} ({}/{})",
            task,
            name,
            server.leases.len(),
            server.config.max_concurrent_tasks
        );

        Some(Allocation {
            task: task.to_string(),
            server: server.config.clone(),
            leased_at,
        })
    }

    /// Drops the lease `task` holds on `server`.
    ///
    /// Returns `false` if there was no such lease (already released or
    /// force-released), so calling it twice is harmless.
    pub fn release(&self, server: &str, task: &str) -> bool {
        let released = self
            .lock()
            .servers
            .get_mut(server)
            .is_some_and(|s| s.leases.remove(task).is_some());

        if released {
            debug!("Released {} from {}", task, server);
            self.changed.notify_waiters();
        }
        released
    }

    /// Marks a server UNREACHABLE and force-releases all of its leases.
    ///
    /// Returns the tasks that lost their lease.
    pub fn mark_unreachable(&self, server: &str, reason: &str) -> Vec<TaskId> {
        let mut state = self.lock();
        let Some(entry) = state.servers.get_mut(server) else {
            return Vec::new();
        };

        if entry.reachable {
            warn!("Server {} is unreachable: {}", server, reason);
        }
        entry.reachable = false;
        entry.last_checked = Some(Utc::now());
        entry.last_error = Some(reason.to_string());
        std::mem::take(&mut entry.leases).into_keys().collect()
    }

    /// Returns a server to placement after a successful probe.
    pub fn mark_reachable(&self, server: &str) {
        let recovered = {
            let mut state = self.lock();
            let Some(entry) = state.servers.get_mut(server) else {
                return;
            };
            let recovered = !entry.reachable;
            entry.reachable = true;
            entry.last_checked = Some(Utc::now());
            entry.last_error = None;
            recovered
        };

        if recovered {
            info!("Server {} is reachable again", server);
            self.changed.notify_waiters();
        }
    }

    /// Stores a resource sample taken on `server`.
    pub fn record_sample(&self, server: &str, sample: ResourceSample) {
        let window = self.history_window;
        if let Some(entry) = self.lock().servers.get_mut(server) {
            entry.history.push(sample, window);
        }
    }

    /// Samples of `server` taken within the last `within`, oldest first.
    /// Empty for unknown servers.
    pub fn resource_history(&self, server: &str, within: chrono::Duration) -> Vec<ResourceSample> {
        let cutoff = Utc::now() - within;
        self.lock()
            .servers
            .get(server)
            .map(|s| s.history.since(cutoff))
            .unwrap_or_default()
    }

    /// Probes every server once, updates health accordingly and samples
    /// the resources of every reachable server.
    ///
    /// Probes run concurrently and without holding the pool lock.
    pub async fn health_check(&self, executor: &dyn RemoteExecutor) -> HealthReport {
        let configs: Vec<ServerConfig> = self
            .lock()
            .servers
            .values()
            .map(|s| s.config.clone())
            .collect();

        let probes = configs.iter().map(|config| async move {
            let outcome = match executor.probe(config).await {
                Ok(()) => Ok(resources::sample(executor, config).await),
                Err(e) => Err(e),
            };
            (config.name.clone(), outcome)
        });
        let outcomes = futures::future::join_all(probes).await;

        let mut report = HealthReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(sample) => {
                    self.mark_reachable(&name);
                    if let Some(sample) = sample {
                        self.record_sample(&name, sample);
                    }
                    report.healthy.push(name);
                }
                Err(e) => {
                    for task in self.mark_unreachable(&name, &e.to_string()) {
                        report.lost.push(LostLease {
                            server: name.clone(),
                            task,
                        });
                    }
                    report.unreachable.push(name);
                }
            }
        }
        report
    }

    /// `sum(current) / sum(max)` over reachable servers.
    pub fn cluster_load(&self) -> f64 {
        let state = self.lock();
        let slots: Vec<Slot<'_>> = state.servers.values().map(Server::slot).collect();
        strategy::cluster_load(&slots)
    }

    pub fn server(&self, name: &str) -> Option<ServerInfo> {
        self.lock().servers.get(name).map(Server::info)
    }

    pub fn servers(&self) -> Vec<ServerInfo> {
        self.lock().servers.values().map(Server::info).collect()
    }

    pub fn summary(&self) -> ClusterSummary {
        let state = self.lock();
        let servers: Vec<ServerInfo> = state.servers.values().map(Server::info).collect();
        let slots: Vec<Slot<'_>> = state.servers.values().map(Server::slot).collect();
        let count = |health: ServerHealth| servers.iter().filter(|s| s.health == health).count();

        ClusterSummary {
            strategy: strategy_name(&self.strategy),
            total_servers: servers.len(),
            available: count(ServerHealth::Available),
            busy: count(ServerHealth::Busy),
            unreachable: count(ServerHealth::Unreachable),
            running_tasks: servers.iter().map(|s| s.current_tasks).sum(),
            total_capacity: servers.iter().map(|s| s.max_concurrent_tasks).sum(),
            cluster_load: strategy::cluster_load(&slots),
            servers,
        }
    }
}

pub fn strategy_name(strategy: &AllocationConfig) -> &'static str {
    match strategy {
        AllocationConfig::RoundRobin => "round_robin",
        AllocationConfig::LeastLoaded => "least_loaded",
        AllocationConfig::PriorityBased { .. } => "priority_based",
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;

    use super::*;
    use crate::remote::{Command, ExecResult, RemoteError, RemoteResult};

    fn pool(strategy: AllocationConfig) -> ResourcePool {
        ResourcePool::new(
            vec![
                ServerConfig::new("a", "10.0.0.1").with_capacity(2),
                ServerConfig::new("b", "10.0.0.2").with_capacity(1),
            ],
            strategy,
        )
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let pool = pool(AllocationConfig::LeastLoaded);

        let leases: Vec<_> = (0..5)
            .filter_map(|i| pool.allocate(&format!("t{i}"), 0))
            .collect();
        assert_eq!(leases.len(), 3);

        for info in pool.servers() {
            assert!(info.current_tasks <= info.max_concurrent_tasks);
            assert_eq!(info.health, ServerHealth::Busy);
        }
        assert_eq!(pool.cluster_load(), 1.0);
    }

    #[test]
    fn test_allocate_is_idempotent_per_task() {
        let pool = pool(AllocationConfig::RoundRobin);
        let first = pool.allocate("t1", 0).unwrap();
        let again = pool.allocate("t1", 0).unwrap();

        assert_eq!(first.server.name, again.server.name);
        assert_eq!(pool.summary().running_tasks, 1);
    }

    #[test]
    fn test_release_frees_capacity() {
        let pool = pool(AllocationConfig::LeastLoaded);
        let lease = pool.allocate("t1", 0).unwrap();

        assert!(pool.release(&lease.server.name, "t1"));
        assert!(!pool.release(&lease.server.name, "t1"));
        assert!(!pool.release("missing", "t1"));
        assert_eq!(pool.summary().running_tasks, 0);
    }

    #[test]
    fn test_unreachable_server_drops_leases_and_is_skipped() {
        let pool = pool(AllocationConfig::LeastLoaded);
        // Equal load ties break by name: t1 lands on "a", t2 on the idle "b".
        assert_eq!(pool.allocate("t1", 0).unwrap().server.name, "a");
        assert_eq!(pool.allocate("t2", 0).unwrap().server.name, "b");

        let lost = pool.mark_unreachable("a", "connection refused");
        assert_eq!(lost, vec!["t1".to_string()]);

        let info = pool.server("a").unwrap();
        assert_eq!(info.health, ServerHealth::Unreachable);
        assert_eq!(info.current_tasks, 0);
        assert_eq!(info.last_error.as_deref(), Some("connection refused"));

        // "b" is full and "a" is excluded.
        assert!(pool.allocate("t3", 0).is_none());
        assert_eq!(pool.summary().unreachable, 1);
        assert_eq!(pool.cluster_load(), 1.0);

        pool.mark_reachable("a");
        assert_eq!(pool.server("a").unwrap().health, ServerHealth::Available);
        assert_eq!(pool.allocate("t3", 0).unwrap().server.name, "a");
    }

    #[test]
    fn test_summary_counts() {
        let pool = pool(AllocationConfig::PriorityBased {
            reserved_fraction: 0.5,
            priority_threshold: 5,
        });
        pool.allocate("hi", 10).unwrap();

        let summary = pool.summary();
        assert_eq!(summary.strategy, "priority_based");
        assert_eq!(summary.total_servers, 2);
        assert_eq!(summary.total_capacity, 3);
        assert_eq!(summary.running_tasks, 1);
        assert!((summary.cluster_load - 1.0 / 3.0).abs() < 1e-9);
    }

    struct FlakyExecutor {
        down: &'static str,
    }

    #[async_trait]
    impl RemoteExecutor for FlakyExecutor {
        async fn execute(&self, server: &ServerConfig, cmd: &Command) -> RemoteResult<ExecResult> {
            if server.name == self.down {
                return Err(RemoteError::connection(server, "no route to host"));
            }
            let stdout = if cmd.args.iter().any(|a| a == SAMPLE_SCRIPT) {
                "load=0.75\ncpus=4\nmemory=0.5000\ndisk=0.2000\n".to_string()
            } else {
                String::new()
            };
            Ok(ExecResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
                duration: std::time::Duration::ZERO,
            })
        }

        async fn upload(&self, _: &ServerConfig, _: &Path, _: &str) -> RemoteResult<()> {
            Ok(())
        }

        async fn download(&self, _: &ServerConfig, _: &str, _: &Path) -> RemoteResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_health_check_reports_lost_leases() {
        let pool = pool(AllocationConfig::RoundRobin);
        let lease = pool.allocate("t1", 0).unwrap();
        assert_eq!(lease.server.name, "a");

        let report = pool.health_check(&FlakyExecutor { down: "a" }).await;

        assert_eq!(report.healthy, vec!["b".to_string()]);
        assert_eq!(report.unreachable, vec!["a".to_string()]);
        assert_eq!(
            report.lost,
            vec![LostLease {
                server: "a".into(),
                task: "t1".into()
            }]
        );
        assert!(pool.server("b").unwrap().last_checked.is_some());
    }

    #[tokio::test]
    async fn test_health_check_records_resource_history() {
        let pool = pool(AllocationConfig::RoundRobin);
        let executor = FlakyExecutor { down: "a" };
        pool.health_check(&executor).await;
        pool.health_check(&executor).await;

        let history = pool.resource_history("b", chrono::Duration::hours(1));
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].load_average, Some(0.75));
        assert_eq!(history[1].cpus, Some(4));
        assert_eq!(history[1].memory_usage, Some(0.5));

        let latest = pool.server("b").unwrap().resources.unwrap();
        assert_eq!(latest.disk_usage, Some(0.2));

        assert!(pool.resource_history("a", chrono::Duration::hours(1)).is_empty());
        assert!(pool.server("a").unwrap().resources.is_none());
        assert!(pool.resource_history("missing", chrono::Duration::hours(1)).is_empty());
    }
}
