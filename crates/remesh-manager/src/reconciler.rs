//! Reconciler — the single-writer control loop for the instance pool.
//!
//! All registry mutations flow through one actor task: scale requests,
//! probe reports, and periodic ticks arrive on an mpsc queue and are
//! applied in receipt order. The actor drives the pool toward the
//! desired replica count, replaces unhealthy instances with exponential
//! backoff, drains surplus instances behind a grace deadline, and
//! rebuilds the routing table after every pass.
//!
//! Reconciliation is exposed as an explicit `step_at()` so tests can
//! drive it deterministically with a synthetic clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use remesh_registry::{
    AddressPool, InstanceId, InstanceRecord, InstanceRegistry, InstanceStatus, InstanceView,
    RegistrySnapshot, RoutingTable, ScaleOutcome, SharedTable,
};

use crate::error::{ManagerError, ManagerResult};
use crate::launcher::InstanceLauncher;
use crate::probe::{http_probe, respawn_backoff, ProbeOutcome};

/// Process manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Replica ceiling; scale requests above this are rejected.
    pub max_replicas: u32,
    /// Desired replicas at startup.
    pub initial_replicas: u32,
    /// Consecutive probe failures before an instance is Unhealthy.
    pub failure_threshold: u32,
    /// Interval between health probe rounds.
    pub probe_interval: Duration,
    /// Per-probe timeout.
    pub probe_timeout: Duration,
    /// Health endpoint path on each instance.
    pub probe_path: String,
    /// How long a Draining instance may finish in-flight work.
    pub drain_grace: Duration,
    /// Respawn attempts per identity before permanent Failed.
    pub respawn_budget: u32,
    /// Base backoff between respawn attempts.
    pub respawn_backoff_base: Duration,
    /// Backoff cap.
    pub respawn_backoff_max: Duration,
    /// Interval between periodic reconcile ticks.
    pub reconcile_interval: Duration,
    /// Host for the instance address pool.
    pub host: String,
    /// Inclusive port range for the address pool.
    pub base_port: u16,
    pub max_port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_replicas: 10,
            initial_replicas: 2,
            failure_threshold: 3,
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            probe_path: "/healthz".to_string(),
            drain_grace: Duration::from_secs(10),
            respawn_budget: 5,
            respawn_backoff_base: Duration::from_secs(1),
            respawn_backoff_max: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(2),
            host: "127.0.0.1".to_string(),
            base_port: 8001,
            max_port: 8010,
        }
    }
}

/// Commands processed by the reconciler actor, in receipt order.
pub enum Command {
    Scale {
        replicas: u32,
        reply: oneshot::Sender<ManagerResult<ScaleOutcome>>,
    },
    ProbeReport {
        id: InstanceId,
        outcome: ProbeOutcome,
    },
    LaunchFailed {
        id: InstanceId,
        message: String,
    },
}

/// Cloneable handle for talking to the reconciler.
///
/// Reads (`get_instances`, `routing_table`) go straight to shared
/// snapshots and never wait on the writer; `scale` round-trips through
/// the command queue so mutations stay serialized.
#[derive(Clone)]
pub struct ManagerHandle {
    registry: InstanceRegistry,
    table: SharedTable,
    tx: mpsc::Sender<Command>,
}

impl ManagerHandle {
    /// Snapshot of all instances in wire shape. Never blocks on
    /// reconciliation.
    pub fn get_instances(&self) -> Vec<InstanceView> {
        self.registry.snapshot().views()
    }

    /// Full registry snapshot (ids, failure counters, timestamps).
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// The current routing table.
    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.table.load()
    }

    /// The shared table handle, for wiring an in-process balancer.
    pub fn shared_table(&self) -> SharedTable {
        self.table.clone()
    }

    /// Request a new desired replica count. Validation is synchronous;
    /// convergence is not.
    pub async fn scale(&self, replicas: u32) -> ManagerResult<ScaleOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Scale { replicas, reply })
            .await
            .map_err(|_| ManagerError::ReconcilerGone)?;
        rx.await.map_err(|_| ManagerError::ReconcilerGone)?
    }

    /// Report a probe outcome. Used by the external prober task.
    pub async fn report_probe(&self, id: InstanceId, outcome: ProbeOutcome) {
        let _ = self.tx.send(Command::ProbeReport { id, outcome }).await;
    }
}

/// The single-writer reconciler. Owns the registry, the address pool,
/// and the desired replica count.
pub struct Reconciler {
    cfg: ManagerConfig,
    registry: InstanceRegistry,
    table: SharedTable,
    pool: AddressPool,
    launcher: Arc<dyn InstanceLauncher>,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    desired: u32,
    next_seq: u64,
    /// Draining id → teardown deadline (unix seconds).
    drain_deadlines: HashMap<InstanceId, u64>,
    /// Unhealthy id → earliest respawn time (unix seconds).
    respawn_not_before: HashMap<InstanceId, u64>,
}

impl Reconciler {
    /// Build a reconciler and its handle.
    pub fn new(cfg: ManagerConfig, launcher: Arc<dyn InstanceLauncher>) -> (Self, ManagerHandle) {
        let registry = InstanceRegistry::new();
        let table = SharedTable::new();
        let pool = AddressPool::new(cfg.host.clone(), cfg.base_port, cfg.max_port);
        let (tx, rx) = mpsc::channel(64);

        let handle = ManagerHandle {
            registry: registry.clone(),
            table: table.clone(),
            tx: tx.clone(),
        };

        let desired = cfg.initial_replicas;
        let reconciler = Self {
            cfg,
            registry,
            table,
            pool,
            launcher,
            tx,
            rx,
            desired,
            next_seq: 0,
            drain_deadlines: HashMap::new(),
            respawn_not_before: HashMap::new(),
        };

        (reconciler, handle)
    }

    /// Current desired replica count.
    pub fn desired(&self) -> u32 {
        self.desired
    }

    /// One reconciliation pass at the current wall clock.
    pub fn step(&mut self) {
        self.step_at(epoch_secs());
    }

    /// One reconciliation pass with an explicit clock, for tests.
    ///
    /// Phases: complete elapsed drains, respawn unhealthy instances
    /// whose backoff has passed, converge toward the desired count,
    /// then rebuild the routing table.
    pub fn step_at(&mut self, now: u64) {
        self.complete_drains(now);
        self.respawn_unhealthy(now);
        self.converge(now);
        self.rebuild_table();
    }

    /// Handle a scale request. Called by `run()` for each queued
    /// command; tests call it directly.
    pub fn handle_scale(&mut self, replicas: u32, now: u64) -> ManagerResult<ScaleOutcome> {
        if replicas > self.cfg.max_replicas {
            return Err(ManagerError::ReplicaCeiling {
                requested: replicas,
                max: self.cfg.max_replicas,
            });
        }
        if replicas as usize > self.pool.capacity() {
            return Err(ManagerError::CapacityExceeded {
                requested: replicas,
                capacity: self.pool.capacity(),
            });
        }
        // An explicit scale request is operator intervention: any
        // permanently Failed records are acknowledged and cleared,
        // making their slots launchable again.
        let cleared = self.clear_failed();
        if replicas == self.desired {
            if cleared == 0 {
                debug!(replicas, "scale request is a no-op");
                return Ok(ScaleOutcome::AcceptedNoOp { replicas });
            }
            info!(cleared, replicas, "failed instances cleared; relaunching");
            self.step_at(now);
            return Ok(ScaleOutcome::Accepted { replicas });
        }

        info!(from = self.desired, to = replicas, "desired replica count updated");
        self.desired = replicas;
        self.step_at(now);
        Ok(ScaleOutcome::Accepted { replicas })
    }

    /// Handle a probe outcome for one instance.
    pub fn handle_probe(&mut self, id: &str, outcome: ProbeOutcome, now: u64) {
        let Some(record) = self.registry.get(id) else {
            // Probe raced an eviction; nothing to do.
            return;
        };
        if !matches!(
            record.status,
            InstanceStatus::Starting | InstanceStatus::Healthy
        ) {
            return;
        }

        match outcome {
            ProbeOutcome::Pass => {
                let was_starting = record.status == InstanceStatus::Starting;
                let _ = self.registry.update(id, |r| {
                    r.last_probe_at = now;
                    r.consecutive_failures = 0;
                    if r.status == InstanceStatus::Starting {
                        r.status = InstanceStatus::Healthy;
                    }
                    r.updated_at = now;
                });
                if was_starting {
                    info!(%id, "instance became healthy");
                }
            }
            ProbeOutcome::Fail => {
                let failures = record.consecutive_failures + 1;
                let crossed = failures >= self.cfg.failure_threshold;
                let _ = self.registry.update(id, |r| {
                    r.last_probe_at = now;
                    r.consecutive_failures = failures;
                    if crossed {
                        r.status = InstanceStatus::Unhealthy;
                    }
                    r.updated_at = now;
                });
                if crossed {
                    let backoff = respawn_backoff(
                        self.cfg.respawn_backoff_base,
                        self.cfg.respawn_backoff_max,
                        record.respawn_count,
                    );
                    self.respawn_not_before
                        .insert(id.to_string(), now + backoff.as_secs());
                    warn!(
                        %id,
                        failures,
                        threshold = self.cfg.failure_threshold,
                        backoff_secs = backoff.as_secs(),
                        "instance marked unhealthy"
                    );
                } else {
                    debug!(%id, failures, "probe failure under threshold");
                }
            }
        }

        self.rebuild_table();
    }

    /// Handle an asynchronous launch failure: treated like crossing
    /// the probe failure threshold immediately.
    pub fn handle_launch_failed(&mut self, id: &str, message: &str, now: u64) {
        warn!(%id, %message, "instance launch failed");
        let Some(record) = self.registry.get(id) else {
            return;
        };
        if record.status != InstanceStatus::Starting {
            return;
        }
        let _ = self.registry.update(id, |r| {
            r.status = InstanceStatus::Unhealthy;
            r.consecutive_failures = self.cfg.failure_threshold;
            r.updated_at = now;
        });
        let backoff = respawn_backoff(
            self.cfg.respawn_backoff_base,
            self.cfg.respawn_backoff_max,
            record.respawn_count,
        );
        self.respawn_not_before
            .insert(id.to_string(), now + backoff.as_secs());
        self.rebuild_table();
    }

    // ── Reconciliation phases ──────────────────────────────────────

    /// Tear down Draining instances whose grace deadline has elapsed.
    fn complete_drains(&mut self, now: u64) {
        let due: Vec<InstanceId> = self
            .drain_deadlines
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            self.drain_deadlines.remove(&id);
            let _ = self.registry.update(&id, |r| {
                r.status = InstanceStatus::Stopped;
                r.updated_at = now;
            });
            if let Ok(record) = self.registry.evict(&id) {
                self.pool.release(record.port);
                self.spawn_terminate(&record);
                info!(%id, address = %record.address(), "drained instance stopped");
            }
        }
    }

    /// Respawn Unhealthy instances whose backoff has passed, or mark
    /// them Failed once the budget is spent.
    fn respawn_unhealthy(&mut self, now: u64) {
        let snap = self.registry.snapshot();
        for record in snap
            .instances
            .iter()
            .filter(|r| r.status == InstanceStatus::Unhealthy)
        {
            let not_before = self
                .respawn_not_before
                .get(&record.id)
                .copied()
                .unwrap_or(0);
            if now < not_before {
                continue;
            }

            if record.respawn_count >= self.cfg.respawn_budget {
                self.respawn_not_before.remove(&record.id);
                self.pool.release(record.port);
                self.spawn_terminate(record);
                let _ = self.registry.update(&record.id, |r| {
                    r.status = InstanceStatus::Failed;
                    r.updated_at = now;
                });
                error!(
                    id = %record.id,
                    respawns = record.respawn_count,
                    "respawn budget exhausted; instance permanently failed"
                );
                continue;
            }

            // Allocate the replacement address before releasing the old
            // one, so the replacement never lands on the failing address
            // while alternatives exist.
            let (host, port) = match self.pool.allocate() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "respawn deferred: no free address");
                    continue;
                }
            };
            self.pool.release(record.port);
            self.spawn_terminate(record);

            let respawns = record.respawn_count + 1;
            let _ = self.registry.update(&record.id, |r| {
                r.host = host.clone();
                r.port = port;
                r.status = InstanceStatus::Starting;
                r.consecutive_failures = 0;
                r.respawn_count = respawns;
                r.started_at = now;
                r.updated_at = now;
            });
            self.respawn_not_before.remove(&record.id);
            info!(
                id = %record.id,
                address = format!("{host}:{port}"),
                respawns,
                "unhealthy instance respawned at a new address"
            );
            self.spawn_launch(&record.id, &host, port);
        }
    }

    /// Converge live capacity toward the desired count.
    fn converge(&mut self, now: u64) {
        let snap = self.registry.snapshot();
        // Unhealthy instances awaiting respawn reserve capacity so the
        // replacement stays counted against the desired total. Failed
        // identities keep holding their slot too: handing it to a
        // fresh identity would relaunch a persistent fault forever.
        let pending_respawn = snap.count(InstanceStatus::Unhealthy);
        let failed = snap.count(InstanceStatus::Failed);
        let live = snap.live_count() + pending_respawn;
        let desired = self.desired as usize;

        if desired > live + failed {
            let need = desired - live - failed;
            for _ in 0..need {
                if let Err(e) = self.launch_new(now) {
                    warn!(error = %e, "launch skipped");
                    break;
                }
            }
        } else if desired < live {
            let surplus = live - desired;
            self.drain_surplus(&snap, surplus, now);
        }
    }

    /// Launch one brand-new instance identity.
    fn launch_new(&mut self, now: u64) -> ManagerResult<()> {
        let (host, port) = self.pool.allocate()?;
        let id = format!("inst-{}", self.next_seq);
        self.next_seq += 1;

        let record = InstanceRecord {
            id: id.clone(),
            host: host.clone(),
            port,
            status: InstanceStatus::Starting,
            consecutive_failures: 0,
            respawn_count: 0,
            last_probe_at: 0,
            started_at: now,
            updated_at: now,
        };
        if let Err(e) = self.registry.insert(record) {
            self.pool.release(port);
            return Err(e.into());
        }

        info!(%id, address = format!("{host}:{port}"), "instance launching");
        self.spawn_launch(&id, &host, port);
        Ok(())
    }

    /// Mark the `surplus` most recently started live instances as
    /// Draining. Warm (older) instances are preserved.
    fn drain_surplus(&mut self, snap: &RegistrySnapshot, surplus: usize, now: u64) {
        let mut candidates: Vec<&InstanceRecord> = snap
            .instances
            .iter()
            .filter(|r| r.status.counts_toward_desired())
            .collect();
        // Most recent first; id breaks ties for same-tick launches.
        candidates.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        for record in candidates.into_iter().take(surplus) {
            let deadline = now + self.cfg.drain_grace.as_secs();
            let _ = self.registry.update(&record.id, |r| {
                r.status = InstanceStatus::Draining;
                r.updated_at = now;
            });
            self.drain_deadlines.insert(record.id.clone(), deadline);
            info!(
                id = %record.id,
                address = %record.address(),
                grace_secs = self.cfg.drain_grace.as_secs(),
                "instance draining"
            );
        }
    }

    /// Evict permanently Failed records. Their addresses were released
    /// when the respawn budget ran out, so only the registry changes.
    fn clear_failed(&mut self) -> usize {
        let snap = self.registry.snapshot();
        let failed: Vec<InstanceId> = snap
            .instances
            .iter()
            .filter(|r| r.status == InstanceStatus::Failed)
            .map(|r| r.id.clone())
            .collect();
        for id in &failed {
            if let Ok(record) = self.registry.evict(id) {
                info!(id = %record.id, "permanently failed instance cleared");
            }
        }
        failed.len()
    }

    /// Rebuild and swap the routing table from Healthy instances.
    fn rebuild_table(&self) {
        let snap = self.registry.snapshot();
        self.table.swap(RoutingTable {
            generation: snap.generation,
            backends: snap.healthy_addresses(),
        });
    }

    // ── Background task helpers ────────────────────────────────────

    fn spawn_launch(&self, id: &str, host: &str, port: u16) {
        let launcher = self.launcher.clone();
        let tx = self.tx.clone();
        let id = id.to_string();
        let host = host.to_string();
        tokio::spawn(async move {
            if let Err(e) = launcher.launch(&id, &host, port).await {
                let _ = tx
                    .send(Command::LaunchFailed {
                        id,
                        message: e.to_string(),
                    })
                    .await;
            }
        });
    }

    fn spawn_terminate(&self, record: &InstanceRecord) {
        let launcher = self.launcher.clone();
        let id = record.id.clone();
        let host = record.host.clone();
        let port = record.port;
        tokio::spawn(async move {
            if let Err(e) = launcher.terminate(&id, &host, port).await {
                warn!(%id, error = %e, "terminate failed");
            }
        });
    }

    /// Probe every Starting/Healthy instance and queue the reports.
    fn spawn_probe_round(&self) {
        let snap = self.registry.snapshot();
        for record in snap.instances.iter().filter(|r| {
            matches!(
                r.status,
                InstanceStatus::Starting | InstanceStatus::Healthy
            )
        }) {
            let tx = self.tx.clone();
            let id = record.id.clone();
            let address = record.address();
            let path = self.cfg.probe_path.clone();
            let timeout = self.cfg.probe_timeout;
            tokio::spawn(async move {
                let outcome = http_probe(&address, &path, timeout).await;
                let _ = tx.send(Command::ProbeReport { id, outcome }).await;
            });
        }
    }

    /// Run the reconciler actor until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            desired = self.desired,
            max = self.cfg.max_replicas,
            "reconciler started"
        );
        let mut reconcile = tokio::time::interval(self.cfg.reconcile_interval);
        let mut probe = tokio::time::interval(self.cfg.probe_interval);

        // Converge toward the initial replica count immediately.
        self.step();

        loop {
            tokio::select! {
                Some(cmd) = self.rx.recv() => match cmd {
                    Command::Scale { replicas, reply } => {
                        let result = self.handle_scale(replicas, epoch_secs());
                        let _ = reply.send(result);
                    }
                    Command::ProbeReport { id, outcome } => {
                        self.handle_probe(&id, outcome, epoch_secs());
                    }
                    Command::LaunchFailed { id, message } => {
                        self.handle_launch_failed(&id, &message, epoch_secs());
                    }
                },
                _ = reconcile.tick() => {
                    self.step();
                }
                _ = probe.tick() => {
                    self.spawn_probe_round();
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::NullLauncher;

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            max_replicas: 5,
            initial_replicas: 0,
            failure_threshold: 3,
            drain_grace: Duration::from_secs(10),
            respawn_budget: 2,
            respawn_backoff_base: Duration::from_secs(1),
            respawn_backoff_max: Duration::from_secs(60),
            base_port: 8001,
            max_port: 8005,
            ..ManagerConfig::default()
        }
    }

    fn setup() -> (Reconciler, ManagerHandle) {
        Reconciler::new(test_config(), Arc::new(NullLauncher))
    }

    /// Promote every Starting instance to Healthy via probe passes.
    fn pass_probes(rec: &mut Reconciler, handle: &ManagerHandle, now: u64) {
        for view in handle.get_instances() {
            if view.state == InstanceStatus::Starting {
                rec.handle_probe(&view.id, ProbeOutcome::Pass, now);
            }
        }
    }

    #[tokio::test]
    async fn scale_up_launches_instances() {
        let (mut rec, handle) = setup();

        let outcome = rec.handle_scale(3, 100).unwrap();
        assert_eq!(outcome, ScaleOutcome::Accepted { replicas: 3 });

        let views = handle.get_instances();
        assert_eq!(views.len(), 3);
        assert!(views.iter().all(|v| v.state == InstanceStatus::Starting));
        // Starting instances are not routable yet.
        assert!(handle.routing_table().is_empty());
    }

    #[tokio::test]
    async fn probe_pass_promotes_to_healthy_and_routes() {
        let (mut rec, handle) = setup();
        rec.handle_scale(2, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);

        let views = handle.get_instances();
        assert!(views.iter().all(|v| v.state == InstanceStatus::Healthy));

        let table = handle.routing_table();
        assert_eq!(
            table.backends,
            vec!["127.0.0.1:8001", "127.0.0.1:8002"]
        );
    }

    #[tokio::test]
    async fn scale_to_same_count_is_a_no_op() {
        let (mut rec, _handle) = setup();
        rec.handle_scale(2, 100).unwrap();

        let outcome = rec.handle_scale(2, 101).unwrap();
        assert_eq!(outcome, ScaleOutcome::AcceptedNoOp { replicas: 2 });
    }

    #[tokio::test]
    async fn scale_above_max_rejected() {
        let (mut rec, handle) = setup();
        let err = rec.handle_scale(6, 100).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ReplicaCeiling { requested: 6, max: 5 }
        ));
        assert!(handle.get_instances().is_empty());
    }

    #[tokio::test]
    async fn scale_beyond_pool_capacity_rejected() {
        let cfg = ManagerConfig {
            max_replicas: 10,
            base_port: 8001,
            max_port: 8003, // capacity 3
            ..test_config()
        };
        let (mut rec, _) = Reconciler::new(cfg, Arc::new(NullLauncher));

        let err = rec.handle_scale(4, 100).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::CapacityExceeded { requested: 4, capacity: 3 }
        ));
    }

    #[tokio::test]
    async fn scale_down_drains_most_recent_first() {
        let (mut rec, handle) = setup();
        rec.handle_scale(2, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);
        rec.handle_scale(3, 200).unwrap();
        pass_probes(&mut rec, &handle, 201);

        rec.handle_scale(2, 300).unwrap();

        let snap = handle.snapshot();
        let draining: Vec<_> = snap
            .instances
            .iter()
            .filter(|r| r.status == InstanceStatus::Draining)
            .collect();
        assert_eq!(draining.len(), 1);
        // The instance started at t=200 (the newest) drains first.
        assert_eq!(draining[0].started_at, 200);
        // Draining leaves the routing table immediately.
        assert_eq!(handle.routing_table().len(), 2);
    }

    #[tokio::test]
    async fn drained_instance_evicted_after_grace() {
        let (mut rec, handle) = setup();
        rec.handle_scale(1, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);
        rec.handle_scale(0, 200).unwrap();

        assert_eq!(handle.get_instances().len(), 1);
        // Grace is 10s: not yet.
        rec.step_at(205);
        assert_eq!(handle.get_instances().len(), 1);

        rec.step_at(211);
        assert!(handle.get_instances().is_empty());
        assert!(handle.routing_table().is_empty());
    }

    #[tokio::test]
    async fn scale_zero_drains_everything() {
        let (mut rec, handle) = setup();
        rec.handle_scale(3, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);

        rec.handle_scale(0, 200).unwrap();
        let views = handle.get_instances();
        assert!(views.iter().all(|v| v.state == InstanceStatus::Draining));
        assert!(handle.routing_table().is_empty());

        rec.step_at(200 + 11);
        assert!(handle.get_instances().is_empty());
    }

    #[tokio::test]
    async fn failure_threshold_marks_unhealthy_and_removes_from_table() {
        let (mut rec, handle) = setup();
        rec.handle_scale(2, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);

        let victim = handle.get_instances()[0].id.clone();
        rec.handle_probe(&victim, ProbeOutcome::Fail, 102);
        rec.handle_probe(&victim, ProbeOutcome::Fail, 103);
        // Two failures: still healthy.
        assert_eq!(handle.routing_table().len(), 2);

        rec.handle_probe(&victim, ProbeOutcome::Fail, 104);
        let snap = handle.snapshot();
        let rec_state = snap.instances.iter().find(|r| r.id == victim).unwrap();
        assert_eq!(rec_state.status, InstanceStatus::Unhealthy);
        assert_eq!(handle.routing_table().len(), 1);
    }

    #[tokio::test]
    async fn unhealthy_instance_respawned_at_new_address() {
        let (mut rec, handle) = setup();
        rec.handle_scale(1, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);

        let old_address = handle.get_instances()[0].address.clone();
        let id = handle.get_instances()[0].id.clone();
        for t in [102, 103, 104] {
            rec.handle_probe(&id, ProbeOutcome::Fail, t);
        }
        assert!(handle.routing_table().is_empty());

        // Backoff is 1s after the failure at t=104.
        rec.step_at(106);
        let view = &handle.get_instances()[0];
        assert_eq!(view.id, id);
        assert_eq!(view.state, InstanceStatus::Starting);
        assert_ne!(view.address, old_address);

        // Replacement passes its probe and re-enters the table.
        rec.handle_probe(&id, ProbeOutcome::Pass, 107);
        let table = handle.routing_table();
        assert_eq!(table.backends, vec![view.address.clone()]);
        assert!(!table.backends.contains(&old_address));
    }

    #[tokio::test]
    async fn respawn_waits_for_backoff() {
        let (mut rec, handle) = setup();
        rec.handle_scale(1, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);
        let id = handle.get_instances()[0].id.clone();
        for t in [102, 103, 104] {
            rec.handle_probe(&id, ProbeOutcome::Fail, t);
        }

        // Same tick as the failure: backoff (1s) has not elapsed.
        rec.step_at(104);
        assert_eq!(
            handle.get_instances()[0].state,
            InstanceStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn respawn_budget_exhaustion_fails_permanently() {
        let (mut rec, handle) = setup();
        rec.handle_scale(1, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);
        let id = handle.get_instances()[0].id.clone();

        // Budget is 2: fail, respawn, fail, respawn, fail → Failed.
        let mut now = 102;
        for round in 0..3 {
            for _ in 0..3 {
                rec.handle_probe(&id, ProbeOutcome::Fail, now);
                now += 1;
            }
            now += 70; // Clear any backoff.
            rec.step_at(now);
            if round < 2 {
                assert_eq!(
                    handle.get_instances()[0].state,
                    InstanceStatus::Starting,
                    "round {round} should respawn"
                );
                rec.handle_probe(&id, ProbeOutcome::Pass, now);
            }
        }

        let view = &handle.get_instances()[0];
        assert_eq!(view.state, InstanceStatus::Failed);
        // Failed instances stay visible for operators, but are not
        // replaced and not routed.
        assert!(handle.routing_table().is_empty());
        rec.step_at(now + 100);
        assert_eq!(handle.get_instances().len(), 1);
        assert_eq!(handle.get_instances()[0].state, InstanceStatus::Failed);
    }

    /// Drive `id` through probe failures and respawns until its budget
    /// (2 in `test_config`) is spent and it is marked Failed. Returns
    /// a clock past the final transition.
    fn exhaust_respawns(rec: &mut Reconciler, id: &str, mut now: u64) -> u64 {
        for _ in 0..3 {
            for _ in 0..3 {
                rec.handle_probe(id, ProbeOutcome::Fail, now);
                now += 1;
            }
            now += 70; // clear any backoff
            rec.step_at(now);
        }
        now
    }

    #[tokio::test]
    async fn failed_instance_holds_its_slot() {
        let (mut rec, handle) = setup();
        rec.handle_scale(1, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);
        let id = handle.get_instances()[0].id.clone();

        let now = exhaust_respawns(&mut rec, &id, 102);
        assert_eq!(handle.get_instances()[0].state, InstanceStatus::Failed);

        // Reconciliation keeps the Failed record in place instead of
        // laundering the retry through fresh identities.
        for t in [10, 500, 5000] {
            rec.step_at(now + t);
            let views = handle.get_instances();
            assert_eq!(views.len(), 1);
            assert_eq!(views[0].id, id);
            assert_eq!(views[0].state, InstanceStatus::Failed);
        }
        assert!(handle.routing_table().is_empty());
    }

    #[tokio::test]
    async fn scale_request_clears_failed_and_relaunches() {
        let (mut rec, handle) = setup();
        rec.handle_scale(1, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);
        let id = handle.get_instances()[0].id.clone();
        let now = exhaust_respawns(&mut rec, &id, 102);

        // Re-asserting the same count acknowledges the failure; the
        // slot relaunches under a new identity with a fresh budget.
        let outcome = rec.handle_scale(1, now + 10).unwrap();
        assert_eq!(outcome, ScaleOutcome::Accepted { replicas: 1 });

        let views = handle.get_instances();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].state, InstanceStatus::Starting);
        assert_ne!(views[0].id, id);
    }

    #[tokio::test]
    async fn replacement_is_counted_against_desired() {
        let (mut rec, handle) = setup();
        rec.handle_scale(2, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);

        let id = handle.get_instances()[0].id.clone();
        for t in [102, 103, 104] {
            rec.handle_probe(&id, ProbeOutcome::Fail, t);
        }

        // While one instance is unhealthy-pending-respawn, no extra
        // identity is launched.
        rec.step_at(104);
        assert_eq!(handle.get_instances().len(), 2);
        rec.step_at(110);
        assert_eq!(handle.get_instances().len(), 2);
    }

    #[tokio::test]
    async fn launch_failure_triggers_replacement_path() {
        let (mut rec, handle) = setup();
        rec.handle_scale(1, 100).unwrap();
        let id = handle.get_instances()[0].id.clone();

        rec.handle_launch_failed(&id, "spawn refused", 101);
        assert_eq!(
            handle.get_instances()[0].state,
            InstanceStatus::Unhealthy
        );

        rec.step_at(103);
        assert_eq!(
            handle.get_instances()[0].state,
            InstanceStatus::Starting
        );
    }

    #[tokio::test]
    async fn no_address_reuse_between_live_instances() {
        let (mut rec, handle) = setup();
        rec.handle_scale(3, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);

        let mut addresses: Vec<String> = handle
            .get_instances()
            .iter()
            .map(|v| v.address.clone())
            .collect();
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), 3);
    }

    #[tokio::test]
    async fn table_generation_is_monotonic() {
        let (mut rec, handle) = setup();
        let mut last = handle.routing_table().generation;

        rec.handle_scale(2, 100).unwrap();
        pass_probes(&mut rec, &handle, 101);
        for t in [200, 300] {
            rec.step_at(t);
            let generation = handle.routing_table().generation;
            assert!(generation >= last);
            last = generation;
        }
    }

    #[tokio::test]
    async fn handle_scale_via_actor_round_trip() {
        let (rec, handle) = setup();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let actor = tokio::spawn(rec.run(shutdown_rx));

        let outcome = handle.scale(2).await.unwrap();
        assert_eq!(outcome, ScaleOutcome::Accepted { replicas: 2 });
        assert_eq!(handle.get_instances().len(), 2);

        // Probe reports flow through the same queue.
        for view in handle.get_instances() {
            handle.report_probe(view.id, ProbeOutcome::Pass).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.routing_table().len(), 2);

        // Rejections propagate through the queue too.
        let err = handle.scale(99).await.unwrap_err();
        assert!(matches!(err, ManagerError::ReplicaCeiling { .. }));

        actor.abort();
    }
}
