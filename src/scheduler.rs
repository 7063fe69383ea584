//! Dependency-ordered scheduling: release services as their
//! prerequisites turn healthy, shut the fleet down in reverse order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::service::{ServiceSnapshot, ServiceSpec, ServiceState, StatusBoard};
use crate::supervisor::{spawn_supervisor, Command, SupervisorHandle, SupervisorOptions};

/// How long the force-kill sweep after the hard cap is allowed to take.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

/// Immutable dependency graph over the service roster.
///
/// An edge v -> u exists iff `u.depends_on` contains v, so a topological
/// order lists prerequisites before their dependents.
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    order: Vec<String>,
    prerequisites: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    depth: usize,
}

impl ServiceGraph {
    pub fn build(specs: &[ServiceSpec]) -> Result<Self> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
        for spec in specs {
            let idx = graph.add_node(spec.name.clone());
            nodes.insert(spec.name.clone(), idx);
        }
        for spec in specs {
            let u = nodes[&spec.name];
            for dep in &spec.depends_on {
                let v = *nodes.get(dep).ok_or_else(|| Error::UnknownDependency {
                    service: spec.name.clone(),
                    dependency: dep.clone(),
                })?;
                if v == u {
                    return Err(Error::DependencyCycle(vec![
                        spec.name.clone(),
                        spec.name.clone(),
                    ]));
                }
                graph.add_edge(v, u, ());
            }
        }

        let order = match toposort(&graph, None) {
            Ok(sorted) => sorted
                .into_iter()
                .map(|idx| graph[idx].clone())
                .collect::<Vec<_>>(),
            Err(_) => {
                return Err(Error::DependencyCycle(Self::name_one_cycle(&graph)));
            }
        };

        let mut prerequisites: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for spec in specs {
            prerequisites.insert(spec.name.clone(), spec.depends_on.clone());
            dependents.entry(spec.name.clone()).or_default();
            for dep in &spec.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(spec.name.clone());
            }
        }

        // Longest chain length, used to bound the shutdown hard cap.
        let mut chain: HashMap<&str, usize> = HashMap::new();
        let mut depth = 0;
        for name in &order {
            let longest_prereq = prerequisites[name]
                .iter()
                .map(|dep| chain.get(dep.as_str()).copied().unwrap_or(1))
                .max()
                .unwrap_or(0);
            let len = longest_prereq + 1;
            chain.insert(name.as_str(), len);
            depth = depth.max(len);
        }

        Ok(Self {
            order,
            prerequisites,
            dependents,
            depth,
        })
    }

    /// Extract one strongly connected component as a human-readable cycle.
    fn name_one_cycle(graph: &DiGraph<String, ()>) -> Vec<String> {
        for scc in tarjan_scc(graph) {
            if scc.len() > 1 {
                let mut names: Vec<String> =
                    scc.into_iter().map(|idx| graph[idx].clone()).collect();
                names.sort();
                return names;
            }
        }
        Vec::new()
    }

    /// Topological order, prerequisites first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn reverse_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    pub fn prerequisites(&self, name: &str) -> &[String] {
        self.prerequisites
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Longest dependency chain length.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Started,
    Stopped,
}

/// Owns every supervisor and coordinates fleet-wide startup and shutdown.
pub struct Scheduler {
    graph: ServiceGraph,
    handles: HashMap<String, SupervisorHandle>,
    board: StatusBoard,
    events: EventBus,
    cancel: CancellationToken,
    phase: tokio::sync::Mutex<Phase>,
}

impl Scheduler {
    /// Build the graph (rejecting cycles) and spawn one supervisor per
    /// service. Must run inside a tokio runtime.
    pub fn new(
        specs: Vec<ServiceSpec>,
        opts: SupervisorOptions,
        board: StatusBoard,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let graph = ServiceGraph::build(&specs)?;
        let mut handles = HashMap::new();
        for spec in specs {
            let name = spec.name.clone();
            let handle = spawn_supervisor(
                Arc::new(spec),
                opts.clone(),
                board.clone(),
                events.clone(),
                cancel.clone(),
            );
            handles.insert(name, handle);
        }
        Ok(Self {
            graph,
            handles,
            board,
            events,
            cancel,
            phase: tokio::sync::Mutex::new(Phase::Idle),
        })
    }

    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Release the fleet in dependency order and wait until every service
    /// has reached `Healthy`, `Failed`, or `Stopped` at least once.
    /// Idempotent: calling again after startup is a no-op.
    pub async fn start_all(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock().await;
            if *phase != Phase::Idle {
                debug!("start_all ignored, scheduler already {:?}", *phase);
                return Ok(());
            }
            *phase = Phase::Started;
        }
        if self.graph.is_empty() {
            return Ok(());
        }

        // Subscribe before releasing anything so no transition is missed.
        let mut rx = self.events.subscribe();

        for name in self.graph.order() {
            self.send(name, Command::Release).await?;
        }

        let mut released: HashSet<String> = HashSet::new();
        let mut healthy: HashSet<String> = HashSet::new();
        let mut resolved: HashSet<String> = HashSet::new();

        for name in self.graph.order() {
            if self.graph.prerequisites(name).is_empty() {
                self.send(name, Command::DepsReady).await?;
                released.insert(name.clone());
            }
        }

        info!(services = self.graph.len(), "startup underway");
        while resolved.len() < self.graph.len() {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = self.cancel.cancelled() => break,
            };
            match event {
                Ok(ev) => match ev.to {
                    ServiceState::Healthy => {
                        resolved.insert(ev.service.clone());
                        if healthy.insert(ev.service.clone()) {
                            self.release_dependents(&ev.service, &healthy, &mut released)
                                .await?;
                        }
                    }
                    ServiceState::Failed => {
                        resolved.insert(ev.service.clone());
                        self.fail_dependents(&ev.service, &released).await?;
                    }
                    // Parked unhealthy (restart disabled) can never satisfy
                    // a dependent's start gate; fail waiting dependents or
                    // startup would block on them forever.
                    ServiceState::Unhealthy => {
                        resolved.insert(ev.service.clone());
                        self.fail_dependents(&ev.service, &released).await?;
                    }
                    ServiceState::Stopped => {
                        resolved.insert(ev.service.clone());
                    }
                    _ => {}
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged during startup, rescanning");
                    for snap in self.board.snapshot().await {
                        match snap.state {
                            ServiceState::Healthy => {
                                resolved.insert(snap.name.clone());
                                if healthy.insert(snap.name.clone()) {
                                    self.release_dependents(
                                        &snap.name,
                                        &healthy,
                                        &mut released,
                                    )
                                    .await?;
                                }
                            }
                            ServiceState::Failed | ServiceState::Unhealthy => {
                                resolved.insert(snap.name.clone());
                                self.fail_dependents(&snap.name, &released).await?;
                            }
                            ServiceState::Stopped => {
                                resolved.insert(snap.name.clone());
                            }
                            _ => {}
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!(
            resolved = resolved.len(),
            services = self.graph.len(),
            "startup finished"
        );
        Ok(())
    }

    async fn release_dependents(
        &self,
        now_healthy: &str,
        healthy: &HashSet<String>,
        released: &mut HashSet<String>,
    ) -> Result<()> {
        for dependent in self.graph.dependents(now_healthy) {
            if released.contains(dependent) {
                continue;
            }
            let ready = self
                .graph
                .prerequisites(dependent)
                .iter()
                .all(|dep| healthy.contains(dep));
            if ready {
                debug!(service = %dependent, "prerequisites healthy, releasing");
                self.send(dependent, Command::DepsReady).await?;
                released.insert(dependent.to_string());
            }
        }
        Ok(())
    }

    /// A terminally failed prerequisite means dependents that have not
    /// started can never start; fail them rather than wait forever.
    async fn fail_dependents(&self, failed: &str, released: &HashSet<String>) -> Result<()> {
        for dependent in self.graph.dependents(failed) {
            if released.contains(dependent) {
                continue;
            }
            self.send(
                dependent,
                Command::DepFailed {
                    dependency: failed.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Reverse-order shutdown: a service begins stopping only after every
    /// dependent is terminal. Bounded by a hard cap of
    /// `2 * grace * depth`, after which stragglers are force-killed in
    /// parallel. Idempotent.
    pub async fn stop_all(&self, grace: Duration) -> Result<()> {
        {
            let mut phase = self.phase.lock().await;
            if *phase == Phase::Stopped {
                debug!("stop_all ignored, scheduler already stopped");
                return Ok(());
            }
            *phase = Phase::Stopped;
        }

        // Trip every pending timer and in-flight probe; supervisors with
        // live children wait for their ordered Stop below.
        self.cancel.cancel();

        let depth = self.graph.depth().max(1) as u32;
        let hard_cap = grace * 2 * depth;
        let deadline = Instant::now() + hard_cap;
        info!(
            services = self.graph.len(),
            hard_cap_secs = hard_cap.as_secs(),
            "shutdown underway"
        );

        let mut tasks = JoinSet::new();
        for name in self.graph.reverse_order() {
            let dependents: Vec<String> = self.graph.dependents(&name).to_vec();
            let handle = match self.handles.get(&name) {
                Some(handle) => handle.clone(),
                None => continue,
            };
            let board = self.board.clone();
            let events = self.events.clone();
            tasks.spawn(async move {
                if !wait_until_terminal(&board, &events, &dependents, deadline).await {
                    warn!(
                        service = %name,
                        "dependents still up at the shutdown cap, stopping anyway"
                    );
                }
                if let Err(e) = handle.stop(grace).await {
                    debug!(service = %name, error = %e, "stop delivery failed");
                }
            });
        }

        let all_stopped = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(hard_cap + FORCE_KILL_WAIT, all_stopped)
            .await
            .is_err()
        {
            tasks.abort_all();
            self.force_kill_stragglers().await;
        }
        info!("shutdown finished");
        Ok(())
    }

    async fn force_kill_stragglers(&self) {
        let stragglers: Vec<ServiceSnapshot> = self
            .board
            .snapshot()
            .await
            .into_iter()
            .filter(|snap| !snap.state.is_terminal())
            .collect();
        if stragglers.is_empty() {
            return;
        }
        warn!(count = stragglers.len(), "force-killing remaining services");
        let mut kills = JoinSet::new();
        for snap in stragglers {
            if let Some(handle) = self.handles.get(&snap.name) {
                let handle = handle.clone();
                kills.spawn(async move {
                    let _ = handle.stop(Duration::ZERO).await;
                });
            }
        }
        let drain = async {
            while kills.join_next().await.is_some() {}
        };
        if tokio::time::timeout(FORCE_KILL_WAIT, drain).await.is_err() {
            kills.abort_all();
        }
    }

    /// Queue a restart of one service; it cycles through `Stopping` into a
    /// new generation.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.send(name, Command::Restart).await
    }

    pub async fn status(&self) -> Vec<ServiceSnapshot> {
        self.board.snapshot().await
    }

    async fn send(&self, name: &str, cmd: Command) -> Result<()> {
        self.handles
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?
            .send(cmd)
            .await
    }
}

/// Wait until every named service is terminal, the event stream closes,
/// or the deadline passes. Returns true when all are terminal.
async fn wait_until_terminal(
    board: &StatusBoard,
    events: &EventBus,
    names: &[String],
    deadline: Instant,
) -> bool {
    if names.is_empty() {
        return true;
    }
    let mut rx = events.subscribe();
    loop {
        let mut remaining = 0usize;
        for name in names {
            // A missing snapshot means the supervisor never came up;
            // nothing to wait for.
            let terminal = board
                .get(name)
                .await
                .map(|snap| snap.state.is_terminal())
                .unwrap_or(true);
            if !terminal {
                remaining += 1;
            }
        }
        if remaining == 0 {
            return true;
        }
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return false;
        }
        match tokio::time::timeout(budget, rx.recv()).await {
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => return false,
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    fn spec(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            work_dir: PathBuf::from("/tmp"),
            start_cmd: vec!["true".to_string()],
            environment: StdHashMap::new(),
            log_redirect: false,
            log_dir: PathBuf::from("/tmp"),
            log_max_size: 1024,
            log_keep: 1,
            data_dir: PathBuf::from("/tmp"),
            startup_delay: Duration::ZERO,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            probe: None,
            restart: false,
        }
    }

    #[test]
    fn topological_order_lists_prerequisites_first() {
        let specs = vec![
            spec("c", &["b"]),
            spec("a", &[]),
            spec("b", &["a"]),
        ];
        let graph = ServiceGraph::build(&specs).unwrap();
        assert_eq!(graph.order(), &["a", "b", "c"]);
        assert_eq!(graph.reverse_order(), vec!["c", "b", "a"]);
        assert_eq!(graph.depth(), 3);
    }

    #[test]
    fn independent_branches_share_no_ordering() {
        let specs = vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a"]),
            spec("d", &["a"]),
        ];
        let graph = ServiceGraph::build(&specs).unwrap();
        assert_eq!(graph.order()[0], "a");
        let mut dependents = graph.dependents("a").to_vec();
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c", "d"]);
        assert_eq!(graph.depth(), 2);
    }

    #[test]
    fn cycle_is_rejected_and_named() {
        let specs = vec![spec("a", &["b"]), spec("b", &["a"]), spec("c", &[])];
        let err = ServiceGraph::build(&specs).unwrap_err();
        match err {
            Error::DependencyCycle(names) => {
                assert_eq!(names, vec!["a", "b"]);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let specs = vec![spec("a", &["a"])];
        assert!(matches!(
            ServiceGraph::build(&specs),
            Err(Error::DependencyCycle(_))
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let specs = vec![spec("a", &["ghost"])];
        assert!(matches!(
            ServiceGraph::build(&specs),
            Err(Error::UnknownDependency { .. })
        ));
    }
}
