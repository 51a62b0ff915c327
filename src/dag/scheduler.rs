//! DAG scheduler
//!
//! Executes a dependency graph of [`DagJob`]s on a [`WorkerPool`],
//! dispatching every node whose dependencies have completed, in parallel
//! across independent branches (or through a one-at-a-time lane when
//! parallel execution is disabled). Failures are handled per the configured
//! [`DagFailurePolicy`]; the first error wins and is what [`wait`] returns.
//!
//! The graph is owned exclusively by the scheduler: nodes refer to each
//! other by id, queries take a shared lock, and structural changes take an
//! exclusive lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::dag::config::{DagConfig, DagFailurePolicy, DagStats};
use crate::dag::job::{DagJob, DagJobId, DagJobInfo, DagJobState};
use crate::error::{EngineError, EngineResult, VoidResult};
use crate::events::{self, EngineEvent, SharedSink};
use crate::job::Job;
use crate::pool::WorkerPool;

pub(crate) struct Graph {
    pub(crate) jobs: HashMap<DagJobId, Arc<DagJob>>,
    pub(crate) dependencies: HashMap<DagJobId, Vec<DagJobId>>,
    pub(crate) dependents: HashMap<DagJobId, Vec<DagJobId>>,
    /// Insertion order, for deterministic iteration
    pub(crate) order: Vec<DagJobId>,
}

impl Graph {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            dependencies: HashMap::new(),
            dependents: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn deps_satisfied(&self, id: DagJobId) -> bool {
        self.dependencies
            .get(&id)
            .map(|deps| {
                deps.iter().all(|dep| {
                    self.jobs
                        .get(dep)
                        .map(|node| node.state() == DagJobState::Completed)
                        .unwrap_or(true)
                })
            })
            .unwrap_or(true)
    }

    /// Whether `target` is reachable from `start` following dependency edges
    fn reaches(&self, start: DagJobId, target: DagJobId) -> bool {
        let mut stack = vec![start];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if seen.insert(current) {
                if let Some(deps) = self.dependencies.get(&current) {
                    stack.extend(deps.iter().copied());
                }
            }
        }
        false
    }

    /// Kahn topological sort; `None` when a cycle exists
    fn topological_order(&self) -> Option<Vec<DagJobId>> {
        let mut in_degree: HashMap<DagJobId, usize> = self
            .order
            .iter()
            .map(|&id| {
                (
                    id,
                    self.dependencies.get(&id).map(Vec::len).unwrap_or(0),
                )
            })
            .collect();

        let mut queue: VecDeque<DagJobId> = self
            .order
            .iter()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            sorted.push(id);
            if let Some(dependents) = self.dependents.get(&id) {
                for &dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if sorted.len() == self.order.len() {
            Some(sorted)
        } else {
            None
        }
    }
}

pub(crate) struct HandleShared {
    result: Mutex<Option<VoidResult>>,
    completed: Condvar,
}

impl HandleShared {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    fn set(&self, result: VoidResult) {
        let mut guard = self.result.lock();
        if guard.is_none() {
            *guard = Some(result);
        }
        self.completed.notify_all();
    }
}

/// Completion handle for one DAG execution
///
/// Returned by [`DagScheduler::execute_all`] and [`DagScheduler::execute`];
/// resolves to the first error encountered, or `Ok` when every node reached
/// a terminal state without one.
#[derive(Clone)]
pub struct ExecutionHandle {
    shared: Arc<HandleShared>,
}

impl ExecutionHandle {
    /// Block until the execution finishes
    pub fn wait(&self) -> VoidResult {
        let mut guard = self.shared.result.lock();
        while guard.is_none() {
            self.shared.completed.wait(&mut guard);
        }
        guard.clone().unwrap_or(Ok(()))
    }

    /// Block up to `timeout`; `None` when still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<VoidResult> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.result.lock();
        while guard.is_none() {
            if self
                .shared
                .completed
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                break;
            }
        }
        guard.clone()
    }

    /// Result without blocking; `None` when still running
    pub fn try_result(&self) -> Option<VoidResult> {
        self.shared.result.lock().clone()
    }

    /// Whether the execution has finished
    pub fn is_complete(&self) -> bool {
        self.shared.result.lock().is_some()
    }
}

struct ExecState {
    active: Option<Arc<HashSet<DagJobId>>>,
    retry_counts: HashMap<DagJobId, usize>,
    first_error: Option<EngineError>,
    started_at: Option<Instant>,
    last_wall_time: Duration,
    handle: Option<Arc<HandleShared>>,
}

struct DagInner {
    pool: Arc<WorkerPool>,
    config: DagConfig,
    graph: RwLock<Graph>,
    exec: Mutex<ExecState>,
    executing: AtomicBool,
    cancelled: AtomicBool,
    in_flight: AtomicUsize,
    sink: RwLock<SharedSink>,
}

/// Dependency-graph scheduler layered on a worker pool
pub struct DagScheduler {
    inner: Arc<DagInner>,
}

impl DagScheduler {
    /// Create a scheduler executing on `pool`
    pub fn new(pool: Arc<WorkerPool>, config: DagConfig) -> Self {
        Self {
            inner: Arc::new(DagInner {
                pool,
                config,
                graph: RwLock::new(Graph::new()),
                exec: Mutex::new(ExecState {
                    active: None,
                    retry_counts: HashMap::new(),
                    first_error: None,
                    started_at: None,
                    last_wall_time: Duration::ZERO,
                    handle: None,
                }),
                executing: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                sink: RwLock::new(events::null_sink()),
            }),
        }
    }

    /// Install the event sink used for node state events
    pub fn set_event_sink(&self, sink: SharedSink) {
        *self.inner.sink.write() = sink;
    }

    // =========================================================================
    // Graph construction
    // =========================================================================

    /// Add a node; dependencies declared on the node are registered
    pub fn add_job(&self, job: DagJob) -> DagJobId {
        let id = job.dag_id();
        let declared: Vec<DagJobId> = job.declared_dependencies().to_vec();

        let mut graph = self.inner.graph.write();
        graph.jobs.insert(id, Arc::new(job));
        graph.order.push(id);
        graph.dependencies.entry(id).or_default();
        graph.dependents.entry(id).or_default();

        for dependency in declared {
            if graph.jobs.contains_key(&dependency) {
                graph.dependencies.entry(id).or_default().push(dependency);
                graph.dependents.entry(dependency).or_default().push(id);
            } else {
                warn!(
                    dag_id = id,
                    dependency, "declared dependency unknown at add time, ignored"
                );
            }
        }
        trace!(dag_id = id, "dag job added");
        id
    }

    /// Add a dependency edge: `dependent` runs only after `dependency`
    ///
    /// With cycle detection enabled, an edge that would close a cycle is
    /// refused and the graph is left unchanged.
    pub fn add_dependency(&self, dependent: DagJobId, dependency: DagJobId) -> VoidResult {
        let mut graph = self.inner.graph.write();
        if !graph.jobs.contains_key(&dependent) {
            return Err(EngineError::UnknownDagJob(dependent));
        }
        if !graph.jobs.contains_key(&dependency) {
            return Err(EngineError::UnknownDagJob(dependency));
        }
        if dependent == dependency {
            return Err(EngineError::CycleDetected(format!(
                "job {dependent} cannot depend on itself"
            )));
        }
        if self.inner.config.detect_cycles && graph.reaches(dependency, dependent) {
            return Err(EngineError::CycleDetected(format!(
                "edge {dependent} -> {dependency} closes a cycle"
            )));
        }

        graph
            .dependencies
            .entry(dependent)
            .or_default()
            .push(dependency);
        graph
            .dependents
            .entry(dependency)
            .or_default()
            .push(dependent);
        Ok(())
    }

    /// Remove a node; only pending nodes can be removed
    pub fn remove_job(&self, id: DagJobId) -> VoidResult {
        let mut graph = self.inner.graph.write();
        let node = graph
            .jobs
            .get(&id)
            .ok_or(EngineError::UnknownDagJob(id))?;
        if node.state() != DagJobState::Pending {
            return Err(EngineError::DagJobRunning(id));
        }

        graph.jobs.remove(&id);
        graph.order.retain(|&other| other != id);
        graph.dependencies.remove(&id);
        graph.dependents.remove(&id);
        for deps in graph.dependencies.values_mut() {
            deps.retain(|&other| other != id);
        }
        for deps in graph.dependents.values_mut() {
            deps.retain(|&other| other != id);
        }
        self.inner.exec.lock().retry_counts.remove(&id);
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute every node in dependency order
    pub fn execute_all(&self) -> EngineResult<ExecutionHandle> {
        self.start_execution(None)
    }

    /// Execute `target` and its transitive dependencies only
    pub fn execute(&self, target: DagJobId) -> EngineResult<ExecutionHandle> {
        let active = {
            let graph = self.inner.graph.read();
            if !graph.jobs.contains_key(&target) {
                return Err(EngineError::UnknownDagJob(target));
            }
            let mut set = HashSet::new();
            let mut stack = vec![target];
            while let Some(id) = stack.pop() {
                if set.insert(id) {
                    if let Some(deps) = graph.dependencies.get(&id) {
                        stack.extend(deps.iter().copied());
                    }
                }
            }
            set
        };
        self.start_execution(Some(active))
    }

    fn start_execution(&self, active: Option<HashSet<DagJobId>>) -> EngineResult<ExecutionHandle> {
        if self
            .inner
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning(
                "dag execution already in progress".into(),
            ));
        }

        if self.inner.config.detect_cycles && self.has_cycles() {
            self.inner.executing.store(false, Ordering::Release);
            return Err(EngineError::CycleDetected(
                "graph contains a dependency cycle".into(),
            ));
        }

        self.inner.cancelled.store(false, Ordering::Release);
        let shared = Arc::new(HandleShared::new());
        {
            let mut exec = self.inner.exec.lock();
            exec.first_error = None;
            exec.retry_counts.clear();
            exec.active = active.map(Arc::new);
            exec.started_at = Some(Instant::now());
            exec.handle = Some(shared.clone());
        }

        debug!("dag execution started");
        DagInner::pump(&self.inner);
        Ok(ExecutionHandle { shared })
    }

    /// Cancel all schedulable nodes; running nodes finish
    pub fn cancel_all(&self) {
        self.inner.cancelled.store(true, Ordering::Release);

        let graph = self.inner.graph.read();
        let nodes: Vec<Arc<DagJob>> = graph.order.iter().filter_map(|id| graph.jobs.get(id)).cloned().collect();
        drop(graph);

        for node in nodes {
            let _ = self
                .inner
                .transition(&node, DagJobState::Pending, DagJobState::Cancelled)
                || self
                    .inner
                    .transition(&node, DagJobState::Ready, DagJobState::Cancelled);
        }
        self.inner.check_completion();
    }

    /// Block until the current (or most recent) execution finishes
    pub fn wait(&self) -> VoidResult {
        let handle = self.inner.exec.lock().handle.clone();
        match handle {
            Some(shared) => ExecutionHandle { shared }.wait(),
            None => Ok(()),
        }
    }

    /// Clear the graph for reuse; refused while executing
    pub fn reset(&self) -> VoidResult {
        if self.inner.executing.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyRunning(
                "cannot reset while executing".into(),
            ));
        }
        let mut graph = self.inner.graph.write();
        graph.jobs.clear();
        graph.dependencies.clear();
        graph.dependents.clear();
        graph.order.clear();
        drop(graph);

        let mut exec = self.inner.exec.lock();
        exec.retry_counts.clear();
        exec.first_error = None;
        exec.active = None;
        exec.started_at = None;
        exec.last_wall_time = Duration::ZERO;
        exec.handle = None;
        Ok(())
    }

    /// Whether an execution is in progress
    pub fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::Acquire)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot of one node
    pub fn get_job_info(&self, id: DagJobId) -> Option<DagJobInfo> {
        let graph = self.inner.graph.read();
        graph.jobs.get(&id).map(|node| build_info(&graph, node))
    }

    /// Snapshots of all nodes in insertion order
    pub fn get_all_jobs(&self) -> Vec<DagJobInfo> {
        let graph = self.inner.graph.read();
        graph
            .order
            .iter()
            .filter_map(|id| graph.jobs.get(id))
            .map(|node| build_info(&graph, node))
            .collect()
    }

    /// Snapshots of nodes currently in `state`
    pub fn get_jobs_in_state(&self, state: DagJobState) -> Vec<DagJobInfo> {
        self.get_all_jobs()
            .into_iter()
            .filter(|info| info.state == state)
            .collect()
    }

    /// Ids of nodes whose dependencies are satisfied and are not yet running
    pub fn get_ready_jobs(&self) -> Vec<DagJobId> {
        let graph = self.inner.graph.read();
        graph
            .order
            .iter()
            .copied()
            .filter(|&id| {
                let state = graph.jobs.get(&id).map(|n| n.state());
                matches!(state, Some(DagJobState::Ready))
                    || (matches!(state, Some(DagJobState::Pending)) && graph.deps_satisfied(id))
            })
            .collect()
    }

    /// Whether the graph currently contains a cycle
    pub fn has_cycles(&self) -> bool {
        self.inner.graph.read().topological_order().is_none()
    }

    /// A topological execution order
    pub fn get_execution_order(&self) -> EngineResult<Vec<DagJobId>> {
        self.inner
            .graph
            .read()
            .topological_order()
            .ok_or_else(|| {
                EngineError::CycleDetected("graph contains a dependency cycle".into())
            })
    }

    /// Typed copy of a completed node's result
    ///
    /// Fails loudly for unknown nodes, non-completed nodes, and type
    /// mismatches.
    pub fn get_result<T: Clone + 'static>(&self, id: DagJobId) -> EngineResult<T> {
        let graph = self.inner.graph.read();
        let node = graph.jobs.get(&id).ok_or(EngineError::UnknownDagJob(id))?;
        if node.state() != DagJobState::Completed {
            return Err(EngineError::JobInvalid(format!(
                "dag job {id} is {}, not completed",
                node.state().as_str()
            )));
        }
        node.result_as::<T>()
    }

    /// Execution statistics snapshot
    pub fn stats(&self) -> DagStats {
        let graph = self.inner.graph.read();
        let mut stats = DagStats {
            total_jobs: graph.order.len(),
            ..Default::default()
        };

        let mut total_node_time = Duration::ZERO;
        for id in &graph.order {
            let Some(node) = graph.jobs.get(id) else {
                continue;
            };
            match node.state() {
                DagJobState::Pending => stats.pending_jobs += 1,
                DagJobState::Ready => stats.ready_jobs += 1,
                DagJobState::Running => stats.running_jobs += 1,
                DagJobState::Completed => stats.completed_jobs += 1,
                DagJobState::Failed => stats.failed_jobs += 1,
                DagJobState::Cancelled => stats.cancelled_jobs += 1,
                DagJobState::Skipped => stats.skipped_jobs += 1,
            }
            total_node_time += node.execution_time();
        }

        // Critical path over the completed portion of the graph.
        if let Some(order) = graph.topological_order() {
            let mut path_time: HashMap<DagJobId, Duration> = HashMap::new();
            for id in order {
                let Some(node) = graph.jobs.get(&id) else {
                    continue;
                };
                if node.state() != DagJobState::Completed {
                    continue;
                }
                let upstream = graph
                    .dependencies
                    .get(&id)
                    .map(|deps| {
                        deps.iter()
                            .filter_map(|dep| path_time.get(dep).copied())
                            .max()
                            .unwrap_or(Duration::ZERO)
                    })
                    .unwrap_or(Duration::ZERO);
                let total = upstream + node.execution_time();
                stats.critical_path_time = stats.critical_path_time.max(total);
                path_time.insert(id, total);
            }
        }
        drop(graph);

        let exec = self.inner.exec.lock();
        let wall = if self.inner.executing.load(Ordering::Acquire) {
            exec.started_at.map(|t| t.elapsed()).unwrap_or_default()
        } else {
            exec.last_wall_time
        };
        stats.total_execution_time = wall;
        if !wall.is_zero() {
            let workers = self.inner.pool.worker_count().max(1) as f64;
            stats.parallelism_efficiency =
                (total_node_time.as_secs_f64() / wall.as_secs_f64()).clamp(0.0, workers);
        }
        stats
    }

    /// The underlying configuration
    pub fn config(&self) -> &DagConfig {
        &self.inner.config
    }

    pub(crate) fn graph(&self) -> &RwLock<Graph> {
        &self.inner.graph
    }
}

fn build_info(graph: &Graph, node: &Arc<DagJob>) -> DagJobInfo {
    let id = node.dag_id();
    DagJobInfo {
        id,
        name: node.name().to_string(),
        state: node.state(),
        dependencies: graph.dependencies.get(&id).cloned().unwrap_or_default(),
        dependents: graph.dependents.get(&id).cloned().unwrap_or_default(),
        error_message: node.error_message(),
        has_result: node.has_result(),
        wait_time: node.wait_time(),
        execution_time: node.execution_time(),
    }
}

impl DagInner {
    fn transition(
        &self,
        node: &Arc<DagJob>,
        from: DagJobState,
        to: DagJobState,
    ) -> bool {
        if !node.try_transition(from, to) {
            return false;
        }
        if let Some(callback) = self.config.state_callback.as_ref() {
            callback(node.dag_id(), from, to);
        }
        let sink = self.sink.read().clone();
        events::emit(
            &sink,
            EngineEvent::DagJobStateChanged {
                dag_id: node.dag_id(),
                old: from.as_str(),
                new: to.as_str(),
            },
        );
        true
    }

    fn is_active(active: &Option<Arc<HashSet<DagJobId>>>, id: DagJobId) -> bool {
        active.as_ref().map(|set| set.contains(&id)).unwrap_or(true)
    }

    /// Promote satisfiable pending nodes and dispatch ready ones
    fn pump(inner: &Arc<DagInner>) {
        if !inner.executing.load(Ordering::Acquire) {
            return;
        }

        if !inner.cancelled.load(Ordering::Acquire) {
            let active = inner.exec.lock().active.clone();
            let graph = inner.graph.read();
            let mut to_dispatch = Vec::new();
            for &id in &graph.order {
                if !Self::is_active(&active, id) {
                    continue;
                }
                let Some(node) = graph.jobs.get(&id) else {
                    continue;
                };
                if node.state() == DagJobState::Pending && graph.deps_satisfied(id) {
                    inner.transition(node, DagJobState::Pending, DagJobState::Ready);
                }
                if node.state() == DagJobState::Ready {
                    to_dispatch.push(id);
                }
            }
            drop(graph);

            if inner.config.execute_in_parallel {
                for id in to_dispatch {
                    Self::dispatch(inner, id);
                }
            } else if inner.in_flight.load(Ordering::Acquire) == 0 {
                if let Some(&id) = to_dispatch.first() {
                    Self::dispatch(inner, id);
                }
            }
        }

        inner.check_completion();
    }

    /// Move a ready node onto the pool
    fn dispatch(inner: &Arc<DagInner>, id: DagJobId) {
        let node = inner.graph.read().jobs.get(&id).cloned();
        let Some(node) = node else {
            return;
        };
        if !inner.transition(&node, DagJobState::Ready, DagJobState::Running) {
            return;
        }

        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let captured = inner.clone();
        let wrapper = Job::new(
            format!("dag-{}", node.name()),
            Box::new(move || {
                DagInner::run_node(&captured, id);
                Ok(())
            }),
        );
        if let Err(err) = inner.pool.submit(wrapper) {
            warn!(dag_id = id, error = %err, "dag job submission failed");
            Self::handle_failure(inner, &node, err);
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            inner.check_completion();
        }
    }

    fn run_node(inner: &Arc<DagInner>, id: DagJobId) {
        let node = inner.graph.read().jobs.get(&id).cloned();
        if let Some(node) = node {
            if inner.cancelled.load(Ordering::Acquire) {
                inner.transition(&node, DagJobState::Running, DagJobState::Cancelled);
            } else {
                node.record_start();
                match node.run_work() {
                    Ok(()) => inner.complete_node(&node),
                    Err(err) => Self::handle_failure(inner, &node, err),
                }
            }
        }
        inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        Self::pump(inner);
    }

    fn complete_node(&self, node: &Arc<DagJob>) {
        node.record_end();
        if self.transition(node, DagJobState::Running, DagJobState::Completed) {
            if let Some(callback) = self.config.completion_callback.as_ref() {
                callback(node.dag_id());
            }
        }
    }

    fn handle_failure(inner: &Arc<DagInner>, node: &Arc<DagJob>, err: EngineError) {
        node.record_end();
        let id = node.dag_id();
        debug!(dag_id = id, error = %err, policy = inner.config.failure_policy.as_str(), "dag job failed");

        match inner.config.failure_policy {
            DagFailurePolicy::FailFast => {
                inner.mark_failed(node, &err);
                inner.shed_descendants(id, DagJobState::Cancelled);
            }
            DagFailurePolicy::ContinueOthers => {
                inner.mark_failed(node, &err);
                inner.shed_descendants(id, DagJobState::Skipped);
            }
            DagFailurePolicy::Retry => {
                let granted = {
                    let mut exec = inner.exec.lock();
                    let count = exec.retry_counts.entry(id).or_insert(0);
                    if *count < inner.config.max_retries {
                        *count += 1;
                        true
                    } else {
                        false
                    }
                };
                if granted && inner.transition(node, DagJobState::Running, DagJobState::Ready) {
                    debug!(dag_id = id, "retrying dag job");
                    std::thread::sleep(inner.config.retry_delay);
                    Self::dispatch(inner, id);
                    return;
                }
                inner.fallback_or_skip(node, err);
            }
            DagFailurePolicy::Fallback => {
                inner.fallback_or_skip(node, err);
            }
        }
    }

    /// Try the node's fallback; on success the node completes, otherwise it
    /// fails and its descendants are skipped
    fn fallback_or_skip(&self, node: &Arc<DagJob>, err: EngineError) {
        if let Some(fallback_result) = node.run_fallback() {
            match fallback_result {
                Ok(()) => {
                    debug!(dag_id = node.dag_id(), "fallback succeeded");
                    self.complete_node(node);
                    return;
                }
                Err(fallback_err) => {
                    debug!(dag_id = node.dag_id(), error = %fallback_err, "fallback failed");
                }
            }
        }
        self.mark_failed(node, &err);
        self.shed_descendants(node.dag_id(), DagJobState::Skipped);
    }

    fn mark_failed(&self, node: &Arc<DagJob>, err: &EngineError) {
        node.set_error_message(err.to_string());
        self.transition(node, DagJobState::Running, DagJobState::Failed);
        if let Some(callback) = self.config.error_callback.as_ref() {
            callback(node.dag_id(), err);
        }
        let mut exec = self.exec.lock();
        if exec.first_error.is_none() {
            exec.first_error = Some(err.clone());
        }
    }

    /// Transitively move schedulable descendants of `root` to `terminal`
    fn shed_descendants(&self, root: DagJobId, terminal: DagJobState) {
        let graph = self.graph.read();
        let mut queue: VecDeque<DagJobId> = graph
            .dependents
            .get(&root)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default();
        let mut seen = HashSet::new();
        let mut shed = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = graph.jobs.get(&id) {
                shed.push(node.clone());
            }
            if let Some(dependents) = graph.dependents.get(&id) {
                queue.extend(dependents.iter().copied());
            }
        }
        drop(graph);

        for node in shed {
            let _ = self.transition(&node, DagJobState::Pending, terminal)
                || self.transition(&node, DagJobState::Ready, terminal);
        }
    }

    fn check_completion(&self) {
        if !self.executing.load(Ordering::Acquire) {
            return;
        }
        if self.in_flight.load(Ordering::Acquire) > 0 {
            return;
        }

        let active = self.exec.lock().active.clone();
        let graph = self.graph.read();
        let mut has_dispatchable = false;
        let mut has_pending = false;
        for &id in &graph.order {
            if !Self::is_active(&active, id) {
                continue;
            }
            match graph.jobs.get(&id).map(|node| node.state()) {
                Some(DagJobState::Ready) | Some(DagJobState::Running) => {
                    has_dispatchable = true;
                }
                Some(DagJobState::Pending) => has_pending = true,
                _ => {}
            }
        }
        drop(graph);

        if has_dispatchable {
            return;
        }
        if has_pending {
            // Nothing runs, nothing is queued, yet nodes wait: their
            // dependencies can never be satisfied.
            let mut exec = self.exec.lock();
            if exec.first_error.is_none() {
                exec.first_error = Some(EngineError::DeadlockDetected(
                    "pending dag jobs with unsatisfiable dependencies".into(),
                ));
            }
        }
        self.finalize();
    }

    fn finalize(&self) {
        if self
            .executing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let (result, handle) = {
            let mut exec = self.exec.lock();
            exec.last_wall_time = exec
                .started_at
                .map(|started| started.elapsed())
                .unwrap_or_default();
            let result = match exec.first_error.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            (result, exec.handle.clone())
        };

        debug!(ok = result.is_ok(), "dag execution finished");
        if let Some(handle) = handle {
            handle.set(result);
        }
    }
}

impl std::fmt::Debug for DagScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.inner.graph.read();
        f.debug_struct("DagScheduler")
            .field("jobs", &graph.order.len())
            .field("executing", &self.is_executing())
            .finish()
    }
}
