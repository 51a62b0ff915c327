//! Work-stealing scheduler support
//!
//! Idle workers acquire jobs from busy workers' local deques. Each worker
//! owns a Chase-Lev deque (`crossbeam::deque`): the owner pushes and pops at
//! the tail (LIFO, cache-friendly), thieves steal batches from the head
//! (FIFO, older work off the owner's hot path).
//!
//! This module carries everything around the deques themselves: victim
//! selection policies, adaptive batch sizing, steal backoff, statistics,
//! and the topology oracle consumed by the NUMA-aware policies. Topology
//! *discovery* is out of scope; the oracle is an injected capability.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Victim selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VictimSelection {
    /// Uniform random peer
    Random,
    /// Next index mod N, per-thief cursor
    RoundRobin,
    /// Bias toward recently successful victims
    Adaptive,
    /// Same NUMA node first, cross-node only after local attempts fail
    NumaAware,
    /// Same core, then same node, then other nodes
    Hierarchical,
    /// Bias toward victims sharing an L3 group
    LocalityOptimized,
}

/// Backoff strategy applied after failed steal rounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StealBackoffStrategy {
    /// Constant backoff
    Fixed,
    /// Backoff grows linearly with consecutive failures
    Linear,
    /// Backoff doubles with consecutive failures
    Exponential,
    /// Exponential growth with random jitter
    AdaptiveJitter,
}

/// Oracle describing CPU placement of workers
///
/// The scheduler consumes the topology as an opaque capability: it asks
/// which node, core, and L3 group a worker index maps to, and never probes
/// the machine itself.
pub trait TopologyOracle: Send + Sync {
    /// NUMA node hosting the worker
    fn numa_node(&self, worker: usize) -> usize;

    /// Physical core hosting the worker
    fn core(&self, worker: usize) -> usize;

    /// L3 cache group of the worker
    fn l3_group(&self, worker: usize) -> usize;

    /// Number of NUMA nodes
    fn node_count(&self) -> usize;
}

/// Topology for machines without NUMA structure: one node, one L3 group,
/// one worker per core
#[derive(Debug, Default)]
pub struct UniformTopology;

impl TopologyOracle for UniformTopology {
    fn numa_node(&self, _worker: usize) -> usize {
        0
    }

    fn core(&self, worker: usize) -> usize {
        worker
    }

    fn l3_group(&self, _worker: usize) -> usize {
        0
    }

    fn node_count(&self) -> usize {
        1
    }
}

/// Static topology description supplied by the embedder
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    /// Per-worker NUMA node
    pub nodes: Vec<usize>,
    /// Per-worker core
    pub cores: Vec<usize>,
    /// Per-worker L3 group
    pub l3_groups: Vec<usize>,
}

impl TopologyOracle for StaticTopology {
    fn numa_node(&self, worker: usize) -> usize {
        self.nodes.get(worker).copied().unwrap_or(0)
    }

    fn core(&self, worker: usize) -> usize {
        self.cores.get(worker).copied().unwrap_or(worker)
    }

    fn l3_group(&self, worker: usize) -> usize {
        self.l3_groups.get(worker).copied().unwrap_or(0)
    }

    fn node_count(&self) -> usize {
        self.nodes.iter().max().map(|n| n + 1).unwrap_or(1)
    }
}

/// Work-stealing configuration
#[derive(Clone)]
pub struct WorkStealingConfig {
    /// Master switch
    pub enabled: bool,
    /// Victim selection policy
    pub victim_selection: VictimSelection,
    /// Victims tried per steal round
    pub max_steal_attempts: usize,
    /// Smallest batch moved per successful steal
    pub min_steal_batch: usize,
    /// Largest batch moved per successful steal
    pub max_steal_batch: usize,
    /// Shrink the batch when the victim is nearly empty
    pub adaptive_batch_size: bool,
    /// Backoff strategy after a failed round
    pub backoff_strategy: StealBackoffStrategy,
    /// Base backoff duration
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Topology oracle for the placement-aware policies
    pub topology: Arc<dyn TopologyOracle>,
}

impl Default for WorkStealingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            victim_selection: VictimSelection::Random,
            max_steal_attempts: 3,
            min_steal_batch: 1,
            max_steal_batch: 4,
            adaptive_batch_size: true,
            backoff_strategy: StealBackoffStrategy::Exponential,
            initial_backoff: Duration::from_micros(50),
            max_backoff: Duration::from_millis(1),
            topology: Arc::new(UniformTopology),
        }
    }
}

impl WorkStealingConfig {
    /// Stealing enabled with the default knobs
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Larger batches for throughput-bound workloads
    pub fn batch_optimized() -> Self {
        Self {
            enabled: true,
            min_steal_batch: 4,
            max_steal_batch: 16,
            adaptive_batch_size: true,
            ..Default::default()
        }
    }

    /// Node-local stealing against the given topology
    pub fn numa_optimized(topology: Arc<dyn TopologyOracle>) -> Self {
        Self {
            enabled: true,
            victim_selection: VictimSelection::NumaAware,
            topology,
            ..Default::default()
        }
    }

    /// L3-affinity stealing against the given topology
    pub fn locality_optimized(topology: Arc<dyn TopologyOracle>) -> Self {
        Self {
            enabled: true,
            victim_selection: VictimSelection::LocalityOptimized,
            backoff_strategy: StealBackoffStrategy::AdaptiveJitter,
            topology,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for WorkStealingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingConfig")
            .field("enabled", &self.enabled)
            .field("victim_selection", &self.victim_selection)
            .field("max_steal_attempts", &self.max_steal_attempts)
            .field("min_steal_batch", &self.min_steal_batch)
            .field("max_steal_batch", &self.max_steal_batch)
            .field("adaptive_batch_size", &self.adaptive_batch_size)
            .field("backoff_strategy", &self.backoff_strategy)
            .finish()
    }
}

/// Shared work-stealing counters
#[derive(Debug, Default)]
pub struct WorkStealingStats {
    pub(crate) steal_attempts: AtomicU64,
    pub(crate) successful_steals: AtomicU64,
    pub(crate) failed_steals: AtomicU64,
    pub(crate) jobs_stolen: AtomicU64,
    pub(crate) batch_steals: AtomicU64,
}

impl WorkStealingStats {
    pub(crate) fn record_attempt(&self) {
        self.steal_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, jobs: u64) {
        self.successful_steals.fetch_add(1, Ordering::Relaxed);
        self.jobs_stolen.fetch_add(jobs, Ordering::Relaxed);
        if jobs > 1 {
            self.batch_steals.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_failure(&self) {
        self.failed_steals.fetch_add(1, Ordering::Relaxed);
    }

    /// Copyable snapshot
    pub fn snapshot(&self) -> WorkStealingStatsSnapshot {
        WorkStealingStatsSnapshot {
            steal_attempts: self.steal_attempts.load(Ordering::Relaxed),
            successful_steals: self.successful_steals.load(Ordering::Relaxed),
            failed_steals: self.failed_steals.load(Ordering::Relaxed),
            jobs_stolen: self.jobs_stolen.load(Ordering::Relaxed),
            batch_steals: self.batch_steals.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.steal_attempts.store(0, Ordering::Relaxed);
        self.successful_steals.store(0, Ordering::Relaxed);
        self.failed_steals.store(0, Ordering::Relaxed);
        self.jobs_stolen.store(0, Ordering::Relaxed);
        self.batch_steals.store(0, Ordering::Relaxed);
    }
}

/// Copyable snapshot of [`WorkStealingStats`]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkStealingStatsSnapshot {
    /// Individual victim probes
    pub steal_attempts: u64,
    /// Probes that moved at least one job
    pub successful_steals: u64,
    /// Probes that moved nothing
    pub failed_steals: u64,
    /// Total jobs moved by stealing
    pub jobs_stolen: u64,
    /// Successful steals that moved more than one job
    pub batch_steals: u64,
}

impl WorkStealingStatsSnapshot {
    /// Fraction of probes that succeeded
    pub fn steal_success_rate(&self) -> f64 {
        if self.steal_attempts == 0 {
            return 0.0;
        }
        self.successful_steals as f64 / self.steal_attempts as f64
    }

    /// Average jobs moved per successful steal
    pub fn avg_batch_size(&self) -> f64 {
        if self.successful_steals == 0 {
            return 0.0;
        }
        self.jobs_stolen as f64 / self.successful_steals as f64
    }
}

/// Per-thief victim chooser
///
/// Owned by one worker thread; no internal synchronization. The adaptive
/// policy keeps an EWMA score per victim and prefers high scorers; the
/// placement-aware policies consult the topology oracle and fall back to
/// distant victims only after closer candidates are exhausted.
pub struct VictimSelector {
    policy: VictimSelection,
    self_id: usize,
    worker_count: usize,
    cursor: usize,
    scores: Vec<f64>,
    topology: Arc<dyn TopologyOracle>,
}

impl VictimSelector {
    /// Create a selector for worker `self_id` among `worker_count` workers
    pub fn new(
        policy: VictimSelection,
        self_id: usize,
        worker_count: usize,
        topology: Arc<dyn TopologyOracle>,
    ) -> Self {
        Self {
            policy,
            self_id,
            worker_count,
            cursor: self_id,
            scores: vec![0.5; worker_count],
            topology,
        }
    }

    /// Choose up to `attempts` victims for one steal round, self excluded
    pub fn choose(&mut self, attempts: usize) -> Vec<usize> {
        if self.worker_count <= 1 {
            return Vec::new();
        }
        let attempts = attempts.min(self.worker_count - 1);

        match self.policy {
            VictimSelection::Random => self.choose_random(attempts),
            VictimSelection::RoundRobin => self.choose_round_robin(attempts),
            VictimSelection::Adaptive => self.choose_adaptive(attempts),
            VictimSelection::NumaAware => self.choose_ranked(attempts, |this, victim| {
                if this.topology.numa_node(victim) == this.topology.numa_node(this.self_id) {
                    0
                } else {
                    1
                }
            }),
            VictimSelection::Hierarchical => self.choose_ranked(attempts, |this, victim| {
                if this.topology.core(victim) == this.topology.core(this.self_id) {
                    0
                } else if this.topology.numa_node(victim)
                    == this.topology.numa_node(this.self_id)
                {
                    1
                } else {
                    2
                }
            }),
            VictimSelection::LocalityOptimized => self.choose_ranked(attempts, |this, victim| {
                if this.topology.l3_group(victim) == this.topology.l3_group(this.self_id) {
                    0
                } else {
                    1
                }
            }),
        }
    }

    /// Feed back the outcome of a probe (adaptive policy, EWMA 1/4)
    pub fn record_outcome(&mut self, victim: usize, success: bool) {
        if let Some(score) = self.scores.get_mut(victim) {
            let sample = if success { 1.0 } else { 0.0 };
            *score = *score * 0.75 + sample * 0.25;
        }
    }

    fn choose_random(&self, attempts: usize) -> Vec<usize> {
        let mut victims = Vec::with_capacity(attempts);
        let mut guard = 0;
        while victims.len() < attempts && guard < attempts * 8 {
            guard += 1;
            let candidate = fastrand::usize(..self.worker_count);
            if candidate != self.self_id && !victims.contains(&candidate) {
                victims.push(candidate);
            }
        }
        victims
    }

    fn choose_round_robin(&mut self, attempts: usize) -> Vec<usize> {
        let mut victims = Vec::with_capacity(attempts);
        for _ in 0..self.worker_count {
            self.cursor = (self.cursor + 1) % self.worker_count;
            if self.cursor != self.self_id {
                victims.push(self.cursor);
                if victims.len() == attempts {
                    break;
                }
            }
        }
        victims
    }

    fn choose_adaptive(&self, attempts: usize) -> Vec<usize> {
        let mut candidates: Vec<usize> = (0..self.worker_count)
            .filter(|&w| w != self.self_id)
            .collect();
        candidates.sort_by(|&a, &b| {
            self.scores[b]
                .partial_cmp(&self.scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(attempts);
        candidates
    }

    fn choose_ranked<F>(&self, attempts: usize, rank: F) -> Vec<usize>
    where
        F: Fn(&Self, usize) -> usize,
    {
        let mut candidates: Vec<(usize, usize)> = (0..self.worker_count)
            .filter(|&w| w != self.self_id)
            .map(|w| (rank(self, w), w))
            .collect();
        // Distance tier first; random tiebreak within a tier so thieves on
        // the same node do not all converge on one victim.
        fastrand::shuffle(&mut candidates);
        candidates.sort_by_key(|&(tier, _)| tier);
        candidates.truncate(attempts);
        candidates.into_iter().map(|(_, w)| w).collect()
    }
}

/// Per-thief backoff state
pub struct StealBackoff {
    strategy: StealBackoffStrategy,
    initial: Duration,
    max: Duration,
    consecutive_failures: u32,
}

impl StealBackoff {
    /// Create backoff state from the stealing configuration
    pub fn new(config: &WorkStealingConfig) -> Self {
        Self {
            strategy: config.backoff_strategy,
            initial: config.initial_backoff,
            max: config.max_backoff,
            consecutive_failures: 0,
        }
    }

    /// Record a failed round and return the delay to apply before the next
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let n = self.consecutive_failures;
        let delay = match self.strategy {
            StealBackoffStrategy::Fixed => self.initial,
            StealBackoffStrategy::Linear => self.initial.saturating_mul(n),
            StealBackoffStrategy::Exponential => {
                self.initial.saturating_mul(1u32 << (n - 1).min(16))
            }
            StealBackoffStrategy::AdaptiveJitter => {
                let base = self.initial.saturating_mul(1u32 << (n - 1).min(16));
                base.min(self.max).mul_f64(0.5 + fastrand::f64() * 0.5)
            }
        };
        delay.min(self.max)
    }

    /// Record a successful round
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Number of worker-queue depth slots tracked for adaptive batching
#[derive(Debug, Default)]
pub struct DepthBoard {
    depths: Vec<AtomicUsize>,
}

impl DepthBoard {
    /// Board for `workers` workers
    pub fn new(workers: usize) -> Self {
        Self {
            depths: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Owner publishes its approximate local depth
    pub fn publish(&self, worker: usize, depth: usize) {
        if let Some(slot) = self.depths.get(worker) {
            slot.store(depth, Ordering::Relaxed);
        }
    }

    /// Thief reads a victim's approximate depth
    pub fn read(&self, worker: usize) -> usize {
        self.depths
            .get(worker)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Batch size for stealing from a victim with the given approximate depth
///
/// Adaptive batching takes half of what the victim holds, clamped to the
/// configured band; a nearly empty victim yields a single job.
pub fn steal_batch_size(config: &WorkStealingConfig, victim_depth: usize) -> usize {
    if !config.adaptive_batch_size {
        return config.max_steal_batch.max(1);
    }
    if victim_depth <= 1 {
        return 1;
    }
    (victim_depth / 2).clamp(config.min_steal_batch.max(1), config.max_steal_batch.max(1))
}
