use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::error::Result;
use crate::model::{AnchorAction, AnchorStatus, DetectedBy};
use crate::verify::AnchorVerifier;

/// Inputs below this stay on the sequential path unless forced.
pub const SWARM_THRESHOLD: usize = 20;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Clone)]
pub struct SwarmOptions {
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub force_swarm: bool,
    pub detected_by: DetectedBy,
    pub cancel: Option<CancelToken>,
}

impl Default for SwarmOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            force_swarm: false,
            detected_by: DetectedBy::Periodic,
            cancel: None,
        }
    }
}

/// Cooperative cancellation: queued batches are dropped at the next poll;
/// in-flight batches complete.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub unchanged: usize,
    pub self_healed: usize,
    pub drifted: usize,
    pub invalidated: usize,
}

impl ActionCounts {
    fn bump(&mut self, action: AnchorAction) {
        match action {
            AnchorAction::Unchanged => self.unchanged += 1,
            AnchorAction::SelfHealed => self.self_healed += 1,
            AnchorAction::Drifted => self.drifted += 1,
            AnchorAction::Invalidated => self.invalidated += 1,
        }
    }

    fn merge(&mut self, other: &ActionCounts) {
        self.unchanged += other.unchanged;
        self.self_healed += other.self_healed;
        self.drifted += other.drifted;
        self.invalidated += other.invalidated;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub agent: usize,
    pub batches: usize,
    pub anchors: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwarmReport {
    pub total: usize,
    pub agents_used: usize,
    pub actions: ActionCounts,
    pub errors: usize,
    /// Anchors verified by multiple agents whose non-error votes tied.
    pub needs_review: usize,
    pub agent_stats: Vec<AgentStats>,
    pub cancelled: bool,
}

/// Per-worker accumulator, merged at join so workers share no mutable state.
#[derive(Default)]
struct AgentAccumulator {
    batches: usize,
    actions: ActionCounts,
    errors: usize,
    votes: Vec<(i64, AnchorStatus)>,
}

/// Among non-error votes, the status with a strict majority; `None` is a tie
/// that needs review.
pub fn calculate_majority_vote(votes: &[AnchorStatus]) -> Option<AnchorStatus> {
    let mut counts: HashMap<AnchorStatus, usize> = HashMap::new();
    for vote in votes {
        *counts.entry(*vote).or_default() += 1;
    }
    let (&winner, &max) = counts.iter().max_by_key(|(_, count)| **count)?;
    let contenders = counts.values().filter(|c| **c == max).count();
    if contenders == 1 && max * 2 > votes.len() {
        Some(winner)
    } else {
        None
    }
}

/// Bounded-concurrency batch verification over a set of anchor ids.
pub fn run_swarm(
    verifier: &AnchorVerifier,
    ids: &[i64],
    options: &SwarmOptions,
) -> Result<SwarmReport> {
    if ids.len() < SWARM_THRESHOLD && !options.force_swarm {
        return run_sequential(verifier, ids, options);
    }

    let batch_size = options.batch_size.max(1);
    let batches: Vec<Vec<i64>> = ids.chunks(batch_size).map(|c| c.to_vec()).collect();
    let batch_count = batches.len();
    let agent_count = batch_count.min(options.max_concurrent.max(1));

    // Fixed-capacity queue: every batch is enqueued up front and workers
    // poll until a poll comes back empty.
    let queue: Mutex<VecDeque<Vec<i64>>> = Mutex::new(batches.into());
    let cancel = options.cancel.clone().unwrap_or_default();

    let mut agent_stats = Vec::with_capacity(agent_count);
    let mut merged_actions = ActionCounts::default();
    let mut merged_errors = 0;
    let mut all_votes: Vec<(i64, AnchorStatus)> = Vec::new();

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(agent_count);
        for agent in 0..agent_count {
            let queue = &queue;
            let cancel = &cancel;
            handles.push(scope.spawn(move || {
                let started = Instant::now();
                let mut acc = AgentAccumulator::default();
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let batch = {
                        let mut q = queue.lock().unwrap_or_else(|p| p.into_inner());
                        q.pop_front()
                    };
                    let Some(batch) = batch else {
                        break;
                    };
                    acc.batches += 1;
                    for id in batch {
                        match verifier.verify(id, options.detected_by) {
                            Ok(result) => {
                                acc.actions.bump(result.action);
                                acc.votes.push((id, result.new_status));
                            }
                            Err(err) => {
                                // Never retried; the anchor keeps its prior
                                // status.
                                tracing::warn!(anchor = id, error = %err, "swarm verification error");
                                acc.errors += 1;
                            }
                        }
                    }
                }
                (agent, started.elapsed().as_millis() as u64, acc)
            }));
        }

        for handle in handles {
            if let Ok((agent, duration_ms, acc)) = handle.join() {
                agent_stats.push(AgentStats {
                    agent,
                    batches: acc.batches,
                    anchors: acc.votes.len() + acc.errors,
                    errors: acc.errors,
                    duration_ms,
                });
                merged_actions.merge(&acc.actions);
                merged_errors += acc.errors;
                all_votes.extend(acc.votes);
            }
        }
    });

    agent_stats.sort_by_key(|s| s.agent);
    let needs_review = count_needs_review(&all_votes);

    Ok(SwarmReport {
        total: ids.len(),
        agents_used: agent_count,
        actions: merged_actions,
        errors: merged_errors,
        needs_review,
        agent_stats,
        cancelled: cancel.is_cancelled(),
    })
}

fn run_sequential(
    verifier: &AnchorVerifier,
    ids: &[i64],
    options: &SwarmOptions,
) -> Result<SwarmReport> {
    let started = Instant::now();
    let cancel = options.cancel.clone().unwrap_or_default();
    let mut acc = AgentAccumulator::default();

    for &id in ids {
        if cancel.is_cancelled() {
            break;
        }
        match verifier.verify(id, options.detected_by) {
            Ok(result) => {
                acc.actions.bump(result.action);
                acc.votes.push((id, result.new_status));
            }
            Err(err) => {
                tracing::warn!(anchor = id, error = %err, "verification error");
                acc.errors += 1;
            }
        }
    }

    let needs_review = count_needs_review(&acc.votes);
    Ok(SwarmReport {
        total: ids.len(),
        agents_used: 1,
        actions: acc.actions,
        errors: acc.errors,
        needs_review,
        agent_stats: vec![AgentStats {
            agent: 0,
            batches: 1,
            anchors: acc.votes.len() + acc.errors,
            errors: acc.errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }],
        cancelled: cancel.is_cancelled(),
    })
}

/// Ids verified more than once whose votes disagree without a strict
/// majority.
fn count_needs_review(votes: &[(i64, AnchorStatus)]) -> usize {
    let mut by_id: HashMap<i64, Vec<AnchorStatus>> = HashMap::new();
    for (id, status) in votes {
        by_id.entry(*id).or_default().push(*status);
    }
    by_id
        .values()
        .filter(|statuses| {
            statuses.len() > 1
                && statuses.iter().any(|s| s != &statuses[0])
                && calculate_majority_vote(statuses).is_none()
        })
        .count()
}

impl AnchorVerifier {
    /// Verify every anchor, optionally skipping pinned ones.
    pub fn verify_all(&self, skip_pinned: bool, options: &SwarmOptions) -> Result<SwarmReport> {
        let ids = self.store().anchor_ids(skip_pinned)?;
        run_swarm(self, &ids, options)
    }

    /// Verify anchors whose file path matches a glob pattern.
    pub fn verify_glob(
        &self,
        pattern: &str,
        skip_pinned: bool,
        options: &SwarmOptions,
    ) -> Result<SwarmReport> {
        let ids = self.store().anchor_ids_matching_glob(pattern, skip_pinned)?;
        run_swarm(self, &ids, options)
    }

    /// Verify anchors bound to exactly these paths; used from git hooks, so
    /// the default attribution is `git_hook`.
    pub fn verify_changed_files(
        &self,
        paths: &[String],
        options: Option<SwarmOptions>,
    ) -> Result<SwarmReport> {
        let options = options.unwrap_or(SwarmOptions {
            detected_by: DetectedBy::GitHook,
            ..Default::default()
        });
        let ids = self.store().anchor_ids_for_paths(paths, false)?;
        run_swarm(self, &ids, &options)
    }
}
