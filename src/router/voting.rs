//! Vote coordinator
//!
//! Each mutator runs as a transaction: the dispatcher registers the
//! participating replicas and a threshold, every backend pauses mid-RPC
//! to cast a hash vote per phase, and the coordinator answers with the
//! phase outcome. A phase commits only when some hash reaches the
//! threshold *and* the primary voted for it; everything else aborts.
//! A node that voted a losing hash is told to roll back.

use crate::common::{Error, Metrics, Result, VoteConfig, METRICS};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepared,
    Committed,
}

impl Phase {
    fn index(&self) -> usize {
        match self {
            Phase::Prepared => 0,
            Phase::Committed => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepared => "prepared",
            Phase::Committed => "committed",
        }
    }
}

/// Outcome streamed back to one voting node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The node is in the winning set and proceeds to apply
    Commit,
    /// The node rolls back its pending update
    Abort,
    /// The dispatcher cancelled the transaction
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PhaseResult {
    Committed(String),
    Aborted,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Voter {
    pub storage: String,
    pub is_primary: bool,
}

struct TxInner {
    votes: [HashMap<String, String>; 2],
    registered: HashSet<String>,
    done_at: Option<Instant>,
}

struct TransactionState {
    threshold: usize,
    voters: Vec<Voter>,
    started: Instant,
    results: [watch::Sender<Option<PhaseResult>>; 2],
    inner: Mutex<TxInner>,
}

/// Registry of in-flight vote transactions
pub struct TransactionRegistry {
    config: VoteConfig,
    next_id: AtomicU64,
    transactions: Mutex<HashMap<u64, Arc<TransactionState>>>,
}

impl TransactionRegistry {
    pub fn new(config: VoteConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(0),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a transaction for one mutator. Returns its identity.
    pub fn register(&self, threshold: usize, voters: Vec<Voter>) -> u64 {
        self.sweep();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let state = TransactionState {
            threshold,
            voters,
            started: Instant::now(),
            results: [watch::channel(None).0, watch::channel(None).0],
            inner: Mutex::new(TxInner {
                votes: [HashMap::new(), HashMap::new()],
                registered: HashSet::new(),
                done_at: None,
            }),
        };
        self.transactions.lock().unwrap().insert(id, Arc::new(state));
        id
    }

    fn get(&self, transaction_id: u64) -> Result<Arc<TransactionState>> {
        self.transactions
            .lock()
            .unwrap()
            .get(&transaction_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))
    }

    /// Register a node's intent to vote. Rejected for nodes outside the
    /// transaction's participant set.
    pub fn start(&self, transaction_id: u64, node: &str) -> Result<()> {
        let tx = self.get(transaction_id)?;
        if !tx.voters.iter().any(|v| v.storage == node) {
            return Err(Error::InvalidArgument(format!(
                "node {} is not a participant of transaction {}",
                node, transaction_id
            )));
        }
        tx.inner.lock().unwrap().registered.insert(node.to_string());
        Ok(())
    }

    /// Cast a vote and wait for the phase outcome.
    ///
    /// Votes arriving after the phase deadline are rejected. A vote
    /// arriving after the phase was decided (but in time) observes the
    /// outcome: commit when its hash matches the winning one, abort
    /// otherwise.
    pub async fn vote(
        &self,
        transaction_id: u64,
        node: &str,
        hash: &str,
        phase: Phase,
    ) -> Result<VoteOutcome> {
        let tx = self.get(transaction_id)?;
        if !tx.voters.iter().any(|v| v.storage == node) {
            return Err(Error::InvalidArgument(format!(
                "node {} is not a participant of transaction {}",
                node, transaction_id
            )));
        }

        let deadline = tx.started + self.config.phase_timeout(phase == Phase::Committed);
        let sender = &tx.results[phase.index()];

        {
            let mut inner = tx.inner.lock().unwrap();

            if Instant::now() > deadline {
                if sender.borrow().is_none() {
                    Metrics::incr(&METRICS.votes_aborted);
                    let _ = sender.send(Some(PhaseResult::Aborted));
                }
                return Err(Error::VoteDeadline(transaction_id));
            }

            if let Some(result) = sender.borrow().clone() {
                return Ok(per_node_outcome(&result, hash));
            }

            let votes = &mut inner.votes[phase.index()];
            if votes.contains_key(node) {
                return Err(Error::FailedPrecondition(format!(
                    "node {} already voted the {} phase of transaction {}",
                    node,
                    phase.as_str(),
                    transaction_id
                )));
            }
            votes.insert(node.to_string(), hash.to_string());

            if let Some(result) = decide(tx.threshold, &tx.voters, votes) {
                match &result {
                    PhaseResult::Committed(_) => Metrics::incr(&METRICS.votes_committed),
                    PhaseResult::Aborted => Metrics::incr(&METRICS.votes_aborted),
                    PhaseResult::Stopped => {}
                }
                let _ = sender.send(Some(result));
            }
        }

        let mut rx = sender.subscribe();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return Ok(per_node_outcome(&result, hash));
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let _inner = tx.inner.lock().unwrap();
                    if sender.borrow().is_none() {
                        tracing::warn!(
                            transaction_id,
                            phase = phase.as_str(),
                            "vote deadline expired, aborting phase"
                        );
                        Metrics::incr(&METRICS.votes_aborted);
                        let _ = sender.send(Some(PhaseResult::Aborted));
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Internal("vote channel closed".into()));
                    }
                }
            }
        }
    }

    /// Cancel the transaction; every in-flight and future voter sees
    /// `Stop`.
    pub fn cancel(&self, transaction_id: u64) {
        if let Ok(tx) = self.get(transaction_id) {
            let mut inner = tx.inner.lock().unwrap();
            let mut stopped = false;
            for sender in &tx.results {
                if sender.borrow().is_none() {
                    let _ = sender.send(Some(PhaseResult::Stopped));
                    stopped = true;
                }
            }
            if stopped {
                Metrics::incr(&METRICS.votes_stopped);
            }
            inner.done_at = Some(Instant::now());
        }
    }

    /// Mark a transaction done. It stays visible for a grace period so
    /// straggling voters still observe the outcome, then is collected.
    pub fn finish(&self, transaction_id: u64) {
        if let Ok(tx) = self.get(transaction_id) {
            tx.inner.lock().unwrap().done_at = Some(Instant::now());
        }
    }

    /// Node-agnostic view of a phase outcome, if decided.
    pub fn outcome(&self, transaction_id: u64, phase: Phase) -> Option<VoteOutcome> {
        let tx = self.get(transaction_id).ok()?;
        let result = tx.results[phase.index()].borrow().clone()?;
        Some(match result {
            PhaseResult::Committed(_) => VoteOutcome::Commit,
            PhaseResult::Aborted => VoteOutcome::Abort,
            PhaseResult::Stopped => VoteOutcome::Stop,
        })
    }

    /// A handle a backend uses to vote on behalf of one node.
    pub fn voter_handle(self: &Arc<Self>, transaction_id: u64, node: &str) -> VoterHandle {
        VoterHandle {
            registry: self.clone(),
            transaction_id,
            node: node.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop transactions past their grace period, and abandoned ones
    /// past every phase deadline.
    fn sweep(&self) {
        let grace = std::time::Duration::from_secs(self.config.grace_secs);
        let abandoned_after = self.config.phase_timeout(true) + grace;
        self.transactions.lock().unwrap().retain(|_, tx| {
            let inner = tx.inner.lock().unwrap();
            match inner.done_at {
                Some(done_at) => done_at.elapsed() < grace,
                None => tx.started.elapsed() < abandoned_after,
            }
        });
    }
}

fn decide(
    threshold: usize,
    voters: &[Voter],
    votes: &HashMap<String, String>,
) -> Option<PhaseResult> {
    let mut tally: HashMap<&String, usize> = HashMap::new();
    for hash in votes.values() {
        *tally.entry(hash).or_default() += 1;
    }

    let needs_primary = voters.iter().any(|v| v.is_primary);
    let primary_hash = voters
        .iter()
        .find(|v| v.is_primary)
        .and_then(|p| votes.get(&p.storage));

    for (hash, count) in &tally {
        if *count >= threshold && (!needs_primary || primary_hash == Some(*hash)) {
            return Some(PhaseResult::Committed((*hash).clone()));
        }
    }

    // Every node voted and no winning set exists
    if votes.len() == voters.len() {
        return Some(PhaseResult::Aborted);
    }
    None
}

fn per_node_outcome(result: &PhaseResult, hash: &str) -> VoteOutcome {
    match result {
        PhaseResult::Committed(winning) if winning == hash => VoteOutcome::Commit,
        PhaseResult::Committed(_) | PhaseResult::Aborted => VoteOutcome::Abort,
        PhaseResult::Stopped => VoteOutcome::Stop,
    }
}

/// Lets one backend node vote on one transaction.
#[derive(Clone)]
pub struct VoterHandle {
    registry: Arc<TransactionRegistry>,
    pub transaction_id: u64,
    pub node: String,
}

impl VoterHandle {
    pub fn start(&self) -> Result<()> {
        self.registry.start(self.transaction_id, &self.node)
    }

    pub async fn vote(&self, hash: &str, phase: Phase) -> Result<VoteOutcome> {
        self.registry
            .vote(self.transaction_id, &self.node, hash, phase)
            .await
    }
}

impl std::fmt::Debug for VoterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoterHandle")
            .field("transaction_id", &self.transaction_id)
            .field("node", &self.node)
            .finish()
    }
}
