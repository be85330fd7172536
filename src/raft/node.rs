use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
// Use external log crate, not our own log module
use ::log::{debug, info};

use super::replication::Progress;
use super::storage::HardStateStore;
use super::{
    AppendEntriesArgs, AppendEntriesReply, HardState, Log, LogEntry, NodeRole, NodeState,
    RaftConfig, RaftError, RequestVoteArgs, RequestVoteReply,
};

/// The consensus state of a single node.
///
/// `RaftNode` holds no timers, tasks or sockets: it is driven by [`super::Raft`],
/// which owns the clock and the transport and calls in here under one lock.
/// Every handler persists whatever it changed before returning, so a reply built
/// from its result never runs ahead of the disk.
pub struct RaftNode {
    // Node identity
    id: String,
    config: RaftConfig,
    peers: Vec<String>,

    // Persistent state
    hard_state: HardState,
    hard_state_store: HardStateStore,
    pub(super) log: Log,

    // Volatile state
    pub(super) role: NodeRole,
    pub(super) leader_id: Option<String>,
    pub(super) commit_index: u64,
    last_applied: u64,
    election_deadline: Instant,

    // Election state
    votes_received: HashSet<String>,

    // Leader state, rebuilt on every election win
    pub(super) progress: HashMap<String, Progress>,
}

impl RaftNode {
    /// Loads the node's persistent state from `config.data_dir`.
    pub fn open(config: RaftConfig) -> Result<Self, RaftError> {
        config.validate()?;

        let raft_dir = config.raft_dir();
        let hard_state_store = HardStateStore::open(&raft_dir)?;
        let hard_state = hard_state_store.load()?;
        let log = Log::open(&raft_dir)?;

        let mut peers: Vec<String> = config.peers.keys().cloned().collect();
        peers.sort();

        info!(
            "Node {} restored term {} (voted for {:?}) with {} log entries",
            config.node_id,
            hard_state.current_term,
            hard_state.voted_for,
            log.last_index()
        );

        let mut node = Self {
            id: config.node_id.clone(),
            config,
            peers,
            hard_state,
            hard_state_store,
            log,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            election_deadline: Instant::now(),
            votes_received: HashSet::new(),
            progress: HashMap::new(),
        };
        node.reset_election_timer();

        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, NodeRole::Leader)
    }

    pub fn current_term(&self) -> u64 {
        self.hard_state.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.hard_state.voted_for.as_deref()
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    pub fn status(&self) -> NodeState {
        NodeState {
            id: self.id.clone(),
            current_term: self.hard_state.current_term,
            voted_for: self.hard_state.voted_for.clone(),
            role: self.role,
            leader_id: self.leader_id.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    /// Votes (or acknowledgements) needed for a strict majority, counting this node.
    pub(super) fn quorum(&self) -> usize {
        self.config.cluster_size() / 2 + 1
    }

    pub fn get_election_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        let timeout_ms =
            rng.random_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.get_election_timeout();
    }

    fn persist_hard_state(&mut self, state: HardState) -> Result<(), RaftError> {
        self.hard_state_store.save(&state)?;
        self.hard_state = state;
        Ok(())
    }

    /// Adopts `term` if it is newer than ours, clearing the vote and reverting to
    /// follower. Returns whether the term changed.
    pub(super) fn observe_term(&mut self, term: u64) -> Result<bool, RaftError> {
        if term <= self.hard_state.current_term {
            return Ok(false);
        }

        info!(
            "Node {} observed term {} (was {}), stepping down",
            self.id, term, self.hard_state.current_term
        );
        self.persist_hard_state(HardState {
            current_term: term,
            voted_for: None,
        })?;
        self.become_follower(None);

        Ok(true)
    }

    pub(super) fn become_follower(&mut self, leader_id: Option<String>) {
        if self.role != NodeRole::Follower {
            info!(
                "Node {} reverting from {:?} to follower in term {}",
                self.id, self.role, self.hard_state.current_term
            );
        }
        if leader_id.is_some() && self.leader_id != leader_id {
            info!(
                "Node {} following leader {:?} in term {}",
                self.id, leader_id, self.hard_state.current_term
            );
        }

        self.role = NodeRole::Follower;
        self.leader_id = leader_id;
        self.votes_received.clear();
        self.progress.clear();
        self.reset_election_timer();
    }

    /// Gives up any role held when the node is shut down. Term and vote stay as
    /// they are on disk.
    pub fn stop(&mut self) {
        self.become_follower(None);
    }

    pub fn start_election(&mut self) -> Result<RequestVoteArgs, RaftError> {
        // Increment current term and vote for self, durably, before asking anyone
        self.persist_hard_state(HardState {
            current_term: self.hard_state.current_term + 1,
            voted_for: Some(self.id.clone()),
        })?;

        self.role = NodeRole::Candidate;
        self.leader_id = None;
        self.progress.clear();
        self.reset_election_timer();

        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());

        info!(
            "Node {} starting election for term {}",
            self.id, self.hard_state.current_term
        );

        let request = RequestVoteArgs {
            term: self.hard_state.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        // A single-node cluster wins on its own vote
        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
        }

        Ok(request)
    }

    fn log_is_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.log.last_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.log.last_index())
    }

    pub fn handle_request_vote(
        &mut self,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError> {
        self.observe_term(args.term)?;

        let mut vote_granted = false;
        let current_term = self.hard_state.current_term;
        let free_to_vote = match &self.hard_state.voted_for {
            None => true,
            Some(candidate) => candidate == &args.candidate_id,
        };

        if args.term == current_term
            && free_to_vote
            && self.log_is_up_to_date(args.last_log_index, args.last_log_term)
        {
            if self.hard_state.voted_for.is_none() {
                self.persist_hard_state(HardState {
                    current_term,
                    voted_for: Some(args.candidate_id.clone()),
                })?;
            }
            vote_granted = true;
            self.reset_election_timer();
        }

        debug!(
            "Node {} {} vote to {} for term {}",
            self.id,
            if vote_granted { "granted" } else { "refused" },
            args.candidate_id,
            args.term
        );

        Ok(RequestVoteReply {
            term: current_term,
            vote_granted,
        })
    }

    /// Counts a vote reply for the election started with `args`.
    ///
    /// Returns `true` if this reply completed a majority and the node is now leader.
    pub fn handle_vote_reply(
        &mut self,
        peer_id: &str,
        args: &RequestVoteArgs,
        reply: RequestVoteReply,
    ) -> Result<bool, RaftError> {
        if self.observe_term(reply.term)? {
            return Ok(false);
        }

        // Only count votes for the election we are still running
        if self.role != NodeRole::Candidate || self.hard_state.current_term != args.term {
            debug!(
                "Node {} ignoring stale vote reply from {} for term {}",
                self.id, peer_id, args.term
            );
            return Ok(false);
        }

        if reply.vote_granted {
            self.votes_received.insert(peer_id.to_string());
            if self.votes_received.len() >= self.quorum() {
                self.become_leader();
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn become_leader(&mut self) {
        info!(
            "Node {} becoming leader for term {} with {} votes",
            self.id,
            self.hard_state.current_term,
            self.votes_received.len()
        );

        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();

        let next_index = self.log.last_index() + 1;
        self.progress = self
            .peers
            .iter()
            .map(|peer| (peer.clone(), Progress::new(next_index)))
            .collect();
    }

    pub fn handle_append_entries(
        &mut self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        // Reply false if term < currentTerm
        if args.term < self.hard_state.current_term {
            debug!(
                "Node {} rejecting AppendEntries from {} with stale term {}",
                self.id, args.leader_id, args.term
            );
            return Ok(self.append_reply(false, 0, 0));
        }

        self.observe_term(args.term)?;
        // The sender is the leader for this term; this also resets the election timer
        self.become_follower(Some(args.leader_id.clone()));

        // Log matching: we must hold prev_log_index with prev_log_term
        if args.prev_log_index > self.log.last_index() {
            return Ok(self.append_reply(false, self.log.last_index() + 1, 0));
        }
        match self.log.term_at(args.prev_log_index) {
            Some(term) if term == args.prev_log_term => {}
            Some(term) => {
                let first = self.log.first_index_of_term(args.prev_log_index)?;
                return Ok(self.append_reply(false, first, term));
            }
            None => {
                return Ok(self.append_reply(false, self.log.start_index(), 0));
            }
        }

        let covered_index = args.last_index();

        // Skip entries we already hold, cut our log at the first conflict and
        // append whatever remains.
        let mut pending: Vec<LogEntry> = Vec::new();
        for entry in args.entries {
            if !pending.is_empty() {
                pending.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(term) => {
                    debug!(
                        "Node {} found conflict at index {} (term {} vs {})",
                        self.id, entry.index, term, entry.term
                    );
                    self.truncate_log(entry.index.saturating_sub(1))?;
                    pending.push(entry);
                }
                None => pending.push(entry),
            }
        }
        if !pending.is_empty() {
            debug!(
                "Node {} appending {} entries from {}",
                self.id,
                pending.len(),
                args.leader_id
            );
            self.log.append(pending)?;
        }

        if args.leader_commit > self.commit_index {
            let new_commit = args.leader_commit.min(covered_index);
            if new_commit > self.commit_index {
                debug!("Node {} commit index {} -> {}", self.id, self.commit_index, new_commit);
                self.commit_index = new_commit;
            }
        }

        Ok(self.append_reply(true, 0, 0))
    }

    fn append_reply(&self, success: bool, conflict_index: u64, conflict_term: u64) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.hard_state.current_term,
            success,
            conflict_index,
            conflict_term,
        }
    }

    fn truncate_log(&mut self, index: u64) -> Result<(), RaftError> {
        if index < self.commit_index {
            return Err(RaftError::CommittedTruncation {
                index: index + 1,
                commit_index: self.commit_index,
            });
        }
        self.log.truncate(index)
    }

    /// Committed entries not yet handed to the state machine.
    pub fn entries_to_apply(&self) -> Result<Vec<LogEntry>, RaftError> {
        if self.commit_index <= self.last_applied {
            return Ok(Vec::new());
        }
        self.log.get_range(self.last_applied + 1, self.commit_index)
    }

    pub fn mark_applied(&mut self, index: u64) {
        debug_assert_eq!(index, self.last_applied + 1, "entries must apply in order");
        if index > self.last_applied && index <= self.commit_index {
            self.last_applied = index;
        }
    }
}
