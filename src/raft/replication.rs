use ::log::{debug, warn};

use super::node::RaftNode;
use super::{AppendEntriesArgs, AppendEntriesReply, LogEntry, NodeRole, RaftError};

/// Leader's view of one follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Next log index to send to the follower.
    pub next_index: u64,
    /// Highest index known to be replicated on the follower.
    pub match_index: u64,
    /// An AppendEntries to this follower has not been answered yet.
    pub in_flight: bool,
}

impl Progress {
    pub fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            in_flight: false,
        }
    }
}

/// What the leader learned from one AppendEntries reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// The follower took the entries. `follow_up` carries the next batch if the
    /// follower is still behind and should be sent to right away.
    Accepted {
        commit_advanced: bool,
        follow_up: Option<AppendEntriesArgs>,
    },
    /// Log mismatch; `next_index` moved back and the next heartbeat retries.
    Rejected,
    /// The reply carried a newer term and this node is no longer leader.
    SteppedDown,
}

impl RaftNode {
    /// Appends a client command to the leader's log.
    ///
    /// Returns the index and term the entry was written at. Fails with
    /// [`RaftError::NotLeader`] carrying the last known leader otherwise.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<(u64, u64), RaftError> {
        if self.role != NodeRole::Leader {
            return Err(RaftError::NotLeader(self.leader_id.clone()));
        }

        let index = self.log.last_index() + 1;
        let term = self.current_term();
        self.log.append(vec![LogEntry::new(index, term, command)])?;

        debug!("Leader {} appended entry {} in term {}", self.id(), index, term);

        // Nothing else to wait for in a single-node cluster
        self.advance_commit_index();

        Ok((index, term))
    }

    /// Builds an AppendEntries request for every follower that has no request
    /// outstanding, and marks those followers as in flight.
    pub fn prepare_append_entries(&mut self) -> Vec<(String, AppendEntriesArgs)> {
        if self.role != NodeRole::Leader {
            return Vec::new();
        }

        let mut requests = Vec::new();
        for peer in self.peers().to_vec() {
            let idle = self.progress.get(&peer).map(|p| !p.in_flight).unwrap_or(false);
            if !idle {
                continue;
            }
            match self.append_entries_for(&peer) {
                Ok(args) => {
                    if let Some(progress) = self.progress.get_mut(&peer) {
                        progress.in_flight = true;
                    }
                    requests.push((peer, args));
                }
                Err(e) => warn!("Cannot build AppendEntries for {}: {}", peer, e),
            }
        }
        requests
    }

    fn append_entries_for(&self, peer: &str) -> Result<AppendEntriesArgs, RaftError> {
        let next_index = self
            .progress
            .get(peer)
            .map(|p| p.next_index)
            .ok_or_else(|| RaftError::InvalidConfig(format!("unknown peer {peer}")))?;

        let prev_log_index = next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index).ok_or(RaftError::OutOfRange {
            index: prev_log_index,
            first: self.log.start_index(),
            last: self.log.last_index(),
        })?;

        Ok(AppendEntriesArgs {
            term: self.current_term(),
            leader_id: self.id().to_string(),
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next_index)?,
            leader_commit: self.commit_index,
        })
    }

    /// Clears the in-flight mark after a request sent in `term` failed to get a reply.
    pub fn release_in_flight(&mut self, peer: &str, term: u64) {
        if self.role != NodeRole::Leader || self.current_term() != term {
            return;
        }
        if let Some(progress) = self.progress.get_mut(peer) {
            progress.in_flight = false;
        }
    }

    /// Processes a follower's reply to `args`.
    ///
    /// Replies to requests from an earlier term, or arriving after this node
    /// stopped leading, fail with [`RaftError::StaleTerm`] and change nothing.
    pub fn handle_append_reply(
        &mut self,
        peer: &str,
        args: &AppendEntriesArgs,
        reply: AppendEntriesReply,
    ) -> Result<ReplicationOutcome, RaftError> {
        if self.observe_term(reply.term)? {
            return Ok(ReplicationOutcome::SteppedDown);
        }
        if self.role != NodeRole::Leader || self.current_term() != args.term {
            return Err(RaftError::StaleTerm(args.term));
        }

        let last_index = self.log.last_index();
        let progress = self
            .progress
            .get_mut(peer)
            .ok_or_else(|| RaftError::InvalidConfig(format!("unknown peer {peer}")))?;
        progress.in_flight = false;

        if reply.success {
            let matched = args.last_index();
            progress.match_index = progress.match_index.max(matched);
            progress.next_index = progress.next_index.max(matched + 1);
            let behind = progress.next_index <= last_index;

            let commit_advanced = self.advance_commit_index();

            let follow_up = if behind {
                let next = self.append_entries_for(peer)?;
                if let Some(progress) = self.progress.get_mut(peer) {
                    progress.in_flight = true;
                }
                Some(next)
            } else {
                None
            };

            return Ok(ReplicationOutcome::Accepted {
                commit_advanced,
                follow_up,
            });
        }

        // A rejection of an older probe says nothing about where we are now
        if args.prev_log_index + 1 != progress.next_index {
            return Ok(ReplicationOutcome::Rejected);
        }
        let match_index = progress.match_index;

        let hinted = if reply.conflict_term > 0 {
            match self.log.last_index_of_term(reply.conflict_term) {
                Some(index) => index + 1,
                None => reply.conflict_index,
            }
        } else if reply.conflict_index > 0 {
            reply.conflict_index
        } else {
            args.prev_log_index
        };
        // Always move back by at least one, never past what the follower has confirmed
        let next_index = hinted.min(args.prev_log_index).max(match_index + 1).max(1);

        debug!(
            "Follower {} rejected prev index {}, retrying from {}",
            peer, args.prev_log_index, next_index
        );
        if let Some(progress) = self.progress.get_mut(peer) {
            progress.next_index = next_index;
        }

        Ok(ReplicationOutcome::Rejected)
    }

    /// Moves the commit index to the highest entry of the current term stored on
    /// a majority. Returns whether it moved.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.role != NodeRole::Leader {
            return false;
        }

        let mut match_indices: Vec<u64> = self.progress.values().map(|p| p.match_index).collect();
        match_indices.push(self.log.last_index());
        match_indices.sort_unstable_by(|a, b| b.cmp(a));

        let majority_index = match_indices[self.quorum() - 1];
        if majority_index > self.commit_index
            && self.log.term_at(majority_index) == Some(self.current_term())
        {
            debug!(
                "Leader {} commit index {} -> {}",
                self.id(),
                self.commit_index,
                majority_index
            );
            self.commit_index = majority_index;
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{RaftConfig, RequestVoteReply};
    use tempfile::{tempdir, TempDir};

    fn config(id: &str, dir: &TempDir, peers: &[&str]) -> RaftConfig {
        let mut cfg = RaftConfig::new(id, dir.path());
        for peer in peers {
            cfg.add_peer(peer, "127.0.0.1:0");
        }
        cfg
    }

    fn elected_leader(dir: &TempDir) -> RaftNode {
        let mut node = RaftNode::open(config("n1", dir, &["n2", "n3"])).expect("open");
        let request = node.start_election().expect("election");
        let granted = RequestVoteReply { term: request.term, vote_granted: true };
        assert!(node.handle_vote_reply("n2", &request, granted).expect("vote"));
        node
    }

    fn ok_reply(term: u64) -> AppendEntriesReply {
        AppendEntriesReply { term, success: true, conflict_index: 0, conflict_term: 0 }
    }

    fn reject(term: u64, conflict_index: u64, conflict_term: u64) -> AppendEntriesReply {
        AppendEntriesReply { term, success: false, conflict_index, conflict_term }
    }

    #[test]
    fn propose_fails_on_follower_with_leader_hint() {
        let tmp = tempdir().expect("tempdir");
        let mut node = RaftNode::open(config("n2", &tmp, &["n1", "n3"])).expect("open");
        node.leader_id = Some("n1".to_string());

        let err = node.propose(b"x".to_vec()).unwrap_err();
        assert!(matches!(err, RaftError::NotLeader(Some(ref id)) if id == "n1"));
    }

    #[test]
    fn single_node_commits_on_propose() {
        let tmp = tempdir().expect("tempdir");
        let mut node = RaftNode::open(RaftConfig::new("solo", tmp.path())).expect("open");
        node.start_election().expect("election");

        assert_eq!(node.propose(b"a".to_vec()).expect("propose"), (1, 1));
        assert_eq!(node.propose(b"b".to_vec()).expect("propose"), (2, 1));
        assert_eq!(node.commit_index(), 2);
    }

    #[test]
    fn commit_needs_a_majority() {
        let tmp = tempdir().expect("tempdir");
        let mut leader = elected_leader(&tmp);
        let term = leader.current_term();
        leader.propose(b"set x 1".to_vec()).expect("propose");
        assert_eq!(leader.commit_index(), 0);

        let requests = leader.prepare_append_entries();
        assert_eq!(requests.len(), 2);
        let (peer, args) = &requests[0];
        assert_eq!(args.entries.len(), 1);
        assert_eq!(args.prev_log_index, 0);

        let outcome = leader.handle_append_reply(peer, args, ok_reply(term)).expect("reply");
        assert_eq!(
            outcome,
            ReplicationOutcome::Accepted { commit_advanced: true, follow_up: None }
        );
        assert_eq!(leader.commit_index(), 1);
        assert_eq!(leader.progress[peer.as_str()].match_index, 1);
        assert_eq!(leader.progress[peer.as_str()].next_index, 2);
    }

    #[test]
    fn in_flight_followers_are_skipped_until_answered() {
        let tmp = tempdir().expect("tempdir");
        let mut leader = elected_leader(&tmp);
        let term = leader.current_term();

        assert_eq!(leader.prepare_append_entries().len(), 2);
        assert!(leader.prepare_append_entries().is_empty());

        leader.release_in_flight("n2", term);
        let requests = leader.prepare_append_entries();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "n2");
    }

    #[test]
    fn entries_from_earlier_terms_are_not_committed_by_counting() {
        let tmp = tempdir().expect("tempdir");
        let mut leader = elected_leader(&tmp);
        leader.propose(b"old".to_vec()).expect("propose");

        // Lose leadership and win again in a later term without replicating.
        let request = leader.start_election().expect("election");
        let granted = RequestVoteReply { term: request.term, vote_granted: true };
        leader.handle_vote_reply("n3", &request, granted).expect("vote");
        assert!(leader.is_leader());

        for progress in leader.progress.values_mut() {
            progress.match_index = 1;
        }
        assert!(!leader.advance_commit_index());
        assert_eq!(leader.commit_index(), 0);

        leader.propose(b"new".to_vec()).expect("propose");
        leader.progress.get_mut("n2").expect("n2").match_index = 2;
        assert!(leader.advance_commit_index());
        assert_eq!(leader.commit_index(), 2);
    }

    #[test]
    fn rejection_uses_conflict_hint() {
        let tmp = tempdir().expect("tempdir");
        let mut leader = elected_leader(&tmp);
        let term = leader.current_term();
        for i in 0..5 {
            leader.propose(vec![i]).expect("propose");
        }

        let requests = leader.prepare_append_entries();
        let (peer, args) = requests.into_iter().find(|(p, _)| p == "n2").expect("n2 request");
        assert_eq!(args.prev_log_index, 0);

        // Pretend the leader had probed from the end.
        leader.progress.get_mut("n2").expect("n2").next_index = 6;
        let probe = AppendEntriesArgs { prev_log_index: 5, prev_log_term: term, entries: vec![], ..args };

        // Follower only has two entries.
        let outcome = leader.handle_append_reply(&peer, &probe, reject(term, 3, 0)).expect("reply");
        assert_eq!(outcome, ReplicationOutcome::Rejected);
        assert_eq!(leader.progress["n2"].next_index, 3);
        assert!(!leader.progress["n2"].in_flight);
    }

    #[test]
    fn stale_rejection_is_ignored() {
        let tmp = tempdir().expect("tempdir");
        let mut leader = elected_leader(&tmp);
        let term = leader.current_term();
        leader.propose(b"a".to_vec()).expect("propose");
        leader.propose(b"b".to_vec()).expect("propose");

        let requests = leader.prepare_append_entries();
        let (peer, args) = requests.into_iter().find(|(p, _)| p == "n3").expect("n3 request");
        leader.progress.get_mut("n3").expect("n3").next_index = 2;

        let outcome = leader.handle_append_reply(&peer, &args, reject(term, 0, 0)).expect("reply");
        assert_eq!(outcome, ReplicationOutcome::Rejected);
        assert_eq!(leader.progress["n3"].next_index, 2);
    }

    #[test]
    fn behind_follower_gets_follow_up() {
        let tmp = tempdir().expect("tempdir");
        let mut leader = elected_leader(&tmp);
        let term = leader.current_term();
        leader.propose(b"a".to_vec()).expect("propose");

        let requests = leader.prepare_append_entries();
        let (peer, args) = requests.into_iter().find(|(p, _)| p == "n2").expect("n2 request");

        // More work arrives while the first request is on the wire.
        leader.propose(b"b".to_vec()).expect("propose");

        match leader.handle_append_reply(&peer, &args, ok_reply(term)).expect("reply") {
            ReplicationOutcome::Accepted { follow_up: Some(next), .. } => {
                assert_eq!(next.prev_log_index, 1);
                assert_eq!(next.entries.len(), 1);
                assert_eq!(next.entries[0].index, 2);
            }
            other => panic!("expected follow-up, got {other:?}"),
        }
        assert!(leader.progress["n2"].in_flight);
    }

    #[test]
    fn higher_term_reply_steps_leader_down() {
        let tmp = tempdir().expect("tempdir");
        let mut leader = elected_leader(&tmp);

        let requests = leader.prepare_append_entries();
        let (peer, args) = &requests[0];
        let outcome = leader.handle_append_reply(peer, args, reject(9, 0, 0)).expect("reply");

        assert_eq!(outcome, ReplicationOutcome::SteppedDown);
        assert!(!leader.is_leader());
        assert_eq!(leader.current_term(), 9);

        // The other outstanding reply is now stale.
        let (peer, args) = &requests[1];
        let err = leader.handle_append_reply(peer, args, ok_reply(1)).unwrap_err();
        assert!(matches!(err, RaftError::StaleTerm(1)));
    }
}
