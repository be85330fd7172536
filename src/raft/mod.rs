mod apply;
mod config;
mod error;
mod log;
mod node;
mod replication;
mod rpc;
mod state;
mod storage;

pub use self::apply::StateMachine;
pub use self::config::RaftConfig;
pub use self::error::RaftError;
pub use self::log::{Log, LogEntry};
pub use self::node::RaftNode;
pub use self::replication::{Progress, ReplicationOutcome};
pub use self::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, RpcHandler,
    Transport,
};
pub use self::state::{HardState, NodeRole, NodeState};
pub use self::storage::HardStateStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
// Use external log crate, not our own log module
use ::log::{debug, error, info, warn};

/// A caller blocked in [`Raft::propose_and_wait`].
struct Waiter<T> {
    term: u64,
    tx: oneshot::Sender<Result<T, RaftError>>,
}

/// A running Raft node: the consensus core plus its timers, RPC fan-out and
/// apply loop.
///
/// All consensus state lives in one [`RaftNode`] behind a single lock. Network
/// calls are made with the lock released, and every reply is checked against the
/// node's current term and role before it is acted on.
pub struct Raft<S: StateMachine> {
    id: String,
    config: RaftConfig,
    node: RwLock<RaftNode>,
    transport: Arc<dyn Transport>,
    state_machine: Arc<S>,

    commit_tx: watch::Sender<u64>,
    applied_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    role_changed: Notify,

    waiters: Mutex<HashMap<u64, Waiter<S::Output>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: StateMachine> Raft<S> {
    /// Restores the node from `config.data_dir`. Call [`Raft::start`] to begin
    /// taking part in the cluster.
    pub fn new(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<S>,
    ) -> Result<Arc<Self>, RaftError> {
        let node = RaftNode::open(config.clone())?;
        let (commit_tx, _) = watch::channel(node.commit_index());
        let (applied_tx, _) = watch::channel(node.last_applied());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            id: config.node_id.clone(),
            config,
            node: RwLock::new(node),
            transport,
            state_machine,
            commit_tx,
            applied_tx,
            shutdown_tx,
            role_changed: Notify::new(),
            waiters: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawns the timer and apply tasks.
    pub async fn start(self: &Arc<Self>) {
        info!(
            "Starting Raft node {} with {} peers",
            self.id,
            self.config.peers.len()
        );

        let ticker = tokio::spawn(Arc::clone(self).run_ticker());
        let applier = tokio::spawn(Arc::clone(self).run_apply_loop());

        let mut tasks = self.tasks.lock().await;
        tasks.push(ticker);
        tasks.push(applier);
    }

    /// Stops the node's tasks, steps down to follower and fails every pending
    /// proposal with [`RaftError::NotRunning`]. Durable state is left as is.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Shutting down Raft node {}", self.id);

        self.node.write().await.stop();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Raft node {} task ended abnormally: {}", self.id, e);
            }
        }

        for (_, waiter) in self.waiters.lock().await.drain() {
            let _ = waiter.tx.send(Err(RaftError::NotRunning));
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn state_machine(&self) -> &Arc<S> {
        &self.state_machine
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn ensure_running(&self) -> Result<(), RaftError> {
        if self.is_shutdown() {
            return Err(RaftError::NotRunning);
        }
        Ok(())
    }

    /// A stopped node leads nothing, so writes are refused the same way a
    /// follower with no known leader refuses them.
    fn ensure_can_propose(&self) -> Result<(), RaftError> {
        if self.is_shutdown() {
            return Err(RaftError::NotLeader(None));
        }
        Ok(())
    }

    pub async fn is_leader(&self) -> bool {
        self.node.read().await.is_leader()
    }

    /// The node this one believes is leader, if any.
    pub async fn leader_hint(&self) -> Option<String> {
        self.node.read().await.leader_id().map(str::to_string)
    }

    pub async fn status(&self) -> NodeState {
        self.node.read().await.status()
    }

    /// Copy of every entry currently held in the log, committed or not.
    pub async fn log_entries(&self) -> Result<Vec<LogEntry>, RaftError> {
        let node = self.node.read().await;
        node.log().entries_from(node.log().start_index())
    }

    /// Appends `command` to the log if this node is leader and starts replicating
    /// it. Returns the index and term it was written at; this is not a promise
    /// that it will commit.
    pub async fn propose(self: &Arc<Self>, command: Vec<u8>) -> Result<(u64, u64), RaftError> {
        self.ensure_can_propose()?;

        let (index, term, commit_index) = {
            let mut node = self.node.write().await;
            let (index, term) = node.propose(command)?;
            (index, term, node.commit_index())
        };

        self.publish_commit(commit_index);
        self.replicate().await;

        Ok((index, term))
    }

    /// Proposes `command` and waits until it has been applied, returning the
    /// state machine's output for it.
    ///
    /// Fails with [`RaftError::ProposalDropped`] if another entry ended up
    /// committed at the same index, and with [`RaftError::Timeout`] if neither
    /// happened within `wait`. A timeout does not cancel the proposal.
    pub async fn propose_and_wait(
        self: &Arc<Self>,
        command: Vec<u8>,
        wait: Duration,
    ) -> Result<S::Output, RaftError> {
        self.ensure_can_propose()?;

        let (rx, index, term, commit_index) = {
            let mut node = self.node.write().await;
            let (index, term) = node.propose(command)?;
            // Registered under the node lock so the apply loop cannot get there first
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().await.insert(index, Waiter { term, tx });
            (rx, index, term, node.commit_index())
        };

        self.publish_commit(commit_index);
        self.replicate().await;

        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::NotRunning),
            Err(_) => {
                let mut waiters = self.waiters.lock().await;
                if waiters.get(&index).map(|w| w.term) == Some(term) {
                    waiters.remove(&index);
                }
                Err(RaftError::Timeout)
            }
        }
    }

    /// Waits until the state machine has applied `index`.
    pub async fn wait_applied(&self, index: u64, wait: Duration) -> Result<(), RaftError> {
        self.ensure_running()?;
        let mut applied_rx = self.applied_tx.subscribe();
        let reached = async {
            applied_rx
                .wait_for(|applied| *applied >= index)
                .await
                .map(|_| ())
        };
        let outcome = timeout(wait, reached).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RaftError::NotRunning),
            Err(_) => Err(RaftError::Timeout),
        }
    }

    fn publish_commit(&self, commit_index: u64) {
        self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }

    async fn run_ticker(self: Arc<Self>) {
        let heartbeat = self.config.heartbeat_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut next_heartbeat = Instant::now();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let (is_leader, election_deadline) = {
                let node = self.node.read().await;
                (node.is_leader(), node.election_deadline())
            };
            let wake_at = if is_leader {
                next_heartbeat
            } else {
                election_deadline
            };

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = self.role_changed.notified() => {
                    next_heartbeat = Instant::now() + heartbeat;
                    continue;
                }
                _ = sleep_until(wake_at) => {}
            }

            if is_leader {
                self.replicate().await;
                next_heartbeat = Instant::now() + heartbeat;
            } else {
                self.election_tick().await;
            }
        }

        debug!("Node {} ticker stopped", self.id);
    }

    async fn election_tick(self: &Arc<Self>) {
        let (request, won) = {
            let mut node = self.node.write().await;
            // Heard from a leader or granted a vote since we went to sleep
            if node.is_leader() || Instant::now() < node.election_deadline() {
                return;
            }
            info!("Election timeout elapsed on node {}", self.id);
            match node.start_election() {
                Ok(request) => (request, node.is_leader()),
                Err(e) => {
                    error!("Node {} failed to start election: {}", self.id, e);
                    node.reset_election_timer();
                    return;
                }
            }
        };

        if won {
            self.replicate().await;
        } else {
            self.request_votes(request);
        }
    }

    fn request_votes(self: &Arc<Self>, request: RequestVoteArgs) {
        for peer in self.config.peers.keys() {
            let this = Arc::clone(self);
            let peer = peer.clone();
            let request = request.clone();

            tokio::spawn(async move {
                let rpc_timeout = this.config.rpc_timeout();
                let result = timeout(rpc_timeout, this.transport.request_vote(&peer, request.clone())).await;
                if this.is_shutdown() {
                    return;
                }

                let reply = match result {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        debug!("RequestVote to {} failed: {}", peer, e);
                        return;
                    }
                    Err(_) => {
                        debug!("RequestVote to {} timed out", peer);
                        return;
                    }
                };

                let outcome = {
                    let mut node = this.node.write().await;
                    node.handle_vote_reply(&peer, &request, reply)
                };
                match outcome {
                    Ok(true) => {
                        this.role_changed.notify_one();
                        this.replicate().await;
                    }
                    Ok(false) => {}
                    Err(e) => error!("Failed to process vote from {}: {}", peer, e),
                }
            });
        }
    }

    /// Sends AppendEntries to every follower without a request in flight.
    async fn replicate(self: &Arc<Self>) {
        let requests = {
            let mut node = self.node.write().await;
            node.prepare_append_entries()
        };
        for (peer, request) in requests {
            self.send_append_entries(peer, request);
        }
    }

    fn send_append_entries(self: &Arc<Self>, peer: String, request: AppendEntriesArgs) {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let rpc_timeout = this.config.rpc_timeout();
            let result = timeout(rpc_timeout, this.transport.append_entries(&peer, request.clone())).await;
            if this.is_shutdown() {
                return;
            }

            let reply = match result {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    debug!("AppendEntries to {} failed: {}", peer, e);
                    this.node.write().await.release_in_flight(&peer, request.term);
                    return;
                }
                Err(_) => {
                    debug!("AppendEntries to {} timed out", peer);
                    this.node.write().await.release_in_flight(&peer, request.term);
                    return;
                }
            };

            let (outcome, commit_index) = {
                let mut node = this.node.write().await;
                let outcome = node.handle_append_reply(&peer, &request, reply);
                (outcome, node.commit_index())
            };

            match outcome {
                Ok(ReplicationOutcome::Accepted {
                    commit_advanced,
                    follow_up,
                }) => {
                    if commit_advanced {
                        this.publish_commit(commit_index);
                    }
                    if let Some(next) = follow_up {
                        this.send_append_entries(peer, next);
                    }
                }
                Ok(ReplicationOutcome::Rejected) => {
                    debug!("{} rejected AppendEntries at index {}", peer, request.prev_log_index);
                }
                Ok(ReplicationOutcome::SteppedDown) => {
                    this.role_changed.notify_one();
                }
                Err(RaftError::StaleTerm(term)) => {
                    debug!("Dropping reply from {} to a term {} request", peer, term);
                }
                Err(e) => error!("Failed to process AppendEntries reply from {}: {}", peer, e),
            }
        });
    }
}

#[async_trait]
impl<S: StateMachine> RpcHandler for Raft<S> {
    async fn handle_request_vote(
        &self,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError> {
        self.ensure_running()?;

        let mut node = self.node.write().await;
        let was_leader = node.is_leader();
        let reply = node.handle_request_vote(args)?;
        if was_leader && !node.is_leader() {
            self.role_changed.notify_one();
        }
        Ok(reply)
    }

    async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        self.ensure_running()?;

        let (reply, commit_index) = {
            let mut node = self.node.write().await;
            let was_leader = node.is_leader();
            let reply = node.handle_append_entries(args)?;
            if was_leader && !node.is_leader() {
                self.role_changed.notify_one();
            }
            (reply, node.commit_index())
        };

        self.publish_commit(commit_index);
        Ok(reply)
    }
}
