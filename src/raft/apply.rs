use std::sync::Arc;

use ::log::{debug, error};

use super::{LogEntry, Raft, RaftError};

/// Deterministic consumer of committed commands.
///
/// `apply` is called exactly once per committed index, in index order, on every
/// replica. The same sequence of commands must produce the same state everywhere.
pub trait StateMachine: Send + Sync + 'static {
    type Output: Send + 'static;

    fn apply(&self, command: &[u8]) -> Self::Output;
}

impl<S: StateMachine> Raft<S> {
    /// Feeds committed entries to the state machine until shutdown.
    pub(super) async fn run_apply_loop(self: Arc<Self>) {
        let mut commit_rx = self.commit_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let batch = {
                let node = self.node.read().await;
                node.entries_to_apply()
            };
            let entries = match batch {
                Ok(entries) => entries,
                Err(e) => {
                    error!("Node {} cannot read committed entries: {}", self.id, e);
                    break;
                }
            };

            if entries.is_empty() {
                tokio::select! {
                    changed = commit_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
                continue;
            }

            for entry in entries {
                if self.is_shutdown() {
                    return;
                }

                let output = self.state_machine.apply(&entry.command);
                self.node.write().await.mark_applied(entry.index);
                self.applied_tx.send_replace(entry.index);
                self.resolve_waiter(&entry, output).await;
            }
        }

        debug!("Node {} apply loop stopped", self.id);
    }

    async fn resolve_waiter(&self, entry: &LogEntry, output: S::Output) {
        let waiter = self.waiters.lock().await.remove(&entry.index);
        if let Some(waiter) = waiter {
            // A different term at this index means our proposal was overwritten
            let result = if waiter.term == entry.term {
                Ok(output)
            } else {
                Err(RaftError::ProposalDropped { index: entry.index })
            };
            let _ = waiter.tx.send(result);
        }
    }
}
