//! Message replication on top of the log.
//!
//! Turns "append a command" into "deliver this command to the local
//! handler": synchronously on the leader, ordered-and-buffered through a
//! single drain worker on followers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::command::{ClusterCommand, CommandHandler};
use crate::error::ClusterError;
use crate::events::{ClusterEvent, EventBus};
use crate::log::{CommitHook, LogEntry, ReplicatedLog};
use crate::store::StateStore;
use crate::Result;

/// Delivers committed log entries to the application command handler.
///
/// Register an instance as the log's commit hook; on the leader (and for
/// snapshot entries) delivery happens inside the commit so a handler error
/// fails the replication, on followers entries are buffered and drained
/// strictly in index order by one background worker.
pub struct MessageReplicator {
    log: Arc<ReplicatedLog>,
    store: Arc<dyn StateStore>,
    bus: EventBus,
    handler: RwLock<Option<Arc<dyn CommandHandler>>>,
    is_leader: AtomicBool,
    queue_tx: mpsc::UnboundedSender<LogEntry>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<LogEntry>>>,
    pending_tx: watch::Sender<usize>,
}

impl MessageReplicator {
    pub fn new(log: Arc<ReplicatedLog>, store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (pending_tx, _) = watch::channel(0);
        Self {
            log,
            store,
            bus,
            handler: RwLock::new(None),
            is_leader: AtomicBool::new(false),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            pending_tx,
        }
    }

    /// Register the handler receiving every replicated command
    pub async fn set_handler(&self, handler: Arc<dyn CommandHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Flip the local role; membership calls this on every leader change
    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Entries buffered but not yet delivered on this node
    pub fn pending_len(&self) -> usize {
        *self.pending_tx.borrow()
    }

    /// Watch the buffered-entry count; `Operational` gating waits on this
    pub fn pending_watch(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Suspend until the follower queue is fully drained
    pub async fn wait_for_drain(&self) -> Result<()> {
        let mut rx = self.pending_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return Ok(());
            }
            rx.changed().await.map_err(|_| ClusterError::Cancelled)?;
        }
    }

    /// Leader-side: append `command`, commit it, and deliver it to the
    /// local handler before returning. A handler error propagates and the
    /// command is not considered replicated.
    pub async fn replicate(&self, command: ClusterCommand) -> Result<u64> {
        let index = self.log.next_index().await;
        let term = self.log.current_term().await;
        let entry = LogEntry::new(index, term, command.to_payload()?);

        debug!(index, kind = command.kind(), "replicating command");
        self.log.append(vec![entry], index, false).await?;
        self.log.commit(Some(index)).await?;
        Ok(index)
    }

    /// Follower-side: ingest entries shipped by the leader and commit
    /// through `commit_through`; delivery happens on the drain worker.
    pub async fn ingest(
        &self,
        entries: Vec<LogEntry>,
        start_index: u64,
        commit_through: u64,
    ) -> Result<()> {
        if !entries.is_empty() {
            // Followers adopt the leader's term
            if let Some(term) = entries.iter().map(|e| e.term).max() {
                self.log.update_term(term, true).await;
            }
            self.log.append(entries, start_index, true).await?;
        }
        self.log.commit(Some(commit_through)).await?;
        Ok(())
    }

    /// Spawn the single drain worker; call once per instance.
    ///
    /// The worker exits when `shutdown` flips, reporting cancellation
    /// distinctly from a closed queue.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let replicator = self.clone();
        tokio::spawn(async move {
            let mut queue_rx = match replicator.queue_rx.lock().await.take() {
                Some(rx) => rx,
                None => {
                    warn!("replication drain worker already started");
                    return;
                }
            };

            loop {
                tokio::select! {
                    entry = queue_rx.recv() => {
                        let Some(entry) = entry else {
                            debug!("replication queue closed, drain worker exiting");
                            break;
                        };
                        let index = entry.index;
                        if let Err(error) = replicator.deliver(&entry).await {
                            // Delivery order must hold, so the entry is not
                            // skipped; it will be retried by the next
                            // leader sync
                            warn!(index, "failed to apply replicated entry: {error:#}");
                        }
                        replicator.pending_tx.send_modify(|n| *n = n.saturating_sub(1));
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("replication drain worker cancelled by shutdown");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Deliver one committed entry to the handler and record the commit
    /// marker
    async fn deliver(&self, entry: &LogEntry) -> anyhow::Result<()> {
        let handler = self.handler.read().await.clone();
        let Some(handler) = handler else {
            anyhow::bail!("no command handler registered");
        };

        if entry.is_snapshot {
            handler.restore_snapshot(entry.payload.clone()).await?;
        } else {
            let command = ClusterCommand::from_payload(&entry.payload)?;
            handler.handle(command.clone()).await?;
            self.bus.publish(ClusterEvent::ReplicatedMessage(command));
        }

        // Crash recovery marker; failure here is tolerated
        if let Err(error) = self.store.save_commit_marker(entry.index, entry.term).await {
            warn!(index = entry.index, "failed to persist commit marker: {error}");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CommitHook for MessageReplicator {
    async fn entry_committed(&self, entry: &LogEntry) -> anyhow::Result<()> {
        if self.is_leader() || entry.is_snapshot {
            // Synchronous: an error here fails the commit and the
            // replication initiator sees it
            self.deliver(entry).await
        } else {
            self.pending_tx.send_modify(|n| *n += 1);
            self.queue_tx
                .send(entry.clone())
                .map_err(|_| anyhow::anyhow!("replication queue closed"))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::store::MemoryStore;

    struct RecordingHandler {
        seen: StdMutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self { seen: StdMutex::new(Vec::new()), fail: AtomicBool::new(false) }
        }
    }

    #[async_trait::async_trait]
    impl CommandHandler for RecordingHandler {
        async fn handle(&self, command: ClusterCommand) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("handler rejected command");
            }
            self.seen.lock().unwrap().push(command.kind().to_string());
            Ok(())
        }
    }

    async fn setup() -> (Arc<ReplicatedLog>, Arc<MessageReplicator>, Arc<RecordingHandler>) {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(ReplicatedLog::new(store.clone(), 100));
        let bus = EventBus::default();
        let replicator = Arc::new(MessageReplicator::new(log.clone(), store, bus));
        log.set_commit_hook(replicator.clone()).await;

        let handler = Arc::new(RecordingHandler::new());
        replicator.set_handler(handler.clone()).await;
        (log, replicator, handler)
    }

    fn member_left(endpoint: &str) -> ClusterCommand {
        ClusterCommand::MemberLeft { endpoint: endpoint.to_string() }
    }

    #[tokio::test]
    async fn test_leader_delivery_is_synchronous() {
        let (_log, replicator, handler) = setup().await;
        replicator.set_leader(true);

        let index = replicator.replicate(member_left("10.0.0.9:7071")).await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(handler.seen.lock().unwrap().as_slice(), ["member_left"]);
        assert_eq!(replicator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_leader_handler_error_fails_replication() {
        let (log, replicator, handler) = setup().await;
        replicator.set_leader(true);
        handler.fail.store(true, Ordering::SeqCst);

        let result = replicator.replicate(member_left("10.0.0.9:7071")).await;
        assert!(matches!(result, Err(ClusterError::CommandRejected(_))));
        // The entry exists but was never committed
        assert_eq!(log.highest_index().await, 1);
        assert_eq!(log.commit_index().await, 0);
    }

    #[tokio::test]
    async fn test_follower_drains_in_index_order() {
        let (_log, replicator, handler) = setup().await;
        replicator.set_leader(false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _worker = replicator.start(shutdown_rx);

        let entries = vec![
            LogEntry::new(1, 1, member_left("a:1").to_payload().unwrap()),
            LogEntry::new(2, 1, member_left("b:1").to_payload().unwrap()),
            LogEntry::new(3, 1, member_left("c:1").to_payload().unwrap()),
        ];
        replicator.ingest(entries, 1, 3).await.unwrap();
        replicator.wait_for_drain().await.unwrap();

        assert_eq!(
            handler.seen.lock().unwrap().len(),
            3,
            "all three entries must be applied"
        );
        shutdown_tx.send(true).unwrap();
    }
}
