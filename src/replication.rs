//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Durable log abstraction and leader-based replication. The bus appends one
// entry per terminal event to the local log; the coordinator then pushes new
// entries to follower mirrors. Replication is best-effort relative to the
// local append: a follower failure logs a warning and the follower catches
// up on a later push. Leadership is deterministic (first node of the
// deployed membership list); promotion is an operator re-deploy, not an
// automatic failover.
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BusError, BusResult};
use crate::event::Disposition;

/// Identifier of a node in the cluster membership list.
pub type NodeId = String;

/// Replication role of a bus instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// One record in the durable event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Offset assigned by the log on append
    pub offset: u64,
    pub event_id: Uuid,
    pub topic: String,
    /// Sealed wire form of the event (empty when sealing itself failed)
    pub wire: Vec<u8>,
    pub disposition: Disposition,
    pub recorded_at: DateTime<Utc>,
}

/// Durable log contract. Backends (in-memory, file, external store) are
/// supplied by the surrounding application; the bus ships `MemoryLog`.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Appends an entry, assigning and returning the next offset. The
    /// offset carried on `entry` is ignored.
    async fn append(&self, entry: LogEntry) -> BusResult<u64>;

    /// Returns all entries at or after `offset`, in order.
    async fn read_from(&self, offset: u64) -> BusResult<Vec<LogEntry>>;

    /// Offset the next append would receive.
    async fn next_offset(&self) -> BusResult<u64>;
}

/// In-memory durable log, also the default backend.
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(&self, mut entry: LogEntry) -> BusResult<u64> {
        let mut entries = self.entries.lock();
        let offset = entries.len() as u64;
        entry.offset = offset;
        entries.push(entry);
        Ok(offset)
    }

    async fn read_from(&self, offset: u64) -> BusResult<Vec<LogEntry>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|entry| entry.offset >= offset)
            .cloned()
            .collect())
    }

    async fn next_offset(&self) -> BusResult<u64> {
        Ok(self.entries.lock().len() as u64)
    }
}

struct CoordinatorInner {
    role: Role,
    peers: Vec<NodeId>,
    /// Live follower mirrors for the current membership view
    followers: HashMap<NodeId, Arc<dyn DurableLog>>,
    /// Next local offset to push, per follower
    next_to_send: HashMap<NodeId, u64>,
    /// Operator-attached backends, used instead of fresh mirrors on deploy
    attached: HashMap<NodeId, Arc<dyn DurableLog>>,
}

/// Replicates the local durable log to follower nodes.
pub struct ReplicationCoordinator {
    node_id: NodeId,
    local: Arc<dyn DurableLog>,
    inner: tokio::sync::Mutex<CoordinatorInner>,
}

impl ReplicationCoordinator {
    /// Creates a coordinator for a standalone node. Until a cluster is
    /// deployed the node acts as leader of a single-node membership.
    pub fn new(node_id: NodeId, local: Arc<dyn DurableLog>) -> Self {
        Self {
            node_id,
            local,
            inner: tokio::sync::Mutex::new(CoordinatorInner {
                role: Role::Leader,
                peers: Vec::new(),
                followers: HashMap::new(),
                next_to_send: HashMap::new(),
                attached: HashMap::new(),
            }),
        }
    }

    /// Supplies a log backend for a peer. Takes effect at the next
    /// `cluster_deploy`; peers without an attached backend get a fresh
    /// in-memory mirror.
    pub async fn attach_peer(&self, node: NodeId, log: Arc<dyn DurableLog>) {
        self.inner.lock().await.attached.insert(node, log);
    }

    /// Installs a membership view. The first listed node is the leader;
    /// every other node gets a follower mirror initialized up to the current
    /// local offset. Re-deploying with a different head promotes that node.
    pub async fn cluster_deploy(&self, nodes: Vec<NodeId>) -> BusResult<()> {
        if nodes.is_empty() {
            return Err(BusError::Replication(
                "cluster membership must list at least one node".to_string(),
            ));
        }

        {
            let mut inner = self.inner.lock().await;
            inner.role = if nodes[0] == self.node_id {
                Role::Leader
            } else {
                Role::Follower
            };
            info!(node_id = %self.node_id, role = ?inner.role, peers = ?nodes, "cluster membership deployed");

            inner.followers.clear();
            inner.next_to_send.clear();
            for node in nodes.iter().filter(|node| **node != self.node_id) {
                let log = inner
                    .attached
                    .get(node)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(MemoryLog::new()) as Arc<dyn DurableLog>);
                let already_held = log.next_offset().await?;
                inner.followers.insert(node.clone(), log);
                inner.next_to_send.insert(node.clone(), already_held);
            }
            inner.peers = nodes;
        }

        // Initial catch-up so mirrors hold the log up to the current offset
        self.replicate().await
    }

    /// Pushes unreplicated local entries to every follower. A follower
    /// failure is logged and retried on the next push; it never blocks the
    /// leader.
    pub async fn replicate(&self) -> BusResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.role != Role::Leader {
            return Ok(());
        }

        let targets: Vec<(NodeId, Arc<dyn DurableLog>, u64)> = inner
            .followers
            .iter()
            .map(|(node, log)| {
                let from = inner.next_to_send.get(node).copied().unwrap_or(0);
                (node.clone(), log.clone(), from)
            })
            .collect();

        let local = self.local.clone();
        let pushes = targets.into_iter().map(|(node, log, from)| {
            let local = local.clone();
            async move {
                let entries = match local.read_from(from).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(node = %node, error = %err, "failed to read local log for replication");
                        return (node, from);
                    }
                };
                let mut next = from;
                for entry in entries {
                    match log.append(entry).await {
                        Ok(_) => next += 1,
                        Err(err) => {
                            warn!(node = %node, error = %err, "follower append failed; will retry on next push");
                            break;
                        }
                    }
                }
                if next > from {
                    debug!(node = %node, replicated_through = next - 1, "replicated log entries");
                }
                (node, next)
            }
        });

        for (node, next) in join_all(pushes).await {
            inner.next_to_send.insert(node, next);
        }
        Ok(())
    }

    /// Returns local log entries at or after `from_offset`, for local replay
    /// on restart.
    pub async fn replay(&self, from_offset: u64) -> BusResult<Vec<LogEntry>> {
        self.local.read_from(from_offset).await
    }

    /// Returns a follower mirror's entries at or after `from_offset`, for
    /// follower catch-up verification.
    pub async fn replay_peer(&self, node: &str, from_offset: u64) -> BusResult<Vec<LogEntry>> {
        let log = {
            let inner = self.inner.lock().await;
            inner.followers.get(node).cloned().ok_or_else(|| {
                BusError::Replication(format!("node '{}' is not a follower in the current view", node))
            })?
        };
        log.read_from(from_offset).await
    }

    pub async fn role(&self) -> Role {
        self.inner.lock().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == Role::Leader
    }

    /// Offset up to which a follower has confirmed entries (exclusive).
    pub async fn replicated_offset(&self, node: &str) -> Option<u64> {
        self.inner.lock().await.next_to_send.get(node).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn entry(topic: &str) -> LogEntry {
        LogEntry {
            offset: 0,
            event_id: Uuid::new_v4(),
            topic: topic.to_string(),
            wire: serde_json::to_vec(&json!({"t": topic})).unwrap(),
            disposition: Disposition::Delivered,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_log_assigns_sequential_offsets() {
        let log = MemoryLog::new();
        assert_eq!(log.append(entry("a")).await.unwrap(), 0);
        assert_eq!(log.append(entry("b")).await.unwrap(), 1);
        assert_eq!(log.next_offset().await.unwrap(), 2);

        let tail = log.read_from(1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].topic, "b");
    }

    #[tokio::test]
    async fn test_first_listed_node_becomes_leader() {
        let local = Arc::new(MemoryLog::new());
        let coordinator = ReplicationCoordinator::new("n1".to_string(), local);

        coordinator
            .cluster_deploy(vec!["n1".to_string(), "n2".to_string()])
            .await
            .unwrap();
        assert_eq!(coordinator.role().await, Role::Leader);

        // Re-deploying with a different head demotes this node
        coordinator
            .cluster_deploy(vec!["n2".to_string(), "n1".to_string()])
            .await
            .unwrap();
        assert_eq!(coordinator.role().await, Role::Follower);
    }

    #[tokio::test]
    async fn test_followers_mirror_the_local_log() {
        let local: Arc<dyn DurableLog> = Arc::new(MemoryLog::new());
        local.append(entry("orders.created")).await.unwrap();
        local.append(entry("orders.cancelled")).await.unwrap();

        let coordinator = ReplicationCoordinator::new("n1".to_string(), local.clone());
        assert_ok!(
            coordinator
                .cluster_deploy(vec!["n1".to_string(), "n2".to_string()])
                .await
        );

        // Deploy performs the initial catch-up
        let mirrored = coordinator.replay_peer("n2", 0).await.unwrap();
        let canonical = coordinator.replay(0).await.unwrap();
        assert_eq!(mirrored, canonical);

        // New appends flow on the next push
        local.append(entry("trades.settled")).await.unwrap();
        assert_ok!(coordinator.replicate().await);
        assert_eq!(
            coordinator.replay_peer("n2", 0).await.unwrap(),
            coordinator.replay(0).await.unwrap()
        );
        assert_eq!(coordinator.replicated_offset("n2").await, Some(3));
    }

    struct FailingLog;

    #[async_trait]
    impl DurableLog for FailingLog {
        async fn append(&self, _entry: LogEntry) -> BusResult<u64> {
            Err(BusError::Replication("follower unavailable".to_string()))
        }

        async fn read_from(&self, _offset: u64) -> BusResult<Vec<LogEntry>> {
            Ok(Vec::new())
        }

        async fn next_offset(&self) -> BusResult<u64> {
            Ok(0)
        }
    }

    struct FileLog {
        path: std::path::PathBuf,
    }

    #[async_trait]
    impl DurableLog for FileLog {
        async fn append(&self, mut entry: LogEntry) -> BusResult<u64> {
            use std::io::Write;
            let offset = self.next_offset().await?;
            entry.offset = offset;
            let line = serde_json::to_string(&entry)
                .map_err(|e| BusError::Replication(e.to_string()))?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| BusError::Replication(e.to_string()))?;
            writeln!(file, "{}", line).map_err(|e| BusError::Replication(e.to_string()))?;
            Ok(offset)
        }

        async fn read_from(&self, offset: u64) -> BusResult<Vec<LogEntry>> {
            let raw = match std::fs::read_to_string(&self.path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(BusError::Replication(e.to_string())),
            };
            let mut entries = Vec::new();
            for line in raw.lines() {
                let entry: LogEntry = serde_json::from_str(line)
                    .map_err(|e| BusError::Replication(e.to_string()))?;
                if entry.offset >= offset {
                    entries.push(entry);
                }
            }
            Ok(entries)
        }

        async fn next_offset(&self) -> BusResult<u64> {
            Ok(self.read_from(0).await?.len() as u64)
        }
    }

    #[tokio::test]
    async fn test_file_backed_follower_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let file_log = Arc::new(FileLog {
            path: dir.path().join("mirror.log"),
        });

        let local: Arc<dyn DurableLog> = Arc::new(MemoryLog::new());
        local.append(entry("orders.created")).await.unwrap();

        let coordinator = ReplicationCoordinator::new("n1".to_string(), local.clone());
        coordinator.attach_peer("n2".to_string(), file_log).await;
        coordinator
            .cluster_deploy(vec!["n1".to_string(), "n2".to_string()])
            .await
            .unwrap();

        local.append(entry("orders.cancelled")).await.unwrap();
        assert_ok!(coordinator.replicate().await);

        assert_eq!(
            coordinator.replay_peer("n2", 0).await.unwrap(),
            coordinator.replay(0).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_follower_failure_does_not_block_the_leader() {
        let local: Arc<dyn DurableLog> = Arc::new(MemoryLog::new());
        local.append(entry("orders.created")).await.unwrap();

        let coordinator = ReplicationCoordinator::new("n1".to_string(), local.clone());
        coordinator
            .attach_peer("n2".to_string(), Arc::new(FailingLog))
            .await;
        coordinator
            .cluster_deploy(vec!["n1".to_string(), "n2".to_string(), "n3".to_string()])
            .await
            .unwrap();

        // The healthy follower still catches up
        assert_eq!(coordinator.replay_peer("n3", 0).await.unwrap().len(), 1);
        // The failing follower confirmed nothing
        assert_eq!(coordinator.replicated_offset("n2").await, Some(0));
    }
}
