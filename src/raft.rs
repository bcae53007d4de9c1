//! Raft consensus wiring.
//!
//! Each node runs an embedded Raft instance (`openraft` 0.9) — no external
//! consensus service. The replicated log entry payload is an encoded
//! [`Command`](crate::command::Command); the state machine is the
//! [`Fsm`](crate::fsm::Fsm), which folds committed commands into its
//! in-memory store.
//!
//! ## Storage
//!
//! Log, vote, and membership live in memory, bridged through openraft's
//! `Adaptor` from the combined v1 `RaftStorage` trait into the v2
//! `RaftLogStorage` + `RaftStateMachine` split `Raft::new` expects.
//! Durability comes from FSM snapshots plus the durable store backends,
//! not from a persisted log.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialised and carried in the `payload` bytes field of the
//! `ClusterService` gRPC transport.
//!
//! ## Async traits
//!
//! openraft 0.9 traits use RPITIT; implementations must be plain
//! `async fn`, never `#[async_trait]`.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, ErrorSubject, ErrorVerb, LogId, LogState, RaftLogId, Snapshot,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::error::WireError;
use crate::fsm::Fsm;
use crate::rpc::proto::cluster_service_client::ClusterServiceClient;
use crate::rpc::proto::RaftMessage;

// ── Type configuration ────────────────────────────────────────────────────

/// State machine response for one applied log entry. Command failures come
/// back through here — the FSM never panics the apply loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub error: Option<WireError>,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Vec<u8>,
        R            = ApplyOutcome,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Derive a stable u64 node ID from a human-readable identifier.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

fn restore_err(e: impl std::fmt::Display) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(
            ErrorSubject::StateMachine,
            ErrorVerb::Write,
            AnyError::error(e.to_string()),
        ),
    }
}

// ── Combined in-memory storage (openraft v1 RaftStorage) ─────────────────

/// In-memory Raft log + vote, with state-machine calls delegated to the
/// shared [`Fsm`]. Wrapped by `Adaptor::new` into the v2 split traits.
pub struct LogStore {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot: Option<Snapshot<TypeConfig>>,
    fsm: Arc<Fsm>,
}

impl LogStore {
    pub fn new(fsm: Arc<Fsm>) -> Self {
        LogStore {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            snapshot: None,
            fsm,
        }
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader over a point-in-time copy of the log.
pub struct LogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for LogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Serialises the FSM state into a snapshot blob.
pub struct FsmSnapshotBuilder {
    fsm: Arc<Fsm>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
}

impl RaftSnapshotBuilder<TypeConfig> for FsmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = self.fsm.snapshot().await.map_err(restore_err)?;

        let snapshot_id = format!("snap-{}", self.last_applied.map_or(0, |l| l.index));

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for LogStore {
    type LogReader = LogReader;
    type SnapshotBuilder = FsmSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: self.log.last_key_value().map(|(_, e)| *e.get_log_id()),
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        LogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        // Everything from the conflict point on is gone; split_off keeps
        // the prefix below it.
        self.log.split_off(&log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log = self.log.split_off(&(log_id.index + 1));
        self.last_purged = Some(log_id);
        Ok(())
    }

    // ── State machine ─────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ApplyOutcome>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                openraft::EntryPayload::Blank => responses.push(ApplyOutcome::default()),
                openraft::EntryPayload::Normal(bytes) => {
                    // Command errors (decode included) travel back through
                    // the commit future, not as storage failures.
                    let outcome = match self.fsm.apply_bytes(bytes).await {
                        Ok(()) => ApplyOutcome::default(),
                        Err(e) => ApplyOutcome {
                            error: Some(e.to_wire()),
                        },
                    };
                    responses.push(outcome);
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(ApplyOutcome::default());
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        FsmSnapshotBuilder {
            fsm: self.fsm.clone(),
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        // A node that cannot restore must not keep serving pre-snapshot
        // state; surfacing a storage error here takes Raft down.
        self.fsm
            .restore(snapshot.get_ref())
            .await
            .map_err(restore_err)?;

        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

// ── gRPC network transport ────────────────────────────────────────────────

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Which transport RPC carries an outbound openraft message.
enum RaftRpc {
    AppendEntries,
    Vote,
    InstallSnapshot,
}

/// Per-peer transport implementing openraft's `RaftNetwork`.
///
/// The channel is built once when the factory hands out the network; tonic
/// dials lazily on first use and reconnects by itself after a drop. A peer
/// address that does not even parse as a URI yields a channel-less network
/// whose every exchange reports the peer unreachable.
pub struct GrpcNetwork {
    peer: String,
    channel: Option<Channel>,
}

impl GrpcNetwork {
    fn open_channel(addr: &str) -> Option<Channel> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        // Tight per-call timeouts keep a dead peer from stalling heartbeats
        // until a follower's election timer fires.
        let endpoint = Endpoint::from_shared(uri)
            .ok()?
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(4));
        Some(endpoint.connect_lazy())
    }

    /// Serialise one openraft request, ship it, decode the reply.
    ///
    /// Every transport failure collapses into `Unreachable`; openraft
    /// handles retry and backoff on its side.
    async fn exchange<Req, Resp>(&self, rpc: RaftRpc, req: &Req) -> Result<Resp, Unreachable>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| unreachable(format!("unusable peer address {:?}", self.peer)))?;
        let mut client = ClusterServiceClient::new(channel);

        let message = RaftMessage {
            payload: serde_json::to_vec(req).map_err(unreachable)?,
        };
        let reply = match rpc {
            RaftRpc::AppendEntries => client.append_entries(message).await,
            RaftRpc::Vote => client.vote(message).await,
            RaftRpc::InstallSnapshot => client.install_snapshot(message).await,
        }
        .map_err(unreachable)?;

        serde_json::from_slice(&reply.into_inner().payload).map_err(unreachable)
    }
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.exchange(RaftRpc::AppendEntries, &rpc)
            .await
            .map_err(RPCError::Unreachable)
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.exchange(RaftRpc::Vote, &rpc)
            .await
            .map_err(RPCError::Unreachable)
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.exchange(RaftRpc::InstallSnapshot, &rpc)
            .await
            .map_err(RPCError::Unreachable)
    }
}

/// Creates a [`GrpcNetwork`] per target peer.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        GrpcNetwork {
            channel: GrpcNetwork::open_channel(&node.addr),
            peer: node.addr.clone(),
        }
    }
}

// ── RaftHandle ────────────────────────────────────────────────────────────

/// A running Raft node plus its FSM.
#[derive(Clone)]
pub struct RaftHandle {
    pub raft: Arc<RaftInstance>,
    pub fsm: Arc<Fsm>,
    pub node_id: NodeId,
}

impl RaftHandle {
    /// True when this node is the current leader.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// gRPC address of the current leader, if one is known.
    pub fn current_leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        let addr = metrics
            .membership_config
            .nodes()
            .find(|(id, _)| **id == leader)
            .map(|(_, node)| node.addr.clone());
        addr
    }

    pub async fn shutdown(&self) {
        let _ = self.raft.shutdown().await;
    }
}

// ── Startup ───────────────────────────────────────────────────────────────

/// Submit the configured peer set as the cluster's initial membership.
///
/// There is no designated seeder: openraft accepts `initialize` from any
/// member as long as every caller proposes the same membership (the
/// membership entry it writes at log index zero is identical everywhere),
/// so each node simply submits the full peer set. Nodes that lose the race
/// — and nodes restarting into an already-formed cluster — land on
/// `NotAllowed`, which is the expected outcome, not a failure.
async fn propose_initial_membership(
    raft: &RaftInstance,
    this_node_id: NodeId,
    peers: &[(NodeId, String)],
) -> crate::error::Result<()> {
    use openraft::error::InitializeError;

    let members: BTreeMap<NodeId, BasicNode> = peers
        .iter()
        .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
        .collect();

    if !members.contains_key(&this_node_id) {
        return Err(crate::error::Error::InvalidArgument(format!(
            "node {this_node_id} is missing from its own configured peer set"
        )));
    }

    match raft.initialize(members).await {
        Ok(()) => {
            info!(node_id = this_node_id, "proposed initial cluster membership");
            Ok(())
        }
        Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
            debug!(node_id = this_node_id, "cluster membership already settled");
            Ok(())
        }
        Err(e) => Err(crate::error::Error::internal(anyhow::anyhow!(
            "raft initialise: {e}"
        ))),
    }
}

/// Start a Raft node over `fsm`.
///
/// `peers` is `(node_id, grpc_addr)` for every member including this one;
/// every member proposes that set as the initial membership (see
/// [`propose_initial_membership`]). An empty peer list starts the node
/// without initialising — it stays a learner until a leader contacts it.
pub async fn start_raft_node(
    fsm: Arc<Fsm>,
    this_node_id: NodeId,
    peers: Vec<(NodeId, String)>,
) -> crate::error::Result<Arc<RaftHandle>> {
    let config = Arc::new(
        openraft::Config {
            cluster_name: "gastrolog".to_string(),
            // The control plane tolerates slow failover; generous timeouts
            // keep config replication stable under load spikes.
            heartbeat_interval: 500,
            election_timeout_min: 1_500,
            election_timeout_max: 3_000,
            ..Default::default()
        }
        .validate()
        .map_err(|e| crate::error::Error::internal(anyhow::anyhow!("raft config: {e}")))?,
    );

    let storage = LogStore::new(fsm.clone());
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = Arc::new(
        openraft::Raft::new(
            this_node_id,
            config,
            GrpcNetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| crate::error::Error::internal(anyhow::anyhow!("raft start: {e}")))?,
    );

    if peers.is_empty() {
        info!(
            node_id = this_node_id,
            "no peers configured; waiting for a leader to add this node"
        );
    } else {
        propose_initial_membership(&raft, this_node_id, &peers).await?;
    }

    let handle = Arc::new(RaftHandle {
        raft: raft.clone(),
        fsm,
        node_id: this_node_id,
    });

    // Log state transitions as they happen.
    {
        let mut rx = raft.metrics();
        tokio::spawn(async move {
            let mut last_state = None;
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let m = rx.borrow().clone();
                if last_state != Some(m.state) {
                    last_state = Some(m.state);
                    info!(
                        node_id = this_node_id,
                        state = ?m.state,
                        term = m.current_term,
                        leader = ?m.current_leader,
                        "raft state changed"
                    );
                }
            }
        });
    }

    info!(node_id = this_node_id, peers = peers.len(), "raft node started");

    Ok(handle)
}
