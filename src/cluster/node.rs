//! The cluster node: a participant in a leader/follower replication mesh.
//!
//! A node is driven by its owning server's sync thread: update() advances the
//! state machine, pre_poll() starts due network work and computes the next
//! wake deadline, and post_poll() drains network events. All state
//! transitions happen on the sync thread; replication workers and external
//! command threads interact through the thread-safe [`Handle`] and the shared
//! atomics.
//!
//! The lifecycle: a node starts SEARCHING for peers, SYNCHRONIZING if it is
//! behind, then WAITING for an opportunity. The highest-priority node with a
//! current commit STANDSUP, collects approvals from a majority, and LEADS;
//! everyone else SUBSCRIBES to the leader and FOLLOWS its replication
//! stream. Leadership is surrendered by STANDINGDOWN when a better peer
//! appears or on graceful shutdown.

use super::message::{self, Message};
use super::notifier::SequentialNotifier;
use super::peer::{Peer, PeerResponse};
use super::replication;
use super::transport::{self, Event, SocketId, Transport};
use crate::encoding::bincode;
use crate::engine::{Database, JournalEntry, Pool, Prepared, SharedDatabase};
use crate::error::{Error, Result};
use crate::{errdata, errinput};

use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{Receiver, Sender};
use itertools::Itertools as _;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// State timeout for intermediate states (synchronizing, waiting, standing
/// up, subscribing). Expiry sends the node back to SEARCHING.
const STATE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long an in-flight commit may wait for approvals before failing.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a standdown may wait for in-flight commits to finalize. Expiry
/// is logged, but the transition completes regardless.
const STANDDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between liveness pings to connected peers.
const PING_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum commits shipped per synchronization response, to bound frame
/// sizes while a lagging node catches up chunk by chunk.
const SYNC_CHUNK: u64 = 100;
/// Force a QUORUM commit at least this often, so followers regularly prove
/// they are durable up to the leader's position.
const QUORUM_CHECKPOINT: Duration = Duration::from_secs(60);

/// A node's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Initial state before the first update.
    Unknown,
    /// Searching for peers.
    Searching,
    /// Synchronizing with the freshest peer.
    Synchronizing,
    /// Waiting for an opportunity to lead or follow.
    Waiting,
    /// Taking over leadership, collecting approvals.
    StandingUp,
    /// Acting as the leader.
    Leading,
    /// Giving up leadership.
    StandingDown,
    /// Asking the leader for the replication stream.
    Subscribing,
    /// Following the leader's replication stream.
    Following,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            State::Unknown => "UNKNOWN",
            State::Searching => "SEARCHING",
            State::Synchronizing => "SYNCHRONIZING",
            State::Waiting => "WAITING",
            State::StandingUp => "STANDINGUP",
            State::Leading => "LEADING",
            State::StandingDown => "STANDINGDOWN",
            State::Subscribing => "SUBSCRIBING",
            State::Following => "FOLLOWING",
        })
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNKNOWN" => Ok(State::Unknown),
            "SEARCHING" => Ok(State::Searching),
            "SYNCHRONIZING" => Ok(State::Synchronizing),
            "WAITING" => Ok(State::Waiting),
            "STANDINGUP" => Ok(State::StandingUp),
            "LEADING" => Ok(State::Leading),
            "STANDINGDOWN" => Ok(State::StandingDown),
            "SUBSCRIBING" => Ok(State::Subscribing),
            "FOLLOWING" => Ok(State::Following),
            s => errdata!("invalid state {s}"),
        }
    }
}

/// The durability required of a replicated commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsistencyLevel {
    /// Commit locally and stream to followers without waiting.
    Async,
    /// Wait for a single follower acknowledgment.
    One,
    /// Wait for acknowledgment by a majority.
    Quorum,
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConsistencyLevel::Async => "ASYNC",
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Quorum => "QUORUM",
        })
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ASYNC" => Ok(ConsistencyLevel::Async),
            "ONE" => Ok(ConsistencyLevel::One),
            "QUORUM" => Ok(ConsistencyLevel::Quorum),
            s => errdata!("invalid consistency level {s}"),
        }
    }
}

/// The state of the in-flight leader commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    /// No commit has been attempted yet.
    Uninitialized,
    /// A commit was requested and is waiting for approvals.
    Waiting,
    /// The commit is being finalized.
    Committing,
    /// The last commit succeeded.
    Success,
    /// The last commit failed and was rolled back.
    Failed,
}

/// A client write command escalated from a follower to the leader. The
/// follower keeps ownership until the leader's response arrives, then hands
/// the completed command back to its owning server.
#[derive(Clone, Debug, PartialEq, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct Command {
    /// A globally unique command ID.
    pub id: String,
    /// The query blob to execute.
    pub query: Vec<u8>,
    /// The durability to commit with.
    pub consistency: ConsistencyLevel,
    /// True once the command finished (successfully or not).
    pub complete: bool,
    /// The commit count on success, or the error.
    pub result: Option<std::result::Result<u64, Error>>,
    /// On the leader: the peer ID the command arrived from.
    pub initiating_peer: u64,
}

impl Command {
    pub fn new(query: Vec<u8>, consistency: ConsistencyLevel) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query,
            consistency,
            complete: false,
            result: None,
            initiating_peer: 0,
        }
    }
}

impl serde::Serialize for ConsistencyLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ConsistencyLevel {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Node configuration, immutable after construction.
#[derive(Clone, Debug)]
pub struct NodeOptions {
    /// The node's name, unique in the cluster.
    pub name: String,
    /// The node's version. Followers only subscribe to leaders with an
    /// identical version.
    pub version: String,
    /// The configured election priority. 0 makes this node a permafollower
    /// that never leads. Must be >= 0.
    pub priority: i32,
    /// The peer list: `host:port?name=NAME&priority=N&permafollower=true`
    /// entries separated by semicolons.
    pub peers: String,
    /// How long SEARCHING waits for all peers to log in before proceeding
    /// with whoever responded. May be shorter than a round-trip to the
    /// slowest peer; the node then cycles through SEARCHING until a login
    /// lands within one window.
    pub first_timeout: Duration,
    /// Whether to replicate incoming transactions on parallel workers.
    pub use_parallel_replication: bool,
    /// The address where this node's server accepts client commands,
    /// advertised to peers.
    pub command_address: String,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            name: "node".into(),
            version: "1.0".into(),
            priority: 100,
            peers: String::new(),
            first_timeout: Duration::from_secs(4),
            use_parallel_replication: true,
            command_address: String::new(),
        }
    }
}

/// State shared between the sync thread, replication workers, and external
/// command threads.
pub(super) struct Shared {
    /// The node's name, for logging.
    pub name: String,
    /// The node's version.
    pub version: String,
    /// The address where this node accepts client commands.
    pub command_address: String,
    /// The current lifecycle state.
    pub state: AtomicCell<State>,
    /// The current priority: -1 while probing in the first SEARCHING, then
    /// the configured priority.
    pub priority: AtomicI32,
    /// The state of the in-flight leader commit.
    pub commit_state: AtomicCell<CommitState>,
    /// The recognized leader, if any. Workers read it to route
    /// acknowledgments; only the sync thread writes it.
    pub lead_peer: RwLock<Option<Arc<Peer>>>,
    /// The configured peers, indexed by id - 1.
    pub peers: Vec<Arc<Peer>>,
    /// The engine handle pool.
    pub pool: Pool,
    /// Tickets completed by local replication commits.
    pub local_commit: SequentialNotifier,
    /// Tickets the leader has ordered committed.
    pub leader_commit: SequentialNotifier,
    /// Tells replication workers to abandon their transactions.
    pub replication_threads_should_exit: AtomicBool,
    /// The number of live replication workers.
    pub replication_thread_count: AtomicI64,
    /// Total transactions committed by replication workers.
    pub handled_commit_count: AtomicU64,
    /// Set by a worker that hit fatal log divergence; the sync thread folds
    /// it into the next update() as a transition to SEARCHING.
    pub replication_failed: AtomicBool,
    /// Commands escalated to the leader, keyed by command ID, until the
    /// response arrives.
    pub escalated: Mutex<HashMap<String, Command>>,
    /// A commit requested via Handle::start_commit, not yet picked up by the
    /// sync thread.
    pub pending_commit: Mutex<Option<ConsistencyLevel>>,
    /// The graceful shutdown deadline, if shutdown has begun.
    pub shutdown_deadline: AtomicCell<Option<Instant>>,
    /// Wakes the sync thread's poll loop.
    pub event_tx: Sender<Event>,
}

/// A cheap, clonable handle for operations that must be safe from threads
/// other than the sync thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The node's current state.
    pub fn state(&self) -> State {
        self.shared.state.load()
    }

    /// The node's current priority.
    pub fn priority(&self) -> i32 {
        self.shared.priority.load(Ordering::Acquire)
    }

    /// The current commit count.
    pub fn commit_count(&self) -> u64 {
        self.shared.pool.primary().lock().expect("lock poisoned").commit_count()
    }

    /// The primary engine handle, for executing local writes before
    /// start_commit.
    pub fn db(&self) -> SharedDatabase {
        self.shared.pool.primary()
    }

    /// True from start_commit until the commit has been finalized.
    pub fn commit_in_progress(&self) -> bool {
        matches!(self.shared.commit_state.load(), CommitState::Waiting | CommitState::Committing)
            || self.shared.pending_commit.lock().expect("lock poisoned").is_some()
    }

    /// True if the last commit succeeded. False while one is in progress.
    pub fn commit_succeeded(&self) -> bool {
        self.shared.commit_state.load() == CommitState::Success
    }

    /// Begins committing the transaction open on the primary handle, with
    /// the given durability. The commit makes progress across sync thread
    /// updates; poll commit_in_progress() for completion.
    pub fn start_commit(&self, consistency: ConsistencyLevel) -> Result<()> {
        if self.state() != State::Leading {
            return Err(Error::Abort);
        }
        let mut pending = self.shared.pending_commit.lock()?;
        if pending.is_some()
            || matches!(
                self.shared.commit_state.load(),
                CommitState::Waiting | CommitState::Committing
            )
        {
            return errinput!("commit already in progress");
        }
        *pending = Some(consistency);
        self.shared.commit_state.store(CommitState::Waiting);
        drop(pending);
        self.shared.event_tx.send(Event::Wake)?;
        Ok(())
    }

    /// Tells the node another thread committed directly via the pool, waking
    /// the sync thread to stream the new transactions to followers.
    pub fn notify_commit(&self) -> Result<()> {
        self.shared.event_tx.send(Event::LocalCommit)?;
        Ok(())
    }

    /// Escalates a command to the leader. The node owns the command until
    /// the response arrives, then hands it back to the server channel with
    /// complete = true. With forget, no response is expected.
    pub fn escalate_command(&self, command: Command, forget: bool) -> Result<()> {
        let lead_peer = self.shared.lead_peer.read()?;
        let Some(peer) = lead_peer.as_ref() else {
            return Err(Error::Abort);
        };
        let body = bincode::serialize(&command)?;
        let message = Message::new(message::ESCALATE).with(message::ID, &command.id).with_body(body);
        let id = command.id.clone();
        if !forget {
            self.shared.escalated.lock()?.insert(id.clone(), command);
        }
        if let Err(err) = peer.send_message(&message) {
            self.shared.escalated.lock()?.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    /// Broadcasts a message to all logged-in peers, or a specific peer.
    pub fn broadcast(&self, message: &Message, peer: Option<u64>) -> Result<()> {
        for p in &self.shared.peers {
            if peer.is_some_and(|id| id != p.id) {
                continue;
            }
            if p.logged_in() {
                let _ = p.send_message(message);
            }
        }
        Ok(())
    }

    /// The command address of the current leader, if there is one.
    pub fn leader_command_address(&self) -> Option<String> {
        if self.state() == State::Leading {
            return Some(self.shared.command_address.clone());
        }
        let lead_peer = self.shared.lead_peer.read().expect("lock poisoned");
        lead_peer.as_ref().map(|p| p.command_address()).filter(|a| !a.is_empty())
    }

    /// The name of the current leader, if known.
    pub fn leader_name(&self) -> Option<String> {
        if self.state() == State::Leading {
            return Some(self.shared.name.clone());
        }
        let lead_peer = self.shared.lead_peer.read().expect("lock poisoned");
        lead_peer.as_ref().map(|p| p.name.clone())
    }

    /// The state of the lead peer, or UNKNOWN if there is no leader or we
    /// are the leader ourselves.
    pub fn leader_state(&self) -> State {
        let lead_peer = self.shared.lead_peer.read().expect("lock poisoned");
        lead_peer.as_ref().map(|p| p.state()).unwrap_or(State::Unknown)
    }

    /// The lead peer's version string, if known.
    pub fn leader_version(&self) -> Option<String> {
        let lead_peer = self.shared.lead_peer.read().expect("lock poisoned");
        lead_peer.as_ref().map(|p| p.version()).filter(|v| !v.is_empty())
    }

    /// This node's version string.
    pub fn version(&self) -> &str {
        &self.shared.version
    }

    /// Whether a graceful shutdown has begun.
    pub fn shutting_down(&self) -> bool {
        self.shared.shutdown_deadline.load().is_some()
    }

    /// The IDs of escalated commands still awaiting a leader response, for
    /// diagnostics.
    pub fn escalated_commands(&self) -> Vec<String> {
        let escalated = self.shared.escalated.lock().expect("lock poisoned");
        escalated.keys().cloned().sorted().collect()
    }

    /// Begins a graceful shutdown: the node stops standing up, drains
    /// leadership and in-flight work, and closes its connections. Poll
    /// Node::shutdown_complete() on the sync thread.
    pub fn begin_shutdown(&self, wait: Duration) -> Result<()> {
        self.shared.shutdown_deadline.store(Some(Instant::now() + wait));
        self.shared.event_tx.send(Event::Wake)?;
        Ok(())
    }

    /// A point-in-time diagnostic snapshot.
    pub fn status(&self) -> Status {
        let (commit_count, commit_hash) = {
            let db = self.shared.pool.primary();
            let db = db.lock().expect("lock poisoned");
            let count = db.commit_count();
            (count, db.commit_hash(count).ok().flatten().unwrap_or_default())
        };
        Status {
            name: self.shared.name.clone(),
            state: self.state(),
            priority: self.priority(),
            commit_count,
            commit_hash,
            leader: self.leader_name(),
            handled_commit_count: self.shared.handled_commit_count.load(Ordering::Acquire),
            peers: self
                .shared
                .peers
                .iter()
                .map(|p| {
                    let (count, _) = p.get_commit();
                    PeerStatus {
                        name: p.name.clone(),
                        logged_in: p.logged_in(),
                        state: p.state(),
                        priority: p.priority(),
                        commit_count: count,
                        subscribed: p.subscribed(),
                        latency_us: p.latency(),
                    }
                })
                .collect(),
        }
    }
}

/// A diagnostic snapshot of the node.
#[derive(Clone, Debug)]
pub struct Status {
    pub name: String,
    pub state: State,
    pub priority: i32,
    pub commit_count: u64,
    pub commit_hash: String,
    pub leader: Option<String>,
    pub handled_commit_count: u64,
    pub peers: Vec<PeerStatus>,
}

/// A diagnostic snapshot of one peer.
#[derive(Clone, Debug)]
pub struct PeerStatus {
    pub name: String,
    pub logged_in: bool,
    pub state: State,
    pub priority: i32,
    pub commit_count: u64,
    pub subscribed: bool,
    pub latency_us: u64,
}

/// The in-flight leader commit.
struct CommitProgress {
    consistency: ConsistencyLevel,
    prepared: Prepared,
    deadline: Instant,
}

/// A cluster node. Owned and driven by the sync thread; see the module docs.
pub struct Node {
    shared: Arc<Shared>,
    transport: Transport,
    events: Receiver<Event>,
    /// Completed or failed escalated commands handed back to the server.
    server_tx: Sender<Command>,
    /// The primary engine handle (pool index 0).
    db: SharedDatabase,
    /// The configured priority, adopted once SEARCHING completes.
    original_priority: i32,
    first_timeout: Duration,
    use_parallel_replication: bool,

    /// The deadline for the current state; expiry forces SEARCHING.
    state_timeout: Option<Instant>,
    /// Incremented on every state change; stamps STANDUP messages so stale
    /// responses are ignored.
    state_change_count: u64,
    /// SEARCHING gave up waiting for every peer to log in.
    search_exhausted: bool,
    /// The peer we're synchronizing from.
    sync_peer: Option<usize>,
    /// The peer we're subscribing to.
    subscribe_target: Option<usize>,
    /// Accepted (read) sockets, and the peer each one authenticated as.
    accepted: HashMap<SocketId, Option<usize>>,
    /// The current inbound socket for each peer index.
    inbound: HashMap<usize, SocketId>,
    /// The in-flight leader commit.
    commit: Option<CommitProgress>,
    /// Escalated commands received from followers, awaiting execution.
    escalation_queue: VecDeque<(u64, Command)>,
    /// The escalated command the in-flight commit belongs to, if any.
    current_escalation: Option<(u64, Command)>,
    /// The highest commit index streamed to followers.
    last_sent_transaction_id: u64,
    /// Local commits by other threads are pending streaming.
    commits_to_send: bool,
    /// The next BEGIN_TRANSACTION index expected while FOLLOWING.
    next_expected_begin: u64,
    /// The commit index of the serial-replication transaction open on the
    /// primary handle, if any.
    serial_pending: Option<u64>,
    /// Round-robin index for assigning pool handles to workers.
    next_worker_index: u64,
    /// When the last QUORUM commit finished.
    last_quorum_time: Instant,
    /// When pings were last sent.
    last_ping: Instant,
    /// All connections have been torn down for shutdown.
    closed: bool,
}

impl Node {
    /// Creates a node listening on the given listener, using the given
    /// engine pool. Completed escalated commands are handed back on
    /// server_tx.
    pub fn new(
        options: NodeOptions,
        listener: TcpListener,
        pool: Pool,
        server_tx: Sender<Command>,
    ) -> Result<Self> {
        if options.priority < 0 {
            return errinput!("priority must be >= 0");
        }
        let peers: Vec<Arc<Peer>> =
            Peer::parse_list(&options.peers)?.into_iter().map(Arc::new).collect();
        if peers.iter().any(|p| p.name == options.name) {
            return errinput!("peer list contains own name {}", options.name);
        }

        let (event_tx, events) = crossbeam::channel::unbounded();
        let transport = Transport::serve(listener, event_tx.clone())?;
        let db = pool.primary();

        info!(
            "[{}] starting at {} with priority {} and peers [{}]",
            options.name,
            transport.local_addr(),
            options.priority,
            peers.iter().map(|p| p.name.as_str()).join(", "),
        );

        let shared = Arc::new(Shared {
            name: options.name,
            version: options.version,
            command_address: options.command_address,
            state: AtomicCell::new(State::Unknown),
            priority: AtomicI32::new(-1),
            commit_state: AtomicCell::new(CommitState::Uninitialized),
            lead_peer: RwLock::new(None),
            peers,
            pool,
            local_commit: SequentialNotifier::new(),
            leader_commit: SequentialNotifier::new(),
            replication_threads_should_exit: AtomicBool::new(false),
            replication_thread_count: AtomicI64::new(0),
            handled_commit_count: AtomicU64::new(0),
            replication_failed: AtomicBool::new(false),
            escalated: Mutex::new(HashMap::new()),
            pending_commit: Mutex::new(None),
            shutdown_deadline: AtomicCell::new(None),
            event_tx,
        });

        Ok(Self {
            shared,
            transport,
            events,
            server_tx,
            db,
            original_priority: options.priority,
            first_timeout: options.first_timeout,
            use_parallel_replication: options.use_parallel_replication,
            state_timeout: None,
            state_change_count: 0,
            search_exhausted: false,
            sync_peer: None,
            subscribe_target: None,
            accepted: HashMap::new(),
            inbound: HashMap::new(),
            commit: None,
            escalation_queue: VecDeque::new(),
            current_escalation: None,
            last_sent_transaction_id: 0,
            commits_to_send: false,
            next_expected_begin: 0,
            serial_pending: None,
            next_worker_index: 0,
            last_quorum_time: Instant::now(),
            last_ping: Instant::now(),
            closed: false,
        })
    }

    /// Returns a thread-safe handle to this node.
    pub fn handle(&self) -> Handle {
        Handle { shared: self.shared.clone() }
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// The node's current state.
    pub fn state(&self) -> State {
        self.shared.state.load()
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn shutting_down(&self) -> bool {
        self.shared.shutdown_deadline.load().is_some()
    }

    fn commit_count(&self) -> u64 {
        self.db.lock().expect("lock poisoned").commit_count()
    }

    /// The node's current commit position.
    fn commit_position(&self) -> (u64, String) {
        let db = self.db.lock().expect("lock poisoned");
        let count = db.commit_count();
        let hash = db.commit_hash(count).ok().flatten().unwrap_or_default();
        (count, hash)
    }

    /// Runs one iteration of the sync loop: advances the state machine until
    /// it yields, then blocks on network events until the next deadline.
    pub fn tick(&mut self) -> Result<()> {
        while self.update()? {}
        let deadline = self.pre_poll();
        let event = match deadline {
            Some(deadline) => self.events.recv_deadline(deadline),
            None => self.events.recv_timeout(Duration::from_secs(1)),
        };
        if let Ok(event) = event {
            self.handle_event(event);
        }
        self.post_poll()?;
        Ok(())
    }

    // State machine

    /// Advances the state machine. Returns true if it wants immediate
    /// re-entry, false when it is ready to yield to network reads.
    pub fn update(&mut self) -> Result<bool> {
        // A replication worker hit fatal log divergence.
        if self.shared.replication_failed.swap(false, Ordering::AcqRel) {
            warn!("[{}] replication failed, resynchronizing", self.name());
            self.change_state(State::Searching);
            return Ok(true);
        }

        // A commit was requested while not leading (e.g. leadership was lost
        // between the request and this update). Fail it.
        if self.state() != State::Leading {
            if self.shared.pending_commit.lock()?.take().is_some() {
                let mut db = self.db.lock()?;
                if db.in_transaction() {
                    db.rollback()?;
                }
                drop(db);
                self.shared.commit_state.store(CommitState::Failed);
                return Ok(true);
            }
        }

        if self.shutting_down() && self.update_shutdown()? {
            return Ok(true);
        }

        // State timeout: give up and start over from SEARCHING.
        if let Some(timeout) = self.state_timeout {
            if Instant::now() >= timeout {
                match self.state() {
                    State::Searching => {
                        // Proceed with whichever peers responded in time.
                        self.search_exhausted = true;
                        self.state_timeout = Some(Instant::now() + self.first_timeout);
                    }
                    State::StandingDown => {
                        warn!("[{}] standdown timed out, completing anyway", self.name());
                        self.fail_commit()?;
                        self.change_state(State::Searching);
                    }
                    state => {
                        warn!("[{}] state {state} timed out, searching", self.name());
                        self.change_state(State::Searching);
                    }
                }
                return Ok(true);
            }
        }

        match self.state() {
            State::Unknown => {
                self.change_state(State::Searching);
                Ok(true)
            }
            State::Searching => self.update_searching(),
            State::Synchronizing => self.update_synchronizing(),
            State::Waiting => self.update_waiting(),
            State::StandingUp => self.update_standingup(),
            State::Leading => self.update_leading(),
            State::StandingDown => self.update_standingdown(),
            State::Subscribing => self.update_subscribing(),
            State::Following => self.update_following(),
        }
    }

    /// Steers the state machine toward shutdown. Returns true if it made
    /// progress.
    fn update_shutdown(&mut self) -> Result<bool> {
        match self.state() {
            // Leadership drains through the normal commit pipeline, then
            // stands down.
            State::Leading => {
                if self.commit.is_none()
                    && self.escalation_queue.is_empty()
                    && self.shared.pending_commit.lock()?.is_none()
                    && !self.commits_to_send
                {
                    self.change_state(State::StandingDown);
                    return Ok(true);
                }
                Ok(false)
            }
            State::StandingDown => Ok(false),
            // Leave any active role, then tear down the connections.
            state if !self.closed => {
                if state != State::Searching {
                    self.change_state(State::Searching);
                    return Ok(true);
                }
                info!("[{}] closing connections for shutdown", self.name());
                self.fail_escalated_commands()?;
                for peer in &self.shared.peers {
                    peer.reset();
                }
                self.transport.shutdown();
                self.closed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Returns true once shutdown has fully completed: connections closed,
    /// no in-flight work, no replication workers. Forced once the shutdown
    /// deadline passes.
    pub fn shutdown_complete(&mut self) -> bool {
        let Some(deadline) = self.shared.shutdown_deadline.load() else {
            return false;
        };
        if Instant::now() >= deadline {
            if !self.closed {
                warn!("[{}] shutdown deadline exceeded, forcing close", self.name());
                let _ = self.fail_escalated_commands();
                for peer in &self.shared.peers {
                    peer.reset();
                }
                self.transport.shutdown();
                self.shared.replication_threads_should_exit.store(true, Ordering::Release);
                self.shared.leader_commit.cancel_after(0);
                self.shared.local_commit.cancel_after(0);
                self.closed = true;
            }
            return true;
        }
        self.closed
            && self.transport.open_sockets() == 0
            && self.shared.escalated.lock().expect("lock poisoned").is_empty()
            && self.shared.replication_thread_count.load(Ordering::Acquire) == 0
            && !matches!(
                self.shared.commit_state.load(),
                CommitState::Waiting | CommitState::Committing
            )
    }

    fn update_searching(&mut self) -> Result<bool> {
        // A single-node cluster has nothing to search for.
        if self.shared.peers.is_empty() {
            self.shared.priority.store(self.original_priority, Ordering::Release);
            self.change_state(State::Waiting);
            return Ok(true);
        }
        let logged_in = self.shared.peers.iter().filter(|p| p.logged_in()).count();
        if logged_in == 0 {
            return Ok(false);
        }
        // Give every peer a chance to log in before committing to a course,
        // unless the search timeout already expired.
        if logged_in < self.shared.peers.len() && !self.search_exhausted {
            return Ok(false);
        }
        // Probing is over: adopt the configured priority.
        self.shared.priority.store(self.original_priority, Ordering::Release);
        if let Some(index) = self.choose_sync_peer() {
            self.sync_peer = Some(index);
            self.change_state(State::Synchronizing);
        } else {
            self.change_state(State::Waiting);
        }
        Ok(true)
    }

    fn update_synchronizing(&mut self) -> Result<bool> {
        let Some(index) = self.sync_peer else {
            self.change_state(State::Searching);
            return Ok(true);
        };
        if !self.shared.peers[index].logged_in() {
            warn!("[{}] lost synchronization peer, searching", self.name());
            self.change_state(State::Searching);
            return Ok(true);
        }
        // Progress is driven by SYNCHRONIZE_RESPONSE messages; the state
        // timeout catches stalls.
        Ok(false)
    }

    fn update_waiting(&mut self) -> Result<bool> {
        // Follow a compatible leader if one is visible. Whether we're close
        // enough to follow is the leader's call: the subscription either
        // ships us the commits we're missing or gets denied.
        if let Some(index) = self.shared.peers.iter().position(|p| {
            p.logged_in() && p.state() == State::Leading && p.version() == self.shared.version
        }) {
            self.subscribe_target = Some(index);
            self.change_state(State::Subscribing);
            return Ok(true);
        }
        // Catch up if anyone is ahead of us.
        if let Some(index) = self.choose_sync_peer() {
            self.sync_peer = Some(index);
            self.change_state(State::Synchronizing);
            return Ok(true);
        }
        if self.can_stand_up() {
            self.change_state(State::StandingUp);
            return Ok(true);
        }
        Ok(false)
    }

    /// Returns true if this node should claim leadership: it must not be a
    /// permafollower or shutting down, a majority of electors must be
    /// present, nobody may be ahead of our commit, and we must outrank every
    /// logged-in elector whose commit is at or past ours (a lagging peer
    /// doesn't get to block the election, however high its priority).
    /// Priority ties break on the greater name, on both sides of the
    /// election, so two candidates can't split the vote.
    fn can_stand_up(&self) -> bool {
        if self.original_priority == 0 || self.shutting_down() {
            return false;
        }
        let present = 1 + self
            .shared
            .peers
            .iter()
            .filter(|p| !p.permafollower && p.logged_in())
            .count();
        if present < self.quorum_size() {
            return false;
        }
        let commit_count = self.commit_count();
        if self.shared.peers.iter().any(|p| p.logged_in() && p.commit_count() > commit_count) {
            return false;
        }
        let ours = (self.shared.priority.load(Ordering::Acquire), self.name().to_string());
        self.shared
            .peers
            .iter()
            .filter(|p| !p.permafollower && p.logged_in() && p.commit_count() >= commit_count)
            .all(|p| (p.priority(), p.name.clone()) < ours)
    }

    fn update_standingup(&mut self) -> Result<bool> {
        if self.shared.peers.iter().any(|p| p.standup_response() == PeerResponse::Deny) {
            info!("[{}] standup denied, searching", self.name());
            self.change_state(State::Searching);
            return Ok(true);
        }
        // A fresher peer appeared mid-standup; it should lead, not us.
        let commit_count = self.commit_count();
        if self.shared.peers.iter().any(|p| p.logged_in() && p.commit_count() > commit_count) {
            info!("[{}] fresher peer appeared during standup, searching", self.name());
            self.change_state(State::Searching);
            return Ok(true);
        }
        let approvals = 1 + self
            .shared
            .peers
            .iter()
            .filter(|p| !p.permafollower && p.standup_response() == PeerResponse::Approve)
            .count();
        if approvals >= self.quorum_size() {
            self.change_state(State::Leading);
            return Ok(true);
        }
        Ok(false)
    }

    fn update_leading(&mut self) -> Result<bool> {
        // Stand down for a peer that rejoined ahead of us, or a caught-up
        // peer that outranks us.
        let (commit_count, priority) =
            (self.commit_count(), self.shared.priority.load(Ordering::Acquire));
        if self.shared.peers.iter().any(|p| p.logged_in() && p.commit_count() > commit_count) {
            info!("[{}] peer is ahead of us, standing down", self.name());
            self.change_state(State::StandingDown);
            return Ok(true);
        }
        if self.shared.peers.iter().any(|p| {
            p.logged_in()
                && !p.permafollower
                && p.priority() > priority
                && p.commit_count() >= commit_count
        }) {
            info!("[{}] higher-priority peer is ready, standing down", self.name());
            self.change_state(State::StandingDown);
            return Ok(true);
        }

        // The commit pipeline.
        let pending_commit = self.shared.pending_commit.lock()?.take();
        if let Some(consistency) = pending_commit {
            self.start_commit_internal(consistency)?;
            return Ok(true);
        }
        if self.commit.is_some() {
            return self.progress_commit();
        }
        if self.commits_to_send {
            self.send_outstanding_transactions()?;
            return Ok(true);
        }
        if let Some((peer_id, command)) = self.escalation_queue.pop_front() {
            self.start_escalated(peer_id, command)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn update_standingdown(&mut self) -> Result<bool> {
        // Wait for the in-flight commit to finalize.
        if self.commit.is_some() {
            return self.progress_commit();
        }
        self.change_state(State::Searching);
        Ok(true)
    }

    fn update_subscribing(&mut self) -> Result<bool> {
        let Some(index) = self.subscribe_target else {
            self.change_state(State::Searching);
            return Ok(true);
        };
        let peer = &self.shared.peers[index];
        if !peer.logged_in() || peer.state() != State::Leading {
            info!("[{}] lost leader while subscribing, searching", self.name());
            self.change_state(State::Searching);
            return Ok(true);
        }
        Ok(false)
    }

    fn update_following(&mut self) -> Result<bool> {
        let leader_ok = {
            let lead_peer = self.shared.lead_peer.read()?;
            lead_peer.as_ref().is_some_and(|p| p.logged_in() && p.state() == State::Leading)
        };
        if !leader_ok {
            info!("[{}] lost leader, searching", self.name());
            self.change_state(State::Searching);
            return Ok(true);
        }
        Ok(false)
    }

    /// Transitions to a new state, running exit and entry actions and
    /// broadcasting the change to all logged-in peers.
    fn change_state(&mut self, new: State) {
        let old = self.state();
        if old == new {
            return;
        }

        // Exit actions.
        match old {
            State::Following => self.leave_following(),
            State::Synchronizing => {
                self.transport.set_recv_timeout(transport::RECV_TIMEOUT);
                self.sync_peer = None;
            }
            State::Leading | State::StandingDown
                if !matches!(new, State::Leading | State::StandingDown) =>
            {
                self.finish_leading();
            }
            State::Subscribing if new != State::Following => {
                *self.shared.lead_peer.write().expect("lock poisoned") = None;
                self.subscribe_target = None;
            }
            _ => {}
        }

        self.state_change_count += 1;
        self.shared.state.store(new);
        info!("[{}] state {old} -> {new}", self.name());

        self.state_timeout = match new {
            State::Searching => Some(Instant::now() + self.first_timeout),
            State::StandingDown => Some(Instant::now() + STANDDOWN_TIMEOUT),
            State::Synchronizing
            | State::Waiting
            | State::StandingUp
            | State::Subscribing => Some(Instant::now() + STATE_TIMEOUT),
            State::Unknown | State::Leading | State::Following => None,
        };

        // Entry actions.
        match new {
            State::Searching => self.search_exhausted = false,
            State::Synchronizing => {
                self.transport.set_recv_timeout(transport::SYNCHRONIZING_RECV_TIMEOUT);
                self.send_synchronize();
            }
            State::StandingUp => {
                for peer in &self.shared.peers {
                    peer.set_standup_response(PeerResponse::None);
                }
                let (count, hash) = self.commit_position();
                let standup = Message::new(message::STANDUP)
                    .with(message::STATE_CHANGE_COUNT, self.state_change_count)
                    .with(message::PRIORITY, self.shared.priority.load(Ordering::Acquire))
                    .with(message::COMMIT_COUNT, count)
                    .with(message::HASH, hash);
                self.broadcast_logged_in(&standup);
            }
            State::Leading => {
                *self.shared.lead_peer.write().expect("lock poisoned") = None;
                self.last_sent_transaction_id = self.commit_count();
                self.last_quorum_time = Instant::now();
            }
            State::Subscribing => {
                let peer = self.shared.peers[self.subscribe_target.expect("no subscribe target")]
                    .clone();
                let (count, hash) = self.commit_position();
                let subscribe = Message::new(message::SUBSCRIBE)
                    .with(message::COMMIT_COUNT, count)
                    .with(message::HASH, hash)
                    .with(message::VERSION, &self.shared.version);
                let _ = peer.send_message(&subscribe);
                *self.shared.lead_peer.write().expect("lock poisoned") = Some(peer);
            }
            State::Following => {
                let count = self.commit_count();
                self.next_expected_begin = count + 1;
                self.shared.local_commit.reset(count);
                self.shared.leader_commit.reset(count);
                self.shared.replication_threads_should_exit.store(false, Ordering::Release);
            }
            State::Unknown | State::Waiting | State::StandingDown => {}
        }

        self.broadcast_state();
    }

    /// Exit actions for FOLLOWING: abandon pending replication, join the
    /// workers, and fail outstanding escalations back to the server.
    fn leave_following(&mut self) {
        self.shared.replication_threads_should_exit.store(true, Ordering::Release);
        let committed = self.commit_count();
        self.shared.leader_commit.cancel_after(committed);
        self.shared.local_commit.cancel_after(committed);

        let mut waited = 0;
        while self.shared.replication_thread_count.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(1));
            waited += 1;
            if waited > 5000 {
                warn!("[{}] replication workers failed to exit in time", self.name());
                break;
            }
        }

        *self.shared.lead_peer.write().expect("lock poisoned") = None;
        self.subscribe_target = None;

        // Roll back a half-applied serial transaction.
        if self.serial_pending.take().is_some() {
            let mut db = self.db.lock().expect("lock poisoned");
            if db.in_transaction() {
                let _ = db.rollback();
            }
        }

        let _ = self.fail_escalated_commands();
    }

    /// Exit actions for LEADING/STANDINGDOWN: fail any in-flight commit,
    /// drop subscriptions, and refuse queued escalations.
    fn finish_leading(&mut self) {
        let _ = self.fail_commit();
        for peer in &self.shared.peers {
            peer.set_subscribed(false);
        }
        while let Some((peer_id, command)) = self.escalation_queue.pop_front() {
            self.respond_escalation(peer_id, &command.id, Err(Error::Abort), 0);
        }
        self.commits_to_send = false;
    }

    /// Fails all outstanding escalated commands back to the owning server,
    /// incomplete, so it can retry them against the next leader.
    fn fail_escalated_commands(&mut self) -> Result<()> {
        let commands: Vec<Command> = {
            let mut escalated = self.shared.escalated.lock()?;
            escalated.drain().map(|(_, c)| c).sorted_by(|a, b| a.id.cmp(&b.id)).collect()
        };
        for mut command in commands {
            debug!("[{}] failing escalated command {}", self.name(), command.id);
            command.complete = false;
            command.result = Some(Err(Error::Abort));
            let _ = self.server_tx.send(command);
        }
        Ok(())
    }

    // Network I/O

    /// Starts due network work (dials, pings) and computes the next wake
    /// deadline for the poll loop.
    pub fn pre_poll(&mut self) -> Option<Instant> {
        let now = Instant::now();
        let mut deadline = self.state_timeout;
        let mut earliest = |at: Option<Instant>| {
            deadline = match (deadline, at) {
                (Some(d), Some(at)) => Some(d.min(at)),
                (d, at) => d.or(at),
            };
        };

        earliest(self.shared.shutdown_deadline.load());
        earliest(self.commit.as_ref().map(|c| c.deadline));
        if self.shutting_down() {
            // Poll shutdown progress promptly.
            earliest(Some(now + Duration::from_millis(100)));
        }

        if !self.closed {
            if now >= self.last_ping + PING_INTERVAL {
                self.send_pings();
                self.last_ping = now;
            }
            earliest(Some(self.last_ping + PING_INTERVAL));
        }

        if !self.shutting_down() {
            for (index, peer) in self.shared.peers.iter().enumerate() {
                if peer.should_connect(now) {
                    debug!("[{}] connecting to peer {}", self.name(), peer.name);
                    peer.set_connecting();
                    self.transport.connect(index, peer.host.clone());
                } else {
                    earliest(peer.next_reconnect());
                }
            }
        }

        deadline
    }

    /// Drains and dispatches all pending network events without blocking.
    pub fn post_poll(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected { peer: index, socket } => {
                let Some(peer) = self.shared.peers.get(index) else { return };
                if self.shutting_down() {
                    return;
                }
                debug!("[{}] connected to peer {}", self.name(), peer.name);
                peer.set_socket(socket);
                if peer.send_message(&self.login_message()).is_ok() && peer.update_logged_in() {
                    info!("[{}] peer {} logged in", self.name(), peer.name);
                }
            }
            Event::ConnectFailed { peer: index } => {
                if let Some(peer) = self.shared.peers.get(index) {
                    peer.connect_failed();
                }
            }
            Event::Message { socket, message } => {
                if let Err(err) = self.on_message(socket, message) {
                    warn!("[{}] message error: {err}", self.name());
                    match self.accepted.get(&socket).copied().flatten() {
                        Some(index) => self.disconnect_peer(index),
                        None => {
                            self.accepted.remove(&socket);
                            self.transport.close_socket(socket);
                        }
                    }
                }
            }
            Event::Closed { socket } => {
                if let Some(Some(index)) = self.accepted.remove(&socket) {
                    if self.inbound.get(&index) == Some(&socket) {
                        let peer = self.shared.peers[index].clone();
                        info!("[{}] peer {} disconnected", self.name(), peer.name);
                        self.disconnect_peer(index);
                    }
                }
            }
            Event::LocalCommit => self.commits_to_send = true,
            Event::Wake => {}
        }
    }

    /// Tears down a peer session entirely: both socket halves are closed and
    /// the session state cleared, and a reconnect is scheduled.
    fn disconnect_peer(&mut self, index: usize) {
        self.shared.peers[index].reset();
        if let Some(socket) = self.inbound.remove(&index) {
            self.accepted.remove(&socket);
            self.transport.close_socket(socket);
        }
    }

    /// Dispatches a message received on an accepted socket.
    fn on_message(&mut self, socket: SocketId, message: Message) -> Result<()> {
        let bound = self.accepted.get(&socket).copied().flatten();
        if message.name == message::NODE_LOGIN {
            return self.on_node_login(socket, message);
        }
        let Some(index) = bound else {
            return errdata!("{} from unidentified socket", message.name);
        };
        let peer = self.shared.peers[index].clone();
        debug!("[{}] <-{{{}}} {message}", self.name(), peer.name);

        let name = message.name.clone();
        match name.as_str() {
            message::STATE => self.on_state(&peer, &message),
            message::PING => {
                self.ingest_commit_gossip(&peer, &message)?;
                let (count, hash) = self.commit_position();
                let pong = Message::new(message::PONG)
                    .with(message::TIMESTAMP, message.get_u64(message::TIMESTAMP)?)
                    .with(message::COMMIT_COUNT, count)
                    .with(message::HASH, hash);
                let _ = peer.send_message(&pong);
                Ok(())
            }
            message::PONG => {
                let sent = message.get_u64(message::TIMESTAMP)?;
                peer.set_latency(epoch_micros().saturating_sub(sent));
                self.ingest_commit_gossip(&peer, &message)?;
                Ok(())
            }
            message::STANDUP => self.on_standup(&peer, &message),
            message::STANDUP_RESPONSE => self.on_standup_response(&peer, &message),
            message::SUBSCRIBE => self.on_subscribe(&peer, &message),
            message::SUBSCRIPTION_APPROVED => self.on_subscription_approved(&peer, &message),
            message::SUBSCRIPTION_DENIED => {
                if self.state() == State::Subscribing {
                    info!(
                        "[{}] subscription denied by {}: {}",
                        self.name(),
                        peer.name,
                        message.get_opt(message::REASON).unwrap_or("no reason"),
                    );
                    self.change_state(State::Searching);
                }
                Ok(())
            }
            message::BEGIN_TRANSACTION => self.on_begin_transaction(&peer, message),
            message::COMMIT_TRANSACTION => self.on_commit_transaction(&peer, &message),
            message::ROLLBACK_TRANSACTION => self.on_rollback_transaction(&peer, &message),
            message::APPROVE_TRANSACTION | message::DENY_TRANSACTION => {
                self.on_transaction_response(&peer, &message)
            }
            message::SYNCHRONIZE => self.on_synchronize(&peer, &message),
            message::SYNCHRONIZE_RESPONSE => self.on_synchronize_response(&peer, &message),
            message::ESCALATE => self.on_escalate(&peer, &message),
            message::ESCALATE_RESPONSE => self.on_escalate_response(&peer, &message),
            name => errdata!("unknown message {name}"),
        }
    }

    /// Handles a peer's login handshake on an accepted socket, binding the
    /// socket to the peer and ingesting its advertised session state.
    fn on_node_login(&mut self, socket: SocketId, message: Message) -> Result<()> {
        let name = message.get(message::NAME)?;
        let Some(index) = self.shared.peers.iter().position(|p| p.name == name) else {
            return errdata!("login from unknown peer {name}");
        };
        let peer = self.shared.peers[index].clone();
        debug!("[{}] <-{{{}}} {message}", self.name(), peer.name);

        // Bind the socket as this peer's inbound half, displacing a stale one.
        self.accepted.insert(socket, Some(index));
        if let Some(old) = self.inbound.insert(index, socket) {
            if old != socket {
                self.accepted.remove(&old);
                self.transport.close_socket(old);
            }
        }

        let permafollower = message.get_bool(message::PERMAFOLLOWER)?;
        if permafollower != peer.permafollower {
            warn!(
                "[{}] peer {} advertises permafollower={permafollower}, configured {}",
                self.name(),
                peer.name,
                peer.permafollower,
            );
        }
        peer.set_priority(message.get_i32(message::PRIORITY)?);
        peer.set_version(message.get(message::VERSION)?.to_string());
        peer.set_state(message.get_state(message::NODE_STATE)?);
        peer.set_commit(
            message.get_u64(message::COMMIT_COUNT)?,
            message.get(message::HASH)?.to_string(),
        );
        peer.set_command_address(message.get_opt(message::COMMAND_ADDRESS).unwrap_or("").into());

        if peer.login() {
            info!("[{}] peer {} logged in", self.name(), peer.name);
        }
        Ok(())
    }

    /// Ingests a peer's state broadcast.
    fn on_state(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        let state = message.get_state(message::NODE_STATE)?;
        peer.set_state(state);
        peer.set_priority(message.get_i32(message::PRIORITY)?);
        peer.set_commit(
            message.get_u64(message::COMMIT_COUNT)?,
            message.get(message::HASH)?.to_string(),
        );

        // Two leaders in one cluster: the lower-ranked one must yield.
        if state == State::Leading && self.state() == State::Leading {
            let ours =
                (self.shared.priority.load(Ordering::Acquire), self.name().to_string());
            if (peer.priority(), peer.name.clone()) > ours {
                warn!("[{}] dueling leader {} outranks us, standing down", self.name(), peer.name);
                self.change_state(State::StandingDown);
            }
        }
        Ok(())
    }

    /// Evaluates a peer's leadership claim and responds.
    fn on_standup(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        let state_change_count = message.get_u64(message::STATE_CHANGE_COUNT)?;
        let their_count = message.get_u64(message::COMMIT_COUNT)?;
        let their_priority = message.get_i32(message::PRIORITY)?;
        peer.set_state(State::StandingUp);
        peer.set_priority(their_priority);
        peer.set_commit(their_count, message.get(message::HASH)?.to_string());

        // Judge the claim by our configured priority, not the advertised
        // one: while we're still probing we advertise -1, but a peer we
        // outrank must still be denied, or it grabs leadership only to hand
        // it over once our search completes.
        let our_count = self.commit_count();
        let our_priority = self.original_priority;
        let we_are_elector = self.original_priority > 0;

        let deny: Option<&str> = if matches!(
            self.state(),
            State::Leading | State::StandingUp | State::StandingDown
        ) {
            Some("already leading")
        } else if their_count < our_count {
            Some("commit behind ours")
        } else if we_are_elector && their_priority < our_priority {
            Some("lower priority")
        } else if we_are_elector
            && their_priority == our_priority
            && peer.name.as_str() < self.name()
        {
            Some("priority tie")
        } else {
            None
        };

        let mut response = Message::new(message::STANDUP_RESPONSE)
            .with(message::STATE_CHANGE_COUNT, state_change_count)
            .with(message::APPROVE_VERSION, &self.shared.version);
        match deny {
            Some(reason) => {
                info!("[{}] denying standup of {}: {reason}", self.name(), peer.name);
                response.set(message::RESPONSE, PeerResponse::Deny);
                response.set(message::REASON, reason);
            }
            None => {
                info!("[{}] approving standup of {}", self.name(), peer.name);
                response.set(message::RESPONSE, PeerResponse::Approve);
            }
        }
        let _ = peer.send_message(&response);
        Ok(())
    }

    /// Records a response to our leadership claim. Responses stamped with a
    /// stale state change count are dropped.
    fn on_standup_response(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        let state_change_count = message.get_u64(message::STATE_CHANGE_COUNT)?;
        if self.state() != State::StandingUp || state_change_count != self.state_change_count {
            debug!("[{}] dropping stale standup response from {}", self.name(), peer.name);
            return Ok(());
        }
        peer.set_standup_response(message.get_response(message::RESPONSE)?);
        Ok(())
    }

    /// Admits a follower to the replication stream, shipping it the commits
    /// it is missing inside the approval.
    fn on_subscribe(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        let deny = |reason: &str| {
            Message::new(message::SUBSCRIPTION_DENIED).with(message::REASON, reason)
        };
        if self.state() != State::Leading {
            let _ = peer.send_message(&deny("not leading"));
            return Ok(());
        }
        if self.commit.is_some() {
            // Admitting a subscriber mid-commit would make it miss the
            // in-flight transaction; it can retry in a moment.
            let _ = peer.send_message(&deny("commit in progress"));
            return Ok(());
        }
        if message.get(message::VERSION)? != self.shared.version {
            let _ = peer.send_message(&deny("version mismatch"));
            return Ok(());
        }
        let their_count = message.get_u64(message::COMMIT_COUNT)?;
        let their_hash = message.get(message::HASH)?;
        let mut db = self.db.lock()?;
        let our_count = db.commit_count();
        if their_count > our_count {
            let _ = peer.send_message(&deny("subscriber ahead of leader"));
            return Ok(());
        }
        match db.commit_hash(their_count)? {
            Some(hash) if hash == their_hash => {}
            _ => {
                warn!("[{}] subscriber {} has divergent log", self.name(), peer.name);
                let _ = peer.send_message(&deny("divergent log"));
                return Ok(());
            }
        }
        let mut approved = Self::queue_synchronize(&mut **db, their_count, true)?;
        drop(db);
        approved.name = message::SUBSCRIPTION_APPROVED.into();
        peer.set_subscribed(true);
        info!("[{}] approved subscription of {}", self.name(), peer.name);
        let _ = peer.send_message(&approved);
        Ok(())
    }

    /// The leader accepted our subscription; apply the catch-up commits it
    /// shipped and start following.
    fn on_subscription_approved(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        if self.state() != State::Subscribing
            || self.subscribe_target.map(|i| self.shared.peers[i].id) != Some(peer.id)
        {
            debug!("[{}] dropping stale subscription approval", self.name());
            return Ok(());
        }
        let entries: Vec<JournalEntry> = bincode::deserialize(&message.body)?;
        for entry in &entries {
            self.apply_entry(entry)?;
        }
        peer.set_commit(
            message.get_u64(message::COMMIT_COUNT)?,
            message.get(message::HASH)?.to_string(),
        );
        info!("[{}] subscribed to leader {}", self.name(), peer.name);
        self.change_state(State::Following);
        Ok(())
    }

    /// A replicated transaction begins. Spawn a parallel worker for it, or
    /// execute it inline on the serial path.
    fn on_begin_transaction(&mut self, peer: &Arc<Peer>, message: Message) -> Result<()> {
        if self.state() != State::Following || !self.is_lead_peer(peer) {
            debug!("[{}] ignoring {} while not following", self.name(), message.name);
            return Ok(());
        }
        let id = message.get_u64(message::ID)?;
        if id <= self.commit_count() {
            debug!("[{}] ignoring replayed transaction {id}", self.name());
            return Ok(());
        }
        if id != self.next_expected_begin {
            return errdata!(
                "transaction gap: got {id}, expected {}",
                self.next_expected_begin
            );
        }
        self.next_expected_begin = id + 1;

        if self.use_parallel_replication {
            // A rolled-back predecessor may have left a cancellation mark on
            // this reused index.
            self.shared.leader_commit.reinstate(id);
            self.shared.local_commit.reinstate(id);
            let db = self.shared.pool.worker(self.next_worker_index);
            self.next_worker_index += 1;
            replication::spawn(self.shared.clone(), db, message);
            return Ok(());
        }

        // Serial path: execute inline on the primary handle and hold the
        // transaction open until COMMIT_TRANSACTION or ROLLBACK_TRANSACTION.
        let consistency = message.get_consistency(message::CONSISTENCY)?;
        let mut db = self.db.lock()?;
        let result = db
            .begin()
            .and_then(|()| db.execute(&message.body))
            .and_then(|()| db.prepare().map(|_| ()));
        match result {
            Ok(()) => {
                drop(db);
                self.serial_pending = Some(id);
                if consistency != ConsistencyLevel::Async {
                    let approve =
                        Message::new(message::APPROVE_TRANSACTION).with(message::ID, id);
                    let _ = self.send_to_leader(&approve);
                }
                Ok(())
            }
            Err(err) => {
                let _ = db.rollback();
                drop(db);
                let deny = Message::new(message::DENY_TRANSACTION).with(message::ID, id);
                let _ = self.send_to_leader(&deny);
                Err(err)
            }
        }
    }

    /// The leader ordered a commit. Release the waiting worker, or commit
    /// the serial transaction.
    fn on_commit_transaction(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        if self.state() != State::Following || !self.is_lead_peer(peer) {
            debug!("[{}] ignoring {} while not following", self.name(), message.name);
            return Ok(());
        }
        let count = message.get_u64(message::COMMIT_COUNT)?;
        let hash = message.get(message::HASH)?;
        peer.set_commit(count, hash.to_string());

        if self.use_parallel_replication {
            self.shared.leader_commit.notify_through(count);
            return Ok(());
        }

        match self.serial_pending.take() {
            Some(id) if id == count => {
                let mut db = self.db.lock()?;
                db.commit(hash)?;
                Ok(())
            }
            Some(id) => errdata!("commit for {count} but transaction {id} is open"),
            None if count <= self.commit_count() => Ok(()), // replay
            None => errdata!("commit for {count} without a transaction"),
        }
    }

    /// The leader rolled back the in-flight transaction; abandon it. Its
    /// commit index will be reused by the leader's next transaction.
    fn on_rollback_transaction(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        if self.state() != State::Following || !self.is_lead_peer(peer) {
            return Ok(());
        }
        let id = message.get_u64(message::ID)?;
        info!("[{}] leader rolled back transaction {id}", self.name(), );
        if self.use_parallel_replication {
            self.shared.leader_commit.cancel(id);
            self.shared.local_commit.cancel(id);
        } else if self.serial_pending.take() == Some(id) {
            let mut db = self.db.lock()?;
            if db.in_transaction() {
                db.rollback()?;
            }
        }
        self.next_expected_begin = id;
        Ok(())
    }

    /// A follower approved or denied our in-flight transaction.
    fn on_transaction_response(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        let id = message.get_u64(message::ID)?;
        let Some(progress) = &self.commit else {
            debug!("[{}] dropping stale transaction response for {id}", self.name());
            return Ok(());
        };
        if progress.prepared.count != id {
            debug!("[{}] dropping stale transaction response for {id}", self.name());
            return Ok(());
        }
        peer.set_transaction_response(match message.name.as_str() {
            message::APPROVE_TRANSACTION => PeerResponse::Approve,
            _ => PeerResponse::Deny,
        });
        Ok(())
    }

    /// Serves a catch-up request: ship the requester a chunk of the commits
    /// it is missing.
    fn on_synchronize(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        let their_count = message.get_u64(message::COMMIT_COUNT)?;
        let their_hash = message.get(message::HASH)?;
        let mut db = self.db.lock()?;
        if their_count > db.commit_count() {
            return errdata!("synchronize request from {} ahead of us", peer.name);
        }
        match db.commit_hash(their_count)? {
            Some(hash) if hash == their_hash => {}
            _ => return errdata!("synchronize request from {} with divergent log", peer.name),
        }
        let response = Self::queue_synchronize(&mut **db, their_count, false)?;
        drop(db);
        let _ = peer.send_message(&response);
        Ok(())
    }

    /// Builds a SYNCHRONIZE_RESPONSE for a peer at the given commit count:
    /// one chunk of journal entries, or everything when send_all is set.
    /// Callable from any thread with that thread's own engine handle.
    pub fn queue_synchronize(
        db: &mut dyn Database,
        peer_count: u64,
        send_all: bool,
    ) -> Result<Message> {
        let our_count = db.commit_count();
        let through =
            if send_all { our_count } else { our_count.min(peer_count + SYNC_CHUNK) };
        let mut entries = Vec::new();
        for index in peer_count + 1..=through {
            let entry = db
                .committed_entry(index)?
                .ok_or_else(|| -> Error { errdata!("journal gap at {index}") })?;
            entries.push(entry);
        }
        Ok(Message::new(message::SYNCHRONIZE_RESPONSE)
            .with(message::COMMIT_COUNT, our_count)
            .with(message::HASH, db.commit_hash(our_count)?.unwrap_or_default())
            .with_body(bincode::serialize(&entries)?))
    }

    /// Applies a chunk of catch-up commits, then either finishes
    /// synchronizing or asks for the next chunk.
    fn on_synchronize_response(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        if self.state() != State::Synchronizing
            || self.sync_peer.map(|i| self.shared.peers[i].id) != Some(peer.id)
        {
            debug!("[{}] dropping unsolicited synchronize response", self.name());
            return Ok(());
        }
        let advertised = message.get_u64(message::COMMIT_COUNT)?;
        peer.set_commit(advertised, message.get(message::HASH)?.to_string());

        let entries: Vec<JournalEntry> = bincode::deserialize(&message.body)?;
        for entry in &entries {
            self.apply_entry(entry)?;
        }

        let count = self.commit_count();
        if count >= advertised {
            info!("[{}] synchronized to commit {count}", self.name());
            self.change_state(State::Waiting);
        } else {
            // Ask for the next chunk, and re-arm the stall timeout since we
            // made progress.
            self.send_synchronize();
            self.state_timeout = Some(Instant::now() + STATE_TIMEOUT);
        }
        Ok(())
    }

    /// Applies one replicated commit to the primary handle, verifying the
    /// hash chain.
    fn apply_entry(&mut self, entry: &JournalEntry) -> Result<()> {
        let mut db = self.db.lock()?;
        if entry.count != db.commit_count() + 1 {
            return errdata!(
                "out-of-order commit {}, expected {}",
                entry.count,
                db.commit_count() + 1
            );
        }
        let result = db
            .begin()
            .and_then(|()| db.execute(&entry.query))
            .and_then(|()| db.prepare().map(|_| ()))
            .and_then(|()| db.commit(&entry.hash));
        if let Err(err) = result {
            if db.in_transaction() {
                let _ = db.rollback();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Sends a SYNCHRONIZE request to the current synchronization peer.
    fn send_synchronize(&mut self) {
        let Some(index) = self.sync_peer else { return };
        let (count, hash) = self.commit_position();
        let request = Message::new(message::SYNCHRONIZE)
            .with(message::COMMIT_COUNT, count)
            .with(message::HASH, hash);
        let _ = self.shared.peers[index].send_message(&request);
    }

    /// A follower escalated a command to us; queue it for execution.
    fn on_escalate(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        let id = message.get(message::ID)?;
        if self.state() != State::Leading {
            // A standing-down leader refuses; the follower retries against
            // our successor.
            self.respond_escalation(peer.id, id, Err(Error::Abort), 0);
            return Ok(());
        }
        let mut command: Command = bincode::deserialize(&message.body)?;
        command.initiating_peer = peer.id;
        debug!("[{}] escalated command {} from {}", self.name(), command.id, peer.name);
        self.escalation_queue.push_back((peer.id, command));
        Ok(())
    }

    /// Executes an escalated command and starts committing it. The response
    /// is sent when the commit finalizes.
    fn start_escalated(&mut self, peer_id: u64, command: Command) -> Result<()> {
        let consistency = command.consistency;
        let mut db = self.db.lock()?;
        let result = db.begin().and_then(|()| db.execute(&command.query));
        if let Err(err) = result {
            if db.in_transaction() {
                let _ = db.rollback();
            }
            drop(db);
            warn!("[{}] escalated command {} failed: {err}", self.name(), command.id);
            self.respond_escalation(peer_id, &command.id, Err(err), 0);
            return Ok(());
        }
        drop(db);
        self.current_escalation = Some((peer_id, command));
        self.start_commit_internal(consistency)
    }

    /// Sends an escalation response back to the originating peer.
    fn respond_escalation(
        &self,
        peer_id: u64,
        command_id: &str,
        result: std::result::Result<u64, Error>,
        commit_count: u64,
    ) {
        let Some(peer) = self.shared.peers.iter().find(|p| p.id == peer_id) else {
            return;
        };
        let response = match &result {
            Ok(_) => PeerResponse::Approve,
            Err(_) => PeerResponse::Deny,
        };
        let message = Message::new(message::ESCALATE_RESPONSE)
            .with(message::ID, command_id)
            .with(message::RESPONSE, response)
            .with(message::COMMIT_COUNT, commit_count);
        let _ = peer.send_message(&message);
    }

    /// The leader answered our escalated command; hand it back to the
    /// server, completed.
    fn on_escalate_response(&mut self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        if !self.is_lead_peer(peer) {
            debug!("[{}] escalation response from non-leader {}", self.name(), peer.name);
        }
        let id = message.get(message::ID)?;
        let Some(mut command) = self.shared.escalated.lock()?.remove(id) else {
            debug!("[{}] response for unknown escalation {id}", self.name());
            return Ok(());
        };
        command.complete = true;
        command.result = Some(match message.get_response(message::RESPONSE)? {
            PeerResponse::Approve => Ok(message.get_u64(message::COMMIT_COUNT)?),
            _ => Err(Error::Abort),
        });
        self.server_tx.send(command)?;
        Ok(())
    }

    // Leader commit pipeline

    /// Starts replicating the transaction open on the primary handle:
    /// prepare it, stream BEGIN_TRANSACTION to subscribed followers, and
    /// either finalize immediately (ASYNC) or wait for approvals.
    fn start_commit_internal(&mut self, consistency: ConsistencyLevel) -> Result<()> {
        // Periodically force full durability regardless of the requested
        // consistency.
        let consistency = if consistency != ConsistencyLevel::Quorum
            && self.last_quorum_time.elapsed() >= QUORUM_CHECKPOINT
        {
            info!("[{}] quorum checkpoint due, upgrading commit to QUORUM", self.name());
            ConsistencyLevel::Quorum
        } else {
            consistency
        };

        let mut db = self.db.lock()?;
        if !db.in_transaction() {
            warn!("[{}] commit requested without an open transaction", self.name());
            drop(db);
            self.shared.commit_state.store(CommitState::Failed);
            self.finish_escalation(Err(Error::Abort), 0);
            return Ok(());
        }
        let prepared = match db.prepare() {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("[{}] prepare failed: {err}", self.name());
                let _ = db.rollback();
                drop(db);
                self.shared.commit_state.store(CommitState::Failed);
                self.finish_escalation(Err(err), 0);
                return Ok(());
            }
        };
        drop(db);

        for peer in &self.shared.peers {
            peer.set_transaction_response(PeerResponse::None);
        }
        let begin = Message::new(message::BEGIN_TRANSACTION)
            .with(message::NEW_COUNT, prepared.count)
            .with(message::NEW_HASH, &prepared.hash)
            .with(message::ID, prepared.count)
            .with(message::CONSISTENCY, consistency)
            .with_body(prepared.query.clone());
        self.broadcast_subscribed(&begin);
        self.last_sent_transaction_id = prepared.count;

        self.shared.commit_state.store(CommitState::Waiting);
        self.commit = Some(CommitProgress {
            consistency,
            prepared,
            deadline: Instant::now() + COMMIT_TIMEOUT,
        });

        match consistency {
            ConsistencyLevel::Async => self.finalize_commit()?,
            _ => {
                let _ = self.progress_commit()?;
            }
        }
        Ok(())
    }

    /// Advances the in-flight commit: tallies approvals and denials, applies
    /// the consistency rule, and enforces the commit deadline. Returns true
    /// if the commit finalized either way.
    fn progress_commit(&mut self) -> Result<bool> {
        let Some(progress) = &self.commit else {
            return Ok(false);
        };
        let (consistency, count, deadline) =
            (progress.consistency, progress.prepared.count, progress.deadline);

        let mut any_subscribed = false;
        let mut any_denied = false;
        let mut any_approved = false;
        let mut full_approvals = 1; // ourselves
        for peer in self.shared.peers.iter().filter(|p| p.subscribed()) {
            any_subscribed = true;
            match peer.transaction_response() {
                PeerResponse::Approve => {
                    any_approved = true;
                    if !peer.permafollower {
                        full_approvals += 1;
                    }
                }
                PeerResponse::Deny => any_denied = true,
                PeerResponse::None => {}
            }
        }

        if any_denied {
            warn!("[{}] commit {count} denied by a follower", self.name());
            self.fail_commit()?;
            return Ok(true);
        }

        // A leader that can no longer reach a majority of subscribed
        // electors must not keep committing.
        if !self.majority_subscribed() {
            warn!("[{}] lost majority of subscribers, standing down", self.name());
            self.fail_commit()?;
            if self.state() == State::Leading {
                self.change_state(State::StandingDown);
            }
            return Ok(true);
        }

        // QUORUM needs a strict majority of electors (counting ourselves),
        // and at least one follower of any kind when one is subscribed, so a
        // lone elector leader still waits for its permafollower.
        let satisfied = match consistency {
            ConsistencyLevel::Async => true,
            ConsistencyLevel::One => !any_subscribed || any_approved,
            ConsistencyLevel::Quorum => {
                full_approvals >= self.quorum_size() && (!any_subscribed || any_approved)
            }
        };
        if satisfied {
            self.finalize_commit()?;
            return Ok(true);
        }
        if Instant::now() >= deadline {
            warn!("[{}] commit {count} timed out", self.name());
            self.fail_commit()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Commits the in-flight transaction locally and streams the commit to
    /// subscribed followers.
    fn finalize_commit(&mut self) -> Result<()> {
        let Some(progress) = self.commit.take() else {
            return Ok(());
        };
        self.shared.commit_state.store(CommitState::Committing);
        let mut db = self.db.lock()?;
        match db.commit(&progress.prepared.hash) {
            Ok(count) => {
                drop(db);
                let commit = Message::new(message::COMMIT_TRANSACTION)
                    .with(message::COMMIT_COUNT, count)
                    .with(message::HASH, &progress.prepared.hash);
                self.broadcast_subscribed(&commit);
                self.shared.commit_state.store(CommitState::Success);
                if progress.consistency == ConsistencyLevel::Quorum {
                    self.last_quorum_time = Instant::now();
                }
                debug!("[{}] committed transaction {count}", self.name());
                self.finish_escalation(Ok(count), count);
            }
            Err(err) => {
                drop(db);
                warn!("[{}] local commit failed: {err}", self.name());
                let rollback = Message::new(message::ROLLBACK_TRANSACTION)
                    .with(message::ID, progress.prepared.count);
                self.broadcast_subscribed(&rollback);
                // The broadcast BEGIN went nowhere; its index will be reused.
                self.last_sent_transaction_id = self.commit_count();
                self.shared.commit_state.store(CommitState::Failed);
                self.finish_escalation(Err(err), 0);
            }
        }
        Ok(())
    }

    /// Fails the in-flight commit: roll back locally and tell followers to
    /// abandon it.
    fn fail_commit(&mut self) -> Result<()> {
        let Some(progress) = self.commit.take() else {
            return Ok(());
        };
        let mut db = self.db.lock()?;
        if db.in_transaction() {
            db.rollback()?;
        }
        drop(db);
        let rollback =
            Message::new(message::ROLLBACK_TRANSACTION).with(message::ID, progress.prepared.count);
        self.broadcast_subscribed(&rollback);
        // The broadcast BEGIN went nowhere; its index will be reused.
        self.last_sent_transaction_id = self.commit_count();
        self.shared.commit_state.store(CommitState::Failed);
        self.finish_escalation(Err(Error::Abort), 0);
        Ok(())
    }

    /// Responds to the escalated command the finished commit belonged to.
    fn finish_escalation(&mut self, result: std::result::Result<u64, Error>, commit_count: u64) {
        if let Some((peer_id, command)) = self.current_escalation.take() {
            self.respond_escalation(peer_id, &command.id, result, commit_count);
        }
    }

    /// Streams transactions committed outside the pipeline (signalled via
    /// notify_commit) to subscribed followers as BEGIN/COMMIT pairs.
    fn send_outstanding_transactions(&mut self) -> Result<()> {
        self.commits_to_send = false;
        let entries: Vec<JournalEntry> = {
            let db = self.db.lock()?;
            let count = db.commit_count();
            (self.last_sent_transaction_id + 1..=count)
                .map(|i| {
                    db.committed_entry(i)?
                        .ok_or_else(|| -> Error { errdata!("journal gap at {i}") })
                })
                .collect::<Result<_>>()?
        };
        for entry in entries {
            let begin = Message::new(message::BEGIN_TRANSACTION)
                .with(message::NEW_COUNT, entry.count)
                .with(message::NEW_HASH, &entry.hash)
                .with(message::ID, entry.count)
                .with(message::CONSISTENCY, ConsistencyLevel::Async)
                .with_body(entry.query);
            self.broadcast_subscribed(&begin);
            let commit = Message::new(message::COMMIT_TRANSACTION)
                .with(message::COMMIT_COUNT, entry.count)
                .with(message::HASH, entry.hash);
            self.broadcast_subscribed(&commit);
            self.last_sent_transaction_id = entry.count;
        }
        Ok(())
    }

    // Helpers

    /// The number of election participants: us plus all non-permafollower
    /// peers.
    fn cluster_size(&self) -> usize {
        1 + self.shared.peers.iter().filter(|p| !p.permafollower).count()
    }

    /// The election and commit quorum size (strict majority of electors).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Whether we are LEADING with enough subscribed followers to commit a
    /// QUORUM transaction. Only meaningful on the sync thread.
    pub fn has_quorum(&self) -> bool {
        self.state() == State::Leading && self.majority_subscribed()
    }

    /// Whether a majority of electors (counting ourselves) is subscribed.
    fn majority_subscribed(&self) -> bool {
        let subscribed = 1 + self
            .shared
            .peers
            .iter()
            .filter(|p| !p.permafollower && p.subscribed())
            .count();
        subscribed >= self.quorum_size()
    }

    fn is_lead_peer(&self, peer: &Arc<Peer>) -> bool {
        let lead_peer = self.shared.lead_peer.read().expect("lock poisoned");
        lead_peer.as_ref().is_some_and(|p| p.id == peer.id)
    }

    /// Sends a message to the current leader, if any.
    fn send_to_leader(&self, message: &Message) -> Result<()> {
        let lead_peer = self.shared.lead_peer.read()?;
        match lead_peer.as_ref() {
            Some(peer) => peer.send_message(message),
            None => Err(Error::Abort),
        }
    }

    /// Picks the peer to synchronize from: the logged-in peer with the
    /// greatest commit count ahead of ours, ties broken by lowest latency.
    fn choose_sync_peer(&self) -> Option<usize> {
        let commit_count = self.commit_count();
        self.shared
            .peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.logged_in() && p.commit_count() > commit_count)
            .max_by_key(|(_, p)| (p.commit_count(), std::cmp::Reverse(p.latency())))
            .map(|(index, _)| index)
    }

    /// Our login handshake message.
    fn login_message(&self) -> Message {
        let (count, hash) = self.commit_position();
        Message::new(message::NODE_LOGIN)
            .with(message::NAME, self.name())
            .with(message::VERSION, &self.shared.version)
            .with(message::PRIORITY, self.shared.priority.load(Ordering::Acquire))
            .with(message::PERMAFOLLOWER, self.original_priority == 0)
            .with(message::COMMIT_COUNT, count)
            .with(message::HASH, hash)
            .with(message::NODE_STATE, self.state())
            .with(message::COMMAND_ADDRESS, &self.shared.command_address)
            .with(message::STATE_CHANGE_COUNT, self.state_change_count)
    }

    /// Broadcasts our state to all logged-in peers.
    fn broadcast_state(&mut self) {
        let (count, hash) = self.commit_position();
        let state = Message::new(message::STATE)
            .with(message::NODE_STATE, self.state())
            .with(message::PRIORITY, self.shared.priority.load(Ordering::Acquire))
            .with(message::COMMIT_COUNT, count)
            .with(message::HASH, hash)
            .with(message::STATE_CHANGE_COUNT, self.state_change_count);
        self.broadcast_logged_in(&state);
    }

    fn broadcast_logged_in(&self, message: &Message) {
        for peer in self.shared.peers.iter().filter(|p| p.logged_in()) {
            let _ = peer.send_message(message);
        }
    }

    fn broadcast_subscribed(&self, message: &Message) {
        for peer in self.shared.peers.iter().filter(|p| p.subscribed()) {
            let _ = peer.send_message(message);
        }
    }

    /// Pings all connected peers for liveness and latency. Pings carry our
    /// commit position, so peers' views of each other stay fresh between
    /// state changes (a leader uses this to notice a caught-up
    /// higher-priority follower and yield to it).
    fn send_pings(&self) {
        let (count, hash) = self.commit_position();
        let ping = Message::new(message::PING)
            .with(message::TIMESTAMP, epoch_micros())
            .with(message::COMMIT_COUNT, count)
            .with(message::HASH, hash);
        for peer in self.shared.peers.iter().filter(|p| p.connected()) {
            let _ = peer.send_message(&ping);
        }
    }

    /// Updates a peer's commit position from a message's optional gossip
    /// headers.
    fn ingest_commit_gossip(&self, peer: &Arc<Peer>, message: &Message) -> Result<()> {
        if let (Some(count), Some(hash)) =
            (message.get_opt(message::COMMIT_COUNT), message.get_opt(message::HASH))
        {
            peer.set_commit(count.parse()?, hash.to_string());
        }
        Ok(())
    }
}

/// Microseconds since the Unix epoch, used as PING timestamps.
fn epoch_micros() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Memory;

    fn test_node(options: NodeOptions) -> (Node, Memory) {
        let memory = Memory::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (server_tx, _server_rx) = crossbeam::channel::unbounded();
        let node = Node::new(options, listener, memory.pool(4), server_tx).unwrap();
        (node, memory)
    }

    #[test]
    fn single_node_elects_itself() {
        let (mut node, _) = test_node(NodeOptions::default());
        let handle = node.handle();
        assert_eq!(handle.state(), State::Unknown);

        // SEARCHING with no peers goes straight through WAITING and
        // STANDINGUP to LEADING with a quorum of one.
        let mut states = vec![];
        while node.update().unwrap() {
            states.push(node.state());
        }
        assert_eq!(
            states,
            vec![State::Searching, State::Waiting, State::StandingUp, State::Leading]
        );
        assert_eq!(handle.priority(), 100);
    }

    #[test]
    fn permafollower_never_stands_up() {
        let (mut node, _) = test_node(NodeOptions { priority: 0, ..NodeOptions::default() });
        while node.update().unwrap() {}
        assert_eq!(node.state(), State::Waiting);
    }

    #[test]
    fn single_node_quorum_commit() {
        let (mut node, memory) = test_node(NodeOptions::default());
        let handle = node.handle();
        while node.update().unwrap() {}
        assert_eq!(node.state(), State::Leading);

        {
            let db = handle.db();
            let mut db = db.lock().unwrap();
            db.begin().unwrap();
            db.execute(&crate::engine::memory::put("k", b"v")).unwrap();
        }
        handle.start_commit(ConsistencyLevel::Quorum).unwrap();
        assert!(handle.commit_in_progress());
        while node.update().unwrap() {}
        assert!(!handle.commit_in_progress());
        assert!(handle.commit_succeeded());
        assert_eq!(memory.commit_count(), 1);
        assert_eq!(memory.get("k"), Some(b"v".to_vec()));
    }

    #[test]
    fn start_commit_requires_leadership() {
        let (node, _) = test_node(NodeOptions {
            peers: "127.0.0.1:1?name=other".into(),
            ..NodeOptions::default()
        });
        let handle = node.handle();
        assert_eq!(handle.start_commit(ConsistencyLevel::Quorum), Err(Error::Abort));
    }

    #[test]
    fn start_commit_rejects_concurrent_commits() {
        let (mut node, _) = test_node(NodeOptions::default());
        let handle = node.handle();
        while node.update().unwrap() {}

        {
            let db = handle.db();
            let mut db = db.lock().unwrap();
            db.begin().unwrap();
            db.execute(&crate::engine::memory::put("k", b"v")).unwrap();
        }
        handle.start_commit(ConsistencyLevel::Quorum).unwrap();
        assert!(handle.start_commit(ConsistencyLevel::Quorum).is_err());
    }

    #[test]
    fn rejects_own_name_in_peer_list() {
        let memory = Memory::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (server_tx, _) = crossbeam::channel::unbounded();
        let options = NodeOptions {
            name: "a".into(),
            peers: "127.0.0.1:1?name=a".into(),
            ..NodeOptions::default()
        };
        assert!(Node::new(options, listener, memory.pool(2), server_tx).is_err());
    }

    #[test]
    fn queue_synchronize_chunks() {
        let memory = Memory::new();
        let mut db = memory.handle();
        for i in 0..150u32 {
            db.begin().unwrap();
            db.execute(&crate::engine::memory::put(&format!("k{i}"), b"v")).unwrap();
            let prepared = db.prepare().unwrap();
            db.commit(&prepared.hash).unwrap();
        }

        let response = Node::queue_synchronize(&mut db, 0, false).unwrap();
        assert_eq!(response.get_u64(message::COMMIT_COUNT).unwrap(), 150);
        let entries: Vec<JournalEntry> = bincode::deserialize(&response.body).unwrap();
        assert_eq!(entries.len(), SYNC_CHUNK as usize);
        assert_eq!(entries.first().unwrap().count, 1);
        assert_eq!(entries.last().unwrap().count, SYNC_CHUNK);

        let response = Node::queue_synchronize(&mut db, 0, true).unwrap();
        let entries: Vec<JournalEntry> = bincode::deserialize(&response.body).unwrap();
        assert_eq!(entries.len(), 150);

        let response = Node::queue_synchronize(&mut db, 149, false).unwrap();
        let entries: Vec<JournalEntry> = bincode::deserialize(&response.body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].count, 150);
    }

    #[test]
    fn state_roundtrips_through_strings() {
        for state in [
            State::Unknown,
            State::Searching,
            State::Synchronizing,
            State::Waiting,
            State::StandingUp,
            State::Leading,
            State::StandingDown,
            State::Subscribing,
            State::Following,
        ] {
            assert_eq!(state.to_string().parse::<State>().unwrap(), state);
        }
        for level in
            [ConsistencyLevel::Async, ConsistencyLevel::One, ConsistencyLevel::Quorum]
        {
            assert_eq!(level.to_string().parse::<ConsistencyLevel>().unwrap(), level);
        }
    }

    #[test]
    fn shutdown_single_node() {
        let (mut node, _) = test_node(NodeOptions::default());
        let handle = node.handle();
        while node.update().unwrap() {}
        assert_eq!(node.state(), State::Leading);

        handle.begin_shutdown(Duration::from_secs(5)).unwrap();
        for _ in 0..20 {
            if node.shutdown_complete() {
                break;
            }
            node.tick().unwrap();
        }
        assert!(node.shutdown_complete());
    }
}
