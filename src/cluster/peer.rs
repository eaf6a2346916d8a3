//! Per-peer session state. A peer is a configured neighbor in the cluster
//! mesh: its identity is immutable for the node's lifetime, while its
//! session scalars (liveness, advertised state, commit position, responses)
//! are atomics readable from any thread. The commit count and hash must
//! always be observed together, so they share one lock.
//!
//! Each pair of nodes maintains two simplex TCP connections: a node sends on
//! the connection it dialed and receives on the connection it accepted. The
//! socket here is the outbound (send) half; sends are thread-safe because
//! replication workers acknowledge transactions directly to the leader.

use super::message::Message;
use super::node::State;
use crate::errinput;
use crate::error::{Error, Result};

use crossbeam::atomic::AtomicCell;
use log::{debug, warn};
use rand::Rng as _;
use std::collections::BTreeMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum reconnect backoff, doubled per consecutive failure.
const RECONNECT_BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Maximum reconnect backoff.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Maximum random jitter added to the reconnect backoff.
const RECONNECT_JITTER_MS: u64 = 250;

/// A response from a peer to an approval-gated request (standup or commit).
/// Valid only while the corresponding phase is in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerResponse {
    None,
    Approve,
    Deny,
}

/// A single peer in the cluster mesh. One per configured neighbor, living as
/// long as the node itself.
pub struct Peer {
    /// The peer's configured name.
    pub name: String,
    /// The peer's node address (host:port).
    pub host: String,
    /// A stable index, 1-based. 0 is reserved for "no peer".
    pub id: u64,
    /// Raw configuration parameters from the peer list.
    pub params: BTreeMap<String, String>,
    /// A permafollower never leads: it counts for commit approvals but not
    /// for elections.
    pub permafollower: bool,

    /// Whether the handshake completed in both directions: we received the
    /// peer's NODE_LOGIN and our outbound connection is up.
    logged_in: AtomicBool,
    /// Whether we received the peer's NODE_LOGIN on an accepted socket.
    got_login: AtomicBool,
    /// The peer's last advertised state.
    state: AtomicCell<State>,
    /// The peer's last advertised priority. -1 until known.
    priority: AtomicI32,
    /// Round-trip latency in microseconds, from PING/PONG. 0 until measured.
    latency: AtomicU64,
    /// Consecutive failed or lost connections, drives the backoff.
    failed_connections: AtomicU32,
    /// Don't redial before this instant.
    next_reconnect: AtomicCell<Option<Instant>>,
    /// An outbound dial is in flight on a connector thread.
    connecting: AtomicBool,
    /// The peer subscribed to our replication stream (leader side).
    subscribed: AtomicBool,
    /// The peer's response to our in-flight STANDUP, if any.
    standup_response: AtomicCell<PeerResponse>,
    /// The peer's response to our in-flight transaction, if any.
    transaction_response: AtomicCell<PeerResponse>,
    /// The peer's version string.
    version: Mutex<String>,
    /// The address where the peer accepts client commands.
    command_address: Mutex<String>,
    /// The peer's commit position. Count and hash are updated and read
    /// together; never touch one without the other.
    commit: Mutex<(u64, String)>,
    /// The outbound (send) socket, if connected.
    socket: Mutex<Option<TcpStream>>,
}

impl Peer {
    pub fn new(name: String, host: String, params: BTreeMap<String, String>, id: u64) -> Self {
        let permafollower = params.get("permafollower").map(|v| v == "true").unwrap_or(false);
        Self {
            name,
            host,
            id,
            params,
            permafollower,
            logged_in: AtomicBool::new(false),
            got_login: AtomicBool::new(false),
            state: AtomicCell::new(State::Unknown),
            priority: AtomicI32::new(-1),
            latency: AtomicU64::new(0),
            failed_connections: AtomicU32::new(0),
            next_reconnect: AtomicCell::new(None),
            connecting: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            standup_response: AtomicCell::new(PeerResponse::None),
            transaction_response: AtomicCell::new(PeerResponse::None),
            version: Mutex::new(String::new()),
            command_address: Mutex::new(String::new()),
            commit: Mutex::new((0, String::new())),
            socket: Mutex::new(None),
        }
    }

    /// Parses a semicolon-separated peer list of the form
    /// `host:port?name=NAME&priority=N&permafollower=true`. Names must be
    /// present and unique.
    pub fn parse_list(list: &str) -> Result<Vec<Peer>> {
        let mut peers = Vec::new();
        for spec in list.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (host, query) = spec
                .split_once('?')
                .ok_or_else::<Error, _>(|| errinput!("peer {spec} missing parameters"))?;
            if !host.contains(':') {
                return errinput!("peer address {host} missing port");
            }
            let mut params = BTreeMap::new();
            for pair in query.split('&').filter(|s| !s.is_empty()) {
                let (key, value) =
                    pair.split_once('=').ok_or_else::<Error, _>(|| errinput!("invalid peer parameter {pair}"))?;
                params.insert(key.to_string(), value.to_string());
            }
            let name = params
                .get("name")
                .cloned()
                .ok_or_else::<Error, _>(|| errinput!("peer {host} missing name parameter"))?;
            if peers.iter().any(|p: &Peer| p.name == name) {
                return errinput!("duplicate peer name {name}");
            }
            let id = peers.len() as u64 + 1;
            peers.push(Peer::new(name, host.to_string(), params, id));
        }
        Ok(peers)
    }

    /// Sends a message on the outbound socket. Thread-safe: replication
    /// workers use this to acknowledge transactions directly to the leader.
    /// A send failure tears the session down; the sync thread will schedule
    /// a reconnect.
    pub fn send_message(&self, message: &Message) -> Result<()> {
        let mut socket = self.socket.lock()?;
        let Some(stream) = socket.as_mut() else {
            return Err(crate::error::Error::IO(format!("peer {} not connected", self.name)));
        };
        debug!("->{{{}}} {message}", self.name);
        if let Err(err) = message.write_to(stream) {
            warn!("->{{{}}} send failed: {err}", self.name);
            let _ = stream.shutdown(Shutdown::Both);
            *socket = None;
            drop(socket);
            self.reset();
            return Err(err);
        }
        Ok(())
    }

    /// Installs a freshly connected outbound socket.
    pub fn set_socket(&self, stream: TcpStream) {
        *self.socket.lock().expect("lock poisoned") = Some(stream);
        self.connecting.store(false, Ordering::Release);
    }

    /// Returns true if the outbound socket is connected.
    pub fn connected(&self) -> bool {
        self.socket.lock().expect("lock poisoned").is_some()
    }

    /// Resets the session as if disconnected: closes the socket, clears all
    /// per-session scalars, and schedules the next reconnect with jittered
    /// exponential backoff.
    pub fn reset(&self) {
        if let Some(stream) = self.socket.lock().expect("lock poisoned").take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.logged_in.store(false, Ordering::Release);
        self.got_login.store(false, Ordering::Release);
        self.subscribed.store(false, Ordering::Release);
        self.standup_response.store(PeerResponse::None);
        self.transaction_response.store(PeerResponse::None);
        self.state.store(State::Searching);
        self.priority.store(-1, Ordering::Release);
        self.set_commit(0, String::new());
        let failed = self.failed_connections.fetch_add(1, Ordering::AcqRel);
        self.next_reconnect.store(Some(Instant::now() + Self::backoff(failed + 1)));
    }

    /// Computes the reconnect backoff for a failure count: exponential from
    /// the base, capped, with random jitter.
    fn backoff(failed_connections: u32) -> Duration {
        let exp = RECONNECT_BACKOFF_BASE
            .saturating_mul(1 << failed_connections.saturating_sub(1).min(10))
            .min(RECONNECT_BACKOFF_CAP);
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=RECONNECT_JITTER_MS))
    }

    /// Records a failed outbound dial and schedules the retry.
    pub fn connect_failed(&self) {
        self.connecting.store(false, Ordering::Release);
        let failed = self.failed_connections.fetch_add(1, Ordering::AcqRel);
        self.next_reconnect.store(Some(Instant::now() + Self::backoff(failed + 1)));
    }

    /// Returns true if an outbound dial should be started now.
    pub fn should_connect(&self, now: Instant) -> bool {
        !self.connected()
            && !self.connecting.load(Ordering::Acquire)
            && self.next_reconnect.load().map_or(true, |at| now >= at)
    }

    /// Marks an outbound dial as started.
    pub fn set_connecting(&self) {
        self.connecting.store(true, Ordering::Release);
    }

    /// The next scheduled reconnect, for the poll deadline.
    pub fn next_reconnect(&self) -> Option<Instant> {
        if self.connected() || self.connecting.load(Ordering::Acquire) {
            return None;
        }
        self.next_reconnect.load()
    }

    /// Records that the peer's NODE_LOGIN arrived, and recomputes login
    /// state. Returns true if the peer just became fully logged in.
    pub fn login(&self) -> bool {
        self.got_login.store(true, Ordering::Release);
        self.failed_connections.store(0, Ordering::Release);
        self.update_logged_in()
    }

    /// Recomputes the logged-in flag after either handshake half completes.
    /// Returns true if the peer just became fully logged in.
    pub fn update_logged_in(&self) -> bool {
        let now = self.got_login.load(Ordering::Acquire) && self.connected();
        !self.logged_in.swap(now, Ordering::AcqRel) && now
    }

    pub fn logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    /// Atomically sets the commit count and matching hash.
    pub fn set_commit(&self, count: u64, hash: String) {
        *self.commit.lock().expect("lock poisoned") = (count, hash);
    }

    /// Atomically gets the commit count and matching hash.
    pub fn get_commit(&self) -> (u64, String) {
        self.commit.lock().expect("lock poisoned").clone()
    }

    /// The peer's last advertised commit count.
    pub fn commit_count(&self) -> u64 {
        self.commit.lock().expect("lock poisoned").0
    }

    pub fn state(&self) -> State {
        self.state.load()
    }

    pub fn set_state(&self, state: State) {
        self.state.store(state);
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub fn latency(&self) -> u64 {
        self.latency.load(Ordering::Acquire)
    }

    pub fn set_latency(&self, micros: u64) {
        self.latency.store(micros, Ordering::Release);
    }

    pub fn subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::Release);
    }

    pub fn standup_response(&self) -> PeerResponse {
        self.standup_response.load()
    }

    pub fn set_standup_response(&self, response: PeerResponse) {
        self.standup_response.store(response);
    }

    pub fn transaction_response(&self) -> PeerResponse {
        self.transaction_response.load()
    }

    pub fn set_transaction_response(&self, response: PeerResponse) {
        self.transaction_response.store(response);
    }

    pub fn version(&self) -> String {
        self.version.lock().expect("lock poisoned").clone()
    }

    pub fn set_version(&self, version: String) {
        *self.version.lock().expect("lock poisoned") = version;
    }

    pub fn command_address(&self) -> String {
        self.command_address.lock().expect("lock poisoned").clone()
    }

    pub fn set_command_address(&self, address: String) {
        *self.command_address.lock().expect("lock poisoned") = address;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list() {
        let peers = Peer::parse_list(
            "10.0.0.1:9000?name=alpha&priority=100;\
             10.0.0.2:9000?name=beta&priority=50&permafollower=true",
        )
        .unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name, "alpha");
        assert_eq!(peers[0].host, "10.0.0.1:9000");
        assert_eq!(peers[0].id, 1);
        assert!(!peers[0].permafollower);
        assert_eq!(peers[1].name, "beta");
        assert_eq!(peers[1].id, 2);
        assert!(peers[1].permafollower);
        assert_eq!(peers[1].params.get("priority").unwrap(), "50");
    }

    #[test]
    fn parse_list_rejects_bad_specs() {
        assert!(Peer::parse_list("10.0.0.1:9000").is_err()); // no params
        assert!(Peer::parse_list("10.0.0.1:9000?priority=1").is_err()); // no name
        assert!(Peer::parse_list("10.0.0.1?name=a").is_err()); // no port
        assert!(Peer::parse_list("h:1?name=a;h:2?name=a").is_err()); // duplicate
        assert_eq!(Peer::parse_list("").unwrap().len(), 0);
    }

    #[test]
    fn commit_count_and_hash_are_atomic_together() {
        let peer = Peer::new("a".into(), "h:1".into(), BTreeMap::new(), 1);
        peer.set_commit(3, "abc".into());
        assert_eq!(peer.get_commit(), (3, "abc".to_string()));
        assert_eq!(peer.commit_count(), 3);
    }

    #[test]
    fn reset_clears_session_state() {
        let peer = Peer::new("a".into(), "h:1".into(), BTreeMap::new(), 1);
        peer.login();
        peer.set_subscribed(true);
        peer.set_standup_response(PeerResponse::Approve);
        peer.set_commit(5, "h5".into());
        peer.reset();

        assert!(!peer.logged_in());
        assert!(!peer.subscribed());
        assert_eq!(peer.standup_response(), PeerResponse::None);
        assert_eq!(peer.state(), State::Searching);
        assert_eq!(peer.get_commit(), (0, String::new()));
        // A reconnect is scheduled with backoff.
        assert!(peer.next_reconnect().is_some());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let low = Peer::backoff(1);
        let high = Peer::backoff(20);
        assert!(low >= RECONNECT_BACKOFF_BASE);
        assert!(high >= RECONNECT_BACKOFF_CAP);
        assert!(high <= RECONNECT_BACKOFF_CAP + Duration::from_millis(RECONNECT_JITTER_MS));
    }

    #[test]
    fn login_requires_both_halves() {
        let peer = Peer::new("a".into(), "h:1".into(), BTreeMap::new(), 1);
        // Login received but no outbound socket: not logged in.
        assert!(!peer.login());
        assert!(!peer.logged_in());
    }
}
