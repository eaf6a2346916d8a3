//! End-to-end cluster tests: real nodes on real localhost TCP connections,
//! each driven by its own sync thread, with assertions polled until they
//! hold or a timeout expires.

use quorumdb::cluster::Command;
use quorumdb::engine::memory::{put, Mutation};
use quorumdb::engine::{Database as _, Memory};
use quorumdb::{ConsistencyLevel, Handle, Node, NodeOptions, State};

use crossbeam::channel::Receiver;
use pretty_assertions::assert_eq;
use std::net::TcpListener;
use std::time::{Duration, Instant};

/// How long SEARCHING waits before proceeding without every peer.
const FIRST_TIMEOUT: Duration = Duration::from_secs(1);
/// How long assertions are polled before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// One configured cluster member. Its listener is bound up front so peers
/// can be configured with real addresses even if the node starts later.
struct TestNode {
    name: String,
    options: NodeOptions,
    listener: Option<TcpListener>,
    memory: Memory,
    handle: Option<Handle>,
    server_rx: Option<Receiver<Command>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// A test cluster of nodes in one process.
struct TestCluster {
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Configures a cluster from (name, priority) pairs, priority 0 meaning
    /// permafollower, without starting any node.
    fn configure(members: &[(&str, i32)]) -> Self {
        let listeners: Vec<TcpListener> =
            members.iter().map(|_| TcpListener::bind("127.0.0.1:0").unwrap()).collect();
        let addrs: Vec<String> =
            listeners.iter().map(|l| l.local_addr().unwrap().to_string()).collect();

        let nodes = members
            .iter()
            .zip(listeners)
            .enumerate()
            .map(|(i, (&(name, priority), listener))| {
                let peers = members
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(j, (peer_name, peer_priority))| {
                        let mut spec =
                            format!("{}?name={peer_name}&priority={peer_priority}", addrs[j]);
                        if *peer_priority == 0 {
                            spec.push_str("&permafollower=true");
                        }
                        spec
                    })
                    .collect::<Vec<_>>()
                    .join(";");
                let options = NodeOptions {
                    name: name.into(),
                    version: "test".into(),
                    priority,
                    peers,
                    first_timeout: FIRST_TIMEOUT,
                    use_parallel_replication: true,
                    command_address: format!("{name}:cmd"),
                };
                TestNode {
                    name: name.into(),
                    options,
                    listener: Some(listener),
                    memory: Memory::new(),
                    handle: None,
                    server_rx: None,
                    thread: None,
                }
            })
            .collect();
        Self { nodes }
    }

    /// Configures and starts every member.
    fn start_all(members: &[(&str, i32)]) -> Self {
        let mut cluster = Self::configure(members);
        for i in 0..cluster.nodes.len() {
            cluster.start_index(i);
        }
        cluster
    }

    /// Starts a configured member by name.
    fn start(&mut self, name: &str) {
        let index = self.index(name);
        self.start_index(index);
    }

    fn start_index(&mut self, index: usize) {
        let test_node = &mut self.nodes[index];
        assert!(test_node.thread.is_none(), "{} already started", test_node.name);
        let listener = test_node.listener.take().expect("listener already consumed");
        let (server_tx, server_rx) = crossbeam::channel::unbounded();
        let mut node = Node::new(
            test_node.options.clone(),
            listener,
            test_node.memory.pool(8),
            server_tx,
        )
        .unwrap();
        test_node.handle = Some(node.handle());
        test_node.server_rx = Some(server_rx);
        let name = test_node.name.clone();
        test_node.thread = Some(std::thread::spawn(move || loop {
            if node.shutdown_complete() {
                break;
            }
            if let Err(err) = node.tick() {
                eprintln!("[{name}] tick error: {err}");
            }
        }));
    }

    /// Stops a running member, joining its sync thread.
    fn stop(&mut self, name: &str) {
        let index = self.index(name);
        let test_node = &mut self.nodes[index];
        if let Some(handle) = test_node.handle.take() {
            handle.begin_shutdown(Duration::from_secs(2)).ok();
        }
        if let Some(thread) = test_node.thread.take() {
            thread.join().expect("sync thread panicked");
        }
    }

    fn index(&self, name: &str) -> usize {
        self.nodes.iter().position(|n| n.name == name).expect("unknown node")
    }

    fn node(&self, name: &str) -> &TestNode {
        &self.nodes[self.index(name)]
    }

    fn handle(&self, name: &str) -> &Handle {
        self.node(name).handle.as_ref().expect("node not started")
    }

    fn memory(&self, name: &str) -> &Memory {
        &self.node(name).memory
    }

    /// Polls until the condition holds, panicking with cluster status on
    /// timeout.
    fn wait_until(&self, what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let status: Vec<_> = self
            .nodes
            .iter()
            .filter_map(|n| n.handle.as_ref())
            .map(|h| format!("{:?}", h.status()))
            .collect();
        panic!("timed out waiting for {what}; cluster status:\n{}", status.join("\n"));
    }

    /// Waits until the named node is LEADING and every other running node is
    /// FOLLOWING it.
    fn wait_for_leader(&self, leader: &str) {
        self.wait_until(&format!("{leader} to lead"), || {
            self.nodes.iter().filter(|n| n.handle.is_some()).all(|n| {
                let handle = n.handle.as_ref().unwrap();
                if n.name == leader {
                    handle.state() == State::Leading
                } else {
                    handle.state() == State::Following
                        && handle.leader_name().as_deref() == Some(leader)
                }
            })
        });
    }

    /// Waits until every running node has the given commit count, with
    /// matching hashes.
    fn wait_for_commit(&self, count: u64) {
        self.wait_until(&format!("commit count {count} everywhere"), || {
            self.nodes
                .iter()
                .filter(|n| n.thread.is_some())
                .all(|n| n.memory.commit_count() == count)
        });
        let hashes: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.thread.is_some())
            .map(|n| n.memory.commit_hash())
            .collect();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]), "divergent hashes: {hashes:?}");
    }

    /// Executes a write on the named node (which must be the leader) and
    /// waits for the commit to finish, returning whether it succeeded.
    fn write(&self, name: &str, key: &str, value: &[u8], consistency: ConsistencyLevel) -> bool {
        let handle = self.handle(name);
        {
            let db = handle.db();
            let mut db = db.lock().unwrap();
            db.begin().unwrap();
            db.execute(&put(key, value)).unwrap();
        }
        handle.start_commit(consistency).unwrap();
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while handle.commit_in_progress() {
            assert!(Instant::now() < deadline, "commit timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.commit_succeeded()
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let names: Vec<String> = self.nodes.iter().map(|n| n.name.clone()).collect();
        for name in names {
            if self.node(&name).thread.is_some() {
                self.stop(&name);
            }
        }
    }
}

/// Commits the given writes directly to a Memory journal, outside any node.
fn seed(memory: &Memory, writes: &[(&str, &[u8])]) {
    let mut db = memory.handle();
    for (key, value) in writes {
        db.begin().unwrap();
        db.execute(&put(key, value)).unwrap();
        let prepared = db.prepare().unwrap();
        db.commit(&prepared.hash).unwrap();
    }
}

#[test]
fn three_node_election() {
    let cluster = TestCluster::start_all(&[("a", 100), ("b", 50), ("c", 10)]);
    cluster.wait_for_leader("a");

    assert_eq!(cluster.handle("a").state(), State::Leading);
    assert_eq!(cluster.handle("b").state(), State::Following);
    assert_eq!(cluster.handle("c").state(), State::Following);
    assert_eq!(cluster.handle("b").leader_name().as_deref(), Some("a"));
    assert_eq!(cluster.handle("c").leader_name().as_deref(), Some("a"));
    assert_eq!(cluster.handle("b").leader_state(), State::Leading);
    assert_eq!(cluster.handle("b").leader_version().as_deref(), Some("test"));
    // The leader advertises its command address to followers.
    assert_eq!(cluster.handle("c").leader_command_address().as_deref(), Some("a:cmd"));
}

#[test]
fn quorum_commit_replicates() {
    let cluster = TestCluster::start_all(&[("a", 100), ("b", 50), ("c", 10)]);
    cluster.wait_for_leader("a");

    assert!(cluster.write("a", "key", b"value", ConsistencyLevel::Quorum));
    cluster.wait_for_commit(1);
    for name in ["a", "b", "c"] {
        assert_eq!(cluster.memory(name).get("key"), Some(b"value".to_vec()));
    }
}

#[test]
fn one_commit_replicates() {
    let cluster = TestCluster::start_all(&[("a", 100), ("b", 50)]);
    cluster.wait_for_leader("a");

    assert!(cluster.write("a", "key", b"value", ConsistencyLevel::One));
    cluster.wait_for_commit(1);
}

#[test]
fn follower_lag_and_resync() {
    // a and b run and commit ten transactions before c ever starts.
    let mut cluster = TestCluster::configure(&[("a", 100), ("b", 50), ("c", 10)]);
    cluster.start("a");
    cluster.start("b");
    cluster.wait_for_leader("a");
    for i in 0..10 {
        assert!(cluster.write("a", &format!("key{i}"), b"v", ConsistencyLevel::Quorum));
    }

    // c comes up lagging, synchronizes from the freshest peer, and follows.
    cluster.start("c");
    cluster.wait_until("c to follow", || cluster.handle("c").state() == State::Following);
    cluster.wait_for_commit(10);
    assert_eq!(cluster.memory("c").get("key9"), Some(b"v".to_vec()));
    assert_eq!(cluster.handle("c").leader_name().as_deref(), Some("a"));
}

#[test]
fn leader_failover() {
    let mut cluster = TestCluster::start_all(&[("a", 100), ("b", 50), ("c", 10)]);
    cluster.wait_for_leader("a");
    assert!(cluster.write("a", "before", b"1", ConsistencyLevel::Quorum));
    cluster.wait_for_commit(1);

    // Kill the leader. The next-highest priority node takes over.
    cluster.stop("a");
    cluster.wait_until("b to lead", || {
        cluster.handle("b").state() == State::Leading
            && cluster.handle("c").state() == State::Following
            && cluster.handle("c").leader_name().as_deref() == Some("b")
    });

    // The new leader commits.
    assert!(cluster.write("b", "after", b"2", ConsistencyLevel::Quorum));
    cluster.wait_until("replication to c", || cluster.memory("c").commit_count() == 2);
    assert_eq!(cluster.memory("c").get("after"), Some(b"2".to_vec()));
}

#[test]
fn parallel_replication_with_conflicts() {
    let cluster = TestCluster::start_all(&[("a", 100), ("b", 50), ("c", 10)]);
    cluster.wait_for_leader("a");

    // A run of back-to-back ASYNC commits against the same row: followers
    // execute them in parallel, so later tickets regularly conflict and
    // re-execute once their predecessors commit.
    for i in 0..20u32 {
        assert!(cluster.write("a", "row", &i.to_be_bytes(), ConsistencyLevel::Async));
    }
    cluster.wait_for_commit(20);
    for name in ["a", "b", "c"] {
        assert_eq!(cluster.memory(name).get("row"), Some(19u32.to_be_bytes().to_vec()));
    }
}

#[test]
fn escalation() {
    let cluster = TestCluster::start_all(&[("a", 100), ("b", 50), ("c", 10)]);
    cluster.wait_for_leader("a");

    // A write command escalated from follower c executes on leader a and
    // comes back completed.
    let command = Command::new(put("escalated", b"by-c"), ConsistencyLevel::Quorum);
    let id = command.id.clone();
    cluster.handle("c").escalate_command(command, false).unwrap();

    let completed = cluster
        .node("c")
        .server_rx
        .as_ref()
        .unwrap()
        .recv_timeout(WAIT_TIMEOUT)
        .expect("no escalation response");
    assert_eq!(completed.id, id);
    assert!(completed.complete);
    assert_eq!(completed.result, Some(Ok(1)));
    assert!(cluster.handle("c").escalated_commands().is_empty());

    cluster.wait_for_commit(1);
    assert_eq!(cluster.memory("c").get("escalated"), Some(b"by-c".to_vec()));
}

#[test]
fn permafollower_never_leads() {
    // Two nodes, one permafollower: the elector always leads, alone if need
    // be, and quorum commits still replicate through the permafollower.
    let cluster = TestCluster::start_all(&[("d", 100), ("p", 0)]);
    cluster.wait_for_leader("d");
    assert_eq!(cluster.handle("p").state(), State::Following);

    assert!(cluster.write("d", "key", b"value", ConsistencyLevel::Quorum));
    cluster.wait_for_commit(1);
    assert_eq!(cluster.memory("p").get("key"), Some(b"value".to_vec()));
}

#[test]
fn rejoining_peer_with_higher_commit_takes_over() {
    // All three journals share a three-commit prefix; a's extends two
    // commits further. b and c elect b first, then a joins ahead of the
    // leader: b stands down and everyone converges on a's log.
    let mut cluster = TestCluster::configure(&[("a", 100), ("b", 50), ("c", 10)]);
    let shared: Vec<(&str, &[u8])> =
        vec![("s1", b"1"), ("s2", b"2"), ("s3", b"3")];
    for name in ["a", "b", "c"] {
        seed(cluster.memory(name), &shared);
    }
    seed(cluster.memory("a"), &[("a4", b"4"), ("a5", b"5")]);

    cluster.start("b");
    cluster.start("c");
    cluster.wait_until("b to lead", || cluster.handle("b").state() == State::Leading);

    cluster.start("a");
    cluster.wait_for_leader("a");
    cluster.wait_for_commit(5);
    assert_eq!(cluster.memory("b").get("a5"), Some(b"5".to_vec()));
    assert_eq!(cluster.memory("c").get("a5"), Some(b"5".to_vec()));
}

#[test]
fn serial_replication() {
    // The same pipeline with parallel replication disabled on the follower.
    let mut cluster = TestCluster::configure(&[("a", 100), ("b", 50)]);
    cluster.nodes[1].options.use_parallel_replication = false;
    cluster.start("a");
    cluster.start("b");
    cluster.wait_for_leader("a");

    for i in 0..5 {
        assert!(cluster.write("a", &format!("key{i}"), b"v", ConsistencyLevel::Quorum));
    }
    cluster.wait_for_commit(5);
    assert_eq!(cluster.memory("b").get("key4"), Some(b"v".to_vec()));
}

#[test]
fn notify_commit_streams_external_writes() {
    // A transaction committed directly through the pool (outside
    // start_commit) reaches followers once the leader is notified.
    let cluster = TestCluster::start_all(&[("a", 100), ("b", 50)]);
    cluster.wait_for_leader("a");

    seed(cluster.memory("a"), &[("external", b"x")]);
    cluster.handle("a").notify_commit().unwrap();
    cluster.wait_for_commit(1);
    assert_eq!(cluster.memory("b").get("external"), Some(b"x".to_vec()));
}

#[test]
fn graceful_shutdown() {
    let mut cluster = TestCluster::start_all(&[("a", 100), ("b", 50), ("c", 10)]);
    cluster.wait_for_leader("a");
    assert!(cluster.write("a", "key", b"value", ConsistencyLevel::Quorum));

    // Followers drain out, then the leader stands down and closes.
    cluster.stop("c");
    cluster.stop("b");
    cluster.stop("a");
}

#[test]
fn multi_statement_transaction_replicates() {
    let cluster = TestCluster::start_all(&[("a", 100), ("b", 50)]);
    cluster.wait_for_leader("a");

    let handle = cluster.handle("a");
    {
        let db = handle.db();
        let mut db = db.lock().unwrap();
        db.begin().unwrap();
        db.execute(&put("first", b"1")).unwrap();
        db.execute(&put("second", b"2")).unwrap();
        db.execute(
            &quorumdb::engine::memory::query(&[Mutation::Delete { key: "first".into() }]).unwrap(),
        )
        .unwrap();
    }
    handle.start_commit(ConsistencyLevel::Quorum).unwrap();
    cluster.wait_until("commit to finish", || !handle.commit_in_progress());
    assert!(handle.commit_succeeded());

    cluster.wait_for_commit(1);
    assert_eq!(cluster.memory("b").get("first"), None);
    assert_eq!(cluster.memory("b").get("second"), Some(b"2".to_vec()));
}
