//! The connection manager. Owns the listening port and all inbound (read)
//! sockets, and dials outbound connections for peers. Each inbound socket
//! gets a reader thread that decodes length-prefixed messages into the sync
//! thread's event channel; outbound dials run on short-lived connector
//! threads so the sync thread never blocks on connect. The sync thread's
//! blocking point is the event channel itself, which doubles as the poll
//! interrupter for locally committed transactions.

use super::message::Message;
use crate::error::Result;

use crossbeam::channel::Sender;
use log::{debug, warn};
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs as _};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outbound dial timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Outbound write timeout; a peer that can't drain a send this long is torn
/// down by the failed write.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Receive timeout for normal operation. Peers ping more often than this.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Receive timeout while the node is catching up: bulk synchronization
/// responses can legitimately take much longer to produce and apply.
pub const SYNCHRONIZING_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies an accepted (read) socket for the lifetime of its connection.
pub type SocketId = u64;

/// An event delivered to the sync thread's poll loop.
pub enum Event {
    /// An outbound dial to the given peer index completed.
    Connected { peer: usize, socket: TcpStream },
    /// An outbound dial to the given peer index failed.
    ConnectFailed { peer: usize },
    /// A message arrived on an accepted socket.
    Message { socket: SocketId, message: Message },
    /// An accepted socket closed (cleanly or not).
    Closed { socket: SocketId },
    /// Another thread committed a transaction locally; the leader should
    /// stream it to subscribed followers.
    LocalCommit,
    /// Wake the poll loop to re-run update(), e.g. for a requested commit
    /// or shutdown.
    Wake,
}

/// The connection manager.
pub struct Transport {
    local_addr: SocketAddr,
    event_tx: Sender<Event>,
    shutdown: Arc<AtomicBool>,
    /// Write halves of the accepted sockets, so they can be force-closed.
    sockets: Arc<Mutex<HashMap<SocketId, TcpStream>>>,
    /// The receive timeout applied by reader threads before every read.
    recv_timeout: Arc<Mutex<Duration>>,
}

impl Transport {
    /// Starts accepting connections on the given listener, delivering events
    /// to the given channel.
    pub fn serve(listener: TcpListener, event_tx: Sender<Event>) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let sockets = Arc::new(Mutex::new(HashMap::new()));
        let recv_timeout = Arc::new(Mutex::new(RECV_TIMEOUT));

        let transport = Self {
            local_addr,
            event_tx: event_tx.clone(),
            shutdown: shutdown.clone(),
            sockets: sockets.clone(),
            recv_timeout: recv_timeout.clone(),
        };
        std::thread::spawn(move || {
            Self::accept_loop(listener, event_tx, shutdown, sockets, recv_timeout)
        });
        Ok(transport)
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts inbound connections, spawning a reader thread per socket.
    fn accept_loop(
        listener: TcpListener,
        event_tx: Sender<Event>,
        shutdown: Arc<AtomicBool>,
        sockets: Arc<Mutex<HashMap<SocketId, TcpStream>>>,
        recv_timeout: Arc<Mutex<Duration>>,
    ) {
        static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);
        for stream in listener.incoming() {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            };
            let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
            debug!("accepted socket {id} from {:?}", stream.peer_addr());
            if let Ok(clone) = stream.try_clone() {
                sockets.lock().expect("lock poisoned").insert(id, clone);
            }
            let event_tx = event_tx.clone();
            let sockets = sockets.clone();
            let recv_timeout = recv_timeout.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                Self::read_loop(id, stream, &event_tx, &shutdown, &recv_timeout);
                sockets.lock().expect("lock poisoned").remove(&id);
                let _ = event_tx.send(Event::Closed { socket: id });
            });
        }
        debug!("listener on {:?} stopped", listener.local_addr());
    }

    /// Reads messages off one accepted socket until it closes, errors, or
    /// exceeds the receive timeout.
    fn read_loop(
        id: SocketId,
        mut stream: TcpStream,
        event_tx: &Sender<Event>,
        shutdown: &AtomicBool,
        recv_timeout: &Mutex<Duration>,
    ) {
        loop {
            let timeout = *recv_timeout.lock().expect("lock poisoned");
            if stream.set_read_timeout(Some(timeout)).is_err() {
                break;
            }
            match Message::read_from(&mut stream) {
                Ok(Some(message)) => {
                    if event_tx.send(Event::Message { socket: id, message }).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("socket {id} closed by peer");
                    break;
                }
                Err(err) => {
                    if !shutdown.load(Ordering::Acquire) {
                        debug!("socket {id} read failed: {err}");
                    }
                    break;
                }
            }
        }
        let _ = stream.shutdown(Shutdown::Both);
    }

    /// Dials a peer on a connector thread, delivering Connected or
    /// ConnectFailed when done.
    pub fn connect(&self, peer: usize, host: String) {
        let event_tx = self.event_tx.clone();
        std::thread::spawn(move || {
            let event = match Self::dial(&host) {
                Ok(socket) => Event::Connected { peer, socket },
                Err(err) => {
                    debug!("connect to {host} failed: {err}");
                    Event::ConnectFailed { peer }
                }
            };
            let _ = event_tx.send(event);
        });
    }

    fn dial(host: &str) -> Result<TcpStream> {
        let addr = host
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| crate::error::Error::IO(format!("can't resolve {host}")))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(SEND_TIMEOUT))?;
        Ok(stream)
    }

    /// Sets the receive timeout applied to all inbound sockets.
    pub fn set_recv_timeout(&self, timeout: Duration) {
        *self.recv_timeout.lock().expect("lock poisoned") = timeout;
    }

    /// Force-closes one accepted socket (e.g. a misbehaving or stale one).
    /// Its reader thread will emit Closed.
    pub fn close_socket(&self, id: SocketId) {
        if let Some(stream) = self.sockets.lock().expect("lock poisoned").get(&id) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// The number of open accepted sockets.
    pub fn open_sockets(&self) -> usize {
        self.sockets.lock().expect("lock poisoned").len()
    }

    /// Stops accepting, and closes every accepted socket. Reader threads
    /// drain out on their own.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Unblock the acceptor with a throwaway connection.
        let _ = TcpStream::connect_timeout(&self.local_addr, Duration::from_millis(100));
        for (_, stream) in self.sockets.lock().expect("lock poisoned").drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::message::{self, Message};

    #[test]
    fn accepts_and_delivers_messages() {
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let transport = Transport::serve(listener, event_tx).unwrap();

        let mut client = TcpStream::connect(transport.local_addr()).unwrap();
        let ping = Message::new(message::PING).with(message::TIMESTAMP, 42);
        ping.write_to(&mut client).unwrap();

        match event_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Message { message, .. } => assert_eq!(message, ping),
            _ => panic!("expected message event"),
        }

        // A clean close delivers Closed.
        drop(client);
        match event_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Closed { .. } => {}
            _ => panic!("expected closed event"),
        }
        assert_eq!(transport.open_sockets(), 0);
        transport.shutdown();
    }

    #[test]
    fn garbage_closes_socket() {
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let transport = Transport::serve(listener, event_tx).unwrap();

        use std::io::Write as _;
        let mut client = TcpStream::connect(transport.local_addr()).unwrap();
        // A huge length prefix must not be honored.
        client.write_all(&u32::MAX.to_be_bytes()).unwrap();
        client.write_all(&[0u8; 64]).unwrap();

        match event_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Closed { .. } => {}
            _ => panic!("expected closed event"),
        }
        transport.shutdown();
    }

    #[test]
    fn connect_failure_reports() {
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let transport = Transport::serve(listener, event_tx).unwrap();

        // A port nobody listens on: grab one and release it.
        let free = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        transport.connect(3, free.to_string());
        match event_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::ConnectFailed { peer } => assert_eq!(peer, 3),
            _ => panic!("expected connect failure"),
        }
        transport.shutdown();
    }
}
