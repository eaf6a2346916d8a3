//! The clustered replication core: a leader/follower mesh of nodes that
//! elect a leader by priority, stream a totally ordered commit log, and
//! apply it with configurable durability.

pub mod message;
mod node;
mod notifier;
mod peer;
mod replication;
mod transport;

pub use message::Message;
pub use node::{
    Command, CommitState, ConsistencyLevel, Handle, Node, NodeOptions, PeerStatus, State, Status,
};
pub use notifier::{SequentialNotifier, WaitResult};
pub use peer::{Peer, PeerResponse};
