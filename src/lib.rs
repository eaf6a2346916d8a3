#![warn(clippy::all)]
#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]

pub mod cluster;
pub mod encoding;
pub mod engine;
pub mod error;

pub use cluster::{ConsistencyLevel, Handle, Node, NodeOptions, State};
pub use error::{Error, Result};
