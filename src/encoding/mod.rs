//! Binary data encodings.
//!
//! - bincode: used for wire messages, journal query blobs, and escalated
//!   commands.
pub mod bincode;
