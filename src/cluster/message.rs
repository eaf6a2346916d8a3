//! The wire codec: named messages with a string→string header table and an
//! optional opaque body, framed with a u32 length prefix and encoded with
//! Bincode. Receivers read whole frames off the socket; a frame that can't
//! be parsed disconnects the peer.

use super::node::{ConsistencyLevel, State};
use super::peer::PeerResponse;
use crate::encoding::bincode;
use crate::errdata;
use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// The maximum wire frame size. Catch-up responses batch many transactions,
/// so this is generous, but a corrupt length prefix must not allocate
/// unbounded memory.
const MAX_FRAME_SIZE: usize = 64 << 20;

// Message names.
pub const NODE_LOGIN: &str = "NODE_LOGIN";
pub const STATE: &str = "STATE";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const STANDUP: &str = "STANDUP";
pub const STANDUP_RESPONSE: &str = "STANDUP_RESPONSE";
pub const SUBSCRIBE: &str = "SUBSCRIBE";
pub const SUBSCRIPTION_APPROVED: &str = "SUBSCRIPTION_APPROVED";
pub const SUBSCRIPTION_DENIED: &str = "SUBSCRIPTION_DENIED";
pub const BEGIN_TRANSACTION: &str = "BEGIN_TRANSACTION";
pub const APPROVE_TRANSACTION: &str = "APPROVE_TRANSACTION";
pub const DENY_TRANSACTION: &str = "DENY_TRANSACTION";
pub const COMMIT_TRANSACTION: &str = "COMMIT_TRANSACTION";
pub const ROLLBACK_TRANSACTION: &str = "ROLLBACK_TRANSACTION";
pub const SYNCHRONIZE: &str = "SYNCHRONIZE";
pub const SYNCHRONIZE_RESPONSE: &str = "SYNCHRONIZE_RESPONSE";
pub const ESCALATE: &str = "ESCALATE";
pub const ESCALATE_RESPONSE: &str = "ESCALATE_RESPONSE";

// Header keys.
pub const NAME: &str = "Name";
pub const VERSION: &str = "Version";
pub const APPROVE_VERSION: &str = "ApproveVersion";
pub const PRIORITY: &str = "Priority";
pub const PERMAFOLLOWER: &str = "Permafollower";
pub const COMMIT_COUNT: &str = "CommitCount";
pub const HASH: &str = "Hash";
pub const NEW_COUNT: &str = "NewCount";
pub const NEW_HASH: &str = "NewHash";
pub const ID: &str = "ID";
pub const RESPONSE: &str = "Response";
pub const REASON: &str = "Reason";
pub const NODE_STATE: &str = "State";
pub const STATE_CHANGE_COUNT: &str = "StateChangeCount";
pub const CONSISTENCY: &str = "Consistency";
pub const COMMAND_ADDRESS: &str = "CommandAddress";
pub const TIMESTAMP: &str = "Timestamp";

/// A wire message: a name, a string header table, and an optional body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(name: &str) -> Self {
        Message { name: name.into(), headers: BTreeMap::new(), body: Vec::new() }
    }

    /// Builder-style header setter.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Builder-style body setter.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.headers.insert(key.into(), value.to_string());
    }

    /// Fetches a header, or None if absent.
    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Fetches a required header.
    pub fn get(&self, key: &str) -> Result<&str> {
        self.get_opt(key).ok_or_else(|| errdata!("{}: missing header {key}", self.name))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64> {
        self.get(key)?.parse().map_err(|_| errdata!("{}: invalid {key}", self.name))
    }

    pub fn get_i32(&self, key: &str) -> Result<i32> {
        self.get(key)?.parse().map_err(|_| errdata!("{}: invalid {key}", self.name))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.get_opt(key) {
            None | Some("false") => Ok(false),
            Some("true") => Ok(true),
            Some(v) => errdata!("{}: invalid {key} {v}", self.name),
        }
    }

    pub fn get_state(&self, key: &str) -> Result<State> {
        self.get(key)?.parse()
    }

    pub fn get_response(&self, key: &str) -> Result<PeerResponse> {
        self.get(key)?.parse()
    }

    pub fn get_consistency(&self, key: &str) -> Result<ConsistencyLevel> {
        self.get(key)?.parse()
    }

    /// Writes the message as a length-prefixed frame.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let frame = bincode::serialize(self)?;
        if frame.len() > MAX_FRAME_SIZE {
            return errdata!("{}: frame size {} exceeds maximum", self.name, frame.len());
        }
        writer.write_all(&(frame.len() as u32).to_be_bytes())?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a length-prefixed frame, or None on a clean close (EOF before
    /// the first length byte). EOF mid-frame is an error.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut len = [0u8; 4];
        let n = loop {
            match reader.read(&mut len) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut len[n..])?;
        let size = u32::from_be_bytes(len) as usize;
        if size > MAX_FRAME_SIZE {
            return errdata!("frame size {size} exceeds maximum");
        }
        let mut frame = vec![0u8; size];
        reader.read_exact(&mut frame)?;
        Ok(Some(bincode::deserialize(&frame)?))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.headers {
            write!(f, " {key}={value}")?;
        }
        if !self.body.is_empty() {
            write!(f, " body={}B", self.body.len())?;
        }
        Ok(())
    }
}

impl std::str::FromStr for PeerResponse {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NONE" => Ok(PeerResponse::None),
            "APPROVE" => Ok(PeerResponse::Approve),
            "DENY" => Ok(PeerResponse::Deny),
            s => errdata!("invalid response {s}"),
        }
    }
}

impl std::fmt::Display for PeerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerResponse::None => write!(f, "NONE"),
            PeerResponse::Approve => write!(f, "APPROVE"),
            PeerResponse::Deny => write!(f, "DENY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_name_headers_body() {
        let message = Message::new(BEGIN_TRANSACTION)
            .with(NEW_COUNT, 7)
            .with(NEW_HASH, "abc123")
            .with(ID, 7)
            .with(CONSISTENCY, ConsistencyLevel::Quorum)
            .with_body(vec![0x00, 0x01, 0xff]);

        let mut buffer = Vec::new();
        message.write_to(&mut buffer).unwrap();
        let decoded = Message::read_from(&mut buffer.as_slice()).unwrap().unwrap();

        assert_eq!(message, decoded);
        assert_eq!(decoded.get_u64(NEW_COUNT).unwrap(), 7);
        assert_eq!(decoded.get(NEW_HASH).unwrap(), "abc123");
        assert_eq!(decoded.get_consistency(CONSISTENCY).unwrap(), ConsistencyLevel::Quorum);
        assert_eq!(decoded.body, vec![0x00, 0x01, 0xff]);
    }

    #[test]
    fn read_clean_eof_returns_none() {
        let empty: &[u8] = &[];
        assert_eq!(Message::read_from(&mut &empty[..]).unwrap(), None);
    }

    #[test]
    fn read_truncated_frame_errors() {
        let message = Message::new(PING).with(TIMESTAMP, 12345);
        let mut buffer = Vec::new();
        message.write_to(&mut buffer).unwrap();
        buffer.truncate(buffer.len() - 1);
        assert!(Message::read_from(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn read_oversized_frame_errors() {
        let mut buffer = Vec::new();
        buffer.extend(u32::MAX.to_be_bytes());
        buffer.extend([0u8; 16]);
        assert!(Message::read_from(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn multiple_frames_stream() {
        let mut buffer = Vec::new();
        Message::new(PING).with(TIMESTAMP, 1).write_to(&mut buffer).unwrap();
        Message::new(PONG).with(TIMESTAMP, 1).write_to(&mut buffer).unwrap();
        let mut reader = buffer.as_slice();
        assert_eq!(Message::read_from(&mut reader).unwrap().unwrap().name, PING);
        assert_eq!(Message::read_from(&mut reader).unwrap().unwrap().name, PONG);
        assert_eq!(Message::read_from(&mut reader).unwrap(), None);
    }

    #[test]
    fn missing_header_errors() {
        let message = Message::new(STANDUP);
        assert!(message.get_u64(STATE_CHANGE_COUNT).is_err());
        assert_eq!(message.get_opt(STATE_CHANGE_COUNT), None);
        assert!(!message.get_bool(PERMAFOLLOWER).unwrap());
    }
}
