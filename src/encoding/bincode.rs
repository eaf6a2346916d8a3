//! Bincode is used to encode values, both in the replication journal and the
//! quorumdb network protocol. It is a Rust-specific encoding that depends on
//! the internal data structures being stable, but it's sufficient here. See:
//! https://github.com/bincode-org/bincode
//!
//! This module wraps the standard bincode crate to change the default options,
//! in particular to use variable-length rather than fixed-length integers.
//! Confusingly, upstream bincode::(de)serialize uses different options (fixed)
//! than DefaultOptions (variable) -- this module always uses DefaultOptions.
//!
//! Wire messages are framed with an explicit length prefix (see
//! cluster::message), so only the buffer-based entry points are needed here.

use crate::error::Result;

use bincode::Options;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Serializes a value using Bincode.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode().serialize(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let value = (1u64, "leader".to_string(), vec![0x01u8, 0x02]);
        let bytes = serialize(&value).unwrap();
        let decoded: (u64, String, Vec<u8>) = deserialize(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn variable_length_integers() {
        // Small integers must encode compactly, they dominate the headers.
        assert_eq!(serialize(&1u64).unwrap().len(), 1);
    }
}
