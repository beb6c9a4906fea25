//! Structural value codec
//!
//! Application values are `serde_json::Value`s. The codec turns them into
//! the bytes that follow a record header or sit at the tail of an audit
//! entry. Encoded output never starts with a byte below 32 or with 66, so a
//! reader can tell header bytes from value bytes by the first byte alone.
//!
//! Objects whose key set matches a registered structure can be written in a
//! compact form that only a holder of the same structure dictionary can
//! decode. Replication ships the dictionary to peers per table.

mod errors;
mod json;

pub use errors::{CodecError, CodecResult};
pub use json::{JsonCodec, StructureDictionary, COMPACT_MARKER};

use serde_json::Value;

/// Encoder/decoder for application values.
pub trait ValueCodec: Send + Sync {
    /// Append the encoding of `value` to `out`. Bytes already in `out` are
    /// reserved header space and are left untouched.
    fn encode_into(&self, value: &Value, out: &mut Vec<u8>);

    /// Decode a value. `structures` overrides the codec's own dictionary,
    /// which is how a peer's compact payloads are read.
    fn decode(&self, bytes: &[u8], structures: Option<&StructureDictionary>) -> CodecResult<Value>;

    /// Snapshot of the structure dictionary in use for compact encoding.
    fn dictionary(&self) -> StructureDictionary;

    /// Encode into a fresh buffer.
    fn encode(&self, value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(value, &mut out);
        out
    }
}

/// Returns true if `byte` may start a structural encoding.
pub fn is_structural_lead_byte(byte: u8) -> bool {
    byte >= 32 && byte != 66
}
