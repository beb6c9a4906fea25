//! Record value header
//!
//! A stored value is laid out as:
//!
//! ```text
//! +----------------------------+
//! | Local time (8 bytes)       |  optional: f64 BE (first byte 66) or placeholder
//! +----------------------------+
//! | Metadata (2 bytes)         |  optional: u16 BE 0x0200 | flags
//! | Expires at (8 bytes)       |  only if flags & HAS_EXPIRATION
//! +----------------------------+
//! | Structural value           |  optional: empty means tombstone
//! +----------------------------+
//! ```
//!
//! The storage engine recognizes the timestamp placeholder and overwrites it
//! with the record's local time when the write commits.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::codec::{CodecError, StructureDictionary, ValueCodec};
use crate::observability::hex_prefix;

/// Placeholder the storage engine fills with the commit's local time
pub const TIMESTAMP_PLACEHOLDER: [u8; 8] = [1, 1, 1, 1, 0, 0, 0, 0];

/// First byte of a literal f64 BE millisecond timestamp
pub const LITERAL_TIMESTAMP_BYTE: u8 = 66;

/// First byte of a metadata block
pub const METADATA_BYTE: u8 = 2;

/// Leading bytes below this value mark header bytes rather than value bytes
pub const HEADER_THRESHOLD: u8 = 32;

/// Metadata flag: an f64 BE expiration time follows the metadata block
pub const HAS_EXPIRATION: u8 = 0x01;

const TIMESTAMP_LEN: usize = 8;
const METADATA_LEN: usize = 2;
const HEX_DUMP_BYTES: usize = 16;

/// Result type for header operations
pub type HeaderResult<T> = Result<T, HeaderError>;

/// Record header errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HeaderError {
    /// Header bytes could not be parsed
    #[error("Malformed record header: {reason} (leading bytes: {hex})")]
    Malformed { reason: String, hex: String },

    /// A literal timestamp would not start with byte 66
    #[error("Timestamp {0} cannot be stored as a literal header timestamp")]
    TimestampOutOfRange(f64),

    /// Application flags may not use the expiration bit
    #[error("Metadata flags {0:#04x} use the reserved expiration bit")]
    ReservedFlag(u8),

    /// The structural value failed to decode
    #[error("Value decode failed: {source} (leading bytes: {hex})")]
    Value { source: CodecError, hex: String },
}

impl HeaderError {
    fn malformed(reason: impl Into<String>, buffer: &[u8]) -> Self {
        HeaderError::Malformed {
            reason: reason.into(),
            hex: hex_prefix(buffer, HEX_DUMP_BYTES),
        }
    }
}

/// What to put in front of the structural value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeInstructions {
    /// Reserve a placeholder that the engine fills at commit
    pub assign_timestamp: bool,
    /// Write this local time literally (takes precedence over the placeholder)
    pub local_time: Option<f64>,
    /// Application metadata flags (residency etc.); bit 0x01 is reserved
    pub metadata_flags: u8,
    /// Expiration time in epoch milliseconds
    pub expires_at: Option<f64>,
}

impl EncodeInstructions {
    /// Instructions for a write whose local time the engine assigns
    pub fn assign_timestamp() -> Self {
        Self {
            assign_timestamp: true,
            ..Self::default()
        }
    }
}

/// Header fields found at the front of a stored value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordHeader {
    /// Literal local time, if assigned
    pub local_time: Option<f64>,
    /// Placeholder present and not yet filled
    pub timestamp_pending: bool,
    /// Application metadata flags (without the expiration bit)
    pub metadata_flags: u8,
    /// Expiration time
    pub expires_at: Option<f64>,
}

/// A decoded stored value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedRecord {
    /// Header fields
    pub header: RecordHeader,
    /// Application value; `None` for a tombstone
    pub value: Option<Value>,
}

/// Write the header described by `instructions` into `out`.
pub fn write_header(instructions: &EncodeInstructions, out: &mut Vec<u8>) -> HeaderResult<()> {
    if instructions.metadata_flags & HAS_EXPIRATION != 0 {
        return Err(HeaderError::ReservedFlag(instructions.metadata_flags));
    }
    if let Some(local_time) = instructions.local_time {
        let bytes = local_time.to_be_bytes();
        if bytes[0] != LITERAL_TIMESTAMP_BYTE {
            return Err(HeaderError::TimestampOutOfRange(local_time));
        }
        out.extend_from_slice(&bytes);
    } else if instructions.assign_timestamp {
        out.extend_from_slice(&TIMESTAMP_PLACEHOLDER);
    }

    let mut flags = instructions.metadata_flags;
    if instructions.expires_at.is_some() {
        flags |= HAS_EXPIRATION;
    }
    if flags != 0 {
        out.push(METADATA_BYTE);
        out.push(flags);
        if let Some(expires_at) = instructions.expires_at {
            out.extend_from_slice(&expires_at.to_be_bytes());
        }
    }
    Ok(())
}

/// Parse the header at the front of `buffer`; returns the header and the
/// offset of the structural value.
pub fn read_header(buffer: &[u8]) -> HeaderResult<(RecordHeader, usize)> {
    let mut header = RecordHeader::default();
    let mut position = 0;

    match buffer.first() {
        Some(&LITERAL_TIMESTAMP_BYTE) => {
            let bytes = take8(buffer, position)
                .ok_or_else(|| HeaderError::malformed("truncated literal timestamp", buffer))?;
            header.local_time = Some(f64::from_be_bytes(bytes));
            position += TIMESTAMP_LEN;
        }
        Some(&1) => {
            if buffer.len() < TIMESTAMP_LEN || buffer[..TIMESTAMP_LEN] != TIMESTAMP_PLACEHOLDER {
                return Err(HeaderError::malformed("invalid timestamp placeholder", buffer));
            }
            header.timestamp_pending = true;
            position += TIMESTAMP_LEN;
        }
        _ => {}
    }

    match buffer.get(position) {
        Some(&METADATA_BYTE) => {
            let flags = *buffer
                .get(position + 1)
                .ok_or_else(|| HeaderError::malformed("truncated metadata block", buffer))?;
            position += METADATA_LEN;
            header.metadata_flags = flags & !HAS_EXPIRATION;
            if flags & HAS_EXPIRATION != 0 {
                let bytes = take8(buffer, position)
                    .ok_or_else(|| HeaderError::malformed("truncated expiration", buffer))?;
                header.expires_at = Some(f64::from_be_bytes(bytes));
                position += TIMESTAMP_LEN;
            }
        }
        Some(&byte) if byte < HEADER_THRESHOLD => {
            return Err(HeaderError::malformed(
                format!("unexpected header byte {:#04x} at offset {}", byte, position),
                buffer,
            ));
        }
        _ => {}
    }

    Ok((header, position))
}

/// Local time recorded in a stored value's header, if any
pub fn read_local_time(buffer: &[u8]) -> Option<f64> {
    match buffer.first() {
        Some(&LITERAL_TIMESTAMP_BYTE) => take8(buffer, 0).map(f64::from_be_bytes),
        _ => None,
    }
}

/// Overwrite a timestamp placeholder with `local_time`. Returns false if the
/// buffer does not start with the placeholder.
pub fn fill_timestamp(buffer: &mut [u8], local_time: f64) -> bool {
    if buffer.len() >= TIMESTAMP_LEN && buffer[..TIMESTAMP_LEN] == TIMESTAMP_PLACEHOLDER {
        buffer[..TIMESTAMP_LEN].copy_from_slice(&local_time.to_be_bytes());
        true
    } else {
        false
    }
}

fn take8(buffer: &[u8], position: usize) -> Option<[u8; 8]> {
    buffer
        .get(position..position + 8)
        .and_then(|slice| slice.try_into().ok())
}

/// Encodes and decodes stored values (header + structural value).
#[derive(Clone)]
pub struct RecordEncoder {
    codec: Arc<dyn ValueCodec>,
}

impl RecordEncoder {
    /// Create an encoder over a structural codec
    pub fn new(codec: Arc<dyn ValueCodec>) -> Self {
        Self { codec }
    }

    /// The structural codec
    pub fn codec(&self) -> &Arc<dyn ValueCodec> {
        &self.codec
    }

    /// Encode `value` (or a tombstone when `None`) behind the header the
    /// instructions describe.
    pub fn encode(
        &self,
        value: Option<&Value>,
        instructions: &EncodeInstructions,
    ) -> HeaderResult<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        write_header(instructions, &mut out)?;
        if let Some(value) = value {
            self.codec.encode_into(value, &mut out);
        }
        Ok(out)
    }

    /// Decode a stored value using the codec's own dictionary
    pub fn decode(&self, buffer: &[u8]) -> HeaderResult<DecodedRecord> {
        self.decode_with(buffer, None)
    }

    /// Decode a stored value, reading compact payloads with `structures`
    pub fn decode_with(
        &self,
        buffer: &[u8],
        structures: Option<&StructureDictionary>,
    ) -> HeaderResult<DecodedRecord> {
        let (header, offset) = read_header(buffer)?;
        let body = &buffer[offset..];
        let value = if body.is_empty() {
            None
        } else {
            Some(
                self.codec
                    .decode(body, structures)
                    .map_err(|source| HeaderError::Value {
                        source,
                        hex: hex_prefix(buffer, HEX_DUMP_BYTES),
                    })?,
            )
        };
        Ok(DecodedRecord { header, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    const NOW: f64 = 1_726_000_000_123.5;

    fn encoder() -> RecordEncoder {
        RecordEncoder::new(Arc::new(JsonCodec::new()))
    }

    #[test]
    fn test_no_header() {
        let encoder = encoder();
        let bytes = encoder.encode(Some(&json!({"a": 1})), &EncodeInstructions::default()).unwrap();
        assert_eq!(bytes[0], b'{');
        let decoded = encoder.decode(&bytes).unwrap();
        assert_eq!(decoded.header, RecordHeader::default());
        assert_eq!(decoded.value, Some(json!({"a": 1})));
    }

    #[test]
    fn test_literal_timestamp_starts_with_66() {
        let encoder = encoder();
        let instructions = EncodeInstructions {
            local_time: Some(NOW),
            ..Default::default()
        };
        let bytes = encoder.encode(Some(&json!(1)), &instructions).unwrap();
        assert_eq!(bytes[0], LITERAL_TIMESTAMP_BYTE);
        assert_eq!(read_local_time(&bytes), Some(NOW));
    }

    #[test]
    fn test_small_literal_timestamp_rejected() {
        let instructions = EncodeInstructions {
            local_time: Some(5.0),
            ..Default::default()
        };
        assert!(matches!(
            encoder().encode(None, &instructions),
            Err(HeaderError::TimestampOutOfRange(_))
        ));
    }

    #[test]
    fn test_placeholder_filled_by_engine() {
        let encoder = encoder();
        let mut bytes = encoder
            .encode(Some(&json!("v")), &EncodeInstructions::assign_timestamp())
            .unwrap();
        let pending = encoder.decode(&bytes).unwrap();
        assert!(pending.header.timestamp_pending);
        assert_eq!(pending.header.local_time, None);

        assert!(fill_timestamp(&mut bytes, NOW));
        let filled = encoder.decode(&bytes).unwrap();
        assert!(!filled.header.timestamp_pending);
        assert_eq!(filled.header.local_time, Some(NOW));
        assert_eq!(filled.value, Some(json!("v")));
    }

    #[test]
    fn test_reserved_flag_rejected() {
        let instructions = EncodeInstructions {
            metadata_flags: HAS_EXPIRATION,
            ..Default::default()
        };
        assert_eq!(
            encoder().encode(None, &instructions),
            Err(HeaderError::ReservedFlag(HAS_EXPIRATION))
        );
    }

    #[test]
    fn test_malformed_header_has_hex_dump() {
        let err = encoder().decode(&[0x05, 0x01, 0x02]).unwrap_err();
        match err {
            HeaderError::Malformed { hex, .. } => assert_eq!(hex, "05 01 02"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_truncated_expiration() {
        let err = encoder().decode(&[METADATA_BYTE, HAS_EXPIRATION, 0x42]).unwrap_err();
        assert!(matches!(err, HeaderError::Malformed { .. }));
    }

    #[test]
    fn test_tombstone_with_metadata() {
        let encoder = encoder();
        let instructions = EncodeInstructions {
            local_time: Some(NOW),
            metadata_flags: 0x04,
            expires_at: Some(NOW + 60_000.0),
            ..Default::default()
        };
        let bytes = encoder.encode(None, &instructions).unwrap();
        let decoded = encoder.decode(&bytes).unwrap();
        assert_eq!(decoded.value, None);
        assert_eq!(decoded.header.metadata_flags, 0x04);
        assert_eq!(decoded.header.expires_at, Some(NOW + 60_000.0));
    }
}
