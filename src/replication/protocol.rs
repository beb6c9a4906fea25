//! Replication wire protocol
//!
//! Every WebSocket binary message is one of two kinds, told apart by the
//! first byte:
//!
//! - `< 128`: a data message. An f64 BE transaction version, then packed
//!   `varint length + audit entry` items. A zero length is the resume marker,
//!   followed by the sender's f64 BE local time of the last entry sent.
//! - `>= 128`: a control message. The opcode byte, then a JSON array of
//!   arguments.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::errors::{ReplicationError, ReplicationResult};
use crate::audit::{read_varint, write_varint};
use crate::identity::IdMapping;
use crate::observability::hex_prefix;

pub const SUBSCRIBE: u8 = 129;
pub const SEND_TABLE_NAME: u8 = 130;
pub const SEND_TABLE_STRUCTURE: u8 = 131;
pub const SEND_NODE_ID: u8 = 140;
pub const SEND_ID_MAPPING: u8 = 141;
pub const END_TXN: u8 = 142;

/// Request to stream a database's audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub database: String,
    /// Stream entries with a local time after this; `None` streams from the start
    #[serde(default)]
    pub start_time: Option<f64>,
    /// Origin node names the subscriber receives some other way
    #[serde(default)]
    pub omitted: Vec<String>,
    /// Restrict to these tables; `None` means every table
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

/// Entries of one transaction version
#[derive(Debug, Clone, PartialEq)]
pub struct DataBatch {
    pub version: f64,
    pub entries: Vec<Vec<u8>>,
    /// Sender's local time of the last entry, when the batch carries one
    pub resume_time: Option<f64>,
}

/// Decoded replication message
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Subscribe(SubscribeRequest),
    TableName {
        table_id: u32,
        name: String,
    },
    TableStructure {
        table_id: u32,
        structures: Vec<Vec<String>>,
    },
    /// Sender's node name, and the database the connection is for once known
    NodeId {
        name: String,
        database: Option<String>,
    },
    IdMapping(IdMapping),
    EndTxn,
    Data(DataBatch),
}

impl ProtocolMessage {
    /// Short name used in logs and state errors
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolMessage::Subscribe(_) => "SUBSCRIBE",
            ProtocolMessage::TableName { .. } => "SEND_TABLE_NAME",
            ProtocolMessage::TableStructure { .. } => "SEND_TABLE_STRUCTURE",
            ProtocolMessage::NodeId { .. } => "SEND_NODE_ID",
            ProtocolMessage::IdMapping(_) => "SEND_ID_MAPPING",
            ProtocolMessage::EndTxn => "END_TXN",
            ProtocolMessage::Data(_) => "DATA",
        }
    }
}

fn malformed(reason: impl Into<String>) -> ReplicationError {
    ReplicationError::Malformed(reason.into())
}

fn json_error(err: serde_json::Error) -> ReplicationError {
    malformed(err.to_string())
}

/// Encode a message for the wire
pub fn encode_message(message: &ProtocolMessage) -> ReplicationResult<Vec<u8>> {
    let (opcode, args) = match message {
        ProtocolMessage::Data(batch) => return Ok(encode_data(batch)),
        ProtocolMessage::Subscribe(request) => {
            (SUBSCRIBE, json!([serde_json::to_value(request).map_err(json_error)?]))
        }
        ProtocolMessage::TableName { table_id, name } => (SEND_TABLE_NAME, json!([table_id, name])),
        ProtocolMessage::TableStructure { table_id, structures } => {
            (SEND_TABLE_STRUCTURE, json!([table_id, structures]))
        }
        ProtocolMessage::NodeId { name, database } => (SEND_NODE_ID, json!([name, database])),
        ProtocolMessage::IdMapping(mapping) => (SEND_ID_MAPPING, json!([mapping])),
        ProtocolMessage::EndTxn => (END_TXN, json!([])),
    };
    let mut out = vec![opcode];
    serde_json::to_writer(&mut out, &args).map_err(json_error)?;
    Ok(out)
}

fn encode_data(batch: &DataBatch) -> Vec<u8> {
    let size = 17 + batch.entries.iter().map(|e| e.len() + 5).sum::<usize>();
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&batch.version.to_be_bytes());
    for entry in &batch.entries {
        write_varint(&mut out, entry.len() as u32);
        out.extend_from_slice(entry);
    }
    if let Some(time) = batch.resume_time {
        out.push(0);
        out.extend_from_slice(&time.to_be_bytes());
    }
    out
}

/// Decode one wire message
pub fn decode_message(bytes: &[u8]) -> ReplicationResult<ProtocolMessage> {
    let Some(&first) = bytes.first() else {
        return Err(malformed("empty message"));
    };
    if first < 128 {
        return decode_data(bytes).map(ProtocolMessage::Data);
    }

    let args: Vec<Value> = serde_json::from_slice(&bytes[1..]).map_err(|err| {
        malformed(format!(
            "opcode {} arguments: {} [{}]",
            first,
            err,
            hex_prefix(bytes, 16)
        ))
    })?;
    let arg = |index: usize| args.get(index).cloned().unwrap_or(Value::Null);

    match first {
        SUBSCRIBE => Ok(ProtocolMessage::Subscribe(parse(arg(0))?)),
        SEND_TABLE_NAME => Ok(ProtocolMessage::TableName {
            table_id: parse(arg(0))?,
            name: parse(arg(1))?,
        }),
        SEND_TABLE_STRUCTURE => Ok(ProtocolMessage::TableStructure {
            table_id: parse(arg(0))?,
            structures: parse(arg(1))?,
        }),
        SEND_NODE_ID => Ok(ProtocolMessage::NodeId {
            name: parse(arg(0))?,
            database: parse(arg(1))?,
        }),
        SEND_ID_MAPPING => Ok(ProtocolMessage::IdMapping(parse(arg(0))?)),
        END_TXN => Ok(ProtocolMessage::EndTxn),
        other => Err(ReplicationError::UnknownOpcode(other)),
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> ReplicationResult<T> {
    serde_json::from_value(value).map_err(json_error)
}

fn read_f64(bytes: &[u8], position: usize) -> ReplicationResult<f64> {
    bytes
        .get(position..position + 8)
        .and_then(|slice| slice.try_into().ok())
        .map(f64::from_be_bytes)
        .ok_or_else(|| malformed(format!("truncated f64 at {} [{}]", position, hex_prefix(bytes, 16))))
}

fn decode_data(bytes: &[u8]) -> ReplicationResult<DataBatch> {
    let version = read_f64(bytes, 0)?;
    let mut entries = Vec::new();
    let mut resume_time = None;
    let mut position = 8;
    while position < bytes.len() {
        let length = read_varint(bytes, &mut position).map_err(|err| malformed(err.to_string()))? as usize;
        if length == 0 {
            resume_time = Some(read_f64(bytes, position)?);
            break;
        }
        let entry = bytes
            .get(position..position + length)
            .ok_or_else(|| malformed(format!("entry of {} bytes overruns message at {}", length, position)))?;
        entries.push(entry.to_vec());
        position += length;
    }
    Ok(DataBatch {
        version,
        entries,
        resume_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_messages() {
        let subscribe = ProtocolMessage::Subscribe(SubscribeRequest {
            database: "app".to_string(),
            start_time: Some(1_700_000_000_000.5),
            omitted: vec!["node-c".to_string()],
            tables: None,
        });
        let bytes = encode_message(&subscribe).unwrap();
        assert_eq!(bytes[0], SUBSCRIBE);
        assert_eq!(decode_message(&bytes).unwrap(), subscribe);

        let node = ProtocolMessage::NodeId {
            name: "node-a".to_string(),
            database: None,
        };
        let bytes = encode_message(&node).unwrap();
        assert_eq!(&bytes[1..], br#"["node-a",null]"#);
        assert_eq!(decode_message(&bytes).unwrap(), node);

        let structure = ProtocolMessage::TableStructure {
            table_id: 2,
            structures: vec![vec!["a".to_string(), "b".to_string()]],
        };
        assert_eq!(decode_message(&encode_message(&structure).unwrap()).unwrap(), structure);
        assert_eq!(decode_message(&[END_TXN, b'[', b']']).unwrap(), ProtocolMessage::EndTxn);
    }

    #[test]
    fn test_subscribe_defaults() {
        let mut bytes = vec![SUBSCRIBE];
        bytes.extend_from_slice(br#"[{"database":"app"}]"#);
        match decode_message(&bytes).unwrap() {
            ProtocolMessage::Subscribe(request) => {
                assert_eq!(request.start_time, None);
                assert!(request.omitted.is_empty());
                assert_eq!(request.tables, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_message_layout() {
        let batch = DataBatch {
            version: 1_700_000_000_000.0,
            entries: vec![vec![1, 2, 3], vec![0x42; 200]],
            resume_time: Some(1_700_000_000_100.0),
        };
        let bytes = encode_message(&ProtocolMessage::Data(batch.clone())).unwrap();
        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[8], 3);
        // 200 needs the two-byte varint form.
        assert_eq!(&bytes[12..14], &[0x80, 200]);
        assert_eq!(bytes[bytes.len() - 9], 0);
        assert_eq!(decode_message(&bytes).unwrap(), ProtocolMessage::Data(batch));
    }

    #[test]
    fn test_resume_marker_stops_parsing() {
        let mut bytes = 5.0e12f64.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[1, 9, 0]);
        bytes.extend_from_slice(&6.0e12f64.to_be_bytes());
        bytes.extend_from_slice(&[1, 7]);
        let ProtocolMessage::Data(batch) = decode_message(&bytes).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(batch.entries, vec![vec![9]]);
        assert_eq!(batch.resume_time, Some(6.0e12));
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(decode_message(&[]), Err(ReplicationError::Malformed(_))));
        assert!(matches!(decode_message(&[0x42, 0, 0]), Err(ReplicationError::Malformed(_))));
        let mut overrun = 1.0e12f64.to_be_bytes().to_vec();
        overrun.extend_from_slice(&[10, 1, 2]);
        assert!(matches!(decode_message(&overrun), Err(ReplicationError::Malformed(_))));
        assert!(matches!(decode_message(&[SUBSCRIBE, b'{']), Err(ReplicationError::Malformed(_))));
        assert!(matches!(
            decode_message(&[132, b'[', b']']),
            Err(ReplicationError::UnknownOpcode(132))
        ));
    }
}
