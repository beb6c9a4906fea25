//! JSON structural codec with an optional structure dictionary.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{CodecError, CodecResult};
use super::ValueCodec;

/// Leading byte of a compact (dictionary-encoded) object: `~[idx, v1, v2, ...]`
pub const COMPACT_MARKER: u8 = b'~';

/// Upper bound on dictionary size; objects with new shapes past this are
/// written as plain JSON.
const MAX_STRUCTURES: usize = 4096;

/// Ordered list of object shapes (sorted key lists).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructureDictionary {
    structures: Vec<Vec<String>>,
}

impl StructureDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dictionary from a list of shapes (e.g. received from a peer)
    pub fn from_structures(structures: Vec<Vec<String>>) -> Self {
        Self { structures }
    }

    /// Number of registered shapes
    pub fn len(&self) -> usize {
        self.structures.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    /// Shape at `index`
    pub fn get(&self, index: usize) -> Option<&[String]> {
        self.structures.get(index).map(|s| s.as_slice())
    }

    /// All shapes in index order
    pub fn structures(&self) -> &[Vec<String>] {
        &self.structures
    }
}

#[derive(Debug, Default)]
struct DictionaryState {
    dictionary: StructureDictionary,
    index: HashMap<Vec<String>, usize>,
}

/// JSON codec. In compact mode objects with two or more keys are recorded
/// in the dictionary and written as `~[idx, values...]`.
#[derive(Debug, Default)]
pub struct JsonCodec {
    compact: bool,
    state: RwLock<DictionaryState>,
}

impl JsonCodec {
    /// Plain JSON codec; never emits compact payloads
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that records object shapes and emits compact payloads
    pub fn compact() -> Self {
        Self {
            compact: true,
            state: RwLock::new(DictionaryState::default()),
        }
    }

    /// Whether compact encoding is enabled
    pub fn is_compact(&self) -> bool {
        self.compact
    }

    /// Current dictionary size
    pub fn dictionary_len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dictionary
            .len()
    }

    fn structure_index(&self, keys: &[String]) -> Option<usize> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(index) = state.index.get(keys) {
                return Some(*index);
            }
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = state.index.get(keys) {
            return Some(*index);
        }
        if state.dictionary.len() >= MAX_STRUCTURES {
            return None;
        }
        let index = state.dictionary.len();
        state.dictionary.structures.push(keys.to_vec());
        state.index.insert(keys.to_vec(), index);
        Some(index)
    }

    fn decode_compact(
        &self,
        bytes: &[u8],
        structures: Option<&StructureDictionary>,
    ) -> CodecResult<Value> {
        let items: Vec<Value> = serde_json::from_slice(bytes)?;
        let Some((head, values)) = items.split_first() else {
            return Err(CodecError::MalformedCompact("empty array".to_string()));
        };
        let index = head
            .as_u64()
            .ok_or_else(|| CodecError::MalformedCompact("structure index is not an integer".to_string()))?
            as usize;

        let build = |dictionary: &StructureDictionary| -> CodecResult<Value> {
            let keys = dictionary.get(index).ok_or(CodecError::UnknownStructure {
                index,
                known: dictionary.len(),
            })?;
            if keys.len() != values.len() {
                return Err(CodecError::MalformedCompact(format!(
                    "structure {} has {} keys, payload has {} values",
                    index,
                    keys.len(),
                    values.len()
                )));
            }
            let map: Map<String, Value> = keys.iter().cloned().zip(values.iter().cloned()).collect();
            Ok(Value::Object(map))
        };

        match structures {
            Some(dictionary) => build(dictionary),
            None => {
                let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
                build(&state.dictionary)
            }
        }
    }
}

fn write_json(out: &mut Vec<u8>, value: &Value) {
    // Serializing a Value into a Vec cannot fail; keep the buffer well formed anyway.
    if serde_json::to_writer(&mut *out, value).is_err() {
        out.extend_from_slice(b"null");
    }
}

impl ValueCodec for JsonCodec {
    fn encode_into(&self, value: &Value, out: &mut Vec<u8>) {
        if self.compact {
            if let Value::Object(map) = value {
                if map.len() >= 2 {
                    let mut keys: Vec<String> = map.keys().cloned().collect();
                    keys.sort();
                    if let Some(index) = self.structure_index(&keys) {
                        let mut items = Vec::with_capacity(keys.len() + 1);
                        items.push(Value::from(index as u64));
                        for key in &keys {
                            items.push(map.get(key).cloned().unwrap_or(Value::Null));
                        }
                        out.push(COMPACT_MARKER);
                        write_json(out, &Value::Array(items));
                        return;
                    }
                }
            }
        }
        write_json(out, value);
    }

    fn decode(&self, bytes: &[u8], structures: Option<&StructureDictionary>) -> CodecResult<Value> {
        match bytes.first() {
            None => Err(CodecError::InvalidEncoding("empty input".to_string())),
            Some(&COMPACT_MARKER) => self.decode_compact(&bytes[1..], structures),
            Some(_) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    fn dictionary(&self) -> StructureDictionary {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dictionary
            .clone()
    }
}
