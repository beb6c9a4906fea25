//! CRDT patches and history replay
//!
//! Counters are the only replicated data type with a defined inverse: an
//! `add` is undone by subtracting its operand. Every other operation name is
//! rejected as unsupported.

mod errors;
mod ops;
mod replay;

pub use errors::{CrdtError, CrdtResult};
pub use ops::{
    add_op, add_values, apply_patch, negate, parse_patch, parse_update, rebuild_update_before,
    FieldUpdate, ADD_OP, OPERAND_KEY, OP_KEY,
};
pub use replay::{get_record_at_time, replay_chain};
