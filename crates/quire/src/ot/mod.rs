//! Operational Transform over plain text.
//!
//! An [`OperationSeq`] describes one complete edit of a text. Two edits made
//! concurrently against the same text are reconciled with
//! [`OperationSeq::transform`]; edits made one after the other are merged with
//! [`OperationSeq::compose`]. All lengths and offsets count UTF-16 code units.

pub mod operation;
pub mod text;

pub use operation::{Operation, OperationSeq};
pub use text::utf16_len;
