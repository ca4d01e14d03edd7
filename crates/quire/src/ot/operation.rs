use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::text::{split_utf16, utf16_len};
use crate::error::TransformError;

/// A single step of an edit
///
/// On the wire a step is written in the compact form used by most OT
/// editors: a positive integer retains, a negative integer deletes and a
/// string inserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub enum Operation {
    /// Skip over `n` UTF-16 units of the source text
    Retain(usize),
    /// Insert the given text at the current position
    Insert(String),
    /// Remove `n` UTF-16 units of the source text
    Delete(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawOperation {
    Count(i64),
    Text(String),
}

impl TryFrom<RawOperation> for Operation {
    type Error = TransformError;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        match raw {
            RawOperation::Count(0) => Err(TransformError::Malformed(
                "zero-length retain or delete".to_string(),
            )),
            RawOperation::Count(n) => {
                let len = usize::try_from(n.unsigned_abs()).map_err(|_| {
                    TransformError::Malformed(format!("length {} out of range", n))
                })?;
                Ok(if n > 0 {
                    Operation::Retain(len)
                } else {
                    Operation::Delete(len)
                })
            }
            RawOperation::Text(text) if text.is_empty() => {
                Err(TransformError::Malformed("empty insert".to_string()))
            }
            RawOperation::Text(text) => Ok(Operation::Insert(text)),
        }
    }
}

impl From<Operation> for RawOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Retain(n) => RawOperation::Count(n as i64),
            Operation::Delete(n) => RawOperation::Count(-(n as i64)),
            Operation::Insert(text) => RawOperation::Text(text),
        }
    }
}

/// An ordered sequence of operations describing a complete edit of a text
///
/// The sequence is kept normalized while it is built: adjacent steps of the
/// same kind are merged and an insert never directly follows a delete. Two
/// sequences that describe the same edit therefore compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Operation>", into = "Vec<Operation>")]
pub struct OperationSeq {
    ops: Vec<Operation>,
    base_len: usize,
    target_len: usize,
}

impl OperationSeq {
    /// Create an empty sequence
    pub fn new() -> Self {
        Self::default()
    }

    /// The steps of this sequence
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Length of the text this sequence can be applied to
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the text after this sequence has been applied
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// True if applying this sequence leaves every text unchanged
    pub fn is_noop(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, Operation::Retain(_)))
    }

    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Operation::Retain(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(Operation::Retain(n));
        }
        self
    }

    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        self.target_len += utf16_len(text);

        match self.ops.as_mut_slice() {
            [.., Operation::Insert(last)] | [.., Operation::Insert(last), Operation::Delete(_)] => {
                last.push_str(text);
                return self;
            }
            _ => {}
        }

        // Inserts go before a trailing delete so equal edits compare equal.
        if let Some(Operation::Delete(_)) = self.ops.last() {
            let at = self.ops.len() - 1;
            self.ops.insert(at, Operation::Insert(text.to_string()));
        } else {
            self.ops.push(Operation::Insert(text.to_string()));
        }
        self
    }

    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        if let Some(Operation::Delete(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(Operation::Delete(n));
        }
        self
    }

    fn push(&mut self, op: Operation) {
        match op {
            Operation::Retain(n) => self.retain(n),
            Operation::Insert(text) => self.insert(&text),
            Operation::Delete(n) => self.delete(n),
        };
    }

    /// Apply this sequence to `text`, producing the edited text
    pub fn apply(&self, text: &str) -> Result<String, TransformError> {
        let actual = utf16_len(text);
        if actual != self.base_len {
            return Err(TransformError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut result = String::with_capacity(text.len());
        let mut rest = text;
        for op in &self.ops {
            match op {
                Operation::Retain(n) => {
                    let (kept, tail) = split_utf16(rest, *n)?;
                    result.push_str(kept);
                    rest = tail;
                }
                Operation::Insert(inserted) => result.push_str(inserted),
                Operation::Delete(n) => {
                    let (_, tail) = split_utf16(rest, *n)?;
                    rest = tail;
                }
            }
        }
        Ok(result)
    }

    /// Combine this sequence with one that follows it into a single sequence
    /// with the same effect as applying both in order.
    pub fn compose(&self, next: &OperationSeq) -> Result<OperationSeq, TransformError> {
        if self.target_len != next.base_len {
            return Err(TransformError::LengthMismatch {
                expected: self.target_len,
                actual: next.base_len,
            });
        }

        let mut composed = OperationSeq::new();
        let mut first = self.ops.iter().cloned();
        let mut second = next.ops.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Operation::Delete(n)), rest) => {
                    composed.delete(n);
                    a = first.next();
                    b = rest;
                }
                (rest, Some(Operation::Insert(text))) => {
                    composed.insert(&text);
                    a = rest;
                    b = second.next();
                }
                (None, _) | (_, None) => {
                    return Err(TransformError::Malformed(
                        "sequences cannot be composed".to_string(),
                    ))
                }
                (Some(Operation::Retain(i)), Some(Operation::Retain(j))) => {
                    composed.retain(i.min(j));
                    (a, b) = match i.cmp(&j) {
                        Ordering::Less => (first.next(), Some(Operation::Retain(j - i))),
                        Ordering::Equal => (first.next(), second.next()),
                        Ordering::Greater => (Some(Operation::Retain(i - j)), second.next()),
                    };
                }
                (Some(Operation::Insert(text)), Some(Operation::Delete(j))) => {
                    let len = utf16_len(&text);
                    (a, b) = match len.cmp(&j) {
                        Ordering::Less => (first.next(), Some(Operation::Delete(j - len))),
                        Ordering::Equal => (first.next(), second.next()),
                        Ordering::Greater => {
                            let (_, tail) = split_utf16(&text, j)?;
                            (Some(Operation::Insert(tail.to_string())), second.next())
                        }
                    };
                }
                (Some(Operation::Insert(text)), Some(Operation::Retain(j))) => {
                    let len = utf16_len(&text);
                    (a, b) = match len.cmp(&j) {
                        Ordering::Less => {
                            composed.insert(&text);
                            (first.next(), Some(Operation::Retain(j - len)))
                        }
                        Ordering::Equal => {
                            composed.insert(&text);
                            (first.next(), second.next())
                        }
                        Ordering::Greater => {
                            let (head, tail) = split_utf16(&text, j)?;
                            composed.insert(head);
                            (Some(Operation::Insert(tail.to_string())), second.next())
                        }
                    };
                }
                (Some(Operation::Retain(i)), Some(Operation::Delete(j))) => {
                    composed.delete(i.min(j));
                    (a, b) = match i.cmp(&j) {
                        Ordering::Less => (first.next(), Some(Operation::Delete(j - i))),
                        Ordering::Equal => (first.next(), second.next()),
                        Ordering::Greater => (Some(Operation::Retain(i - j)), second.next()),
                    };
                }
            }
        }

        Ok(composed)
    }

    /// Transform two concurrent sequences computed against the same text.
    ///
    /// Returns `(self', other')` such that applying `self` then `other'`
    /// gives the same text as applying `other` then `self'`. When both sides
    /// insert at the same offset, the insert from `self` is placed first.
    pub fn transform(
        &self,
        other: &OperationSeq,
    ) -> Result<(OperationSeq, OperationSeq), TransformError> {
        if self.base_len != other.base_len {
            return Err(TransformError::LengthMismatch {
                expected: self.base_len,
                actual: other.base_len,
            });
        }

        let mut left = OperationSeq::new();
        let mut right = OperationSeq::new();
        let mut first = self.ops.iter().cloned();
        let mut second = other.ops.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Operation::Insert(text)), rest) => {
                    right.retain(utf16_len(&text));
                    left.insert(&text);
                    a = first.next();
                    b = rest;
                }
                (rest, Some(Operation::Insert(text))) => {
                    left.retain(utf16_len(&text));
                    right.insert(&text);
                    a = rest;
                    b = second.next();
                }
                (None, _) | (_, None) => {
                    return Err(TransformError::Malformed(
                        "sequences cannot be transformed".to_string(),
                    ))
                }
                (Some(Operation::Retain(i)), Some(Operation::Retain(j))) => {
                    left.retain(i.min(j));
                    right.retain(i.min(j));
                    (a, b) = remainder(
                        i,
                        j,
                        Operation::Retain,
                        Operation::Retain,
                        &mut first,
                        &mut second,
                    );
                }
                (Some(Operation::Delete(i)), Some(Operation::Delete(j))) => {
                    (a, b) = remainder(
                        i,
                        j,
                        Operation::Delete,
                        Operation::Delete,
                        &mut first,
                        &mut second,
                    );
                }
                (Some(Operation::Delete(i)), Some(Operation::Retain(j))) => {
                    left.delete(i.min(j));
                    (a, b) = remainder(
                        i,
                        j,
                        Operation::Delete,
                        Operation::Retain,
                        &mut first,
                        &mut second,
                    );
                }
                (Some(Operation::Retain(i)), Some(Operation::Delete(j))) => {
                    right.delete(i.min(j));
                    (a, b) = remainder(
                        i,
                        j,
                        Operation::Retain,
                        Operation::Delete,
                        &mut first,
                        &mut second,
                    );
                }
            }
        }

        Ok((left, right))
    }

    /// Map a position in the source text to the matching position in the
    /// edited text. Text inserted exactly at `index` pushes it forward.
    pub fn transform_index(&self, index: usize) -> usize {
        let mut pos = 0;
        let mut new_index = index;
        for op in &self.ops {
            if pos > index {
                break;
            }
            match op {
                Operation::Retain(n) => pos += n,
                Operation::Insert(text) => new_index += utf16_len(text),
                Operation::Delete(n) => {
                    let end = pos + n;
                    new_index -= end.min(index) - pos;
                    pos = end;
                }
            }
        }
        new_index.min(self.target_len)
    }
}

/// Consume the shorter of two length-carrying steps, keeping what is left of
/// the longer one.
fn remainder<I>(
    i: usize,
    j: usize,
    left_kind: fn(usize) -> Operation,
    right_kind: fn(usize) -> Operation,
    first: &mut I,
    second: &mut I,
) -> (Option<Operation>, Option<Operation>)
where
    I: Iterator<Item = Operation>,
{
    match i.cmp(&j) {
        Ordering::Less => (first.next(), Some(right_kind(j - i))),
        Ordering::Equal => (first.next(), second.next()),
        Ordering::Greater => (Some(left_kind(i - j)), second.next()),
    }
}

impl TryFrom<Vec<Operation>> for OperationSeq {
    type Error = TransformError;

    fn try_from(ops: Vec<Operation>) -> Result<Self, Self::Error> {
        let mut seq = OperationSeq::new();
        for op in ops {
            match &op {
                Operation::Retain(0) | Operation::Delete(0) => {
                    return Err(TransformError::Malformed(
                        "zero-length retain or delete".to_string(),
                    ))
                }
                Operation::Insert(text) if text.is_empty() => {
                    return Err(TransformError::Malformed("empty insert".to_string()))
                }
                _ => {
                    let (base, target) = match &op {
                        Operation::Retain(n) => (*n, *n),
                        Operation::Delete(n) => (*n, 0),
                        Operation::Insert(text) => (0, utf16_len(text)),
                    };
                    if seq.base_len.checked_add(base).is_none()
                        || seq.target_len.checked_add(target).is_none()
                    {
                        return Err(TransformError::Malformed(
                            "operation length overflows".to_string(),
                        ));
                    }
                    seq.push(op)
                }
            }
        }
        Ok(seq)
    }
}

impl From<OperationSeq> for Vec<Operation> {
    fn from(seq: OperationSeq) -> Self {
        seq.ops
    }
}
