use std::collections::BTreeMap;

use crate::error::TransformError;
use crate::ot::OperationSeq;

/// Authoritative text of one document together with its edit history
///
/// `history[r]` holds the edit that turned revision `r - 1` into revision
/// `r`. An edit based on revision `b` is transformed against every entry in
/// `b + 1..=revision`, oldest first, so committed edits always win ties.
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    text: String,
    revision: u64,
    history: BTreeMap<u64, OperationSeq>,
}

impl DocumentState {
    /// Start at revision 0 with the given text and no history
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            revision: 0,
            history: BTreeMap::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Revisions whose edits are still retained, oldest first
    pub fn history_revisions(&self) -> Vec<u64> {
        self.history.keys().copied().collect()
    }

    /// Oldest base revision an incoming edit may still use
    pub fn oldest_base(&self) -> u64 {
        self.history
            .keys()
            .next()
            .map(|first| first - 1)
            .unwrap_or(self.revision)
    }

    /// Transform an edit made against `base_revision` onto the current text
    /// and apply it.
    ///
    /// Returns the effective edit that was applied, which is what other
    /// clients must apply to stay in sync. On error nothing changes.
    pub fn apply_edit(
        &mut self,
        base_revision: u64,
        operations: OperationSeq,
    ) -> Result<OperationSeq, TransformError> {
        if base_revision > self.revision {
            return Err(TransformError::RevisionInFuture {
                base: base_revision,
                current: self.revision,
            });
        }
        if base_revision < self.oldest_base() {
            return Err(TransformError::RevisionPurged {
                base: base_revision,
                oldest: self.oldest_base(),
            });
        }

        let mut effective = operations;
        for committed in self.history.range(base_revision + 1..).map(|(_, op)| op) {
            let (_, transformed) = committed.transform(&effective)?;
            effective = transformed;
        }

        self.text = effective.apply(&self.text)?;
        self.revision += 1;
        self.history.insert(self.revision, effective.clone());
        Ok(effective)
    }

    /// Drop every history entry strictly below `min_acknowledged`.
    ///
    /// Returns how many entries were removed.
    pub fn collect_garbage(&mut self, min_acknowledged: u64) -> usize {
        let retained = self.history.split_off(&min_acknowledged);
        let removed = self.history.len();
        self.history = retained;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_at(pos: usize, text: &str, len: usize) -> OperationSeq {
        let mut op = OperationSeq::new();
        op.retain(pos).insert(text).retain(len - pos);
        op
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut state = DocumentState::new("ab");

        // Both clients edit revision 0
        let a = insert_at(0, "X", 2);
        let b = insert_at(2, "Y", 2);

        let effective_a = state.apply_edit(0, a.clone()).unwrap();
        let effective_b = state.apply_edit(0, b.clone()).unwrap();

        assert_eq!(state.text(), "XabY");
        assert_eq!(state.revision(), 2);
        assert_eq!(effective_a, a);
        assert_eq!(effective_b, insert_at(3, "Y", 3));

        // Client A applied its own edit, then receives B's effective edit
        let client_a = effective_b.apply(&a.apply("ab").unwrap()).unwrap();
        assert_eq!(client_a, state.text());
    }

    #[test]
    fn test_committed_insert_wins_tie() {
        let mut state = DocumentState::new("");
        state.apply_edit(0, insert_at(0, "first", 0)).unwrap();
        state.apply_edit(0, insert_at(0, "second", 0)).unwrap();
        assert_eq!(state.text(), "firstsecond");
    }

    #[test]
    fn test_revision_is_monotonic() {
        let mut state = DocumentState::new("");
        for n in 0..10 {
            state
                .apply_edit(n, insert_at(n as usize, "x", n as usize))
                .unwrap();
        }
        assert_eq!(state.revision(), 10);
        assert_eq!(state.text(), "xxxxxxxxxx");
    }

    #[test]
    fn test_failed_edit_leaves_state_untouched() {
        let mut state = DocumentState::new("abc");
        let mut too_long = OperationSeq::new();
        too_long.retain(5);

        assert!(matches!(
            state.apply_edit(0, too_long),
            Err(TransformError::LengthMismatch { .. })
        ));
        assert_eq!(state.revision(), 0);
        assert_eq!(state.text(), "abc");
        assert!(state.history_revisions().is_empty());
    }

    #[test]
    fn test_future_revision_is_rejected() {
        let mut state = DocumentState::new("abc");
        assert_eq!(
            state.apply_edit(1, insert_at(0, "x", 3)),
            Err(TransformError::RevisionInFuture {
                base: 1,
                current: 0
            })
        );
    }

    #[test]
    fn test_garbage_collection_bound() {
        let mut state = DocumentState::new("");
        for n in 0..6 {
            state
                .apply_edit(n, insert_at(0, "x", n as usize))
                .unwrap();
        }
        assert_eq!(state.history_revisions(), vec![1, 2, 3, 4, 5, 6]);

        let removed = state.collect_garbage(4);
        assert_eq!(removed, 3);
        assert_eq!(state.history_revisions(), vec![4, 5, 6]);
        assert_eq!(state.oldest_base(), 3);
    }

    #[test]
    fn test_purged_revision_is_rejected() {
        let mut state = DocumentState::new("");
        for n in 0..4 {
            state
                .apply_edit(n, insert_at(0, "x", n as usize))
                .unwrap();
        }
        state.collect_garbage(3);

        // Entries 3 and 4 remain, so bases 2..=4 still transform
        assert!(state.apply_edit(2, insert_at(0, "y", 2)).is_ok());
        assert_eq!(
            state.apply_edit(1, insert_at(0, "z", 1)),
            Err(TransformError::RevisionPurged { base: 1, oldest: 2 })
        );
        assert_eq!(state.revision(), 5);
    }
}
