//! Total ordering and operational transform for concurrent edits.
//!
//! One sequencer exists per session, owned by the session actor, so no
//! locking is needed around the counter or history. Every accepted
//! operation gets the next sequence number and is appended to a bounded
//! history window; incoming operations are transformed against everything
//! accepted after their `base_sequence` before being sequenced themselves.
//!
//! The transform is symmetric (transform-property-1): for any two
//! concurrent operations `a` and `b`,
//! `apply(apply(s, a), transform(b, a)) == apply(apply(s, b), transform(a, b))`,
//! which is what makes every replica converge to a byte-identical buffer
//! after applying the sequenced stream.

use crate::protocol::{EditOp, OpKind};
use std::collections::VecDeque;

/// Default number of accepted operations retained for transformation.
pub const DEFAULT_HISTORY_WINDOW: usize = 512;

/// An operation that has been transformed and assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedOp {
    pub sequence: u64,
    pub author: String,
    pub op: EditOp,
    pub timestamp: u64,
}

/// The submitted operation's base predates the retained history window.
///
/// Recoverable: the client must fetch a fresh document snapshot and resume
/// from its sequence number instead of retrying the stale operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("base sequence {base} predates retained history (oldest usable base {oldest})")]
pub struct StaleBaseError {
    pub base: u64,
    pub oldest: u64,
}

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    StaleBase(#[from] StaleBaseError),

    /// The client claimed to have observed a sequence number the session
    /// has not assigned yet. Treated as a malformed message upstream.
    #[error("base sequence {base} is ahead of the session counter {current}")]
    FutureBase { base: u64, current: u64 },
}

/// Per-session operation sequencer.
pub struct Sequencer {
    /// Last assigned sequence number; 0 before any operation is accepted.
    counter: u64,
    /// Accepted operations, ascending by sequence, capped at `window`.
    history: VecDeque<SequencedOp>,
    window: usize,
}

impl Sequencer {
    pub fn new(window: usize) -> Self {
        Self {
            counter: 0,
            history: VecDeque::with_capacity(window.min(1024)),
            window: window.max(1),
        }
    }

    /// Last assigned sequence number (the session's `sequenceCounter`).
    pub fn current_sequence(&self) -> u64 {
        self.counter
    }

    /// Smallest `base_sequence` a submission may carry without being stale.
    pub fn oldest_usable_base(&self) -> u64 {
        match self.history.front() {
            Some(front) => front.sequence - 1,
            None => self.counter,
        }
    }

    /// Number of operations currently retained.
    pub fn retained(&self) -> usize {
        self.history.len()
    }

    /// Transform `op` against everything accepted after `base_sequence`,
    /// assign the next sequence number, and append to history.
    ///
    /// The returned operation is what gets broadcast verbatim; the author
    /// must not re-apply it (it already applied the untransformed original
    /// locally).
    pub fn submit(
        &mut self,
        author: &str,
        base_sequence: u64,
        op: EditOp,
        timestamp: u64,
    ) -> Result<SequencedOp, SubmitError> {
        if base_sequence > self.counter {
            return Err(SubmitError::FutureBase {
                base: base_sequence,
                current: self.counter,
            });
        }
        let oldest = self.oldest_usable_base();
        if base_sequence < oldest {
            return Err(StaleBaseError {
                base: base_sequence,
                oldest,
            }
            .into());
        }

        let mut op = normalize(op);
        for earlier in self.history.iter().filter(|h| h.sequence > base_sequence) {
            op = transform(&op, author, &earlier.op, &earlier.author);
        }

        self.counter += 1;
        let accepted = SequencedOp {
            sequence: self.counter,
            author: author.to_string(),
            op,
            timestamp,
        };
        self.history.push_back(accepted.clone());
        while self.history.len() > self.window {
            self.history.pop_front();
        }
        Ok(accepted)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}

/// Recompute derived fields so transforms can trust them.
fn normalize(mut op: EditOp) -> EditOp {
    match op.kind {
        OpKind::Insert => op.length = op.content.chars().count(),
        OpKind::Delete | OpKind::Retain => op.content.clear(),
    }
    op
}

/// Transform `incoming` so that it applies after `earlier`.
///
/// `earlier` was accepted first; both were authored against the same base.
/// Insert/insert ties at the same position break on author id so every
/// replica orders them identically. An insert strictly inside a
/// concurrently deleted range is dropped (the delete swallows it), the
/// only single-operation resolution that keeps the transform symmetric.
pub fn transform(incoming: &EditOp, incoming_author: &str, earlier: &EditOp, earlier_author: &str) -> EditOp {
    let mut out = incoming.clone();
    match (earlier.kind, incoming.kind) {
        (OpKind::Retain, _) => {}

        (OpKind::Insert, OpKind::Insert) => {
            let before = earlier.position < incoming.position
                || (earlier.position == incoming.position && earlier_author <= incoming_author);
            if before {
                out.position += earlier.length;
            }
        }

        (OpKind::Insert, OpKind::Delete) => {
            if earlier.position <= incoming.position {
                out.position += earlier.length;
            } else if earlier.position < incoming.position + incoming.length {
                // Insert landed inside the deleted range: widen the delete.
                out.length += earlier.length;
            }
        }

        (OpKind::Insert, OpKind::Retain) => {
            if earlier.position <= incoming.position {
                out.position += earlier.length;
            }
        }

        (OpKind::Delete, OpKind::Insert) => {
            let del_end = earlier.position + earlier.length;
            if incoming.position >= del_end {
                out.position -= earlier.length;
            } else if incoming.position > earlier.position {
                // Authored inside text that no longer exists.
                out.position = earlier.position;
                out.content.clear();
                out.length = 0;
            }
        }

        (OpKind::Delete, OpKind::Delete) => {
            let e_start = earlier.position;
            let e_end = earlier.position + earlier.length;
            let i_start = incoming.position;
            let i_end = incoming.position + incoming.length;
            if e_end <= i_start {
                out.position -= earlier.length;
            } else if i_end <= e_start {
                // Disjoint, incoming entirely before: unchanged.
            } else {
                let overlap = i_end.min(e_end) - i_start.max(e_start);
                out.length -= overlap;
                if i_start >= e_start {
                    out.position = e_start;
                }
            }
        }

        (OpKind::Delete, OpKind::Retain) => {
            let del_end = earlier.position + earlier.length;
            if incoming.position >= del_end {
                out.position -= earlier.length;
            } else if incoming.position > earlier.position {
                out.position = earlier.position;
            }
        }
    }
    out
}

/// Apply an operation to a text buffer. Positions are character offsets;
/// out-of-range positions and lengths clamp to the buffer end.
pub fn apply(buffer: &mut String, op: &EditOp) {
    match op.kind {
        OpKind::Insert => {
            let at = char_to_byte(buffer, op.position);
            buffer.insert_str(at, &op.content);
        }
        OpKind::Delete => {
            let start = char_to_byte(buffer, op.position);
            let end = char_to_byte(buffer, op.position + op.length);
            buffer.replace_range(start..end, "");
        }
        OpKind::Retain => {}
    }
}

fn char_to_byte(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq() -> Sequencer {
        Sequencer::default()
    }

    /// Run both application orders of two concurrent ops and assert they
    /// converge (transform-property-1).
    fn assert_tp1(base: &str, a: &EditOp, b: &EditOp) {
        let mut left = base.to_string();
        apply(&mut left, a);
        apply(&mut left, &transform(b, "author-b", a, "author-a"));

        let mut right = base.to_string();
        apply(&mut right, b);
        apply(&mut right, &transform(a, "author-a", b, "author-b"));

        assert_eq!(left, right, "divergence for {a:?} / {b:?} on {base:?}");
    }

    #[test]
    fn test_sequence_numbers_are_dense_and_increasing() {
        let mut s = seq();
        for i in 0..20u64 {
            let accepted = s
                .submit("u-1", i, EditOp::insert(0, "a"), 0)
                .unwrap();
            assert_eq!(accepted.sequence, i + 1);
        }
        assert_eq!(s.current_sequence(), 20);
    }

    #[test]
    fn test_scenario_concurrent_insert_and_delete() {
        // A inserts "hi" at 0 and B deletes 2 chars at 0, both at base 5.
        let mut s = seq();
        for i in 0..5u64 {
            s.submit("warmup", i, EditOp::retain(0), 0).unwrap();
        }
        assert_eq!(s.current_sequence(), 5);

        let a = s.submit("user-a", 5, EditOp::insert(0, "hi"), 0).unwrap();
        assert_eq!(a.sequence, 6);
        assert_eq!(a.op, EditOp::insert(0, "hi"));

        let b = s.submit("user-b", 5, EditOp::delete(0, 2), 0).unwrap();
        assert_eq!(b.sequence, 7);
        // B's delete start shifted past A's insertion.
        assert_eq!(b.op, EditOp::delete(2, 2));

        let mut buffer = String::from("xxrest");
        apply(&mut buffer, &a.op);
        apply(&mut buffer, &b.op);
        assert_eq!(buffer, "hirest");
    }

    #[test]
    fn test_insert_insert_tiebreak_is_author_order() {
        // Same position: the lexicographically smaller author id sorts first.
        let shifted = transform(
            &EditOp::insert(3, "b"),
            "user-b",
            &EditOp::insert(3, "a"),
            "user-a",
        );
        assert_eq!(shifted.position, 4);

        let unshifted = transform(
            &EditOp::insert(3, "a"),
            "user-a",
            &EditOp::insert(3, "b"),
            "user-b",
        );
        assert_eq!(unshifted.position, 3);
    }

    #[test]
    fn test_tp1_insert_insert_same_position() {
        assert_tp1("hello", &EditOp::insert(2, "AA"), &EditOp::insert(2, "B"));
    }

    #[test]
    fn test_tp1_insert_inside_delete() {
        assert_tp1("abcdefg", &EditOp::insert(3, "XY"), &EditOp::delete(2, 3));
    }

    #[test]
    fn test_tp1_insert_at_delete_edges() {
        assert_tp1("abcdefg", &EditOp::insert(2, "XY"), &EditOp::delete(2, 3));
        assert_tp1("abcdefg", &EditOp::insert(5, "XY"), &EditOp::delete(2, 3));
    }

    #[test]
    fn test_tp1_overlapping_deletes() {
        assert_tp1("abcdefgh", &EditOp::delete(1, 3), &EditOp::delete(2, 4));
        assert_tp1("abcdefgh", &EditOp::delete(2, 2), &EditOp::delete(0, 6));
        assert_tp1("abcdefgh", &EditOp::delete(0, 2), &EditOp::delete(4, 2));
    }

    #[test]
    fn test_identical_deletes_cancel() {
        let t = transform(
            &EditOp::delete(2, 3),
            "user-b",
            &EditOp::delete(2, 3),
            "user-a",
        );
        assert_eq!(t.length, 0);
        assert!(t.is_noop());
    }

    #[test]
    fn test_stale_base_rejected_after_window_compaction() {
        let mut s = Sequencer::new(4);
        for i in 0..10u64 {
            s.submit("u-1", i, EditOp::insert(0, "x"), 0).unwrap();
        }
        // History retains sequences 7..=10, so the oldest usable base is 6.
        assert_eq!(s.oldest_usable_base(), 6);
        assert_eq!(s.retained(), 4);

        let err = s.submit("u-2", 2, EditOp::insert(0, "y"), 0).unwrap_err();
        match err {
            SubmitError::StaleBase(e) => {
                assert_eq!(e.base, 2);
                assert_eq!(e.oldest, 6);
            }
            other => panic!("expected stale base, got {other:?}"),
        }
        // A rejected submission must not consume a sequence number.
        assert_eq!(s.current_sequence(), 10);
    }

    #[test]
    fn test_future_base_rejected() {
        let mut s = seq();
        let err = s.submit("u-1", 3, EditOp::insert(0, "x"), 0).unwrap_err();
        assert!(matches!(err, SubmitError::FutureBase { base: 3, current: 0 }));
    }

    #[test]
    fn test_transform_skips_ops_at_or_before_base() {
        let mut s = seq();
        s.submit("u-1", 0, EditOp::insert(0, "aaaa"), 0).unwrap();
        // u-2 already observed sequence 1, so no shifting happens.
        let accepted = s.submit("u-2", 1, EditOp::insert(1, "b"), 0).unwrap();
        assert_eq!(accepted.op.position, 1);
    }

    #[test]
    fn test_retain_is_sequenced_but_inert() {
        let mut s = seq();
        s.submit("u-1", 0, EditOp::insert(0, "abc"), 0).unwrap();
        let r = s.submit("u-2", 0, EditOp::retain(1), 0).unwrap();
        assert_eq!(r.sequence, 2);
        assert_eq!(r.op.position, 4); // shifted past the insert
        let mut buf = String::from("abc");
        apply(&mut buf, &r.op);
        assert_eq!(buf, "abc");
    }

    #[test]
    fn test_apply_clamps_out_of_range() {
        let mut buf = String::from("ab");
        apply(&mut buf, &EditOp::insert(99, "c"));
        assert_eq!(buf, "abc");
        apply(&mut buf, &EditOp::delete(1, 99));
        assert_eq!(buf, "a");
    }

    #[test]
    fn test_apply_is_char_indexed() {
        let mut buf = String::from("héllo");
        apply(&mut buf, &EditOp::insert(2, "X"));
        assert_eq!(buf, "héXllo");
        apply(&mut buf, &EditOp::delete(1, 2));
        assert_eq!(buf, "hllo");
    }

    #[test]
    fn test_normalize_recomputes_insert_length() {
        let mut s = seq();
        // A hostile client can lie about length; the sequencer recounts.
        let lying = EditOp {
            kind: OpKind::Insert,
            position: 0,
            content: "abc".into(),
            length: 99,
        };
        let accepted = s.submit("u-1", 0, lying, 0).unwrap();
        assert_eq!(accepted.op.length, 3);
    }

    #[test]
    fn test_sequenced_stream_replays_identically() {
        // Replicas that apply the same sequenced prefix converge.
        let mut s = seq();
        let script = [
            ("user-a", 0, EditOp::insert(0, "the menu ")),
            ("user-b", 0, EditOp::insert(0, "edit ")),
            ("user-a", 1, EditOp::delete(0, 4)),
            ("user-b", 2, EditOp::insert(3, "??")),
        ];
        let mut accepted = Vec::new();
        for (author, base, op) in script {
            accepted.push(s.submit(author, base, op, 0).unwrap());
        }

        let mut replay = String::new();
        for op in &accepted {
            apply(&mut replay, &op.op);
        }
        // "edit " tie-broke after user-a's insert, the delete stripped
        // "the ", and user-b's insert at 3 died inside the deleted range.
        assert_eq!(replay, "menu edit ");
    }
}
