//! Operational transformation over insert/delete edits.
//!
//! `transform_edits(a, b)` returns `(a', b')` such that applying `b` then
//! `a'` yields the same text as applying `a` then `b'`:
//!
//! ```text
//!            a
//!    base ───────► A
//!     │            │
//!   b │            │ b'
//!     ▼            ▼
//!     B ─────────► converged
//!           a'
//! ```
//!
//! Same-position inserts are ordered by `(author, text)` so every replica
//! resolves the tie identically, independent of arrival order. An insert
//! that lands inside a concurrently deleted span is anchored to the span
//! start and the delete is split around it, so inserted content is never
//! dropped. Overlapping deletes remove their union exactly once.
//!
//! The transform is pure and total: positions past the end of the text are
//! left alone here and clamped by [`crate::operation::apply`]. Position
//! arithmetic saturates, so arbitrarily large positions from a client stay
//! large instead of overflowing.

use uuid::Uuid;

use crate::operation::{Edit, Operation};

/// Rebase `a` past `b`: both were authored against the same base text, the
/// result applies on top of `b`.
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    let (edits, _) = transform_edits(&a.edits, a.author, &b.edits, b.author);
    Operation {
        edits,
        ..a.clone()
    }
}

/// Rebase two concurrent operations against each other.
///
/// Returns `(a', b')` where `a'` applies after `b` and `b'` applies after `a`.
pub fn transform_pair(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let (a_edits, b_edits) = transform_edits(&a.edits, a.author, &b.edits, b.author);
    (
        Operation { edits: a_edits, ..a.clone() },
        Operation { edits: b_edits, ..b.clone() },
    )
}

/// Transform two concurrent edit lists against each other.
pub fn transform_edits(
    a: &[Edit],
    a_author: Uuid,
    b: &[Edit],
    b_author: Uuid,
) -> (Vec<Edit>, Vec<Edit>) {
    match (a, b) {
        ([], _) => (Vec::new(), b.to_vec()),
        (_, []) => (a.to_vec(), Vec::new()),
        ([x], [y]) => transform_primitive(x, a_author, y, b_author),
        ([x], [first, rest @ ..]) => {
            let (x1, first1) = transform_primitive(x, a_author, first, b_author);
            let (x2, rest1) = transform_edits(&x1, a_author, rest, b_author);
            let mut b_out = first1;
            b_out.extend(rest1);
            (x2, b_out)
        }
        ([first, rest @ ..], _) => {
            let (first1, b1) = transform_edits(std::slice::from_ref(first), a_author, b, b_author);
            let (rest1, b2) = transform_edits(rest, a_author, &b1, b_author);
            let mut a_out = first1;
            a_out.extend(rest1);
            (a_out, b2)
        }
    }
}

/// Transform a single pair of primitives.
fn transform_primitive(a: &Edit, a_author: Uuid, b: &Edit, b_author: Uuid) -> (Vec<Edit>, Vec<Edit>) {
    match (a, b) {
        (Edit::Insert { pos: p, text: s }, Edit::Insert { pos: q, text: r }) => {
            let a_first = *p < *q || (*p == *q && (a_author, s.as_str()) <= (b_author, r.as_str()));
            let b_first = *q < *p || (*p == *q && (b_author, r.as_str()) <= (a_author, s.as_str()));
            let a_out = if a_first { *p } else { p.saturating_add(char_len(r)) };
            let b_out = if b_first { *q } else { q.saturating_add(char_len(s)) };
            (
                vec![Edit::Insert { pos: a_out, text: s.clone() }],
                vec![Edit::Insert { pos: b_out, text: r.to_string() }],
            )
        }
        (Edit::Insert { pos: q, text: r }, Edit::Delete { pos: p, len: n }) => {
            let (b_out, a_out) = delete_vs_insert(*p, *n, *q, r);
            (a_out, b_out)
        }
        (Edit::Delete { pos: p, len: n }, Edit::Insert { pos: q, text: r }) => {
            delete_vs_insert(*p, *n, *q, r)
        }
        (Edit::Delete { pos: p, len: n }, Edit::Delete { pos: q, len: m }) => (
            delete_past_delete(*p, *n, *q, *m),
            delete_past_delete(*q, *m, *p, *n),
        ),
    }
}

/// Transform delete `[p, p+n)` against a concurrent insert of `r` at `q`.
///
/// Returns `(delete', insert')`.
fn delete_vs_insert(p: usize, n: usize, q: usize, r: &str) -> (Vec<Edit>, Vec<Edit>) {
    let r_len = char_len(r);

    if q <= p {
        // Insert lands before the deleted span.
        (
            vec![Edit::Delete { pos: p.saturating_add(r_len), len: n }],
            vec![Edit::Insert { pos: q, text: r.to_string() }],
        )
    } else if q >= p.saturating_add(n) {
        // Insert lands after the deleted span.
        (
            vec![Edit::Delete { pos: p, len: n }],
            vec![Edit::Insert { pos: q - n, text: r.to_string() }],
        )
    } else {
        // Insert inside the span: anchor it at the span start and split the
        // delete around the inserted text.
        let left = q - p;
        let right = n - left;
        (
            vec![
                Edit::Delete { pos: p, len: left },
                Edit::Delete { pos: p.saturating_add(r_len), len: right },
            ],
            vec![Edit::Insert { pos: p, text: r.to_string() }],
        )
    }
}

/// Rebase delete `[p, p+n)` past a concurrent delete `[q, q+m)`.
fn delete_past_delete(p: usize, n: usize, q: usize, m: usize) -> Vec<Edit> {
    let a_end = p.saturating_add(n);
    let b_end = q.saturating_add(m);

    if a_end <= q {
        return vec![Edit::Delete { pos: p, len: n }];
    }
    if p >= b_end {
        return vec![Edit::Delete { pos: p - m, len: n }];
    }

    // Overlap: keep only the parts of [p, a_end) outside [q, b_end).
    let left = if p < q { q - p } else { 0 };
    let right = a_end.saturating_sub(b_end);
    let len = left + right;
    if len == 0 {
        Vec::new()
    } else {
        vec![Edit::Delete { pos: p.min(q), len }]
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
