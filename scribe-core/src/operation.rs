//! Edit operations over markdown text.
//!
//! Positions and lengths count Unicode scalar values (`char`s), never bytes,
//! so no edit can split a UTF-8 sequence. Edits inside one [`Operation`]
//! apply sequentially: each one sees the text produced by the previous edit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// A primitive edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edit {
    /// Insert `text` before the character at `pos`.
    Insert { pos: usize, text: String },
    /// Remove `len` characters starting at `pos`.
    Delete { pos: usize, len: usize },
}

impl Edit {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Edit::Insert { pos, text: text.into() }
    }

    pub fn delete(pos: usize, len: usize) -> Self {
        Edit::Delete { pos, len }
    }

    /// An edit that changes nothing (empty insert or zero-length delete).
    pub fn is_noop(&self) -> bool {
        match self {
            Edit::Insert { text, .. } => text.is_empty(),
            Edit::Delete { len, .. } => *len == 0,
        }
    }
}

/// An atomic client edit plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub author: Uuid,
    pub document: Uuid,
    /// Version the author believed was current when composing the edit.
    pub base_version: u64,
    /// Client-assigned sequence number, echoed back in acks.
    pub client_seq: u64,
    pub edits: Vec<Edit>,
}

impl Operation {
    pub fn new(author: Uuid, document: Uuid, base_version: u64, edits: Vec<Edit>) -> Self {
        Self {
            author,
            document,
            base_version,
            client_seq: 0,
            edits,
        }
    }

    pub fn with_client_seq(mut self, client_seq: u64) -> Self {
        self.client_seq = client_seq;
        self
    }

    /// Reject structurally malformed operations.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.edits.is_empty() {
            return Err(SyncError::invalid("operation carries no edits"));
        }
        for (i, edit) in self.edits.iter().enumerate() {
            match edit {
                Edit::Insert { text, .. } if text.is_empty() => {
                    return Err(SyncError::invalid(format!("edit {i}: empty insert")));
                }
                Edit::Delete { len: 0, .. } => {
                    return Err(SyncError::invalid(format!("edit {i}: zero-length delete")));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Result of applying edits: the new text and the edits actually applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub text: String,
    /// Edits after clamping, with no-ops dropped.
    pub edits: Vec<Edit>,
}

/// Apply `edits` sequentially to `text`.
///
/// Positions past the end of the text are clamped: an insert past the end
/// appends, a delete running past the end is truncated.
pub fn apply(text: &str, edits: &[Edit]) -> Applied {
    let mut out = text.to_string();
    let mut char_len = out.chars().count();
    let mut effective = Vec::with_capacity(edits.len());

    for edit in edits {
        match edit {
            Edit::Insert { pos, text } => {
                if text.is_empty() {
                    continue;
                }
                if *pos > char_len {
                    log::debug!("Clamped insert at {pos} to end of text ({char_len})");
                }
                let pos = (*pos).min(char_len);
                let at = byte_offset(&out, pos);
                out.insert_str(at, text);
                char_len += text.chars().count();
                effective.push(Edit::Insert { pos, text: text.clone() });
            }
            Edit::Delete { pos, len } => {
                let clamped_pos = (*pos).min(char_len);
                let clamped_len = (*len).min(char_len - clamped_pos);
                if (clamped_pos, clamped_len) != (*pos, *len) {
                    log::debug!("Clamped delete {pos}+{len} to {clamped_pos}+{clamped_len} ({char_len} chars)");
                }
                let (pos, len) = (clamped_pos, clamped_len);
                if len == 0 {
                    continue;
                }
                let start = byte_offset(&out, pos);
                let end = byte_offset(&out, pos + len);
                out.replace_range(start..end, "");
                char_len -= len;
                effective.push(Edit::Delete { pos, len });
            }
        }
    }

    Applied { text: out, edits: effective }
}

/// Clamp `edits` against a text of `char_len` characters exactly as
/// [`apply`] would, without the text itself. No-ops are dropped.
pub fn clamp_edits(mut char_len: usize, edits: &[Edit]) -> Vec<Edit> {
    let mut clamped = Vec::with_capacity(edits.len());
    for edit in edits {
        match edit {
            Edit::Insert { pos, text } => {
                if text.is_empty() {
                    continue;
                }
                clamped.push(Edit::Insert { pos: (*pos).min(char_len), text: text.clone() });
                char_len += text.chars().count();
            }
            Edit::Delete { pos, len } => {
                let pos = (*pos).min(char_len);
                let len = (*len).min(char_len - pos);
                if len == 0 {
                    continue;
                }
                clamped.push(Edit::Delete { pos, len });
                char_len -= len;
            }
        }
    }
    clamped
}

/// Net change in character count caused by applying `edits` as given.
pub fn length_delta(edits: &[Edit]) -> isize {
    edits.iter().fold(0isize, |acc, edit| match edit {
        Edit::Insert { text, .. } => acc.saturating_add(text.chars().count() as isize),
        Edit::Delete { len, .. } => acc.saturating_sub((*len).min(isize::MAX as usize) as isize),
    })
}

/// Byte offset of the `char_pos`-th character (or the end of the text).
fn byte_offset(text: &str, char_pos: usize) -> usize {
    text.char_indices()
        .nth(char_pos)
        .map_or(text.len(), |(i, _)| i)
}

/// Encode an edit batch as JSON for a version record.
pub fn encode_edits(edits: &[Edit]) -> Result<String, SyncError> {
    serde_json::to_string(edits).map_err(|e| SyncError::internal(e.to_string()))
}

/// Decode an edit batch stored in a version record.
pub fn decode_edits(encoded: &str) -> Result<Vec<Edit>, SyncError> {
    serde_json::from_str(encoded).map_err(|e| SyncError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_insert_and_delete() {
        let applied = apply("hello", &[Edit::insert(0, "X"), Edit::delete(1, 2)]);
        assert_eq!(applied.text, "Xllo");
        assert_eq!(applied.edits.len(), 2);
    }

    #[test]
    fn test_apply_sequential_semantics() {
        // Second insert sees the text produced by the first.
        let applied = apply("ac", &[Edit::insert(1, "b"), Edit::insert(3, "d")]);
        assert_eq!(applied.text, "abcd");
    }

    #[test]
    fn test_apply_clamps_past_end() {
        let applied = apply("abc", &[Edit::insert(99, "!")]);
        assert_eq!(applied.text, "abc!");
        assert_eq!(applied.edits, vec![Edit::insert(3, "!")]);

        let applied = apply("abc", &[Edit::delete(1, 50)]);
        assert_eq!(applied.text, "a");
        assert_eq!(applied.edits, vec![Edit::delete(1, 2)]);
    }

    #[test]
    fn test_apply_drops_clamped_away_delete() {
        let applied = apply("abc", &[Edit::delete(10, 4)]);
        assert_eq!(applied.text, "abc");
        assert!(applied.edits.is_empty());
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let applied = apply("héllo wörld", &[Edit::delete(1, 1), Edit::insert(1, "e")]);
        assert_eq!(applied.text, "hello wörld");

        let applied = apply("日本語", &[Edit::insert(2, "の")]);
        assert_eq!(applied.text, "日本の語");
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let doc = Uuid::new_v4();
        let author = Uuid::new_v4();

        assert!(Operation::new(author, doc, 0, vec![]).validate().is_err());
        assert!(Operation::new(author, doc, 0, vec![Edit::insert(0, "")]).validate().is_err());
        assert!(Operation::new(author, doc, 0, vec![Edit::delete(0, 0)]).validate().is_err());
        assert!(Operation::new(author, doc, 0, vec![Edit::insert(0, "a")]).validate().is_ok());
    }

    #[test]
    fn test_edit_batch_json() {
        let edits = vec![Edit::insert(3, "# Title\n"), Edit::delete(0, 2)];
        let encoded = encode_edits(&edits).unwrap();
        assert!(encoded.contains("\"insert\""));
        assert_eq!(decode_edits(&encoded).unwrap(), edits);
        assert!(decode_edits("not json").is_err());
    }

    #[test]
    fn test_edit_noop() {
        assert!(Edit::insert(0, "").is_noop());
        assert!(Edit::delete(9, 0).is_noop());
        assert!(!Edit::delete(0, 1).is_noop());
    }

    #[test]
    fn test_clamp_edits_matches_apply() {
        let edits = vec![
            Edit::insert(usize::MAX, "Y"),
            Edit::delete(usize::MAX, usize::MAX),
            Edit::delete(2, usize::MAX),
            Edit::insert(0, ""),
            Edit::insert(1, "é"),
        ];
        let clamped = clamp_edits(5, &edits);
        assert_eq!(clamped, apply("hello", &edits).edits);
        assert_eq!(clamped, vec![Edit::insert(5, "Y"), Edit::delete(2, 4), Edit::insert(1, "é")]);
    }

    #[test]
    fn test_length_delta() {
        let edits = vec![Edit::insert(0, "日本"), Edit::delete(3, 5)];
        assert_eq!(length_delta(&edits), -3);
        assert_eq!(length_delta(&[]), 0);
    }
}
