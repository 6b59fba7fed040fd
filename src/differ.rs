//! Script change detection.
//!
//! Compares the content hash of each freshly loaded narrative node with the
//! hash stored in the header. For changed nodes the player has already read,
//! the reached dialogue sequence is aligned against the new dialogue sequence
//! so callers can tell which history is still valid. Nothing here modifies the
//! reached index.

use crate::reached::ReachedIndex;
use crate::types::ContentHash;
use std::collections::BTreeMap;

/// A narrative node as provided by the script loader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptNode {
    pub name: String,
    pub content_hash: ContentHash,

    /// Text hash of each dialogue line, in order.
    pub dialogues: Vec<u64>,
}

/// One step of an edit script turning the old sequence into the new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogueEdit {
    Keep { old: usize, new: usize },
    Insert { new: usize },
    Delete { old: usize },
}

/// A node whose content changed since it was last recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeChange {
    pub name: String,
    pub previous: ContentHash,
    pub current: ContentHash,

    /// Alignment of reached dialogues against the new script. Empty when the
    /// node has no reached dialogues.
    pub edits: Vec<DialogueEdit>,

    /// Number of leading reached dialogues that are unchanged and still sit
    /// at the same index.
    pub valid_prefix: usize,

    /// Number of reached dialogues.
    pub reached: usize,
}

impl NodeChange {
    /// Reached dialogue indices past the valid prefix.
    pub fn stale_indices(&self) -> std::ops::Range<usize> {
        self.valid_prefix..self.reached
    }

    /// Whether every reached dialogue is still valid.
    pub fn history_intact(&self) -> bool {
        self.valid_prefix == self.reached
    }
}

/// Changed nodes among `nodes`, in script order. Nodes unknown to
/// `recorded` are new, not changed, and are skipped.
pub fn detect_changes(
    recorded: &BTreeMap<String, ContentHash>,
    reached: &ReachedIndex,
    nodes: &[ScriptNode],
) -> Vec<NodeChange> {
    let mut changes = Vec::new();

    for node in nodes {
        let previous = match recorded.get(&node.name) {
            Some(hash) if *hash != node.content_hash => *hash,
            _ => continue,
        };

        let old: Vec<u64> = reached
            .reached_dialogues(&node.name)
            .iter()
            .map(|d| d.text_hash)
            .collect();

        let edits = if old.is_empty() {
            Vec::new()
        } else {
            diff_dialogues(&old, &node.dialogues)
        };

        changes.push(NodeChange {
            name: node.name.clone(),
            previous,
            current: node.content_hash,
            valid_prefix: valid_prefix(&edits),
            reached: old.len(),
            edits,
        });
    }

    changes
}

/// Longest-common-subsequence alignment of `old` against `new`.
pub fn diff_dialogues(old: &[u64], new: &[u64]) -> Vec<DialogueEdit> {
    let (n, m) = (old.len(), new.len());

    // lcs[i][j]: LCS length of old[i..] and new[j..].
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut edits = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            edits.push(DialogueEdit::Keep { old: i, new: j });
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            edits.push(DialogueEdit::Delete { old: i });
            i += 1;
        } else {
            edits.push(DialogueEdit::Insert { new: j });
            j += 1;
        }
    }
    edits.extend((i..n).map(|old| DialogueEdit::Delete { old }));
    edits.extend((j..m).map(|new| DialogueEdit::Insert { new }));
    edits
}

fn valid_prefix(edits: &[DialogueEdit]) -> usize {
    edits
        .iter()
        .take_while(|edit| matches!(edit, DialogueEdit::Keep { old, new } if old == new))
        .count()
}
