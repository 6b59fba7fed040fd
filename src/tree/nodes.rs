//! Node tree stored in the checkpoint region.

use crate::error::{Result, SaveError};
use crate::header::SaveHeader;
use crate::records::{RecordKind, RecordStore, RECORD_HEADER_SIZE};
use crate::types::{CheckpointIndex, GameStateCheckpoint, NodeRecord, Offset};
use tracing::debug;

/// View over the history tree.
///
/// Nodes are addressed by their log offset, which acts as an index into the
/// on-disk arena: every lookup is checked against the committed checkpoint
/// region and the record kind before it is trusted. `parent` is a plain
/// back-reference; ownership of the tree stays with the log.
pub struct NodeTree<'a> {
    log: &'a mut RecordStore,
    header: &'a mut SaveHeader,
}

impl<'a> NodeTree<'a> {
    pub fn new(log: &'a mut RecordStore, header: &'a mut SaveHeader) -> Self {
        Self { log, header }
    }

    /// Read the node at `offset`.
    pub fn node(&mut self, offset: Offset) -> Result<NodeRecord> {
        if !self.header.checkpoint_region().contains(offset) {
            return Err(SaveError::Corruption(format!(
                "Dangling node pointer {}",
                offset
            )));
        }
        let node: NodeRecord = self.log.read(offset.0)?;
        if node.offset != offset {
            return Err(SaveError::Corruption(format!(
                "Node at offset {} claims offset {}",
                offset, node.offset
            )));
        }
        Ok(node)
    }

    /// First root-level node, if the tree is not empty.
    pub fn first_root(&self) -> Option<Offset> {
        let region = self.header.checkpoint_region();
        if region.is_empty() {
            None
        } else {
            Some(region.begin)
        }
    }

    /// Return the child of `parent` (or the root-level node when `parent` is
    /// `None`) for `(name, variables_hash)`, appending it if it does not exist.
    ///
    /// Reuses an existing branch instead of growing the log, so replaying an
    /// explored path always yields the same offsets.
    pub fn get_or_create_child(
        &mut self,
        parent: Option<Offset>,
        name: &str,
        variables_hash: u64,
        dialogue_start: u32,
    ) -> Result<NodeRecord> {
        let parent_node = match parent {
            Some(offset) => Some(self.node(offset)?),
            None => None,
        };

        let start = match &parent_node {
            Some(p) => p.child,
            None => self.first_root().unwrap_or(Offset::NONE),
        };

        let mut last_sibling: Option<NodeRecord> = None;
        for sibling in self.siblings_from(start, parent.unwrap_or(Offset::NONE))? {
            if sibling.name == name && sibling.variables_hash == variables_hash {
                return Ok(sibling);
            }
            last_sibling = Some(sibling);
        }

        let offset = Offset(self.log.end());
        let node = NodeRecord {
            offset,
            name: name.to_string(),
            variables_hash,
            parent: parent.unwrap_or(Offset::NONE),
            child: Offset::NONE,
            sibling: Offset::NONE,
            begin_dialogue: dialogue_start,
            end_dialogue: dialogue_start,
            last_checkpoint: Offset::NONE,
        };
        let written = self.log.append_record(&node)?;
        debug_assert_eq!(written, offset.0);
        self.header.note_checkpoint_append(written, self.log.end());

        match (last_sibling, parent_node) {
            (Some(mut prev), _) => {
                prev.sibling = offset;
                self.log.write_record(prev.offset.0, &prev)?;
            }
            (None, Some(mut p)) => {
                p.child = offset;
                self.log.write_record(p.offset.0, &p)?;
            }
            // First node of the region; it becomes the region's begin.
            (None, None) => {}
        }

        debug!(offset = offset.0, name, variables_hash, "Created node");
        Ok(node)
    }

    /// Children of `parent` in insertion order; root-level nodes for `None`.
    pub fn children(&mut self, parent: Option<Offset>) -> Result<Vec<NodeRecord>> {
        let start = match parent {
            Some(offset) => self.node(offset)?.child,
            None => self.first_root().unwrap_or(Offset::NONE),
        };
        self.siblings_from(start, parent.unwrap_or(Offset::NONE))
    }

    /// `offset` and its ancestors, innermost first.
    pub fn path_to_root(&mut self, offset: Offset) -> Result<Vec<NodeRecord>> {
        let mut path = Vec::new();
        let mut cursor = offset;
        while cursor.is_some() {
            let node = self.node(cursor)?;
            // Parents are always written before their children.
            if node.parent.is_some() && node.parent >= node.offset {
                return Err(SaveError::Corruption(format!(
                    "Node {} points forward to parent {}",
                    node.offset, node.parent
                )));
            }
            cursor = node.parent;
            path.push(node);
        }
        Ok(path)
    }

    /// Grow a node's dialogue extent to cover up to `end_dialogue`.
    pub fn extend_dialogue(&mut self, offset: Offset, end_dialogue: u32) -> Result<NodeRecord> {
        let mut node = self.node(offset)?;
        if end_dialogue > node.end_dialogue {
            node.end_dialogue = end_dialogue;
            self.log.write_record(offset.0, &node)?;
        }
        Ok(node)
    }

    /// Whether advancing one or two records from `offset` reaches the log
    /// end, i.e. the checkpoint at `offset` is the trailing slot of the log.
    pub fn can_append_checkpoint(&mut self, offset: Offset) -> Result<bool> {
        let end = self.log.end();
        if offset.0 >= end {
            return Ok(true);
        }
        let next = self.log.next_record_offset(offset.0)?;
        if next >= end {
            return Ok(true);
        }
        Ok(self.log.next_record_offset(next)? >= end)
    }

    /// Append a dialogue-index record followed by the payload. Returns the
    /// offset of the index record, the checkpoint's durable reference.
    pub fn append_checkpoint(&mut self, payload: &GameStateCheckpoint) -> Result<Offset> {
        if self.header.checkpoint_region().is_empty() {
            return Err(SaveError::InvalidOperation(
                "Cannot checkpoint before any node exists".into(),
            ));
        }

        let index = CheckpointIndex {
            dialogue_index: payload.dialogue_index,
        };
        let index_offset = self.log.append_record(&index)?;
        self.header.note_checkpoint_append(index_offset, self.log.end());

        let payload_offset = self.log.append_record(payload)?;
        self.header.note_checkpoint_append(payload_offset, self.log.end());

        Ok(Offset(index_offset))
    }

    /// Dereference a checkpoint reference returned by `append_checkpoint`.
    pub fn get_checkpoint(&mut self, reference: Offset) -> Result<GameStateCheckpoint> {
        let region = self.header.checkpoint_region();
        if !region.contains(reference) {
            return Err(SaveError::Corruption(format!(
                "Dangling checkpoint reference {}",
                reference
            )));
        }
        let _index: CheckpointIndex = self.log.read(reference.0)?;
        let payload_offset = self.log.next_record_offset(reference.0)?;
        if !region.contains(Offset(payload_offset)) {
            return Err(SaveError::Corruption(format!(
                "Checkpoint {} has no committed payload",
                reference
            )));
        }
        self.log.read(payload_offset)
    }

    /// Save a checkpoint within `node_offset` and point the node at it.
    ///
    /// Checkpoints are never modified once written. When the node's previous
    /// checkpoint is still the trailing pair of the log, sits at the same
    /// dialogue index and holds an equal payload, it is reused instead of
    /// appending a duplicate.
    pub fn save_checkpoint(
        &mut self,
        node_offset: Offset,
        payload: &GameStateCheckpoint,
    ) -> Result<Offset> {
        let mut node = self.node(node_offset)?;

        let last = node.last_checkpoint;
        if let Some(index) = self.committed_checkpoint(last)? {
            if index.dialogue_index == payload.dialogue_index
                && self.can_append_checkpoint(last)?
                && self.get_checkpoint(last)? == *payload
            {
                debug!(reference = last.0, "Reused trailing checkpoint");
                return Ok(last);
            }
        }

        let reference = self.append_checkpoint(payload)?;
        node.last_checkpoint = reference;
        node.end_dialogue = node.end_dialogue.max(payload.dialogue_index.saturating_add(1));
        self.log.write_record(node_offset.0, &node)?;
        Ok(reference)
    }

    /// Index record behind `reference`, if it is a committed checkpoint.
    ///
    /// Pointers written in place by a session that never flushed its header
    /// may point past the committed end, or at a record of the other region
    /// that later reused the offset. Both read as absent.
    fn committed_checkpoint(&mut self, reference: Offset) -> Result<Option<CheckpointIndex>> {
        if !self.header.checkpoint_region().contains(reference) {
            return Ok(None);
        }
        if !self.kind_at(reference, RecordKind::CheckpointIndex)? {
            return Ok(None);
        }
        let payload_offset = Offset(self.log.next_record_offset(reference.0)?);
        if !self.header.checkpoint_region().contains(payload_offset)
            || !self.kind_at(payload_offset, RecordKind::CheckpointPayload)?
        {
            return Ok(None);
        }
        self.log.read(reference.0).map(Some)
    }

    /// Node a link points at, if the link is live.
    ///
    /// A live link addresses a committed node record that knows its own
    /// offset and hangs under `parent`. Anything else is a link written in
    /// place by an interrupted session and ends the chain.
    fn linked_node(&mut self, link: Offset, parent: Offset) -> Result<Option<NodeRecord>> {
        if !self.header.checkpoint_region().contains(link) {
            return Ok(None);
        }
        if !self.kind_at(link, RecordKind::Node)? {
            debug!(offset = link.0, "Ignoring stale node link");
            return Ok(None);
        }
        let node: NodeRecord = self.log.read(link.0)?;
        if node.offset != link || node.parent != parent {
            debug!(offset = link.0, "Ignoring stale node link");
            return Ok(None);
        }
        Ok(Some(node))
    }

    /// Whether a committed record of `kind` starts at `offset`. Offsets that
    /// do not start a record at all count as a mismatch.
    fn kind_at(&mut self, offset: Offset, kind: RecordKind) -> Result<bool> {
        match self.log.prefix_at(offset.0) {
            Ok(prefix) => Ok(prefix.kind == kind),
            Err(e) if e.is_corruption() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Collect the live sibling chain of `parent`'s children starting at
    /// `start`. The chain ends at the first link that is not live.
    fn siblings_from(&mut self, start: Offset, parent: Offset) -> Result<Vec<NodeRecord>> {
        let region = self.header.checkpoint_region();
        // A chain longer than the region can hold records is a cycle.
        let max_steps = region.len() / RECORD_HEADER_SIZE + 1;

        let mut siblings = Vec::new();
        let mut cursor = start;
        while let Some(node) = self.linked_node(cursor, parent)? {
            if siblings.len() as u64 >= max_steps {
                return Err(SaveError::Corruption(format!(
                    "Sibling chain starting at {} does not terminate",
                    start
                )));
            }
            cursor = node.sibling;
            siblings.push(node);
        }
        Ok(siblings)
    }
}
