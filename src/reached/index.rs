//! In-memory projection of the reached region.

use crate::error::{Result, SaveError};
use crate::header::SaveHeader;
use crate::records::{RecordKind, RecordStore};
use crate::types::{ReachedDialogueData, ReachedEndData};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Reached dialogue lines per node, plus the set of reached endings.
///
/// Every per-node list is dense: slot `i` holds the fact for dialogue `i`.
#[derive(Debug, Default)]
pub struct ReachedIndex {
    /// Node name -> reached dialogue facts, indexed by dialogue index.
    dialogues: HashMap<String, Vec<ReachedDialogueData>>,

    /// Reached ending names.
    endings: HashSet<String>,
}

impl ReachedIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay the reached region of the log.
    ///
    /// Fails with `Corruption` if any node ends up with an unset slot.
    pub fn rebuild(log: &mut RecordStore, header: &SaveHeader) -> Result<Self> {
        let region = header.reached_region();

        let mut positions = Vec::new();
        for entry in log.iter_range(region.begin.0, region.end.0) {
            let (offset, kind) = entry?;
            if kind.is_reached_region() {
                positions.push((offset, kind));
            }
        }

        // A dense list can never be longer than the facts backing it.
        let limit = positions
            .iter()
            .filter(|(_, kind)| *kind == RecordKind::ReachedDialogue)
            .count();

        let mut sparse: HashMap<String, Vec<Option<ReachedDialogueData>>> = HashMap::new();
        let mut endings = HashSet::new();

        for (offset, kind) in positions {
            match kind {
                RecordKind::ReachedDialogue => {
                    let data: ReachedDialogueData = log.read(offset)?;
                    let slots = sparse.entry(data.node_name.clone()).or_default();
                    let index = data.dialogue_index as usize;
                    if index >= limit {
                        return Err(SaveError::Corruption(format!(
                            "Reached dialogue {} of node {:?} at offset {} exceeds the {} stored facts",
                            index, data.node_name, offset, limit
                        )));
                    }
                    if slots.len() <= index {
                        slots.resize(index + 1, None);
                    }
                    if slots[index].is_none() {
                        slots[index] = Some(data);
                    }
                }
                RecordKind::ReachedEnd => {
                    let data: ReachedEndData = log.read(offset)?;
                    endings.insert(data.name);
                }
                _ => {}
            }
        }

        let mut dialogues = HashMap::with_capacity(sparse.len());
        for (name, slots) in sparse {
            let mut dense = Vec::with_capacity(slots.len());
            for (index, slot) in slots.into_iter().enumerate() {
                match slot {
                    Some(data) => dense.push(data),
                    None => {
                        return Err(SaveError::Corruption(format!(
                            "Reached dialogue {} of node {:?} is missing",
                            index, name
                        )))
                    }
                }
            }
            dialogues.insert(name, dense);
        }

        debug!(
            nodes = dialogues.len(),
            endings = endings.len(),
            "Rebuilt reached index"
        );

        Ok(Self { dialogues, endings })
    }

    /// Mark a dialogue as reached. Returns `false` if it already was.
    ///
    /// Dialogue indices must be reached in order within a node; skipping
    /// ahead would leave a gap that replay rejects.
    pub fn set_reached(
        &mut self,
        log: &mut RecordStore,
        header: &mut SaveHeader,
        data: ReachedDialogueData,
    ) -> Result<bool> {
        let reached = self
            .dialogues
            .get(&data.node_name)
            .map_or(0, |list| list.len());
        let index = data.dialogue_index as usize;

        if index < reached {
            return Ok(false);
        }
        if index > reached {
            return Err(SaveError::InvalidOperation(format!(
                "Dialogue {} of node {:?} reached before dialogue {}",
                index, data.node_name, reached
            )));
        }

        let offset = log.append_record(&data)?;
        header.note_reached_append(offset, log.end());
        self.dialogues
            .entry(data.node_name.clone())
            .or_default()
            .push(data);
        Ok(true)
    }

    /// Mark an ending as reached. Returns `false` if it already was.
    pub fn set_end_reached(
        &mut self,
        log: &mut RecordStore,
        header: &mut SaveHeader,
        name: &str,
    ) -> Result<bool> {
        if self.endings.contains(name) {
            return Ok(false);
        }

        let data = ReachedEndData {
            name: name.to_string(),
        };
        let offset = log.append_record(&data)?;
        header.note_reached_append(offset, log.end());
        self.endings.insert(data.name);
        Ok(true)
    }

    pub fn is_reached_any_history(&self, node_name: &str, dialogue_index: u32) -> bool {
        self.dialogues
            .get(node_name)
            .map_or(false, |list| (dialogue_index as usize) < list.len())
    }

    pub fn is_end_reached(&self, name: &str) -> bool {
        self.endings.contains(name)
    }

    /// Reached facts of a node, in dialogue order.
    pub fn reached_dialogues(&self, node_name: &str) -> &[ReachedDialogueData] {
        self.dialogues
            .get(node_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn reached_count(&self, node_name: &str) -> usize {
        self.reached_dialogues(node_name).len()
    }

    pub fn endings(&self) -> impl Iterator<Item = &str> {
        self.endings.iter().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.dialogues.len()
    }

    pub fn dialogue_count(&self) -> usize {
        self.dialogues.values().map(Vec::len).sum()
    }

    pub fn ending_count(&self) -> usize {
        self.endings.len()
    }

    /// Forget everything. Used when the log is reset.
    pub fn clear(&mut self) {
        self.dialogues.clear();
        self.endings.clear();
    }
}
