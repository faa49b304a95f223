//! Sparse slot-addressed content store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::digest::{fnv1a64_hex, sha256_hex};

/// Slots compared by transactions and exposed through goal-context flags.
pub const TRACKED_SLOTS: u8 = 8;

/// First artifact of a run (notes, fetched input).
pub const INITIAL_SLOT: u8 = 0;
/// Summary produced from the initial slots; its absence enables `report`.
pub const SUMMARY_SLOT: u8 = 2;
/// Bootstrap stage marker read into the goal context.
pub const STAGE_SLOT: u8 = 6;
/// Clarification request written on ASK_SUP.
pub const CLARIFY_SLOT: u8 = 7;

/// Typed content stored in one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub provenance: String,
    pub content: String,
    pub size: usize,
}

impl Artifact {
    pub fn new(
        artifact_type: impl Into<String>,
        provenance: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            artifact_type: artifact_type.into(),
            provenance: provenance.into(),
            size: content.len(),
            content,
        }
    }

    /// Change-detection fingerprint: `SHA256(type|provenance|size|content)`.
    pub fn fingerprint(&self) -> String {
        sha256_hex(format!(
            "{}|{}|{}|{}",
            self.artifact_type, self.provenance, self.size, self.content
        ))
    }

    fn digest_entry(&self, slot: u8) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            slot,
            self.artifact_type,
            self.provenance,
            self.size,
            sha256_hex(&self.content)
        )
    }
}

/// Agent working state. A slot either holds exactly one artifact or is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsState {
    slots: BTreeMap<u8, Artifact>,
}

impl DsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: u8) -> Option<&Artifact> {
        self.slots.get(&slot)
    }

    pub fn is_filled(&self, slot: u8) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn put(&mut self, slot: u8, artifact: Artifact) {
        self.slots.insert(slot, artifact);
    }

    pub fn remove(&mut self, slot: u8) -> Option<Artifact> {
        self.slots.remove(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Artifact)> {
        self.slots.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn canonical_string(&self) -> String {
        self.slots
            .iter()
            .map(|(slot, artifact)| artifact.digest_entry(*slot))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn digest(&self) -> String {
        sha256_hex(self.canonical_string())
    }

    /// Loop-detection fingerprint; not a security digest.
    pub fn fast_digest(&self) -> String {
        fnv1a64_hex(self.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_size_tracks_content_bytes() {
        let artifact = Artifact::new("note", "fs.write_note", "héllo");
        assert_eq!(artifact.size, 6);
    }

    #[test]
    fn digest_ignores_insertion_order() {
        let mut a = DsState::new();
        a.put(2, Artifact::new("summary", "t", "s"));
        a.put(0, Artifact::new("note", "t", "n"));
        let mut b = DsState::new();
        b.put(0, Artifact::new("note", "t", "n"));
        b.put(2, Artifact::new("summary", "t", "s"));
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.fast_digest(), b.fast_digest());
    }

    #[test]
    fn digest_changes_with_content() {
        let mut a = DsState::new();
        a.put(0, Artifact::new("note", "t", "n"));
        let mut b = a.clone();
        b.put(0, Artifact::new("note", "t", "m"));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn removing_a_slot_leaves_no_tombstone() {
        let mut state = DsState::new();
        state.put(1, Artifact::new("file", "t", "x"));
        state.remove(1);
        assert_eq!(state, DsState::new());
        assert_eq!(state.digest(), DsState::new().digest());
    }
}
