//! Atomic transactions over [`DsState`] with JSON-Patch-like diffs.
//!
//! A [`Tx`] is created, mutated and then consumed by either [`Tx::commit`] or
//! [`Tx::rollback`]. Touching a finished transaction is a compile error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::{Artifact, DsState, TRACKED_SLOTS};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("slot {0} changed but only slots 0..8 are transactional")]
    SlotOutOfRange(u8),
    #[error("commit target diverged from the transaction base")]
    StaleTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("invalid patch path '{0}'")]
    Path(String),
    #[error("patch op {op} at {path} is missing a value")]
    MissingValue { op: &'static str, path: String },
    #[error("add onto occupied {0}")]
    Occupied(String),
    #[error("{op} of absent {path}")]
    Absent { op: &'static str, path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Remove,
    Replace,
}

impl PatchOpKind {
    fn as_str(self) -> &'static str {
        match self {
            PatchOpKind::Add => "add",
            PatchOpKind::Remove => "remove",
            PatchOpKind::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub op: PatchOpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Artifact>,
}

pub type Patch = Vec<PatchRecord>;

fn slot_path(slot: u8) -> String {
    format!("/slots/{slot}")
}

fn parse_slot_path(path: &str) -> Result<u8, PatchError> {
    path.strip_prefix("/slots/")
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|rest| rest.parse::<u8>().ok())
        .ok_or_else(|| PatchError::Path(path.to_string()))
}

/// Diff `base` against `target` over the tracked slots, in ascending slot order.
pub fn compute_patch(base: &DsState, target: &DsState) -> Patch {
    let mut patch = Vec::new();
    for slot in 0..TRACKED_SLOTS {
        match (base.get(slot), target.get(slot)) {
            (None, Some(after)) => patch.push(PatchRecord {
                op: PatchOpKind::Add,
                path: slot_path(slot),
                value: Some(after.clone()),
            }),
            (Some(_), None) => patch.push(PatchRecord {
                op: PatchOpKind::Remove,
                path: slot_path(slot),
                value: None,
            }),
            (Some(before), Some(after)) if before.fingerprint() != after.fingerprint() => {
                patch.push(PatchRecord {
                    op: PatchOpKind::Replace,
                    path: slot_path(slot),
                    value: Some(after.clone()),
                });
            }
            _ => {}
        }
    }
    patch
}

/// Apply `patch` to `state`. On error `state` is left untouched.
pub fn apply_patch(state: &mut DsState, patch: &[PatchRecord]) -> Result<(), PatchError> {
    let mut next = state.clone();
    for record in patch {
        let slot = parse_slot_path(&record.path)?;
        match record.op {
            PatchOpKind::Add | PatchOpKind::Replace => {
                let value = record.value.clone().ok_or_else(|| PatchError::MissingValue {
                    op: record.op.as_str(),
                    path: record.path.clone(),
                })?;
                let filled = next.is_filled(slot);
                if record.op == PatchOpKind::Add && filled {
                    return Err(PatchError::Occupied(record.path.clone()));
                }
                if record.op == PatchOpKind::Replace && !filled {
                    return Err(PatchError::Absent {
                        op: record.op.as_str(),
                        path: record.path.clone(),
                    });
                }
                next.put(slot, value);
            }
            PatchOpKind::Remove => {
                if next.remove(slot).is_none() {
                    return Err(PatchError::Absent {
                        op: record.op.as_str(),
                        path: record.path.clone(),
                    });
                }
            }
        }
    }
    *state = next;
    Ok(())
}

/// Exclusively owned unit of work for one step.
#[derive(Debug)]
pub struct Tx {
    base: DsState,
    tmp: DsState,
}

impl Tx {
    pub fn begin(base: &DsState) -> Self {
        Self {
            base: base.clone(),
            tmp: base.clone(),
        }
    }

    pub fn base(&self) -> &DsState {
        &self.base
    }

    pub fn state(&self) -> &DsState {
        &self.tmp
    }

    pub fn state_mut(&mut self) -> &mut DsState {
        &mut self.tmp
    }

    /// Write the working copy into `target` and return the patch that was applied.
    ///
    /// `target` must still equal the base the transaction started from.
    pub fn commit(self, target: &mut DsState) -> Result<Patch, TxError> {
        if *target != self.base {
            return Err(TxError::StaleTarget);
        }
        let untracked_change = self
            .base
            .iter()
            .map(|(slot, _)| slot)
            .chain(self.tmp.iter().map(|(slot, _)| slot))
            .filter(|slot| *slot >= TRACKED_SLOTS)
            .find(|slot| self.base.get(*slot) != self.tmp.get(*slot));
        if let Some(slot) = untracked_change {
            return Err(TxError::SlotOutOfRange(slot));
        }
        let patch = compute_patch(&self.base, &self.tmp);
        *target = self.tmp;
        Ok(patch)
    }

    /// Discard the working copy.
    pub fn rollback(self) {}
}
