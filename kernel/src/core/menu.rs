//! Per-step catalog of offered actions.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::core::digest::{fnv1a64_hex, sha256_hex};
use crate::core::ids::{Aid, Sid};
use crate::core::types::{NOOP_AID, ToolDesc};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub sid: Sid,
    pub aid: Aid,
    pub name: String,
    pub tags: Vec<String>,
}

impl MenuItem {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_noop(&self) -> bool {
        self.aid.as_str() == NOOP_AID
    }
}

/// Ordered menu with a lazily built `sid -> index` table.
///
/// SIDs are dense from 1 in registration order; the NOOP item, when present,
/// is always last.
#[derive(Debug, Clone, Default)]
pub struct Menu {
    items: Vec<MenuItem>,
    index: OnceLock<HashMap<Sid, usize>>,
}

impl Menu {
    /// Build a menu from registry results, holding back the NOOP tool so it
    /// lands last.
    pub fn build(tools: &[ToolDesc]) -> Self {
        let mut items = Vec::with_capacity(tools.len());
        let mut noop = None;
        for tool in tools {
            if tool.aid.as_str() == NOOP_AID {
                noop = Some(tool);
                continue;
            }
            items.push(item_for(tool, items.len()));
        }
        if let Some(tool) = noop {
            items.push(item_for(tool, items.len()));
        }
        Self::from_items(items)
    }

    /// Wrap pre-assigned items as-is (used by tests and replay diagnostics).
    pub fn from_items(items: Vec<MenuItem>) -> Self {
        Self {
            items,
            index: OnceLock::new(),
        }
    }

    pub fn items(&self) -> &[MenuItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn resolve(&self, sid: Sid) -> Option<&MenuItem> {
        let index = self.index.get_or_init(|| {
            self.items
                .iter()
                .enumerate()
                .map(|(i, item)| (item.sid, i))
                .collect()
        });
        index.get(&sid).map(|i| &self.items[*i])
    }

    /// Canonical string: items sorted by SID, `SID=AID:tags` joined by `|`.
    pub fn canonical_string(&self) -> String {
        let mut sorted: Vec<&MenuItem> = self.items.iter().collect();
        sorted.sort_by_key(|item| item.sid);
        sorted
            .iter()
            .map(|item| {
                let mut tags: Vec<&str> = item.tags.iter().map(String::as_str).collect();
                tags.sort_unstable();
                format!("{}={}:{}", item.sid, item.aid, tags.join(","))
            })
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

fn item_for(tool: &ToolDesc, position: usize) -> MenuItem {
    // Menus are capped far below u16::MAX by the registry size.
    let sid = Sid::new(u16::try_from(position + 1).unwrap_or(u16::MAX));
    MenuItem {
        sid,
        aid: tool.aid.clone(),
        name: tool.name.clone(),
        tags: tool.tags.clone(),
    }
}
