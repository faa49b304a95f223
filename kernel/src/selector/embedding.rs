//! Similarity-ranking backend over locally hashed bag-of-token vectors.
//!
//! Goal text and active tags are embedded into a fixed number of buckets with
//! FNV-1a, L2-normalised, and compared to each menu item's `name + tags`
//! vector. Item vectors are cached per selector.

use serde_json::{Value, json};

use crate::core::cache::BoundedCache;
use crate::core::clock::SharedClock;
use crate::core::context::GoalContext;
use crate::core::digest::fnv1a64;
use crate::core::menu::{Menu, MenuItem};
use crate::core::protocol::Selection;
use crate::selector::{SelectRequest, Selector, SelectorOutput};

pub const DEFAULT_DIMS: usize = 64;

pub struct EmbeddingSelector {
    dims: usize,
    cache: BoundedCache<String, Vec<f64>>,
}

impl EmbeddingSelector {
    pub fn new(dims: usize, cache_capacity: usize, cache_ttl_ms: u64, clock: SharedClock) -> Self {
        Self {
            dims: dims.max(1),
            cache: BoundedCache::new(cache_capacity, cache_ttl_ms, clock),
        }
    }

    pub fn diagnostics(&self) -> Value {
        let (hits, misses) = self.cache.stats();
        json!({
            "dims": self.dims,
            "cache_entries": self.cache.len(),
            "cache_hits": hits,
            "cache_misses": misses,
        })
    }

    fn item_vector(&mut self, item: &MenuItem) -> Vec<f64> {
        let text = format!("{} {}", item.name, item.tags.join(" "));
        let dims = self.dims;
        self.cache
            .get_or_insert_with(text.clone(), || embed(&text, dims))
    }

    fn rank(&mut self, menu: &Menu, goal_context: &str) -> Selection {
        let ctx = GoalContext::parse(goal_context);
        let query = embed(&format!("{} {}", ctx.goal_id, ctx.tags.join(" ")), self.dims);
        let mut best: Option<(f64, &MenuItem)> = None;
        for item in menu.items().iter().filter(|item| !item.is_noop()) {
            let score = cosine(&query, &self.item_vector(item));
            // Items arrive in SID order, so strict comparison keeps the lowest SID on ties.
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, item));
            }
        }
        match best {
            Some((score, item)) if score > 0.0 => Selection::pick(item.sid),
            _ => Selection::Noop,
        }
    }
}

impl Selector for EmbeddingSelector {
    fn select(&mut self, request: &SelectRequest<'_>) -> SelectorOutput {
        SelectorOutput::canonical(self.rank(request.menu, request.goal_context))
    }

    fn name(&self) -> &'static str {
        "embedding"
    }
}

/// Feature-hash `text` into `dims` buckets and L2-normalise.
pub fn embed(text: &str, dims: usize) -> Vec<f64> {
    let mut vector = vec![0.0; dims];
    for token in tokens(text) {
        let bucket = (fnv1a64(token.as_bytes()) % dims as u64) as usize;
        vector[bucket] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_ascii_lowercase)
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::ids::Sid;
    use crate::core::state::DsState;
    use crate::core::types::{NOOP_AID, ToolDesc};

    fn selector() -> EmbeddingSelector {
        EmbeddingSelector::new(DEFAULT_DIMS, 16, 0, ManualClock::new(0))
    }

    fn context(goal: &str, tags: &[&str]) -> String {
        let tags: Vec<String> = tags.iter().map(|t| (*t).to_string()).collect();
        GoalContext::from_state(goal, &DsState::new(), &tags).render()
    }

    #[test]
    fn embeddings_are_unit_length() {
        let v = embed("read file from disk", DEFAULT_DIMS);
        let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
        assert!(embed("", DEFAULT_DIMS).iter().all(|x| *x == 0.0));
    }

    #[test]
    fn picks_most_similar_item() {
        let menu = Menu::build(&[
            ToolDesc::new("fs.read_file", "read file", &["fs"]),
            ToolDesc::new("report.summarize", "summarize report", &["report"]),
        ]);
        let out = selector().rank(&menu, &context("summarize", &["report"]));
        assert_eq!(out, Selection::pick(Sid::new(2)));
    }

    #[test]
    fn no_overlap_or_only_noop_yields_noop() {
        let menu = Menu::build(&[ToolDesc::new(NOOP_AID, "noop", &[])]);
        assert_eq!(selector().rank(&menu, &context("anything", &[])), Selection::Noop);
        assert_eq!(
            selector().rank(&Menu::default(), &context("anything", &[])),
            Selection::Noop
        );
    }

    #[test]
    fn item_vectors_are_cached_across_steps() {
        let menu = Menu::build(&[ToolDesc::new("fs.read_file", "read file", &["fs"])]);
        let mut selector = selector();
        selector.rank(&menu, &context("read", &["fs"]));
        selector.rank(&menu, &context("read", &["fs"]));
        assert_eq!(selector.diagnostics()["cache_hits"], 1);
        assert_eq!(selector.diagnostics()["cache_misses"], 1);
    }
}
