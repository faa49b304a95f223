//! Decision backends behind one `Selector` contract.

pub mod embedding;
pub mod external;
pub mod heuristic;

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::blend::ControlMode;
use crate::core::clock::SharedClock;
use crate::core::menu::Menu;
use crate::core::protocol::Selection;
use crate::io::config::{KernelConfig, PolicyBackendKind};
use crate::io::process::Sandbox;

pub use embedding::EmbeddingSelector;
pub use external::ExternalProcessSelector;
pub use heuristic::HeuristicSelector;

/// Everything a backend may look at for one decision.
#[derive(Debug, Clone, Copy)]
pub struct SelectRequest<'a> {
    pub menu: &'a Menu,
    pub goal_context: &'a str,
    pub state_digest: &'a str,
    pub control_mode: ControlMode,
    /// Canonical JSON of the request inputs.
    pub inputs_json: &'a str,
}

/// A decision plus the exact text it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorOutput {
    pub selection: Selection,
    pub raw: String,
}

impl SelectorOutput {
    /// Output whose raw text is the canonical protocol form.
    pub fn canonical(selection: Selection) -> Self {
        let raw = selection.to_protocol();
        Self { selection, raw }
    }
}

pub trait Selector {
    fn select(&mut self, request: &SelectRequest<'_>) -> SelectorOutput;

    /// False when identical inputs may produce different outputs.
    fn is_deterministic(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

/// Closed set of backends the kernel can be configured with.
pub enum SelectorBackend {
    Heuristic(HeuristicSelector),
    ExternalProcess(ExternalProcessSelector),
    Embedding(EmbeddingSelector),
}

impl SelectorBackend {
    /// Backend named by `config.policy.backend`. `sandbox` is only used by the
    /// external backend.
    pub fn from_config(
        config: &KernelConfig,
        sandbox: Box<dyn Sandbox>,
        clock: SharedClock,
    ) -> Result<Self> {
        Ok(match config.policy.backend {
            PolicyBackendKind::Heuristic => SelectorBackend::Heuristic(HeuristicSelector),
            PolicyBackendKind::External => SelectorBackend::ExternalProcess(
                ExternalProcessSelector::new(config, sandbox, clock)?,
            ),
            PolicyBackendKind::Embedding => SelectorBackend::Embedding(EmbeddingSelector::new(
                config.embedding.dims,
                config.embedding.cache_capacity,
                config.embedding.cache_ttl_ms,
                clock,
            )),
        })
    }

    /// Backend-specific state worth recording next to each decision.
    pub fn diagnostics(&self) -> Value {
        match self {
            SelectorBackend::Heuristic(_) => json!({}),
            SelectorBackend::ExternalProcess(selector) => selector.diagnostics(),
            SelectorBackend::Embedding(selector) => selector.diagnostics(),
        }
    }
}

impl Selector for SelectorBackend {
    fn select(&mut self, request: &SelectRequest<'_>) -> SelectorOutput {
        match self {
            SelectorBackend::Heuristic(selector) => selector.select(request),
            SelectorBackend::ExternalProcess(selector) => selector.select(request),
            SelectorBackend::Embedding(selector) => selector.select(request),
        }
    }

    fn is_deterministic(&self) -> bool {
        match self {
            SelectorBackend::Heuristic(selector) => selector.is_deterministic(),
            SelectorBackend::ExternalProcess(selector) => selector.is_deterministic(),
            SelectorBackend::Embedding(selector) => selector.is_deterministic(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SelectorBackend::Heuristic(selector) => selector.name(),
            SelectorBackend::ExternalProcess(selector) => selector.name(),
            SelectorBackend::Embedding(selector) => selector.name(),
        }
    }
}

/// The pair of backends consulted on every step.
pub struct Selectors {
    pub fallback: HeuristicSelector,
    pub policy: SelectorBackend,
}

impl Selectors {
    pub fn new(policy: SelectorBackend) -> Self {
        Self {
            fallback: HeuristicSelector,
            policy,
        }
    }
}
