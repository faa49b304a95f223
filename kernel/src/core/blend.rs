//! Control-mode blending between the fallback and policy backends.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::protocol::Selection;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    PolicyOnly,
    Blended,
    ShadowPolicy,
    #[default]
    FallbackOnly,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlMode::PolicyOnly => "POLICY_ONLY",
            ControlMode::Blended => "BLENDED",
            ControlMode::ShadowPolicy => "SHADOW_POLICY",
            ControlMode::FallbackOnly => "FALLBACK_ONLY",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which input `blend` used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChoiceSource {
    Fallback,
    Policy,
}

/// Pick the effective selection for `mode`. Both inputs are always computed
/// by the caller so shadow comparisons can be logged.
pub fn blend<'a>(
    mode: ControlMode,
    fallback: &'a Selection,
    policy: &'a Selection,
) -> (&'a Selection, ChoiceSource) {
    match mode {
        ControlMode::PolicyOnly => (policy, ChoiceSource::Policy),
        ControlMode::Blended if policy.is_invalid() => (fallback, ChoiceSource::Fallback),
        ControlMode::Blended => (policy, ChoiceSource::Policy),
        ControlMode::ShadowPolicy | ControlMode::FallbackOnly => {
            (fallback, ChoiceSource::Fallback)
        }
    }
}
