//! Per-pipeline overrides loaded from the TOML config file. Pipeline stage lists and date-cursor
//! shapes are fixed in code (`src/stage.rs`, `src/pipeline.rs`); only the
//! failure policy is operator-tunable.
//!
//! Version dependencies:
//! - serde = "1.0"
//! - toml = "0.8"

use std::collections::HashMap;

use serde::Deserialize;

use crate::pipeline::FailurePolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineOverride {
    #[serde(default)]
    pub lenient: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineOverrides {
    #[serde(flatten)]
    pub by_name: HashMap<String, PipelineOverride>,
}

impl PipelineOverrides {
    /// Resolves the effective policy for `name`, falling back to
    /// `default_policy` when no override is configured.
    pub fn policy_for(&self, name: &str, default_policy: FailurePolicy) -> FailurePolicy {
        match self.by_name.get(name) {
            Some(o) if o.lenient => FailurePolicy::Lenient,
            Some(_) => FailurePolicy::Strict,
            None => default_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_pipeline_falls_back_to_default_policy() {
        let overrides = PipelineOverrides::default();
        assert_eq!(overrides.policy_for("nightly", FailurePolicy::Strict), FailurePolicy::Strict);
    }

    #[test]
    fn lenient_override_takes_precedence() {
        let mut by_name = HashMap::new();
        by_name.insert("nightly".to_string(), PipelineOverride { lenient: true });
        let overrides = PipelineOverrides { by_name };
        assert_eq!(overrides.policy_for("nightly", FailurePolicy::Strict), FailurePolicy::Lenient);
    }
}
