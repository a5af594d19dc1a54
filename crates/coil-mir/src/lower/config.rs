// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lowering options.

use std::env;

/// Knobs for the lowering pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerConfig {
    /// Store every named local in the state object, not only the ones live
    /// across a suspension point. Debuggers can then inspect all of them.
    pub hoist_all_locals: bool,
    /// Upper bound on states per function.
    pub max_states: usize,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            hoist_all_locals: false,
            max_states: 65_536,
        }
    }
}

impl LowerConfig {
    /// Defaults overridden by `COIL_HOIST_ALL_LOCALS` and `COIL_MAX_STATES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = env::var("COIL_HOIST_ALL_LOCALS") {
            config.hoist_all_locals = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(n) = env::var("COIL_MAX_STATES").ok().and_then(|v| v.parse().ok()) {
            config.max_states = n;
        }
        config
    }

    pub fn with_hoist_all_locals(mut self, on: bool) -> Self {
        self.hoist_all_locals = on;
        self
    }

    pub fn with_max_states(mut self, max: usize) -> Self {
        self.max_states = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_defaults() {
        env::set_var("COIL_HOIST_ALL_LOCALS", "true");
        env::set_var("COIL_MAX_STATES", "12");
        let config = LowerConfig::from_env();
        env::remove_var("COIL_HOIST_ALL_LOCALS");
        env::remove_var("COIL_MAX_STATES");

        assert_eq!(config, LowerConfig::default().with_hoist_all_locals(true).with_max_states(12));
    }
}
