// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime options.

use std::env;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Blocks one top-level call may execute before it is aborted.
    /// `None` means unlimited.
    pub step_budget: Option<u64>,
}

impl RuntimeConfig {
    /// Defaults overridden by `COIL_STEP_BUDGET`.
    pub fn from_env() -> Self {
        Self {
            step_budget: env::var("COIL_STEP_BUDGET").ok().and_then(|v| v.parse().ok()),
        }
    }

    pub fn with_step_budget(mut self, budget: u64) -> Self {
        self.step_budget = Some(budget);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_budget_means_unlimited() {
        env::set_var("COIL_STEP_BUDGET", "lots");
        assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default());
        env::set_var("COIL_STEP_BUDGET", "100");
        assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default().with_step_budget(100));
        env::remove_var("COIL_STEP_BUDGET");
    }
}
