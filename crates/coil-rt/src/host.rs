// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Host functions callable from lowered code.
//!
//! A host function returns `Err` to throw an exception into the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use coil_mir::lower::segment::{CHAIN_CTOR, MONITOR_ENTER, MONITOR_EXIT};

use crate::value::Value;

pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, Value> + Send + Sync>;

#[derive(Clone)]
pub struct HostRegistry {
    fns: HashMap<String, HostFn>,
}

impl HostRegistry {
    /// Registry with no-op lock and constructor-chain hooks.
    pub fn new() -> Self {
        let mut registry = Self { fns: HashMap::new() };
        for name in [MONITOR_ENTER, MONITOR_EXIT, CHAIN_CTOR] {
            registry.register(name, |_| Ok(Value::Unit));
        }
        registry
    }

    /// Add or replace a function.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    ) {
        self.fns.insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&HostFn> {
        self.fns.get(name)
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.fns.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HostRegistry").field("fns", &names).finish()
    }
}
