// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run queue of suspended machines ready to continue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::driver::Completion;
use crate::machine::StateObject;

/// Permission to step a suspended object once more.
///
/// Carries the state the object was paused in; a token whose object has
/// moved on since is stale.
#[derive(Debug, Clone)]
pub struct ResumeToken {
    pub object: Arc<StateObject>,
    pub expected_state: i64,
    pub(crate) completion: Completion,
}

#[derive(Debug, Clone, Default)]
pub struct RunQueue(Arc<Mutex<VecDeque<ResumeToken>>>);

impl RunQueue {
    pub fn post(&self, token: ResumeToken) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push_back(token);
    }

    pub fn pop(&self) -> Option<ResumeToken> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
