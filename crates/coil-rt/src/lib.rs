// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime for lowered state machines.
//!
//! Interprets the functions emitted by `coil_mir::lower` and drives the
//! state objects they create:
//!
//! ```text
//! let rt = Runtime::builder().load(&lowering).build();
//! let numbers = rt.generator(rt.call("numbers", vec![])?)?;
//! for value in numbers { println!("{}", value?); }
//! ```
//!
//! Async functions suspend by handing an [`Operation`] to the runtime. The
//! object resumes on the thread that completes it; if it had already
//! completed, a [`ResumeToken`] lands on the run queue instead and
//! [`Runtime::run_until_idle`] steps the object again.

mod config;
mod driver;
mod error;
mod host;
mod interp;
mod machine;
mod operation;
mod queue;
mod runtime;
mod sequence;
mod value;

pub use config::RuntimeConfig;
pub use driver::CANCELLED;
pub use error::RuntimeError;
pub use host::{HostFn, HostRegistry};
pub use machine::{RunGuard, Slots, StateObject};
pub use operation::Operation;
pub use queue::{ResumeToken, RunQueue};
pub use runtime::{Runtime, RuntimeBuilder, RUNTIME_FAULT};
pub use sequence::{AsyncGenerator, AsyncTask, Generator};
pub use value::{Cell, Closure, ErrorValue, Value};
