#![forbid(unsafe_code)]

//! Async gate execution: the engine, the dispatcher seam, and worker executors.

pub mod cancel;
pub mod config;
mod context;
pub mod dispatch;
pub mod engine;
pub mod executors;
mod locate;
pub mod logging;

pub use cancel::{CancelHandle, CancelSignal};
pub use dispatch::{DispatchError, Dispatcher, InputContext, WorkerOutput};
pub use engine::{EngineConfig, GateEngine};
