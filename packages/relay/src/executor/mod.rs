// packages/relay/src/executor/mod.rs
//! Command execution
//!
//! - **Request**: execution request/response wire types
//! - **Engine**: resolves, runs and reports one command invocation
//! - **Env**: the `COG_*` calling environment
//! - **Output**: command stdout directives and body parsing
//! - **Dynconfig**: per-bundle configuration files
//! - **Work Queue**: bounded queue feeding the worker tasks
//!
//! # Flow
//!
//! ```text
//! bus ──▶ WorkQueue ──▶ worker ──▶ ExecutionEngine::execute
//!                                     ├─ catalog lookup
//!                                     ├─ pool.acquire ─▶ Environment::execute
//!                                     ├─ parse_output
//!                                     └─ pool.release / pool.remove
//!                                             │
//!                     reply_to ◀── ExecutionResponse
//! ```

pub mod dynconfig;
pub mod engine;
pub mod env;
pub mod output;
pub mod request;
pub mod work_queue;

// Re-export commonly used types
pub use dynconfig::{DynamicConfigStore, DynamicConfigUpdate};
pub use engine::ExecutionEngine;
pub use env::{is_reserved, CallingEnvironment, RESERVED_PREFIXES};
pub use output::parse_output;
pub use request::{
    recover_reply_to, ChatRoom, ExecutionRequest, ExecutionResponse, Requestor, ResponseStatus,
};
pub use work_queue::{QueueStats, WorkQueue};
