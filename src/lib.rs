//! Stateful Python code-execution coordinator.
//!
//! One [`Executor`] serves one session: it launches a persistent
//! interactive kernel, fronts any number of tool providers behind an
//! in-process tool service, and routes every tool invocation through a
//! host approval channel before it reaches a provider.
//!
//! ## Subsystems
//!
//! - [`kernel`]: kernel bus, child-process transport, fragment demux
//! - [`service`]: the loopback tool service (`POST /run` + approvals)
//! - [`approval`]: request/decision correlation with timeouts
//! - [`codegen`]: typed per-tool Python modules the kernel imports
//! - [`budget`]: execution-budget accounting that excludes approval
//!   wait time
//! - [`executor`]: the public surface tying the above together
//!
//! Provider connectivity (specs, sessions, registry) lives in the
//! `sandcell-providers` crate; wire types in `sandcell-protocol`.

pub mod approval;
pub mod budget;
pub mod codegen;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod kernel;
pub mod service;

pub use approval::{ApprovalBroker, ApprovalError};
pub use config::{ExecutorConfig, KernelSpec};
pub use errors::{ExecutorError, ExecutorResult};
pub use events::{
    ApprovalRequestEvent, ExecutionChunk, ExecutionError, ExecutionResult, ImageOutput,
    StreamEvent,
};
pub use executor::{Executor, KernelFactory, ProcessKernelFactory, StreamOptions};

// Provider-facing types hosts need to register providers.
pub use sandcell_providers::{ProviderError, ProviderSpec, RemoteTransport};
