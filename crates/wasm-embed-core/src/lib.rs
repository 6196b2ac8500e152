//! Core embedding layer for wasm-embed.
//!
//! This crate provides the object model for running WebAssembly from a host:
//! - [`WasmEngine`]: configured engine shared by everything below
//! - [`Loader`] / [`Validator`]: turn binaries into validated [`AstModule`]s
//! - [`Store`]: named registry of [`ModuleInstance`]s
//! - [`Executor`]: instantiation and synchronous invocation
//! - [`AsyncExecution`]: invocation on a worker with wait and cancel
//! - [`ImportModule`] / [`HostFunction`]: host functions callable from WebAssembly
//! - [`Value`] / [`ExternRefRegistry`]: values crossing the host boundary
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Configuration snapshot, shared, thread-safe)          │
//! │  - Proposals, fuel metering, epoch interruption         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Loader ──► AstModule ──► Validator           │
//! │  - Import/export descriptors                            │
//! │  - Compiled code cached after validation                │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        Store (registry) + Executor / AsyncExecution     │
//! │  - Named module instances and host modules              │
//! │  - Value marshaling, statistics, cancellation           │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod async_exec;
pub mod compiler;
pub mod engine;
pub mod executor;
pub mod externref;
pub mod host_func;
pub mod instance;
pub mod module;
pub mod statistics;
pub mod store;
pub mod types;
pub mod value;

pub use async_exec::{AsyncExecution, AsyncState};
pub use compiler::{AOT_SECTION_NAME, Compiler};
pub use engine::WasmEngine;
pub use executor::Executor;
pub use externref::{ExternRefKey, ExternRefRegistry, HostObject};
pub use host_func::{CallContext, HostFunction, HostFunctionDef, ImportModule, MemoryView};
pub use instance::{FunctionInstance, GlobalInstance, MemoryInstance, ModuleInstance, TableInstance};
pub use module::{AstModule, Loader, Validator};
pub use statistics::Statistics;
pub use store::{HostState, Store};
pub use types::{
    ExportDescriptor, ExternalKind, ExternalType, FunctionType, GlobalType, ImportDescriptor, Limit,
    MemoryType, Mutability, TableType,
};
pub use value::{Value, ValueKind};
