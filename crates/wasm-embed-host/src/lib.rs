//! Host modules and the VM facade for wasm-embed.
//!
//! Host modules give guests capabilities beyond pure computation. Each one
//! is enabled by a [`HostRegistration`](wasm_embed_common::HostRegistration)
//! kind and defines its imports under its own module name:
//!
//! - [`wasi`]: `wasi_snapshot_preview1`, with args, environment and preopens
//! - [`process`]: `wasmedge_process`, running allow-listed host commands
//!
//! [`Vm`] bundles an engine, a store and the enabled host modules behind one
//! load / validate / instantiate / execute API.
//!
//! # Security Model
//!
//! Guests get nothing by default. WASI sees only the directories it was
//! given as preopens, and the process module refuses every command that is
//! not on its allow list.

pub mod linker;
pub mod process;
pub mod vm;
pub mod wasi;

pub use linker::{HostModule, register_all, register_host};
pub use process::{ProcessModule, ProcessPolicy, ProcessPolicyBuilder};
pub use vm::Vm;
pub use wasi::WasiModule;
