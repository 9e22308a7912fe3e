//! Load bindgen-style WebAssembly modules and call across their boundary.
//!
//! A [`Loader`] turns a [`ModuleSource`] (a URL, a response, raw bytes, a
//! precompiled module or a future yielding any of these) into an
//! [`InstantiatedHandle`]. The handle owns the module's linear memory view,
//! its allocator exports, a dispatch table of host callbacks and a
//! single-slot exception store.
//!
//! ```rust,no_run
//! # async fn run(wasm: Vec<u8>) -> anyhow::Result<()> {
//! use wasmer_bridge::{Loader, LoaderConfig};
//!
//! let loader = Loader::new(LoaderConfig::default());
//! let mut handle = loader.load(wasm, None).await?;
//!
//! let add = handle.register_binary(|a, b| Ok((a + b, 0)))?;
//! assert_eq!(handle.call_binary(add, 2, 3)?, (5, 0));
//!
//! handle.start_app()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]

mod config;
mod env;
mod error;
mod exception;
mod handle;
mod hash;
pub mod http;
mod loader;
mod memory;
mod source;
mod table;

pub use crate::{
    config::{ConfigError, ExportNames, LoaderConfig},
    env::BridgeEnv,
    error::{BoundaryViolation, BridgeError, LoadError},
    exception::{Exception, ExceptionOrigin, ExceptionStore, ModuleException},
    handle::{CallStatus, InstantiatedHandle},
    hash::{ModuleHash, ParseModuleHashError},
    loader::{ImportsHook, LoadOptions, Loader},
    memory::{GuestBuffer, LinearMemory},
    source::{ModuleSource, PrecompiledModule},
    table::{CallbackShape, DispatchTable, TableIndex},
};

/// Re-exported so hosts can build their own imports and memory types without
/// depending on a matching `wasmer` version.
pub use wasmer;
