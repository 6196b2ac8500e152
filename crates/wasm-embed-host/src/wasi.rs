//! The `wasi_snapshot_preview1` host module.
//!
//! Registration defines the preview1 imports with an empty context. [`WasiModule::init`]
//! replaces that context with the program's arguments, environment and
//! preopened directories.

use tracing::{debug, info};
use wasmtime_wasi::preview1::add_to_linker_sync;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use wasm_embed_common::{RuntimeError, WasiError};
use wasm_embed_core::{HostState, ModuleInstance, Store};

/// Import module name guests link against.
pub const MODULE_NAME: &str = "wasi_snapshot_preview1";

/// Handle to the WASI module installed in a [`Store`].
#[derive(Debug, Clone)]
pub struct WasiModule {
    store: Store,
}

impl WasiModule {
    pub(crate) fn install(store: &Store) -> Result<(Self, ModuleInstance), RuntimeError> {
        let instance = store.install_host(MODULE_NAME, |linker, _| {
            add_to_linker_sync(linker, HostState::wasi_mut)
        })?;

        info!(module = MODULE_NAME, "WASI host module registered");
        Ok((
            Self {
                store: store.clone(),
            },
            instance,
        ))
    }

    /// Reset the WASI context.
    ///
    /// # Arguments
    ///
    /// * `args` - Program arguments; the first is the program name
    /// * `envs` - Environment entries as `KEY=VALUE`
    /// * `preopens` - Directories as `guest:host`, or a single path used for both
    ///
    /// The guest inherits the host's stdio. Any exit code recorded by an
    /// earlier run is cleared.
    pub fn init<A, E, P>(&self, args: &[A], envs: &[E], preopens: &[P]) -> Result<(), RuntimeError>
    where
        A: AsRef<str>,
        E: AsRef<str>,
        P: AsRef<str>,
    {
        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdio().args(args);

        for env in envs {
            let (key, value) = parse_env(env.as_ref())?;
            builder.env(key, value);
        }

        for preopen in preopens {
            let (guest, host) = parse_preopen(preopen.as_ref());
            builder
                .preopened_dir(host, guest, DirPerms::all(), FilePerms::all())
                .map_err(|e| {
                    debug!(preopen = preopen.as_ref(), error = %e, "Preopen failed");
                    WasiError::PreopenFailed {
                        path: preopen.as_ref().to_string(),
                    }
                })?;
        }

        let ctx = builder.build_p1();
        self.store.with_host_state(|state| state.set_wasi(ctx))?;

        debug!(
            args = args.len(),
            envs = envs.len(),
            preopens = preopens.len(),
            "WASI context initialized"
        );
        Ok(())
    }

    /// Exit code the guest passed to `proc_exit`, or `None` if it has not exited.
    pub fn exit_code(&self) -> Result<Option<i32>, RuntimeError> {
        self.store.with_host_state(|state| state.wasi_exit_code())
    }
}

fn parse_env(entry: &str) -> Result<(&str, &str), WasiError> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(WasiError::EnvironmentError {
            reason: format!("expected KEY=VALUE, got {entry:?}"),
        }),
    }
}

/// Split a preopen into `(guest, host)`.
fn parse_preopen(entry: &str) -> (&str, &str) {
    entry.split_once(':').unwrap_or((entry, entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(parse_env("A=1").unwrap(), ("A", "1"));
        assert_eq!(parse_env("A=").unwrap(), ("A", ""));
        assert_eq!(parse_env("A=b=c").unwrap(), ("A", "b=c"));
        assert!(parse_env("A").is_err());
        assert!(parse_env("=1").is_err());
    }

    #[test]
    fn test_parse_preopen() {
        assert_eq!(parse_preopen("/sandbox:/tmp/data"), ("/sandbox", "/tmp/data"));
        assert_eq!(parse_preopen("."), (".", "."));
    }
}
