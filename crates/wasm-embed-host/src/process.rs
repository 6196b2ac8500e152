//! The `wasmedge_process` host module.
//!
//! Guests describe a command piece by piece (`set_prog_name`, `add_arg`,
//! `add_env`, `add_stdin`, `set_timeout`), start it with `run`, then copy the
//! captured output back into their memory. Only commands on the allow list
//! are spawned; anything else fails with exit code `-1` and a
//! permission-denied message on the captured stderr.
//!
//! # Memory Protocol
//!
//! Strings are passed as `(ptr, len)` pairs into the caller's exported
//! `memory`. `get_stdout(ptr)` / `get_stderr(ptr)` write the whole captured
//! stream at `ptr`; guests size the buffer with the matching `*_len` call.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wasmtime::{Caller, Extern, Linker, Memory};

use wasm_embed_common::{HostFunctionError, ProcessSection, RuntimeError};
use wasm_embed_core::{HostState, ModuleInstance, Store};

/// Import module name guests link against.
pub const MODULE_NAME: &str = "wasmedge_process";

/// Timeout applied when the guest does not call `set_timeout`.
pub const DEFAULT_TIMEOUT_MS: u32 = 10_000;

const ETIMEDOUT: i32 = 110;
const EINVAL: i32 = 22;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Which commands the process module may spawn.
///
/// Nothing is allowed by default; each command must be granted by name
/// unless `allow_all` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessPolicy {
    /// Command names that may be spawned.
    pub allowed_commands: BTreeSet<String>,

    /// Allow every command.
    pub allow_all: bool,
}

impl ProcessPolicy {
    /// A policy that refuses every command.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn builder() -> ProcessPolicyBuilder {
        ProcessPolicyBuilder::default()
    }

    /// Check whether `command` may be spawned.
    pub fn is_allowed(&self, command: &str) -> bool {
        self.allow_all || self.allowed_commands.contains(command)
    }
}

impl From<&ProcessSection> for ProcessPolicy {
    fn from(section: &ProcessSection) -> Self {
        Self {
            allowed_commands: section.allowed_commands.iter().cloned().collect(),
            allow_all: section.allow_all,
        }
    }
}

/// Builder for [`ProcessPolicy`].
#[derive(Debug, Default)]
#[must_use]
pub struct ProcessPolicyBuilder {
    policy: ProcessPolicy,
}

impl ProcessPolicyBuilder {
    /// Allow a single command by name.
    pub fn allow_command(mut self, command: impl Into<String>) -> Self {
        self.policy.allowed_commands.insert(command.into());
        self
    }

    /// Allow several commands.
    pub fn allow_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy
            .allowed_commands
            .extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn allow_all(mut self, allow: bool) -> Self {
        self.policy.allow_all = allow;
        self
    }

    pub fn build(self) -> ProcessPolicy {
        self.policy
    }
}

/// The command a guest is assembling. Reset after every `run`.
#[derive(Debug, Clone)]
struct CommandRequest {
    name: String,
    args: Vec<String>,
    envs: BTreeMap<String, String>,
    stdin: Vec<u8>,
    timeout: Duration,
}

impl Default for CommandRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            args: Vec::new(),
            envs: BTreeMap::new(),
            stdin: Vec::new(),
            timeout: Duration::from_millis(u64::from(DEFAULT_TIMEOUT_MS)),
        }
    }
}

#[derive(Debug, Default)]
struct CommandOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
}

impl CommandOutput {
    fn failed(stderr: String) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into_bytes(),
            exit_code: -1,
        }
    }

    fn denied(denial: &HostFunctionError) -> Self {
        Self::failed(format!("{denial}\n"))
    }
}

fn permission_denied(command: &str) -> HostFunctionError {
    HostFunctionError::PermissionDenied {
        resource: format!(
            "Command \"{command}\" is not in the white list. Please use \
             --allow-command={command} or --allow-command-all to add \"{command}\" command \
             into the white list."
        ),
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Per-store state of the process module, kept as a [`HostState`] extension.
#[derive(Debug, Default)]
struct ProcessEnv {
    policy: ProcessPolicy,
    request: CommandRequest,
    output: CommandOutput,
}

impl ProcessEnv {
    fn new(policy: ProcessPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    fn stream(&self, stream: Stream) -> &[u8] {
        match stream {
            Stream::Stdout => &self.output.stdout,
            Stream::Stderr => &self.output.stderr,
        }
    }

    fn run(&mut self) -> i32 {
        let request = std::mem::take(&mut self.request);
        self.output = if self.policy.is_allowed(&request.name) {
            run_command(&request)
        } else {
            let denial = permission_denied(&request.name);
            warn!(command = %request.name, error = %denial, "Command not in the allowed list");
            CommandOutput::denied(&denial)
        };
        self.output.exit_code
    }
}

/// Handle to the process module installed in a [`Store`].
#[derive(Debug, Clone)]
pub struct ProcessModule {
    store: Store,
}

impl ProcessModule {
    /// Define the guest functions in `store` and attach `policy`.
    pub(crate) fn install(store: &Store, policy: ProcessPolicy) -> Result<(Self, ModuleInstance), RuntimeError> {
        let instance = store.install_host(MODULE_NAME, |linker, _| define(linker))?;
        store.with_host_state(|state| state.insert_extension(ProcessEnv::new(policy)))?;

        info!(module = MODULE_NAME, "Process host module registered");
        Ok((
            Self {
                store: store.clone(),
            },
            instance,
        ))
    }

    /// Add `command` to the allow list.
    pub fn allow_command(&self, command: impl Into<String>) -> Result<(), RuntimeError> {
        let command = command.into();
        self.with_env(|env| {
            env.policy.allowed_commands.insert(command);
        })
    }

    /// Allow every command.
    pub fn allow_all(&self) -> Result<(), RuntimeError> {
        self.with_env(|env| env.policy.allow_all = true)
    }

    /// Commands on the allow list, sorted.
    pub fn allowed_commands(&self) -> Result<Vec<String>, RuntimeError> {
        self.with_env(|env| env.policy.allowed_commands.iter().cloned().collect())
    }

    /// Snapshot of the current policy.
    pub fn policy(&self) -> Result<ProcessPolicy, RuntimeError> {
        self.with_env(|env| env.policy.clone())
    }

    fn with_env<R>(&self, f: impl FnOnce(&mut ProcessEnv) -> R) -> Result<R, RuntimeError> {
        self.store
            .with_host_state(|state| state.extension_mut::<ProcessEnv>().map(f))?
            .ok_or_else(missing_state)
    }
}

fn missing_state() -> RuntimeError {
    RuntimeError::engine("process module state is missing from the store")
}

fn env_mut<'a>(caller: &'a mut Caller<'_, HostState>) -> Result<&'a mut ProcessEnv, RuntimeError> {
    caller
        .data_mut()
        .extension_mut::<ProcessEnv>()
        .ok_or_else(missing_state)
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, HostFunctionError> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or(HostFunctionError::MissingMemory)
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> Result<Vec<u8>, HostFunctionError> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&*caller);
    let start = ptr as usize;

    start
        .checked_add(len as usize)
        .and_then(|end| data.get(start..end))
        .map(<[u8]>::to_vec)
        .ok_or(HostFunctionError::MemoryOutOfBounds {
            offset: u64::from(ptr),
            len: u64::from(len),
        })
}

fn read_string(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> Result<String, HostFunctionError> {
    String::from_utf8(read_guest(caller, ptr, len)?).map_err(|_| HostFunctionError::InvalidArgument {
        reason: "string is not valid UTF-8".to_string(),
    })
}

fn copy_out(caller: &mut Caller<'_, HostState>, ptr: u32, stream: Stream) -> Result<(), RuntimeError> {
    let memory = guest_memory(caller)?;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    let bytes = state
        .extension::<ProcessEnv>()
        .ok_or_else(missing_state)?
        .stream(stream);

    let start = ptr as usize;
    let Some(target) = start
        .checked_add(bytes.len())
        .and_then(|end| data.get_mut(start..end))
    else {
        warn!(ptr = ptr, len = bytes.len(), "Output buffer out of bounds");
        return Err(HostFunctionError::MemoryOutOfBounds {
            offset: u64::from(ptr),
            len: bytes.len() as u64,
        }
        .into());
    };

    target.copy_from_slice(bytes);
    Ok(())
}

fn stream_len(caller: &Caller<'_, HostState>, stream: Stream) -> Result<u32, RuntimeError> {
    let env = caller
        .data()
        .extension::<ProcessEnv>()
        .ok_or_else(missing_state)?;
    u32::try_from(env.stream(stream).len())
        .map_err(|_| RuntimeError::range("captured output exceeds 4 GiB"))
}

fn link_error(name: &str, e: &anyhow::Error) -> anyhow::Error {
    RuntimeError::link(format!("Failed to register {MODULE_NAME}::{name}: {e}")).into()
}

/// Define every guest function of the module on `linker`.
fn define(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_set_prog_name",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<()> {
                let name = read_string(&mut caller, ptr, len).map_err(RuntimeError::from)?;
                env_mut(&mut caller)?.request.name = name;
                Ok(())
            },
        )
        .map_err(|e| link_error("set_prog_name", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_add_arg",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<()> {
                let arg = read_string(&mut caller, ptr, len).map_err(RuntimeError::from)?;
                env_mut(&mut caller)?.request.args.push(arg);
                Ok(())
            },
        )
        .map_err(|e| link_error("add_arg", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_add_env",
            |mut caller: Caller<'_, HostState>,
             key_ptr: u32,
             key_len: u32,
             value_ptr: u32,
             value_len: u32|
             -> anyhow::Result<()> {
                let key = read_string(&mut caller, key_ptr, key_len).map_err(RuntimeError::from)?;
                let value =
                    read_string(&mut caller, value_ptr, value_len).map_err(RuntimeError::from)?;
                env_mut(&mut caller)?.request.envs.insert(key, value);
                Ok(())
            },
        )
        .map_err(|e| link_error("add_env", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_add_stdin",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<()> {
                let bytes = read_guest(&mut caller, ptr, len).map_err(RuntimeError::from)?;
                env_mut(&mut caller)?.request.stdin.extend_from_slice(&bytes);
                Ok(())
            },
        )
        .map_err(|e| link_error("add_stdin", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_set_timeout",
            |mut caller: Caller<'_, HostState>, timeout_ms: u32| -> anyhow::Result<()> {
                env_mut(&mut caller)?.request.timeout = Duration::from_millis(u64::from(timeout_ms));
                Ok(())
            },
        )
        .map_err(|e| link_error("set_timeout", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_run",
            |mut caller: Caller<'_, HostState>| -> anyhow::Result<i32> {
                Ok(env_mut(&mut caller)?.run())
            },
        )
        .map_err(|e| link_error("run", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_get_exit_code",
            |mut caller: Caller<'_, HostState>| -> anyhow::Result<i32> {
                Ok(env_mut(&mut caller)?.output.exit_code)
            },
        )
        .map_err(|e| link_error("get_exit_code", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_get_stdout_len",
            |caller: Caller<'_, HostState>| -> anyhow::Result<u32> {
                Ok(stream_len(&caller, Stream::Stdout)?)
            },
        )
        .map_err(|e| link_error("get_stdout_len", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_get_stdout",
            |mut caller: Caller<'_, HostState>, ptr: u32| -> anyhow::Result<()> {
                Ok(copy_out(&mut caller, ptr, Stream::Stdout)?)
            },
        )
        .map_err(|e| link_error("get_stdout", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_get_stderr_len",
            |caller: Caller<'_, HostState>| -> anyhow::Result<u32> {
                Ok(stream_len(&caller, Stream::Stderr)?)
            },
        )
        .map_err(|e| link_error("get_stderr_len", &e))?;

    linker
        .func_wrap(
            MODULE_NAME,
            "wasmedge_process_get_stderr",
            |mut caller: Caller<'_, HostState>, ptr: u32| -> anyhow::Result<()> {
                Ok(copy_out(&mut caller, ptr, Stream::Stderr)?)
            },
        )
        .map_err(|e| link_error("get_stderr", &e))?;

    Ok(())
}

/// Spawn `request`, feed its stdin and collect its output.
///
/// The child sees only the environment the guest added. A child still
/// running at the deadline is killed and reports `ETIMEDOUT`.
fn run_command(request: &CommandRequest) -> CommandOutput {
    let start = Instant::now();

    let mut child = match Command::new(&request.name)
        .args(&request.args)
        .env_clear()
        .envs(&request.envs)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(command = %request.name, error = %e, "Failed to spawn command");
            return CommandOutput::failed(format!("{e}\n"));
        }
    };

    let stdin = child.stdin.take().map(|mut pipe| {
        let input = request.stdin.clone();
        thread::spawn(move || {
            if let Err(e) = pipe.write_all(&input) {
                debug!(error = %e, "Child closed stdin early");
            }
        })
    });
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let exit_code = wait_with_timeout(&mut child, request.timeout);

    if let Some(handle) = stdin {
        let _ = handle.join();
    }
    let output = CommandOutput {
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        exit_code,
    };

    info!(
        command = %request.name,
        exit_code = output.exit_code,
        stdout_len = output.stdout.len(),
        stderr_len = output.stderr.len(),
        duration_ms = start.elapsed().as_millis(),
        "Command finished"
    );

    output
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!(error = %e, "Failed to read child output");
        }
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> i32 {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return exit_status_code(status),
            Ok(None) if Instant::now() >= deadline => {
                warn!(timeout_ms = timeout.as_millis(), "Command timed out, killing it");
                if let Err(e) = child.kill() {
                    warn!(error = %e, "Failed to kill timed out command");
                }
                let _ = child.wait();
                return ETIMEDOUT;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!(error = %e, "Failed to wait for command");
                return EINVAL;
            }
        }
    }
}

/// The low byte of the exit status, sign-extended. Signals report `-1`.
#[allow(clippy::cast_possible_truncation)]
fn exit_status_code(status: ExitStatus) -> i32 {
    status.code().map_or(-1, |code| i32::from(code as i8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, args: &[&str]) -> CommandRequest {
        CommandRequest {
            name: name.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            ..CommandRequest::default()
        }
    }

    // ==========================================================================
    // Test: Policy
    // ==========================================================================

    #[test]
    fn test_policy_none_refuses_everything() {
        let policy = ProcessPolicy::none();
        assert!(!policy.is_allowed("echo"));
        assert!(!policy.is_allowed(""));
    }

    #[test]
    fn test_policy_builder() {
        let policy = ProcessPolicy::builder()
            .allow_command("echo")
            .allow_commands(["ls", "cat"])
            .build();

        assert!(policy.is_allowed("echo"));
        assert!(policy.is_allowed("cat"));
        assert!(!policy.is_allowed("rm"));

        let policy = ProcessPolicy::builder().allow_all(true).build();
        assert!(policy.is_allowed("rm"));
    }

    #[test]
    fn test_policy_from_section() {
        let section = ProcessSection {
            allowed_commands: vec!["echo".to_string(), "echo".to_string()],
            allow_all: false,
        };
        let policy = ProcessPolicy::from(&section);
        assert_eq!(policy.allowed_commands.len(), 1);
        assert!(policy.is_allowed("echo"));
    }

    // ==========================================================================
    // Test: Run
    // ==========================================================================

    #[test]
    fn test_denied_command_resets_request() {
        let mut env = ProcessEnv::new(ProcessPolicy::none());
        env.request = request("rm", &["-rf", "/"]);

        assert_eq!(env.run(), -1);
        let stderr = String::from_utf8(env.output.stderr.clone()).unwrap();
        assert!(stderr.starts_with("Permission denied: Command \"rm\""));
        assert!(stderr.contains("--allow-command=rm"));
        assert_eq!(stderr, format!("{}\n", permission_denied("rm")));
        assert!(env.output.stdout.is_empty());

        assert!(env.request.name.is_empty());
        assert!(env.request.args.is_empty());
        assert_eq!(env.request.timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn test_denial_is_permission_error() {
        let denial = permission_denied("curl");
        assert!(matches!(
            &denial,
            HostFunctionError::PermissionDenied { resource } if resource.starts_with("Command \"curl\"")
        ));
        let err: RuntimeError = denial.into();
        assert!(err.to_string().contains("Permission denied: Command \"curl\""));
    }

    #[test]
    fn test_missing_binary_fails() {
        let output = run_command(&request("/nonexistent/wasm-embed-cmd", &[]));
        assert_eq!(output.exit_code, -1);
        assert!(!output.stderr.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_captures_output() {
        let mut req = request("/bin/sh", &["-c", "cat; echo err >&2; exit 3"]);
        req.stdin = b"hello".to_vec();

        let output = run_command(&req);
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.stderr, b"err\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_sees_only_guest_env() {
        let mut req = request("/bin/sh", &["-c", "echo \"$GREETING:$HOME\""]);
        req.envs.insert("GREETING".to_string(), "hi".to_string());

        let output = run_command(&req);
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, b"hi:\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_timeout() {
        let mut req = request("/bin/sh", &["-c", "exec sleep 5"]);
        req.timeout = Duration::from_millis(50);

        let start = Instant::now();
        let output = run_command(&req);
        assert_eq!(output.exit_code, ETIMEDOUT);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_negative_exit_code() {
        let output = run_command(&request("/bin/sh", &["-c", "exit 255"]));
        assert_eq!(output.exit_code, -1);
    }
}
