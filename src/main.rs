//! wasm-embed CLI entry point.
//!
//! Subcommands:
//! - `run`: execute a module (WASI `_start` by default, or `--invoke <func>`)
//! - `compile`: ahead-of-time compile a module
//! - `validate`: parse and validate a module
//! - `inspect`: list a module's imports and exports

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasm_embed_common::{ConfigFile, HostRegistration, OutputFormat};
use wasm_embed_core::{AstModule, Compiler, ExternalType, FunctionType, Loader, Validator, Value, ValueKind, WasmEngine};
use wasm_embed_host::Vm;

#[derive(Debug, Parser)]
#[command(name = "wasm-embed", version, about = "Load, validate and run WebAssembly modules")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "WASM_EMBED_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a module.
    Run(RunArgs),

    /// Compile a module ahead of time.
    Compile {
        input: PathBuf,
        output: PathBuf,

        /// Artifact format.
        #[arg(long, value_enum, default_value_t = FormatArg::Wasm)]
        format: FormatArg,
    },

    /// Validate a module against the configured proposals.
    Validate { file: PathBuf },

    /// Print a module's imports and exports.
    Inspect { file: PathBuf },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    file: PathBuf,

    /// Call this export instead of `_start`; trailing args become its parameters.
    #[arg(long)]
    invoke: Option<String>,

    /// Environment entry for WASI, as KEY=VALUE.
    #[arg(long = "env")]
    envs: Vec<String>,

    /// Directory to preopen for WASI, as guest:host or a single path.
    #[arg(long = "dir")]
    dirs: Vec<String>,

    /// Command the process module may run.
    #[arg(long = "allow-command")]
    allow_commands: Vec<String>,

    /// Let the process module run any command.
    #[arg(long = "allow-command-all")]
    allow_all: bool,

    /// Cap on total execution cost.
    #[arg(long)]
    cost_limit: Option<u64>,

    /// Cap on linear memory, in 64 KiB pages.
    #[arg(long)]
    max_memory_pages: Option<u32>,

    /// Print instruction count, cost and time after the run.
    #[arg(long)]
    statistics: bool,

    /// Module to register before running, as name:path.
    #[arg(long = "module")]
    modules: Vec<String>,

    /// Arguments for the program, or parameters for `--invoke`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Native,
    Wasm,
}

impl From<FormatArg> for OutputFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Native => OutputFormat::Native,
            FormatArg::Wasm => OutputFormat::Wasm,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wasm_embed=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConfigFile::default(),
    };
    debug!(config = ?cli.config, "Configuration loaded");

    match cli.command {
        Command::Run(args) => run(file, args),
        Command::Compile {
            input,
            output,
            format,
        } => compile(file, &input, &output, format).map(|()| ExitCode::SUCCESS),
        Command::Validate { file: path } => {
            validate(&file, &path)?;
            println!("{}: ok", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Inspect { file: path } => inspect(&file, &path).map(|()| ExitCode::SUCCESS),
    }
}

fn run(mut file: ConfigFile, args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = &mut file.configuration;
    config.add_host_registration(HostRegistration::Wasi);
    if args.allow_all || !args.allow_commands.is_empty() {
        config.add_host_registration(HostRegistration::Process);
    }
    if let Some(limit) = args.cost_limit {
        config.set_cost_limit(limit);
    }
    if let Some(pages) = args.max_memory_pages {
        config.set_max_memory_pages(pages);
    }
    if args.statistics {
        config
            .set_instruction_counting(true)
            .set_cost_measuring(true)
            .set_time_measuring(true);
    }

    file.wasi.envs.extend(args.envs.iter().cloned());
    file.wasi.preopens.extend(args.dirs.iter().cloned());
    file.process.allowed_commands.extend(args.allow_commands.iter().cloned());
    file.process.allow_all |= args.allow_all;
    for entry in &args.modules {
        let (name, path) = entry
            .split_once(':')
            .with_context(|| format!("Expected name:path, got {entry:?}"))?;
        file.modules.push(wasm_embed_common::ModuleEntry {
            name: name.to_string(),
            path: path.to_string(),
        });
    }
    if args.invoke.is_none() {
        file.wasi.args.extend(args.args.iter().cloned());
    }

    let program = args.file.display().to_string();
    let mut vm = Vm::from_config_file(&file, &program).context("Failed to create VM")?;

    vm.load_wasm_from_file(&args.file)
        .with_context(|| format!("Failed to load {program}"))?;
    vm.validate().context("Validation failed")?;
    vm.instantiate().context("Instantiation failed")?;

    let func_name = args.invoke.as_deref().unwrap_or("_start");
    let ty = vm
        .function_type(func_name)
        .with_context(|| format!("Module has no export named {func_name}"))?;
    let params = if args.invoke.is_some() {
        parse_params(&ty, &args.args)?
    } else {
        Vec::new()
    };

    let returns = vm
        .execute(func_name, &params)
        .with_context(|| format!("Execution of {func_name} failed"))?;
    for value in &returns {
        println!("{value}");
    }

    if args.statistics {
        let stats = vm.statistics();
        info!(
            instructions = stats.instr_count(),
            instr_per_second = stats.instr_per_second(),
            total_cost = stats.total_cost(),
            duration_ms = stats.execution_time().as_millis(),
            "Execution statistics"
        );
    }

    let exit_code = match vm.wasi() {
        Some(wasi) => wasi.exit_code()?.unwrap_or(0),
        None => 0,
    };
    vm.close();

    // Exit codes outside 0..=255 are truncated by the OS anyway
    Ok(ExitCode::from(u8::try_from(exit_code & 0xff).unwrap_or(u8::MAX)))
}

fn parse_params(ty: &FunctionType, args: &[String]) -> anyhow::Result<Vec<Value>> {
    if ty.params().len() != args.len() {
        bail!(
            "Function expects {} parameters ({ty}), got {}",
            ty.params().len(),
            args.len()
        );
    }

    ty.params()
        .iter()
        .zip(args)
        .map(|(kind, arg)| parse_value(*kind, arg))
        .collect()
}

fn parse_value(kind: ValueKind, arg: &str) -> anyhow::Result<Value> {
    let invalid = || format!("Invalid {kind} parameter {arg:?}");
    Ok(match kind {
        ValueKind::I32 => Value::I32(arg.parse().with_context(invalid)?),
        ValueKind::I64 => Value::I64(arg.parse().with_context(invalid)?),
        ValueKind::F32 => Value::F32(arg.parse().with_context(invalid)?),
        ValueKind::F64 => Value::F64(arg.parse().with_context(invalid)?),
        ValueKind::V128 => Value::V128(arg.parse().with_context(invalid)?),
        ValueKind::FuncRef | ValueKind::ExternRef => {
            bail!("Reference parameters cannot be passed on the command line")
        }
    })
}

fn load(file: &ConfigFile, path: &Path) -> anyhow::Result<(WasmEngine, AstModule)> {
    let engine = WasmEngine::new(&file.configuration).context("Failed to create engine")?;
    let module = Loader::new(&engine)
        .parse_from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    Ok((engine, module))
}

fn validate(file: &ConfigFile, path: &Path) -> anyhow::Result<()> {
    let (engine, module) = load(file, path)?;
    Validator::new(&engine)
        .validate(&module)
        .with_context(|| format!("{} is invalid", path.display()))
}

fn compile(mut file: ConfigFile, input: &Path, output: &Path, format: FormatArg) -> anyhow::Result<()> {
    file.configuration.set_output_format(format.into());
    let engine = WasmEngine::new(&file.configuration).context("Failed to create engine")?;

    Compiler::new(&engine)
        .compile(input, output)
        .with_context(|| format!("Failed to compile {}", input.display()))?;

    println!("{} -> {}", input.display(), output.display());
    Ok(())
}

fn inspect(file: &ConfigFile, path: &Path) -> anyhow::Result<()> {
    let (_, module) = load(file, path)?;

    println!("imports:");
    for import in module.imports() {
        println!(
            "  {}.{}: {}",
            import.module_name,
            import.external_name,
            describe(&import.ty)
        );
    }

    println!("exports:");
    for export in module.exports() {
        println!("  {}: {}", export.external_name, describe(&export.ty));
    }

    Ok(())
}

fn describe(ty: &ExternalType) -> String {
    match ty {
        ExternalType::Function(func) => format!("func {func}"),
        other => other.kind().to_string(),
    }
}
