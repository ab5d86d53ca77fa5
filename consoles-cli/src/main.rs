mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::RunOptions;
use consoles_sandbox::{engines_for, Program, SandboxConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "consoles")]
#[command(about = "Run untrusted Lua programs in an embedded sandbox")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// Sandbox config file (default: ~/.config/consoles/sandbox.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Stop the program after this many seconds
    #[arg(short, long, global = true)]
    pub timeout: Option<f64>,

    /// Load the coroutine and os libraries
    #[arg(long, global = true)]
    pub unrestricted: bool,

    /// Interpreter heap limit in MiB (0 = unbounded)
    #[arg(short, long, global = true)]
    pub memory: Option<usize>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a named program from the program directory
    Run {
        /// Program name, resolved relative to the program directory
        program: String,

        /// Arguments passed to the program as varargs
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Evaluate a snippet of inline code
    Eval {
        code: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List the capability libraries programs can `require`
    Libraries,
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    // stdout belongs to the program
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "consoles={},consoles_sandbox={}",
                    log_level, log_level
                ))
            }),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<SandboxConfig> {
    let mut config = match &cli.config {
        Some(path) => SandboxConfig::load(path)?,
        None => SandboxConfig::load_or_default()?,
    };
    if let Some(mib) = cli.memory {
        config.limits.max_memory_bytes = (mib > 0).then(|| mib * 1024 * 1024);
    }
    Ok(config)
}

fn run_options(cli: &Cli, config: &SandboxConfig) -> Result<RunOptions> {
    let timeout = match cli.timeout {
        Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => anyhow::bail!("invalid timeout: {}", secs),
        None => config.service.default_timeout,
    };
    Ok(RunOptions {
        timeout,
        unrestricted: cli.unrestricted,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let options = run_options(&cli, &config)?;

    match cli.command {
        Commands::Run { program, args } => {
            let program = commands::load_program(&config, &program)?;
            commands::execute_program(engines_for(&config), &config, options, program, args).await
        }
        Commands::Eval { code, args } => {
            commands::execute_program(
                engines_for(&config),
                &config,
                options,
                Program::inline(code),
                args,
            )
            .await
        }
        Commands::Libraries => {
            commands::list_libraries()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
