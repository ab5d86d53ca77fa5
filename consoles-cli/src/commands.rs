//! CLI command implementations
//!
//! The CLI is a host like any other: it publishes a small `host` library,
//! builds one sandbox per invocation and reports failures as structured
//! errors on stderr.

use anyhow::{Context, Result};
use consoles_sandbox::{
    any_of, deadline, CapabilityRegistry, EngineRegistry, FunctionPool, HostArgs, HostError,
    HostFunction, NamedFunction, OutputSink, Program, SandboxBuilder, SandboxConfig,
    SandboxError, ScriptValue, TerminationFlag, TerminationPredicate,
};
use std::process::ExitCode;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Longest wait `host.sleep` will honor
const MAX_SLEEP: Duration = Duration::from_secs(5);

pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_TERMINATED: u8 = 124;

/// Per-invocation options collected from flags and config
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub unrestricted: bool,
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Functions published as the `host` library.
pub fn host_library() -> Vec<NamedFunction> {
    vec![
        NamedFunction::new(
            "time",
            HostFunction::new(|_| {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|e| HostError::new(e.to_string()))?;
                Ok(ScriptValue::Number(now.as_secs_f64()))
            }),
        ),
        NamedFunction::new(
            "sleep",
            HostFunction::new(|args| {
                let seconds = args.number_arg(1)?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(HostError::new("bad argument #1 (non-negative number expected)"));
                }
                std::thread::sleep(Duration::from_secs_f64(seconds).min(MAX_SLEEP));
                Ok(ScriptValue::Nil)
            }),
        ),
        NamedFunction::new(
            "hostname",
            HostFunction::new(|_| Ok(ScriptValue::from(hostname()))),
        ),
    ]
}

pub fn capabilities() -> Result<CapabilityRegistry> {
    let registry = CapabilityRegistry::new();
    registry.publish("host", host_library())?;
    Ok(registry)
}

/// Pool with `args`: `args()` is the argument count, `args(n)` the n-th argument.
pub fn pool(args: &[String]) -> Result<FunctionPool> {
    let args = args.to_vec();
    let pool = FunctionPool::new().with("args", move |call| match call.arg(1) {
        ScriptValue::Nil => Ok(ScriptValue::Integer(args.len() as i64)),
        _ => {
            let index = call.int_arg(1)?;
            Ok(usize::try_from(index)
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| args.get(i))
                .map(|arg| ScriptValue::from(arg.as_str()))
                .unwrap_or_default())
        }
    })?;
    Ok(pool)
}

/// Resolve a named program in the configured program directory.
pub fn load_program(config: &SandboxConfig, name: &str) -> Result<Program> {
    let loader = config.programs.loader();
    loader
        .load(name)
        .with_context(|| format!("cannot load '{}' from {}", name, loader.root().display()))
}

/// Build a sandbox, run `program` to completion and map the outcome to an exit code.
pub async fn execute_program(
    engines: EngineRegistry,
    config: &SandboxConfig,
    options: RunOptions,
    program: Program,
    args: Vec<String>,
) -> Result<ExitCode> {
    let interrupt = TerminationFlag::new();
    let mut predicates: Vec<TerminationPredicate> = vec![interrupt.predicate()];
    if let Some(timeout) = options.timeout {
        predicates.push(deadline(Instant::now() + timeout));
    }

    let ctrl_c = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping program");
            ctrl_c.trip();
        }
    });

    let builder = SandboxBuilder::new(pool(&args)?)
        .terminate_when(any_of(predicates))
        .input(std::io::stdin())
        .output_sink(OutputSink::stream(std::io::stdout()))
        .limits(config.limits.clone())
        .capabilities(capabilities()?)
        .library("host");

    let unrestricted = options.unrestricted;
    let outcome = tokio::task::spawn_blocking(move || -> consoles_sandbox::Result<Vec<ScriptValue>> {
        let mut sandbox = builder.build(&engines)?;
        if unrestricted {
            sandbox.remove_restrictions()?;
        }
        debug!(program = program.name(), args = args.len(), "Starting program");
        let args = args.into_iter().map(ScriptValue::from).collect();
        let result = sandbox.run(&program, args);
        sandbox.close()?;
        result
    })
    .await
    .context("program task panicked")?;

    Ok(match outcome {
        Ok(_) => ExitCode::SUCCESS,
        Err(SandboxError::Terminated) => {
            eprintln!("{}", SandboxError::Terminated);
            ExitCode::from(EXIT_TERMINATED)
        }
        Err(err) => {
            eprintln!("{}", err.to_failure());
            ExitCode::from(EXIT_FAILURE)
        }
    })
}

pub fn list_libraries() -> Result<()> {
    let registry = capabilities()?;
    for name in registry.names() {
        let library = registry.get(&name)?;
        let functions: Vec<&str> = library
            .functions()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        println!("{}: {}", name, functions.join(", "));
    }
    Ok(())
}
