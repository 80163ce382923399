use std::{
    fs::{self, File},
    io::{self, BufReader, Write},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{Context, Result};
use bytevm::{LoadOptions, Loader, VirtualMachine, VmConfig};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bytevm")]
#[command(about = "Load and run a bytecode object file")]
struct Cli {
    /// Object file to run
    file: PathBuf,

    /// Record an execution trace
    #[arg(long)]
    trace: bool,

    /// Write the trace to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    trace_file: Option<PathBuf>,

    /// Write the trace to stderr even when --trace-file is given
    #[arg(long)]
    trace_stderr: bool,

    /// Reject the program if any instruction line had to be dropped
    #[arg(long)]
    strict: bool,

    /// Print the decoded program instead of running it
    #[arg(long)]
    disassemble: bool,

    /// Operand stack capacity
    #[arg(long, value_name = "N", default_value_t = bytevm::STACK_CAPACITY)]
    stack_capacity: usize,

    /// Maximum call depth
    #[arg(long, value_name = "N", default_value_t = bytevm::CALL_STACK_CAPACITY)]
    call_depth: usize,

    /// Log load and run summaries
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "bytevm=debug" } else { "bytevm=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{:#}", error);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let file = File::open(&cli.file)
        .with_context(|| format!("Failed to open file: {}", cli.file.display()))?;
    let options = LoadOptions {
        strict: cli.strict,
    };
    let loaded = Loader::with_options(BufReader::new(file), options)
        .load()
        .with_context(|| format!("Failed to load {}", cli.file.display()))?;

    if cli.disassemble {
        println!("{}", loaded.program.disassemble());
        return Ok(());
    }

    let config = VmConfig::default()
        .with_trace(cli.trace)
        .with_stack_capacity(cli.stack_capacity)
        .with_call_stack_capacity(cli.call_depth);
    let mut vm = VirtualMachine::with_config(loaded.program, config);
    let outcome = vm.run();

    // Output and trace are flushed even when the run failed part way.
    io::stdout()
        .write_all(vm.output())
        .context("Failed to write program output")?;
    if cli.trace {
        write_trace(cli, vm.trace())?;
    }

    outcome.context("Runtime error")
}

fn write_trace(cli: &Cli, trace: &[u8]) -> Result<()> {
    match &cli.trace_file {
        Some(path) if !cli.trace_stderr => fs::write(path, trace)
            .with_context(|| format!("Failed to write trace: {}", path.display())),
        _ => io::stderr()
            .write_all(trace)
            .context("Failed to write trace"),
    }
}
