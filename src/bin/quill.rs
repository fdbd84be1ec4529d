use std::{ffi::OsString, fs, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quill::{ErrorFormat, QuillError, Repl, Runtime, StdoutSink};

#[derive(Parser)]
#[command(author, version, about = "quill scripting language")]
struct Args {
    /// Print errors without ANSI colors
    #[arg(long = "noformat")]
    noformat: bool,
    /// Script to run; starts an interactive session when omitted
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse_from(normalize_args(std::env::args_os()));
    let format = if args.noformat {
        ErrorFormat::plain()
    } else {
        ErrorFormat::ansi()
    };
    match run(args.script, format) {
        Ok(()) => ExitCode::SUCCESS,
        // Script errors were already rendered by the manager.
        Err(QuillError::Code(_) | QuillError::Fatal(_)) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("quill: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(script: Option<PathBuf>, format: ErrorFormat) -> Result<(), QuillError> {
    let runtime = Runtime::new()?;
    let output = Arc::new(StdoutSink::new(format));
    match script {
        Some(path) => {
            let source = fs::read_to_string(&path)?;
            let context = runtime.context(output);
            let manager = runtime.thread_manager();
            let result = manager.start_blocking(&context, &path.display().to_string(), &source);
            manager.stop();
            result.map(|_| ())
        }
        None => Repl::new(&runtime, output).run(),
    }
}

/// Accepts the single-dash `-noformat` spelling as well.
fn normalize_args(args: impl Iterator<Item = OsString>) -> Vec<OsString> {
    args.map(|arg| {
        if arg == "-noformat" {
            OsString::from("--noformat")
        } else {
            arg
        }
    })
    .collect()
}

fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
