//! Orus CLI
//!
//! `orus [--trace] [--reg-vm] [path]`. Without a path it starts the REPL.
//! Exit codes: 0 success, 64 usage, 65 compile error, 70 runtime error,
//! 74 I/O error.

use clap::Parser as ClapParser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use orus_runtime::{Backend, Interpreter, InterpretError, RuntimeConfig};

const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE: u8 = 65;
const EXIT_RUNTIME: u8 = 70;
const EXIT_IO: u8 = 74;

#[derive(ClapParser)]
#[command(name = "orus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(disable_version_flag = true)]
#[command(about = "Orus language interpreter", long_about = None)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),

    /// Print each instruction and the stack before executing it
    #[arg(long)]
    trace: bool,

    /// Use the register VM backend where possible
    #[arg(long = "reg-vm")]
    reg_vm: bool,

    /// Script to run; omit for a REPL
    path: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            // clap prints --help/--version itself with success.
            if error.use_stderr() {
                eprintln!("{}", error);
                return ExitCode::from(EXIT_USAGE);
            }
            print!("{}", error);
            return ExitCode::SUCCESS;
        }
    };

    let config = RuntimeConfig::load();
    let backend = if cli.reg_vm {
        Backend::Register
    } else {
        Backend::Stack
    };
    let mut interp = Interpreter::new()
        .with_trace(cli.trace)
        .with_backend(backend);
    interp.set_std_path(config.std_path);
    interp.set_cache_path(config.cache_path);

    match cli.path {
        Some(path) => run_file(&mut interp, &path),
        None => repl(&mut interp),
    }
}

fn run_file(interp: &mut Interpreter, path: &PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("orus: cannot read {}: {}", path.display(), error);
            return ExitCode::from(EXIT_IO);
        }
    };
    match interp.interpret(&source, &path.to_string_lossy()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error @ InterpretError::Compile(_)) => {
            eprintln!("{}", error);
            ExitCode::from(EXIT_COMPILE)
        }
        Err(error @ InterpretError::Runtime(_)) => {
            eprintln!("{}", error);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn repl(interp: &mut Interpreter) -> ExitCode {
    println!("orus {} (:quit to exit)", env!("CARGO_PKG_VERSION"));
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("orus: cannot start the REPL: {}", error);
            return ExitCode::from(EXIT_IO);
        }
    };

    loop {
        match editor.readline("orus> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ":quit" || trimmed == ":q" {
                    return ExitCode::SUCCESS;
                }
                let _ = editor.add_history_entry(trimmed);
                // REPL errors are printed and the session continues.
                if let Err(error) = interp.interpret_repl(&line) {
                    eprintln!("{}", error);
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => return ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("orus: {}", error);
                return ExitCode::from(EXIT_IO);
            }
        }
    }
}
