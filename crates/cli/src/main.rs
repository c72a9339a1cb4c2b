//! Sable CLI
//!
//! Dispatch order: a binary carrying embedded source runs it directly,
//! bypassing argument parsing entirely. Otherwise `sable <file>` and the
//! flag forms run through the Run subcommand (inserted implicitly when the
//! first argument is not a known subcommand), and `build`/`test`/`new`/
//! `completions` behave like ordinary subcommands.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use sable_runtime::{Backend, set_backend};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

mod repl;
mod scaffold;

#[derive(ClapParser)]
#[command(name = "sable")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sable - a Lisp runtime with a bytecode VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate an expression, run a script, serve nREPL, or start the REPL
    Run {
        /// Use the tree-walking backend instead of the bytecode VM
        #[arg(long)]
        tree_walk: bool,

        /// Print compiled bytecode for each top-level form instead of running
        #[arg(long)]
        dump_bytecode: bool,

        /// Evaluate an expression and print its value
        #[arg(short = 'e', value_name = "EXPR")]
        eval: Option<String>,

        /// Serve the nREPL wire protocol instead of evaluating
        #[arg(long)]
        nrepl_server: bool,

        /// nREPL port (0 picks a free one)
        #[arg(long, default_value_t = 7888)]
        port: u16,

        /// Write a bootstrap environment snapshot and exit
        #[arg(long, value_name = "PATH")]
        snapshot_save: Option<PathBuf>,

        /// Restore a bootstrap snapshot before evaluating (rebuilds from
        /// source on version mismatch)
        #[arg(long, value_name = "PATH")]
        snapshot_load: Option<PathBuf>,

        /// Script to run; omit for an interactive REPL
        input: Option<PathBuf>,

        /// Arguments passed to the script as *command-line-args*
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Build a single binary with the source embedded
    Build {
        /// Input source file
        input: PathBuf,

        /// Output executable path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run deftest-registered tests from source files
    Test {
        /// Files or directories to load before running
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,
    },

    /// Scaffold a new project
    New {
        /// Template name (app or lib)
        template: String,

        /// Project name
        name: String,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

const SUBCOMMANDS: &[&str] = &["run", "build", "test", "new", "completions", "help"];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SABLE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    // A packed binary runs its payload, bypassing CLI parsing
    if let Some(source) = sable_runtime::embed::embedded_source() {
        run_source(&source, std::env::args().skip(1).collect());
        return;
    }

    // `sable foo.sbl`, `sable -e ...`, and bare `sable` are Run
    let mut argv: Vec<String> = std::env::args().collect();
    let needs_run = match argv.get(1) {
        None => true,
        Some(first) => {
            !SUBCOMMANDS.contains(&first.as_str())
                && !["-h", "--help", "-V", "--version"].contains(&first.as_str())
        }
    };
    if needs_run {
        argv.insert(1, "run".to_string());
    }

    let cli = Cli::parse_from(argv);
    match cli.command {
        Commands::Run {
            tree_walk,
            dump_bytecode,
            eval,
            nrepl_server,
            port,
            snapshot_save,
            snapshot_load,
            input,
            args,
        } => {
            if tree_walk {
                set_backend(Backend::TreeWalk);
            }
            if let Some(path) = snapshot_save {
                sable_runtime::init();
                match sable_runtime::snapshot::save() {
                    Ok(bytes) => match std::fs::write(&path, bytes) {
                        Ok(()) => {
                            println!("Wrote bootstrap snapshot to {}", path.display());
                            return;
                        }
                        Err(e) => {
                            eprintln!("Error writing {}: {}", path.display(), e);
                            process::exit(1);
                        }
                    },
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        process::exit(1);
                    }
                }
            }
            if let Some(path) = snapshot_load {
                sable_runtime::init();
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        if let Err(e) = sable_runtime::snapshot::restore(&bytes) {
                            eprintln!(
                                "Warning: snapshot {} not restored ({}); continuing from a fresh bootstrap",
                                path.display(),
                                e
                            );
                        }
                    }
                    Err(e) => {
                        eprintln!("Error reading {}: {}", path.display(), e);
                        process::exit(1);
                    }
                }
            }
            if nrepl_server {
                if let Err(e) = sable_runtime::nrepl::serve(port, |bound| {
                    println!("nREPL server started on port {}", bound);
                }) {
                    eprintln!("Error: {}", sable_runtime::format_error(&e));
                    process::exit(1);
                }
                return;
            }
            match (eval, input) {
                (Some(expr), _) => {
                    if dump_bytecode {
                        dump(&expr);
                    } else {
                        eval_and_print(&expr);
                    }
                }
                (None, Some(path)) => {
                    let source = match std::fs::read_to_string(&path) {
                        Ok(s) => s,
                        Err(e) => {
                            eprintln!("Error reading {}: {}", path.display(), e);
                            process::exit(1);
                        }
                    };
                    if dump_bytecode {
                        dump(&source);
                    } else {
                        run_source(&source, args);
                    }
                }
                (None, None) => repl::run(),
            }
        }
        Commands::Build { input, output } => run_build(&input, output),
        Commands::Test { paths } => run_test(&paths),
        Commands::New { template, name } => {
            if let Err(e) = scaffold::generate(&template, &name) {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "sable", &mut io::stdout());
        }
    }
}

fn bind_command_line_args(args: Vec<String>) {
    sable_runtime::init();
    let values: Vec<sable_core::value::Value> = args
        .into_iter()
        .map(sable_core::value::Value::string)
        .collect();
    let arg_list = if values.is_empty() {
        "nil".to_string()
    } else {
        let quoted: Vec<String> = values
            .iter()
            .map(sable_core::printer::pr_str)
            .collect();
        format!("'({})", quoted.join(" "))
    };
    let _ = sable_runtime::eval_str(&format!(
        "(def ^:dynamic *command-line-args* {})",
        arg_list
    ));
}

fn run_source(source: &str, args: Vec<String>) {
    bind_command_line_args(args);
    if let Err(e) = sable_runtime::eval_str(source) {
        eprintln!("Error: {}", sable_runtime::format_error(&e));
        process::exit(1);
    }
}

fn eval_and_print(expr: &str) {
    match sable_runtime::eval_str(expr) {
        Ok(value) => println!("{}", sable_core::printer::pr_str(&value)),
        Err(e) => {
            eprintln!("Error: {}", sable_runtime::format_error(&e));
            process::exit(1);
        }
    }
}

fn dump(source: &str) {
    match sable_runtime::dump_bytecode(source) {
        Ok(listing) => print!("{}", listing),
        Err(e) => {
            eprintln!("Error: {}", sable_runtime::format_error(&e));
            process::exit(1);
        }
    }
}

fn run_build(input: &Path, output: Option<PathBuf>) {
    let output = output.unwrap_or_else(|| {
        let stem = input.file_stem().unwrap_or_default();
        PathBuf::from(stem)
    });
    match sable_runtime::embed::build(input, &output) {
        Ok(()) => println!("Built {} -> {}", input.display(), output.display()),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_test(paths: &[PathBuf]) {
    sable_runtime::init();
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            collect_sources(path, &mut files);
        } else if path.exists() {
            files.push(path.clone());
        } else {
            eprintln!("Warning: {} does not exist", path.display());
        }
    }
    files.sort();

    for file in &files {
        let source = match std::fs::read_to_string(file) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error reading {}: {}", file.display(), e);
                process::exit(1);
            }
        };
        if let Err(e) = sable_runtime::eval_str(&source) {
            eprintln!(
                "Error loading {}: {}",
                file.display(),
                sable_runtime::format_error(&e)
            );
            process::exit(1);
        }
    }

    if let Err(e) = sable_runtime::eval_str("(sable.test/run-tests)") {
        eprintln!("Error: {}", sable_runtime::format_error(&e));
        process::exit(1);
    }
    let stats = sable_runtime::builtins::test_ops::current_stats();
    if stats.failed > 0 || stats.errored > 0 {
        process::exit(1);
    }
    if stats.passed == 0 {
        eprintln!("No tests found");
        process::exit(2);
    }
}

/// Recursive .sbl file walker with error logging
fn collect_sources(dir: &Path, files: &mut Vec<PathBuf>) {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                match entry {
                    Ok(entry) => {
                        let path = entry.path();
                        if path.is_dir() {
                            collect_sources(&path, files);
                        } else if path.extension().is_some_and(|e| e == "sbl") {
                            files.push(path);
                        }
                    }
                    Err(e) => {
                        eprintln!(
                            "Warning: could not read directory entry in {}: {}",
                            dir.display(),
                            e
                        );
                    }
                }
            }
        }
        Err(e) => {
            eprintln!("Warning: could not read directory {}: {}", dir.display(), e);
        }
    }
}
