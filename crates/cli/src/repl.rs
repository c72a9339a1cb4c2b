//! Interactive REPL: rustyline line editing with persistent history
//!
//! Multi-line input continues while the reader reports an unterminated
//! form. The conversation vars *1, *2, *3, and *e track recent results.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".sable_history"))
}

pub fn run() {
    sable_runtime::init();
    println!("Sable {} REPL", env!("CARGO_PKG_VERSION"));
    println!("Ctrl-D to exit");

    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: could not start line editor: {}", e);
            std::process::exit(1);
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    // Conversation vars
    let _ = sable_runtime::eval_str(
        "(do (def ^:dynamic *1 nil) (def ^:dynamic *2 nil)
             (def ^:dynamic *3 nil) (def ^:dynamic *e nil))",
    );

    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() {
            format!("{}=> ", sable_runtime::env::global().current_ns_name())
        } else {
            "  #_=> ".to_string()
        };
        match editor.readline(&prompt) {
            Ok(line) => {
                if !pending.is_empty() {
                    pending.push('\n');
                }
                pending.push_str(&line);
                if sable_runtime::incomplete_input(&pending) {
                    continue;
                }
                let source = std::mem::take(&mut pending);
                if source.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(source.trim());
                sable_runtime::interrupt::set(false);
                match sable_runtime::eval_str(&source) {
                    Ok(value) => {
                        println!("{}", sable_core::printer::pr_str(&value));
                        shift_results(&value);
                    }
                    Err(e) => {
                        eprintln!("Error: {}", sable_runtime::format_error(&e));
                        record_error(&e);
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                pending.clear();
                println!("^C");
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
}

fn shift_results(value: &sable_core::value::Value) {
    let env = sable_runtime::env::global();
    let core = match env.find_ns("user") {
        Some(ns) => ns,
        None => return,
    };
    let get = |name: &str| match core.lookup(name) {
        Some(sable_core::value::Value::Var(v)) => v.root(),
        _ => None,
    };
    let one = get("*1");
    let two = get("*2");
    for (name, v) in [
        ("*3", two.unwrap_or(sable_core::value::Value::Nil)),
        ("*2", one.unwrap_or(sable_core::value::Value::Nil)),
        ("*1", value.clone()),
    ] {
        if let Some(sable_core::value::Value::Var(var)) = core.lookup(name) {
            var.bind_root(v);
        }
    }
}

fn record_error(e: &sable_core::error::SableError) {
    let env = sable_runtime::env::global();
    if let Some(ns) = env.find_ns("user") {
        if let Some(sable_core::value::Value::Var(var)) = ns.lookup("*e") {
            var.bind_root(sable_runtime::errors::error_to_value(e));
        }
    }
}
