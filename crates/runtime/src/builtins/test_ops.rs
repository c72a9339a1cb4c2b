//! The `sable.test` namespace: deftest registration and assertions
//!
//! `deftest` registers a zero-argument test var; `is` records pass/fail
//! against the global results. The `sable test` subcommand loads files and
//! drives `run-tests`.

use super::{b, check_exact, check_min};
use crate::call::call_value;
use crate::registry::BuiltinDef;
use sable_core::error::SableError;
use sable_core::list::PersistentList;
use sable_core::printer::pr_str;
use sable_core::value::Value;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
pub struct TestStats {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

static REGISTRY: Mutex<Vec<(String, Value)>> = Mutex::new(Vec::new());
static STATS: Mutex<TestStats> = Mutex::new(TestStats {
    passed: 0,
    failed: 0,
    errored: 0,
});

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("-register!", register, "([name-sym var])", "Registers a deftest var."),
        b!("-check!", check, "([form-quote thunk])", "Runs one assertion, recording the result."),
        b!("run-tests", run_tests, "([])", "Runs every registered test, printing a report."),
        b!("clear-tests!", clear_tests, "([])", "Drops registered tests and results."),
        b!("test-stats", test_stats, "([])", "The current pass/fail counters."),
    ]
}

pub fn macro_builtins() -> Vec<BuiltinDef> {
    vec![
        b!("deftest", deftest_macro, "([name & body])", "Defines and registers a test fn."),
        b!("is", is_macro, "([form])", "Asserts that form evaluates truthy."),
    ]
}

fn register(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-register!", args, 2)?;
    let name = sable_core::printer::display_str(&args[0]);
    let mut registry = REGISTRY.lock().expect("test registry poisoned");
    registry.retain(|(n, _)| n != &name);
    registry.push((name, args[1].clone()));
    Ok(Value::Nil)
}

fn check(args: &[Value]) -> Result<Value, SableError> {
    check_exact("-check!", args, 2)?;
    let form = &args[0];
    match call_value(&args[1], &[]) {
        Ok(v) if v.is_truthy() => {
            STATS.lock().expect("test stats poisoned").passed += 1;
            Ok(Value::Bool(true))
        }
        Ok(_) => {
            STATS.lock().expect("test stats poisoned").failed += 1;
            println!("FAIL in {}", pr_str(form));
            Ok(Value::Bool(false))
        }
        Err(e) => {
            STATS.lock().expect("test stats poisoned").errored += 1;
            println!("ERROR in {}: {}", pr_str(form), e);
            Ok(Value::Bool(false))
        }
    }
}

fn run_tests(args: &[Value]) -> Result<Value, SableError> {
    check_exact("run-tests", args, 0)?;
    *STATS.lock().expect("test stats poisoned") = TestStats::default();
    let tests = REGISTRY.lock().expect("test registry poisoned").clone();
    for (name, var) in &tests {
        let f = match var {
            Value::Var(v) => v.deref()?,
            other => other.clone(),
        };
        if let Err(e) = call_value(&f, &[]) {
            STATS.lock().expect("test stats poisoned").errored += 1;
            println!("ERROR in {}: {}", name, e);
        }
    }
    let stats = STATS.lock().expect("test stats poisoned").clone();
    println!(
        "\nRan {} tests: {} passed, {} failed, {} errored",
        tests.len(),
        stats.passed,
        stats.failed,
        stats.errored
    );
    Ok(stats_map(&stats))
}

fn clear_tests(args: &[Value]) -> Result<Value, SableError> {
    check_exact("clear-tests!", args, 0)?;
    REGISTRY.lock().expect("test registry poisoned").clear();
    *STATS.lock().expect("test stats poisoned") = TestStats::default();
    Ok(Value::Nil)
}

fn test_stats(args: &[Value]) -> Result<Value, SableError> {
    check_exact("test-stats", args, 0)?;
    Ok(stats_map(&STATS.lock().expect("test stats poisoned").clone()))
}

fn stats_map(stats: &TestStats) -> Value {
    super::coll::map_from_pairs(vec![
        (Value::keyword("pass"), Value::Int(stats.passed as i64)),
        (Value::keyword("fail"), Value::Int(stats.failed as i64)),
        (Value::keyword("error"), Value::Int(stats.errored as i64)),
    ])
}

/// The summary consumed by the CLI test runner
pub fn current_stats() -> TestStats {
    STATS.lock().expect("test stats poisoned").clone()
}

fn list_form(items: Vec<Value>) -> Value {
    Value::List(Arc::new(PersistentList::from_values(items)))
}

// (deftest name body...) →
// (do (def name (fn* [] body...)) (sable.test/-register! 'name (var name)))
fn deftest_macro(args: &[Value]) -> Result<Value, SableError> {
    check_min("deftest", args, 2)?;
    let name = args[0].clone();
    let mut fn_form = vec![
        Value::symbol("fn*"),
        Value::Vector(Arc::new(sable_core::vector::PersistentVector::new())),
    ];
    fn_form.extend_from_slice(&args[1..]);
    Ok(list_form(vec![
        Value::symbol("do"),
        list_form(vec![Value::symbol("def"), name.clone(), list_form(fn_form)]),
        list_form(vec![
            Value::symbol("sable.test/-register!"),
            list_form(vec![Value::symbol("quote"), name.clone()]),
            list_form(vec![Value::symbol("var"), name]),
        ]),
    ]))
}

// (is form) → (sable.test/-check! 'form (fn* [] form))
fn is_macro(args: &[Value]) -> Result<Value, SableError> {
    check_exact("is", args, 1)?;
    Ok(list_form(vec![
        Value::symbol("sable.test/-check!"),
        list_form(vec![Value::symbol("quote"), args[0].clone()]),
        list_form(vec![
            Value::symbol("fn*"),
            Value::Vector(Arc::new(sable_core::vector::PersistentVector::new())),
            args[0].clone(),
        ]),
    ]))
}
