//! Software transactional memory: MVCC with optimistic execution
//!
//! Each transaction reads a consistent snapshot at its read point; commits
//! serialize through a global commit counter. Conflicts signal an internal
//! retry error that the transaction loop consumes; the commit algorithm
//! acquires ref locks in ascending id order and follows the fixed phase
//! order: replay commutes, re-verify writes, re-verify ensures, run
//! validators, advance the commit point and prepend history, then release
//! and fire watches outside any lock.

use crate::call::call_value;
use sable_core::error::{ErrorKind, Phase, SableError};
use sable_core::refs::StmRef;
use sable_core::value::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global commit counter; every committed transaction gets a fresh point
static COMMIT_POINT: AtomicU64 = AtomicU64::new(0);

/// Bounded optimism
const RETRY_LIMIT: usize = 10_000;

pub struct Transaction {
    read_point: u64,
    /// In-transaction values, by ref id
    overrides: HashMap<u64, Value>,
    /// Refs touched, for commit-time lock ordering
    refs: HashMap<u64, Arc<StmRef>>,
    written: HashSet<u64>,
    /// Queued commute replays in application order
    commutes: Vec<(u64, Value, Vec<Value>)>,
    ensures: HashSet<u64>,
}

thread_local! {
    static CURRENT_TX: RefCell<Option<Transaction>> = const { RefCell::new(None) };
}

fn retry_signal() -> SableError {
    SableError::new(Phase::Eval, ErrorKind::StmRetry, "transaction conflict")
}

pub fn in_transaction() -> bool {
    CURRENT_TX.with(|tx| tx.borrow().is_some())
}

fn with_tx<R>(f: impl FnOnce(&mut Transaction) -> Result<R, SableError>) -> Result<R, SableError> {
    CURRENT_TX.with(|cell| {
        let mut guard = cell.borrow_mut();
        match guard.as_mut() {
            Some(tx) => f(tx),
            None => Err(SableError::new(
                Phase::Eval,
                ErrorKind::Value,
                "no transaction running",
            )),
        }
    })
}

/// Transactional read: in-transaction override, else the newest committed
/// version at or before the read point
pub fn do_get(r: &Arc<StmRef>) -> Result<Value, SableError> {
    with_tx(|tx| {
        if let Some(v) = tx.overrides.get(&r.id) {
            return Ok(v.clone());
        }
        tx.refs.entry(r.id).or_insert_with(|| r.clone());
        let history = r.lock_history();
        match history.version_at(tx.read_point) {
            Some(version) => Ok(version.value.clone()),
            // History trimmed past our snapshot
            None => Err(retry_signal()),
        }
    })
}

pub fn do_set(r: &Arc<StmRef>, value: Value) -> Result<Value, SableError> {
    with_tx(|tx| {
        {
            let history = r.lock_history();
            if history.newest().commit_point > tx.read_point {
                return Err(retry_signal());
            }
        }
        tx.refs.entry(r.id).or_insert_with(|| r.clone());
        tx.overrides.insert(r.id, value.clone());
        tx.written.insert(r.id);
        Ok(value)
    })
}

pub fn do_commute(r: &Arc<StmRef>, f: &Value, args: &[Value]) -> Result<Value, SableError> {
    // Apply against the in-transaction view now; replay at commit
    let current = with_tx(|tx| {
        tx.refs.entry(r.id).or_insert_with(|| r.clone());
        match tx.overrides.get(&r.id) {
            Some(v) => Ok(Some(v.clone())),
            None => Ok(None),
        }
    })?;
    let current = match current {
        Some(v) => v,
        None => {
            let history = r.lock_history();
            match history.version_at(with_tx(|tx| Ok(tx.read_point))?) {
                Some(version) => version.value.clone(),
                None => return Err(retry_signal()),
            }
        }
    };
    let mut call_args = vec![current];
    call_args.extend_from_slice(args);
    let result = call_value(f, &call_args)?;
    with_tx(|tx| {
        tx.overrides.insert(r.id, result.clone());
        tx.commutes.push((r.id, f.clone(), args.to_vec()));
        Ok(result.clone())
    })
}

pub fn do_ensure(r: &Arc<StmRef>) -> Result<Value, SableError> {
    with_tx(|tx| {
        {
            let history = r.lock_history();
            if history.newest().commit_point > tx.read_point {
                return Err(retry_signal());
            }
        }
        tx.refs.entry(r.id).or_insert_with(|| r.clone());
        tx.ensures.insert(r.id);
        Ok(())
    })?;
    do_get(r)
}

/// Run `f` (a zero-argument callable) inside a transaction, retrying on
/// conflict. A transaction started inside another joins the outer one.
pub fn run_in_transaction(f: &Value) -> Result<Value, SableError> {
    if in_transaction() {
        return call_value(f, &[]);
    }
    for _attempt in 0..RETRY_LIMIT {
        let tx = Transaction {
            read_point: COMMIT_POINT.load(Ordering::SeqCst),
            overrides: HashMap::new(),
            refs: HashMap::new(),
            written: HashSet::new(),
            commutes: Vec::new(),
            ensures: HashSet::new(),
        };
        CURRENT_TX.with(|cell| *cell.borrow_mut() = Some(tx));
        let body_result = call_value(f, &[]);
        let tx = CURRENT_TX
            .with(|cell| cell.borrow_mut().take())
            .expect("transaction vanished");

        match body_result {
            Err(e) if e.kind == ErrorKind::StmRetry => {
                std::thread::yield_now();
                continue;
            }
            Err(e) => return Err(e),
            Ok(value) => match commit(tx) {
                CommitOutcome::Committed => return Ok(value),
                CommitOutcome::Retry => {
                    std::thread::yield_now();
                    continue;
                }
                CommitOutcome::Failed(e) => return Err(e),
            },
        }
    }
    Err(SableError::new(
        Phase::Eval,
        ErrorKind::StmRetryExhausted,
        format!("transaction retried {} times without committing", RETRY_LIMIT),
    ))
}

enum CommitOutcome {
    Committed,
    Retry,
    Failed(SableError),
}

fn commit(mut tx: Transaction) -> CommitOutcome {
    if tx.written.is_empty() && tx.commutes.is_empty() && tx.ensures.is_empty() {
        return CommitOutcome::Committed;
    }

    // Deterministic lock order prevents deadlock between committers
    let mut locked_refs: Vec<Arc<StmRef>> = tx.refs.values().cloned().collect();
    locked_refs.sort_by_key(|r| r.id);
    let mut guards: Vec<std::sync::MutexGuard<'_, sable_core::refs::RefHistory>> = locked_refs
        .iter()
        .map(|r| r.lock_history())
        .collect();
    let index_of: HashMap<u64, usize> = locked_refs
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id, i))
        .collect();

    // Phase 1: replay queued commutes against the current committed values
    for (ref_id, f, args) in &tx.commutes {
        let idx = index_of[ref_id];
        let current = guards[idx].newest().value.clone();
        let mut call_args = vec![current];
        call_args.extend_from_slice(args);
        match call_value(f, &call_args) {
            Ok(result) => {
                tx.overrides.insert(*ref_id, result);
                tx.written.insert(*ref_id);
            }
            Err(e) => return CommitOutcome::Failed(e),
        }
    }

    // Phase 2: every written ref must still be at or before the read point
    for ref_id in &tx.written {
        let idx = index_of[ref_id];
        if guards[idx].newest().commit_point > tx.read_point {
            return CommitOutcome::Retry;
        }
    }

    // Phase 3: ensured-but-unwritten refs must be unchanged
    for ref_id in &tx.ensures {
        if tx.written.contains(ref_id) {
            continue;
        }
        let idx = index_of[ref_id];
        if guards[idx].newest().commit_point > tx.read_point {
            return CommitOutcome::Retry;
        }
    }

    // Phase 4: validators on proposed values
    for ref_id in &tx.written {
        let idx = index_of[ref_id];
        let proposed = tx.overrides[ref_id].clone();
        let validator = locked_refs[idx]
            .validator
            .read()
            .expect("ref poisoned")
            .clone();
        if let Some(validator) = validator {
            match call_value(&validator, &[proposed]) {
                Ok(v) if v.is_truthy() => {}
                Ok(_) => {
                    return CommitOutcome::Failed(SableError::value_err(
                        "ref validator rejected the proposed value",
                    ));
                }
                Err(e) => return CommitOutcome::Failed(e),
            }
        }
    }

    // Phase 5: one fresh commit point for the whole transaction
    let commit_point = COMMIT_POINT.fetch_add(1, Ordering::SeqCst) + 1;
    let mut watch_events: Vec<(Arc<StmRef>, Value, Value)> = Vec::new();
    for ref_id in &tx.written {
        let idx = index_of[ref_id];
        let new_value = tx.overrides[ref_id].clone();
        let old_value = guards[idx].newest().value.clone();
        guards[idx].commit(new_value.clone(), commit_point);
        watch_events.push((locked_refs[idx].clone(), old_value, new_value));
    }

    // Phase 6: release, then fire watches outside any lock
    drop(guards);
    for (r, old, new) in watch_events {
        for (key, watch_fn) in r.watches_snapshot() {
            let args = [key, Value::Ref(r.clone()), old.clone(), new.clone()];
            let _ = call_value(&watch_fn, &args);
        }
    }
    CommitOutcome::Committed
}

/// Committed read outside any transaction; snapshot read inside one
pub fn ref_deref(r: &Arc<StmRef>) -> Result<Value, SableError> {
    if in_transaction() {
        do_get(r)
    } else {
        Ok(r.current())
    }
}

/// Current transaction's touched values (GC root scanning)
pub fn trace_current_tx(f: &mut dyn FnMut(&Value)) {
    CURRENT_TX.with(|cell| {
        if let Some(tx) = &*cell.borrow() {
            for v in tx.overrides.values() {
                f(v);
            }
            for (_, func, args) in &tx.commutes {
                f(func);
                for a in args {
                    f(a);
                }
            }
        }
    });
}
