//! Reference types: vars, atoms, STM refs, volatiles, promises
//!
//! These are the only mutable cells in the value model. Atoms are
//! linearizable via their lock; refs carry the MVCC history the STM commits
//! against (the transaction machinery itself lives in the runtime crate);
//! vars layer per-thread binding stacks over a shared root.

use crate::error::SableError;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Vars and dynamic bindings
// ---------------------------------------------------------------------------

/// A named cell in a namespace: root binding plus thread-local overrides
#[derive(Debug)]
pub struct Var {
    pub ns: Arc<str>,
    pub name: Arc<str>,
    /// Stable id keying the per-thread binding stacks
    pub id: u64,
    root: RwLock<Option<Value>>,
    dynamic: AtomicBool,
    macro_flag: AtomicBool,
    meta: RwLock<Option<Value>>,
}

impl Var {
    pub fn new(ns: Arc<str>, name: Arc<str>) -> Var {
        Var {
            ns,
            name,
            id: fresh_id(),
            root: RwLock::new(None),
            dynamic: AtomicBool::new(false),
            macro_flag: AtomicBool::new(false),
            meta: RwLock::new(None),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.ns, self.name)
    }

    pub fn root(&self) -> Option<Value> {
        self.root.read().expect("var poisoned").clone()
    }

    pub fn bind_root(&self, value: Value) {
        *self.root.write().expect("var poisoned") = Some(value);
    }

    pub fn is_bound(&self) -> bool {
        self.root.read().expect("var poisoned").is_some()
            || (self.is_dynamic() && bindings::lookup(self.id).is_some())
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic.load(Ordering::Acquire)
    }

    pub fn set_dynamic(&self, flag: bool) {
        self.dynamic.store(flag, Ordering::Release);
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.load(Ordering::Acquire)
    }

    pub fn set_macro(&self, flag: bool) {
        self.macro_flag.store(flag, Ordering::Release);
    }

    pub fn meta(&self) -> Option<Value> {
        self.meta.read().expect("var poisoned").clone()
    }

    pub fn set_meta(&self, meta: Option<Value>) {
        *self.meta.write().expect("var poisoned") = meta;
    }

    /// Topmost thread binding if present, else the root binding
    pub fn deref(&self) -> Result<Value, SableError> {
        if self.is_dynamic() {
            if let Some(v) = bindings::lookup(self.id) {
                return Ok(v);
            }
        }
        self.root().ok_or_else(|| {
            SableError::unbound(format!("unbound var: #'{}", self.qualified_name()))
        })
    }

    /// Replace the topmost thread binding (`set!` on a dynamic var)
    pub fn set_thread_binding(&self, value: Value) -> Result<(), SableError> {
        if !self.is_dynamic() {
            return Err(SableError::value_err(format!(
                "can't set! non-dynamic var #'{}",
                self.qualified_name()
            )));
        }
        if !bindings::rebind(self.id, value) {
            return Err(SableError::value_err(format!(
                "can't set! var #'{} outside binding",
                self.qualified_name()
            )));
        }
        Ok(())
    }
}

/// Per-thread dynamic binding stacks, registered globally so the GC can
/// scan every thread's frames as roots.
pub mod bindings {
    use super::*;
    use std::cell::RefCell;

    pub type Frame = HashMap<u64, Value>;

    #[derive(Debug, Default)]
    pub struct ThreadBindings {
        frames: Mutex<Vec<Frame>>,
    }

    static REGISTRY: Mutex<Vec<Weak<ThreadBindings>>> = Mutex::new(Vec::new());

    thread_local! {
        static LOCAL: RefCell<Option<Arc<ThreadBindings>>> = const { RefCell::new(None) };
    }

    fn local() -> Arc<ThreadBindings> {
        LOCAL.with(|cell| {
            let mut slot = cell.borrow_mut();
            match &*slot {
                Some(tb) => tb.clone(),
                None => {
                    let tb = Arc::new(ThreadBindings::default());
                    let mut registry = REGISTRY.lock().expect("binding registry poisoned");
                    registry.retain(|w| w.strong_count() > 0);
                    registry.push(Arc::downgrade(&tb));
                    *slot = Some(tb.clone());
                    tb
                }
            }
        })
    }

    /// Push a binding frame (the `binding` form entry)
    pub fn push(frame: Frame) {
        local().frames.lock().expect("bindings poisoned").push(frame);
    }

    /// Pop the innermost frame (the `binding` form exit)
    pub fn pop() -> Result<(), SableError> {
        let tb = local();
        let mut frames = tb.frames.lock().expect("bindings poisoned");
        frames
            .pop()
            .map(|_| ())
            .ok_or_else(|| SableError::value_err("pop-thread-bindings without matching push"))
    }

    /// Walk this thread's frames innermost-first
    pub fn lookup(var_id: u64) -> Option<Value> {
        let tb = local();
        let frames = tb.frames.lock().expect("bindings poisoned");
        frames.iter().rev().find_map(|f| f.get(&var_id).cloned())
    }

    /// Replace the innermost binding of `var_id`; false when unbound here
    pub fn rebind(var_id: u64, value: Value) -> bool {
        let tb = local();
        let mut frames = tb.frames.lock().expect("bindings poisoned");
        for frame in frames.iter_mut().rev() {
            if let Some(slot) = frame.get_mut(&var_id) {
                *slot = value;
                return true;
            }
        }
        false
    }

    /// Scan every live thread's binding values (GC roots)
    pub fn each_bound_value(f: &mut dyn FnMut(&Value)) {
        let registry = REGISTRY.lock().expect("binding registry poisoned");
        for weak in registry.iter() {
            if let Some(tb) = weak.upgrade() {
                let frames = tb.frames.lock().expect("bindings poisoned");
                for frame in frames.iter() {
                    for value in frame.values() {
                        f(value);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Atoms
// ---------------------------------------------------------------------------

/// A mutable cell with compare-and-set semantics and a watch list
#[derive(Debug)]
pub struct AtomCell {
    value: RwLock<Value>,
    pub validator: RwLock<Option<Value>>,
    watches: RwLock<Vec<(Value, Value)>>,
    meta: RwLock<Option<Value>>,
}

impl AtomCell {
    pub fn new(value: Value) -> AtomCell {
        AtomCell {
            value: RwLock::new(value),
            validator: RwLock::new(None),
            watches: RwLock::new(Vec::new()),
            meta: RwLock::new(None),
        }
    }

    pub fn load(&self) -> Value {
        self.value.read().expect("atom poisoned").clone()
    }

    /// Unconditional store; returns the previous value
    pub fn store(&self, value: Value) -> Value {
        let mut guard = self.value.write().expect("atom poisoned");
        std::mem::replace(&mut *guard, value)
    }

    /// Store iff the current value equals `expected` (structural equality)
    pub fn compare_and_set(&self, expected: &Value, value: Value) -> bool {
        let mut guard = self.value.write().expect("atom poisoned");
        if crate::cmp::value_equals(&guard, expected) {
            *guard = value;
            true
        } else {
            false
        }
    }

    pub fn add_watch(&self, key: Value, f: Value) {
        let mut watches = self.watches.write().expect("atom poisoned");
        match watches
            .iter()
            .position(|(k, _)| crate::cmp::value_equals(k, &key))
        {
            Some(idx) => watches[idx] = (key, f),
            None => watches.push((key, f)),
        }
    }

    pub fn remove_watch(&self, key: &Value) {
        self.watches
            .write()
            .expect("atom poisoned")
            .retain(|(k, _)| !crate::cmp::value_equals(k, key));
    }

    /// Snapshot for firing outside any lock
    pub fn watches_snapshot(&self) -> Vec<(Value, Value)> {
        self.watches.read().expect("atom poisoned").clone()
    }

    pub fn meta(&self) -> Option<Value> {
        self.meta.read().expect("atom poisoned").clone()
    }

    pub fn set_meta(&self, meta: Option<Value>) {
        *self.meta.write().expect("atom poisoned") = meta;
    }
}

// ---------------------------------------------------------------------------
// STM refs
// ---------------------------------------------------------------------------

/// One committed version of a ref
#[derive(Debug, Clone)]
pub struct RefVersion {
    pub value: Value,
    pub commit_point: u64,
}

/// History chain (newest first) plus retention bounds
#[derive(Debug)]
pub struct RefHistory {
    pub versions: Vec<RefVersion>,
    pub min_history: usize,
    pub max_history: usize,
}

impl RefHistory {
    /// Newest commit at or before `read_point`
    pub fn version_at(&self, read_point: u64) -> Option<&RefVersion> {
        self.versions.iter().find(|v| v.commit_point <= read_point)
    }

    pub fn newest(&self) -> &RefVersion {
        &self.versions[0]
    }

    /// Prepend a committed version and trim past max_history
    pub fn commit(&mut self, value: Value, commit_point: u64) {
        self.versions.insert(0, RefVersion { value, commit_point });
        let keep = self.max_history.max(1);
        if self.versions.len() > keep {
            self.versions.truncate(keep);
        }
    }
}

/// An STM-managed cell with versioned history
#[derive(Debug)]
pub struct StmRef {
    /// Lock acquisition follows ascending id order during commit
    pub id: u64,
    history: Mutex<RefHistory>,
    pub validator: RwLock<Option<Value>>,
    watches: RwLock<Vec<(Value, Value)>>,
    meta: RwLock<Option<Value>>,
}

impl StmRef {
    pub fn new(value: Value) -> StmRef {
        StmRef::with_history(value, 0, 10)
    }

    pub fn with_history(value: Value, min_history: usize, max_history: usize) -> StmRef {
        StmRef {
            id: fresh_id(),
            history: Mutex::new(RefHistory {
                versions: vec![RefVersion {
                    value,
                    commit_point: 0,
                }],
                min_history,
                max_history,
            }),
            validator: RwLock::new(None),
            watches: RwLock::new(Vec::new()),
            meta: RwLock::new(None),
        }
    }

    pub fn lock_history(&self) -> std::sync::MutexGuard<'_, RefHistory> {
        self.history.lock().expect("ref poisoned")
    }

    /// Non-blocking history access (GC tracing while a commit may hold the
    /// lock on this thread)
    pub fn try_lock_history(&self) -> Option<std::sync::MutexGuard<'_, RefHistory>> {
        self.history.try_lock().ok()
    }

    /// Latest committed value, outside any transaction
    pub fn current(&self) -> Value {
        self.lock_history().newest().value.clone()
    }

    pub fn add_watch(&self, key: Value, f: Value) {
        let mut watches = self.watches.write().expect("ref poisoned");
        match watches
            .iter()
            .position(|(k, _)| crate::cmp::value_equals(k, &key))
        {
            Some(idx) => watches[idx] = (key, f),
            None => watches.push((key, f)),
        }
    }

    pub fn remove_watch(&self, key: &Value) {
        self.watches
            .write()
            .expect("ref poisoned")
            .retain(|(k, _)| !crate::cmp::value_equals(k, key));
    }

    pub fn watches_snapshot(&self) -> Vec<(Value, Value)> {
        self.watches.read().expect("ref poisoned").clone()
    }

    pub fn meta(&self) -> Option<Value> {
        self.meta.read().expect("ref poisoned").clone()
    }

    pub fn set_meta(&self, meta: Option<Value>) {
        *self.meta.write().expect("ref poisoned") = meta;
    }
}

// ---------------------------------------------------------------------------
// Volatiles and promises
// ---------------------------------------------------------------------------

/// A mutable cell without atomicity guarantees beyond the lock itself
#[derive(Debug)]
pub struct VolatileCell {
    value: RwLock<Value>,
}

impl VolatileCell {
    pub fn new(value: Value) -> VolatileCell {
        VolatileCell {
            value: RwLock::new(value),
        }
    }

    pub fn load(&self) -> Value {
        self.value.read().expect("volatile poisoned").clone()
    }

    pub fn store(&self, value: Value) {
        *self.value.write().expect("volatile poisoned") = value;
    }
}

/// A write-once cell readers block on
#[derive(Debug)]
pub struct PromiseCell {
    state: Mutex<Option<Value>>,
    delivered: Condvar,
}

impl Default for PromiseCell {
    fn default() -> Self {
        PromiseCell::new()
    }
}

impl PromiseCell {
    pub fn new() -> PromiseCell {
        PromiseCell {
            state: Mutex::new(None),
            delivered: Condvar::new(),
        }
    }

    /// Set the value iff not yet delivered; returns whether this call won
    pub fn deliver(&self, value: Value) -> bool {
        let mut state = self.state.lock().expect("promise poisoned");
        if state.is_some() {
            return false;
        }
        *state = Some(value);
        self.delivered.notify_all();
        true
    }

    pub fn is_delivered(&self) -> bool {
        self.state.lock().expect("promise poisoned").is_some()
    }

    /// Current value without blocking (GC tracing, `realized?`)
    pub fn peek(&self) -> Option<Value> {
        self.state.lock().expect("promise poisoned").clone()
    }

    /// Block until delivered
    pub fn wait(&self) -> Value {
        let mut state = self.state.lock().expect("promise poisoned");
        loop {
            if let Some(v) = &*state {
                return v.clone();
            }
            state = self.delivered.wait(state).expect("promise poisoned");
        }
    }

    /// Block up to `timeout`; `None` on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Value> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().expect("promise poisoned");
        loop {
            if let Some(v) = &*state {
                return Some(v.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .delivered
                .wait_timeout(state, deadline - now)
                .expect("promise poisoned");
            state = guard;
            if result.timed_out() && state.is_none() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_atom_cas() {
        let a = AtomCell::new(Value::Int(0));
        assert!(a.compare_and_set(&Value::Int(0), Value::Int(1)));
        assert!(!a.compare_and_set(&Value::Int(0), Value::Int(2)));
        assert!(matches!(a.load(), Value::Int(1)));
        let prev = a.store(Value::Int(9));
        assert!(matches!(prev, Value::Int(1)));
    }

    #[test]
    fn test_var_deref_falls_through_bindings() {
        let v = Var::new(Arc::from("user"), Arc::from("x"));
        assert!(v.deref().is_err());
        v.bind_root(Value::Int(1));
        assert!(matches!(v.deref().unwrap(), Value::Int(1)));

        v.set_dynamic(true);
        let mut frame = bindings::Frame::new();
        frame.insert(v.id, Value::Int(2));
        bindings::push(frame);
        assert!(matches!(v.deref().unwrap(), Value::Int(2)));
        v.set_thread_binding(Value::Int(3)).unwrap();
        assert!(matches!(v.deref().unwrap(), Value::Int(3)));
        bindings::pop().unwrap();
        assert!(matches!(v.deref().unwrap(), Value::Int(1)));
    }

    #[test]
    fn test_set_on_unbound_dynamic_var_fails() {
        let v = Var::new(Arc::from("user"), Arc::from("y"));
        v.set_dynamic(true);
        v.bind_root(Value::Int(0));
        assert!(v.set_thread_binding(Value::Int(1)).is_err());
    }

    #[test]
    fn test_ref_history_lookup() {
        let r = StmRef::new(Value::Int(0));
        {
            let mut h = r.lock_history();
            h.commit(Value::Int(10), 5);
            h.commit(Value::Int(20), 9);
        }
        let h = r.lock_history();
        assert_eq!(h.version_at(4).unwrap().commit_point, 0);
        assert_eq!(h.version_at(5).unwrap().commit_point, 5);
        assert_eq!(h.version_at(100).unwrap().commit_point, 9);
        assert!(matches!(h.newest().value, Value::Int(20)));
    }

    #[test]
    fn test_promise_blocks_until_delivered() {
        let p = Arc::new(PromiseCell::new());
        let p2 = p.clone();
        let handle = thread::spawn(move || p2.wait());
        thread::sleep(Duration::from_millis(20));
        assert!(p.deliver(Value::Int(42)));
        assert!(!p.deliver(Value::Int(43)));
        match handle.join().unwrap() {
            Value::Int(42) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_promise_timeout_returns_none() {
        let p = PromiseCell::new();
        assert!(p.wait_timeout(Duration::from_millis(10)).is_none());
        p.deliver(Value::Int(1));
        assert!(p.wait_timeout(Duration::from_millis(10)).is_some());
    }
}
