//! Namespaces, vars, and the global environment
//!
//! The environment owns the namespace table, the current-namespace cell,
//! the load path, tagged-literal readers, and the registry of lazily
//! loadable namespace definitions. Tables are lock-guarded; inserts are
//! rare after bootstrap.

use crate::registry::NamespaceDef;
use sable_core::error::SableError;
use sable_core::refs::Var;
use sable_core::symbol::Symbol;
use sable_core::value::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// Load lifecycle, used to detect circular requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsState {
    Unloaded,
    Loading,
    Loaded,
}

#[derive(Debug)]
pub struct Namespace {
    pub name: String,
    /// name → Value::Var interned here
    mappings: RwLock<HashMap<String, Value>>,
    /// short alias → full namespace name
    aliases: RwLock<HashMap<String, String>>,
    /// name → Value::Var referred from another namespace
    referred: RwLock<HashMap<String, Value>>,
    pub doc: RwLock<Option<String>>,
    pub state: RwLock<NsState>,
}

impl Namespace {
    fn new(name: &str) -> Namespace {
        Namespace {
            name: name.to_string(),
            mappings: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            referred: RwLock::new(HashMap::new()),
            doc: RwLock::new(None),
            state: RwLock::new(NsState::Unloaded),
        }
    }

    /// Get or create the var named `name` in this namespace
    pub fn intern(&self, name: &str) -> Value {
        let mut mappings = self.mappings.write().expect("ns poisoned");
        mappings
            .entry(name.to_string())
            .or_insert_with(|| {
                let var = Var::new(
                    sable_core::intern_str(&self.name),
                    sable_core::intern_str(name),
                );
                sable_core::gc::alloc(Value::Var(Arc::new(var)))
            })
            .clone()
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let own = self
            .mappings
            .read()
            .expect("ns poisoned")
            .get(name)
            .cloned();
        own.or_else(|| {
            self.referred
                .read()
                .expect("ns poisoned")
                .get(name)
                .cloned()
        })
    }

    pub fn add_alias(&self, short: &str, full: &str) {
        self.aliases
            .write()
            .expect("ns poisoned")
            .insert(short.to_string(), full.to_string());
    }

    pub fn resolve_alias(&self, short: &str) -> Option<String> {
        self.aliases
            .read()
            .expect("ns poisoned")
            .get(short)
            .cloned()
    }

    pub fn refer(&self, name: &str, var: Value) {
        self.referred
            .write()
            .expect("ns poisoned")
            .insert(name.to_string(), var);
    }

    pub fn var_names(&self) -> Vec<String> {
        self.mappings
            .read()
            .expect("ns poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Every var interned here (GC roots, snapshots)
    pub fn vars(&self) -> Vec<Value> {
        self.mappings
            .read()
            .expect("ns poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn set_state(&self, state: NsState) {
        *self.state.write().expect("ns poisoned") = state;
    }

    pub fn get_state(&self) -> NsState {
        *self.state.read().expect("ns poisoned")
    }
}

pub const CORE_NS: &str = "sable.core";

pub struct Environment {
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    current: RwLock<String>,
    load_path: RwLock<Vec<PathBuf>>,
    /// Registered-but-not-yet-materialized namespace definitions
    lazy_defs: Mutex<HashMap<String, NamespaceDef>>,
    tagged_readers: RwLock<HashMap<String, Value>>,
}

static ENV: OnceLock<Environment> = OnceLock::new();

pub fn global() -> &'static Environment {
    ENV.get_or_init(|| {
        let env = Environment {
            namespaces: RwLock::new(HashMap::new()),
            current: RwLock::new("user".to_string()),
            load_path: RwLock::new(vec![PathBuf::from(".")]),
            lazy_defs: Mutex::new(HashMap::new()),
            tagged_readers: RwLock::new(HashMap::new()),
        };
        env.find_or_create_ns("user");
        env
    })
}

impl Environment {
    pub fn find_ns(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .read()
            .expect("env poisoned")
            .get(name)
            .cloned()
    }

    pub fn find_or_create_ns(&self, name: &str) -> Arc<Namespace> {
        let mut namespaces = self.namespaces.write().expect("env poisoned");
        namespaces
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Namespace::new(name)))
            .clone()
    }

    pub fn all_ns(&self) -> Vec<Arc<Namespace>> {
        self.namespaces
            .read()
            .expect("env poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn current_ns_name(&self) -> String {
        self.current.read().expect("env poisoned").clone()
    }

    pub fn current_ns(&self) -> Arc<Namespace> {
        let name = self.current_ns_name();
        self.find_or_create_ns(&name)
    }

    pub fn set_current_ns(&self, name: &str) {
        self.find_or_create_ns(name);
        *self.current.write().expect("env poisoned") = name.to_string();
    }

    pub fn load_path(&self) -> Vec<PathBuf> {
        self.load_path.read().expect("env poisoned").clone()
    }

    pub fn push_load_path(&self, path: PathBuf) {
        self.load_path.write().expect("env poisoned").push(path);
    }

    /// Park a namespace definition for materialization on first require
    pub fn register_lazy(&self, def: NamespaceDef) {
        self.lazy_defs
            .lock()
            .expect("env poisoned")
            .insert(def.name.to_string(), def);
    }

    pub fn take_lazy(&self, name: &str) -> Option<NamespaceDef> {
        self.lazy_defs.lock().expect("env poisoned").remove(name)
    }

    pub fn install_tag_reader(&self, tag: &str, ctor: Value) {
        self.tagged_readers
            .write()
            .expect("env poisoned")
            .insert(tag.to_string(), ctor);
    }

    pub fn tag_reader(&self, tag: &str) -> Option<Value> {
        self.tagged_readers
            .read()
            .expect("env poisoned")
            .get(tag)
            .cloned()
    }

    /// Resolve a symbol to a var: qualified through aliases and namespaces,
    /// unqualified through the current namespace, referred vars, and core.
    pub fn resolve(&self, sym: &Symbol) -> Option<Value> {
        match sym.ns_str() {
            Some(ns_or_alias) => {
                let current = self.current_ns();
                let full = current
                    .resolve_alias(ns_or_alias)
                    .unwrap_or_else(|| ns_or_alias.to_string());
                crate::runtime::ensure_loaded(&full).ok()?;
                self.find_ns(&full)?.lookup(sym.name_str())
            }
            None => {
                let current = self.current_ns();
                current.lookup(sym.name_str()).or_else(|| {
                    self.find_ns(CORE_NS)
                        .and_then(|core| core.lookup(sym.name_str()))
                })
            }
        }
    }

    /// Intern the var a `def` targets. Qualified names must match an
    /// existing namespace; unqualified names land in the current namespace.
    pub fn def_var(&self, sym: &Symbol) -> Result<Value, SableError> {
        let ns = match sym.ns_str() {
            Some(ns_name) => self.find_ns(ns_name).ok_or_else(|| {
                SableError::compile(format!("can't def into unknown namespace {}", ns_name))
            })?,
            None => self.current_ns(),
        };
        Ok(ns.intern(sym.name_str()))
    }

    /// Walk every var root in every namespace (GC root scanning)
    pub fn each_root_value(&self, f: &mut dyn FnMut(&Value)) {
        for ns in self.all_ns() {
            for var in ns.vars() {
                f(&var);
            }
        }
        for ctor in self
            .tagged_readers
            .read()
            .expect("env poisoned")
            .values()
        {
            f(ctor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let ns = Namespace::new("test.ns");
        let a = ns.intern("x");
        let b = ns.intern("x");
        assert!(a.identical(&b));
        assert_eq!(ns.var_names(), vec!["x".to_string()]);
    }

    #[test]
    fn test_refer_and_lookup() {
        let ns = Namespace::new("test.a");
        let other = Namespace::new("test.b");
        let var = other.intern("helper");
        ns.refer("helper", var.clone());
        assert!(ns.lookup("helper").unwrap().identical(&var));
        // Own mappings shadow referred vars
        let own = ns.intern("helper");
        assert!(ns.lookup("helper").unwrap().identical(&own));
    }

    #[test]
    fn test_alias_resolution() {
        let ns = Namespace::new("test.c");
        ns.add_alias("str", "sable.string");
        assert_eq!(ns.resolve_alias("str").as_deref(), Some("sable.string"));
        assert!(ns.resolve_alias("nope").is_none());
    }
}
