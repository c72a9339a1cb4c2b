//! Symbols, keywords, and the intern tables
//!
//! Symbol name parts are interned into a process-wide string table so that
//! symbols with the same `(ns?, name)` share storage. Keywords are
//! additionally interned as whole values: two keywords with the same parts
//! are the same allocation, so equality short-circuits to pointer identity.
//! Both tables are mutex-guarded; inserts are rare after bootstrap.

use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

static STRING_TABLE: OnceLock<Mutex<HashMap<String, Arc<str>>>> = OnceLock::new();
static KEYWORD_TABLE: OnceLock<Mutex<HashMap<(Option<String>, String), Keyword>>> = OnceLock::new();

/// Intern a string, returning a reference-stable shared slice
pub fn intern_str(s: &str) -> Arc<str> {
    let table = STRING_TABLE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = table.lock().expect("string intern table poisoned");
    if let Some(existing) = guard.get(s) {
        return existing.clone();
    }
    let arc: Arc<str> = Arc::from(s);
    guard.insert(s.to_string(), arc.clone());
    arc
}

/// A symbol: `(ns?, name)` with optional metadata
///
/// Metadata does not participate in equality or hashing.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub ns: Option<Arc<str>>,
    pub name: Arc<str>,
    pub meta: Option<Arc<Value>>,
}

impl Symbol {
    pub fn simple(name: &str) -> Symbol {
        Symbol {
            ns: None,
            name: intern_str(name),
            meta: None,
        }
    }

    pub fn qualified(ns: &str, name: &str) -> Symbol {
        Symbol {
            ns: Some(intern_str(ns)),
            name: intern_str(name),
            meta: None,
        }
    }

    /// Parse `ns/name` or plain `name`. A lone `/` is the division symbol.
    pub fn parse(text: &str) -> Symbol {
        if text == "/" {
            return Symbol::simple("/");
        }
        match text.find('/') {
            Some(idx) if idx > 0 && idx < text.len() - 1 => {
                Symbol::qualified(&text[..idx], &text[idx + 1..])
            }
            _ => Symbol::simple(text),
        }
    }

    pub fn ns_str(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    pub fn name_str(&self) -> &str {
        &self.name
    }

    pub fn with_meta(&self, meta: Option<Value>) -> Symbol {
        Symbol {
            ns: self.ns.clone(),
            name: self.name.clone(),
            meta: meta.map(Arc::new),
        }
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.ns == other.ns
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(ns) = &self.ns {
            ns.hash(state);
        }
        self.name.hash(state);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ns_str() {
            Some(ns) => write!(f, "{}/{}", ns, self.name_str()),
            None => write!(f, "{}", self.name_str()),
        }
    }
}

/// A keyword, interned process-wide
///
/// The inner allocation is shared by every occurrence of the same keyword,
/// so `Arc::ptr_eq` decides equality.
#[derive(Debug, Clone)]
pub struct Keyword(Arc<KeywordInner>);

#[derive(Debug)]
pub struct KeywordInner {
    pub ns: Option<Arc<str>>,
    pub name: Arc<str>,
}

impl Keyword {
    pub fn intern(ns: Option<&str>, name: &str) -> Keyword {
        let table = KEYWORD_TABLE.get_or_init(|| Mutex::new(HashMap::new()));
        let key = (ns.map(str::to_string), name.to_string());
        let mut guard = table.lock().expect("keyword intern table poisoned");
        if let Some(existing) = guard.get(&key) {
            return existing.clone();
        }
        let kw = Keyword(Arc::new(KeywordInner {
            ns: ns.map(intern_str),
            name: intern_str(name),
        }));
        guard.insert(key, kw.clone());
        kw
    }

    pub fn simple(name: &str) -> Keyword {
        Keyword::intern(None, name)
    }

    /// Parse `ns/name` or plain `name` (without the leading colon)
    pub fn parse(text: &str) -> Keyword {
        match text.find('/') {
            Some(idx) if idx > 0 && idx < text.len() - 1 => {
                Keyword::intern(Some(&text[..idx]), &text[idx + 1..])
            }
            _ => Keyword::simple(text),
        }
    }

    pub fn ns_str(&self) -> Option<&str> {
        self.0.ns.as_deref()
    }

    pub fn name_str(&self) -> &str {
        &self.0.name
    }

    /// Address of the interned allocation (identity for `identical?` and GC)
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Walk every interned keyword (GC root scanning)
    pub fn each_interned(f: &mut dyn FnMut(&Keyword)) {
        if let Some(table) = KEYWORD_TABLE.get() {
            let guard = table.lock().expect("keyword intern table poisoned");
            for kw in guard.values() {
                f(kw);
            }
        }
    }
}

impl PartialEq for Keyword {
    fn eq(&self, other: &Self) -> bool {
        // Interned: identity decides, content check covers pre-intern clones
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.name == other.0.name && self.0.ns == other.0.ns)
    }
}

impl Eq for Keyword {}

impl Hash for Keyword {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(ns) = &self.0.ns {
            ns.hash(state);
        }
        self.0.name.hash(state);
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ns_str() {
            Some(ns) => write!(f, ":{}/{}", ns, self.name_str()),
            None => write!(f, ":{}", self.name_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_parse() {
        let s = Symbol::parse("sable.core/map");
        assert_eq!(s.ns_str(), Some("sable.core"));
        assert_eq!(s.name_str(), "map");

        let plain = Symbol::parse("inc");
        assert_eq!(plain.ns_str(), None);
        assert_eq!(plain.name_str(), "inc");

        // A lone slash is the division symbol, not a separator
        let div = Symbol::parse("/");
        assert_eq!(div.name_str(), "/");
        assert_eq!(div.ns_str(), None);
    }

    #[test]
    fn test_symbol_equality_ignores_meta() {
        let a = Symbol::simple("x");
        let b = a.with_meta(Some(Value::Bool(true)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_keyword_interning_identity() {
        let a = Keyword::intern(Some("user"), "name");
        let b = Keyword::intern(Some("user"), "name");
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, b);
        let c = Keyword::simple("name");
        assert_ne!(a, c);
    }

    #[test]
    fn test_keyword_display() {
        assert_eq!(Keyword::simple("k").to_string(), ":k");
        assert_eq!(Keyword::intern(Some("a.b"), "k").to_string(), ":a.b/k");
    }

    #[test]
    fn test_intern_str_stable() {
        let a = intern_str("hello");
        let b = intern_str("hello");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
