//! Reader: UTF-8 text → positioned forms
//!
//! Recognizes the full token set: delimiters, quote, syntax-quote with
//! gensym templates, unquote and unquote-splicing, deref, metadata,
//! var-quote, regex literals, discard, reader conditionals, eval, tagged
//! literals, strings, characters, numbers (including radix forms), symbols,
//! keywords (including auto-resolution), and comments. Namespace-dependent
//! decisions (auto-resolved keywords, syntax-quote qualification, tagged
//! literal constructors, conditional features) go through [`ReaderHost`].

use sable_core::error::{SableError, SourcePos};
use sable_core::list::PersistentList;
use sable_core::map::{ARRAY_MAP_THRESHOLD, ArrayMap, HashTrieMap};
use sable_core::set::PersistentSet;
use sable_core::symbol::{Keyword, Symbol};
use sable_core::value::{RegexVal, Value};
use sable_core::vector::PersistentVector;
use sable_core::vtable;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static GENSYM_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Fresh gensym id, shared with the `gensym` builtin
pub fn next_gensym_id() -> u64 {
    GENSYM_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Namespace-aware services the reader needs from the runtime
pub trait ReaderHost {
    fn current_ns(&self) -> String;
    fn resolve_alias(&self, alias: &str) -> Option<String>;
    /// Qualify an unqualified symbol inside a syntax-quote template
    fn qualify_symbol(&self, sym: &Symbol) -> Symbol;
    /// Feature keywords active for `#?` conditionals
    fn features(&self) -> Vec<Keyword>;
    /// Constructor for a tagged literal, if installed
    fn tagged_reader(&self, tag: &Symbol) -> Option<Value>;
    /// `#=` read-time evaluation
    fn eval_form(&self, form: &Value) -> Result<Value, SableError>;
}

/// Host with no namespace context (tests, detached tooling)
pub struct NullReaderHost;

impl ReaderHost for NullReaderHost {
    fn current_ns(&self) -> String {
        "user".to_string()
    }

    fn resolve_alias(&self, _alias: &str) -> Option<String> {
        None
    }

    fn qualify_symbol(&self, sym: &Symbol) -> Symbol {
        if sym.ns.is_some() {
            sym.clone()
        } else {
            Symbol::qualified(&self.current_ns(), sym.name_str())
        }
    }

    fn features(&self) -> Vec<Keyword> {
        vec![Keyword::simple("sbl"), Keyword::simple("default")]
    }

    fn tagged_reader(&self, _tag: &Symbol) -> Option<Value> {
        None
    }

    fn eval_form(&self, _form: &Value) -> Result<Value, SableError> {
        Err(SableError::value_err("#= reader eval not available"))
    }
}

/// One read step: a form, a `#?@` splice, or nothing (`#_`, comments)
enum Outcome {
    Form(Value),
    Splice(Vec<Value>),
    Nothing,
}

pub struct Reader<'h> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    host: &'h dyn ReaderHost,
    /// Inside `#(...)`; nesting is rejected
    in_anon_fn: bool,
}

/// Read every top-level form in `src`
pub fn read_all(src: &str, host: &dyn ReaderHost) -> Result<Vec<Value>, SableError> {
    let mut reader = Reader::new(src, host);
    let mut forms = Vec::new();
    while let Some(outcome) = reader.read_next()? {
        match outcome {
            Outcome::Form(f) => forms.push(f),
            Outcome::Splice(fs) => forms.extend(fs),
            Outcome::Nothing => {}
        }
    }
    Ok(forms)
}

/// Read the first form in `src`, if any
pub fn read_one(src: &str, host: &dyn ReaderHost) -> Result<Option<Value>, SableError> {
    let mut reader = Reader::new(src, host);
    loop {
        match reader.read_next()? {
            None => return Ok(None),
            Some(Outcome::Form(f)) => return Ok(Some(f)),
            Some(Outcome::Splice(fs)) => {
                if let Some(f) = fs.into_iter().next() {
                    return Ok(Some(f));
                }
            }
            Some(Outcome::Nothing) => {}
        }
    }
}

impl<'h> Reader<'h> {
    pub fn new(src: &str, host: &'h dyn ReaderHost) -> Reader<'h> {
        Reader {
            chars: src.chars().collect(),
            pos: 0,
            line: 0,
            column: 0,
            host,
            in_anon_fn: false,
        }
    }

    fn source_pos(&self) -> SourcePos {
        SourcePos::new(self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() || c == ',' => {
                    self.bump();
                }
                Some(';') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    /// Read one step; `None` at EOF
    fn read_next(&mut self) -> Result<Option<Outcome>, SableError> {
        self.skip_trivia();
        let pos = self.source_pos();
        let c = match self.peek() {
            Some(c) => c,
            None => return Ok(None),
        };
        let outcome = match c {
            '(' => {
                self.bump();
                let items = self.read_until(')', pos)?;
                Outcome::Form(self.with_pos(
                    Value::List(Arc::new(PersistentList::from_values(items))),
                    pos,
                ))
            }
            '[' => {
                self.bump();
                let items = self.read_until(']', pos)?;
                Outcome::Form(self.with_pos(
                    Value::Vector(Arc::new(PersistentVector::from_values(items))),
                    pos,
                ))
            }
            '{' => {
                self.bump();
                let items = self.read_until('}', pos)?;
                Outcome::Form(self.with_pos(self.items_to_map(items, pos)?, pos))
            }
            ')' | ']' | '}' => {
                return Err(SableError::reader(format!("unmatched delimiter '{}'", c), pos));
            }
            '"' => {
                self.bump();
                Outcome::Form(self.read_string(pos)?)
            }
            '\\' => {
                self.bump();
                Outcome::Form(self.read_char(pos)?)
            }
            '\'' => {
                self.bump();
                let form = self.expect_form("quote", pos)?;
                Outcome::Form(self.wrap("quote", form))
            }
            '`' => {
                self.bump();
                let form = self.expect_form("syntax-quote", pos)?;
                let mut gensyms = HashMap::new();
                Outcome::Form(self.syntax_quote(&form, &mut gensyms, pos)?)
            }
            '~' => {
                self.bump();
                if self.peek() == Some('@') {
                    self.bump();
                    let form = self.expect_form("unquote-splicing", pos)?;
                    Outcome::Form(self.wrap_qualified("sable.core/unquote-splicing", form))
                } else {
                    let form = self.expect_form("unquote", pos)?;
                    Outcome::Form(self.wrap_qualified("sable.core/unquote", form))
                }
            }
            '@' => {
                self.bump();
                let form = self.expect_form("deref", pos)?;
                Outcome::Form(self.wrap_qualified("sable.core/deref", form))
            }
            '^' => {
                self.bump();
                let meta = self.expect_form("metadata", pos)?;
                let target = self.expect_form("metadata target", pos)?;
                Outcome::Form(self.attach_meta(meta, target, pos)?)
            }
            '#' => return self.read_dispatch(pos).map(Some),
            ':' => {
                self.bump();
                Outcome::Form(self.read_keyword(pos)?)
            }
            _ => Outcome::Form(self.read_atom(pos)?),
        };
        Ok(Some(outcome))
    }

    /// A required sub-form (after quote, meta, etc.)
    fn expect_form(&mut self, what: &str, pos: SourcePos) -> Result<Value, SableError> {
        loop {
            match self.read_next()? {
                None => {
                    return Err(SableError::reader(format!("EOF while reading {}", what), pos));
                }
                Some(Outcome::Form(f)) => return Ok(f),
                Some(Outcome::Nothing) => {}
                Some(Outcome::Splice(_)) => {
                    return Err(SableError::reader(
                        format!("splicing conditional not allowed in {}", what),
                        pos,
                    ));
                }
            }
        }
    }

    fn read_until(&mut self, closer: char, open_pos: SourcePos) -> Result<Vec<Value>, SableError> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    return Err(SableError::reader(
                        format!("EOF while reading, expected '{}'", closer),
                        open_pos,
                    ));
                }
                Some(c) if c == closer => {
                    self.bump();
                    return Ok(items);
                }
                Some(c) if matches!(c, ')' | ']' | '}') => {
                    return Err(SableError::reader(
                        format!("unmatched delimiter '{}', expected '{}'", c, closer),
                        self.source_pos(),
                    ));
                }
                Some(_) => match self.read_next()? {
                    None => {
                        return Err(SableError::reader(
                            format!("EOF while reading, expected '{}'", closer),
                            open_pos,
                        ));
                    }
                    Some(Outcome::Form(f)) => items.push(f),
                    Some(Outcome::Splice(fs)) => items.extend(fs),
                    Some(Outcome::Nothing) => {}
                },
            }
        }
    }

    fn items_to_map(&self, items: Vec<Value>, pos: SourcePos) -> Result<Value, SableError> {
        if items.len() % 2 != 0 {
            return Err(SableError::reader(
                "map literal must contain an even number of forms",
                pos,
            ));
        }
        let pairs: Vec<(Value, Value)> = items
            .chunks(2)
            .map(|kv| (kv[0].clone(), kv[1].clone()))
            .collect();
        if pairs.len() <= ARRAY_MAP_THRESHOLD {
            Ok(Value::ArrayMap(Arc::new(ArrayMap::from_pairs(pairs))))
        } else {
            Ok(Value::Map(Arc::new(HashTrieMap::from_pairs(pairs))))
        }
    }

    /// Attach `{:line :column}` metadata to collections (1-indexed)
    fn with_pos(&self, form: Value, pos: SourcePos) -> Value {
        let meta = Value::ArrayMap(Arc::new(ArrayMap::from_pairs(vec![
            (Value::keyword("line"), Value::Int(pos.line as i64 + 1)),
            (Value::keyword("column"), Value::Int(pos.column as i64 + 1)),
        ])));
        form.with_meta(Some(meta)).unwrap_or(form)
    }

    fn wrap(&self, head: &str, form: Value) -> Value {
        Value::List(Arc::new(PersistentList::from_values(vec![
            Value::symbol(head),
            form,
        ])))
    }

    fn wrap_qualified(&self, head: &str, form: Value) -> Value {
        self.wrap(head, form)
    }

    // -- strings and characters ---------------------------------------------

    fn read_string(&mut self, open_pos: SourcePos) -> Result<Value, SableError> {
        let mut out = String::new();
        loop {
            let c = self
                .bump()
                .ok_or_else(|| SableError::reader("EOF while reading string", open_pos))?;
            match c {
                '"' => return Ok(Value::string(out)),
                '\\' => {
                    let esc_pos = self.source_pos();
                    let e = self
                        .bump()
                        .ok_or_else(|| SableError::reader("EOF in string escape", open_pos))?;
                    match e {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'b' => out.push('\u{8}'),
                        'f' => out.push('\u{c}'),
                        '0' => out.push('\0'),
                        'u' => out.push(self.read_unicode_escape(esc_pos)?),
                        other => {
                            return Err(SableError::reader(
                                format!("unsupported escape character '\\{}'", other),
                                esc_pos,
                            ));
                        }
                    }
                }
                c => out.push(c),
            }
        }
    }

    fn read_unicode_escape(&mut self, pos: SourcePos) -> Result<char, SableError> {
        let mut code = 0u32;
        for _ in 0..4 {
            let c = self
                .bump()
                .ok_or_else(|| SableError::reader("EOF in unicode escape", pos))?;
            let digit = c
                .to_digit(16)
                .ok_or_else(|| SableError::reader("invalid unicode escape", pos))?;
            code = code * 16 + digit;
        }
        char::from_u32(code)
            .ok_or_else(|| SableError::reader(format!("invalid unicode scalar {:#x}", code), pos))
    }

    fn read_char(&mut self, pos: SourcePos) -> Result<Value, SableError> {
        let first = self
            .bump()
            .ok_or_else(|| SableError::reader("EOF while reading character", pos))?;
        // Single-char literal unless a name follows
        if !first.is_ascii_alphanumeric() || !matches!(self.peek(), Some(c) if is_token_char(c)) {
            return Ok(Value::Char(first));
        }
        let mut name = String::from(first);
        while let Some(c) = self.peek() {
            if is_token_char(c) {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let c = match name.as_str() {
            "newline" => '\n',
            "space" => ' ',
            "tab" => '\t',
            "return" => '\r',
            "backspace" => '\u{8}',
            "formfeed" => '\u{c}',
            _ if name.len() == 1 => first,
            _ if name.starts_with('u') && name.len() == 5 => {
                let code = u32::from_str_radix(&name[1..], 16)
                    .map_err(|_| SableError::reader("invalid unicode character literal", pos))?;
                char::from_u32(code).ok_or_else(|| {
                    SableError::reader(format!("invalid unicode scalar {:#x}", code), pos)
                })?
            }
            _ => {
                return Err(SableError::reader(
                    format!("unsupported character literal \\{}", name),
                    pos,
                ));
            }
        };
        Ok(Value::Char(c))
    }

    // -- keywords, symbols, numbers -----------------------------------------

    fn read_keyword(&mut self, pos: SourcePos) -> Result<Value, SableError> {
        let auto_resolve = self.peek() == Some(':');
        if auto_resolve {
            self.bump();
        }
        let token = self.read_token(pos)?;
        if token.is_empty() {
            return Err(SableError::reader("keyword must have a name", pos));
        }
        if !auto_resolve {
            return Ok(Value::Keyword(Keyword::parse(&token)));
        }
        // ::k in the current ns, ::alias/k through the alias table
        match token.split_once('/') {
            None => Ok(Value::Keyword(Keyword::intern(
                Some(&self.host.current_ns()),
                &token,
            ))),
            Some((alias, name)) => {
                let ns = self.host.resolve_alias(alias).ok_or_else(|| {
                    SableError::reader(format!("no namespace alias '{}'", alias), pos)
                })?;
                Ok(Value::Keyword(Keyword::intern(Some(&ns), name)))
            }
        }
    }

    fn read_token(&mut self, _pos: SourcePos) -> Result<String, SableError> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if is_token_char(c) {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Ok(out)
    }

    fn read_atom(&mut self, pos: SourcePos) -> Result<Value, SableError> {
        let token = self.read_token(pos)?;
        if token.is_empty() {
            // Defensive: consume the offending character so we can report it
            let c = self.bump();
            return Err(SableError::reader(
                format!("unexpected character {:?}", c.unwrap_or('\0')),
                pos,
            ));
        }
        match token.as_str() {
            "nil" => return Ok(Value::Nil),
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => {}
        }
        let starts_number = token.chars().next().is_some_and(|c| c.is_ascii_digit())
            || (token.len() > 1
                && matches!(token.chars().next(), Some('+') | Some('-'))
                && token.chars().nth(1).is_some_and(|c| c.is_ascii_digit()));
        if starts_number {
            return parse_number(&token, pos);
        }
        Ok(self.with_sym_pos(Symbol::parse(&token), pos))
    }

    fn with_sym_pos(&self, sym: Symbol, pos: SourcePos) -> Value {
        let meta = Value::ArrayMap(Arc::new(ArrayMap::from_pairs(vec![
            (Value::keyword("line"), Value::Int(pos.line as i64 + 1)),
            (Value::keyword("column"), Value::Int(pos.column as i64 + 1)),
        ])));
        Value::Symbol(Arc::new(sym.with_meta(Some(meta))))
    }

    // -- metadata ------------------------------------------------------------

    fn attach_meta(
        &self,
        meta: Value,
        target: Value,
        pos: SourcePos,
    ) -> Result<Value, SableError> {
        let norm = match &meta {
            Value::Keyword(_) => Value::ArrayMap(Arc::new(ArrayMap::from_pairs(vec![(
                meta.clone(),
                Value::Bool(true),
            )]))),
            Value::Symbol(_) | Value::Str(_) => Value::ArrayMap(Arc::new(ArrayMap::from_pairs(
                vec![(Value::keyword("tag"), meta.clone())],
            ))),
            Value::ArrayMap(_) | Value::Map(_) => meta.clone(),
            other => {
                return Err(SableError::reader(
                    format!("metadata must be a keyword, symbol, string, or map, got {}", other.type_name()),
                    pos,
                ));
            }
        };
        let merged = merge_meta(target.meta(), &norm);
        target
            .with_meta(Some(merged))
            .map_err(|e| SableError::reader(e.message, pos))
    }

    // -- dispatch (#) --------------------------------------------------------

    fn read_dispatch(&mut self, pos: SourcePos) -> Result<Outcome, SableError> {
        self.bump(); // '#'
        let c = self
            .peek()
            .ok_or_else(|| SableError::reader("EOF after dispatch character '#'", pos))?;
        match c {
            '{' => {
                self.bump();
                let items = self.read_until('}', pos)?;
                Ok(Outcome::Form(self.with_pos(
                    Value::Set(Arc::new(PersistentSet::from_values(items))),
                    pos,
                )))
            }
            '"' => {
                self.bump();
                self.read_regex(pos).map(Outcome::Form)
            }
            '_' => {
                self.bump();
                self.expect_form("discarded form", pos)?;
                Ok(Outcome::Nothing)
            }
            '\'' => {
                self.bump();
                let form = self.expect_form("var-quote", pos)?;
                Ok(Outcome::Form(self.wrap("var", form)))
            }
            '(' => self.read_anon_fn(pos).map(Outcome::Form),
            '?' => {
                self.bump();
                self.read_conditional(pos)
            }
            '=' => {
                self.bump();
                let form = self.expect_form("read-eval", pos)?;
                self.host.eval_form(&form).map(Outcome::Form)
            }
            '!' => {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                Ok(Outcome::Nothing)
            }
            '#' => {
                self.bump();
                let token = self.read_token(pos)?;
                match token.as_str() {
                    "Inf" => Ok(Outcome::Form(Value::Float(f64::INFINITY))),
                    "-Inf" => Ok(Outcome::Form(Value::Float(f64::NEG_INFINITY))),
                    "NaN" => Ok(Outcome::Form(Value::Float(f64::NAN))),
                    other => Err(SableError::reader(
                        format!("unknown symbolic value ##{}", other),
                        pos,
                    )),
                }
            }
            c if is_token_char(c) => self.read_tagged(pos).map(Outcome::Form),
            other => Err(SableError::reader(
                format!("unsupported dispatch #{}", other),
                pos,
            )),
        }
    }

    fn read_regex(&mut self, open_pos: SourcePos) -> Result<Value, SableError> {
        let mut pattern = String::new();
        loop {
            let c = self
                .bump()
                .ok_or_else(|| SableError::reader("EOF while reading regex", open_pos))?;
            match c {
                '"' => break,
                '\\' => {
                    let next = self
                        .bump()
                        .ok_or_else(|| SableError::reader("EOF in regex escape", open_pos))?;
                    if next == '"' {
                        pattern.push('"');
                    } else {
                        pattern.push('\\');
                        pattern.push(next);
                    }
                }
                c => pattern.push(c),
            }
        }
        let rv = RegexVal::compile(&pattern)
            .map_err(|e| SableError::reader(e.message, open_pos))?;
        Ok(Value::Regex(Arc::new(rv)))
    }

    fn read_anon_fn(&mut self, pos: SourcePos) -> Result<Value, SableError> {
        if self.in_anon_fn {
            return Err(SableError::reader(
                "nested #() literals are not allowed",
                pos,
            ));
        }
        self.in_anon_fn = true;
        self.bump(); // '('
        let body = self.read_until(')', pos);
        self.in_anon_fn = false;
        let body = Value::List(Arc::new(PersistentList::from_values(body?)));

        // Scan for %, %N, %& and rewrite them to fresh parameter symbols
        let id = next_gensym_id();
        let mut max_arg = 0usize;
        let mut rest = false;
        scan_percents(&body, &mut max_arg, &mut rest)?;
        let param_sym =
            |n: usize| Value::Symbol(Arc::new(Symbol::simple(&format!("p{}__{}#", n, id))));
        let rest_sym = Value::Symbol(Arc::new(Symbol::simple(&format!("rest__{}#", id))));
        let rewritten = rewrite_percents(&body, &param_sym, &rest_sym);

        let mut params: Vec<Value> = (1..=max_arg).map(param_sym).collect();
        if rest {
            params.push(Value::symbol("&"));
            params.push(rest_sym);
        }
        Ok(Value::List(Arc::new(PersistentList::from_values(vec![
            Value::symbol("fn*"),
            Value::Vector(Arc::new(PersistentVector::from_values(params))),
            rewritten,
        ]))))
    }

    fn read_conditional(&mut self, pos: SourcePos) -> Result<Outcome, SableError> {
        let splicing = self.peek() == Some('@');
        if splicing {
            self.bump();
        }
        self.skip_trivia();
        if self.peek() != Some('(') {
            return Err(SableError::reader(
                "reader conditional body must be a list",
                pos,
            ));
        }
        self.bump();
        let items = self.read_until(')', pos)?;
        if items.len() % 2 != 0 {
            return Err(SableError::reader(
                "reader conditional requires an even number of forms",
                pos,
            ));
        }
        let features = self.host.features();
        let mut selected = None;
        for pair in items.chunks(2) {
            let feature = match &pair[0] {
                Value::Keyword(k) => k.clone(),
                other => {
                    return Err(SableError::reader(
                        format!("reader conditional feature must be a keyword, got {}", other.type_name()),
                        pos,
                    ));
                }
            };
            let is_default = feature.ns_str().is_none() && feature.name_str() == "default";
            if is_default || features.contains(&feature) {
                selected = Some(pair[1].clone());
                break;
            }
        }
        match selected {
            None => Ok(Outcome::Nothing),
            Some(form) if splicing => {
                let items = sable_core::seqs::collect(&form).map_err(|_| {
                    SableError::reader("#?@ requires a sequential form to splice", pos)
                })?;
                Ok(Outcome::Splice(items))
            }
            Some(form) => Ok(Outcome::Form(form)),
        }
    }

    fn read_tagged(&mut self, pos: SourcePos) -> Result<Value, SableError> {
        let token = self.read_token(pos)?;
        let tag = Symbol::parse(&token);
        let form = self.expect_form("tagged literal", pos)?;
        let ctor = self.host.tagged_reader(&tag).ok_or_else(|| {
            SableError::reader(format!("no reader function for tag {}", tag), pos)
        })?;
        vtable::call_value(&ctor, &[form])
    }

    // -- syntax quote --------------------------------------------------------

    fn syntax_quote(
        &mut self,
        form: &Value,
        gensyms: &mut HashMap<String, Value>,
        pos: SourcePos,
    ) -> Result<Value, SableError> {
        match form {
            Value::Symbol(sym) => {
                let name = sym.name_str();
                if sym.ns.is_none() && name.ends_with('#') && name.len() > 1 {
                    // sym# gensyms are stable within one template
                    let fresh = gensyms.entry(name.to_string()).or_insert_with(|| {
                        let base = &name[..name.len() - 1];
                        Value::Symbol(Arc::new(Symbol::simple(&format!(
                            "{}__{}__auto__",
                            base,
                            next_gensym_id()
                        ))))
                    });
                    Ok(self.wrap("quote", fresh.clone()))
                } else {
                    let qualified = self.host.qualify_symbol(sym);
                    Ok(self.wrap("quote", Value::Symbol(Arc::new(qualified))))
                }
            }
            Value::List(l) => {
                if let Some(inner) = unquote_payload(form, "unquote") {
                    return Ok(inner);
                }
                if unquote_payload(form, "unquote-splicing").is_some() {
                    return Err(SableError::reader("splice not inside a sequence", pos));
                }
                if l.is_empty() {
                    return Ok(self.call_core("list", vec![]));
                }
                let elements = self.sq_elements(l.iter(), gensyms, pos)?;
                Ok(self.call_core("seq", vec![self.call_core("concat", elements)]))
            }
            Value::Vector(v) => {
                let elements = self.sq_elements(v.iter(), gensyms, pos)?;
                Ok(self.call_core("vec", vec![self.call_core("concat", elements)]))
            }
            Value::ArrayMap(_) | Value::Map(_) => {
                let mut flat = Vec::new();
                for item in sable_core::seqs::collect(form)
                    .map_err(|e| SableError::reader(e.message, pos))?
                {
                    // Entries are [k v] vectors
                    if let Value::Vector(kv) = &item {
                        flat.push(kv.get(0).cloned().unwrap_or(Value::Nil));
                        flat.push(kv.get(1).cloned().unwrap_or(Value::Nil));
                    }
                }
                let elements = self.sq_elements(flat.iter(), gensyms, pos)?;
                Ok(self.call_core(
                    "apply",
                    vec![
                        Value::symbol("sable.core/hash-map"),
                        self.call_core("concat", elements),
                    ],
                ))
            }
            Value::Set(s) => {
                let members = s.to_vec();
                let elements = self.sq_elements(members.iter(), gensyms, pos)?;
                Ok(self.call_core("set", vec![self.call_core("concat", elements)]))
            }
            // Self-evaluating atoms pass through
            Value::Nil
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Char(_)
            | Value::Str(_)
            | Value::Keyword(_)
            | Value::Regex(_) => Ok(form.clone()),
            other => Ok(self.wrap("quote", other.clone())),
        }
    }

    /// Each element becomes a (list x) or a spliced expression, feeding concat
    fn sq_elements<'a>(
        &mut self,
        items: impl Iterator<Item = &'a Value>,
        gensyms: &mut HashMap<String, Value>,
        pos: SourcePos,
    ) -> Result<Vec<Value>, SableError> {
        let mut out = Vec::new();
        for item in items {
            if let Some(expr) = unquote_payload(item, "unquote-splicing") {
                out.push(expr);
            } else if let Some(expr) = unquote_payload(item, "unquote") {
                out.push(self.call_core("list", vec![expr]));
            } else {
                let quoted = self.syntax_quote(item, gensyms, pos)?;
                out.push(self.call_core("list", vec![quoted]));
            }
        }
        Ok(out)
    }

    fn call_core(&self, name: &str, args: Vec<Value>) -> Value {
        let mut items = vec![Value::symbol(&format!("sable.core/{}", name))];
        items.extend(args);
        Value::List(Arc::new(PersistentList::from_values(items)))
    }
}

/// Is `form` `(sable.core/<which> x)` (or unqualified `<which>`)? Returns x.
fn unquote_payload(form: &Value, which: &str) -> Option<Value> {
    let Value::List(l) = form else { return None };
    if l.len() != 2 {
        return None;
    }
    let Some(Value::Symbol(head)) = l.first() else {
        return None;
    };
    if head.name_str() == which
        && (head.ns_str().is_none() || head.ns_str() == Some("sable.core"))
    {
        l.iter().nth(1).cloned()
    } else {
        None
    }
}

fn merge_meta(existing: Option<Value>, new_meta: &Value) -> Value {
    let mut merged: Vec<(Value, Value)> = Vec::new();
    let mut push = |k: Value, v: Value| {
        match merged
            .iter()
            .position(|(mk, _)| sable_core::cmp::value_equals(mk, &k))
        {
            Some(idx) => merged[idx] = (k, v),
            None => merged.push((k, v)),
        }
    };
    if let Some(old) = existing {
        for item in sable_core::seqs::collect(&old).unwrap_or_default() {
            if let Value::Vector(kv) = &item {
                push(
                    kv.get(0).cloned().unwrap_or(Value::Nil),
                    kv.get(1).cloned().unwrap_or(Value::Nil),
                );
            }
        }
    }
    for item in sable_core::seqs::collect(new_meta).unwrap_or_default() {
        if let Value::Vector(kv) = &item {
            push(
                kv.get(0).cloned().unwrap_or(Value::Nil),
                kv.get(1).cloned().unwrap_or(Value::Nil),
            );
        }
    }
    Value::ArrayMap(Arc::new(ArrayMap::from_pairs(merged)))
}

fn is_token_char(c: char) -> bool {
    !c.is_whitespace()
        && !matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | '"' | ';' | ',' | '\\' | '@' | '^' | '`' | '~')
}

/// Find the highest %N (and %&) used in an anonymous fn body
fn scan_percents(form: &Value, max_arg: &mut usize, rest: &mut bool) -> Result<(), SableError> {
    match form {
        Value::Symbol(s) if s.ns.is_none() => {
            let name = s.name_str();
            if name == "%" || name == "%1" {
                *max_arg = (*max_arg).max(1);
            } else if name == "%&" {
                *rest = true;
            } else if let Some(n) = name.strip_prefix('%').and_then(|d| d.parse::<usize>().ok()) {
                if n == 0 || n > 20 {
                    return Err(SableError::compile(format!(
                        "invalid anonymous parameter %{}",
                        n
                    )));
                }
                *max_arg = (*max_arg).max(n);
            }
            Ok(())
        }
        Value::List(_) | Value::Vector(_) | Value::ArrayMap(_) | Value::Map(_) | Value::Set(_) => {
            for item in flatten_collection(form) {
                scan_percents(&item, max_arg, rest)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn rewrite_percents(
    form: &Value,
    param: &dyn Fn(usize) -> Value,
    rest_sym: &Value,
) -> Value {
    match form {
        Value::Symbol(s) if s.ns.is_none() => {
            let name = s.name_str();
            if name == "%" || name == "%1" {
                param(1)
            } else if name == "%&" {
                rest_sym.clone()
            } else if let Some(n) = name.strip_prefix('%').and_then(|d| d.parse::<usize>().ok()) {
                param(n)
            } else {
                form.clone()
            }
        }
        Value::List(l) => Value::List(Arc::new(PersistentList::from_values(
            l.iter().map(|i| rewrite_percents(i, param, rest_sym)).collect(),
        ))),
        Value::Vector(v) => Value::Vector(Arc::new(PersistentVector::from_values(
            v.iter().map(|i| rewrite_percents(i, param, rest_sym)).collect(),
        ))),
        Value::ArrayMap(m) => Value::ArrayMap(Arc::new(ArrayMap::from_pairs(
            m.iter()
                .map(|(k, v)| {
                    (
                        rewrite_percents(k, param, rest_sym),
                        rewrite_percents(v, param, rest_sym),
                    )
                })
                .collect(),
        ))),
        Value::Map(m) => Value::Map(Arc::new(HashTrieMap::from_pairs(
            m.iter()
                .map(|(k, v)| {
                    (
                        rewrite_percents(k, param, rest_sym),
                        rewrite_percents(v, param, rest_sym),
                    )
                })
                .collect(),
        ))),
        Value::Set(s) => Value::Set(Arc::new(PersistentSet::from_values(
            s.iter().map(|i| rewrite_percents(i, param, rest_sym)).collect(),
        ))),
        _ => form.clone(),
    }
}

fn flatten_collection(form: &Value) -> Vec<Value> {
    match form {
        Value::List(l) => l.iter().cloned().collect(),
        Value::Vector(v) => v.to_vec(),
        Value::Set(s) => s.to_vec(),
        Value::ArrayMap(m) => m
            .iter()
            .flat_map(|(k, v)| [k.clone(), v.clone()])
            .collect(),
        Value::Map(m) => m
            .iter()
            .flat_map(|(k, v)| [k.clone(), v.clone()])
            .collect(),
        _ => vec![],
    }
}

fn parse_number(token: &str, pos: SourcePos) -> Result<Value, SableError> {
    let bad = || SableError::reader(format!("invalid number '{}'", token), pos);
    let (sign, digits) = match token.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, token.strip_prefix('+').unwrap_or(token)),
    };

    // Ratio: a/b
    if let Some((num, den)) = digits.split_once('/') {
        let n: i64 = num.parse().map_err(|_| bad())?;
        let d: i64 = den.parse().map_err(|_| bad())?;
        if d == 0 {
            return Err(SableError::reader("divide by zero in ratio literal", pos));
        }
        return Ok(if n % d == 0 {
            Value::Int(sign * (n / d))
        } else {
            Value::Float(sign as f64 * n as f64 / d as f64)
        });
    }

    // Float
    if digits.contains('.')
        || ((digits.contains('e') || digits.contains('E')) && !digits.contains('r'))
        || digits.ends_with('M')
    {
        let body = digits.strip_suffix('M').unwrap_or(digits);
        let f: f64 = body.parse().map_err(|_| bad())?;
        return Ok(Value::Float(sign as f64 * f));
    }

    // Arbitrary-precision suffix is accepted, value kept in 64 bits
    let body = digits.strip_suffix('N').unwrap_or(digits);

    // Radix forms
    let parsed = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).map_err(|_| bad())?
    } else if let Some((radix, rest)) = body.split_once('r') {
        let radix: u32 = radix.parse().map_err(|_| bad())?;
        if !(2..=36).contains(&radix) {
            return Err(SableError::reader(
                format!("radix {} out of range [2, 36]", radix),
                pos,
            ));
        }
        i64::from_str_radix(rest, radix).map_err(|_| bad())?
    } else if body.len() > 1 && body.starts_with('0') && body.chars().all(|c| c.is_ascii_digit()) {
        i64::from_str_radix(&body[1..], 8).map_err(|_| bad())?
    } else {
        body.parse().map_err(|_| bad())?
    };
    Ok(Value::Int(sign * parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_core::printer::pr_str;

    fn read1(src: &str) -> Value {
        read_one(src, &NullReaderHost).unwrap().unwrap()
    }

    #[test]
    fn test_scalars() {
        assert!(matches!(read1("nil"), Value::Nil));
        assert!(matches!(read1("true"), Value::Bool(true)));
        assert!(matches!(read1("42"), Value::Int(42)));
        assert!(matches!(read1("-7"), Value::Int(-7)));
        assert!(matches!(read1("1.5"), Value::Float(_)));
        assert!(matches!(read1("0x10"), Value::Int(16)));
        assert!(matches!(read1("2r1010"), Value::Int(10)));
        assert!(matches!(read1("017"), Value::Int(15)));
        assert!(matches!(read1("10N"), Value::Int(10)));
        assert!(matches!(read1("\\a"), Value::Char('a')));
        assert!(matches!(read1("\\newline"), Value::Char('\n')));
        assert!(matches!(read1("\\u0041"), Value::Char('A')));
    }

    #[test]
    fn test_ratio_literals() {
        assert!(matches!(read1("6/3"), Value::Int(2)));
        match read1("1/2") {
            Value::Float(f) => assert!((f - 0.5).abs() < 1e-12),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_collections_round_trip() {
        assert_eq!(pr_str(&read1("(1 2 3)")), "(1 2 3)");
        assert_eq!(pr_str(&read1("[1 [2] 3]")), "[1 [2] 3]");
        assert_eq!(pr_str(&read1("{:a 1}")), "{:a 1}");
        let set = read1("#{1 2 1}");
        match &set {
            Value::Set(s) => assert_eq!(s.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_escapes() {
        match read1(r#""a\n\t\"A""#) {
            Value::Str(s) => assert_eq!(&*s, "a\n\t\"A"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_quote_deref_var() {
        assert_eq!(pr_str(&read1("'x")), "(quote x)");
        assert_eq!(pr_str(&read1("@x")), "(sable.core/deref x)");
        assert_eq!(pr_str(&read1("#'x")), "(var x)");
    }

    #[test]
    fn test_keywords() {
        assert_eq!(pr_str(&read1(":k")), ":k");
        assert_eq!(pr_str(&read1(":ns/k")), ":ns/k");
        assert_eq!(pr_str(&read1("::k")), ":user/k");
    }

    #[test]
    fn test_metadata_attachment() {
        let v = read1("^:private x");
        match v.meta() {
            Some(m) => {
                let collected = sable_core::seqs::collect(&m).unwrap();
                assert!(!collected.is_empty());
            }
            None => panic!("expected metadata"),
        }
        // ^sym becomes {:tag sym}
        let tagged = read1("^String s");
        let meta = tagged.meta().expect("tag metadata");
        assert!(pr_str(&meta).contains(":tag"));
    }

    #[test]
    fn test_discard_and_comments() {
        let forms = read_all("; comment\n#_(ignored) 42", &NullReaderHost).unwrap();
        assert_eq!(forms.len(), 1);
        assert!(matches!(forms[0], Value::Int(42)));
    }

    #[test]
    fn test_reader_conditional_selects_feature() {
        assert!(matches!(read1("#?(:sbl 1 :other 2)"), Value::Int(1)));
        assert!(matches!(read1("#?(:other 2 :default 3)"), Value::Int(3)));
        let none = read_all("#?(:other 2)", &NullReaderHost).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_reader_conditional_splicing() {
        let forms = read_all("[1 #?@(:sbl [2 3]) 4]", &NullReaderHost).unwrap();
        assert_eq!(pr_str(&forms[0]), "[1 2 3 4]");
    }

    #[test]
    fn test_anon_fn_literal() {
        let f = read1("#(+ % %2)");
        let text = pr_str(&f);
        assert!(text.starts_with("(fn* ["));
        assert!(text.contains('+'));
        // Nested literals are rejected
        assert!(read_one("#(#(inc %))", &NullReaderHost).is_err());
    }

    #[test]
    fn test_syntax_quote_qualifies_and_gensyms() {
        let f = read1("`(inc x#)");
        let text = pr_str(&f);
        assert!(text.contains("user/inc"), "got: {}", text);
        assert!(text.contains("__auto__"), "got: {}", text);

        // The same sym# resolves to the same gensym within one template
        let f2 = read1("`(let* [y# 1] y#)");
        let text2 = pr_str(&f2);
        let first = text2.find("y__").expect("gensym present");
        let second = text2.rfind("y__").expect("gensym present");
        let end1 = text2[first..].find(' ').map(|i| first + i).unwrap_or(text2.len());
        let tok1 = &text2[first..end1];
        assert!(text2[second..].starts_with(tok1) || first == second, "gensyms differ: {}", text2);
    }

    #[test]
    fn test_syntax_quote_unquote() {
        let f = read1("`(inc ~x)");
        let text = pr_str(&f);
        assert!(text.contains("(sable.core/list x)"), "got: {}", text);
        let spliced = read1("`(a ~@xs)");
        let text = pr_str(&spliced);
        assert!(text.contains("xs"), "got: {}", text);
    }

    #[test]
    fn test_unmatched_delimiters_error_with_position() {
        let err = read_one("(1 2", &NullReaderHost).unwrap_err();
        assert_eq!(err.kind, sable_core::error::ErrorKind::Reader);
        assert!(err.pos.is_some());
        assert!(read_one(")", &NullReaderHost).is_err());
        assert!(read_one("[1)", &NullReaderHost).is_err());
        assert!(read_one("\"abc", &NullReaderHost).is_err());
        assert!(read_one("{:a}", &NullReaderHost).is_err());
    }

    #[test]
    fn test_unknown_tagged_literal_errors() {
        let err = read_one("#inst \"2024\"", &NullReaderHost).unwrap_err();
        assert!(err.message.contains("no reader function"));
    }

    #[test]
    fn test_symbolic_floats() {
        assert!(matches!(read1("##Inf"), Value::Float(f) if f.is_infinite()));
        assert!(matches!(read1("##NaN"), Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_position_metadata_on_lists() {
        let forms = read_all("\n  (inc 1)", &NullReaderHost).unwrap();
        let meta = forms[0].meta().expect("position metadata");
        let line = sable_core::seqs::collect(&meta)
            .unwrap()
            .into_iter()
            .find_map(|kv| match &kv {
                Value::Vector(v) => match (v.get(0), v.get(1)) {
                    (Some(Value::Keyword(k)), Some(Value::Int(n))) if k.name_str() == "line" => {
                        Some(*n)
                    }
                    _ => None,
                },
                _ => None,
            });
        assert_eq!(line, Some(2));
    }
}
