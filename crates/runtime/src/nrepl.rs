//! nREPL server: bencode-framed eval over TCP
//!
//! Speaks enough of the wire protocol for standard clients: `clone`,
//! `describe`, `eval`, and `close`. Sessions share the runtime environment;
//! each connection runs on its own OS thread.

use crate::runtime;
use sable_core::error::SableError;
use std::collections::BTreeMap;
use std::io::{BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// A bencode value: the protocol needs integers, strings, lists, and dicts
#[derive(Debug, Clone, PartialEq)]
pub enum Bencode {
    Int(i64),
    Str(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<String, Bencode>),
}

impl Bencode {
    pub fn str(s: &str) -> Bencode {
        Bencode::Str(s.as_bytes().to_vec())
    }

    pub fn as_str(&self) -> Option<String> {
        match self {
            Bencode::Str(bytes) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(n) => {
                out.extend_from_slice(format!("i{}e", n).as_bytes());
            }
            Bencode::Str(bytes) => {
                out.extend_from_slice(format!("{}:", bytes.len()).as_bytes());
                out.extend_from_slice(bytes);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(entries) => {
                out.push(b'd');
                for (k, v) in entries {
                    Bencode::str(k).encode(out);
                    v.encode(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn decode(reader: &mut impl Read) -> std::io::Result<Bencode> {
        let mut first = [0u8; 1];
        reader.read_exact(&mut first)?;
        Self::decode_tagged(first[0], reader)
    }

    fn decode_tagged(tag: u8, reader: &mut impl Read) -> std::io::Result<Bencode> {
        match tag {
            b'i' => {
                let digits = read_until(reader, b'e')?;
                let n = parse_ascii_i64(&digits)?;
                Ok(Bencode::Int(n))
            }
            b'l' => {
                let mut items = Vec::new();
                loop {
                    let mut next = [0u8; 1];
                    reader.read_exact(&mut next)?;
                    if next[0] == b'e' {
                        return Ok(Bencode::List(items));
                    }
                    items.push(Self::decode_tagged(next[0], reader)?);
                }
            }
            b'd' => {
                let mut entries = BTreeMap::new();
                loop {
                    let mut next = [0u8; 1];
                    reader.read_exact(&mut next)?;
                    if next[0] == b'e' {
                        return Ok(Bencode::Dict(entries));
                    }
                    let key = Self::decode_tagged(next[0], reader)?;
                    let key = key.as_str().ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "bencode dict key must be a string",
                        )
                    })?;
                    let value = Bencode::decode(reader)?;
                    entries.insert(key, value);
                }
            }
            digit if digit.is_ascii_digit() => {
                let mut digits = vec![digit];
                digits.extend(read_until(reader, b':')?);
                let len = parse_ascii_i64(&digits)? as usize;
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                Ok(Bencode::Str(bytes))
            }
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected bencode tag {:#x}", other),
            )),
        }
    }
}

fn read_until(reader: &mut impl Read, stop: u8) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == stop {
            return Ok(out);
        }
        out.push(byte[0]);
    }
}

fn parse_ascii_i64(digits: &[u8]) -> std::io::Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad bencode integer"))
}

/// Serve forever on the given port (0 picks one); returns the bound port
/// through the callback before blocking
pub fn serve(port: u16, on_bound: impl FnOnce(u16)) -> Result<(), SableError> {
    runtime::init();
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    let bound = listener.local_addr()?.port();
    info!(port = bound, "nREPL server listening");
    on_bound(bound);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream) {
                        warn!(error = %e, "nREPL connection ended with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

fn handle_connection(stream: TcpStream) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    info!(%peer, "nREPL client connected");
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    loop {
        let message = match Bencode::decode(&mut reader) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let Bencode::Dict(request) = message else {
            continue;
        };
        let op = request
            .get("op")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let id = request.get("id").cloned();
        let session = request
            .get("session")
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| "none".to_string());

        let mut responses: Vec<BTreeMap<String, Bencode>> = Vec::new();
        match op.as_str() {
            "clone" => {
                let new_session = uuid::Uuid::new_v4().to_string();
                info!(session = %new_session, "session cloned");
                let mut r = BTreeMap::new();
                r.insert("new-session".to_string(), Bencode::str(&new_session));
                r.insert(
                    "status".to_string(),
                    Bencode::List(vec![Bencode::str("done")]),
                );
                responses.push(r);
            }
            "describe" => {
                let mut ops = BTreeMap::new();
                for name in ["clone", "describe", "eval", "close"] {
                    ops.insert(name.to_string(), Bencode::Dict(BTreeMap::new()));
                }
                let mut versions = BTreeMap::new();
                versions.insert(
                    "sable".to_string(),
                    Bencode::str(env!("CARGO_PKG_VERSION")),
                );
                let mut r = BTreeMap::new();
                r.insert("ops".to_string(), Bencode::Dict(ops));
                r.insert("versions".to_string(), Bencode::Dict(versions));
                r.insert(
                    "status".to_string(),
                    Bencode::List(vec![Bencode::str("done")]),
                );
                responses.push(r);
            }
            "eval" => {
                let code = request
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                match runtime::eval_str(&code) {
                    Ok(value) => {
                        let mut r = BTreeMap::new();
                        r.insert(
                            "value".to_string(),
                            Bencode::str(&sable_core::printer::pr_str(&value)),
                        );
                        r.insert(
                            "ns".to_string(),
                            Bencode::str(&crate::env::global().current_ns_name()),
                        );
                        responses.push(r);
                        let mut done = BTreeMap::new();
                        done.insert(
                            "status".to_string(),
                            Bencode::List(vec![Bencode::str("done")]),
                        );
                        responses.push(done);
                    }
                    Err(e) => {
                        let mut r = BTreeMap::new();
                        r.insert("err".to_string(), Bencode::str(&format!("{}\n", e)));
                        r.insert("ex".to_string(), Bencode::str(e.kind.class_name()));
                        r.insert(
                            "status".to_string(),
                            Bencode::List(vec![
                                Bencode::str("eval-error"),
                                Bencode::str("done"),
                            ]),
                        );
                        responses.push(r);
                    }
                }
            }
            "close" => {
                let mut r = BTreeMap::new();
                r.insert(
                    "status".to_string(),
                    Bencode::List(vec![
                        Bencode::str("session-closed"),
                        Bencode::str("done"),
                    ]),
                );
                responses.push(r);
            }
            other => {
                let mut r = BTreeMap::new();
                r.insert("op".to_string(), Bencode::str(other));
                r.insert(
                    "status".to_string(),
                    Bencode::List(vec![
                        Bencode::str("unknown-op"),
                        Bencode::str("done"),
                    ]),
                );
                responses.push(r);
            }
        }

        for mut response in responses {
            if let Some(id) = &id {
                response.insert("id".to_string(), id.clone());
            }
            response.insert("session".to_string(), Bencode::str(&session));
            let mut bytes = Vec::new();
            Bencode::Dict(response).encode(&mut bytes);
            writer.write_all(&bytes)?;
            writer.flush()?;
        }
        if op == "close" {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: &Bencode) -> Bencode {
        let mut bytes = Vec::new();
        v.encode(&mut bytes);
        Bencode::decode(&mut bytes.as_slice()).unwrap()
    }

    #[test]
    fn test_bencode_round_trips() {
        assert_eq!(round_trip(&Bencode::Int(-42)), Bencode::Int(-42));
        assert_eq!(round_trip(&Bencode::str("hello")), Bencode::str("hello"));
        let list = Bencode::List(vec![Bencode::Int(1), Bencode::str("x")]);
        assert_eq!(round_trip(&list), list);
        let mut dict = BTreeMap::new();
        dict.insert("op".to_string(), Bencode::str("eval"));
        dict.insert("id".to_string(), Bencode::Int(7));
        let dict = Bencode::Dict(dict);
        assert_eq!(round_trip(&dict), dict);
    }

    #[test]
    fn test_bencode_wire_format() {
        let mut bytes = Vec::new();
        Bencode::str("eval").encode(&mut bytes);
        assert_eq!(bytes, b"4:eval");
        let mut bytes = Vec::new();
        Bencode::Int(12).encode(&mut bytes);
        assert_eq!(bytes, b"i12e");
    }
}
