//! Single-binary build artifacts
//!
//! A built program is the host interpreter binary with the program source
//! appended, followed by a fixed-size footer: an 8-byte little-endian
//! source length and an 8-byte magic number. At startup the runtime checks
//! its own trailing bytes; when the magic is present it executes the
//! embedded source and CLI parsing is bypassed entirely.

use sable_core::error::SableError;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const MAGIC: &[u8; 8] = b"SBLPACK1";
const FOOTER_LEN: u64 = 16;

/// Append `source` to the running interpreter binary, writing `output`
pub fn build(source_path: &Path, output_path: &Path) -> Result<(), SableError> {
    let source = fs::read_to_string(source_path)
        .map_err(|e| SableError::io(format!("failed to read {}: {}", source_path.display(), e)))?;
    let host = std::env::current_exe()
        .map_err(|e| SableError::io(format!("failed to locate interpreter binary: {}", e)))?;
    let mut bytes = fs::read(&host)
        .map_err(|e| SableError::io(format!("failed to read {}: {}", host.display(), e)))?;

    // Building from an already-packed binary would nest trailers
    if extract_from_bytes(&bytes).is_some() {
        return Err(SableError::value_err(
            "this binary already carries embedded source",
        ));
    }

    bytes.extend_from_slice(source.as_bytes());
    bytes.extend_from_slice(&(source.len() as u64).to_le_bytes());
    bytes.extend_from_slice(MAGIC);

    let mut file = fs::File::create(output_path)
        .map_err(|e| SableError::io(format!("failed to create {}: {}", output_path.display(), e)))?;
    file.write_all(&bytes)?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(output_path, fs::Permissions::from_mode(0o755));
    }
    Ok(())
}

/// The embedded source of the currently running binary, if any
pub fn embedded_source() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let bytes = fs::read(exe).ok()?;
    extract_from_bytes(&bytes)
}

fn extract_from_bytes(bytes: &[u8]) -> Option<String> {
    if (bytes.len() as u64) < FOOTER_LEN {
        return None;
    }
    let magic_at = bytes.len() - 8;
    if &bytes[magic_at..] != MAGIC {
        return None;
    }
    let len_at = magic_at - 8;
    let len = u64::from_le_bytes(bytes[len_at..magic_at].try_into().ok()?) as usize;
    if len > len_at {
        return None;
    }
    let start = len_at - len;
    String::from_utf8(bytes[start..len_at].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(host: &[u8], source: &str) -> Vec<u8> {
        let mut bytes = host.to_vec();
        bytes.extend_from_slice(source.as_bytes());
        bytes.extend_from_slice(&(source.len() as u64).to_le_bytes());
        bytes.extend_from_slice(MAGIC);
        bytes
    }

    #[test]
    fn test_extract_round_trip() {
        let packed = pack(b"BINARY BYTES", "(println :hi)");
        assert_eq!(
            extract_from_bytes(&packed).as_deref(),
            Some("(println :hi)")
        );
    }

    #[test]
    fn test_absent_trailer_is_none() {
        assert!(extract_from_bytes(b"no trailer here").is_none());
        assert!(extract_from_bytes(b"short").is_none());
    }

    #[test]
    fn test_corrupt_length_is_none() {
        let mut packed = pack(b"HOST", "(+ 1 2)");
        // Overwrite the length field with nonsense
        let at = packed.len() - 16;
        packed[at..at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(extract_from_bytes(&packed).is_none());
    }
}
