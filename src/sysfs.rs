//! Plain sysfs file access shared by every component.
//!
//! All helpers take a fully resolved path; attribute-to-path resolution lives with the owner of
//! the attribute (device, monitor, KFD node). OS failures are kept as raw errnos so the caller
//! can collapse them through [`Status::from_errno`](crate::error::Status::from_errno).

use crate::error::{RsmiError, RsmiResult, Status};
use crate::utils::{is_number, parse_hex, trim_trailing_blank_lines};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

fn errno_err(path: &Path, errno: i32) -> RsmiError {
    RsmiError::sysfs(path, io::Error::from_raw_os_error(errno))
}

/// Fails unless `path` names a regular file.
fn ensure_regular(path: &Path) -> RsmiResult<()> {
    let meta = fs::metadata(path).map_err(|e| RsmiError::sysfs(path, e))?;
    if meta.is_file() {
        Ok(())
    } else {
        Err(errno_err(path, libc::EISDIR))
    }
}

/// Reads the whole file. An empty file is `Ok("")`, not an error.
///
/// # Errors
/// Returns the underlying OS error if the path is not a regular file or cannot be read.
pub fn read_all(path: &Path) -> RsmiResult<String> {
    ensure_regular(path)?;
    let content = fs::read_to_string(path).map_err(|e| RsmiError::sysfs(path, e))?;
    trace!(path = %path.display(), len = content.len(), "sysfs read");
    Ok(content)
}

/// First whitespace-separated token, or `""` for an empty file.
pub fn read_token(path: &Path) -> RsmiResult<String> {
    Ok(read_all(path)?
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string())
}

/// First line without its terminator.
pub fn read_line(path: &Path) -> RsmiResult<String> {
    Ok(read_all(path)?.lines().next().unwrap_or_default().to_string())
}

/// All lines, with trailing blank lines removed.
pub fn read_lines(path: &Path) -> RsmiResult<Vec<String>> {
    let mut lines: Vec<String> = read_all(path)?.lines().map(str::to_string).collect();
    trim_trailing_blank_lines(&mut lines);
    Ok(lines)
}

/// Reads at most `max_len` raw bytes.
pub fn read_binary(path: &Path, max_len: usize) -> RsmiResult<Vec<u8>> {
    ensure_regular(path)?;
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| RsmiError::sysfs(path, e))?;
    let mut buf = Vec::with_capacity(max_len);
    file.take(max_len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| RsmiError::sysfs(path, e))?;
    trace!(path = %path.display(), len = buf.len(), "sysfs binary read");
    Ok(buf)
}

/// Decimal `u64` from the first token. Empty content is `NoData`.
pub fn read_u64(path: &Path) -> RsmiResult<u64> {
    let token = read_token(path)?;
    if token.is_empty() {
        return Err(Status::NoData.into());
    }
    token
        .parse()
        .map_err(|_| RsmiError::parse(path, format!("expected an integer, found {token:?}")))
}

/// Hexadecimal `u64` from the first token, with or without `0x`.
pub fn read_hex_u64(path: &Path) -> RsmiResult<u64> {
    let token = read_token(path)?;
    if token.is_empty() {
        return Err(Status::NoData.into());
    }
    parse_hex(&token)
        .ok_or_else(|| RsmiError::parse(path, format!("expected a hex value, found {token:?}")))
}

/// Writes `value` to an existing regular file.
pub fn write_str(path: &Path, value: &str) -> RsmiResult<()> {
    ensure_regular(path)?;
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| RsmiError::sysfs(path, e))?;
    file.write_all(value.as_bytes())
        .map_err(|e| RsmiError::sysfs(path, e))?;
    trace!(path = %path.display(), value, "sysfs write");
    Ok(())
}

/// Parses a KFD-style `key value` properties file.
///
/// Lines whose value is not an unsigned integer are skipped. An empty file is `ENOENT`, matching
/// the driver's behaviour of leaving stale nodes with empty properties.
pub fn read_properties(path: &Path) -> RsmiResult<HashMap<String, u64>> {
    let content = read_all(path)?;
    let mut props = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(k), Some(v)) = (parts.next(), parts.next())
            && let Ok(val) = v.parse::<u64>()
        {
            props.insert(k.to_string(), val);
        }
    }
    if props.is_empty() {
        return Err(errno_err(path, libc::ENOENT));
    }
    Ok(props)
}

/// Numerically named entries of `dir`, sorted by number.
///
/// A missing directory yields an empty list.
pub fn numeric_entries(dir: &Path) -> Vec<(u32, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<(u32, PathBuf)> = entries
        .filter_map(std::result::Result::ok)
        .filter_map(|e| {
            let name = e.file_name();
            let name = name.to_str()?;
            if !is_number(name) {
                return None;
            }
            Some((name.parse().ok()?, e.path()))
        })
        .collect();
    found.sort_by_key(|(n, _)| *n);
    found
}

/// File names in `dir`. A missing directory yields an empty list.
pub fn list_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use tempfile::TempDir;

    #[test]
    fn empty_file_is_not_an_open_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, "").unwrap();

        assert_eq!(read_token(&path).unwrap(), "");
        assert!(read_lines(&path).unwrap().is_empty());
        assert_eq!(read_u64(&path).unwrap_err().status(), Status::NoData);

        let missing = dir.path().join("missing");
        assert_eq!(read_token(&missing).unwrap_err().status(), Status::NotSupported);
    }

    #[test]
    fn directories_are_file_errors() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_all(dir.path()).unwrap_err().status(), Status::FileError);
        assert_eq!(
            write_str(dir.path(), "1").unwrap_err().status(),
            Status::FileError
        );
    }

    #[test]
    fn typed_reads() {
        let dir = TempDir::new().unwrap();
        let dec = dir.path().join("dec");
        let hex = dir.path().join("hex");
        let junk = dir.path().join("junk");
        fs::write(&dec, "42\n").unwrap();
        fs::write(&hex, "0x1002\n").unwrap();
        fs::write(&junk, "abc\n").unwrap();

        assert_eq!(read_u64(&dec).unwrap(), 42);
        assert_eq!(read_hex_u64(&hex).unwrap(), 0x1002);
        assert_eq!(read_u64(&junk).unwrap_err().status(), Status::UnexpectedData);
    }

    #[test]
    fn multi_line_reads_trim_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pp_dpm_sclk");
        fs::write(&path, "0: 500Mhz\n1: 800Mhz *\n\n\n").unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec!["0: 500Mhz", "1: 800Mhz *"]);
        assert_eq!(read_line(&path).unwrap(), "0: 500Mhz");
    }

    #[test]
    fn properties_and_entries() {
        let dir = TempDir::new().unwrap();
        let props = dir.path().join("properties");
        fs::write(&props, "location_id 6656\ndomain 0\nname gfx900\n").unwrap();
        let map = read_properties(&props).unwrap();
        assert_eq!(map.get("location_id"), Some(&6656));
        assert!(!map.contains_key("name"));

        let empty = dir.path().join("empty_props");
        fs::write(&empty, "").unwrap();
        assert_eq!(read_properties(&empty).unwrap_err().status(), Status::NotSupported);

        for n in ["10", "2", "x"] {
            fs::create_dir(dir.path().join(n)).unwrap();
        }
        let ids: Vec<u32> = numeric_entries(dir.path()).into_iter().map(|(n, _)| n).collect();
        assert_eq!(ids, vec![2, 10]);
    }

    #[test]
    fn write_then_binary_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, "").unwrap();
        write_str(&path, "manual").unwrap();
        assert_eq!(read_binary(&path, 3).unwrap(), b"man");
    }
}
