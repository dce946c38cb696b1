#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

use crate::error::{RsmiError, RsmiResult};

// ===============================================================================================
// IOCTL encoding
// ===============================================================================================

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_NONE: u32 = 0;
const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn io(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_NONE, type_, nr, 0)
}

#[must_use]
pub const fn ior<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

// ===============================================================================================
// Text parsing
// ===============================================================================================

/// One row of a `pp_dpm_*` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyLevel {
    pub frequency: u64,
    pub is_current: bool,
    /// Link width, only present in `pp_dpm_pcie` rows (`x16`).
    pub lanes: Option<u32>,
}

/// Scale factor selected by the first character of a unit suffix.
#[must_use]
pub const fn unit_multiplier(unit: char) -> Option<u64> {
    match unit {
        'G' => Some(1_000_000_000),
        'M' => Some(1_000_000),
        // mV is the base unit for voltage.
        'K' | 'V' => Some(1_000),
        'T' | 'H' | 'm' => Some(1),
        _ => None,
    }
}

/// Parses `"<idx>: <value><unit> [*|xN]"`, e.g. `"1:       1837Mhz *"`.
///
/// # Errors
/// Returns a parse error when the index separator, the numeric value or a known unit is missing.
pub fn parse_frequency_line(line: &str) -> RsmiResult<FrequencyLevel> {
    let malformed = |detail: &str| RsmiError::parse("frequency table", format!("{detail}: {line:?}"));

    let (_, rest) = line.split_once(':').ok_or_else(|| malformed("missing index"))?;
    let mut tokens = rest.split_whitespace();
    let value_token = tokens.next().ok_or_else(|| malformed("missing value"))?;

    let split = value_token
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value_token.len());
    let (number, unit) = value_token.split_at(split);
    let unit = if unit.is_empty() {
        tokens.next().ok_or_else(|| malformed("missing unit"))?
    } else {
        unit
    };

    let value: f64 = number.parse().map_err(|_| malformed("bad value"))?;
    let multiplier = unit
        .chars()
        .next()
        .and_then(unit_multiplier)
        .ok_or_else(|| malformed("unexpected unit"))?;

    let lanes = tokens
        .find_map(|t| t.strip_prefix('x'))
        .and_then(|n| n.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok());

    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    let frequency = (value * multiplier as f64).round() as u64;

    Ok(FrequencyLevel {
        frequency,
        is_current: line.contains('*'),
        lanes,
    })
}

/// Drops blank lines from the tail of a multi-line sysfs read.
pub fn trim_trailing_blank_lines(lines: &mut Vec<String>) {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
}

#[must_use]
pub fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parses a sysfs hex value with or without a `0x` prefix.
#[must_use]
pub fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

/// Formats a BDF identifier as `DDDD:BB:DD.F`.
#[must_use]
pub fn bdf_string(bdf: u64) -> String {
    format!(
        "{:04x}:{:02x}:{:02x}.{:x}",
        bdf >> 32,
        (bdf >> 8) & 0xFF,
        (bdf >> 3) & 0x1F,
        bdf & 0x7
    )
}

/// Reads the numeric suffix of names like `card3` or `renderD128`.
#[must_use]
pub fn numeric_suffix(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)
        .filter(|s| is_number(s))
        .and_then(|s| s.parse().ok())
}

/// Effective uid of the calling process.
#[must_use]
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}
