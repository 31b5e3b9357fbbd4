//! Environment lookup helpers
//!
//! 모든 파서는 `lookup` 함수를 받아서 테스트에서 실제 환경변수를 건드리지 않는다.

use crate::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Read a variable, treating empty / whitespace-only values as unset
pub(crate) fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn string_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, key).unwrap_or_else(|| default.to_string())
}

pub(crate) fn path<F>(lookup: &F, key: &str) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, key).map(PathBuf::from)
}

pub(crate) fn parsed_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| Error::Config(format!("{}={:?} is invalid: {}", key, raw, e))),
        None => Ok(default),
    }
}

pub(crate) fn bool_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match optional(lookup, key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!(
                "{}={:?} is invalid: expected true/false",
                key, raw
            ))),
        },
        None => Ok(default),
    }
}

/// Parse a docker-style memory size (`512m`, `4g`, `1048576`) into bytes
pub fn parse_memory(raw: &str) -> Option<i64> {
    let raw = raw.trim().to_ascii_lowercase();
    let raw = raw.strip_suffix('b').unwrap_or(&raw);
    let (digits, multiplier) = match raw.chars().last()? {
        'k' => (&raw[..raw.len() - 1], 1024_i64),
        'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (raw, 1),
        _ => return None,
    };
    let value: f64 = digits.trim().parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as i64)
}

pub(crate) fn memory_or<F>(lookup: &F, key: &str, default: &str) -> Result<Option<i64>>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = string_or(lookup, key, default);
    if raw.eq_ignore_ascii_case("none") || raw == "0" {
        return Ok(None);
    }
    parse_memory(&raw)
        .map(Some)
        .ok_or_else(|| Error::Config(format!("{}={:?} is not a memory size", key, raw)))
}
