use std::fmt::Write;
use std::path::Path;

use crate::classad::{AdValue, ClassAd};
use crate::common::error::CoreError;
use crate::common::fsutils::atomic_write;

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(value: &str) -> crate::Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                return Err(CoreError::invalid_input(format!(
                    "Unknown escape sequence \\{other}"
                )));
            }
            None => return Err(CoreError::invalid_input("Dangling escape at end of value")),
        }
    }
    Ok(out)
}

fn render_value(value: &AdValue) -> String {
    match value {
        AdValue::Bool(true) => "true".to_string(),
        AdValue::Bool(false) => "false".to_string(),
        AdValue::Int(v) => v.to_string(),
        AdValue::Float(v) => format!("{v:?}"),
        AdValue::String(v) => format!("\"{}\"", escape(v)),
    }
}

fn parse_value(raw: &str) -> crate::Result<AdValue> {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Ok(AdValue::String(unescape(&raw[1..raw.len() - 1])?));
    }
    if raw.eq_ignore_ascii_case("true") {
        return Ok(AdValue::Bool(true));
    }
    if raw.eq_ignore_ascii_case("false") {
        return Ok(AdValue::Bool(false));
    }
    if let Ok(value) = raw.parse::<i64>() {
        return Ok(AdValue::Int(value));
    }
    if let Ok(value) = raw.parse::<f64>() {
        return Ok(AdValue::Float(value));
    }
    Ok(AdValue::String(raw.to_string()))
}

pub fn render_ad(ad: &ClassAd) -> String {
    let mut out = String::new();
    for (name, value) in ad.iter() {
        let _ = writeln!(out, "{name} = {}", render_value(value));
    }
    out
}

/// Renders several ads into one multi-ad text; records are separated by a blank line.
pub fn render_ads(ads: &[ClassAd]) -> String {
    ads.iter().map(render_ad).collect::<Vec<_>>().join("\n")
}

/// Parses blank-line separated records without requiring any particular attribute.
pub fn parse_records(text: &str) -> crate::Result<Vec<ClassAd>> {
    let mut records = Vec::new();
    let mut current: Option<ClassAd> = None;
    for (line_nr, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            records.extend(current.take());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            return Err(CoreError::invalid_input(format!(
                "Line {}: expected `Name = Value`, got `{line}`",
                line_nr + 1
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::invalid_input(format!(
                "Line {}: empty attribute name",
                line_nr + 1
            )));
        }
        current
            .get_or_insert_with(ClassAd::default)
            .insert(name, parse_value(value)?);
    }
    records.extend(current.take());
    Ok(records)
}

/// Parses advertisements; every record has to carry a `Name`.
pub fn parse_ads(text: &str) -> crate::Result<Vec<ClassAd>> {
    let ads = parse_records(text)?;
    if ads.iter().any(|ad| ad.name().is_none()) {
        return Err(CoreError::invalid_input("ClassAd without Name attribute"));
    }
    Ok(ads)
}

/// Writes ads into a single file that is replaced atomically.
pub fn write_multi_ad_file(path: &Path, ads: &[ClassAd]) -> crate::Result<()> {
    atomic_write(path, render_ads(ads).as_bytes(), 0o644, false)
}
