//! Line-protocol serialisation and identifier escaping.
//!
//! `measurement[,tag=v,...] field=v[,field=v,...] timestamp`. Tags are
//! emitted sorted by key (stable, reproducible batches); fields preserve
//! the row's insertion order. At least one field is mandatory — a
//! fieldless row is dropped with a recorded warning rather than synthesised.

use crate::model::{FieldValue, Row};

/// An identifier matching `[A-Za-z_][A-Za-z0-9_]*` is emitted verbatim;
/// anything else is wrapped in double quotes.
pub fn escape_identifier(s: &str) -> String {
    let mut chars = s.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        s.to_string()
    } else {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Space, comma, and equals are backslash-escaped in tag/measurement text
/// per the dialect standard.
fn escape_tag_text(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(' ', "\\ ")
        .replace(',', "\\,")
        .replace('=', "\\=")
}

fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\").replace(' ', "\\ ").replace(',', "\\,")
}

fn escape_field_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn format_field_value(v: &FieldValue) -> String {
    match v {
        FieldValue::Float(f) => format!("{}", f),
        FieldValue::Int(i) => format!("{}i", i),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Str(s) => format!("'{}'", escape_field_string(s)),
    }
}

/// Serialise one row to a single line-protocol line. Returns `None` (with
/// the caller expected to log a warning) if the row carries no fields.
pub fn encode_row(measurement: &str, row: &Row) -> Option<String> {
    if row.fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(measurement);

    for (k, v) in &row.tags {
        line.push(',');
        line.push_str(&escape_tag_text(k));
        line.push('=');
        line.push_str(&escape_tag_text(v));
    }

    line.push(' ');
    let mut first = true;
    for (k, v) in &row.fields {
        if !first {
            line.push(',');
        }
        first = false;
        line.push_str(&escape_tag_text(k));
        line.push('=');
        line.push_str(&format_field_value(v));
    }

    line.push(' ');
    line.push_str(&row.time.timestamp_nanos_opt().unwrap_or(0).to_string());

    Some(line)
}

/// Encode a batch of rows, dropping (and counting) any fieldless rows.
pub fn encode_batch(measurement: &str, rows: &[Row]) -> (Vec<String>, usize) {
    let mut lines = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    for row in rows {
        match encode_row(measurement, row) {
            Some(line) => lines.push(line),
            None => dropped += 1,
        }
    }
    (lines, dropped)
}

/// The write path batches at 1,000 lines per HTTP request to bound request
/// size.
pub const WRITE_BATCH_SIZE: usize = 1000;

pub fn batch_lines(lines: &[String]) -> impl Iterator<Item = &[String]> {
    lines.chunks(WRITE_BATCH_SIZE)
}
