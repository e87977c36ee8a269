//! Unit-separated line format used by WAL files and the checkpoint.
//!
//! One record per line, fields joined by U+001F. Empty fields are absent
//! values. Separator and line-break characters inside values are replaced by
//! spaces on write, so every line parses back to the same number of fields.

use chrono::{DateTime, SecondsFormat, Utc};

use super::record::Record;
use crate::error::{ProspectorError, Result};

pub const UNIT_SEPARATOR: char = '\x1f';

/// Column order. `content_hash` is written for downstream consumers and
/// recomputed on read.
pub const COLUMNS: [&str; 12] = [
    "place_id",
    "name",
    "address",
    "latitude",
    "longitude",
    "phone",
    "website",
    "domain",
    "keyword",
    "content_hash",
    "created_at",
    "updated_at",
];

fn clean(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            '\x1f' | '\x1e' | '\n' | '\r' => ' ',
            other => other,
        })
        .collect()
}

fn text(value: &Option<String>) -> String {
    value.as_deref().map(clean).unwrap_or_default()
}

fn number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Encode one record as a line without the trailing newline.
pub fn encode(record: &Record) -> String {
    let fields = [
        text(&record.place_id),
        text(&record.name),
        text(&record.address),
        number(record.latitude),
        number(record.longitude),
        text(&record.phone),
        text(&record.website),
        text(&record.domain),
        text(&record.keyword),
        record.content_hash(),
        timestamp(&record.created_at),
        timestamp(&record.updated_at),
    ];
    fields.join(&UNIT_SEPARATOR.to_string())
}

/// Decode one line. Trailing `\r` is tolerated.
pub fn decode(line: &str) -> Result<Record> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let fields: Vec<&str> = line.split(UNIT_SEPARATOR).collect();
    if fields.len() != COLUMNS.len() {
        return Err(ProspectorError::CorruptRecord(format!(
            "expected {} fields, found {}",
            COLUMNS.len(),
            fields.len()
        )));
    }

    let opt = |idx: usize| -> Option<String> {
        let value = fields[idx];
        (!value.is_empty()).then(|| value.to_string())
    };
    let float = |idx: usize| -> Result<Option<f64>> {
        let value = fields[idx];
        if value.is_empty() {
            return Ok(None);
        }
        value.parse().map(Some).map_err(|_| {
            ProspectorError::CorruptRecord(format!(
                "{} is not a number: {value}",
                COLUMNS[idx]
            ))
        })
    };
    let time = |idx: usize| -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(fields[idx])
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| {
                ProspectorError::CorruptRecord(format!(
                    "{} is not a timestamp: {err}",
                    COLUMNS[idx]
                ))
            })
    };

    Ok(Record {
        place_id: opt(0),
        name: opt(1),
        address: opt(2),
        latitude: float(3)?,
        longitude: float(4)?,
        phone: opt(5),
        website: opt(6),
        domain: opt(7),
        keyword: opt(8),
        created_at: time(10)?,
        updated_at: time(11)?,
    })
}

/// Parse a whole file. Unparseable lines are returned separately so callers
/// can count them without losing the rest.
pub fn decode_lines(body: &str) -> (Vec<Record>, Vec<(usize, ProspectorError)>) {
    let mut records = Vec::new();
    let mut corrupt = Vec::new();
    for (idx, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match decode(line) {
            Ok(record) => records.push(record),
            Err(err) => corrupt.push((idx + 1, err)),
        }
    }
    (records, corrupt)
}
