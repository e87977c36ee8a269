use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A discovered business listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub place_id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub domain: Option<String>,
    /// Search phrase that surfaced the listing.
    pub keyword: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Empty listing observed at `at`.
    pub fn observed(place_id: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            place_id,
            name: None,
            address: None,
            latitude: None,
            longitude: None,
            phone: None,
            website: None,
            domain: None,
            keyword: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    /// SHA-256 over the normalised name and address.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize(self.name.as_deref()).as_bytes());
        hasher.update([0x1f]);
        hasher.update(normalize(self.address.as_deref()).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn key(&self) -> RecordKey {
        match self.place_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => RecordKey::Place(id.to_string()),
            _ => RecordKey::Content(self.content_hash()),
        }
    }

    /// Missing either the name or the address.
    pub fn is_hollow(&self) -> bool {
        !has_text(&self.name) || !has_text(&self.address)
    }

    fn identity_rank(&self) -> u8 {
        u8::from(has_text(&self.name)) + u8::from(has_text(&self.address))
    }

    /// Orders two entries for the same key: more complete wins, then the
    /// newer `updated_at`. Callers break remaining ties on the encoded line.
    pub fn completeness_cmp(&self, other: &Record) -> Ordering {
        self.identity_rank()
            .cmp(&other.identity_rank())
            .then_with(|| self.updated_at.cmp(&other.updated_at))
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn normalize(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .split(|ch: char| ch.is_whitespace() || ch.is_control())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Deduplication key of a record: its place id, or a content hash when the
/// source did not supply one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Place(String),
    Content(String),
}

impl RecordKey {
    /// WAL shard: the sixth character of the key when alphanumeric, `_`
    /// otherwise. Keys shorter than six characters use their last character.
    pub fn shard(&self) -> char {
        let key = self.to_string();
        let chars: Vec<char> = key.chars().collect();
        let candidate = chars.get(5).or_else(|| chars.last()).copied();
        match candidate {
            Some(ch) if ch.is_ascii_alphanumeric() => ch,
            _ => '_',
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Place(id) => f.write_str(id),
            RecordKey::Content(hash) => write!(f, "hash:{hash}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn missing_place_id_falls_back_to_content_hash() {
        let now = Utc::now();
        let a = Record::observed(None, now)
            .with_name("Joe's  Towing")
            .with_address("1 Main St");
        let b = Record::observed(Some("  ".into()), now)
            .with_name("joe's towing")
            .with_address("1 main st");
        assert_eq!(a.key(), b.key());
        assert!(a.key().to_string().starts_with("hash:"));

        let placed = Record::observed(Some("ChIJabcdef".into()), now);
        assert_eq!(placed.key(), RecordKey::Place("ChIJabcdef".into()));
    }

    #[test]
    fn shard_uses_sixth_character() {
        assert_eq!(RecordKey::Place("ChIJabcdef".into()).shard(), 'b');
        assert_eq!(RecordKey::Place("ChIJa-cdef".into()).shard(), '_');
        assert_eq!(RecordKey::Place("abc".into()).shard(), 'c');
        assert_eq!(RecordKey::Place("ab-".into()).shard(), '_');
        // "hash:" occupies the first five characters.
        let content = RecordKey::Content("9f00".into());
        assert_eq!(content.shard(), '9');
    }

    #[test]
    fn complete_entries_beat_newer_hollow_ones() {
        let now = Utc::now();
        let full = Record::observed(Some("p1".into()), now)
            .with_name("Acme")
            .with_address("2 Elm");
        let mut hollow = Record::observed(Some("p1".into()), now + Duration::hours(1));
        hollow.name = Some("Acme".into());
        assert!(hollow.is_hollow());
        assert_eq!(full.completeness_cmp(&hollow), Ordering::Greater);

        let mut newer = full.clone();
        newer.updated_at = now + Duration::hours(2);
        assert_eq!(newer.completeness_cmp(&full), Ordering::Greater);
    }
}
