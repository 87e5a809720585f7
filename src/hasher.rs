use sha2::{Digest, Sha256};

/// Stand-in for a missing or blank field, both when hashing and when storing a posting.
pub const ABSENT_FIELD: &str = "unknown";

const FIELD_SEPARATOR: char = '|';

/// Length of the fingerprint prefix used in folder names and log lines.
pub const SHORT_LEN: usize = 8;

fn normalize(field: Option<&str>) -> String {
    match field.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_lowercase(),
        _ => ABSENT_FIELD.to_string(),
    }
}

/// SHA-256 fingerprint of a posting, hex encoded.
///
/// Each field is trimmed and lower-cased before hashing, so casing and surrounding whitespace
/// never split one posting into two records. Absent and blank fields hash as [`ABSENT_FIELD`], the
/// same text the posting is stored with, so a fingerprint recomputed from a saved record matches.
pub fn fingerprint(company: Option<&str>, title: Option<&str>, description: Option<&str>) -> String {
    let data = format!(
        "{}{sep}{}{sep}{}",
        normalize(company),
        normalize(title),
        normalize(description),
        sep = FIELD_SEPARATOR
    );

    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn short(fingerprint: &str) -> &str {
    fingerprint.get(..SHORT_LEN).unwrap_or(fingerprint)
}
