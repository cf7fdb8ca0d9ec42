use bson::{Bson, Document};
use serde::de::DeserializeOwned;

use crate::errors::DbError;

/// How a destination materializes one result document.
pub trait FromRecord: Sized {
    fn from_record(doc: Document) -> Result<Self, DbError>;
}

/// Marker for serde types decoded by field name: `impl Record for Employee {}`.
pub trait Record: DeserializeOwned {}

impl FromRecord for Document {
    fn from_record(doc: Document) -> Result<Self, DbError> {
        Ok(doc)
    }
}

impl<T: Record> FromRecord for T {
    fn from_record(doc: Document) -> Result<Self, DbError> {
        bson::deserialize_from_document(doc).map_err(|e| DbError::Decode(e.to_string()))
    }
}

impl Record for serde_json::Value {}

/// Boxed destinations: the pointee is decoded and then boxed.
impl<T: Record> Record for Box<T> {}

/// `YYYY-MM-DDT...` shape check ahead of the full RFC 3339 parse.
fn looks_like_timestamp(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 11 && b[4] == b'-' && b[7] == b'-' && b[10] == b'T'
}

/// Replaces top-level RFC 3339 strings with BSON datetimes. Unparseable strings are left alone.
pub fn coerce_dates(doc: &mut Document) {
    for (_, value) in doc.iter_mut() {
        if let Bson::String(s) = value
            && looks_like_timestamp(s)
            && let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s)
        {
            *value = Bson::DateTime(bson::DateTime::from_millis(dt.timestamp_millis()));
        }
    }
}
