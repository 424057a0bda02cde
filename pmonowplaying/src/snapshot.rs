//! Cached "now playing" metadata.
//!
//! The native side pushes JSON objects carrying `artist`, `album`, `track`
//! and `id`. A [`MetadataSnapshot`] holds the last non-empty one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const FIELD_ARTIST: &str = "artist";
const FIELD_ALBUM: &str = "album";
const FIELD_TRACK: &str = "track";
const FIELD_ID: &str = "id";

/// Latest known metadata. Every field is absent until the first status push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<String>,
    pub id: Option<String>,
}

impl MetadataSnapshot {
    /// Builds a snapshot from a status object.
    ///
    /// The result replaces the previous snapshot wholesale: a field missing
    /// from `status` is absent in the result, it is never merged with an
    /// older value.
    pub fn from_status(status: &Map<String, Value>) -> Self {
        Self {
            artist: field(status, FIELD_ARTIST),
            album: field(status, FIELD_ALBUM),
            track: field(status, FIELD_TRACK),
            id: field(status, FIELD_ID),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.artist.is_none() && self.album.is_none() && self.track.is_none() && self.id.is_none()
    }
}

/// Returns the status object when `payload` carries something worth broadcasting.
///
/// `null`, `{}` and non-object values are noise (the native side sends `{}`
/// when it releases its callback on stop).
pub fn status_object(payload: Option<&Value>) -> Option<&Map<String, Value>> {
    match payload {
        Some(Value::Object(map)) if !map.is_empty() => Some(map),
        _ => None,
    }
}

fn field(status: &Map<String, Value>, key: &str) -> Option<String> {
    match status.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}
