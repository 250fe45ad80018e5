//! Storage key codec.
//!
//! Each stored blob is named `{timestamp}_{kind}_{uuid}_v1.gz`. The name is the
//! only index the store keeps, so encoding and decoding must be exact inverses.

use std::cmp::Ordering;
use std::str::FromStr;
use telemetry_types::TelemetryKind;

const KEY_SUFFIX: &str = "_v1.gz";
const SEPARATOR: char = '_';

/// Why a storage key could not be built or decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Name does not end in the versioned suffix
    MissingSuffix(String),
    /// Name has fewer than the three required fields
    MissingField { name: String, field: &'static str },
    InvalidTimestamp(String),
    UnknownKind(String),
    /// Empty uuid or one containing a path separator or NUL
    InvalidUuid(String),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::MissingSuffix(name) => write!(f, "storage key '{}' lacks suffix {}", name, KEY_SUFFIX),
            KeyError::MissingField { name, field } => write!(f, "storage key '{}' is missing {}", name, field),
            KeyError::InvalidTimestamp(raw) => write!(f, "invalid timestamp '{}' in storage key", raw),
            KeyError::UnknownKind(raw) => write!(f, "unknown telemetry kind '{}' in storage key", raw),
            KeyError::InvalidUuid(raw) => write!(f, "invalid uuid '{}' in storage key", raw),
        }
    }
}

impl std::error::Error for KeyError {}

/// Identity of one stored telemetry blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoredTelemetryMetadata {
    pub timestamp: i64,
    pub uuid: String,
    pub kind: TelemetryKind,
}

impl StoredTelemetryMetadata {
    /// Build metadata, rejecting uuids that cannot be part of a file name.
    pub fn new(timestamp: i64, uuid: impl Into<String>, kind: TelemetryKind) -> Result<Self, KeyError> {
        let uuid = uuid.into();
        validate_uuid(&uuid)?;
        Ok(Self { timestamp, uuid, kind })
    }

    /// Encode as a storage key.
    pub fn filename(&self) -> String {
        format!("{}{}{}{}{}{}", self.timestamp, SEPARATOR, self.kind, SEPARATOR, self.uuid, KEY_SUFFIX)
    }

    /// Decode a storage key produced by [`filename`](Self::filename).
    pub fn from_filename(name: &str) -> Result<Self, KeyError> {
        let stem = name
            .strip_suffix(KEY_SUFFIX)
            .ok_or_else(|| KeyError::MissingSuffix(name.to_string()))?;

        // The timestamp may carry a leading '-', never a separator.
        let (raw_timestamp, rest) = stem.split_once(SEPARATOR).ok_or_else(|| KeyError::MissingField {
            name: name.to_string(),
            field: "kind",
        })?;
        let (raw_kind, uuid) = rest.split_once(SEPARATOR).ok_or_else(|| KeyError::MissingField {
            name: name.to_string(),
            field: "uuid",
        })?;

        let timestamp = raw_timestamp
            .parse::<i64>()
            .map_err(|_| KeyError::InvalidTimestamp(raw_timestamp.to_string()))?;
        let kind = TelemetryKind::from_str(raw_kind).map_err(|_| KeyError::UnknownKind(raw_kind.to_string()))?;

        Self::new(timestamp, uuid, kind)
    }

    /// Ordering used when the store has to decide what to keep: higher
    /// priority kinds first and, within a kind, newest first.
    pub fn retention_order(a: &Self, b: &Self) -> Ordering {
        a.kind
            .cmp(&b.kind)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
            .then_with(|| a.uuid.cmp(&b.uuid))
    }
}

/// Natural order: kind priority, then oldest first.
impl Ord for StoredTelemetryMetadata {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.uuid.cmp(&other.uuid))
    }
}

impl PartialOrd for StoredTelemetryMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn validate_uuid(uuid: &str) -> Result<(), KeyError> {
    if uuid.is_empty() || uuid.contains(['/', '\\', '\0']) {
        return Err(KeyError::InvalidUuid(uuid.to_string()));
    }
    Ok(())
}
