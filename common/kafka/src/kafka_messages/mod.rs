pub mod ingest_warning;

use chrono::{DateTime, Utc};
use serde::Serializer;

const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// Serializes a datetime the way the ClickHouse-bound topics expect it
pub fn serialize_datetime<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&timestamp.format(FORMAT).to_string())
}
