//! SQLite sink schema definitions

pub const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ingested_at BIGINT NOT NULL,   -- Unix millis, one value per batch
    payload BLOB NOT NULL
)
"#;

// For time-range exports
pub const CREATE_INDEX_INGESTED_AT: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_ingested_at ON records(ingested_at)";
