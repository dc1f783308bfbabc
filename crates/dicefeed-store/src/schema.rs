/// SQL DDL for the round history database.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

/// `position` 0 is the newest round.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS rounds (
    position INTEGER PRIMARY KEY,
    sid INTEGER NOT NULL,
    d1 INTEGER NOT NULL,
    d2 INTEGER NOT NULL,
    d3 INTEGER NOT NULL,
    observed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_rounds_sid ON rounds(sid);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
