//! Database schema constants.
//!
//! This module contains all SQL schema definitions for the SQLite
//! storage backend.

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    next_retry_at TEXT,
    error_message TEXT,
    lock_holder TEXT,
    lock_time TEXT
)
"#;

/// SQL schema for creating the config table.
pub const CREATE_CONFIG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
)
"#;

/// Index backing the claim scan: eligible jobs are located by state and
/// handed out oldest-first.
pub const CREATE_CLAIM_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_state_created_at ON jobs(state, created_at)";

/// Index backing listings, which are ordered most-recent-first.
pub const CREATE_LISTING_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)";

/// Seeds the default queue policy values. `INSERT OR IGNORE` keeps values
/// an operator has already changed.
pub const SEED_DEFAULT_CONFIG: &str = r#"
INSERT OR IGNORE INTO config (key, value) VALUES
    ('max-retries', 3),
    ('backoff-base', 2)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_CONFIG_TABLE,
        CREATE_CLAIM_INDEX,
        CREATE_LISTING_INDEX,
        SEED_DEFAULT_CONFIG,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Jobs table name.
    pub const JOBS: &str = "jobs";
    /// Config table name.
    pub const CONFIG: &str = "config";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 5);
        // Tables must exist before their indexes and seed data
        assert!(statements[0].contains("jobs"));
        assert!(statements[1].contains("config"));
        assert!(statements[4].contains("INSERT OR IGNORE"));
    }

    #[test]
    fn test_table_constants() {
        assert_eq!(tables::JOBS, "jobs");
        assert_eq!(tables::CONFIG, "config");
    }
}
