// Database schema for the anchor ledger. Statements run in order on startup
// and are idempotent.

pub const CREATE_BATCHES: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    batch_id TEXT PRIMARY KEY,
    sequence_number INTEGER NOT NULL UNIQUE,
    closed_at TEXT NOT NULL,
    merkle_root TEXT NOT NULL,
    event_count INTEGER NOT NULL
)
"#;

pub const CREATE_BATCH_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS batch_events (
    batch_id TEXT NOT NULL REFERENCES batches (batch_id),
    position INTEGER NOT NULL,
    event_id TEXT NOT NULL UNIQUE,
    event_hash TEXT NOT NULL,
    PRIMARY KEY (batch_id, position)
)
"#;

pub const CREATE_EVENT_HASH_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_batch_events_hash ON batch_events (event_hash)";

pub const CREATE_ANCHOR_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS anchor_records (
    batch_id TEXT PRIMARY KEY REFERENCES batches (batch_id),
    merkle_root TEXT NOT NULL,
    submission_state TEXT NOT NULL CHECK (submission_state IN ('Pending', 'Confirmed', 'Failed')),
    ledger_tx_ref TEXT,
    submitted_at TEXT NOT NULL,
    confirmed_at TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    last_error TEXT,
    block_height INTEGER,
    rejected_tx_ref TEXT
)
"#;

pub const CREATE_STATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_anchor_records_state ON anchor_records (submission_state)";

pub const CREATE_CONFIRMED_GUARD: &str = r#"
CREATE TRIGGER IF NOT EXISTS anchor_records_confirmed_immutable
BEFORE UPDATE ON anchor_records
WHEN OLD.submission_state = 'Confirmed'
BEGIN
    SELECT RAISE(ABORT, 'confirmed anchor records are immutable');
END
"#;

pub const CREATE_DELETE_GUARD: &str = r#"
CREATE TRIGGER IF NOT EXISTS anchor_records_never_deleted
BEFORE DELETE ON anchor_records
BEGIN
    SELECT RAISE(ABORT, 'anchor records are never deleted');
END
"#;

pub const MIGRATIONS: &[&str] = &[
    CREATE_BATCHES,
    CREATE_BATCH_EVENTS,
    CREATE_EVENT_HASH_INDEX,
    CREATE_ANCHOR_RECORDS,
    CREATE_STATE_INDEX,
    CREATE_CONFIRMED_GUARD,
    CREATE_DELETE_GUARD,
];
