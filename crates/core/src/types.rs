/// Task and job identifiers, assigned by the persistence layer.
pub type DbId = i64;

/// Run identifier, opaque to the engine. Callers may pass numeric
/// database ids or synthetic ids such as `"r1"`.
pub type RunId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
