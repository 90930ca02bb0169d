/// Advisory-lock class id used when none is configured.
pub const DEFAULT_LOCK_CLASS_ID: i32 = 1337;

/// Process-wide queue configuration.
///
/// The class id is the first coordinate of every `(class_id, job_id)`
/// advisory-lock call and partitions Postgres' advisory-lock space, so
/// several queue deployments can share one database. Every worker process
/// cooperating on the same job table MUST use the same class id; with
/// mismatched ids two workers can claim the same job without noticing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Integer partitioning the advisory-lock namespace.
    pub pg_advisory_lock_class_id: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pg_advisory_lock_class_id: DEFAULT_LOCK_CLASS_ID,
        }
    }
}

impl Config {
    /// Configuration with a custom advisory-lock class id.
    pub fn with_lock_class_id(pg_advisory_lock_class_id: i32) -> Self {
        Self {
            pg_advisory_lock_class_id,
        }
    }
}
