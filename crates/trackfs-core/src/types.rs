//! Identifiers, the unique-id generator, and commit result types.

use std::fmt;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier using UUID v4.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Return the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(
    /// Identifier of one writer process or task, recorded in record bodies.
    WriterId
);

// ---------------------------------------------------------------------------
// Unique id generation
// ---------------------------------------------------------------------------

/// How an [`IdGenerator`] produces names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Random UUID v4. 122 random bits; collisions are negligible.
    Uuid,
    /// Timestamp + worker + sequence. Unique within one generator and
    /// strictly increasing; across processes unique while worker ids differ.
    Snowflake,
}

/// Custom epoch for snowflake ids: 2024-01-01T00:00:00Z.
const SNOWFLAKE_EPOCH_MILLIS: i64 = 1_704_067_200_000;
const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Process-wide generator of record names.
///
/// Construct one at process start and hand it to commit strategies as
/// `Arc<IdGenerator>`; it is not a global.
#[derive(Debug)]
pub struct IdGenerator {
    strategy: IdStrategy,
    worker_id: u64,
    /// `(last_millis, sequence)` of the previous snowflake id.
    state: Mutex<(i64, u64)>,
}

impl IdGenerator {
    /// Create a generator. Snowflake worker ids are seeded from the wall clock.
    pub fn new(strategy: IdStrategy) -> Self {
        let seed = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        Self::with_worker(strategy, seed)
    }

    /// Create a generator with an explicit snowflake worker id.
    pub fn with_worker(strategy: IdStrategy, worker_id: u64) -> Self {
        Self {
            strategy,
            worker_id: worker_id & ((1 << WORKER_BITS) - 1),
            state: Mutex::new((0, 0)),
        }
    }

    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    /// Produce the next unique id.
    pub fn next_id(&self) -> String {
        match self.strategy {
            IdStrategy::Uuid => Uuid::new_v4().to_string(),
            IdStrategy::Snowflake => self.next_snowflake().to_string(),
        }
    }

    fn next_snowflake(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (last_millis, sequence) = *state;
        let now = Utc::now().timestamp_millis() - SNOWFLAKE_EPOCH_MILLIS;

        // Never go backwards, even if the wall clock does.
        let (millis, sequence) = if now > last_millis {
            (now, 0)
        } else if sequence < SEQUENCE_MASK {
            (last_millis, sequence + 1)
        } else {
            (last_millis + 1, 0)
        };
        *state = (millis, sequence);

        ((millis as u64) << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | sequence
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(IdStrategy::Uuid)
    }
}

// ---------------------------------------------------------------------------
// Commit results
// ---------------------------------------------------------------------------

/// Outcome of a garbage-collection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Versions whose tracker marker moved to `archive/`.
    pub archived: Vec<u64>,
    /// Versions whose commit directory was physically deleted.
    pub purged: Vec<u64>,
}

/// A failure during best-effort cleanup. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupIssue {
    /// The cleanup step that failed.
    pub stage: String,
    /// Rendered error.
    pub message: String,
}

impl CleanupIssue {
    pub fn new(stage: impl Into<String>, error: &impl fmt::Display) -> Self {
        Self {
            stage: stage.into(),
            message: error.to_string(),
        }
    }
}

/// A successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    /// The top-level version this commit finalized.
    pub version: u64,
    /// The sub-version, for the two-phase protocol.
    pub sub_version: Option<u64>,
    /// Name of the winning commit record.
    pub record: String,
    /// What the post-commit sweep did.
    pub sweep: SweepReport,
    /// Cleanup failures that were swallowed after the commit became durable.
    pub cleanup_issues: Vec<CleanupIssue>,
}

/// JSON body of a commit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBody {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_version: Option<u64>,
    pub record: String,
    pub writer: WriterId,
    pub created_at: chrono::DateTime<Utc>,
}
