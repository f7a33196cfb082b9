//! System-wide constants and tunable defaults
//!
//! Values here are defaults only; the corresponding `Config` fields override
//! them from the environment.

/// Upper bound on concurrently executing tasks unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 10;

/// Base delay for exponential retry backoff (`base * 2^attempts`).
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1000;

/// Ceiling applied to any computed backoff delay.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;

/// Retry budget applied when a submission does not specify one.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Per-task event ring capacity used for replay and UI reconnection.
pub const EVENT_RING_CAPACITY: usize = 200;

/// Bounded history of completed/failed queue entries.
pub const QUEUE_HISTORY_CAPACITY: usize = 1000;

/// Maximum accepted task input length in characters.
pub const MAX_INPUT_LENGTH: usize = 10_000;

/// Lower bound for a caller-supplied task timeout.
pub const MIN_TIMEOUT_MS: u64 = 1000;

/// Upper bound for a caller-supplied task timeout.
pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 600_000;

/// Default per-node execution budget inside a workflow.
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 120_000;

/// Default worker lease duration.
pub const DEFAULT_LEASE_MS: u64 = 30_000;

/// Load score step applied when an agent slot turns busy or idle.
pub const LOAD_STEP: u8 = 50;

/// Conversation turns folded into a task's base input.
pub const HISTORY_TURNS: usize = 4;

/// Per-turn truncation applied to conversation history.
pub const HISTORY_TURN_MAX_CHARS: usize = 2000;

/// Latest bus messages included in a task status snapshot.
pub const SNAPSHOT_MESSAGE_LIMIT: usize = 20;

/// SSE heartbeat interval.
pub const STREAM_HEARTBEAT_SECS: u64 = 15;

/// Scheduler idle poll interval while the queue is empty.
pub const TASK_POLL_INTERVAL_MS: u64 = 100;

/// Poll interval used by `wait_for` while a task is non-terminal.
pub const WAIT_POLL_INTERVAL_MS: u64 = 25;

/// Retention sweep cadence for the maintenance loop.
pub const CLEANUP_INTERVAL_SECS: u64 = 300;

/// Default retention window for terminal task records, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
