//! System-wide tunables shared across modules.

/// Default capacity for an in-memory task queue snapshot before it
/// refuses new submissions (the durable store has no such limit).
pub const MAX_QUEUE_SIZE: usize = 10_000;

/// Maximum number of history entries kept on a Task/Goal before the
/// ring buffer drops the oldest entry.
pub const MAX_HISTORY_ENTRIES: usize = 50;

/// Default retry budget before a task is moved to the dead-letter state.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Reaper sweep cadence.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 10;

/// Agent heartbeat timeout: no heartbeat within this window reclaims the
/// agent's current task and marks it offline.
pub const DEFAULT_AGENT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// HubFSM watchdog duration: force a transition back to a safe state if
/// a non-resting state persists this long uninterrupted.
pub const DEFAULT_HUB_WATCHDOG_SECS: u64 = 7200;

/// Maximum number of HubFSM transitions retained in history.
pub const MAX_HUB_HISTORY_ENTRIES: usize = 200;

/// Rate limiter backoff curve, in seconds, indexed by consecutive
/// violation count (capped at the last entry).
pub const RATE_LIMIT_BACKOFF_CURVE_SECS: &[u64] = &[1, 2, 5, 10, 30];

/// A bucket with no violations for this long resets its backoff state.
pub const RATE_LIMIT_QUIET_WINDOW_SECS: u64 = 60;

/// Default per-hour invocation budgets by hub state.
pub const DEFAULT_BUDGET_EXECUTING_PER_HOUR: u32 = 20;
pub const DEFAULT_BUDGET_IMPROVING_PER_HOUR: u32 = 10;
pub const DEFAULT_BUDGET_CONTEMPLATING_PER_HOUR: u32 = 5;

/// Store backup retention, in number of most-recent dated directories.
pub const DEFAULT_BACKUP_RETENTION_COUNT: usize = 7;

/// Periodic store backup cadence.
pub const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 3600;

/// Bound on a single EventBus subscriber's queue before new messages
/// are dropped (with a counter) rather than blocking the publisher.
pub const EVENT_BUS_SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Mailbox message TTL: messages older than this are dropped by the reaper.
pub const MAILBOX_MESSAGE_TTL_SECS: u64 = 3600;

/// Scheduler pass cadence.
pub const DEFAULT_SCHEDULER_TICK_SECS: u64 = 2;

/// HubFsm health-assessment tick cadence.
pub const DEFAULT_HUB_TICK_SECS: u64 = 15;
