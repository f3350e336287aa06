//! Relay orchestration: attempt loop, retry policy, terminal errors and
//! usage accounting

pub(crate) mod accounting;
mod error;
mod orchestrator;
mod retry;
mod usage;

pub use error::{ErrorKind, RelayError};
pub use orchestrator::{ChunkStream, Relay, RelayBuilder};
pub use retry::RetryPolicy;
pub use usage::{TracingUsageSink, UsageOutcome, UsageRecord, UsageSink};
