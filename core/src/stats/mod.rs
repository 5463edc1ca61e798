//! Request statistics
//!
//! [`RequestStats`] aggregates [`RequestEvent`](crate::events::RequestEvent)s
//! per `(request_type, name)` and into one total entry. Fail ratio comes from
//! cumulative counters; percentiles come from a bounded window of recent
//! response times plus a cumulative HdrHistogram.

mod aggregator;
mod entry;
mod percentile;
mod reporter;

pub use aggregator::{RequestStats, StatsDelta, StatsListener, StatsSnapshot, TOTAL_NAME};
pub use entry::{EntryDelta, EntrySettings, EntrySnapshot, StatsEntry, StatsError};
pub use percentile::{percentile, ResponseTimeHistogram, ResponseTimePercentiles};
pub use reporter::{ReportFrame, StatsReporter};
