//! Process-epoch monotonic time
//!
//! Work queue timestamps and throttling windows are expressed as
//! monotonic nanoseconds since the first call into this module. The value
//! `-1` is reserved by callers to mean "no timestamp" / infinite past.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds of monotonic time elapsed since process epoch
///
/// The first call establishes the epoch, so values are small positive
/// integers for the life of the process.
#[inline]
pub fn monotonic_nanos() -> i64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as i64
}

/// Nanoseconds-per-millisecond conversion used by callers that publish
/// coarse timestamps
pub const NANOS_PER_MILLI: i64 = 1_000_000;
