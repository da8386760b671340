//! Per-session counters.
//!
//! Written from the decode and playback contexts without locking; read as a
//! [`StatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SessionStats {
    frames_received: AtomicU64,
    frames_decoded: AtomicU64,
    frames_concealed: AtomicU64,
    decode_failures: AtomicU64,
    blocks_scheduled: AtomicU64,
    blocks_dropped: AtomicU64,
    conversion_failures: AtomicU64,
    buffers_submitted: AtomicU64,
    submit_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub decode_failures: u64,
    /// Blocks accepted by the playback queue.
    pub blocks_scheduled: u64,
    /// Blocks dropped because the playback queue was full or stopping.
    pub blocks_dropped: u64,
    pub conversion_failures: u64,
    pub buffers_submitted: u64,
    pub submit_failures: u64,
}

macro_rules! counters {
    ($($field:ident => $record:ident),* $(,)?) => {
        impl SessionStats {
            $(
                pub(crate) fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    frames_received => record_received,
    frames_decoded => record_decoded,
    frames_concealed => record_concealed,
    decode_failures => record_decode_failure,
    blocks_scheduled => record_scheduled,
    blocks_dropped => record_dropped,
    conversion_failures => record_conversion_failure,
    buffers_submitted => record_submitted,
    submit_failures => record_submit_failure,
}
