//! Playback timing derived from pushed timing fragments.
//!
//! The table pushes remaining/total time for the active track every few
//! seconds but does not timestamp those pushes. The tracker stores the
//! latest snapshot stamped with the local receipt time (UTC) and never
//! extrapolates; callers compute "effective remaining now" themselves if
//! they need it.

use std::time::Duration;

use time::OffsetDateTime;

use crate::protocol::Timing;

/// The last timing snapshot and when it was received.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackTime {
    remaining: Duration,
    total: Duration,
    as_of: Option<OffsetDateTime>,
}

impl TrackTime {
    /// Records a freshly received timing fragment.
    pub fn record(&mut self, timing: Timing) {
        self.remaining = timing.remaining_time;
        self.total = timing.total_time;
        self.as_of = Some(OffsetDateTime::now_utc());
    }

    /// Remaining time on the active track, as of [`TrackTime::as_of`].
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Total length of the active track.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Local receipt time of the last snapshot, or `None` before the
    /// first timing fragment arrives.
    #[must_use]
    pub fn as_of(&self) -> Option<OffsetDateTime> {
        self.as_of
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_stamps_local_receipt_time() {
        let mut time = TrackTime::default();
        assert_eq!(time.as_of(), None);

        time.record(Timing {
            remaining_time: Duration::from_millis(500),
            total_time: Duration::from_millis(2000),
        });

        assert_eq!(time.remaining(), Duration::from_millis(500));
        assert_eq!(time.total(), Duration::from_secs(2));

        let age = OffsetDateTime::now_utc() - time.as_of().expect("timestamp set");
        assert!(age < time::Duration::seconds(5));
    }
}
