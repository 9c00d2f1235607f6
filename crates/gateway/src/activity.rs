//! Single-flight guard for gateway activities
//!
//! Discovery sweeps and poll cycles must never overlap with themselves. An
//! [`Activity`] is claimed with [`Activity::try_begin`]; the returned guard
//! releases it on drop, so a panicking or cancelled run cannot wedge it.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// How the last run of an activity ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    /// The run reached its time bound; partial results were kept
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityStatus {
    pub name: &'static str,
    pub running: bool,
    pub last_outcome: Option<Outcome>,
    pub last_finished: Option<DateTime<Utc>>,
    pub runs: u64,
}

pub struct Activity {
    name: &'static str,
    running: AtomicBool,
    last: Mutex<(Option<Outcome>, Option<DateTime<Utc>>, u64)>,
}

impl Activity {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            last: Mutex::new((None, None, 0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Claim the activity, or `None` when a run is already in progress
    pub fn try_begin(&self) -> Option<ActivityGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActivityGuard {
                activity: self,
                outcome: Outcome::Failed,
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ActivityStatus {
        let (last_outcome, last_finished, runs) = *self.last.lock();
        ActivityStatus {
            name: self.name,
            running: self.is_running(),
            last_outcome,
            last_finished,
            runs,
        }
    }
}

/// Exclusive claim on an [`Activity`]
///
/// Ends as `Failed` unless an outcome was recorded, which covers early
/// returns and panics.
pub struct ActivityGuard<'a> {
    activity: &'a Activity,
    outcome: Outcome,
}

impl ActivityGuard<'_> {
    pub fn finish(mut self, outcome: Outcome) {
        self.outcome = outcome;
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        {
            let mut last = self.activity.last.lock();
            last.0 = Some(self.outcome);
            last.1 = Some(Utc::now());
            last.2 += 1;
        }
        self.activity.running.store(false, Ordering::Release);
    }
}
