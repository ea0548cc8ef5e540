//! Time source abstraction
//!
//! Online mode reads the wall clock. Offline mode replays a capture: time
//! is whatever the latest flow record said it was, advanced by the driver
//! and never moved backwards. Both the ingest loop and the detection worker
//! read the same shared clock.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Wall-clock time.
    Online,
    /// Replay time driven by record timestamps.
    Offline,
}

#[derive(Debug)]
pub struct Clock {
    mode: ClockMode,
    replay_now: RwLock<DateTime<Utc>>,
}

impl Clock {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            replay_now: RwLock::new(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self.mode {
            ClockMode::Online => Utc::now(),
            ClockMode::Offline => *self.replay_now.read(),
        }
    }

    /// Feed a record timestamp into the clock. A no-op online; offline it
    /// advances replay time monotonically.
    pub fn advance(&self, timestamp: DateTime<Utc>) {
        if self.mode == ClockMode::Offline {
            let mut now = self.replay_now.write();
            if timestamp > *now {
                *now = timestamp;
            }
        }
    }
}
