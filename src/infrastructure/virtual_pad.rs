//! Virtual Pad Sink
//!
//! The emulated gamepad driver is an external collaborator. The bridge
//! pushes one [`PadSnapshot`] per processed report; the sink decides what
//! to do with duplicates.

use crate::domain::models::PadSnapshot;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

pub trait VirtualPad: Send + Sync {
    fn submit(&self, snapshot: &PadSnapshot) -> anyhow::Result<()>;
}

/// Logs output changes instead of driving a device
#[derive(Debug, Default)]
pub struct TracingPad {
    last: Mutex<Option<PadSnapshot>>,
}

impl TracingPad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<PadSnapshot> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VirtualPad for TracingPad {
    fn submit(&self, snapshot: &PadSnapshot) -> anyhow::Result<()> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_ref() == Some(snapshot) {
            trace!("Pad output unchanged");
            return Ok(());
        }
        debug!(
            "Pad: buttons={:#010x} L=({}, {}) R=({}, {}) LT={} RT={}",
            snapshot.buttons.bits(),
            snapshot.left_axis_x,
            snapshot.left_axis_y,
            snapshot.right_axis_x,
            snapshot.right_axis_y,
            snapshot.left_trigger,
            snapshot.right_trigger
        );
        *last = Some(*snapshot);
        Ok(())
    }
}
