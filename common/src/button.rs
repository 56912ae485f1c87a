use log::info;

use crate::ports::Level;

pub const LONG_PRESS_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetGesture {
    Idle,
    Held { since_ms: u64 },
}

/// Long-press detector for the active-low reset button.
///
/// Fires at most once per physical press: after firing, the gesture drops back
/// to `Idle` and the latch holds it there until the button is released.
#[derive(Debug, Clone)]
pub struct ResetMonitor {
    gesture: ResetGesture,
    latched: bool,
}

impl Default for ResetMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResetMonitor {
    pub fn new() -> Self {
        Self {
            gesture: ResetGesture::Idle,
            latched: false,
        }
    }

    pub fn gesture(&self) -> ResetGesture {
        self.gesture
    }

    /// Feed one input sample. Returns `true` when the reset should fire.
    pub fn service(&mut self, level: Level, now_ms: u64) -> bool {
        if level == Level::High {
            if self.gesture != ResetGesture::Idle || self.latched {
                info!("reset button released");
            }
            self.gesture = ResetGesture::Idle;
            self.latched = false;
            return false;
        }

        if self.latched {
            return false;
        }

        match self.gesture {
            ResetGesture::Idle => {
                info!("reset button pressed");
                self.gesture = ResetGesture::Held { since_ms: now_ms };
                false
            }
            ResetGesture::Held { since_ms } if now_ms.saturating_sub(since_ms) > LONG_PRESS_MS => {
                info!("reset button held for {}ms", now_ms - since_ms);
                self.gesture = ResetGesture::Idle;
                self.latched = true;
                true
            }
            ResetGesture::Held { .. } => false,
        }
    }
}
