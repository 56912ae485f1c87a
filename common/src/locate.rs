use crate::ports::{DigitalIo, Level};

pub const LOCATE_HALF_PERIOD_MS: u64 = 500;

/// Blinks the identify LED while locate is active; holds it off otherwise.
#[derive(Debug, Clone)]
pub struct LocateIndicator {
    pin: u8,
    level: Level,
    last_toggle_ms: u64,
}

impl LocateIndicator {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            level: Level::Low,
            last_toggle_ms: 0,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn service<G: DigitalIo>(&mut self, active: bool, io: &mut G, now_ms: u64) {
        if !active {
            self.level = Level::Low;
            io.write(self.pin, Level::Low);
            return;
        }

        if now_ms.saturating_sub(self.last_toggle_ms) > LOCATE_HALF_PERIOD_MS {
            self.last_toggle_ms = now_ms;
            self.level = self.level.toggled();
            io.write(self.pin, self.level);
        }
    }
}
