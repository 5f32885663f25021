/*! Latest-GPS-fix handle.

The actual gpsd client lives outside this crate; the telemetry encoder
only ever needs the most recent fix, so the interface is a shared
handle with a getter and a setter. Coordinates are in 1e-6 degree
units, matching the vehicle-position block on the wire.
*/
use std::sync::{Arc, Mutex};

/// One GPS fix as consumed by the vehicle-position block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsFix {
    /// Position state bitfield; bit 0 set means no valid fix.
    pub state: u8,
    /// Latitude in 1e-6 degrees.
    pub latitude: u32,
    /// Longitude in 1e-6 degrees.
    pub longitude: u32,
}

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            state: 0x01,
            latitude: 0,
            longitude: 0,
        }
    }
}

/// Shared holder of the most recent fix.
#[derive(Debug, Clone, Default)]
pub struct Gps {
    fix: Arc<Mutex<GpsFix>>,
}

impl Gps {
    /// New handle with no valid fix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent fix.
    #[must_use]
    pub fn latest(&self) -> GpsFix {
        *self.fix.lock().unwrap()
    }

    /// Publish a new fix.
    pub fn update(&self, fix: GpsFix) {
        *self.fix.lock().unwrap() = fix;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid_fix() {
        let gps = Gps::new();
        let fix = gps.latest();
        assert_eq!(fix.state, 0x01);
        assert_eq!((fix.latitude, fix.longitude), (0, 0));
    }

    #[test]
    fn update_is_visible_to_clones() {
        let gps = Gps::new();
        let other = gps.clone();
        gps.update(GpsFix {
            state: 0,
            latitude: 31_230_000,
            longitude: 121_470_000,
        });
        assert_eq!(other.latest().latitude, 31_230_000);
    }
}
