//! Volume change coalescing.
//!
//! A slider drag produces a burst of volume values.  Only the latest one
//! matters, and the audio output should see at most one change per interval.
//! The coalescer is a last-value cell plus an "armed" flag: the first offer
//! in a quiet period arms the interval timer, later offers just overwrite
//! the cell, and when the timer fires the newest value is taken.

#[derive(Debug, Default)]
pub struct VolumeCoalescer {
    pending: Option<u8>,
    armed: bool,
}

impl VolumeCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` as the latest request.  Returns `true` when the caller
    /// must arm the interval timer (no timer is currently running).
    pub fn offer(&mut self, value: u8) -> bool {
        self.pending = Some(value);
        if self.armed {
            false
        } else {
            self.armed = true;
            true
        }
    }

    /// Timer fired: take the newest value and disarm.
    pub fn fire(&mut self) -> Option<u8> {
        self.armed = false;
        self.pending.take()
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_collapses_to_last_value() {
        let mut c = VolumeCoalescer::new();
        let arms: Vec<bool> = (1..=10).map(|v| c.offer(v * 10)).collect();
        assert_eq!(arms.iter().filter(|a| **a).count(), 1);
        assert!(arms[0]);
        assert_eq!(c.fire(), Some(100));
        assert_eq!(c.fire(), None);
    }

    #[test]
    fn test_rearms_after_fire() {
        let mut c = VolumeCoalescer::new();
        assert!(c.offer(30));
        assert!(c.is_armed());
        assert_eq!(c.fire(), Some(30));
        assert!(!c.is_armed());
        assert!(c.offer(40));
        assert_eq!(c.fire(), Some(40));
    }
}
