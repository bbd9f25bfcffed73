//! Replay protection for link frames
//!
//! Every frame carries its sender's sequence number. A link keeps the highest
//! sequence it accepted plus a bitmap of the 64 below it, so frames that
//! arrive out of order still pass while each sequence is accepted once.

/// How far behind the highest accepted sequence a frame may arrive
pub const REPLAY_WINDOW: u64 = 64;

/// Sliding window over one sender's sequence numbers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayWindow {
    highest: u64,
    /// Bit `i` set: `highest - i` was accepted (or predates the window)
    bitmap: u64,
}

impl ReplayWindow {
    /// Window accepting only sequences above `floor`
    pub fn new(floor: u64) -> Self {
        ReplayWindow {
            highest: floor,
            bitmap: u64::MAX,
        }
    }

    /// Would `seq` be accepted
    pub fn check(&self, seq: u64) -> bool {
        if seq > self.highest {
            return true;
        }
        let offset = self.highest - seq;
        if offset >= REPLAY_WINDOW {
            return false;
        }
        self.bitmap & (1u64 << offset) == 0
    }

    /// Record `seq`. Returns false for a replay.
    pub fn accept(&mut self, seq: u64) -> bool {
        if !self.check(seq) {
            return false;
        }
        if seq > self.highest {
            let shift = seq - self.highest;
            self.bitmap = if shift >= REPLAY_WINDOW {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.highest = seq;
        } else {
            self.bitmap |= 1u64 << (self.highest - seq);
        }
        true
    }

    /// Highest sequence accepted so far
    pub fn highest(&self) -> u64 {
        self.highest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_and_below_rejected() {
        let mut window = ReplayWindow::new(1000);
        assert!(!window.check(1000));
        assert!(!window.check(990));
        assert!(!window.check(3));
        assert!(window.accept(1001));
        assert_eq!(window.highest(), 1001);
    }

    #[test]
    fn test_each_sequence_once() {
        let mut window = ReplayWindow::new(0);
        assert!(window.accept(5));
        assert!(!window.accept(5));
        assert!(window.accept(6));
        assert!(!window.accept(5));
    }

    #[test]
    fn test_reordered_frames_accepted() {
        let mut window = ReplayWindow::new(100);
        assert!(window.accept(110));
        assert!(window.accept(104));
        assert!(window.accept(101));
        assert!(!window.accept(104));
        assert!(window.accept(109));
        // Gaps left by the floor are never reopened
        assert!(!window.accept(100));
    }

    #[test]
    fn test_old_frames_outside_window_rejected() {
        let mut window = ReplayWindow::new(0);
        assert!(window.accept(10));
        assert!(window.accept(10 + REPLAY_WINDOW + 5));
        assert!(!window.accept(11));
        assert!(window.accept(10 + REPLAY_WINDOW));
    }

    #[test]
    fn test_large_jump_resets_bitmap() {
        let mut window = ReplayWindow::new(0);
        for seq in 1..=20 {
            assert!(window.accept(seq));
        }
        assert!(window.accept(1_000_000));
        assert!(window.accept(999_999));
        assert!(!window.accept(1_000_000));
    }
}
