//! Frame flags for the Canopy wire protocol

/// Frame flags (1 byte)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);

    // Flag bits
    pub const RELAYED: u8 = 0b0000_0001;
    pub const RETRANSMIT: u8 = 0b0000_0010;

    #[inline]
    pub fn new(bits: u8) -> Self {
        FrameFlags(bits)
    }

    /// Publication forwarded by a node other than its publisher
    #[inline]
    pub fn is_relayed(self) -> bool {
        self.0 & Self::RELAYED != 0
    }

    /// Control message re-sent after a missing acknowledgement
    #[inline]
    pub fn is_retransmit(self) -> bool {
        self.0 & Self::RETRANSMIT != 0
    }

    #[inline]
    pub fn set_relayed(&mut self, value: bool) {
        if value {
            self.0 |= Self::RELAYED;
        } else {
            self.0 &= !Self::RELAYED;
        }
    }

    #[inline]
    pub fn set_retransmit(&mut self, value: bool) {
        if value {
            self.0 |= Self::RETRANSMIT;
        } else {
            self.0 &= !Self::RETRANSMIT;
        }
    }
}

impl From<u8> for FrameFlags {
    fn from(bits: u8) -> Self {
        FrameFlags(bits)
    }
}

impl From<FrameFlags> for u8 {
    fn from(flags: FrameFlags) -> Self {
        flags.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_operations() {
        let mut flags = FrameFlags::NONE;

        assert!(!flags.is_relayed());
        flags.set_relayed(true);
        assert!(flags.is_relayed());

        flags.set_retransmit(true);
        assert!(flags.is_retransmit());
        assert!(flags.is_relayed());

        flags.set_relayed(false);
        assert!(!flags.is_relayed());
        assert!(flags.is_retransmit());
        assert_eq!(u8::from(flags), FrameFlags::RETRANSMIT);
    }
}
