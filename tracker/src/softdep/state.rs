// Dependency record state flags

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DepState: u32 {
        /// Visible in the buffer; not rolled back
        const ATTACHED = 0x0001;
        /// Rolled back for an in-flight write
        const UNDONE = 0x0002;
        /// Its own write has landed
        const COMPLETE = 0x0004;
        /// Its prerequisites have landed
        const DEPCOMPLETE = 0x0008;
        const MKDIR_PARENT = 0x0010;
        const MKDIR_BODY = 0x0020;
        const RMDIR = 0x0040;
        const DIRCHG = 0x0080;
        const GOINGAWAY = 0x0100;
        const IOSTARTED = 0x0200;
        const SPACECOUNTED = 0x0400;
        const NEWBLOCK = 0x0800;
        const INPROGRESS = 0x1000;
        const EXTDATA = 0x2000;
        const ONWORKLIST = 0x8000;

        const ALLCOMPLETE = Self::ATTACHED.bits() | Self::COMPLETE.bits() | Self::DEPCOMPLETE.bits();
        const MKDIR_PENDING = Self::MKDIR_PARENT.bits() | Self::MKDIR_BODY.bits();
    }
}

/// Flags that may only ever be set.
pub const MONOTONIC: DepState = DepState::COMPLETE.union(DepState::DEPCOMPLETE);

impl DepState {
    pub fn all_complete(self) -> bool {
        self.contains(DepState::ALLCOMPLETE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allcomplete_composite() {
        let mut state = DepState::ATTACHED | DepState::DEPCOMPLETE;
        assert!(!state.all_complete());
        state |= DepState::COMPLETE;
        assert!(state.all_complete());
        state.remove(DepState::ATTACHED);
        state.insert(DepState::UNDONE);
        assert!(!state.all_complete());
    }

    #[test]
    fn test_monotonic_mask() {
        assert!(MONOTONIC.contains(DepState::COMPLETE));
        assert!(MONOTONIC.contains(DepState::DEPCOMPLETE));
        assert!(!MONOTONIC.contains(DepState::ATTACHED));
    }
}
