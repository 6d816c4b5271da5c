//! Process-wide mute flag.
//!
//! Only the call controller flips it; the capture pump reads it once per
//! frame through a [`MuteReader`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owning handle: the only way to change the mute state.
#[derive(Debug, Default)]
pub struct MuteFlag(Arc<AtomicBool>);

impl MuteFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and return the new state.
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reader(&self) -> MuteReader {
        MuteReader(Arc::clone(&self.0))
    }
}

/// Read-only view handed to the capture pipeline.
#[derive(Debug, Clone)]
pub struct MuteReader(Arc<AtomicBool>);

impl MuteReader {
    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_returns_new_state_and_readers_follow() {
        let flag = MuteFlag::new();
        let reader = flag.reader();
        assert!(!reader.is_muted());

        assert!(flag.toggle());
        assert!(flag.is_muted());
        assert!(reader.is_muted());

        assert!(!flag.toggle());
        assert!(!reader.is_muted());
    }
}
