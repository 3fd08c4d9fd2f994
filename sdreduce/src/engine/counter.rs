//! The monotonic stage counter.

use crate::checkpoint::StageId;

/// Assigns stage ids for one pipeline run.
///
/// The counter is advanced exactly once per stage, regardless of which
/// outer loop axis the stage belongs to; spectral-window, polarization and
/// fit-iteration loops all share one counter. Only the [`StageRunner`]
/// advances it, which removes the implicit cross-loop coupling of a shared
/// global counter.
///
/// Not safe for concurrent callers; the engine is single-threaded by design.
///
/// [`StageRunner`]: super::StageRunner
#[derive(Debug, Default)]
pub struct StageCounter {
    current: StageId,
}

impl StageCounter {
    /// Creates a counter positioned before the first stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next stage id: 1 on the first call, strictly increasing
    /// and gapless thereafter.
    pub fn advance(&mut self) -> StageId {
        self.current = self.current.next();
        self.current
    }

    /// Returns the last id handed out, or [`StageId::ZERO`] if `advance`
    /// has never been called.
    #[must_use]
    pub fn current(&self) -> StageId {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_and_advances_gaplessly() {
        let mut counter = StageCounter::new();
        assert_eq!(counter.current(), StageId::ZERO);

        assert_eq!(counter.advance(), StageId::new(1));
        assert_eq!(counter.advance(), StageId::new(2));
        assert_eq!(counter.advance(), StageId::new(3));
        assert_eq!(counter.current(), StageId::new(3));
    }

    #[test]
    fn never_repeats_a_value() {
        let mut counter = StageCounter::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(counter.advance()));
        }
    }
}
