//! Deferred conversion of arena offsets into addresses.

use crate::arena::{Arena, ArenaAllocator, OutOfMemory};

/// Offsets of arena words that hold arena-relative pointers.
///
/// While an arena is still growing, it may move at any append,
/// so pointer fields inside it are written relative to its start.
/// Once the arena has its final address, [`apply`] rewrites them
/// into absolute addresses.
///
/// [`apply`]: `Self::apply`
#[derive(Default)]
pub struct FixupLog
{
    offsets: Vec<usize>,
}

impl FixupLog
{
    /// Create an empty log.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Record that the word at `offset` holds a relative pointer.
    pub fn push(&mut self, offset: usize) -> Result<(), OutOfMemory>
    {
        self.offsets.try_reserve(1).map_err(|_| OutOfMemory)?;
        self.offsets.push(offset);
        Ok(())
    }

    /// Number of recorded fixups.
    pub fn len(&self) -> usize
    {
        self.offsets.len()
    }

    /// Whether no fixups are recorded.
    pub fn is_empty(&self) -> bool
    {
        self.offsets.is_empty()
    }

    /// Turn every recorded relative pointer into an absolute one.
    ///
    /// The arena must not move afterwards,
    /// or the pointers will dangle.
    ///
    /// # Panics
    ///
    /// Panics if a recorded word points past the end of the arena.
    pub fn apply<A>(&self, arena: &mut Arena<A>)
        where A: ArenaAllocator
    {
        let base = arena.as_ptr() as usize;
        let len = arena.len();
        for &offset in &self.offsets {
            let relative = arena.word_at(offset);
            // A copy without fields points just past its header,
            // which may be the very end of the arena.
            assert!(relative <= len, "Fixup at {offset} points outside the arena");
            arena.set_word_at(offset, base + relative);
        }
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, crate::{arena::SystemAllocator, value::WORD_SIZE}};

    #[test]
    fn apply_rebases_recorded_words_only()
    {
        let mut arena = Arena::new(SystemAllocator);
        arena.append_words(&[0, 2 * WORD_SIZE, 3 * WORD_SIZE, 7]).unwrap();

        let mut fixups = FixupLog::new();
        fixups.push(WORD_SIZE).unwrap();
        fixups.push(2 * WORD_SIZE).unwrap();
        fixups.apply(&mut arena);

        let base = arena.as_ptr() as usize;
        assert_eq!(arena.word_at(0), 0);
        assert_eq!(arena.word_at(WORD_SIZE), base + 2 * WORD_SIZE);
        assert_eq!(arena.word_at(2 * WORD_SIZE), base + 3 * WORD_SIZE);
        assert_eq!(arena.word_at(3 * WORD_SIZE), 7);
    }

    #[test]
    #[should_panic = "outside the arena"]
    fn apply_rejects_wild_offsets()
    {
        let mut arena = Arena::new(SystemAllocator);
        arena.append_words(&[1000]).unwrap();
        let mut fixups = FixupLog::new();
        fixups.push(0).unwrap();
        fixups.apply(&mut arena);
    }
}
