use {
    super::{ArenaAllocator, OutOfMemory},
    crate::value::{Header, WORD_SIZE},
    std::{ptr::{self, NonNull}, slice},
};

/// Capacity of an arena after its first append.
pub const INITIAL_CAPACITY: usize = 256;

/// Append-only buffer that doubles its capacity when full.
///
/// Growing may move the buffer, so positions within it
/// are always expressed as offsets from its start, never as addresses.
/// Offsets of words must be multiples of [`WORD_SIZE`].
pub struct Arena<A>
    where A: ArenaAllocator
{
    /// Start of the buffer, or [`None`] if nothing was allocated yet.
    ptr: Option<NonNull<u8>>,

    /// Number of bytes appended so far.
    len: usize,

    /// Number of bytes allocated.
    capacity: usize,

    allocator: A,
}

impl<A> Arena<A>
    where A: ArenaAllocator
{
    /// Create an empty arena.
    ///
    /// No memory is allocated until the first append.
    pub fn new(allocator: A) -> Self
    {
        Self{ptr: None, len: 0, capacity: 0, allocator}
    }

    /// Number of bytes appended so far.
    pub fn len(&self) -> usize
    {
        self.len
    }

    /// Whether nothing has been appended yet.
    pub fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    /// Number of bytes allocated.
    pub fn capacity(&self) -> usize
    {
        self.capacity
    }

    /// The allocator of the arena.
    pub fn allocator(&self) -> &A
    {
        &self.allocator
    }

    /// Current start of the buffer, or null if nothing was allocated yet.
    ///
    /// The buffer may move when the arena grows.
    pub fn as_ptr(&self) -> *const u8
    {
        self.ptr.map_or(ptr::null(), |ptr| ptr.as_ptr())
    }

    /// The bytes appended so far.
    pub fn as_bytes(&self) -> &[u8]
    {
        match self.ptr {
            // SAFETY: The first len bytes are initialized.
            Some(ptr) => unsafe { slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None      => &[],
        }
    }

    /// Make sure that `additional` more bytes can be appended
    /// without allocating.
    ///
    /// On failure, the arena is left unchanged.
    pub fn reserve(&mut self, additional: usize) -> Result<(), OutOfMemory>
    {
        let needed = self.len.checked_add(additional).ok_or(OutOfMemory)?;
        if needed <= self.capacity {
            return Ok(());
        }

        let mut new_capacity = self.capacity.max(INITIAL_CAPACITY);
        while new_capacity < needed {
            new_capacity = new_capacity.checked_mul(2).ok_or(OutOfMemory)?;
        }

        // SAFETY: ptr and capacity describe the current allocation.
        let ptr = unsafe {
            self.allocator.realloc(self.ptr, self.capacity, new_capacity)
        }.ok_or(OutOfMemory)?;

        log::trace!(
            "arena grew from {} to {} bytes ({:p} -> {:p})",
            self.capacity, new_capacity, self.as_ptr(), ptr,
        );

        self.ptr = Some(ptr);
        self.capacity = new_capacity;
        Ok(())
    }

    /// Append bytes to the arena.
    ///
    /// Returns the offset at which the bytes were placed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, OutOfMemory>
    {
        self.reserve(bytes.len())?;
        let offset = self.len;
        if let Some(ptr) = self.ptr {
            // SAFETY: reserve made room for the bytes.
            unsafe {
                let dst = ptr.as_ptr().add(offset);
                ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            }
        }
        self.len += bytes.len();
        Ok(offset)
    }

    /// Append words to the arena.
    ///
    /// Returns the offset at which the words were placed.
    pub fn append_words(&mut self, words: &[usize]) -> Result<usize, OutOfMemory>
    {
        // SAFETY: Words are plain bytes.
        let bytes = unsafe {
            slice::from_raw_parts(words.as_ptr().cast::<u8>(), words.len() * WORD_SIZE)
        };
        self.append(bytes)
    }

    /// Read the word at the given offset.
    ///
    /// # Panics
    ///
    /// Panics if the offset is misaligned or out of bounds.
    pub fn word_at(&self, offset: usize) -> usize
    {
        let ptr = self.word_ptr(offset);
        // SAFETY: word_ptr checked alignment and bounds.
        unsafe { ptr::read(ptr) }
    }

    /// Overwrite the word at the given offset.
    ///
    /// # Panics
    ///
    /// Panics if the offset is misaligned or out of bounds.
    pub fn set_word_at(&mut self, offset: usize, word: usize)
    {
        let ptr = self.word_ptr(offset);
        // SAFETY: word_ptr checked alignment and bounds.
        unsafe { ptr::write(ptr, word) }
    }

    fn word_ptr(&self, offset: usize) -> *mut usize
    {
        assert!(offset % WORD_SIZE == 0, "Misaligned arena offset {offset}");
        assert!(offset + WORD_SIZE <= self.len, "Arena offset {offset} out of bounds");
        // The assertion above fails if nothing was allocated.
        self.as_ptr().wrapping_add(offset) as *mut usize
    }

    /// Shrink the allocation to exactly the appended bytes.
    ///
    /// If the allocator refuses, the arena keeps its larger allocation.
    pub fn shrink(&mut self)
    {
        let Some(ptr) = self.ptr else { return };

        if self.len == self.capacity {
            return;
        }

        if self.len == 0 {
            // SAFETY: ptr and capacity describe the current allocation.
            unsafe { self.allocator.free(ptr, self.capacity); }
            self.ptr = None;
            self.capacity = 0;
            return;
        }

        // SAFETY: ptr and capacity describe the current allocation.
        let new_ptr = unsafe {
            self.allocator.realloc(Some(ptr), self.capacity, self.len)
        };

        if let Some(new_ptr) = new_ptr {
            self.ptr = Some(new_ptr);
            self.capacity = self.len;
        }
    }

    /// Iterate over the records in the arena.
    ///
    /// The arena must consist of `(header, fields...)` records without gaps.
    pub fn records(&self) -> Records
    {
        Records{bytes: self.as_bytes(), offset: 0}
    }

    /// Give up ownership of the buffer, leaving the arena empty.
    ///
    /// Returns the buffer, its length, and its capacity,
    /// or [`None`] if nothing was allocated.
    /// The caller becomes responsible for freeing the buffer.
    pub fn take_raw(&mut self) -> Option<(NonNull<u8>, usize, usize)>
    {
        let ptr = self.ptr.take()?;
        let raw = (ptr, self.len, self.capacity);
        self.len = 0;
        self.capacity = 0;
        Some(raw)
    }
}

impl<A> Drop for Arena<A>
    where A: ArenaAllocator
{
    fn drop(&mut self)
    {
        if let Some(ptr) = self.ptr {
            // SAFETY: ptr and capacity describe the current allocation.
            unsafe { self.allocator.free(ptr, self.capacity); }
        }
    }
}

/// Iterator returned by [`Arena::records`].
///
/// Yields the offset and header of each record.
pub struct Records<'a>
{
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Records<'a>
{
    type Item = (usize, Header);

    fn next(&mut self) -> Option<Self::Item>
    {
        let word = self.bytes.get(self.offset .. self.offset + WORD_SIZE)?;
        let word = usize::from_ne_bytes(word.try_into().ok()?);
        let header = Header::from_raw(word);
        let offset = self.offset;
        self.offset += header.size_in_bytes();
        Some((offset, header))
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{arena::SystemAllocator, value::{Color, Tag}},
        proptest::proptest,
        std::cell::Cell,
    };

    /// Allocator that refuses to hand out more than a fixed number of bytes.
    struct Limited
    {
        limit: usize,
        frees: Cell<usize>,
    }

    unsafe impl ArenaAllocator for &Limited
    {
        unsafe fn realloc(
            &self,
            ptr: Option<NonNull<u8>>,
            old_size: usize,
            new_size: usize,
        ) -> Option<NonNull<u8>>
        {
            if new_size > self.limit {
                return None;
            }
            SystemAllocator.realloc(ptr, old_size, new_size)
        }

        unsafe fn free(&self, ptr: NonNull<u8>, size: usize)
        {
            self.frees.set(self.frees.get() + 1);
            SystemAllocator.free(ptr, size)
        }
    }

    #[test]
    fn capacity_doubles_from_initial()
    {
        let mut arena = Arena::new(SystemAllocator);
        assert_eq!(arena.capacity(), 0);
        arena.append(&[1]).unwrap();
        assert_eq!(arena.capacity(), INITIAL_CAPACITY);
        arena.append(&[2; INITIAL_CAPACITY]).unwrap();
        assert_eq!(arena.capacity(), 2 * INITIAL_CAPACITY);
        arena.append(&[3; 3 * INITIAL_CAPACITY]).unwrap();
        assert_eq!(arena.capacity(), 8 * INITIAL_CAPACITY);
        assert_eq!(arena.len(), 1 + 4 * INITIAL_CAPACITY);
    }

    #[test]
    fn failed_growth_leaves_arena_untouched()
    {
        let limited = Limited{limit: INITIAL_CAPACITY, frees: Cell::new(0)};
        {
            let mut arena = Arena::new(&limited);
            arena.append(&[7; 100]).unwrap();
            let ptr = arena.as_ptr();
            assert_eq!(arena.append(&[8; 200]), Err(OutOfMemory));
            assert_eq!(arena.len(), 100);
            assert_eq!(arena.as_ptr(), ptr);
            assert!(arena.as_bytes().iter().all(|&b| b == 7));
        }
        assert_eq!(limited.frees.get(), 1);
    }

    #[test]
    fn shrink_fits_length()
    {
        let mut arena = Arena::new(SystemAllocator);
        arena.append_words(&[1, 2, 3]).unwrap();
        arena.shrink();
        assert_eq!(arena.capacity(), 3 * WORD_SIZE);
        assert_eq!(arena.word_at(2 * WORD_SIZE), 3);
    }

    #[test]
    fn take_raw_transfers_ownership()
    {
        let limited = Limited{limit: usize::MAX, frees: Cell::new(0)};
        let mut arena = Arena::new(&limited);
        arena.append_words(&[42]).unwrap();
        let (ptr, len, capacity) = arena.take_raw().unwrap();
        assert!(arena.is_empty());
        drop(arena);
        assert_eq!(limited.frees.get(), 0);
        assert_eq!(len, WORD_SIZE);
        unsafe {
            assert_eq!(*ptr.as_ptr().cast::<usize>(), 42);
            (&limited).free(ptr, capacity);
        }
    }

    #[test]
    fn records_walk_without_gaps()
    {
        let mut arena = Arena::new(SystemAllocator);
        let a = Header::new(2, Color::White, Tag(0));
        let b = Header::new(0, Color::White, Tag(1));
        let c = Header::new(1, Color::Black, Tag::DOUBLE);
        arena.append_words(&[a.to_raw(), 10, 11]).unwrap();
        arena.append_words(&[b.to_raw()]).unwrap();
        arena.append_words(&[c.to_raw(), 12]).unwrap();
        let records: Vec<_> = arena.records().collect();
        assert_eq!(records, [(0, a), (3 * WORD_SIZE, b), (4 * WORD_SIZE, c)]);
    }

    #[test]
    #[should_panic = "out of bounds"]
    fn word_at_checks_bounds()
    {
        let mut arena = Arena::new(SystemAllocator);
        arena.append_words(&[1]).unwrap();
        arena.word_at(WORD_SIZE);
    }

    proptest!
    {
        #[test]
        fn appended_bytes_survive_growth(
            chunks in proptest::collection::vec(
                proptest::collection::vec(0u8 ..= 255, 0 .. 300),
                0 .. 20,
            ),
        )
        {
            let mut arena = Arena::new(SystemAllocator);
            let mut expected = Vec::new();
            for chunk in &chunks {
                let offset = arena.append(chunk).unwrap();
                assert_eq!(offset, expected.len());
                expected.extend_from_slice(chunk);
            }
            assert_eq!(arena.as_bytes(), &expected[..]);
            assert!(arena.len() <= arena.capacity());
        }
    }
}
