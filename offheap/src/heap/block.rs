use {
    crate::value::WORD_SIZE,
    std::{
        alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error},
        ptr::NonNull,
        slice,
    },
};

/// Alignment for blocks.
///
/// The address of every block is a multiple of this value.
pub const BLOCK_ALIGN: usize = 4096;

/// Default size for blocks.
///
/// Blocks larger than this are only needed for very large nodes.
pub const DEFAULT_BLOCK_SIZE: usize = BLOCK_ALIGN;

/// Owned block.
///
/// A block is a region of memory that stores
/// a sequence of zero or more nodes, each a header followed by fields.
/// Nodes may be of different sizes, but are all aligned to words.
///
/// Blocks keep track of where to allocate new nodes.
/// They contain an offset that can be bumped to perform allocations.
/// The [`try_alloc`] method bumps this offset and returns its old value.
/// Nodes never move once allocated, and blocks are never compacted.
///
/// [`try_alloc`]: `Self::try_alloc`
pub struct Block
{
    /// The address of the block.
    ptr: NonNull<u8>,

    /// The number of bytes that make up the block.
    len: usize,

    /// The `ptr`-relative offset of the next node to be allocated.
    ///
    /// This offset is in bytes and a multiple of [`WORD_SIZE`].
    offset: usize,
}

impl Block
{
    /// Allocate a block with the default block size.
    pub fn new() -> Self
    {
        Self::with_capacity(DEFAULT_BLOCK_SIZE)
    }

    /// Allocate a block with a given block size.
    ///
    /// The memory of the block is zeroed.
    pub fn with_capacity(cap: usize) -> Self
    {
        // Zero-sized allocations are not allowed.
        let len = cap.max(WORD_SIZE);

        // Create layout for allocation.
        let layout = Layout::from_size_align(len, BLOCK_ALIGN)
            .expect("Cannot allocate a block this large");

        // Allocate memory for the block.
        // SAFETY: len is non-zero.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr)
            else { handle_alloc_error(layout) };

        Self{ptr, len, offset: 0}
    }

    /// Allocate memory for a node within the block.
    ///
    /// If the block has insufficient space for the node,
    /// this method returns [`None`] and nothing changes.
    /// The returned pointer points at the header of the node.
    pub fn try_alloc(&mut self, size: usize) -> Option<NonNull<usize>>
    {
        // Make sure the *next* allocation will also be aligned.
        let size = size.checked_next_multiple_of(WORD_SIZE)?;

        // Compute the offset for the next allocation.
        let new_offset = self.offset.checked_add(size)?;

        // Check that the node fits in the block.
        if new_offset > self.len {
            return None;
        }

        // Compute the pointer to the new node.
        // SAFETY: The pointer is within the allocated block.
        let ptr = unsafe { self.ptr.as_ptr().add(self.offset) };
        let ptr = unsafe { NonNull::new_unchecked(ptr) };

        // Update the offset.
        self.offset = new_offset;

        Some(ptr.cast())
    }

    /// Whether the address lies in the allocated part of the block.
    pub fn contains(&self, addr: usize) -> bool
    {
        let start = self.ptr.as_ptr() as usize;
        addr >= start && addr < start + self.offset
    }

    /// The words allocated so far.
    pub fn words(&self) -> &[usize]
    {
        let ptr = self.ptr.as_ptr().cast::<usize>();
        // SAFETY: The memory is allocated, zero-initialized, and aligned.
        unsafe { slice::from_raw_parts(ptr, self.offset / WORD_SIZE) }
    }
}

impl Drop for Block
{
    fn drop(&mut self)
    {
        // SAFETY: This matches Block::with_capacity.
        let layout = unsafe {
            Layout::from_size_align_unchecked(self.len, BLOCK_ALIGN)
        };

        // SAFETY: ptr and layout come from with_capacity.
        unsafe { dealloc(self.ptr.as_ptr(), layout) }
    }
}
