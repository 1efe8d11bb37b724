use {
    super::{HEAP_START, Store},
    crate::arena::{ArenaAllocator, OutOfMemory},
    std::{os::unix::io::AsFd, ptr::{self, NonNull}},
};

/// Alignment of chunks and of the memory they hand out.
pub const CHUNK_ALIGN: usize = 16;

/// Size of the bookkeeping in front of every chunk.
pub const CHUNK_HEADER: usize = 16;

/// Size of the smallest chunk, header included.
pub const MIN_CHUNK: usize = 32;

/// Bookkeeping in front of every chunk.
///
/// `next_free` is only meaningful while the chunk is free.
/// Both it and the free list head are offsets from the store base,
/// with zero meaning the end of the list.
#[repr(C)]
struct ChunkHeader
{
    size: usize,
    next_free: usize,
}

/// Allocate memory inside a store.
///
/// Memory is carved out of chunks, which are either in use,
/// on the free list, or beyond the break.
/// The free list is ordered by address and adjacent free chunks are merged.
/// Allocations use the first free chunk that fits,
/// and fall back to moving the break, growing the file as needed.
///
/// The allocator keeps all of its state in the store file,
/// so that it carries over to the next process that attaches.
#[derive(Clone, Copy)]
pub struct StoreAllocator<'s>
{
    store: &'s Store,
}

/// Round a request up to the size of the chunk that holds it.
fn chunk_size(request: usize) -> Option<usize>
{
    let size = request.checked_add(CHUNK_HEADER + CHUNK_ALIGN - 1)?;
    Some((size & !(CHUNK_ALIGN - 1)).max(MIN_CHUNK))
}

impl<'s> StoreAllocator<'s>
{
    pub(super) fn new(store: &'s Store) -> Self
    {
        Self{store}
    }

    fn chunk(&self, offset: usize) -> *mut ChunkHeader
    {
        self.store.at(offset).cast()
    }

    fn payload(&self, offset: usize) -> NonNull<u8>
    {
        let ptr = self.store.at(offset + CHUNK_HEADER);
        // SAFETY: The mapping does not start at address zero.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    fn chunk_of(&self, ptr: NonNull<u8>) -> usize
    {
        let offset = self.store.offset_of(ptr.as_ptr() as usize);
        debug_assert!(offset >= HEAP_START + CHUNK_HEADER);
        offset - CHUNK_HEADER
    }

    /// Allocate at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory>
    {
        let need = chunk_size(size).ok_or(OutOfMemory)?;
        let header = self.store.header();

        // SAFETY: Every offset on the free list is a chunk in the file.
        unsafe {
            let mut prev = ptr::addr_of_mut!((*header).free_list);
            let mut offset = *prev;
            while offset != 0 {
                let chunk = self.chunk(offset);
                let size = (*chunk).size;

                if size >= need {
                    let next = (*chunk).next_free;
                    if size - need >= MIN_CHUNK {
                        // Leave the tail on the free list.
                        let rest = offset + need;
                        *self.chunk(rest) = ChunkHeader{size: size - need, next_free: next};
                        *prev = rest;
                        (*chunk).size = need;
                    } else {
                        *prev = next;
                    }
                    (*chunk).next_free = 0;
                    return Ok(self.payload(offset));
                }

                prev = ptr::addr_of_mut!((*chunk).next_free);
                offset = *prev;
            }

            let brk = (*header).brk;
            let end = brk.checked_add(need).ok_or(OutOfMemory)?;
            self.store.grow_file(end)?;
            *self.chunk(brk) = ChunkHeader{size: need, next_free: 0};
            (*header).brk = end;
            Ok(self.payload(brk))
        }
    }

    /// Return the chunk at `offset` to the free list.
    ///
    /// # Safety
    ///
    /// The chunk must be in use and must not be used afterwards.
    unsafe fn release(&self, offset: usize)
    {
        let header = self.store.header();
        let chunk = self.chunk(offset);

        let mut prev_offset = 0;
        let mut prev = ptr::addr_of_mut!((*header).free_list);
        let mut next = *prev;
        while next != 0 && next < offset {
            prev_offset = next;
            prev = ptr::addr_of_mut!((*self.chunk(next)).next_free);
            next = *prev;
        }
        assert!(next != offset, "Chunk at {offset:#x} freed twice");

        (*chunk).next_free = next;
        *prev = offset;

        if next != 0 && offset + (*chunk).size == next {
            let next = self.chunk(next);
            (*chunk).size += (*next).size;
            (*chunk).next_free = (*next).next_free;
        }

        if prev_offset != 0 {
            let prev = self.chunk(prev_offset);
            if prev_offset + (*prev).size == offset {
                (*prev).size += (*chunk).size;
                (*prev).next_free = (*chunk).next_free;
            }
        }
    }

    /// Give back the tail of an in-use chunk, if it is large enough.
    unsafe fn split(&self, offset: usize, need: usize)
    {
        let chunk = self.chunk(offset);
        let size = (*chunk).size;
        if size - need >= MIN_CHUNK {
            (*chunk).size = need;
            *self.chunk(offset + need) = ChunkHeader{size: size - need, next_free: 0};
            self.release(offset + need);
        }
    }
}

unsafe impl<'s> ArenaAllocator for StoreAllocator<'s>
{
    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>
    {
        let Some(ptr) = ptr else { return self.alloc(new_size).ok() };

        let need = chunk_size(new_size)?;
        let offset = self.chunk_of(ptr);
        let chunk = self.chunk(offset);
        let size = (*chunk).size;

        if need <= size {
            self.split(offset, need);
            return Some(ptr);
        }

        // The last chunk can grow by moving the break.
        // If the reservation is exhausted, the free list may still fit it.
        let header = self.store.header();
        if offset + size == (*header).brk {
            let end = offset + need;
            if self.store.grow_file(end).is_ok() {
                (*chunk).size = need;
                (*header).brk = end;
                return Some(ptr);
            }
        }

        let new_ptr = self.alloc(new_size).ok()?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        self.release(offset);
        Some(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _size: usize)
    {
        self.release(self.chunk_of(ptr));
    }
}

/// Usage of the memory in a store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StoreStats
{
    /// Length of the store file.
    pub file_len: usize,

    /// Offset past the last chunk.
    pub brk: usize,

    /// Number of chunks on the free list.
    pub free_chunks: usize,

    /// Total size of the chunks on the free list.
    pub free_bytes: usize,
}

impl Store
{
    /// Make sure the file covers the first `end` bytes of the mapping.
    pub(super) fn grow_file(&self, end: usize) -> Result<(), OutOfMemory>
    {
        let reserve = self.mapping.len();
        if end > reserve {
            log::debug!("store at {:#x} exhausted its {reserve} byte reservation",
                        self.base());
            return Err(OutOfMemory);
        }

        let file_len = self.file_len.get();
        if end <= file_len {
            return Ok(());
        }

        let growth = self.config.growth;
        let new_len = (end + growth - 1) / growth * growth;
        let new_len = new_len.min(reserve);

        os_ext::ftruncate(self.file.as_fd(), new_len as os_ext::off_t)
            .map_err(|err| {
                log::warn!("growing store file to {new_len} bytes failed: {err}");
                OutOfMemory
            })?;

        log::trace!("grew store file from {file_len} to {new_len} bytes");
        self.file_len.set(new_len);
        Ok(())
    }

    /// Walk the free list and report memory usage.
    pub fn stats(&self) -> StoreStats
    {
        let header = self.header();
        let allocator = StoreAllocator::new(self);
        let mut stats = StoreStats{file_len: self.file_len.get(), ..StoreStats::default()};

        // SAFETY: Every offset on the free list is a chunk in the file.
        unsafe {
            stats.brk = (*header).brk;
            let mut offset = (*header).free_list;
            while offset != 0 {
                let chunk = allocator.chunk(offset);
                stats.free_chunks += 1;
                stats.free_bytes += (*chunk).size;
                offset = (*chunk).next_free;
            }
        }

        stats
    }
}
