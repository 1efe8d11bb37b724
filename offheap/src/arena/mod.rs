//! Growable buffers that live outside any managed heap.
//!
//! An [arena][`Arena`] only ever grows by appending,
//! and may move in memory whenever it grows.
//! Its memory comes from an [`ArenaAllocator`],
//! which is either the global allocator ([`SystemAllocator`])
//! or the allocator of a persistent store.

pub use self::growable::*;

use {
    std::{
        alloc::{Layout, alloc, dealloc, realloc},
        mem::align_of,
        ptr::NonNull,
    },
    thiserror::Error,
};

mod growable;

/// Returned when an allocator cannot satisfy a request.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("Out of memory")]
pub struct OutOfMemory;

/// Source of memory for arenas.
///
/// # Safety
///
/// Pointers returned by [`realloc`] must be aligned to at least a word,
/// and must remain valid until passed to [`realloc`] or [`free`].
///
/// [`realloc`]: `Self::realloc`
/// [`free`]: `Self::free`
pub unsafe trait ArenaAllocator
{
    /// Resize an allocation, moving it if necessary.
    ///
    /// If `ptr` is [`None`], a new allocation is made.
    /// On success the first `min(old_size, new_size)` bytes are preserved.
    /// On failure [`None`] is returned and the old allocation is untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with size `old_size`.
    /// `new_size` must not be zero.
    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Release an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with size `size`,
    /// and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// Allocate arenas using the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

const SYSTEM_ALIGN: usize = align_of::<usize>();

unsafe impl ArenaAllocator for SystemAllocator
{
    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>
    {
        debug_assert!(new_size != 0);
        let ptr = match ptr {
            None => {
                let layout = Layout::from_size_align(new_size, SYSTEM_ALIGN).ok()?;
                alloc(layout)
            },
            Some(ptr) => {
                let layout = Layout::from_size_align_unchecked(old_size, SYSTEM_ALIGN);
                realloc(ptr.as_ptr(), layout, new_size)
            },
        };
        NonNull::new(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize)
    {
        let layout = Layout::from_size_align_unchecked(size, SYSTEM_ALIGN);
        dealloc(ptr.as_ptr(), layout);
    }
}
