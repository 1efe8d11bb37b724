//! Managed heaps that graphs are externalized from.
//!
//! The copy engine never allocates in, or collects, a managed heap.
//! It only needs to know which addresses belong to one,
//! and how nodes in it are shaped.
//! This is what [`ManagedHeap`] describes.
//!
//! [`BlockHeap`] is a simple implementation for embedders
//! that do not bring a runtime of their own, and for tests.

pub use self::{block::*, block_heap::*};

use crate::value::{Header, Tag, Value};

mod block;
mod block_heap;

/// Address classification and shape introspection for a managed heap.
///
/// # Safety
///
/// Every address for which [`is_in_heap`] or [`is_young`] returns true
/// must be the address of the first field of a live node,
/// laid out as described in [`value`][`crate::value`],
/// whose header and fields may be read and written.
/// Nodes must not move for as long as the heap is borrowed.
///
/// [`is_in_heap`]: `Self::is_in_heap`
/// [`is_young`]: `Self::is_young`
pub unsafe trait ManagedHeap
{
    /// Whether the address lies in the major heap.
    fn is_in_heap(&self, addr: usize) -> bool;

    /// Whether the address lies in the young generation.
    fn is_young(&self, addr: usize) -> bool;

    /// Whether the value points into the heap or the young generation.
    fn is_in_heap_or_young(&self, value: Value) -> bool
    {
        value.is_block()
            && (self.is_in_heap(value.addr()) || self.is_young(value.addr()))
    }

    /// Read the header of a node in the heap.
    ///
    /// # Safety
    ///
    /// [`is_in_heap_or_young`] must hold for the value.
    ///
    /// [`is_in_heap_or_young`]: `Self::is_in_heap_or_young`
    unsafe fn header_of(&self, value: Value) -> Header
    {
        value.header()
    }

    /// Whether fields of nodes with the given tag are values.
    fn is_scannable(&self, tag: Tag) -> bool
    {
        tag.is_scannable()
    }
}
