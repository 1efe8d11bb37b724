//! Owning references to externalized graphs.

use {
    crate::{
        arena::{ArenaAllocator, SystemAllocator},
        copy::{self, CopyError, Externalized, VisitTracker, VisitedSet},
        heap::ManagedHeap,
        value::Value,
    },
    std::fmt,
    thiserror::Error,
};

/// Returned when using a handle that was deleted.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum HandleError
{
    /// The handle was deleted before.
    #[error("Handle was already deleted")]
    Deleted,
}

/// Owns the buffer of an externalized graph.
///
/// The buffer is freed when the handle is [deleted][`Self::delete`]
/// or dropped, whichever comes first.
/// A deleted handle stays around as a tombstone,
/// so that using it again is reported instead of touching freed memory.
pub struct Handle<A = SystemAllocator>
    where A: ArenaAllocator
{
    raw: Option<Externalized>,
    allocator: A,
}

impl<A> Handle<A>
    where A: ArenaAllocator
{
    /// Take ownership of a buffer made by a copy with `allocator`.
    ///
    /// # Safety
    ///
    /// `raw` must have been returned by a copy that used `allocator`,
    /// and must not be owned by anything else.
    pub unsafe fn from_raw(raw: Externalized, allocator: A) -> Self
    {
        Self{raw: Some(raw), allocator}
    }

    /// The copy of the root.
    pub fn follow(&self) -> Result<Value, HandleError>
    {
        self.raw.as_ref().map(Externalized::root).ok_or(HandleError::Deleted)
    }

    /// Free the buffer and turn the handle into a tombstone.
    ///
    /// Values obtained from [`follow`][`Self::follow`] dangle afterwards.
    pub fn delete(&mut self) -> Result<(), HandleError>
    {
        let raw = self.raw.take().ok_or(HandleError::Deleted)?;
        // SAFETY: The handle owned the buffer, and no longer does.
        unsafe { self.allocator.free(raw.ptr, raw.capacity); }
        log::trace!("deleted {} bytes at {:p}", raw.size, raw.ptr);
        Ok(())
    }

    /// Number of bytes taken by the copies, or zero if deleted.
    pub fn size(&self) -> usize
    {
        self.raw.as_ref().map_or(0, |raw| raw.size)
    }

    /// Whether the handle was deleted.
    pub fn is_deleted(&self) -> bool
    {
        self.raw.is_none()
    }
}

impl<A> Drop for Handle<A>
    where A: ArenaAllocator
{
    fn drop(&mut self)
    {
        // Already deleted handles have nothing to free.
        let _ = self.delete();
    }
}

impl<A> fmt::Debug for Handle<A>
    where A: ArenaAllocator
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match &self.raw {
            Some(raw) => write!(f, "Handle({:p}, {} bytes)", raw.ptr, raw.size),
            None => write!(f, "Handle(deleted)"),
        }
    }
}

/// Copy everything reachable from `root` out of the heap.
pub fn externalize<H>(heap: &H, root: Value) -> Result<Handle, CopyError>
    where H: ManagedHeap
{
    externalize_in(heap, root, SystemAllocator, VisitedSet::new())
}

/// Like [`externalize`], but also return the size of the copy in bytes.
pub fn externalize_with_size<H>(heap: &H, root: Value)
    -> Result<(Handle, usize), CopyError>
    where H: ManagedHeap
{
    let handle = externalize(heap, root)?;
    let size = handle.size();
    Ok((handle, size))
}

/// Like [`externalize`], with a choice of allocator and visit tracker.
pub fn externalize_in<H, A, T>(heap: &H, root: Value, allocator: A, tracker: T)
    -> Result<Handle<A>, CopyError>
    where H: ManagedHeap, A: ArenaAllocator + Clone, T: VisitTracker
{
    let raw = copy::copy(heap, root, allocator.clone(), tracker)?;
    // SAFETY: The buffer was just made with this allocator.
    Ok(unsafe { Handle::from_raw(raw, allocator) })
}

/// Whether the value is a pointer outside of the managed heap.
///
/// Immediates are not external.
pub fn is_external<H>(heap: &H, value: Value) -> bool
    where H: ManagedHeap
{
    value.is_block() && !heap.is_in_heap_or_young(value)
}

/// The address a value points to, or zero for immediates.
pub fn address_of(value: Value) -> usize
{
    if value.is_block() { value.addr() } else { 0 }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{copy::InPlaceMarking, heap::BlockHeap, value::{Tag, WORD_SIZE}},
    };

    #[test]
    fn follow_reaches_the_copy()
    {
        let heap = BlockHeap::new();
        let leaf = heap.alloc(Tag(1), &[Value::from_int(42)]);
        let root = heap.alloc(Tag(0), &[leaf, Value::from_int(-3)]);

        let (handle, size) = externalize_with_size(&heap, root).unwrap();
        assert_eq!(size, 5 * WORD_SIZE);
        assert_eq!(handle.size(), size);

        let copy = handle.follow().unwrap();
        assert!(is_external(&heap, copy));
        assert!(!is_external(&heap, root));
        unsafe {
            assert_eq!(copy.field(0).field(0).to_int(), Some(42));
            assert_eq!(copy.field(1).to_int(), Some(-3));
        }
    }

    #[test]
    fn double_delete_is_reported()
    {
        let heap = BlockHeap::new();
        let root = heap.alloc(Tag(0), &[Value::UNIT]);
        let mut handle = externalize(&heap, root).unwrap();

        assert!(!handle.is_deleted());
        assert_eq!(handle.delete(), Ok(()));
        assert!(handle.is_deleted());
        assert_eq!(handle.size(), 0);
        assert_eq!(handle.delete(), Err(HandleError::Deleted));
        assert_eq!(handle.follow(), Err(HandleError::Deleted));
    }

    #[test]
    fn custom_tracker()
    {
        let heap = BlockHeap::new();
        let root = heap.alloc(Tag(0), &[Value::UNIT]);
        heap.set_field(root, 0, root);
        let handle = externalize_in(&heap, root, SystemAllocator, InPlaceMarking::new())
            .unwrap();
        let copy = handle.follow().unwrap();
        unsafe { assert_eq!(copy.field(0), copy); }
        assert!(format!("{handle:?}").starts_with("Handle(0x"));
    }

    #[test]
    fn non_heap_roots_are_rejected()
    {
        let heap = BlockHeap::new();
        let error = externalize(&heap, Value::from_int(1)).unwrap_err();
        assert_eq!(error, CopyError::NotInHeap);
    }

    #[test]
    fn address_of_immediates_is_zero()
    {
        let heap = BlockHeap::new();
        let node = heap.alloc(Tag(0), &[Value::UNIT]);
        assert_eq!(address_of(Value::from_int(12)), 0);
        assert_eq!(address_of(node), node.addr());
        assert!(!is_external(&heap, Value::from_int(12)));
    }
}
