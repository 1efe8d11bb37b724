use {
    super::Store,
    crate::{
        arena::{ArenaAllocator, OutOfMemory},
        value::{Color, HEADER_SIZE, Header, Tag, Value, WORD_SIZE},
    },
    std::ptr::{self, NonNull},
};

/// Capacity of a freshly created key table.
pub const INITIAL_CAPACITY: usize = 32;

/// Table of the values shared under each key.
///
/// The table is a node in the store itself,
/// with one field per key holding the shared value, or zero if unset.
/// Its field count is its capacity.
/// The file header points at the table; this is the root of the store.
pub struct KeyTable<'s>
{
    store: &'s Store,
}

impl<'s> KeyTable<'s>
{
    pub fn new(store: &'s Store) -> Self
    {
        Self{store}
    }

    /// The table node, if one was created.
    fn node(&self) -> Option<Value>
    {
        // SAFETY: The header lies at the start of the mapping.
        let offset = unsafe { (*self.store.header()).key_table };
        (offset != 0).then(|| Value::from_ptr(self.store.at(offset).cast::<usize>()))
    }

    /// Number of keys that fit in the table.
    pub fn capacity(&self) -> usize
    {
        // SAFETY: The table is a node in the store.
        self.node().map_or(0, |node| unsafe { node.header().fields() })
    }

    /// The value shared under `key`.
    pub fn get(&self, key: usize) -> Option<Value>
    {
        let node = self.node()?;
        if key >= self.capacity() {
            return None;
        }
        // SAFETY: The key is within the table.
        let value = unsafe { node.field(key) };
        (value.to_raw() != 0).then_some(value)
    }

    /// Set the value shared under `key`, returning the previous one.
    ///
    /// # Panics
    ///
    /// Panics if [`reserve`][`Self::reserve`] was not called for the key.
    pub fn replace(&self, key: usize, value: Option<Value>) -> Option<Value>
    {
        assert!(key < self.capacity(), "Key {key} was not reserved");
        let old = self.get(key);
        let raw = value.unwrap_or(Value::from_raw(0));
        if let Some(node) = self.node() {
            // SAFETY: The key is within the table.
            unsafe { node.set_field(key, raw); }
        }
        old
    }

    /// Make sure the table has room for `key`.
    ///
    /// The capacity is doubled until the key fits.
    /// On failure the table is left as it was.
    pub fn reserve(&self, key: usize) -> Result<(), OutOfMemory>
    {
        let capacity = self.capacity();
        if key < capacity {
            return Ok(());
        }

        let mut new_capacity = capacity.max(INITIAL_CAPACITY);
        while new_capacity <= key {
            new_capacity = new_capacity.checked_mul(2).ok_or(OutOfMemory)?;
        }
        if new_capacity > Header::MAX_FIELDS {
            return Err(OutOfMemory);
        }

        let bytes = new_capacity.checked_mul(WORD_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or(OutOfMemory)?;
        let allocator = self.store.allocator();
        let ptr = allocator.alloc(bytes)?;

        let header = Header::new(new_capacity, Color::Black, Tag::ABSTRACT);
        let new = Value::from_raw(ptr.as_ptr() as usize + HEADER_SIZE);

        // SAFETY: The allocation fits the header and every field.
        unsafe {
            new.set_header(header);
            ptr::write_bytes(new.field_ptr(0), 0, new_capacity);
            if let Some(old) = self.node() {
                ptr::copy_nonoverlapping(old.field_ptr(0), new.field_ptr(0), capacity);
                let old_ptr = NonNull::new_unchecked(old.header_ptr().cast());
                allocator.free(old_ptr, 0);
            }
            (*self.store.header()).key_table = self.store.offset_of(new.addr());
        }

        log::trace!("grew key table from {capacity} to {new_capacity} keys");
        Ok(())
    }

    /// Every key that has a value, in ascending order.
    pub fn keys(&self) -> Vec<usize>
    {
        (0 .. self.capacity()).filter(|&key| self.get(key).is_some()).collect()
    }
}
