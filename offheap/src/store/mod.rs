//! Persistent stores of externalized graphs.
//!
//! A store is a file mapped at a fixed address,
//! in which graphs are copied using a [`StoreAllocator`]
//! and shared under small integer keys.
//! Because the copies contain absolute pointers,
//! every process must map the store at the same address.
//! The address is recorded in the file and checked on every attach.
//!
//! # File layout
//!
//! The file starts with a header holding a magic number, a version,
//! the base address, and the state of the allocator.
//! It also points at the [key table][`key_table::KeyTable`],
//! which is itself a node in the store.
//! The rest of the file consists of chunks handed out by the allocator.
//!
//! Stores provide no locking.
//! Processes that share a store must not modify it concurrently.

pub use self::alloc::*;

use {
    self::{key_table::KeyTable, mapping::Mapping},
    crate::{
        arena::ArenaAllocator,
        copy::{self, CopyError, VisitedSet},
        heap::ManagedHeap,
        value::{HEADER_SIZE, Value},
    },
    os_ext::{O_CREAT, O_RDWR},
    scope_exit::ScopeGuard,
    serde::{Deserialize, Serialize},
    std::{
        cell::Cell,
        io,
        marker::PhantomData,
        os::unix::io::{AsFd, OwnedFd},
        path::Path,
        ptr::NonNull,
    },
    thiserror::Error,
};

mod alloc;
mod key_table;
mod mapping;

/// Identifies a store file.
const MAGIC: [u8; 8] = *b"OFFHEAP\0";

/// Version of the file layout.
const VERSION: usize = 1;

/// Offset of the first chunk.
const HEAP_START: usize = 64;

/// Header at the start of every store file.
#[repr(C)]
struct FileHeader
{
    magic: [u8; 8],
    version: usize,
    base: usize,
    brk: usize,
    free_list: usize,
    key_table: usize,
}

/* -------------------------------------------------------------------------- */
/*                                Configuration                               */
/* -------------------------------------------------------------------------- */

/// How a store is mapped and grown.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct StoreConfig
{
    /// Bytes of address space to map at the base address.
    ///
    /// The store can never grow beyond this.
    pub reserve: usize,

    /// Granularity by which the file is grown.
    pub growth: usize,
}

impl Default for StoreConfig
{
    fn default() -> Self
    {
        Self{reserve: 1 << 30, growth: 1 << 20}
    }
}

impl StoreConfig
{
    /// Set [`reserve`][`Self::reserve`].
    pub fn reserve(mut self, reserve: usize) -> Self
    {
        self.reserve = reserve;
        self
    }

    /// Set [`growth`][`Self::growth`].
    pub fn growth(mut self, growth: usize) -> Self
    {
        self.growth = growth;
        self
    }

    /// Round both sizes up to whole pages, with at least one page each.
    fn normalized(&self, page_size: usize) -> Self
    {
        let round = |n: usize| n.max(1).div_ceil(page_size) * page_size;
        Self{reserve: round(self.reserve.max(HEAP_START)), growth: round(self.growth)}
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Errors                                   */
/* -------------------------------------------------------------------------- */

/// Returned when a store operation fails.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StoreError
{
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Store base {0:#x} is not page aligned")]
    MisalignedBase(usize),

    #[error("Cannot map {len} bytes at {base:#x}")]
    AddressUnavailable{base: usize, len: usize},

    #[error("File is not a valid store")]
    BadMagic,

    #[error("Unsupported store version {0}")]
    UnsupportedVersion(usize),

    #[error("Store was created at {recorded:#x}, not at {requested:#x}")]
    BaseMismatch{recorded: usize, requested: usize},

    #[error("Store uses {needed} bytes, more than the {reserve} reserved")]
    ReserveTooSmall{needed: usize, reserve: usize},

    /// Also reported when the key table cannot grow,
    /// so that running out of room has a single variant.
    #[error("{0}")]
    Copy(#[from] CopyError),

    #[error("Key {0} is not set")]
    NotFound(usize),
}

/* -------------------------------------------------------------------------- */
/*                                    Store                                   */
/* -------------------------------------------------------------------------- */

/// Attached store.
///
/// Dropping the store detaches it.
pub struct Store
{
    // Declared before file so that it is unmapped before closing.
    mapping: Mapping,
    file: OwnedFd,
    config: StoreConfig,

    /// Current length of the file.
    file_len: Cell<usize>,
}

/// Value shared in a store.
///
/// The value stays valid until its key is overwritten or removed,
/// or the store is detached.
#[derive(Clone, Copy, Debug)]
pub struct Shared<'s>
{
    value: Value,
    _store: PhantomData<&'s Store>,
}

impl<'s> Shared<'s>
{
    /// The copy of the root.
    pub fn follow(self) -> Value
    {
        self.value
    }

    /// Address of the copy of the root.
    pub fn address(self) -> usize
    {
        self.value.addr()
    }
}

impl Store
{
    /// Open or create the store file at `path`, and attach it.
    pub fn open(path: &Path, base: usize, config: &StoreConfig)
        -> Result<Self, StoreError>
    {
        let file = os_ext::open(path, O_CREAT | O_RDWR, 0o600)?;
        Self::attach_with(file, base, config)
    }

    /// Attach the store file with the default configuration.
    pub fn attach(file: OwnedFd, base: usize) -> Result<Self, StoreError>
    {
        Self::attach_with(file, base, &StoreConfig::default())
    }

    /// Map the store file at `base`.
    ///
    /// An empty file is initialized as an empty store.
    /// Otherwise the file must be a store created at the same base.
    pub fn attach_with(file: OwnedFd, base: usize, config: &StoreConfig)
        -> Result<Self, StoreError>
    {
        let page_size = os_ext::page_size();
        if base == 0 || base % page_size != 0 {
            return Err(StoreError::MisalignedBase(base));
        }
        let config = config.normalized(page_size);

        let file_len = os_ext::fstat(file.as_fd())?.st_size as usize;
        if file_len != 0 && file_len < HEAP_START {
            return Err(StoreError::BadMagic);
        }

        let mapping = Mapping::new(file.as_fd(), base, config.reserve)?;
        let store = Self{mapping, file, config, file_len: Cell::new(file_len)};

        if file_len == 0 {
            store.initialize()?;
        } else {
            store.validate(file_len)?;
        }

        log::debug!(
            "attached store at {base:#x} with {} of {} bytes in use",
            store.stats().brk,
            store.config.reserve,
        );

        Ok(store)
    }

    /// Write the header of an empty store.
    fn initialize(&self) -> Result<(), StoreError>
    {
        let len = self.config.growth.max(HEAP_START);
        os_ext::ftruncate(self.file.as_fd(), len as os_ext::off_t)?;
        self.file_len.set(len);

        let header = FileHeader{
            magic: MAGIC,
            version: VERSION,
            base: self.base(),
            brk: HEAP_START,
            free_list: 0,
            key_table: 0,
        };
        // SAFETY: The file now covers the header.
        unsafe { self.header().write(header); }

        log::debug!("initialized store at {:#x}", self.base());
        Ok(())
    }

    /// Check the header of an existing store.
    fn validate(&self, file_len: usize) -> Result<(), StoreError>
    {
        // SAFETY: The file covers the header.
        let header = unsafe { &*self.header() };

        if header.magic != MAGIC {
            return Err(StoreError::BadMagic);
        }
        if header.version != VERSION {
            return Err(StoreError::UnsupportedVersion(header.version));
        }
        if header.base != self.base() {
            return Err(StoreError::BaseMismatch{
                recorded: header.base,
                requested: self.base(),
            });
        }
        if header.brk > self.config.reserve {
            return Err(StoreError::ReserveTooSmall{
                needed: header.brk,
                reserve: self.config.reserve,
            });
        }
        if header.brk < HEAP_START || header.brk > file_len {
            return Err(StoreError::BadMagic);
        }

        Ok(())
    }

    /// The address the store is mapped at.
    pub fn base(&self) -> usize
    {
        self.mapping.as_ptr() as usize
    }

    /// The configuration the store was attached with.
    ///
    /// Sizes are rounded up to whole pages.
    pub fn config(&self) -> &StoreConfig
    {
        &self.config
    }

    /// Allocator for memory inside the store.
    pub fn allocator(&self) -> StoreAllocator
    {
        StoreAllocator::new(self)
    }

    /// Whether the address lies within the store.
    pub fn contains(&self, addr: usize) -> bool
    {
        self.mapping.contains(addr)
    }

    fn header(&self) -> *mut FileHeader
    {
        self.mapping.as_ptr().cast()
    }

    fn at(&self, offset: usize) -> *mut u8
    {
        self.mapping.as_ptr().wrapping_add(offset)
    }

    fn offset_of(&self, addr: usize) -> usize
    {
        debug_assert!(self.contains(addr));
        addr - self.base()
    }

    /// Copy the graph at `root` into the store and share it under `key`.
    ///
    /// A value already shared under `key` is freed,
    /// but only once the new one was copied successfully.
    /// On failure the store is left as it was.
    ///
    /// Because the old value is still allocated during the copy,
    /// overwriting a key needs room for both values at once.
    /// A nearly full store may therefore fail to overwrite a key
    /// even though the new value would fit in place of the old one.
    /// Use [`remove`][`Self::remove`] first to trade that safety for space.
    pub fn share<H>(&self, heap: &H, key: usize, root: Value)
        -> Result<(Shared, usize), StoreError>
        where H: ManagedHeap
    {
        let allocator = self.allocator();
        let raw = copy::copy(heap, root, allocator, VisitedSet::new())?;

        // SAFETY: The copy is not referenced from anywhere yet.
        let guard = ScopeGuard::new(|| unsafe { allocator.free(raw.ptr, raw.capacity) });
        let table = KeyTable::new(self);
        table.reserve(key).map_err(CopyError::from)?;
        guard.dismiss();

        if let Some(old) = table.replace(key, Some(raw.root())) {
            // SAFETY: The old value is no longer referenced by the table.
            unsafe { self.free_shared(old); }
        }

        log::debug!("shared {} bytes at {:p} under key {key}", raw.size, raw.ptr);
        Ok((Shared{value: raw.root(), _store: PhantomData}, raw.size))
    }

    /// The value shared under `key`.
    pub fn get(&self, key: usize) -> Result<Shared, StoreError>
    {
        let value = KeyTable::new(self).get(key).ok_or(StoreError::NotFound(key))?;
        Ok(Shared{value, _store: PhantomData})
    }

    /// Stop sharing the value under `key`, and free it.
    pub fn remove(&self, key: usize) -> Result<(), StoreError>
    {
        let table = KeyTable::new(self);
        if table.get(key).is_none() {
            return Err(StoreError::NotFound(key));
        }
        if let Some(old) = table.replace(key, None) {
            // SAFETY: The old value is no longer referenced by the table.
            unsafe { self.free_shared(old); }
        }
        log::debug!("removed key {key}");
        Ok(())
    }

    /// Every key that has a value, in ascending order.
    pub fn keys(&self) -> Vec<usize>
    {
        KeyTable::new(self).keys()
    }

    /// Free the buffer that holds the shared value.
    unsafe fn free_shared(&self, value: Value)
    {
        let ptr = NonNull::new_unchecked(value.addr().wrapping_sub(HEADER_SIZE) as *mut u8);
        self.allocator().free(ptr, 0);
    }

    /// Flush the store to its file.
    pub fn sync(&self) -> Result<(), StoreError>
    {
        let len = self.file_len.get().min(self.mapping.len());
        self.mapping.sync(len)?;
        Ok(())
    }

    /// Flush and unmap the store, and close the file.
    pub fn detach(self) -> Result<(), StoreError>
    {
        self.sync()?;
        log::debug!("detached store at {:#x}", self.base());
        Ok(())
    }
}
