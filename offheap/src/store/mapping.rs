use {
    super::StoreError,
    os_ext::{MAP_FIXED_NOREPLACE, MAP_SHARED, MS_SYNC, PROT_READ, PROT_WRITE},
    std::{io, os::unix::io::BorrowedFd, ptr::NonNull},
};

/// Shared mapping of a store file at a fixed address.
///
/// The mapping covers the whole reservation,
/// which may extend past the end of the file.
/// Pages past the end of the file must not be touched
/// until the file is grown to cover them.
pub struct Mapping
{
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping
{
    /// Map `len` bytes of the file at exactly `base`.
    ///
    /// Fails with [`StoreError::AddressUnavailable`]
    /// if anything is already mapped in the range,
    /// or if the kernel places the mapping elsewhere.
    pub fn new(fd: BorrowedFd, base: usize, len: usize) -> Result<Self, StoreError>
    {
        let unavailable = || StoreError::AddressUnavailable{base, len};

        // SAFETY: MAP_FIXED_NOREPLACE never replaces existing mappings.
        let ptr = unsafe {
            os_ext::mmap(
                base as *mut libc::c_void,
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED | MAP_FIXED_NOREPLACE,
                Some(fd),
                0,
            )
        };

        let ptr = match ptr {
            Ok(ptr) => ptr,
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) =>
                return Err(unavailable()),
            Err(err) => return Err(StoreError::Io(err)),
        };

        // Kernels before Linux 4.17 treat the address as a hint.
        if ptr as usize != base {
            // SAFETY: Nothing uses the mapping yet.
            unsafe { let _ = os_ext::munmap(ptr, len); }
            return Err(unavailable());
        }

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(unavailable)?;
        Ok(Self{ptr, len})
    }

    /// Start of the mapping.
    pub fn as_ptr(&self) -> *mut u8
    {
        self.ptr.as_ptr()
    }

    /// Length of the mapping.
    pub fn len(&self) -> usize
    {
        self.len
    }

    /// Whether the address lies within the mapping.
    pub fn contains(&self, addr: usize) -> bool
    {
        let start = self.ptr.as_ptr() as usize;
        (start .. start + self.len).contains(&addr)
    }

    /// Flush the first `len` bytes of the mapping to the file.
    pub fn sync(&self, len: usize) -> io::Result<()>
    {
        let len = len.min(self.len);
        // SAFETY: The range lies within the mapping.
        unsafe { os_ext::msync(self.ptr.as_ptr().cast(), len, MS_SYNC) }
    }
}

impl Drop for Mapping
{
    fn drop(&mut self)
    {
        // SAFETY: The store that owns the mapping is going away,
        // and with it every reference into the mapping.
        let result = unsafe { os_ext::munmap(self.ptr.as_ptr().cast(), self.len) };
        if let Err(err) = result {
            log::warn!("unmapping store at {:p} failed: {err}", self.ptr);
        }
    }
}
