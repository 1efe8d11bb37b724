use {
    crate::off_t,
    std::{io, os::unix::io::{AsRawFd, BorrowedFd}},
};

/// Call mmap(2) with the given arguments.
///
/// If `fd` is [`None`], `-1` is passed and `MAP_ANONYMOUS` is added to `flags`.
///
/// # Safety
///
/// With `MAP_FIXED`, any existing mapping at `addr` is silently replaced.
/// The caller must make sure no live Rust object is located there.
pub unsafe fn mmap(
    addr:   *mut libc::c_void,
    length: usize,
    prot:   libc::c_int,
    flags:  libc::c_int,
    fd:     Option<BorrowedFd>,
    offset: off_t,
) -> io::Result<*mut libc::c_void>
{
    let (fd, flags) = match fd {
        Some(fd) => (fd.as_raw_fd(), flags),
        None     => (-1, flags | libc::MAP_ANONYMOUS),
    };

    let ptr = libc::mmap(addr, length, prot, flags, fd, offset);

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    Ok(ptr)
}

/// Call munmap(2) with the given arguments.
///
/// # Safety
///
/// The memory in the given range must no longer be used.
pub unsafe fn munmap(addr: *mut libc::c_void, length: usize) -> io::Result<()>
{
    let result = libc::munmap(addr, length);

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Call msync(2) with the given arguments.
///
/// # Safety
///
/// The given range must be mapped.
pub unsafe fn msync(addr: *mut libc::c_void, length: usize, flags: libc::c_int)
    -> io::Result<()>
{
    let result = libc::msync(addr, length, flags);

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
