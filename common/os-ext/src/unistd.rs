use {
    crate::{off_t, retry_on_eintr},
    std::{io, os::unix::io::{AsRawFd, BorrowedFd}},
};

/// Call ftruncate(2) with the given arguments.
pub fn ftruncate(fd: BorrowedFd, length: off_t) -> io::Result<()>
{
    retry_on_eintr(|| {
        // SAFETY: This is always safe.
        let result = unsafe { libc::ftruncate(fd.as_raw_fd(), length) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}

/// Call sysconf(3) with `_SC_PAGESIZE`.
pub fn page_size() -> usize
{
    // SAFETY: This is always safe.
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    // POSIX requires _SC_PAGESIZE to be supported.
    if result <= 0 { 4096 } else { result as usize }
}
