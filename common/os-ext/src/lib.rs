//! Thin wrappers over the system calls used for file-backed memory.
//!
//! Each function is named after the system call it wraps,
//! and behaves like it except as listed below,
//! so the man pages remain the reference for their semantics.
//! Only Linux is supported.
//!
//! # Differences with underlying system calls
//!
//! Failures are returned as [`io::Error`] instead of through `errno`.
//!
//! Paths are taken as [`Path`] and made NUL-terminated on the way in.
//! A path with an interior NUL fails with `EINVAL`.
//!
//! File descriptors are returned as [`OwnedFd`], and are always
//! created with `FD_CLOEXEC` set atomically.
//!
//! Calls interrupted by a signal (`EINTR`) are retried.
//!
//! [`io::Error`]: `std::io::Error`
//! [`Path`]: `std::path::Path`
//! [`OwnedFd`]: `std::os::unix::io::OwnedFd`

#![warn(missing_docs)]

pub use {
    self::{fcntl::*, stdlib::*, sys_mman::*, sys_stat::*, unistd::*},
    libc::{
        MAP_FIXED_NOREPLACE, MAP_PRIVATE, MAP_SHARED,
        MS_SYNC,
        O_CREAT, O_EXCL, O_RDWR,
        PROT_READ, PROT_WRITE,
        off_t,
    },
};

use std::io::{self, ErrorKind::Interrupted};

mod fcntl;
mod stdlib;
mod sys_mman;
mod sys_stat;
mod unistd;

// Cannot `pub use` as that would also export the stat function.
#[allow(missing_docs, non_camel_case_types)]
pub type stat = libc::stat;

/// Call `f` until it no longer fails with `EINTR`.
fn retry_on_eintr<F, T>(mut f: F) -> io::Result<T>
    where F: FnMut() -> io::Result<T>
{
    loop {
        match f() {
            Err(err) if err.kind() == Interrupted => continue,
            result                                => return result,
        }
    }
}
