//! Copy object graphs out of a managed heap.
//!
//! A graph in a garbage-collected heap can be copied into memory
//! that the collector neither scans nor moves.
//! The copy keeps the shape of the graph, including sharing and cycles,
//! and the source graph is left exactly as it was.
//!
//! Copies either live in ordinary memory, owned by a [`Handle`],
//! or in a file-backed [`Store`], where they survive the process
//! and can be looked up by key.
//!
//! The heap is described by the [`ManagedHeap`] trait.
//! [`BlockHeap`] implements it for programs without a runtime of their own.
//!
//! [`Handle`]: `handle::Handle`
//! [`Store`]: `store::Store`
//! [`ManagedHeap`]: `heap::ManagedHeap`
//! [`BlockHeap`]: `heap::BlockHeap`

#![warn(missing_docs)]

pub mod arena;
pub mod copy;
pub mod handle;
pub mod heap;
pub mod store;
pub mod value;
