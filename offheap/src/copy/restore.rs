//! Remembering which nodes a traversal has already copied.

use {
    crate::{
        arena::OutOfMemory,
        value::{Header, Value, WORD_SIZE},
    },
    std::collections::HashMap,
};

/// Strategy for detecting nodes that were already copied.
///
/// Each copy operation uses a fresh tracker.
/// Whatever a tracker does to the source graph,
/// [`restore`][`Self::restore`] must undo it.
pub trait VisitTracker
{
    /// The arena offset of the copy of `node`, if it was already copied.
    ///
    /// # Safety
    ///
    /// `node` must point to a live node in the managed heap.
    unsafe fn lookup(&self, node: Value) -> Option<usize>;

    /// Remember that `node` was copied to `offset`.
    ///
    /// On failure, the source graph must be left as it was.
    ///
    /// # Safety
    ///
    /// `node` must point to a live node in the managed heap
    /// whose copy starts at `offset` in the arena.
    unsafe fn mark(&mut self, node: Value, offset: usize)
        -> Result<(), OutOfMemory>;

    /// Undo every change made to the source graph.
    ///
    /// `arena` holds the copies made so far.
    /// Calling this method again without marking in between does nothing.
    ///
    /// # Safety
    ///
    /// Every marked node must still be live,
    /// and `arena` must hold every copy recorded by [`mark`].
    ///
    /// [`mark`]: `Self::mark`
    unsafe fn restore(&mut self, arena: &[u8]);
}

/* -------------------------------------------------------------------------- */
/*                                 Visited set                                */
/* -------------------------------------------------------------------------- */

/// Remember visited nodes in a hash map keyed by address.
///
/// The source graph is never written to,
/// so there is nothing to restore.
#[derive(Default)]
pub struct VisitedSet
{
    offsets: HashMap<usize, usize>,
}

impl VisitedSet
{
    /// Create an empty visited set.
    pub fn new() -> Self
    {
        Self::default()
    }
}

impl VisitTracker for VisitedSet
{
    unsafe fn lookup(&self, node: Value) -> Option<usize>
    {
        self.offsets.get(&node.addr()).copied()
    }

    unsafe fn mark(&mut self, node: Value, offset: usize)
        -> Result<(), OutOfMemory>
    {
        self.offsets.try_reserve(1).map_err(|_| OutOfMemory)?;
        self.offsets.insert(node.addr(), offset);
        Ok(())
    }

    unsafe fn restore(&mut self, _arena: &[u8])
    {
        self.offsets.clear();
    }
}

/* -------------------------------------------------------------------------- */
/*                              In-place marking                              */
/* -------------------------------------------------------------------------- */

/// What is needed to undo the marking of one node.
///
/// The original header is not stored here,
/// because it survives as the header of the node's copy.
#[derive(Clone, Copy, Debug)]
pub struct RestoreEntry
{
    /// The marked node.
    pub node: Value,

    /// The original contents of field 0.
    pub field_zero: Value,
}

/// Entries for every node that is currently marked.
#[derive(Default)]
pub struct RestoreLog
{
    entries: Vec<RestoreEntry>,
}

impl RestoreLog
{
    /// Record an entry, allocating room for it first.
    pub fn push(&mut self, entry: RestoreEntry) -> Result<(), OutOfMemory>
    {
        self.entries.try_reserve(1).map_err(|_| OutOfMemory)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    /// Whether no entries are recorded.
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

/// Mark visited nodes by overwriting them in place.
///
/// A visited node gets [`Header::VISITED`] as its header,
/// and the offset of its copy as an integer in field 0.
/// This needs no memory besides the [`RestoreLog`],
/// but the source graph is unusable until [`restore`] runs.
///
/// Nodes without fields are not marked,
/// since there is no field to keep the offset in.
/// The copier deduplicates those by tag instead.
///
/// [`restore`]: `VisitTracker::restore`
#[derive(Default)]
pub struct InPlaceMarking
{
    log: RestoreLog,
}

impl InPlaceMarking
{
    /// Create a tracker that has not marked anything yet.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// The entries for the nodes that are currently marked.
    pub fn log(&self) -> &RestoreLog
    {
        &self.log
    }
}

impl VisitTracker for InPlaceMarking
{
    unsafe fn lookup(&self, node: Value) -> Option<usize>
    {
        if node.header() != Header::VISITED {
            return None;
        }
        let offset = node.field(0).to_int()
            .expect("Visited node must hold its offset");
        Some(offset as usize)
    }

    unsafe fn mark(&mut self, node: Value, offset: usize)
        -> Result<(), OutOfMemory>
    {
        if node.header().fields() == 0 {
            return Ok(());
        }

        // Log before mutating, so that every mutation can be undone.
        self.log.push(RestoreEntry{node, field_zero: node.field(0)})?;

        node.set_header(Header::VISITED);
        node.set_field(0, Value::from_int(offset as isize));
        Ok(())
    }

    unsafe fn restore(&mut self, arena: &[u8])
    {
        for RestoreEntry{node, field_zero} in self.log.entries.drain(..) {
            assert!(
                node.header() == Header::VISITED,
                "Node {node:?} lost its visited mark before restoring",
            );

            let offset = node.field(0).to_int()
                .expect("Visited node must hold its offset") as usize;
            let original = &arena[offset .. offset + WORD_SIZE];
            let original = usize::from_ne_bytes(original.try_into()
                .expect("Slice has the size of a word"));

            node.set_header(Header::from_raw(original));
            node.set_field(0, field_zero);
        }
    }
}
