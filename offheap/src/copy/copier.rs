use {
    super::{CopyError, Externalized, FixupLog, VisitTracker},
    crate::{
        arena::{Arena, ArenaAllocator, OutOfMemory},
        heap::ManagedHeap,
        value::{Color, HEADER_SIZE, Header, Tag, Value, WORD_SIZE},
    },
    smallvec::SmallVec,
    std::slice,
};

/// Node whose fields are still being scanned.
struct Frame
{
    /// Offset of the copy's header in the arena.
    offset: usize,

    /// Number of fields of the node.
    fields: usize,

    /// Index of the next field to scan.
    next_field: usize,
}

/// Traversal engine that copies a graph into an arena.
///
/// The traversal is depth-first and iterative,
/// so its depth is limited by memory rather than by the call stack.
/// Each reachable node is copied exactly once,
/// so shared nodes stay shared and cycles stay cycles.
///
/// Fields are always read from the copy rather than the source,
/// since the [tracker][`VisitTracker`] may have overwritten the source.
pub struct GraphCopier<'h, H, A, T>
    where H: ManagedHeap, A: ArenaAllocator, T: VisitTracker
{
    heap: &'h H,
    arena: Arena<A>,
    tracker: T,
    fixups: FixupLog,

    /// Copies of nodes without fields, by tag.
    atoms: SmallVec<[(Tag, usize); 8]>,

    /// Nodes whose fields are still being scanned.
    stack: Vec<Frame>,
}

impl<'h, H, A, T> GraphCopier<'h, H, A, T>
    where H: ManagedHeap, A: ArenaAllocator, T: VisitTracker
{
    /// Create a copier that has not copied anything yet.
    pub fn new(heap: &'h H, allocator: A, tracker: T) -> Self
    {
        Self{
            heap,
            arena: Arena::new(allocator),
            tracker,
            fixups: FixupLog::new(),
            atoms: SmallVec::new(),
            stack: Vec::new(),
        }
    }

    /// Copy everything reachable from `root`.
    ///
    /// On failure, the source graph is restored
    /// and every buffer is freed before returning.
    pub fn copy(mut self, root: Value) -> Result<Externalized, CopyError>
    {
        if !self.heap.is_in_heap_or_young(root) {
            return Err(CopyError::NotInHeap);
        }

        // SAFETY: The root is in the heap, and so is anything
        // traverse descends into, so all of it is live.
        let result = unsafe { self.traverse(root) };

        // SAFETY: The arena holds every copy the tracker knows about.
        unsafe { self.tracker.restore(self.arena.as_bytes()); }

        match result {
            Ok(root_offset) => {
                debug_assert_eq!(root_offset, 0);
                Ok(self.finish())
            },
            Err(err) => {
                log::warn!(
                    "externalizing {root:?} ran out of memory after {} bytes",
                    self.arena.len(),
                );
                // Dropping self frees the arena and the logs.
                Err(err.into())
            },
        }
    }

    /// Copy the graph and return the offset of the copy of `root`.
    ///
    /// # Safety
    ///
    /// `root` must be a node in the heap.
    unsafe fn traverse(&mut self, root: Value) -> Result<usize, OutOfMemory>
    {
        let root_offset = self.visit(root)?;

        while let Some(frame) = self.stack.last_mut() {
            if frame.next_field == frame.fields {
                self.stack.pop();
                continue;
            }

            let slot = frame.offset + HEADER_SIZE + frame.next_field * WORD_SIZE;
            frame.next_field += 1;

            let field = Value::from_raw(self.arena.word_at(slot));
            if !self.heap.is_in_heap_or_young(field) {
                // Immediates and pointers out of the heap are kept as is.
                continue;
            }

            let target = self.visit(field)?;

            // The arena may have moved while visiting,
            // so store the target relative to the arena start.
            self.arena.set_word_at(slot, target + HEADER_SIZE);
            self.fixups.push(slot)?;
        }

        Ok(root_offset)
    }

    /// Return the offset of the copy of `node`, copying it if necessary.
    ///
    /// Newly copied nodes with scannable fields are pushed onto the stack.
    ///
    /// # Safety
    ///
    /// `node` must be a node in the heap.
    unsafe fn visit(&mut self, node: Value) -> Result<usize, OutOfMemory>
    {
        if let Some(offset) = self.tracker.lookup(node) {
            return Ok(offset);
        }

        let header = self.heap.header_of(node);
        let fields = header.fields();

        if fields == 0 {
            let atom = self.atoms.iter().find(|(tag, _)| *tag == header.tag());
            if let Some(&(_, offset)) = atom {
                return Ok(offset);
            }
        }

        let bytes = slice::from_raw_parts(
            node.header_ptr().cast::<u8>(),
            header.size_in_bytes(),
        );
        let offset = self.arena.append(bytes)?;

        if fields == 0 {
            self.atoms.try_reserve(1).map_err(|_| OutOfMemory)?;
            self.atoms.push((header.tag(), offset));
        }

        self.tracker.mark(node, offset)?;

        if fields != 0 && self.heap.is_scannable(header.tag()) {
            self.stack.try_reserve(1).map_err(|_| OutOfMemory)?;
            self.stack.push(Frame{offset, fields, next_field: 0});
        }

        Ok(offset)
    }

    /// Fix the arena in place and hand it out.
    fn finish(&mut self) -> Externalized
    {
        self.arena.shrink();
        self.fixups.apply(&mut self.arena);
        self.seal();

        let (ptr, size, capacity) = self.arena.take_raw()
            .expect("The root was copied into the arena");

        log::debug!(
            "externalized {size} bytes at {ptr:p} with {} fixups",
            self.fixups.len(),
        );

        Externalized{ptr, size, capacity}
    }

    /// Color every copy black, so collectors leave it alone.
    fn seal(&mut self)
    {
        let mut offset = 0;
        while offset < self.arena.len() {
            let header = Header::from_raw(self.arena.word_at(offset));
            self.arena.set_word_at(offset, header.with_color(Color::Black).to_raw());
            offset += header.size_in_bytes();
        }
    }
}

impl<'h, H, A, T> Drop for GraphCopier<'h, H, A, T>
    where H: ManagedHeap, A: ArenaAllocator, T: VisitTracker
{
    fn drop(&mut self)
    {
        // Only does anything when a panic interrupted the copy.
        // SAFETY: The arena holds every copy the tracker knows about.
        unsafe { self.tracker.restore(self.arena.as_bytes()); }
    }
}
