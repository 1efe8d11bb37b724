//! Copying graphs out of a managed heap.
//!
//! # How a copy proceeds
//!
//! The [copier][`GraphCopier`] walks the graph depth-first,
//! appending each node verbatim to an [arena][`crate::arena::Arena`].
//! The arena may move whenever it grows,
//! so pointer fields in the copies are first written as offsets
//! relative to the start of the arena, and recorded in a [`FixupLog`].
//!
//! A [`VisitTracker`] remembers which nodes were already copied,
//! so that cycles terminate and shared nodes are copied once.
//! Nodes without fields are additionally deduplicated by tag.
//!
//! When the walk completes, the tracker restores the source graph,
//! the arena is shrunk to fit, and only then are the relative pointers
//! turned into absolute ones, because the arena no longer moves.
//! Finally every copy is colored [black][`crate::value::Color::Black`].
//!
//! When memory runs out at any point, the tracker restores the source graph
//! and everything allocated for the copy is freed.
//! The source graph is then exactly as it was before the copy.

pub use self::{copier::*, fixup::*, restore::*};

use {
    crate::{
        arena::{ArenaAllocator, OutOfMemory},
        heap::ManagedHeap,
        value::{HEADER_SIZE, Value},
    },
    std::ptr::NonNull,
    thiserror::Error,
};

mod copier;
mod fixup;
mod restore;

/// Returned when a graph could not be copied.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum CopyError
{
    /// Memory ran out; the source graph was restored.
    #[error("{0}")]
    OutOfMemory(#[from] OutOfMemory),

    /// The root is an immediate or lives outside the managed heap.
    #[error("Value is not a node in the managed heap")]
    NotInHeap,
}

/// Buffer holding a copied graph.
///
/// The buffer starts with the copy of the root,
/// and is owned by whoever received it.
#[derive(Clone, Copy, Debug)]
pub struct Externalized
{
    /// Start of the buffer.
    pub ptr: NonNull<u8>,

    /// Number of bytes taken by the copies.
    pub size: usize,

    /// Number of bytes allocated, for freeing.
    pub capacity: usize,
}

impl Externalized
{
    /// The copy of the root.
    pub fn root(&self) -> Value
    {
        Value::from_raw(self.ptr.as_ptr() as usize + HEADER_SIZE)
    }
}

/// Copy everything reachable from `root` into memory from `allocator`.
///
/// See the [module documentation][`self`] for how this works.
pub fn copy<H, A, T>(heap: &H, root: Value, allocator: A, tracker: T)
    -> Result<Externalized, CopyError>
    where H: ManagedHeap, A: ArenaAllocator, T: VisitTracker
{
    GraphCopier::new(heap, allocator, tracker).copy(root)
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{
            arena::{Arena, SystemAllocator},
            heap::BlockHeap,
            value::{Color, Header, Tag, WORD_SIZE},
        },
        proptest::{self as p, proptest, strategy::Strategy},
        std::{cell::Cell, collections::HashMap},
    };

    /// Allocator that fails after a number of successful calls.
    struct Failing
    {
        remaining: Cell<usize>,
        live: Cell<isize>,
    }

    impl Failing
    {
        fn after(calls: usize) -> Self
        {
            Self{remaining: Cell::new(calls), live: Cell::new(0)}
        }
    }

    unsafe impl ArenaAllocator for &Failing
    {
        unsafe fn realloc(
            &self,
            ptr: Option<NonNull<u8>>,
            old_size: usize,
            new_size: usize,
        ) -> Option<NonNull<u8>>
        {
            if self.remaining.get() == 0 {
                return None;
            }
            self.remaining.set(self.remaining.get() - 1);
            if ptr.is_none() {
                self.live.set(self.live.get() + 1);
            }
            SystemAllocator.realloc(ptr, old_size, new_size)
        }

        unsafe fn free(&self, ptr: NonNull<u8>, size: usize)
        {
            self.live.set(self.live.get() - 1);
            SystemAllocator.free(ptr, size)
        }
    }

    fn free(ext: Externalized)
    {
        unsafe { SystemAllocator.free(ext.ptr, ext.capacity) }
    }

    fn copy_both<F>(test: F)
        where F: Fn(&dyn Fn(&BlockHeap, Value) -> Result<Externalized, CopyError>)
    {
        test(&|heap: &BlockHeap, root: Value| {
            copy(heap, root, SystemAllocator, VisitedSet::new())
        });
        test(&|heap: &BlockHeap, root: Value| {
            copy(heap, root, SystemAllocator, InPlaceMarking::new())
        });
    }

    /// Check that two graphs have the same shape and contents.
    ///
    /// `pairs` maps source nodes to copies, to check sharing.
    unsafe fn assert_isomorphic(
        heap: &BlockHeap,
        source: Value,
        copy: Value,
        pairs: &mut HashMap<usize, usize>,
    )
    {
        let mut stack = vec![(source, copy)];
        while let Some((source, copy)) = stack.pop() {
            if let Some(&seen) = pairs.get(&source.addr()) {
                assert_eq!(seen, copy.addr(), "Shared node was copied twice");
                continue;
            }
            pairs.insert(source.addr(), copy.addr());

            let (sh, ch) = (source.header(), copy.header());
            assert_eq!(sh.fields(), ch.fields());
            assert_eq!(sh.tag(), ch.tag());
            assert_eq!(ch.color(), Color::Black);
            assert!(!heap.is_in_heap_or_young(copy));

            if !sh.tag().is_scannable() {
                assert_eq!(source.fields(), copy.fields());
                continue;
            }

            for (&sf, &cf) in source.fields().iter().zip(copy.fields()) {
                if heap.is_in_heap_or_young(sf) {
                    stack.push((sf, cf));
                } else {
                    assert_eq!(sf, cf);
                }
            }
        }
    }

    #[test]
    fn copies_a_tree()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            let name = heap.alloc_string(b"hello, world");
            let pi = heap.alloc_double(3.25);
            let leaf = heap.alloc_young(Tag(2), &[Value::from_int(9)]);
            let root = heap.alloc(Tag(0), &[name, Value::from_int(-1), pi, leaf]);

            let ext = copy(&heap, root).unwrap();
            unsafe {
                assert_isomorphic(&heap, root, ext.root(), &mut HashMap::new());
                assert_eq!(ext.root().field(0).string_bytes(), b"hello, world");
                assert_eq!(ext.root().field(2).double(), 3.25);
                assert_eq!(ext.root().field(3).field(0).to_int(), Some(9));
            }
            free(ext);
        });
    }

    #[test]
    fn self_reference_points_at_own_copy()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            let node = heap.alloc(Tag(0), &[Value::UNIT, Value::from_int(4)]);
            heap.set_field(node, 0, node);

            let ext = copy(&heap, node).unwrap();
            assert_eq!(ext.size, 3 * WORD_SIZE);
            unsafe {
                assert_eq!(ext.root().field(0), ext.root());
                assert_eq!(ext.root().field(1).to_int(), Some(4));
            }
            free(ext);
        });
    }

    #[test]
    fn longer_cycles_are_copied_once()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            let a = heap.alloc(Tag(0), &[Value::UNIT]);
            let b = heap.alloc(Tag(0), &[a]);
            let c = heap.alloc(Tag(0), &[b]);
            heap.set_field(a, 0, c);

            let ext = copy(&heap, a).unwrap();
            assert_eq!(ext.size, 3 * 2 * WORD_SIZE);
            unsafe {
                let ca = ext.root();
                assert_eq!(ca.field(0).field(0).field(0), ca);
            }
            free(ext);
        });
    }

    #[test]
    fn shared_nodes_stay_shared()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            let shared = heap.alloc(Tag(1), &[Value::from_int(1)]);
            let left = heap.alloc(Tag(0), &[shared]);
            let root = heap.alloc(Tag(0), &[left, shared, shared]);

            let ext = copy(&heap, root).unwrap();
            unsafe {
                let r = ext.root();
                assert_eq!(r.field(1), r.field(2));
                assert_eq!(r.field(0).field(0), r.field(1));
                assert_isomorphic(&heap, root, r, &mut HashMap::new());
            }
            free(ext);
        });
    }

    #[test]
    fn atoms_are_deduplicated_by_tag()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            let atoms: Vec<Value> = (0 .. 5).map(|_| heap.alloc(Tag(0), &[])).collect();
            let other = heap.alloc(Tag(1), &[]);
            let mut fields = atoms.clone();
            fields.push(other);
            let root = heap.alloc(Tag(0), &fields);

            let ext = copy(&heap, root).unwrap();
            // The root, one atom of tag 0, and one atom of tag 1.
            assert_eq!(ext.size, (1 + 6) * WORD_SIZE + 2 * WORD_SIZE);
            unsafe {
                let copies = ext.root().fields();
                assert!(copies[.. 5].iter().all(|&c| c == copies[0]));
                assert_ne!(copies[0], copies[5]);
                assert_eq!(copies[0].header().fields(), 0);
                assert_eq!(copies[5].header().tag(), Tag(1));
            }
            free(ext);
        });
    }

    #[test]
    fn atom_as_root()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            let atom = heap.alloc(Tag(4), &[]);
            let ext = copy(&heap, atom).unwrap();
            assert_eq!(ext.size, WORD_SIZE);
            unsafe {
                assert_eq!(ext.root().header(), Header::new(0, Color::Black, Tag(4)));
            }
            free(ext);
        });
    }

    #[test]
    fn pointers_out_of_the_heap_are_kept()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            let inner = heap.alloc(Tag(0), &[Value::from_int(1)]);
            let first = copy(&heap, inner).unwrap();

            let outer = heap.alloc(Tag(0), &[first.root()]);
            let second = copy(&heap, outer).unwrap();
            unsafe { assert_eq!(second.root().field(0), first.root()); }
            assert_eq!(second.size, 2 * WORD_SIZE);

            free(second);
            free(first);
        });
    }

    #[test]
    fn raw_payload_is_not_scanned()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            let target = heap.alloc(Tag(0), &[Value::UNIT]);
            let opaque = heap.alloc(Tag::ABSTRACT, &[target]);
            let ext = copy(&heap, opaque).unwrap();
            assert_eq!(ext.size, 2 * WORD_SIZE);
            unsafe { assert_eq!(ext.root().field(0), target); }
            free(ext);
        });
    }

    #[test]
    fn roots_outside_the_heap_are_rejected()
    {
        copy_both(|copy| {
            let heap = BlockHeap::new();
            assert_eq!(copy(&heap, Value::from_int(3)).unwrap_err(), CopyError::NotInHeap);

            let words = [0usize; 2];
            let foreign = Value::from_ptr(&words[1]);
            assert_eq!(copy(&heap, foreign).unwrap_err(), CopyError::NotInHeap);
        });
    }

    #[test]
    fn deep_chains_do_not_overflow_the_stack()
    {
        let heap = BlockHeap::new();
        let mut node = Value::UNIT;
        for _ in 0 .. 50_000 {
            node = heap.alloc(Tag(0), &[node]);
        }
        let ext = copy(&heap, node, SystemAllocator, VisitedSet::new()).unwrap();
        assert_eq!(ext.size, 50_000 * 2 * WORD_SIZE);
        free(ext);
    }

    #[test]
    fn arena_records_are_in_copy_order()
    {
        let heap = BlockHeap::new();
        let b = heap.alloc(Tag(2), &[Value::from_int(2)]);
        let a = heap.alloc(Tag(1), &[b, Value::UNIT]);
        let root = heap.alloc(Tag(0), &[a]);

        let ext = GraphCopier::new(&heap, SystemAllocator, VisitedSet::new())
            .copy(root)
            .unwrap();

        let mut arena = Arena::new(SystemAllocator);
        unsafe {
            arena.append(std::slice::from_raw_parts(ext.ptr.as_ptr(), ext.size)).unwrap();
        }
        let records: Vec<(usize, Tag)> =
            arena.records().map(|(offset, h)| (offset, h.tag())).collect();
        assert_eq!(records, [
            (0, Tag(0)),
            (2 * WORD_SIZE, Tag(1)),
            (5 * WORD_SIZE, Tag(2)),
        ]);
        free(ext);
    }

    #[test]
    fn out_of_memory_leaves_no_trace()
    {
        fn check<T, F>(tracker: F)
            where T: VisitTracker, F: Fn() -> T
        {
            for calls in 0 .. 3 {
                let heap = BlockHeap::new();
                // Each node is large enough that the arena must grow for it.
                let mut node = Value::UNIT;
                for _ in 0 .. 3 {
                    let mut fields = vec![Value::from_int(7); 40];
                    fields[0] = node;
                    node = heap.alloc(Tag(0), &fields);
                }

                let before = heap.snapshot();
                let failing = Failing::after(calls);
                let result = copy(&heap, node, &failing, tracker());
                assert_eq!(result.unwrap_err(), CopyError::OutOfMemory(OutOfMemory));
                assert_eq!(heap.snapshot(), before, "Failing after {calls} calls");
                assert_eq!(failing.live.get(), 0, "Leaked after {calls} calls");
            }
        }

        check(VisitedSet::new);
        check(InPlaceMarking::new);
    }

    #[test]
    fn source_is_restored_after_success()
    {
        let heap = BlockHeap::new();
        let a = heap.alloc(Tag(0), &[Value::UNIT, Value::from_int(1)]);
        let b = heap.alloc(Tag(0), &[a, a]);
        heap.set_field(a, 0, b);
        let before = heap.snapshot();

        let ext = copy(&heap, b, SystemAllocator, InPlaceMarking::new()).unwrap();
        assert_eq!(heap.snapshot(), before);
        free(ext);
    }

    proptest!
    {
        #[test]
        fn random_graphs_are_copied_faithfully(
            // For each node: tag, and per field either an integer
            // or an edge to some node (by index modulo the node count).
            nodes in p::collection::vec(
                (0u8 .. 4, p::collection::vec(p::prop_oneof![
                    p::num::isize::ANY.prop_map(|n| Err::<usize, isize>(n / 4)),
                    p::num::usize::ANY.prop_map(Ok::<usize, isize>),
                ], 0 .. 5)),
                1 .. 40,
            ),
            in_place in p::bool::ANY,
        )
        {
            let heap = BlockHeap::new();
            let values: Vec<Value> = nodes.iter()
                .map(|(tag, fields)| heap.alloc(Tag(*tag), &vec![Value::UNIT; fields.len()]))
                .collect();
            for (node, (_, fields)) in values.iter().zip(&nodes) {
                for (i, field) in fields.iter().enumerate() {
                    let value = match *field {
                        Ok(edge) => values[edge % values.len()],
                        Err(n)   => Value::from_int(n),
                    };
                    heap.set_field(*node, i, value);
                }
            }

            let before = heap.snapshot();
            let ext = if in_place {
                copy(&heap, values[0], SystemAllocator, InPlaceMarking::new())
            } else {
                copy(&heap, values[0], SystemAllocator, VisitedSet::new())
            }.unwrap();
            assert_eq!(heap.snapshot(), before);
            unsafe {
                assert_isomorphic(&heap, values[0], ext.root(), &mut HashMap::new());
            }
            free(ext);
        }
    }
}
