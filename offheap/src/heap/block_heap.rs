use {
    super::{Block, DEFAULT_BLOCK_SIZE, ManagedHeap},
    crate::value::{Color, HEADER_SIZE, Header, Tag, Value, WORD_SIZE},
    std::{cell::RefCell, ptr},
};

/// Generation in which to allocate a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Generation
{
    /// Long-lived nodes.
    Major,

    /// Newly allocated nodes that have not been promoted yet.
    Young,
}

/// Managed heap made of bump-allocated blocks.
///
/// Nodes are never moved or freed while the heap lives,
/// so it trivially meets the requirements of [`ManagedHeap`].
/// Nodes start out white, as a collector would expect.
pub struct BlockHeap
{
    major: RefCell<Vec<Block>>,
    young: RefCell<Vec<Block>>,
}

impl BlockHeap
{
    /// Create a heap without any blocks.
    pub fn new() -> Self
    {
        Self{
            major: RefCell::new(Vec::new()),
            young: RefCell::new(Vec::new()),
        }
    }

    /// Allocate a node in the major heap.
    pub fn alloc(&self, tag: Tag, fields: &[Value]) -> Value
    {
        self.alloc_in(Generation::Major, tag, fields)
    }

    /// Allocate a node in the young generation.
    pub fn alloc_young(&self, tag: Tag, fields: &[Value]) -> Value
    {
        self.alloc_in(Generation::Young, tag, fields)
    }

    /// Allocate a node in the given generation.
    pub fn alloc_in(&self, generation: Generation, tag: Tag, fields: &[Value])
        -> Value
    {
        let header = Header::new(fields.len(), Color::White, tag);
        self.alloc_raw(generation, header, |words| {
            for (word, field) in words.iter_mut().zip(fields) {
                *word = field.to_raw();
            }
        })
    }

    /// Allocate a [`Tag::STRING`] node holding the given bytes.
    pub fn alloc_string(&self, bytes: &[u8]) -> Value
    {
        let words = bytes.len() / WORD_SIZE + 1;
        let size = words * WORD_SIZE;
        let padding = size - 1 - bytes.len();
        let header = Header::new(words, Color::White, Tag::STRING);
        self.alloc_raw(Generation::Major, header, |words| {
            let ptr = words.as_mut_ptr().cast::<u8>();
            // SAFETY: The payload is size bytes long.
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                *ptr.add(size - 1) = padding as u8;
            }
        })
    }

    /// Allocate a [`Tag::DOUBLE`] node holding the given number.
    pub fn alloc_double(&self, number: f64) -> Value
    {
        let header = Header::new(1, Color::White, Tag::DOUBLE);
        self.alloc_raw(Generation::Major, header, |words| {
            words[0] = number.to_bits() as usize;
        })
    }

    /// Overwrite a field of a node in this heap.
    ///
    /// # Panics
    ///
    /// Panics if the node is not in this heap
    /// or the index is out of bounds.
    pub fn set_field(&self, node: Value, index: usize, value: Value)
    {
        assert!(self.is_in_heap_or_young(node), "Node is not in this heap");
        // SAFETY: The node is in this heap, so it is live.
        unsafe {
            assert!(index < node.header().fields(), "Field out of bounds");
            node.set_field(index, value);
        }
    }

    /// Move every young block into the major heap.
    ///
    /// Nodes keep their addresses.
    pub fn promote(&self)
    {
        let mut young = self.young.borrow_mut();
        self.major.borrow_mut().extend(young.drain(..));
    }

    /// Copy every word of every allocated node.
    ///
    /// Two snapshots are equal if and only if
    /// no header or field changed in between,
    /// as long as nothing was allocated in between.
    pub fn snapshot(&self) -> Vec<usize>
    {
        let major = self.major.borrow();
        let young = self.young.borrow();
        major.iter().chain(young.iter())
            .flat_map(|block| block.words().iter().copied())
            .collect()
    }

    fn alloc_raw<F>(&self, generation: Generation, header: Header, init: F)
        -> Value
        where F: FnOnce(&mut [usize])
    {
        let size = header.size_in_bytes();

        let mut blocks = match generation {
            Generation::Major => self.major.borrow_mut(),
            Generation::Young => self.young.borrow_mut(),
        };

        let ptr = match blocks.last_mut().and_then(|b| b.try_alloc(size)) {
            Some(ptr) => ptr,
            None => {
                let mut block = Block::with_capacity(size.max(DEFAULT_BLOCK_SIZE));
                let ptr = block.try_alloc(size)
                    .expect("New block should be big enough");
                blocks.push(block);
                ptr
            },
        };

        // SAFETY: ptr points to size fresh, zeroed, aligned bytes.
        unsafe {
            *ptr.as_ptr() = header.to_raw();
            let fields = ptr.as_ptr().add(1);
            init(std::slice::from_raw_parts_mut(fields, header.fields()));
            Value::from_ptr((ptr.as_ptr() as usize + HEADER_SIZE) as *const usize)
        }
    }

    fn contains(blocks: &RefCell<Vec<Block>>, addr: usize) -> bool
    {
        // Classify by header, since a node without fields
        // points just past its own end.
        let header = addr.wrapping_sub(HEADER_SIZE);
        blocks.borrow().iter().any(|block| block.contains(header))
    }
}

unsafe impl ManagedHeap for BlockHeap
{
    fn is_in_heap(&self, addr: usize) -> bool
    {
        Self::contains(&self.major, addr)
    }

    fn is_young(&self, addr: usize) -> bool
    {
        Self::contains(&self.young, addr)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn alloc_writes_header_and_fields()
    {
        let heap = BlockHeap::new();
        let leaf = heap.alloc(Tag(1), &[Value::from_int(7)]);
        let node = heap.alloc(Tag(0), &[leaf, Value::from_int(-3)]);
        unsafe {
            assert_eq!(node.header(), Header::new(2, Color::White, Tag(0)));
            assert_eq!(node.field(0), leaf);
            assert_eq!(node.field(1).to_int(), Some(-3));
            assert_eq!(leaf.field(0).to_int(), Some(7));
        }
    }

    #[test]
    fn generations_are_classified()
    {
        let heap = BlockHeap::new();
        let old = heap.alloc(Tag(0), &[Value::UNIT]);
        let new = heap.alloc_young(Tag(0), &[Value::UNIT]);
        assert!(heap.is_in_heap(old.addr()) && !heap.is_young(old.addr()));
        assert!(heap.is_young(new.addr()) && !heap.is_in_heap(new.addr()));
        assert!(!heap.is_in_heap_or_young(Value::from_int(5)));

        heap.promote();
        assert!(heap.is_in_heap(new.addr()) && !heap.is_young(new.addr()));
    }

    #[test]
    fn strings_round_trip_at_every_padding()
    {
        let heap = BlockHeap::new();
        for len in 0 .. 3 * WORD_SIZE {
            let bytes: Vec<u8> = (0 .. len as u8).collect();
            let string = heap.alloc_string(&bytes);
            unsafe { assert_eq!(string.string_bytes(), &bytes[..]); }
        }
    }

    #[test]
    fn large_nodes_get_their_own_block()
    {
        let heap = BlockHeap::new();
        let fields = vec![Value::UNIT; 2 * DEFAULT_BLOCK_SIZE / WORD_SIZE];
        let big = heap.alloc(Tag(0), &fields);
        let small = heap.alloc(Tag(0), &[]);
        unsafe { assert_eq!(big.fields().len(), fields.len()); }
        assert!(heap.is_in_heap(big.addr()));
        assert!(heap.is_in_heap(small.addr()));
    }

    #[test]
    fn snapshot_observes_mutation()
    {
        let heap = BlockHeap::new();
        let node = heap.alloc(Tag(0), &[Value::UNIT]);
        let before = heap.snapshot();
        heap.set_field(node, 0, Value::from_int(1));
        assert_ne!(heap.snapshot(), before);
        heap.set_field(node, 0, Value::UNIT);
        assert_eq!(heap.snapshot(), before);
    }
}
