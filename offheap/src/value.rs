//! Word-level representation of managed-heap objects.
//!
//! A [value][`Value`] is a single machine word.
//! If its lowest bit is set, it is an immediate integer.
//! Otherwise it is a pointer to the first field of a node,
//! which is preceded in memory by a [header][`Header`].
//!
//! ```text
//!            value
//!              |
//!              v
//! +--------+---------+---------+-----+---------+
//! | header | field 0 | field 1 | ... | field n |
//! +--------+---------+---------+-----+---------+
//! ```
//!
//! Externalized copies use exactly the same layout,
//! so a value that points into an arena can be read
//! with the same methods as a value that points into the heap.

use std::{fmt, mem::size_of, slice};

/// Number of bytes in a word.
pub const WORD_SIZE: usize = size_of::<usize>();

/// Number of bytes in a header.
pub const HEADER_SIZE: usize = WORD_SIZE;

/* -------------------------------------------------------------------------- */
/*                                    Tags                                    */
/* -------------------------------------------------------------------------- */

/// Type tag stored in a header.
///
/// Tags below [`Tag::NO_SCAN`] mark nodes whose fields are values.
/// The remaining tags mark nodes whose fields are raw payload.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tag(pub u8);

impl Tag
{
    /// First tag whose fields are not scanned.
    pub const NO_SCAN: Self = Self(251);

    /// Opaque payload.
    pub const ABSTRACT: Self = Self(251);

    /// Byte string payload.
    pub const STRING: Self = Self(252);

    /// Floating-point payload.
    pub const DOUBLE: Self = Self(253);

    /// Whether the fields of nodes with this tag are values.
    pub fn is_scannable(self) -> bool
    {
        self < Self::NO_SCAN
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Colors                                   */
/* -------------------------------------------------------------------------- */

/// Collector color stored in a header.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Color
{
    White = 0,
    Gray  = 1,
    Blue  = 2,

    /// Also used for externalized copies,
    /// which collectors must never scan or free.
    Black = 3,
}

impl Color
{
    fn from_bits(bits: usize) -> Self
    {
        match bits & 0b11 {
            0 => Self::White,
            1 => Self::Gray,
            2 => Self::Blue,
            _ => Self::Black,
        }
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Headers                                  */
/* -------------------------------------------------------------------------- */

const TAG_BITS:   usize = 8;
const COLOR_BITS: usize = 2;
const SIZE_SHIFT: usize = TAG_BITS + COLOR_BITS;

/// Header word preceding the fields of a node.
///
/// Bits 0 to 7 hold the tag, bits 8 and 9 hold the color,
/// and the remaining bits hold the number of fields.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Header(usize);

impl Header
{
    /// Header written over a node while a traversal has visited it.
    ///
    /// [`Header::new`] never produces this bit pattern.
    pub const VISITED: Self = Self(usize::MAX);

    /// Largest number of fields a node may have.
    pub const MAX_FIELDS: usize = (usize::MAX >> SIZE_SHIFT) - 1;

    /// Create a header.
    ///
    /// # Panics
    ///
    /// Panics if `fields` exceeds [`Header::MAX_FIELDS`].
    pub fn new(fields: usize, color: Color, tag: Tag) -> Self
    {
        assert!(fields <= Self::MAX_FIELDS, "Node has too many fields");
        Self(fields << SIZE_SHIFT | (color as usize) << TAG_BITS | tag.0 as usize)
    }

    /// Reinterpret a word as a header.
    pub const fn from_raw(word: usize) -> Self
    {
        Self(word)
    }

    /// The header as a word.
    pub const fn to_raw(self) -> usize
    {
        self.0
    }

    /// Number of fields that follow the header.
    pub fn fields(self) -> usize
    {
        self.0 >> SIZE_SHIFT
    }

    /// Type tag of the node.
    pub fn tag(self) -> Tag
    {
        Tag(self.0 as u8)
    }

    /// Collector color of the node.
    pub fn color(self) -> Color
    {
        Color::from_bits(self.0 >> TAG_BITS)
    }

    /// The same header with a different color.
    pub fn with_color(self, color: Color) -> Self
    {
        let mask = 0b11 << TAG_BITS;
        Self(self.0 & !mask | (color as usize) << TAG_BITS)
    }

    /// Number of bytes taken by the header and the fields.
    pub fn size_in_bytes(self) -> usize
    {
        HEADER_SIZE + self.fields() * WORD_SIZE
    }
}

impl fmt::Debug for Header
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        if *self == Self::VISITED {
            return write!(f, "Header(VISITED)");
        }
        f.debug_struct("Header")
            .field("fields", &self.fields())
            .field("color", &self.color())
            .field("tag", &self.tag().0)
            .finish()
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Values                                   */
/* -------------------------------------------------------------------------- */

/// Immediate integer or pointer to a node.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Value(usize);

impl Value
{
    /// The integer zero.
    pub const UNIT: Self = Self::from_int(0);

    /// Create an immediate integer.
    ///
    /// The topmost bit of `n` is lost.
    pub const fn from_int(n: isize) -> Self
    {
        Self((n as usize) << 1 | 1)
    }

    /// Reinterpret a word as a value.
    pub const fn from_raw(word: usize) -> Self
    {
        Self(word)
    }

    /// Create a value that points at the first field of a node.
    pub fn from_ptr(ptr: *const usize) -> Self
    {
        debug_assert!(ptr as usize % WORD_SIZE == 0);
        Self(ptr as usize)
    }

    /// The value as a word.
    pub const fn to_raw(self) -> usize
    {
        self.0
    }

    /// Whether the value is an immediate integer.
    pub const fn is_int(self) -> bool
    {
        self.0 & 1 == 1
    }

    /// Whether the value is a pointer to a node.
    pub const fn is_block(self) -> bool
    {
        !self.is_int()
    }

    /// The immediate integer, if this is one.
    pub const fn to_int(self) -> Option<isize>
    {
        if self.is_int() { Some(self.0 as isize >> 1) } else { None }
    }

    /// Address of the first field of the node.
    pub fn addr(self) -> usize
    {
        self.0
    }

    /// Pointer to the header of the node.
    pub fn header_ptr(self) -> *mut usize
    {
        (self.0 - HEADER_SIZE) as *mut usize
    }

    /// Pointer to a field of the node.
    pub fn field_ptr(self, index: usize) -> *mut usize
    {
        (self.0 + index * WORD_SIZE) as *mut usize
    }

    /// Read the header of the node.
    ///
    /// # Safety
    ///
    /// The value must point to a live node.
    pub unsafe fn header(self) -> Header
    {
        Header(*self.header_ptr())
    }

    /// Overwrite the header of the node.
    ///
    /// # Safety
    ///
    /// The value must point to a live, writable node.
    pub unsafe fn set_header(self, header: Header)
    {
        *self.header_ptr() = header.0;
    }

    /// Read a field of the node.
    ///
    /// # Safety
    ///
    /// The value must point to a live node with more than `index` fields.
    pub unsafe fn field(self, index: usize) -> Value
    {
        Value(*self.field_ptr(index))
    }

    /// Overwrite a field of the node.
    ///
    /// # Safety
    ///
    /// The value must point to a live, writable node
    /// with more than `index` fields.
    pub unsafe fn set_field(self, index: usize, value: Value)
    {
        *self.field_ptr(index) = value.0;
    }

    /// The fields of the node.
    ///
    /// # Safety
    ///
    /// The value must point to a live node that outlives `'a`,
    /// and nobody may write to it during `'a`.
    pub unsafe fn fields<'a>(self) -> &'a [Value]
    {
        let len = self.header().fields();
        slice::from_raw_parts(self.0 as *const Value, len)
    }

    /// The bytes of a [`Tag::STRING`] node.
    ///
    /// The last byte of the payload stores the amount of padding,
    /// so any byte string fits regardless of its length.
    /// A string node without fields holds no bytes.
    ///
    /// # Safety
    ///
    /// The value must point to a live string node that outlives `'a`.
    pub unsafe fn string_bytes<'a>(self) -> &'a [u8]
    {
        let size = self.header().fields() * WORD_SIZE;
        if size == 0 {
            return &[];
        }
        let payload = slice::from_raw_parts(self.0 as *const u8, size);
        let padding = payload[size - 1] as usize;
        &payload[.. size - 1 - padding]
    }

    /// The number in a [`Tag::DOUBLE`] node.
    ///
    /// # Safety
    ///
    /// The value must point to a live double node.
    pub unsafe fn double(self) -> f64
    {
        f64::from_bits(*self.field_ptr(0) as u64)
    }
}

impl fmt::Debug for Value
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self.to_int() {
            Some(n) => write!(f, "Int({n})"),
            None    => write!(f, "Block({:#x})", self.0),
        }
    }
}
