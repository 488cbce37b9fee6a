//! The uniform object header every heap-allocated value carries (the
//! meta-word) and the `Meta` descriptor it points to: size, variable-length
//! layout, and the pointer bitmaps the collector walks during tracing.

use bitflags::bitflags;
use codeswitch_derive::FromRepr;

use crate::utilities::enumerate_set_bits;

pub type Word = usize;

/// A word offset into the heap's flat address space. Word 0 is never a
/// valid block address (it is reserved, so `Addr(0)` can double as null).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub usize);

impl Addr {
	pub const NULL: Addr = Addr(0);

	pub const fn is_null(self) -> bool {
		self.0 == 0
	}

	pub const fn offset(self, words: usize) -> Addr {
		Addr(self.0 + words)
	}
}

/// Marker types `#[derive(BlockLayout)]` reads field types against when
/// computing a block's word offsets: `Ptr` for an object-pointer-bearing
/// slot, `Slot` for a plain data word. Neither is ever constructed.
pub struct Ptr;
pub struct Slot;

/// A typed reference to a heap block. Typed access goes through a view
/// wrapper (`FunctionView`, `TypeView`, ...) that pairs the address with a
/// `&Heap`; `Block` itself carries no type information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block(pub Addr);

/// Discriminates the built-in kinds of block. `Meta` is the only kind that
/// can appear as an `EncodedRoot` meta-word, since the Meta describing
/// Metas (the meta-meta) cannot point at a heap-allocated Meta of its own
/// without already existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(usize)]
pub enum BlockType {
	Meta = 0,
	Class = 1,
	TypeParameter = 2,
	Function = 3,
	Stack = 4,
	Package = 5,
	ByteArray = 6,
	WordArray = 7,
	String = 8,
	Object = 9,
}

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct MetaFlags: u64 {
		const HAS_POINTERS = 1 << 0;
		const HAS_ELEMENT_POINTERS = 1 << 1;
		const NEEDS_RELOCATION = 1 << 2;
	}
}

const TAG_MASK: usize = 0b11;
const TAG_REGULAR: usize = 0b00;
const TAG_ENCODED_ROOT: usize = 0b01;

/// The decoded contents of a meta-word: either a pointer at a
/// heap-allocated `Meta` block (the common case) or a `BlockType`
/// discriminant encoded directly in the word (used only to bootstrap the
/// meta-meta, per the low-tag scheme fixed in this crate's design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaWord {
	Regular(Addr),
	EncodedRoot(BlockType),
}

impl MetaWord {
	pub fn decode(raw: usize) -> MetaWord {
		match raw & TAG_MASK {
			TAG_REGULAR => MetaWord::Regular(Addr(raw >> 2)),
			TAG_ENCODED_ROOT => {
				let discriminant = raw >> 2;
				let block_type = BlockType::from_repr(discriminant)
					.unwrap_or_else(|| panic!("corrupt encoded root meta-word: discriminant {discriminant}"));
				MetaWord::EncodedRoot(block_type)
			}
			tag => panic!("corrupt meta-word tag: {tag:#04b}"),
		}
	}

	pub fn encode(self) -> usize {
		match self {
			MetaWord::Regular(addr) => (addr.0 << 2) | TAG_REGULAR,
			MetaWord::EncodedRoot(block_type) => ((block_type as usize) << 2) | TAG_ENCODED_ROOT,
		}
	}
}

/// Sentinel for `Meta::length_offset` on fixed-size blocks (no element
/// count field to read).
pub const NO_LENGTH_OFFSET: usize = usize::MAX;

/// The descriptor every block's meta-word resolves to (directly, or via
/// `EncodedRoot` for the meta-meta). Stored in the heap in the same word
/// format `decode`/`encode` convert to and from; `Heap::read_meta` owns the
/// actual heap read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
	pub block_type: BlockType,
	pub instance_size: usize,
	pub element_size: usize,
	pub length_offset: usize,
	pub flags: MetaFlags,
	pub object_pointer_map: Vec<u64>,
	pub element_pointer_map: Vec<u64>,
}

impl Meta {
	pub fn fixed(block_type: BlockType, instance_size: usize, object_pointer_map: Vec<u64>) -> Meta {
		let flags = if object_pointer_map.iter().any(|w| *w != 0) {
			MetaFlags::HAS_POINTERS
		} else {
			MetaFlags::empty()
		};
		Meta {
			block_type,
			instance_size,
			element_size: 0,
			length_offset: NO_LENGTH_OFFSET,
			flags,
			object_pointer_map,
			element_pointer_map: Vec::new(),
		}
	}

	pub fn has_pointers(&self) -> bool {
		self.flags.contains(MetaFlags::HAS_POINTERS)
	}

	pub fn has_element_pointers(&self) -> bool {
		self.flags.contains(MetaFlags::HAS_ELEMENT_POINTERS)
	}

	pub fn is_variable_length(&self) -> bool {
		self.length_offset != NO_LENGTH_OFFSET
	}

	/// Total word size of an instance holding `length` elements (`length`
	/// is ignored for fixed-size blocks).
	pub fn size_of(&self, length: usize) -> usize {
		self.instance_size + self.element_size * length
	}

	/// Absolute word offsets (from the block's own start, meta-word = 0)
	/// of every object-pointer-bearing field.
	pub fn object_pointer_offsets(&self) -> impl Iterator<Item = usize> + '_ {
		self.object_pointer_map
			.iter()
			.enumerate()
			.flat_map(|(chunk, bits)| enumerate_set_bits(*bits).map(move |bit| chunk * 64 + bit))
	}

	/// Word offsets *within a single element* of every pointer-bearing
	/// field of that element.
	pub fn element_pointer_offsets(&self) -> impl Iterator<Item = usize> + '_ {
		self.element_pointer_map
			.iter()
			.enumerate()
			.flat_map(|(chunk, bits)| enumerate_set_bits(*bits).map(move |bit| chunk * 64 + bit))
	}

	/// Encodes this descriptor as the words `Heap::read_meta` expects to
	/// find starting right after a Meta block's own meta-word.
	pub fn encode(&self) -> Vec<Word> {
		let mut out = Vec::with_capacity(6 + self.object_pointer_map.len() + self.element_pointer_map.len());
		out.push(self.block_type as usize);
		out.push(self.instance_size);
		out.push(self.element_size);
		out.push(self.length_offset);
		out.push(self.flags.bits() as usize);
		out.push(self.object_pointer_map.len());
		out.extend(self.object_pointer_map.iter().map(|w| *w as usize));
		out.push(self.element_pointer_map.len());
		out.extend(self.element_pointer_map.iter().map(|w| *w as usize));
		out
	}

	pub fn decode(words: &[Word]) -> Meta {
		let block_type = BlockType::from_repr(words[0]).expect("corrupt meta: unknown block type");
		let instance_size = words[1];
		let element_size = words[2];
		let length_offset = words[3];
		let flags = MetaFlags::from_bits_truncate(words[4] as u64);
		let object_map_len = words[5];
		let mut cursor = 6;
		let object_pointer_map: Vec<u64> = words[cursor..cursor + object_map_len].iter().map(|w| *w as u64).collect();
		cursor += object_map_len;
		let element_map_len = words[cursor];
		cursor += 1;
		let element_pointer_map: Vec<u64> = words[cursor..cursor + element_map_len].iter().map(|w| *w as u64).collect();
		Meta {
			block_type,
			instance_size,
			element_size,
			length_offset,
			flags,
			object_pointer_map,
			element_pointer_map,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn meta_word_round_trips_regular() {
		let word = MetaWord::Regular(Addr(128));
		assert_eq!(MetaWord::decode(word.encode()), word);
	}

	#[test]
	fn meta_word_round_trips_encoded_root() {
		let word = MetaWord::EncodedRoot(BlockType::Meta);
		assert_eq!(MetaWord::decode(word.encode()), word);
	}

	#[test]
	fn meta_round_trips_through_encode_decode() {
		let meta = Meta {
			block_type: BlockType::Object,
			instance_size: 6,
			element_size: 3,
			length_offset: 1,
			flags: MetaFlags::HAS_POINTERS | MetaFlags::HAS_ELEMENT_POINTERS,
			object_pointer_map: vec![0x34],
			element_pointer_map: vec![0x5],
		};
		let words = meta.encode();
		assert_eq!(Meta::decode(&words), meta);
	}

	#[test]
	fn object_pointer_offsets_matches_worked_example() {
		let meta = Meta::fixed(BlockType::Object, 6, vec![0x34]);
		let offsets: Vec<usize> = meta.object_pointer_offsets().collect();
		assert_eq!(offsets, vec![2, 4, 5]);
	}

	#[test]
	fn size_of_accounts_for_elements() {
		let meta = Meta {
			block_type: BlockType::WordArray,
			instance_size: 6,
			element_size: 3,
			length_offset: 1,
			flags: MetaFlags::empty(),
			object_pointer_map: vec![0],
			element_pointer_map: vec![0],
		};
		assert_eq!(meta.size_of(2), 12);
	}
}
