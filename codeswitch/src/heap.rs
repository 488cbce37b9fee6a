//! Page-based bump allocation over a flat, word-addressed space, plus a
//! stop-the-world copying collection cycle: root enumeration, trace and
//! relocate, then a fix-up pass over everything that still points at an
//! old address.

use std::cell::Cell;
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::block::{Addr, BlockType, Meta, MetaFlags, MetaWord, Word, NO_LENGTH_OFFSET};
use crate::errors::HeapError;
use crate::visitor::{visit_block, BlockVisitor};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// How far `grow` may take a heap beyond its initial capacity before
/// allocation failures become permanent and surface as `OutOfMemory`.
const DEFAULT_GROWTH_HEADROOM: usize = 16;

pub struct Heap {
	space: Vec<Word>,
	bump: usize,
	capacity: usize,
	capacity_limit: usize,
	allocation_gate: Rc<Cell<bool>>,
	collect_every_allocation: bool,
	pending_relocations: Vec<(Addr, Addr)>,
}

impl Heap {
	pub fn new(initial_capacity_words: usize) -> Heap {
		Heap::with_capacity(initial_capacity_words)
	}

	pub fn with_capacity(initial_capacity_words: usize) -> Heap {
		let capacity = initial_capacity_words.max(1);
		let mut space = vec![0; capacity];
		space[0] = 0; // word 0 is reserved; Addr(0) doubles as null.
		Heap {
			space,
			bump: 1,
			capacity,
			capacity_limit: capacity.saturating_mul(DEFAULT_GROWTH_HEADROOM),
			allocation_gate: Rc::new(Cell::new(false)),
			collect_every_allocation: false,
			pending_relocations: Vec::new(),
		}
	}

	pub fn set_capacity_limit(&mut self, limit_words: usize) {
		self.capacity_limit = limit_words.max(self.capacity);
	}

	pub fn set_collect_every_allocation(&mut self, enabled: bool) {
		self.collect_every_allocation = enabled;
	}

	pub fn collect_every_allocation(&self) -> bool {
		self.collect_every_allocation
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn word_at(&self, addr: Addr) -> Word {
		self.space[addr.0]
	}

	pub fn set_word_at(&mut self, addr: Addr, value: Word) {
		self.space[addr.0] = value;
	}

	pub fn meta_word_of(&self, block: Addr) -> MetaWord {
		MetaWord::decode(self.space[block.0])
	}

	pub fn set_meta_word(&mut self, block: Addr, word: MetaWord) {
		self.space[block.0] = word.encode();
	}

	pub fn read_meta(&self, meta_addr: Addr) -> Meta {
		Meta::decode(&self.space[meta_addr.0 + 1..])
	}

	/// Resolves a block's meta-word to its full descriptor, handling both
	/// heap-allocated metas (`Regular`) and the canonical shape every
	/// `Meta` block itself carries (`EncodedRoot(BlockType::Meta)`), which
	/// has no heap instance to avoid an infinite regress of metas
	/// describing metas.
	pub fn meta_of_block(&self, block: Addr) -> Meta {
		match self.meta_word_of(block) {
			MetaWord::Regular(addr) => self.read_meta(addr),
			MetaWord::EncodedRoot(BlockType::Meta) => meta_describing_metas(),
			MetaWord::EncodedRoot(other) => panic!("no heap-free descriptor for encoded root {other:?}"),
		}
	}

	/// Total word size of the `Meta` block at `addr`, computed from its
	/// own length-prefixed sections directly since a `Meta`'s size is not
	/// expressible as `instance_size + element_size * length`.
	fn meta_block_word_size(&self, addr: Addr) -> usize {
		let object_map_len = self.space[addr.0 + 6];
		let element_map_len_at = addr.0 + 7 + object_map_len;
		let element_map_len = self.space[element_map_len_at];
		1 + 6 + object_map_len + 1 + element_map_len
	}

	fn block_word_size(&self, addr: Addr) -> usize {
		if let MetaWord::EncodedRoot(BlockType::Meta) = self.meta_word_of(addr) {
			return self.meta_block_word_size(addr);
		}
		let meta = self.meta_of_block(addr);
		if meta.is_variable_length() {
			let length = self.word_at(addr.offset(meta.length_offset));
			meta.size_of(length)
		} else {
			meta.size_of(0)
		}
	}

	fn reserve(&mut self, words: usize) -> Result<Addr, HeapError> {
		assert!(
			self.allocation_gate.get(),
			"allocation outside an AllowAllocationScope: native code still holds raw pointers"
		);
		if self.bump + words > self.capacity {
			return Err(HeapError::OutOfMemory { requested_words: words });
		}
		let addr = Addr(self.bump);
		self.bump += words;
		Ok(addr)
	}

	pub fn grow(&mut self, new_capacity_words: usize) {
		let new_capacity = new_capacity_words.min(self.capacity_limit);
		if new_capacity > self.capacity {
			self.space.resize(new_capacity, 0);
			self.capacity = new_capacity;
		}
	}

	/// Allocates `words` zeroed words with no meta-word semantics attached;
	/// the caller sets the meta-word itself.
	pub fn allocate(&mut self, words: usize) -> Result<Addr, HeapError> {
		let addr = self.reserve(words)?;
		self.space[addr.0..addr.0 + words].fill(0);
		Ok(addr)
	}

	/// Like `allocate` but skips zeroing. Only for callers that write every
	/// slot of the new block before the next safepoint; a collection walking
	/// a half-written block reads garbage as pointers.
	pub fn allocate_uninitialized(&mut self, words: usize) -> Result<Addr, HeapError> {
		self.reserve(words)
	}

	/// Allocates a new `Meta` block. Every `Meta` block's own meta-word is
	/// `EncodedRoot(BlockType::Meta)` - metas never point at a meta of
	/// their own, since they all share the same shape.
	pub fn allocate_meta(&mut self, meta: &Meta) -> Result<Addr, HeapError> {
		let words = meta.encode();
		let block = self.allocate_uninitialized(1 + words.len())?;
		self.set_meta_word(block, MetaWord::EncodedRoot(BlockType::Meta));
		for (i, word) in words.into_iter().enumerate() {
			self.set_word_at(block.offset(1 + i), word);
		}
		Ok(block)
	}

	/// Allocates a fixed-size instance of `meta`, zero-initialised.
	pub fn allocate_fixed(&mut self, meta_addr: Addr, meta: &Meta) -> Result<Addr, HeapError> {
		debug_assert!(!meta.is_variable_length());
		let block = self.allocate(meta.instance_size)?;
		self.set_meta_word(block, MetaWord::Regular(meta_addr));
		Ok(block)
	}

	/// Allocates a variable-length instance of `meta` holding `length`
	/// elements, and writes `length` into the block's length field.
	pub fn allocate_array(&mut self, meta_addr: Addr, meta: &Meta, length: usize) -> Result<Addr, HeapError> {
		debug_assert!(meta.is_variable_length());
		let block = self.allocate(meta.size_of(length))?;
		self.set_meta_word(block, MetaWord::Regular(meta_addr));
		self.set_word_at(block.offset(meta.length_offset), length);
		Ok(block)
	}

	/// Runs one stop-the-world copying collection: every block reachable
	/// from `roots` is copied into a fresh space in visitation order
	/// (collapsing garbage between survivors), then every surviving
	/// pointer - including in `roots` itself - is rewritten to the new
	/// address. Returns the number of live words copied.
	///
	/// `roots` here is a flat value list; assembling the full root set
	/// (handle slots, live frame slots, the VM's well-known blocks) and
	/// writing the forwarded values back where they came from is the
	/// `gc` module's job.
	#[cfg_attr(feature = "tracing", instrument(skip(self, roots)))]
	pub fn collect(&mut self, roots: &mut [Addr]) -> usize {
		let mut forwarding: FxHashMap<Addr, Addr> = FxHashMap::default();
		let mut worklist: Vec<Addr> = roots.to_vec();
		let mut new_space: Vec<Word> = vec![0; self.capacity];
		let mut new_bump = 1usize;

		// Copy every reachable block into new_space, discovering children
		// as we go (a breadth-first semi-space copy). `self.space` stays
		// the old space for the whole discovery pass.
		let mut cursor = 0;
		let mut order: Vec<(Addr, Addr)> = Vec::new();
		while cursor < worklist.len() {
			let addr = worklist[cursor];
			cursor += 1;
			if addr.is_null() || forwarding.contains_key(&addr) {
				continue;
			}
			let size = self.block_word_size(addr);
			let new_addr = Addr(new_bump);
			new_bump += size;
			new_space[new_addr.0..new_addr.0 + size].copy_from_slice(&self.space[addr.0..addr.0 + size]);
			forwarding.insert(addr, new_addr);
			order.push((addr, new_addr));

			let mut collector = DiscoveringVisitor { discovered: &mut worklist };
			visit_block(self, addr, &mut collector);
		}

		// Rewrite every surviving pointer to its forwarded address. Reads
		// come from the still-intact old space (`self`); writes land in
		// `new_space` at the block's new position, offset by the same
		// delta the block itself moved by.
		for &(addr, new_addr) in &order {
			let mut fixup = FixupVisitor {
				forwarding: &forwarding,
				new_space: &mut new_space,
				delta: new_addr.0 as isize - addr.0 as isize,
			};
			visit_block(self, addr, &mut fixup);
		}

		// Blocks whose Meta sets `NEEDS_RELOCATION` (Stack is the sole
		// built-in example) get a chance to patch internal self-references
		// after every other pointer has been fixed up. Read the Meta from
		// the still-intact old space, same as the fix-up pass above.
		self.pending_relocations.clear();
		for &(addr, new_addr) in &order {
			if self.meta_of_block(addr).flags.contains(MetaFlags::NEEDS_RELOCATION) {
				self.pending_relocations.push((addr, new_addr));
			}
		}

		self.space = new_space;
		self.bump = new_bump;
		for root in roots.iter_mut() {
			if let Some(&new_addr) = forwarding.get(root) {
				*root = new_addr;
			}
		}

		new_bump - 1
	}

	/// Blocks forwarded by the most recent `collect` whose Meta set
	/// `NEEDS_RELOCATION`, as `(old_addr, new_addr)` pairs. The caller that
	/// understands that block kind's internal layout (e.g. `stack::relocate`
	/// for `BlockType::Stack`) must patch it before the block is read again.
	pub fn take_relocations(&mut self) -> Vec<(Addr, Addr)> {
		std::mem::take(&mut self.pending_relocations)
	}
}

/// The cooperation token between native code that still holds raw block
/// addresses across statements (allocation disallowed: a collection would
/// invalidate them silently) and native code that has rooted everything it
/// needs through handles. Entered by the interpreter around each safepoint
/// allocation and by the VM around bootstrap and package loading; allocating
/// without one active aborts the process.
pub struct AllowAllocationScope {
	gate: Rc<Cell<bool>>,
	was_allowed: bool,
}

impl AllowAllocationScope {
	pub fn new(heap: &Heap) -> AllowAllocationScope {
		let gate = Rc::clone(&heap.allocation_gate);
		let was_allowed = gate.replace(true);
		AllowAllocationScope { gate, was_allowed }
	}
}

impl Drop for AllowAllocationScope {
	fn drop(&mut self) {
		self.gate.set(self.was_allowed);
	}
}

struct DiscoveringVisitor<'a> {
	discovered: &'a mut Vec<Addr>,
}

impl BlockVisitor for DiscoveringVisitor<'_> {
	fn visit_pointer(&mut self, heap: &mut Heap, slot: Addr) {
		let raw = heap.word_at(slot);
		if raw != 0 {
			self.discovered.push(Addr(raw));
		}
	}

	fn visit_meta_word(&mut self, heap: &mut Heap, block: Addr) {
		if let MetaWord::Regular(addr) = heap.meta_word_of(block) {
			self.discovered.push(addr);
		}
	}
}

/// Reads pointer slots from the (still old) heap passed to `visit_block`
/// and, for any that now have a forwarding address, writes the translated
/// value into `new_space` at the same slot shifted by `delta` - the offset
/// between the block's old and new address.
struct FixupVisitor<'a> {
	forwarding: &'a FxHashMap<Addr, Addr>,
	new_space: &'a mut Vec<Word>,
	delta: isize,
}

impl FixupVisitor<'_> {
	fn translate(&self, slot: Addr) -> usize {
		(slot.0 as isize + self.delta) as usize
	}
}

impl BlockVisitor for FixupVisitor<'_> {
	fn visit_pointer(&mut self, heap: &mut Heap, slot: Addr) {
		let raw = heap.word_at(slot);
		if raw == 0 {
			return;
		}
		if let Some(&new_addr) = self.forwarding.get(&Addr(raw)) {
			let new_slot = self.translate(slot);
			self.new_space[new_slot] = new_addr.0;
		}
	}

	fn visit_meta_word(&mut self, heap: &mut Heap, block: Addr) {
		if let MetaWord::Regular(meta_addr) = heap.meta_word_of(block) {
			if let Some(&new_meta_addr) = self.forwarding.get(&meta_addr) {
				let new_slot = self.translate(block);
				self.new_space[new_slot] = MetaWord::Regular(new_meta_addr).encode();
			}
		}
	}
}

/// The canonical, heap-free descriptor for every `Meta` block: a `Meta`
/// carries no managed pointers, only plain words (sizes, flags, packed
/// bitmap chunks), so the collector can copy one verbatim without tracing
/// into it.
fn meta_describing_metas() -> Meta {
	Meta {
		block_type: BlockType::Meta,
		instance_size: 0,
		element_size: 0,
		length_offset: NO_LENGTH_OFFSET,
		flags: MetaFlags::empty(),
		object_pointer_map: Vec::new(),
		element_pointer_map: Vec::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block::MetaFlags;

	fn object_meta() -> Meta {
		Meta {
			block_type: BlockType::Object,
			instance_size: 2,
			element_size: 0,
			length_offset: NO_LENGTH_OFFSET,
			flags: MetaFlags::HAS_POINTERS,
			object_pointer_map: vec![0b10],
			element_pointer_map: Vec::new(),
		}
	}

	#[test]
	fn allocate_fixed_sets_regular_meta_word() {
		let mut heap = Heap::with_capacity(64);
		let _allow = AllowAllocationScope::new(&heap);
		let meta_addr = heap.allocate_meta(&object_meta()).unwrap();
		let block = heap.allocate_fixed(meta_addr, &object_meta()).unwrap();
		assert_eq!(heap.meta_word_of(block), MetaWord::Regular(meta_addr));
	}

	#[test]
	#[should_panic(expected = "AllowAllocationScope")]
	fn allocating_outside_an_allow_allocation_scope_panics() {
		let mut heap = Heap::with_capacity(64);
		let _ = heap.allocate(2);
	}

	#[test]
	fn the_allocation_gate_is_restored_when_a_scope_exits() {
		let heap = Heap::with_capacity(64);
		{
			let _outer = AllowAllocationScope::new(&heap);
			let _inner = AllowAllocationScope::new(&heap);
		}
		assert!(!heap.allocation_gate.get());
	}

	#[test]
	fn collect_relocates_a_referenced_block_and_updates_the_pointer() {
		let mut heap = Heap::with_capacity(64);
		let _allow = AllowAllocationScope::new(&heap);
		let meta_addr = heap.allocate_meta(&object_meta()).unwrap();
		let child = heap.allocate_fixed(meta_addr, &object_meta()).unwrap();
		let parent = heap.allocate_fixed(meta_addr, &object_meta()).unwrap();
		heap.set_word_at(parent.offset(1), child.0);

		// Burn some space so relocation actually changes the child's address.
		let _garbage = heap.allocate_fixed(meta_addr, &object_meta()).unwrap();

		let mut roots = vec![parent];
		heap.collect(&mut roots);
		let relocated_parent = roots[0];
		let relocated_child = Addr(heap.word_at(relocated_parent.offset(1)));
		assert_ne!(relocated_child, child, "child must have moved for this test to be meaningful");
		assert_eq!(heap.meta_of_block(relocated_child), object_meta());
	}

	#[test]
	fn collect_drops_unreachable_blocks() {
		let mut heap = Heap::with_capacity(64);
		let _allow = AllowAllocationScope::new(&heap);
		let meta_addr = heap.allocate_meta(&object_meta()).unwrap();
		let _garbage = heap.allocate_fixed(meta_addr, &object_meta()).unwrap();
		let kept = heap.allocate_fixed(meta_addr, &object_meta()).unwrap();
		let mut roots = vec![kept];
		let live_words = heap.collect(&mut roots);
		// Surviving set is the kept block (2 words) plus the one meta
		// block it shares with the discarded garbage (9 words): the
		// garbage instance itself (2 words) is not counted.
		assert_eq!(live_words, 11);
	}
}
