//! Traversal behaviour of the generic block visitor against hand-built
//! blocks: the self-describing meta-word of `Meta` blocks, regular
//! meta-word rewriting, and pointer-map-driven scans of an elemented block.

use codeswitch::block::{Addr, BlockType, Meta, MetaFlags, MetaWord};
use codeswitch::heap::{AllowAllocationScope, Heap};
use codeswitch::visitor::{visit_block, BlockVisitor};

/// Adds 4 to the raw word of every pointer slot it is shown. 4 is one
/// word's worth in the meta-word encoding (`addr << 2`), so on a regular
/// meta-word it bumps the decoded address by exactly one word and leaves
/// the tag bits alone.
struct IncrementingVisitor {
	visit_meta_words: bool,
	visited: usize,
}

impl BlockVisitor for IncrementingVisitor {
	fn visit_pointer(&mut self, heap: &mut Heap, slot: Addr) {
		let word = heap.word_at(slot);
		heap.set_word_at(slot, word + 4);
		self.visited += 1;
	}

	fn visit_meta_word(&mut self, heap: &mut Heap, block: Addr) {
		if self.visit_meta_words {
			self.visit_pointer(heap, block);
		}
	}
}

#[test]
fn a_meta_block_s_encoded_meta_word_is_untouched_by_a_meta_skipping_visitor() {
	let mut heap = Heap::with_capacity(64);
	let _allow = AllowAllocationScope::new(&heap);
	let meta_addr = heap.allocate_meta(&Meta::fixed(BlockType::Object, 2, vec![0b10])).unwrap();

	let before = heap.word_at(meta_addr);
	let mut visitor = IncrementingVisitor { visit_meta_words: false, visited: 0 };
	visit_block(&mut heap, meta_addr, &mut visitor);

	// A Meta block has no pointer slots of its own (its bitmaps are plain
	// words), so nothing at all may have been visited, and its meta-word
	// still decodes to the self-describing root.
	assert_eq!(visitor.visited, 0);
	assert_eq!(heap.word_at(meta_addr), before);
	assert_eq!(heap.meta_word_of(meta_addr), MetaWord::EncodedRoot(BlockType::Meta));

	// Visiting is idempotent: a second pass changes nothing either.
	visit_block(&mut heap, meta_addr, &mut visitor);
	assert_eq!(heap.word_at(meta_addr), before);
}

#[test]
fn a_regular_meta_word_increments_by_one_word_without_losing_its_tag() {
	let mut heap = Heap::with_capacity(64);
	let _allow = AllowAllocationScope::new(&heap);
	let meta = Meta::fixed(BlockType::Object, 1, Vec::new());
	let meta_addr = heap.allocate_meta(&meta).unwrap();
	let block = heap.allocate_fixed(meta_addr, &meta).unwrap();

	let before = heap.word_at(block);
	let mut visitor = IncrementingVisitor { visit_meta_words: true, visited: 0 };
	visit_block(&mut heap, block, &mut visitor);

	assert_eq!(visitor.visited, 1);
	assert_eq!(heap.word_at(block), before + 4);
	assert_eq!(heap.meta_word_of(block), MetaWord::Regular(meta_addr.offset(1)));
}

#[test]
fn pointer_maps_select_exactly_the_marked_fixed_and_element_slots() {
	let mut heap = Heap::with_capacity(64);
	let _allow = AllowAllocationScope::new(&heap);
	// Six fixed words (meta-word, length, four more), then two elements of
	// three words each: twelve words in total. Fixed slots 2, 4, 5 and
	// element slots 0, 2 hold pointers.
	let meta = Meta {
		block_type: BlockType::WordArray,
		instance_size: 6,
		element_size: 3,
		length_offset: 1,
		flags: MetaFlags::HAS_POINTERS | MetaFlags::HAS_ELEMENT_POINTERS,
		object_pointer_map: vec![0x34],
		element_pointer_map: vec![0x5],
	};
	let meta_addr = heap.allocate_meta(&meta).unwrap();
	let block = heap.allocate_array(meta_addr, &meta, 2).unwrap();

	let mut visitor = IncrementingVisitor { visit_meta_words: false, visited: 0 };
	visit_block(&mut heap, block, &mut visitor);

	let words: Vec<usize> = (0..12).map(|i| heap.word_at(block.offset(i))).collect();
	let meta_word = heap.word_at(block);
	assert_eq!(words, vec![meta_word, 2, 4, 0, 4, 4, 4, 0, 4, 4, 0, 4]);
	assert_eq!(visitor.visited, 7);
}
