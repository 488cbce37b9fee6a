//! Uniform traversal of a block's pointer-bearing slots: the meta-word
//! itself, then the fixed region's object pointers, then (for
//! variable-length blocks) every element's pointers. The `Stack` block is
//! walked differently, by a frame-aware driver in `stack.rs` that consults
//! each frame's `StackPointerMap` instead of a static `Meta` bitmap.

use crate::block::Addr;
use crate::heap::Heap;

/// Receives each pointer-bearing slot `visit_block` finds. `visit_pointer`
/// is given the absolute word address of the slot, not its contents, so
/// implementations that relocate (write a new address into the slot) and
/// implementations that only read (mark, trace) share the same driver.
pub trait BlockVisitor {
	fn visit_pointer(&mut self, heap: &mut Heap, slot: Addr);

	/// Most visitors treat the meta-word like any other pointer-bearing
	/// slot; a visitor that needs different treatment (for instance, one
	/// that must not follow `EncodedRoot` meta-words) overrides this.
	fn visit_meta_word(&mut self, heap: &mut Heap, block: Addr) {
		self.visit_pointer(heap, block);
	}
}

/// Walks every pointer-bearing slot of `block` and feeds each to `visitor`.
/// The meta-word is resolved to an address *before* `visit_meta_word` runs,
/// since that call may overwrite the meta-word in place (as relocation
/// does).
pub fn visit_block<V: BlockVisitor>(heap: &mut Heap, block: Addr, visitor: &mut V) {
	let meta = heap.meta_of_block(block);
	visitor.visit_meta_word(heap, block);

	if meta.has_pointers() {
		for offset in meta.object_pointer_offsets() {
			visitor.visit_pointer(heap, block.offset(offset));
		}
	}

	if meta.is_variable_length() && meta.has_element_pointers() {
		let length = heap.word_at(block.offset(meta.length_offset));
		let element_offsets: Vec<usize> = meta.element_pointer_offsets().collect();
		for index in 0..length {
			let element_start = block.offset(meta.instance_size + index * meta.element_size);
			for offset in &element_offsets {
				visitor.visit_pointer(heap, element_start.offset(*offset));
			}
		}
	}
}
