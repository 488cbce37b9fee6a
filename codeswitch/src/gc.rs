//! Assembles the VM's complete root set - well-known blocks, loaded
//! package tables, handle slots, and the live reference slots of every
//! stack frame - drives `Heap::collect` over it, and writes every forwarded
//! address back where it came from. `Heap::collect` itself only understands
//! a flat list of root values; everything about *where* those values live
//! (and the stack's own post-copy relocation) is handled here.

use crate::block::Addr;
use crate::errors::HeapError;
use crate::function::FunctionBlueprint;
use crate::handle::HandleStorage;
use crate::heap::Heap;
use crate::roots::Roots;
use crate::stack;
use crate::visitor::BlockVisitor;

/// Fraction of the heap a collection must leave free for the heap to hold
/// its current capacity; below that, capacity doubles (up to the heap's
/// growth limit) before the allocation is retried.
const GROWTH_THRESHOLD: f64 = 0.25;

/// Every place the VM keeps a block address that must survive (and be
/// rewritten by) a collection. The slices are the VM's loaded-package
/// tables; `functions` is only read, for the frame scan's pointer maps.
pub struct RootSet<'a> {
	pub roots: &'a mut Roots,
	pub classes: &'a mut [Addr],
	pub element_metas: &'a mut [Addr],
	pub type_parameters: &'a mut [Addr],
	pub handles: &'a HandleStorage,
	pub stack: &'a mut Addr,
	pub functions: &'a [FunctionBlueprint],
}

struct FrameSlotCollector {
	slots: Vec<Addr>,
}

impl BlockVisitor for FrameSlotCollector {
	fn visit_pointer(&mut self, _heap: &mut Heap, slot: Addr) {
		self.slots.push(slot);
	}
}

/// One full stop-the-world collection over `set`. Returns the live word
/// count `Heap::collect` reports.
pub fn collect(heap: &mut Heap, set: &mut RootSet<'_>) -> usize {
	// The frame scan runs against the pre-collection stack; the slot
	// addresses it yields are translated by the stack's own move delta
	// when the forwarded values are written back below.
	let mut collector = FrameSlotCollector { slots: Vec::new() };
	if !set.stack.is_null() {
		stack::visit_frames(heap, *set.stack, set.functions, &mut collector);
	}
	let frame_slots = collector.slots;

	// Gather phase: one flat value list, in a fixed order the scatter
	// phase below repeats exactly.
	let mut values: Vec<Addr> = Vec::new();
	set.roots.for_each_mut(|addr| values.push(*addr));
	values.extend_from_slice(set.classes);
	values.extend_from_slice(set.element_metas);
	values.extend_from_slice(set.type_parameters);
	values.push(*set.stack);
	set.handles.for_each_local_mut(|addr| values.push(*addr));
	set.handles.for_each_persistent_mut(|addr| values.push(*addr));
	let frame_values_at = values.len();
	for slot in &frame_slots {
		values.push(Addr(heap.word_at(*slot)));
	}

	let stack_before = *set.stack;
	let live = heap.collect(&mut values);

	// Scatter phase.
	let mut cursor = 0;
	let mut next = |values: &[Addr]| {
		let value = values[cursor];
		cursor += 1;
		value
	};
	set.roots.for_each_mut(|addr| *addr = next(&values));
	for class in set.classes.iter_mut() {
		*class = next(&values);
	}
	for meta in set.element_metas.iter_mut() {
		*meta = next(&values);
	}
	for type_parameter in set.type_parameters.iter_mut() {
		*type_parameter = next(&values);
	}
	*set.stack = next(&values);
	set.handles.for_each_local_mut(|addr| *addr = next(&values));
	set.handles.for_each_persistent_mut(|addr| *addr = next(&values));

	// The copy phase moved the stack as an opaque block; its sp, fp, and
	// saved-fp chain still hold pre-move addresses until `relocate` shifts
	// them by the move delta.
	for (old_addr, new_addr) in heap.take_relocations() {
		let delta = new_addr.0 as isize - old_addr.0 as isize;
		stack::relocate(heap, new_addr, delta);
	}

	// Frame reference slots are not covered by any Meta bitmap, so the
	// generic fix-up pass never rewrote them; do it here, at each slot's
	// post-move address.
	let stack_delta = set.stack.0 as isize - stack_before.0 as isize;
	for (i, slot) in frame_slots.iter().enumerate() {
		let moved_slot = Addr((slot.0 as isize + stack_delta) as usize);
		heap.set_word_at(moved_slot, values[frame_values_at + i].0);
	}

	live
}

fn collect_and_maybe_grow(heap: &mut Heap, set: &mut RootSet<'_>) -> usize {
	let live = collect(heap, set);
	if live as f64 / heap.capacity() as f64 > 1.0 - GROWTH_THRESHOLD {
		heap.grow(heap.capacity() * 2);
	}
	live
}

/// Allocates `words` zeroed words, collecting (and growing, per the
/// policy above) if the heap is full. Every caller is at a safepoint: the
/// current frame's pc must already be committed and every native-held
/// reference rooted, since any allocation may move every block.
pub fn allocate(heap: &mut Heap, words: usize, set: &mut RootSet<'_>) -> Result<Addr, HeapError> {
	if heap.collect_every_allocation() {
		collect_and_maybe_grow(heap, set);
	} else if let Ok(addr) = heap.allocate(words) {
		return Ok(addr);
	} else {
		collect_and_maybe_grow(heap, set);
	}

	match heap.allocate(words) {
		Ok(addr) => Ok(addr),
		Err(_) => {
			// Last resort for a request larger than the post-collection
			// free space: grow straight to what this allocation needs (the
			// limit still caps it, so exhaustion stays reachable).
			heap.grow((heap.capacity() * 2).max(heap.capacity() + words));
			heap.allocate(words)
		}
	}
}
