//! The interpreter's call stack: a relocatable heap block holding chained
//! frames. Frame contents are not described by a static `Meta` bitmap (the
//! set of live reference slots changes with every instruction), so they are
//! walked by the frame-aware driver here instead of the generic
//! `BlockVisitor` traversal `visitor.rs` uses for every other block kind.

use crate::block::{Addr, BlockType, Meta, MetaFlags, NO_LENGTH_OFFSET};
use crate::function::FunctionBlueprint;
use crate::heap::Heap;
use crate::visitor::BlockVisitor;

/// Frame-control header word offsets, relative to a frame's `fp`. Matches
/// the layout every `enter`/`leave` call and every stack walk agrees on.
pub const FP_OFFSET: usize = 0;
pub const FUNCTION_OFFSET: usize = 1;
pub const CALLER_PC_OFFSET: usize = 2;
pub const FRAME_CONTROL_SIZE: usize = 3;

/// Sentinel `caller_pc` value on the outermost frame: there is no enclosing
/// pc to resume, and the walker stops after this frame.
pub const DONE_SENTINEL: usize = usize::MAX;

const SP_FIELD: usize = 1;
const FP_FIELD: usize = 2;
const LENGTH_FIELD: usize = 3;
const BODY_START: usize = 4;

/// The `Meta` for a stack of `capacity_words` body words. No pointer maps:
/// frame contents are traced by `visit_frames`, not the generic
/// `BlockVisitor` driver, which sees this block's `has_pointers()` as
/// false and skips its body entirely.
pub fn meta() -> Meta {
	Meta {
		block_type: BlockType::Stack,
		instance_size: BODY_START,
		element_size: 1,
		length_offset: LENGTH_FIELD,
		flags: MetaFlags::NEEDS_RELOCATION,
		object_pointer_map: Vec::new(),
		element_pointer_map: Vec::new(),
	}
}

pub fn allocate(heap: &mut Heap, meta_addr: Addr, capacity_words: usize) -> Addr {
	let m = meta();
	let block = heap.allocate_array(meta_addr, &m, capacity_words).expect("stack allocation failed");
	let body_start = block.offset(BODY_START);
	heap.set_word_at(block.offset(SP_FIELD), body_start.0);
	heap.set_word_at(block.offset(FP_FIELD), Addr::NULL.0);
	block
}

pub fn sp(heap: &Heap, stack: Addr) -> Addr {
	Addr(heap.word_at(stack.offset(SP_FIELD)))
}

fn set_sp(heap: &mut Heap, stack: Addr, value: Addr) {
	heap.set_word_at(stack.offset(SP_FIELD), value.0);
}

pub fn fp(heap: &Heap, stack: Addr) -> Addr {
	Addr(heap.word_at(stack.offset(FP_FIELD)))
}

pub fn set_fp(heap: &mut Heap, stack: Addr, value: Addr) {
	heap.set_word_at(stack.offset(FP_FIELD), value.0);
}

/// Pushes one word. Covers every `push<T>` instantiation the interpreter
/// needs (`i64`, `f64`-as-bits, `Addr`) since every managed value here is
/// exactly one word wide.
pub fn push(heap: &mut Heap, stack: Addr, value: usize) {
	let top = sp(heap, stack);
	let capacity = heap.word_at(stack.offset(LENGTH_FIELD));
	assert!(top.0 < stack.0 + BODY_START + capacity, "interpreter stack overflow");
	heap.set_word_at(top, value);
	set_sp(heap, stack, top.offset(1));
}

pub fn pop(heap: &mut Heap, stack: Addr) -> usize {
	let top = sp(heap, stack);
	let new_top = Addr(top.0 - 1);
	set_sp(heap, stack, new_top);
	heap.word_at(new_top)
}

/// Pushes the three-word frame-control header and makes the new frame
/// current. `caller_pc` is this function's own initial pc (`0`); it is
/// overwritten before every safepoint as execution proceeds.
pub fn enter(heap: &mut Heap, stack: Addr, function_index: usize, caller_pc: usize) {
	let new_fp = sp(heap, stack);
	let old_fp = fp(heap, stack);
	push(heap, stack, old_fp.0);
	push(heap, stack, function_index);
	push(heap, stack, caller_pc);
	set_fp(heap, stack, new_fp);
}

/// Overwrites the current frame's `caller_pc` slot - the write every
/// safepoint performs before it may allocate, so a concurrent stack walk
/// always sees an up-to-date pc for the paused frame.
pub fn set_caller_pc(heap: &mut Heap, stack: Addr, pc: usize) {
	let frame_fp = fp(heap, stack);
	heap.set_word_at(frame_fp.offset(CALLER_PC_OFFSET), pc);
}

/// Restores the caller's `fp` and truncates `sp` back to the frame that is
/// leaving, discarding its locals and operands.
pub fn leave(heap: &mut Heap, stack: Addr) {
	let current_fp = fp(heap, stack);
	let saved_fp = Addr(heap.word_at(current_fp.offset(FP_OFFSET)));
	set_sp(heap, stack, current_fp);
	set_fp(heap, stack, saved_fp);
}

#[derive(Debug, Clone, Copy)]
pub struct Frame {
	pub fp: Addr,
	pub function_index: usize,
	pub caller_pc: usize,
}

fn caller_pc_of(heap: &Heap, frame_fp: Addr) -> usize {
	heap.word_at(frame_fp.offset(CALLER_PC_OFFSET))
}

fn function_index_of(heap: &Heap, frame_fp: Addr) -> usize {
	heap.word_at(frame_fp.offset(FUNCTION_OFFSET))
}

fn saved_fp_of(heap: &Heap, frame_fp: Addr) -> Addr {
	Addr(heap.word_at(frame_fp.offset(FP_OFFSET)))
}

/// Walks the frame chain from the innermost (current) frame to the
/// outermost, stopping once a frame reports the `DONE_SENTINEL` caller-pc.
pub fn frames(heap: &Heap, stack: Addr) -> FrameIter<'_> {
	FrameIter { heap, current: fp(heap, stack) }
}

pub struct FrameIter<'h> {
	heap: &'h Heap,
	current: Addr,
}

impl Iterator for FrameIter<'_> {
	type Item = Frame;

	fn next(&mut self) -> Option<Frame> {
		if self.current.is_null() {
			return None;
		}
		let frame_fp = self.current;
		let caller_pc = caller_pc_of(self.heap, frame_fp);
		let function_index = function_index_of(self.heap, frame_fp);
		self.current = if caller_pc == DONE_SENTINEL { Addr::NULL } else { saved_fp_of(self.heap, frame_fp) };
		Some(Frame { fp: frame_fp, function_index, caller_pc })
	}
}

/// Rewrites `sp`, `fp`, and every saved-fp link in the frame chain by
/// `delta` - the distance this stack's own block moved by during the copy
/// phase of a collection. `stack` must be the block's *post-copy* address:
/// the chain is walked at the shifted positions, where the copied frames
/// now live. Invoked once per collection, after the generic fix-up pass,
/// for every block `Heap::take_relocations` reports. Does not touch any
/// slot holding an object reference; that is `visit_frames`'s job, run
/// separately during the same collection.
pub fn relocate(heap: &mut Heap, stack: Addr, delta: isize) {
	let shift = |a: Addr| Addr((a.0 as isize + delta) as usize);

	let old_sp = sp(heap, stack);
	set_sp(heap, stack, shift(old_sp));

	let old_fp = fp(heap, stack);
	let shifted_fp = if old_fp.is_null() { Addr::NULL } else { shift(old_fp) };
	set_fp(heap, stack, shifted_fp);

	let mut current = shifted_fp;
	while !current.is_null() {
		let old_saved = saved_fp_of(heap, current);
		let caller_pc = caller_pc_of(heap, current);
		if old_saved.is_null() || caller_pc == DONE_SENTINEL {
			break;
		}
		heap.set_word_at(current.offset(FP_OFFSET), shift(old_saved).0);
		current = shift(old_saved);
	}
}

/// Visits every live reference slot across every frame: each frame's own
/// locals and expression-stack slots (via its function's
/// `StackPointerMap::locals_region` at the frame's paused pc) and the
/// argument slots sitting just below its `fp` (via its function's
/// parameter bitmap).
pub fn visit_frames<V: BlockVisitor>(heap: &mut Heap, stack: Addr, functions: &[FunctionBlueprint], visitor: &mut V) {
	let snapshot: Vec<Frame> = frames(&*heap, stack).collect();
	for frame in snapshot {
		let function = &functions[frame.function_index];

		let parameter_count = function.parameter_count();
		for (i, is_ref) in function.pointer_map().parameters_region().iter().enumerate() {
			if *is_ref {
				let slot = Addr(frame.fp.0 - parameter_count + i);
				visitor.visit_pointer(heap, slot);
			}
		}

		if let Some(bits) = function.pointer_map().locals_region(frame.caller_pc) {
			for (i, is_ref) in bits.iter().enumerate() {
				if *is_ref {
					let slot = frame.fp.offset(FRAME_CONTROL_SIZE + i);
					visitor.visit_pointer(heap, slot);
				}
			}
		}
	}
}
