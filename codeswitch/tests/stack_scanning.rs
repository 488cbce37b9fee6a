//! The stack pointer map over a sample function, and the relocation of a
//! stack carrying live frames: saved-fp links shift by the move delta,
//! object slots are left to the frame-aware visitor, and that visitor
//! touches exactly the slots the per-pc maps mark as references.

use codeswitch::block::Addr;
use codeswitch::function::{resolve_pointer_maps, FunctionBlueprint, TypeDesc};
use codeswitch::heap::{AllowAllocationScope, Heap};
use codeswitch::roots::Roots;
use codeswitch::stack;
use codeswitch::types::Primitive;
use codeswitch::utilities::write_vbn;
use codeswitch::visitor::BlockVisitor;

fn emit(op: u8, operand: i64, out: &mut Vec<u8>) {
	out.push(op);
	write_vbn(operand, out);
}

/// Pushes `0`, stores it to local 0; allocates an object, stores it to
/// local 1; loads both and calls global 2, twice; returns. Three
/// safepoints: the allocation, then each call's return address.
fn sample_function() -> FunctionBlueprint {
	let mut code = Vec::new();
	code.push(0x01); // ldc_i4_0
	emit(0x0C, 0, &mut code); // stloc 0
	emit(0x40, 1, &mut code); // allocobj class#1
	emit(0x0C, 1, &mut code); // stloc 1
	emit(0x0B, 0, &mut code); // ldloc 0
	emit(0x0B, 1, &mut code); // ldloc 1
	emit(0x33, 2, &mut code); // callg #2
	emit(0x0B, 0, &mut code); // ldloc 0
	emit(0x0B, 1, &mut code); // ldloc 1
	emit(0x33, 2, &mut code); // callg #2
	code.push(0x34); // ret
	FunctionBlueprint::new("sample", vec![], TypeDesc::Primitive(Primitive::Unit), 2, code, Vec::new())
}

/// The sample function's three-entry table: itself, a placeholder, and the
/// reference-returning global its `callg #2` operands name.
fn function_table() -> Vec<FunctionBlueprint> {
	let noop = FunctionBlueprint::new("noop", vec![], TypeDesc::Primitive(Primitive::Unit), 0, vec![0x34], Vec::new());
	let make = FunctionBlueprint::new("make", vec![], TypeDesc::Class(0), 0, vec![0x34], Vec::new());
	let functions = vec![sample_function(), noop, make];
	resolve_pointer_maps(&functions);
	functions
}

fn bits_of(is_ref: &[bool]) -> u64 {
	is_ref.iter().enumerate().fold(0, |acc, (i, r)| if *r { acc | (1 << i) } else { acc })
}

#[test]
fn the_sample_function_s_map_has_three_safepoints_with_the_expected_bits() {
	let functions = function_table();
	let map = functions[0].pointer_map();

	assert!(map.parameters_region().is_empty());
	let records = map.records();
	assert_eq!(records.len(), 3);

	// At the allocation: both locals still hold non-references.
	assert_eq!(records[0].is_ref.len(), 2);
	assert_eq!(bits_of(&records[0].is_ref), 0x0);
	// At the first call's return address: locals plus both argument
	// copies, with local 1 (and its copy) holding the allocated object.
	assert_eq!(records[1].is_ref.len(), 4);
	assert_eq!(bits_of(&records[1].is_ref), 0xa);
	// At the second call's return address: the first call's
	// reference-typed result is still on the stack below the new copies.
	assert_eq!(records[2].is_ref.len(), 5);
	assert_eq!(bits_of(&records[2].is_ref), 0x16);

	for record in records {
		assert_eq!(map.locals_region(record.pc), Some(record.is_ref.as_slice()));
	}
}

struct IncrementingVisitor {
	visited: Vec<Addr>,
}

impl BlockVisitor for IncrementingVisitor {
	fn visit_pointer(&mut self, heap: &mut Heap, slot: Addr) {
		let word = heap.word_at(slot);
		heap.set_word_at(slot, word + 4);
		self.visited.push(slot);
	}
}

#[test]
fn a_copied_stack_relocates_its_chain_and_scans_exactly_the_mapped_slots() {
	let functions = function_table();
	let records = functions[0].pointer_map().records().to_vec();

	let mut heap = Heap::with_capacity(4096);
	let _allow = AllowAllocationScope::new(&heap);
	let roots = Roots::bootstrap(&mut heap);
	let stack_addr = stack::allocate(&mut heap, roots.stack_meta, 128);

	// Three frames of the sample function, outermost first, each paused at
	// one of its safepoints, slot counts matching that safepoint's map.
	// The values are just distinct markers; the map alone decides which
	// slots the visitor may touch.
	let frame_values: [&[usize]; 3] = [
		&[1001, 1002, 1003, 1004], // paused at records[1]: refs at slots 1, 3
		&[2001, 2002, 2003, 2004, 2005], // paused at records[2]: refs at slots 1, 2, 4
		&[3001, 3002], // paused at records[0]: no refs
	];
	let paused_at = [1usize, 2, 0];
	let mut original_fps = Vec::new();
	for (values, record_index) in frame_values.iter().zip(paused_at) {
		stack::enter(&mut heap, stack_addr, 0, records[record_index].pc);
		original_fps.push(stack::fp(&heap, stack_addr));
		for value in values.iter() {
			stack::push(&mut heap, stack_addr, *value);
		}
	}

	// Copy the whole block elsewhere, as a collection's copy phase would,
	// and snapshot it first.
	let size = stack::meta().size_of(128);
	let snapshot: Vec<usize> = (0..size).map(|i| heap.word_at(stack_addr.offset(i))).collect();
	let copy = heap.allocate_uninitialized(size).unwrap();
	for (i, word) in snapshot.iter().enumerate() {
		heap.set_word_at(copy.offset(i), *word);
	}
	let delta = copy.0 as isize - stack_addr.0 as isize;
	stack::relocate(&mut heap, copy, delta);

	// Every frame's fp comes out shifted by exactly the copy delta...
	let shift = |a: Addr| Addr((a.0 as isize + delta) as usize);
	let copied_fps: Vec<Addr> = stack::frames(&heap, copy).map(|f| f.fp).collect();
	let mut expected_fps: Vec<Addr> = original_fps.iter().map(|fp| shift(*fp)).collect();
	expected_fps.reverse(); // frames iterate innermost-first
	assert_eq!(copied_fps, expected_fps);
	assert_eq!(stack::sp(&heap, copy), shift(stack::sp(&heap, stack_addr)));

	// ...and relocate touched nothing else: only the sp/fp header fields
	// and the saved-fp link of each non-outermost frame may differ from
	// the snapshot.
	let mut relocated_offsets: Vec<usize> = vec![1, 2]; // sp and fp header fields
	for fp in original_fps.iter().skip(1) {
		relocated_offsets.push(fp.0 - stack_addr.0); // the frame's saved-fp slot
	}
	for i in 0..size {
		let word = heap.word_at(copy.offset(i));
		if relocated_offsets.contains(&i) {
			assert_eq!(word, snapshot[i] + delta as usize, "offset {i} must have shifted");
		} else {
			assert_eq!(word, snapshot[i], "offset {i} must be untouched by relocate");
		}
	}

	// Now the frame-aware scan: every slot the maps mark as a reference
	// increments by 4; every other slot still matches the snapshot.
	let mut visitor = IncrementingVisitor { visited: Vec::new() };
	stack::visit_frames(&mut heap, copy, &functions, &mut visitor);

	let mut expected_incremented = Vec::new();
	for ((values, record_index), fp) in frame_values.iter().zip(paused_at).zip(&original_fps) {
		let record = &records[record_index];
		assert_eq!(record.is_ref.len(), values.len());
		for (i, is_ref) in record.is_ref.iter().enumerate() {
			let offset = fp.0 - stack_addr.0 + stack::FRAME_CONTROL_SIZE + i;
			if *is_ref {
				expected_incremented.push(offset);
			}
		}
	}
	assert_eq!(visitor.visited.len(), expected_incremented.len());
	for i in 0..size {
		let word = heap.word_at(copy.offset(i));
		let expected = if expected_incremented.contains(&i) {
			snapshot[i] + 4
		} else if relocated_offsets.contains(&i) {
			snapshot[i] + delta as usize
		} else {
			snapshot[i]
		};
		assert_eq!(word, expected, "offset {i} after the mapped scan");
	}
}
