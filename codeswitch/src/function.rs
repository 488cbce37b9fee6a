//! A function's bytecode, its type tables, and the `StackPointerMap`
//! compiled from it: the answer to "at this pc-offset, which stack slots
//! hold references?" that the collector needs to scan live frames.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::io::Cursor;

use nohash_hasher::BuildNoHashHasher;

use crate::builtins::BuiltinId;
use crate::opcode::OpCode;
use crate::types::Primitive;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// A loader-level type description: self-contained (class references are
/// package-local indices, not heap addresses), so blueprints stay valid
/// across collections without being part of the root set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDesc {
	Primitive(Primitive),
	Class(u32),
}

impl TypeDesc {
	pub fn is_reference(self) -> bool {
		matches!(self, TypeDesc::Class(_))
	}
}

/// A `(tryStart, tryEnd, handlerPc, catchType)` record consulted by
/// `Interpreter::do_throw` when unwinding past this function's frame.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
	pub try_start: usize,
	pub try_end: usize,
	pub handler_pc: usize,
	pub catch_class_index: u32,
}

/// Everything the interpreter and the collector need to know about one
/// function: its bytecode, parameter/locals shape, and a cached pointer
/// map. Built once at load time and shared (via the owning `Package`)
/// across every call and every collection.
///
/// The pointer map is not built by the constructor: typing a `callg`
/// result needs the callee's return type, so maps are resolved over a
/// whole package's function table at once (`resolve_pointer_maps`), after
/// every blueprint in it exists.
#[derive(Debug)]
pub struct FunctionBlueprint {
	pub name: String,
	pub parameters: Vec<TypeDesc>,
	pub return_type: TypeDesc,
	/// Indices into the owning package's type-parameter table. The core
	/// interpreter never consults these; they exist so generic signatures
	/// keep their type parameters reachable through the package roots.
	pub type_parameters: Vec<u32>,
	pub locals_count: usize,
	pub bytecode: Vec<u8>,
	pub handlers: Vec<ExceptionHandler>,
	/// Which loaded package owns this function; `callg` operands are
	/// indices local to it. Assigned by `Vm::load`.
	pub package: usize,
	pointer_map: OnceCell<StackPointerMap>,
}

impl FunctionBlueprint {
	pub fn new(
		name: impl Into<String>,
		parameters: Vec<TypeDesc>,
		return_type: TypeDesc,
		locals_count: usize,
		bytecode: Vec<u8>,
		handlers: Vec<ExceptionHandler>,
	) -> FunctionBlueprint {
		FunctionBlueprint {
			name: name.into(),
			parameters,
			return_type,
			type_parameters: Vec::new(),
			locals_count,
			bytecode,
			handlers,
			package: 0,
			pointer_map: OnceCell::new(),
		}
	}

	pub fn parameter_count(&self) -> usize {
		self.parameters.len()
	}

	pub fn pointer_map(&self) -> &StackPointerMap {
		self.pointer_map
			.get()
			.expect("pointer map not resolved: run resolve_pointer_maps over the owning package first")
	}

	pub fn build_pointer_map(&self, callee_returns_reference: &dyn Fn(u32) -> bool) {
		self.pointer_map
			.get_or_init(|| StackPointerMap::build_from(self, callee_returns_reference));
	}

	/// The handler, if any, whose try region covers `pc` - the innermost
	/// (last registered, matching a handler-stack discipline) one that does.
	pub fn handler_covering(&self, pc: usize) -> Option<&ExceptionHandler> {
		self.handlers.iter().rev().find(|h| pc >= h.try_start && pc < h.try_end)
	}
}

/// Builds the pointer map of every function in `functions`, resolving each
/// `callg` operand as an index into the same slice (the package-local
/// function table).
pub fn resolve_pointer_maps(functions: &[FunctionBlueprint]) {
	for function in functions {
		function.build_pointer_map(&|index| functions[index as usize].return_type.is_reference());
	}
}

/// Which stack slots hold references, indexed by the pc-offset of a
/// safepoint instruction. Slots are numbered `[locals...][expression
/// operands...]`, matching frame layout bottom-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointRecord {
	pub pc: usize,
	pub is_ref: Vec<bool>,
}

#[derive(Debug)]
pub struct StackPointerMap {
	parameter_is_ref: Vec<bool>,
	records: Vec<SafepointRecord>,
	block_entries: Vec<usize>,
}

impl StackPointerMap {
	pub fn parameters_region(&self) -> &[bool] {
		&self.parameter_is_ref
	}

	/// The live-slot bitmap recorded for the safepoint at `pc`, if `pc` is
	/// in fact a safepoint offset this map knows about.
	pub fn locals_region(&self, pc: usize) -> Option<&[bool]> {
		self.records
			.binary_search_by_key(&pc, |r| r.pc)
			.ok()
			.map(|i| self.records[i].is_ref.as_slice())
	}

	pub fn records(&self) -> &[SafepointRecord] {
		&self.records
	}

	/// Sorted pc-offsets of every basic-block entry the abstract
	/// interpretation discovered (offset 0 plus every branch target).
	pub fn basic_block_entries(&self) -> &[usize] {
		&self.block_entries
	}

	/// Abstract-interprets the function's bytecode: a small worklist over
	/// basic blocks, each starting from the type-state any predecessor
	/// already reaching it produced. States joining at the same pc must
	/// have identical shape (same locals typing, same expression-stack
	/// typing); a mismatch means the bytecode is malformed and is a fatal
	/// invariant violation, not a recoverable error, since well-formedness
	/// is assumed per this crate's scope.
	#[cfg_attr(feature = "tracing", instrument(skip_all, fields(function = %function.name)))]
	pub fn build_from(function: &FunctionBlueprint, callee_returns_reference: &dyn Fn(u32) -> bool) -> StackPointerMap {
		let parameter_is_ref: Vec<bool> = function.parameters.iter().map(|p| p.is_reference()).collect();
		let bytecode = function.bytecode.as_slice();

		let mut entry_states: HashMap<usize, TypeState, BuildNoHashHasher<usize>> = HashMap::default();
		entry_states.insert(0, TypeState { locals: vec![false; function.locals_count], stack: Vec::new() });
		let mut worklist = vec![0usize];
		let mut records: HashMap<usize, SafepointRecord, BuildNoHashHasher<usize>> = HashMap::default();

		while let Some(start) = worklist.pop() {
			let mut state = entry_states[&start].clone();
			let mut cursor = Cursor::new(bytecode);
			cursor.set_position(start as u64);

			loop {
				let pc = cursor.position() as usize;
				if pc >= bytecode.len() {
					break;
				}
				let opcode = OpCode::read(&mut cursor).expect("malformed bytecode: bad opcode");
				let pc_after = cursor.position() as usize;

				if opcode.is_safepoint() {
					// `callg` transfers control to a new frame; the slot a
					// stack walker reads while that frame runs is the return
					// address (`pc_after`), the same convention a real call
					// instruction's pushed return address follows. Every
					// other safepoint stays in this frame, so its own
					// instruction-start offset is the right key.
					let key = if matches!(opcode, OpCode::callg(_)) { pc_after } else { pc };
					let mut is_ref = state.locals.clone();
					is_ref.extend_from_slice(&state.stack);
					records.entry(key).or_insert(SafepointRecord { pc: key, is_ref });
				}

				// Any instruction inside a try region is a potential throw
				// edge into its handler, which starts with the operand stack
				// unwound down to the locals plus the caught exception.
				for handler in function.handlers.iter().filter(|h| pc >= h.try_start && pc < h.try_end) {
					let handler_state = TypeState { locals: state.locals.clone(), stack: vec![true] };
					join_or_schedule(&mut entry_states, &mut worklist, handler.handler_pc, &handler_state);
				}

				apply(&opcode, &mut state, &parameter_is_ref, callee_returns_reference);

				if let Some(target) = opcode.branch_target(pc_after) {
					join_or_schedule(&mut entry_states, &mut worklist, target, &state);
				}
				if opcode.ends_block() {
					break;
				}
			}
		}

		let mut records: Vec<SafepointRecord> = records.into_values().collect();
		records.sort_by_key(|r| r.pc);
		let mut block_entries: Vec<usize> = entry_states.into_keys().collect();
		block_entries.sort_unstable();
		StackPointerMap { parameter_is_ref, records, block_entries }
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TypeState {
	locals: Vec<bool>,
	stack: Vec<bool>,
}

impl TypeState {
	fn push(&mut self, is_ref: bool) {
		self.stack.push(is_ref);
	}

	fn pop(&mut self) -> bool {
		self.stack.pop().expect("operand stack underflow: malformed bytecode")
	}
}

fn join_or_schedule(
	states: &mut HashMap<usize, TypeState, BuildNoHashHasher<usize>>,
	worklist: &mut Vec<usize>,
	target: usize,
	incoming: &TypeState,
) {
	match states.get(&target) {
		Some(existing) => {
			assert_eq!(existing, incoming, "stack shape mismatch joining at pc {target}: malformed bytecode");
		}
		None => {
			states.insert(target, incoming.clone());
			worklist.push(target);
		}
	}
}

/// Updates `state` for one opcode's stack effect. Only the reference-ness
/// of each value matters here, not its concrete bit pattern; an
/// instruction's result is typed from its operand types, the parameter
/// bitmap, the callee's return type, or the builtin's signature, so the
/// resulting map is exact - a slot is marked as a reference iff a walker
/// reading it at that pc finds a block address (or null) there.
fn apply(opcode: &OpCode, state: &mut TypeState, params: &[bool], callee_returns_reference: &dyn Fn(u32) -> bool) {
	use OpCode::*;
	match *opcode {
		nop => {}
		ldc_i4_0 | ldc_i4(_) | ldc_i8(_) | ldc_r4(_) | ldc_r8(_) => state.push(false),
		ldnull => state.push(true),
		dup => {
			let top = *state.stack.last().expect("dup on empty stack: malformed bytecode");
			state.push(top);
		}
		pop => {
			state.pop();
		}
		ldarg(index) => {
			let is_ref = params[index as usize];
			state.push(is_ref);
		}
		starg(index) => {
			let value = state.pop();
			assert_eq!(
				value, params[index as usize],
				"starg changes a parameter slot's reference-ness: malformed bytecode"
			);
		}
		ldloc(index) => {
			let is_ref = state.locals[index as usize];
			state.push(is_ref);
		}
		stloc(index) => {
			let value = state.pop();
			state.locals[index as usize] = value;
		}
		add | sub | mul | div | rem | and | or | xor | shl | shr | shr_un | ceq | cgt | clt | fadd | fsub | fmul
		| fdiv | fceq | fcgt | fclt => {
			state.pop();
			state.pop();
			state.push(false);
		}
		neg | not | conv_i4 | conv_i8 | conv_r4 | conv_r8 | fconv_i8 => {
			state.pop();
			state.push(false);
		}
		br(_) => {}
		brtrue(_) | brfalse(_) => {
			state.pop();
		}
		callg(index) => {
			// Arguments stay in place below the new frame (the map records
			// them at the call's return-address key); only the result
			// appears from this frame's perspective, typed by the callee's
			// declared return type.
			state.push(callee_returns_reference(index));
		}
		callbuiltin(id) => {
			let builtin = BuiltinId::from_repr(id).expect("unknown builtin id: malformed bytecode");
			match builtin {
				BuiltinId::StringConcat => {
					state.pop();
					state.pop();
					state.push(true);
				}
				BuiltinId::StringCompare => {
					state.pop();
					state.pop();
					state.push(false);
				}
				BuiltinId::PrintString => {
					state.pop();
				}
				BuiltinId::I64ToString => {
					state.pop();
					state.push(true);
				}
				// The raising builtins never return; `ends_block` stops the
				// abstract walk right after this instruction.
				_ => {}
			}
		}
		ret => {}
		throw => {
			state.pop();
		}
		allocobj(_) => state.push(true),
		newarr(_) => {
			state.pop();
			state.push(true);
		}
		ldlen => {
			state.pop();
			state.push(false);
		}
		ldfld(_) => {
			state.pop();
			state.push(false);
		}
		ldfldr(_) => {
			state.pop();
			state.push(true);
		}
		stfld(_) => {
			state.pop();
			state.pop();
		}
		ldelem => {
			state.pop();
			state.pop();
			state.push(false);
		}
		ldelemr => {
			state.pop();
			state.pop();
			state.push(true);
		}
		stelem => {
			state.pop();
			state.pop();
			state.pop();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utilities::write_vbn;

	fn emit(opcode_byte: u8, operand: i64, out: &mut Vec<u8>) {
		out.push(opcode_byte);
		write_vbn(operand, out);
	}

	/// A straight-line function: push `0`, store local 0; allocate an
	/// object, store local 1; load both and call a global function twice
	/// more, then return. Exercises the dataflow typing of locals (a local
	/// reads as non-reference until its first store) and of calls (a call
	/// result is typed by the callee's return type).
	fn sample_bytecode() -> Vec<u8> {
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
		code
	}

	fn sample_function() -> FunctionBlueprint {
		let function = FunctionBlueprint::new(
			"sample",
			vec![],
			TypeDesc::Primitive(Primitive::Unit),
			2,
			sample_bytecode(),
			Vec::new(),
		);
		// Global #2 is declared to return a reference.
		function.build_pointer_map(&|_| true);
		function
	}

	#[test]
	fn locals_read_as_non_reference_before_their_first_store() {
		let function = sample_function();
		let first = &function.pointer_map().records()[0];
		assert_eq!(first.is_ref, vec![false, false]);
	}

	#[test]
	fn a_call_argument_copy_carries_the_local_s_reference_ness() {
		let function = sample_function();
		let second = &function.pointer_map().records()[1];
		// [local0=false, local1=true, arg-copy-of-local0=false, arg-copy-of-local1=true]
		assert_eq!(second.is_ref, vec![false, true, false, true]);
	}

	#[test]
	fn a_prior_call_s_result_is_tracked_as_a_reference_too() {
		let function = sample_function();
		let third = &function.pointer_map().records()[2];
		assert_eq!(third.is_ref, vec![false, true, true, false, true]);
	}

	#[test]
	fn a_call_returning_a_plain_value_is_not_tracked_as_a_reference() {
		let function = FunctionBlueprint::new(
			"sample",
			vec![],
			TypeDesc::Primitive(Primitive::Unit),
			2,
			sample_bytecode(),
			Vec::new(),
		);
		function.build_pointer_map(&|_| false);
		let third = &function.pointer_map().records()[2];
		assert_eq!(third.is_ref, vec![false, true, false, false, true]);
	}

	#[test]
	fn records_are_sorted_by_pc_and_addressable_by_locals_region() {
		let function = sample_function();
		let map = function.pointer_map();
		let pcs: Vec<usize> = map.records().iter().map(|r| r.pc).collect();
		let mut sorted = pcs.clone();
		sorted.sort_unstable();
		assert_eq!(pcs, sorted);
		assert!(map.locals_region(pcs[0]).is_some());
		assert!(map.locals_region(usize::MAX).is_none());
	}

	#[test]
	fn branch_targets_become_basic_block_entries() {
		// ldc_i4 1; brtrue +1; nop; ret
		let mut code = Vec::new();
		emit(0x02, 1, &mut code);
		emit(0x31, 1, &mut code); // skip the nop
		code.push(0x00);
		code.push(0x34);
		let function =
			FunctionBlueprint::new("branchy", vec![], TypeDesc::Primitive(Primitive::Unit), 0, code, Vec::new());
		function.build_pointer_map(&|_| false);
		assert_eq!(function.pointer_map().basic_block_entries(), &[0, 5]);
	}

	#[test]
	fn parameters_region_mirrors_the_declared_parameter_types() {
		let function = FunctionBlueprint::new(
			"takes_ref",
			vec![TypeDesc::Primitive(Primitive::I64), TypeDesc::Class(0)],
			TypeDesc::Primitive(Primitive::Unit),
			0,
			vec![0x34],
			Vec::new(),
		);
		function.build_pointer_map(&|_| false);
		assert_eq!(function.pointer_map().parameters_region(), &[false, true]);
	}
}
