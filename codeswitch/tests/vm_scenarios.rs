//! End-to-end scenarios through the embedding surface: handle escape
//! across collections, bytecode whose objects survive forced GC churn,
//! exception unwinding out to the embedder, and heap exhaustion.

use codeswitch::block::{Block, BlockType};
use codeswitch::function::{ExceptionHandler, FunctionBlueprint, TypeDesc};
use codeswitch::handle::HandleScope;
use codeswitch::types::Primitive;
use codeswitch::utilities::write_vbn;
use codeswitch::vm::{CallOutcome, ClassBlueprint, Package, Vm, VmFlags};

fn emit(op: u8, operand: i64, out: &mut Vec<u8>) {
	out.push(op);
	write_vbn(operand, out);
}

fn i64_desc() -> TypeDesc {
	TypeDesc::Primitive(Primitive::I64)
}

fn value_class(name: &str) -> ClassBlueprint {
	ClassBlueprint {
		name: name.into(),
		superclass: None,
		interfaces: Vec::new(),
		instance_size: 2,
		object_pointer_map: Vec::new(),
	}
}

#[test]
fn an_escaped_handle_outlives_its_scope_and_later_collections() {
	let mut vm = Vm::new(VmFlags::empty());
	let object_class = vm.roots().object_class;

	// The scope borrows a clone of the storage handle, not the VM itself,
	// so the VM stays free for the allocations below.
	let handles = std::rc::Rc::clone(vm.handles());
	let escaped = {
		let mut scope = HandleScope::new(&handles);
		let addr = vm.allocate_instance(object_class).unwrap();
		let local = scope.local::<Block>(addr);
		scope.escape(local)
	};

	assert_eq!(vm.heap().meta_of_block(escaped.get()).block_type, BlockType::Object);

	// Churn until the collector has run and moved things; the handle must
	// keep resolving to the (relocated) object.
	let before = escaped.get();
	for _ in 0..4 {
		vm.collect_garbage();
		let _garbage = vm.allocate_instance(vm.roots().object_class).unwrap();
	}
	assert_eq!(vm.heap().meta_of_block(escaped.get()).block_type, BlockType::Object);
	assert_ne!(escaped.get(), before, "collections must have moved the object");
}

#[test]
fn objects_in_locals_survive_a_collection_forced_at_every_allocation() {
	// allocobj; dup; ldc 42; stfld 1; stloc 0; two churn allocations; then
	// read the field back through the local. With COLLECT_EVERY_ALLOCATION
	// this exercises the full safepoint discipline: committed pcs, the
	// frame scan, slot rewriting, and the stack's own relocation.
	let mut code = Vec::new();
	emit(0x40, 0, &mut code); // allocobj class#0
	code.push(0x07); // dup
	emit(0x02, 42, &mut code); // ldc_i4 42
	emit(0x44, 1, &mut code); // stfld offset 1
	emit(0x0C, 0, &mut code); // stloc 0
	emit(0x40, 0, &mut code); // allocobj (garbage)
	code.push(0x08); // pop
	emit(0x40, 0, &mut code); // allocobj (garbage)
	code.push(0x08); // pop
	emit(0x0B, 0, &mut code); // ldloc 0
	emit(0x43, 1, &mut code); // ldfld offset 1
	code.push(0x34); // ret
	let function = FunctionBlueprint::new("survives_churn", vec![], i64_desc(), 1, code, Vec::new());

	let mut vm = Vm::new(VmFlags::COLLECT_EVERY_ALLOCATION);
	vm.load(Package {
		functions: vec![function],
		classes: vec![value_class("Box")],
		..Package::default()
	})
	.unwrap();

	match vm.call(0, &[]) {
		CallOutcome::Returned(value) => assert_eq!(value, 42),
		CallOutcome::UnhandledException(_) => panic!("expected a normal return"),
	}
}

#[test]
fn an_uncaught_exception_reaches_the_embedder_as_a_rooted_handle() {
	let mut code = Vec::new();
	emit(0x02, 1, &mut code);
	emit(0x02, 0, &mut code);
	code.push(0x13); // div
	code.push(0x34); // ret
	let function = FunctionBlueprint::new("divzero", vec![], i64_desc(), 0, code, Vec::new());

	let mut vm = Vm::new(VmFlags::empty());
	vm.load(Package { functions: vec![function], ..Package::default() }).unwrap();

	let exception = match vm.call(0, &[]) {
		CallOutcome::UnhandledException(exception) => exception,
		CallOutcome::Returned(_) => panic!("division by zero must not return normally"),
	};
	assert_eq!(vm.heap().meta_of_block(exception.get()).block_type, BlockType::Object);

	// The stack unwound completely: the same VM can keep running calls,
	// and the handle stays valid across the collections they may force.
	vm.collect_garbage();
	match vm.call(0, &[]) {
		CallOutcome::UnhandledException(second) => {
			assert_eq!(vm.heap().meta_of_block(second.get()).block_type, BlockType::Object);
		}
		CallOutcome::Returned(_) => panic!("division by zero must not return normally"),
	}
	assert_eq!(vm.heap().meta_of_block(exception.get()).block_type, BlockType::Object);
}

#[test]
fn heap_exhaustion_raises_out_of_memory_into_a_bytecode_handler() {
	// ldc_i8 huge; [try: newarr] - the impossible allocation raises the
	// pre-allocated OutOfMemory exception, caught right here in bytecode.
	let mut code = Vec::new();
	emit(0x03, 1 << 40, &mut code); // ldc_i8
	let try_start = code.len();
	emit(0x41, 0, &mut code); // newarr element meta #0
	let try_end = code.len();
	code.push(0x08); // pop (normal path, never reached)
	code.push(0x01); // ldc_i4_0
	code.push(0x34); // ret
	let handler_pc = code.len();
	code.push(0x08); // pop the caught exception
	emit(0x02, 5, &mut code);
	code.push(0x34); // ret
	let handler = ExceptionHandler { try_start, try_end, handler_pc, catch_class_index: 0 };
	let function = FunctionBlueprint::new("exhaust", vec![], i64_desc(), 0, code, vec![handler]);

	let element_meta = codeswitch::block::Meta {
		block_type: BlockType::ByteArray,
		instance_size: 2,
		element_size: 1,
		length_offset: 1,
		flags: codeswitch::block::MetaFlags::empty(),
		object_pointer_map: Vec::new(),
		element_pointer_map: Vec::new(),
	};

	let mut vm = Vm::with_capacities(VmFlags::empty(), 2048, 256);
	vm.load(Package {
		functions: vec![function],
		element_metas: vec![element_meta],
		..Package::default()
	})
	.unwrap();

	match vm.call(0, &[]) {
		CallOutcome::Returned(value) => assert_eq!(value, 5),
		CallOutcome::UnhandledException(_) => panic!("the handler should have caught the exhaustion"),
	}
}

#[test]
fn string_concatenation_through_the_builtin_returns_the_joined_length() {
	// f(a, b) = ldlen(concat(a, b)): takes two rooted string references
	// from the embedder and hands back the joined byte count.
	let mut code = Vec::new();
	emit(0x09, 0, &mut code); // ldarg 0
	emit(0x09, 1, &mut code); // ldarg 1
	emit(0x47, 0, &mut code); // callbuiltin StringConcat
	code.push(0x42); // ldlen
	code.push(0x34); // ret
	let parameters = vec![TypeDesc::Class(0), TypeDesc::Class(0)];
	let function = FunctionBlueprint::new("joined_len", parameters, i64_desc(), 0, code, Vec::new());

	let mut vm = Vm::new(VmFlags::COLLECT_EVERY_ALLOCATION);
	vm.load(Package {
		functions: vec![function],
		classes: vec![value_class("String")],
		..Package::default()
	})
	.unwrap();

	let handles = std::rc::Rc::clone(vm.handles());
	let scope = HandleScope::new(&handles);
	let hello = scope.local::<Block>(vm.allocate_string("hello ").unwrap());
	let world = scope.local::<Block>(vm.allocate_string("world").unwrap());

	match vm.call(0, &[hello.get().0 as i64, world.get().0 as i64]) {
		CallOutcome::Returned(value) => assert_eq!(value, 11),
		CallOutcome::UnhandledException(_) => panic!("expected a normal return"),
	}
}
