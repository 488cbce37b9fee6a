use codeswitch::function::{FunctionBlueprint, TypeDesc};
use codeswitch::types::Primitive;
use codeswitch::utilities::write_vbn;
use codeswitch::vm::{CallOutcome, Package, Vm, VmFlags};

fn main() {
	// 6 * 7, assembled by hand: the bytecode file-format loader lives
	// outside this crate, so the smoke test builds its package in memory.
	let mut code = Vec::new();
	code.push(0x02);
	write_vbn(6, &mut code);
	code.push(0x02);
	write_vbn(7, &mut code);
	code.push(0x12); // mul
	code.push(0x34); // ret
	let entry = FunctionBlueprint::new("main", vec![], TypeDesc::Primitive(Primitive::I64), 0, code, Vec::new());

	let mut vm = Vm::new(VmFlags::empty());
	vm.load(Package { functions: vec![entry], ..Package::default() }).unwrap();
	match vm.call(0, &[]) {
		CallOutcome::Returned(value) => println!("{value}"),
		CallOutcome::UnhandledException(_) => std::process::exit(1),
	}
}
