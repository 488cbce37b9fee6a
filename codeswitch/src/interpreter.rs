//! Bytecode dispatch: frame enter/leave, arithmetic and object operations,
//! exception unwinding, and builtin invocation, all driven off one flat
//! loop that walks the live frame chain rather than recursing per call.

use std::io::Cursor;

use crate::block::{Addr, MetaWord};
use crate::builtins::BuiltinId;
use crate::errors::HeapError;
use crate::function::FunctionBlueprint;
use crate::gc;
use crate::handle::HandleStorage;
use crate::heap::{AllowAllocationScope, Heap};
use crate::opcode::OpCode;
use crate::roots::Roots;
use crate::stack::{self, FRAME_CONTROL_SIZE};
use crate::types::ClassView;

#[cfg(feature = "tracing")]
use tracing::instrument;

pub enum CallResult {
	Returned(i64),
	Unhandled(Addr),
}

/// Where a loaded package's entries start within the VM's flat function,
/// class, and element-meta tables. Bytecode operands are indices local to
/// the executing function's own package; these offsets make them global.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageBases {
	pub functions: usize,
	pub classes: usize,
	pub element_metas: usize,
}

/// Borrows every piece of VM state one call needs. The `&mut` fields are
/// exactly the places a collection rewrites: any allocation may move every
/// block, so the interpreter re-reads addresses through these fields after
/// each safepoint instead of keeping them in Rust locals.
pub struct Interpreter<'a> {
	pub heap: &'a mut Heap,
	pub roots: &'a mut Roots,
	pub handles: &'a HandleStorage,
	pub functions: &'a [FunctionBlueprint],
	pub packages: &'a [PackageBases],
	pub classes: &'a mut [Addr],
	pub element_metas: &'a mut [Addr],
	pub type_parameters: &'a mut [Addr],
	pub stack: &'a mut Addr,
}

impl Interpreter<'_> {
	#[cfg_attr(feature = "tracing", instrument(skip(self, args)))]
	pub fn call(&mut self, function_index: usize, args: &[i64]) -> CallResult {
		assert_eq!(
			args.len(),
			self.functions[function_index].parameter_count(),
			"argument count mismatch calling {}",
			self.functions[function_index].name
		);
		for &arg in args {
			stack::push(self.heap, *self.stack, arg as u64 as usize);
		}
		self.enter_function(function_index, stack::DONE_SENTINEL);
		self.run()
	}

	/// Drives every frame on this call's stack from one loop: entering a
	/// callee just swaps which frame the next iteration reads, and
	/// returning swaps back, so there is no per-call Rust-stack recursion
	/// to mirror the managed one.
	fn run(&mut self) -> CallResult {
		loop {
			let fp = stack::fp(self.heap, *self.stack);
			let function_index = self.heap.word_at(fp.offset(stack::FUNCTION_OFFSET));
			let mut pc = self.heap.word_at(fp.offset(stack::CALLER_PC_OFFSET));
			if pc == stack::DONE_SENTINEL {
				pc = 0;
			}

			match self.step(function_index, &mut pc) {
				StepOutcome::Continue => {
					stack::set_caller_pc(self.heap, *self.stack, pc);
				}
				StepOutcome::Return(value) => {
					let caller_fp = self.heap.word_at(fp.offset(stack::FP_OFFSET));
					let argc = self.functions[function_index].parameter_count();
					stack::leave(self.heap, *self.stack);
					// `leave` only restores `sp` to this frame's own fp, which sits
					// directly above the arguments the caller pushed; pop them
					// before handing back the result.
					for _ in 0..argc {
						stack::pop(self.heap, *self.stack);
					}
					if Addr(caller_fp).is_null() {
						return CallResult::Returned(value);
					}
					stack::push(self.heap, *self.stack, value as u64 as usize);
				}
				StepOutcome::Unhandled(exception) => return CallResult::Unhandled(exception),
			}
		}
	}

	/// Pushes the frame-control header and zeroes the callee's local
	/// slots, leaving `sp` at the expression stack's empty position.
	#[cfg_attr(feature = "tracing", instrument(skip(self)))]
	fn enter_function(&mut self, function_index: usize, initial_pc: usize) {
		stack::enter(self.heap, *self.stack, function_index, initial_pc);
		for _ in 0..self.functions[function_index].locals_count {
			stack::push(self.heap, *self.stack, 0);
		}
	}

	fn step(&mut self, function_index: usize, pc: &mut usize) -> StepOutcome {
		let function = &self.functions[function_index];
		let mut cursor = Cursor::new(function.bytecode.as_slice());
		cursor.set_position(*pc as u64);
		let opcode = OpCode::read(&mut cursor).expect("malformed bytecode");
		let pc_after = cursor.position() as usize;

		if opcode.is_safepoint() {
			// `callg` suspends this frame at the call's return address, the
			// value a walker needs while the callee runs - same convention a
			// pushed return address follows. Every other safepoint stays in
			// this frame, so its own instruction-start offset is right.
			let resume_pc = if matches!(opcode, OpCode::callg(_)) { pc_after } else { *pc };
			stack::set_caller_pc(self.heap, *self.stack, resume_pc);
		}

		use OpCode::*;
		match opcode {
			nop => {}
			ldc_i4_0 => stack::push(self.heap, *self.stack, 0),
			ldc_i4(v) => stack::push(self.heap, *self.stack, v as i64 as u64 as usize),
			ldc_i8(v) => stack::push(self.heap, *self.stack, v as u64 as usize),
			ldc_r4(bits) => stack::push(self.heap, *self.stack, bits as i64 as u64 as usize),
			ldc_r8(bits) => stack::push(self.heap, *self.stack, bits as u64 as usize),
			ldnull => stack::push(self.heap, *self.stack, Addr::NULL.0),
			dup => {
				let v = stack::pop(self.heap, *self.stack);
				stack::push(self.heap, *self.stack, v);
				stack::push(self.heap, *self.stack, v);
			}
			pop => {
				stack::pop(self.heap, *self.stack);
			}
			ldarg(n) => {
				let slot = self.argument_slot(function.parameter_count(), n as usize);
				let value = self.heap.word_at(slot);
				stack::push(self.heap, *self.stack, value);
			}
			starg(n) => {
				let slot = self.argument_slot(function.parameter_count(), n as usize);
				let v = stack::pop(self.heap, *self.stack);
				self.heap.set_word_at(slot, v);
			}
			ldloc(n) => {
				let slot = self.local_slot(n as usize);
				let value = self.heap.word_at(slot);
				stack::push(self.heap, *self.stack, value);
			}
			stloc(n) => {
				let slot = self.local_slot(n as usize);
				let v = stack::pop(self.heap, *self.stack);
				self.heap.set_word_at(slot, v);
			}
			add | sub | mul | div | rem => {
				let b = self.pop_i64();
				let a = self.pop_i64();
				match self.arith(opcode, a, b) {
					Ok(result) => self.push_i64(result),
					Err(exception) => return self.throw(function_index, pc, exception),
				}
			}
			and | or | xor | shl | shr | shr_un => {
				let b = self.pop_i64();
				let a = self.pop_i64();
				let result = match opcode {
					OpCode::and => a & b,
					OpCode::or => a | b,
					OpCode::xor => a ^ b,
					OpCode::shl => a.wrapping_shl(b as u32),
					OpCode::shr => a.wrapping_shr(b as u32),
					OpCode::shr_un => ((a as u64).wrapping_shr(b as u32)) as i64,
					_ => unreachable!(),
				};
				self.push_i64(result);
			}
			neg => { let a = self.pop_i64(); self.push_i64(a.wrapping_neg()); }
			not => { let a = self.pop_i64(); self.push_i64(!a); }
			ceq | cgt | clt => {
				let b = self.pop_i64();
				let a = self.pop_i64();
				let result = match opcode {
					OpCode::ceq => a == b,
					OpCode::cgt => a > b,
					OpCode::clt => a < b,
					_ => unreachable!(),
				};
				self.push_i64(result as i64);
			}
			conv_i4 => { let a = self.pop_i64(); self.push_i64(a as i32 as i64); }
			conv_i8 => { let a = self.pop_i64(); self.push_i64(a); }
			conv_r4 => { let a = self.pop_i64(); self.push_i64((a as f64 as f32).to_bits() as i64); }
			conv_r8 => { let a = self.pop_i64(); self.push_i64((a as f64).to_bits() as i64); }
			fadd | fsub | fmul | fdiv => {
				let b = self.pop_f64();
				let a = self.pop_f64();
				let result = match opcode {
					OpCode::fadd => a + b,
					OpCode::fsub => a - b,
					OpCode::fmul => a * b,
					OpCode::fdiv => a / b,
					_ => unreachable!(),
				};
				self.push_i64(result.to_bits() as i64);
			}
			fceq | fcgt | fclt => {
				let b = self.pop_f64();
				let a = self.pop_f64();
				let result = match opcode {
					OpCode::fceq => a == b,
					OpCode::fcgt => a > b,
					OpCode::fclt => a < b,
					_ => unreachable!(),
				};
				self.push_i64(result as i64);
			}
			fconv_i8 => { let a = self.pop_f64(); self.push_i64(a as i64); }
			br(delta) => { *pc = (pc_after as i64 + delta as i64) as usize; return StepOutcome::Continue; }
			brtrue(delta) => {
				let v = self.pop_i64();
				*pc = if v != 0 { (pc_after as i64 + delta as i64) as usize } else { pc_after };
				return StepOutcome::Continue;
			}
			brfalse(delta) => {
				let v = self.pop_i64();
				*pc = if v == 0 { (pc_after as i64 + delta as i64) as usize } else { pc_after };
				return StepOutcome::Continue;
			}
			callg(index) => {
				// Arguments are already sitting on the expression stack,
				// pushed by the preceding ldarg/ldloc/ldc instructions, in
				// exactly the slots `enter` expects to find just below the
				// new frame's fp - nothing to rearrange. The run() loop picks
				// the callee frame up on its next iteration; this frame's own
				// resume pc was already committed above, before the switch.
				let callee = self.packages[function.package].functions + index as usize;
				self.enter_function(callee, 0);
				*pc = 0;
				return StepOutcome::Continue;
			}
			ret => {
				let current_fp = stack::fp(self.heap, *self.stack);
				let base = current_fp.offset(FRAME_CONTROL_SIZE + function.locals_count);
				let value = if stack::sp(self.heap, *self.stack) > base { self.pop_i64() } else { 0 };
				return StepOutcome::Return(value);
			}
			throw => {
				let exception = Addr(self.pop_i64() as u64 as usize);
				return self.throw(function_index, pc, exception);
			}
			allocobj(class_index) => {
				let class_index = self.packages[function.package].classes + class_index as usize;
				let class_addr = self.classes[class_index];
				let instance_meta = ClassView::new(self.heap, class_addr).instance_meta_addr();
				let words = self.heap.meta_of_block(instance_meta).size_of(0);
				let addr = match self.allocate(words) {
					Ok(addr) => addr,
					Err(_) => return self.throw_out_of_memory(function_index, pc),
				};
				// The allocation may have collected; the class and its meta
				// may now live elsewhere. Re-read both through the updated
				// class table rather than the pre-allocation values.
				let class_addr = self.classes[class_index];
				let instance_meta = ClassView::new(self.heap, class_addr).instance_meta_addr();
				self.heap.set_word_at(addr, MetaWord::Regular(instance_meta).encode());
				stack::push(self.heap, *self.stack, addr.0);
			}
			newarr(meta_index) => {
				let meta_index = self.packages[function.package].element_metas + meta_index as usize;
				let length = self.pop_i64();
				if length < 0 {
					let exception = self.exception_or_oom(|roots| roots.index_out_of_bounds_exception);
					return self.throw(function_index, pc, exception);
				}
				let meta = self.heap.meta_of_block(self.element_metas[meta_index]);
				let addr = match self.allocate(meta.size_of(length as usize)) {
					Ok(addr) => addr,
					Err(_) => return self.throw_out_of_memory(function_index, pc),
				};
				let meta_addr = self.element_metas[meta_index];
				self.heap.set_word_at(addr, MetaWord::Regular(meta_addr).encode());
				self.heap.set_word_at(addr.offset(meta.length_offset), length as usize);
				stack::push(self.heap, *self.stack, addr.0);
			}
			ldlen => {
				let array = Addr(self.pop_i64() as u64 as usize);
				if array.is_null() {
					let exception = self.exception_or_oom(|roots| roots.null_reference_exception);
					return self.throw(function_index, pc, exception);
				}
				let meta = self.heap.meta_of_block(array);
				self.push_i64(self.heap.word_at(array.offset(meta.length_offset)) as i64);
			}
			ldfld(offset) | ldfldr(offset) => {
				let reference = Addr(self.pop_i64() as u64 as usize);
				if reference.is_null() {
					let exception = self.exception_or_oom(|roots| roots.null_reference_exception);
					return self.throw(function_index, pc, exception);
				}
				self.push_i64(self.heap.word_at(reference.offset(offset as usize)) as i64);
			}
			stfld(offset) => {
				let value = self.pop_i64();
				let reference = Addr(self.pop_i64() as u64 as usize);
				if reference.is_null() {
					let exception = self.exception_or_oom(|roots| roots.null_reference_exception);
					return self.throw(function_index, pc, exception);
				}
				self.heap.set_word_at(reference.offset(offset as usize), value as u64 as usize);
			}
			ldelem | ldelemr => {
				let index = self.pop_i64();
				let array = Addr(self.pop_i64() as u64 as usize);
				match self.element_slot(array, index) {
					Ok(slot) => self.push_i64(self.heap.word_at(slot) as i64),
					Err(exception) => return self.throw(function_index, pc, exception),
				}
			}
			stelem => {
				let value = self.pop_i64();
				let index = self.pop_i64();
				let array = Addr(self.pop_i64() as u64 as usize);
				match self.element_slot(array, index) {
					Ok(slot) => self.heap.set_word_at(slot, value as u64 as usize),
					Err(exception) => return self.throw(function_index, pc, exception),
				}
			}
			callbuiltin(id) => {
				let builtin = BuiltinId::from_repr(id).unwrap_or_else(|| panic!("unknown builtin id {id}"));
				if builtin.is_throwing() {
					let exception = self.throwing_builtin_exception(builtin);
					return self.throw(function_index, pc, exception);
				}
				if self.dispatch_builtin(builtin).is_err() {
					return self.throw_out_of_memory(function_index, pc);
				}
			}
		}

		*pc = pc_after;
		StepOutcome::Continue
	}

	fn pop_i64(&mut self) -> i64 { stack::pop(self.heap, *self.stack) as i64 }
	fn pop_f64(&mut self) -> f64 { f64::from_bits(stack::pop(self.heap, *self.stack) as u64) }
	fn push_i64(&mut self, value: i64) { stack::push(self.heap, *self.stack, value as u64 as usize); }

	fn argument_slot(&self, parameter_count: usize, index: usize) -> Addr {
		let fp = stack::fp(self.heap, *self.stack);
		Addr(fp.0 - parameter_count + index)
	}

	fn local_slot(&self, index: usize) -> Addr {
		let fp = stack::fp(self.heap, *self.stack);
		fp.offset(FRAME_CONTROL_SIZE + index)
	}

	fn element_slot(&mut self, array: Addr, index: i64) -> Result<Addr, Addr> {
		if array.is_null() {
			return Err(self.exception_or_oom(|roots| roots.null_reference_exception));
		}
		let meta = self.heap.meta_of_block(array);
		let length = self.heap.word_at(array.offset(meta.length_offset)) as i64;
		if index < 0 || index >= length {
			return Err(self.exception_or_oom(|roots| roots.index_out_of_bounds_exception));
		}
		Ok(array.offset(meta.instance_size + index as usize * meta.element_size))
	}

	fn arith(&mut self, opcode: OpCode, a: i64, b: i64) -> Result<i64, Addr> {
		match opcode {
			OpCode::add => Ok(a.wrapping_add(b)),
			OpCode::sub => Ok(a.wrapping_sub(b)),
			OpCode::mul => Ok(a.wrapping_mul(b)),
			OpCode::div | OpCode::rem if b == 0 || (a == i64::MIN && b == -1) => {
				Err(self.exception_or_oom(|roots| roots.arithmetic_exception))
			}
			OpCode::div => Ok(a.wrapping_div(b)),
			OpCode::rem => Ok(a.wrapping_rem(b)),
			_ => unreachable!(),
		}
	}

	/// The one safepoint allocation path: every reference the VM knows
	/// about is handed to the collector as a root, and the pc committed
	/// just before makes the current frame scannable.
	fn allocate(&mut self, words: usize) -> Result<Addr, HeapError> {
		let _allow = AllowAllocationScope::new(self.heap);
		let mut set = gc::RootSet {
			roots: &mut *self.roots,
			classes: &mut *self.classes,
			element_metas: &mut *self.element_metas,
			type_parameters: &mut *self.type_parameters,
			handles: self.handles,
			stack: &mut *self.stack,
			functions: self.functions,
		};
		gc::allocate(self.heap, words, &mut set)
	}

	fn throw_out_of_memory(&mut self, function_index: usize, pc: &mut usize) -> StepOutcome {
		let exception = self.roots.out_of_memory_instance;
		self.throw(function_index, pc, exception)
	}

	fn throwing_builtin_exception(&mut self, builtin: BuiltinId) -> Addr {
		self.exception_or_oom(match builtin {
			BuiltinId::ThrowNullReference => |roots: &Roots| roots.null_reference_exception,
			BuiltinId::ThrowCastError => |roots: &Roots| roots.cast_exception,
			BuiltinId::ThrowIndexOutOfBounds => |roots: &Roots| roots.index_out_of_bounds_exception,
			BuiltinId::ThrowArithmetic => |roots: &Roots| roots.arithmetic_exception,
			BuiltinId::ThrowOutOfMemory => |roots: &Roots| roots.out_of_memory_exception,
			_ => unreachable!("is_throwing() guards this path"),
		})
	}

	/// Allocates a fresh instance of a well-known exception class, falling
	/// back to the pre-allocated out-of-memory instance when even that
	/// allocation fails. `select` re-reads the class from the root set
	/// after the allocation, which may have moved it.
	fn exception_or_oom(&mut self, select: fn(&Roots) -> Addr) -> Addr {
		let class = select(self.roots);
		let instance_meta = ClassView::new(self.heap, class).instance_meta_addr();
		let words = self.heap.meta_of_block(instance_meta).size_of(0);
		match self.allocate(words) {
			Ok(addr) => {
				let class = select(self.roots);
				let instance_meta = ClassView::new(self.heap, class).instance_meta_addr();
				self.heap.set_word_at(addr, MetaWord::Regular(instance_meta).encode());
				addr
			}
			Err(_) => self.roots.out_of_memory_instance,
		}
	}

	fn dispatch_builtin(&mut self, builtin: BuiltinId) -> Result<(), HeapError> {
		match builtin {
			BuiltinId::PrintString => {
				let s = Addr(self.pop_i64() as u64 as usize);
				println!("{}", self.read_string(s));
			}
			BuiltinId::StringCompare => {
				let b = Addr(self.pop_i64() as u64 as usize);
				let a = Addr(self.pop_i64() as u64 as usize);
				let equal = self.read_string(a) == self.read_string(b);
				self.push_i64(equal as i64);
			}
			BuiltinId::StringConcat => {
				let b = Addr(self.pop_i64() as u64 as usize);
				let a = Addr(self.pop_i64() as u64 as usize);
				// Both operands are decoded into native strings before the
				// allocation below can move them.
				let joined = format!("{}{}", self.read_string(a), self.read_string(b));
				let addr = self.write_string(&joined)?;
				stack::push(self.heap, *self.stack, addr.0);
			}
			BuiltinId::I64ToString => {
				let value = self.pop_i64();
				let addr = self.write_string(&value.to_string())?;
				stack::push(self.heap, *self.stack, addr.0);
			}
			_ => unreachable!("throwing builtins are never dispatched here"),
		}
		Ok(())
	}

	fn read_string(&self, addr: Addr) -> String {
		let meta = self.heap.meta_of_block(addr);
		let length = self.heap.word_at(addr.offset(meta.length_offset));
		let bytes: Vec<u8> = (0..length).map(|i| self.heap.word_at(addr.offset(meta.instance_size + i)) as u8).collect();
		String::from_utf8_lossy(&bytes).into_owned()
	}

	fn write_string(&mut self, value: &str) -> Result<Addr, HeapError> {
		let meta = self.heap.meta_of_block(self.roots.string_meta);
		let addr = self.allocate(meta.size_of(value.len()))?;
		self.heap.set_word_at(addr, MetaWord::Regular(self.roots.string_meta).encode());
		self.heap.set_word_at(addr.offset(meta.length_offset), value.len());
		for (i, byte) in value.bytes().enumerate() {
			self.heap.set_word_at(addr.offset(meta.instance_size + i), byte as usize);
		}
		Ok(addr)
	}

	/// Walks up the frame chain looking for a handler whose try region
	/// covers the suspended pc, truncating the stack back to that frame and
	/// pushing the exception for the handler to pick up. `pc` is rewritten
	/// to the handler's entry point on success, so `step`'s caller resumes
	/// there as if nothing unusual happened.
	fn throw(&mut self, function_index: usize, pc: &mut usize, exception: Addr) -> StepOutcome {
		let mut function_index = function_index;
		let mut lookup_pc = *pc;
		loop {
			let function = &self.functions[function_index];
			if let Some(handler) = function.handler_covering(lookup_pc) {
				let fp = stack::fp(self.heap, *self.stack);
				self.truncate_sp_to(fp.0 + FRAME_CONTROL_SIZE + function.locals_count);
				stack::push(self.heap, *self.stack, exception.0);
				*pc = handler.handler_pc;
				return StepOutcome::Continue;
			}

			let fp = stack::fp(self.heap, *self.stack);
			let caller_fp = self.heap.word_at(fp.offset(stack::FP_OFFSET));
			if Addr(caller_fp).is_null() {
				stack::leave(self.heap, *self.stack);
				let argc = function.parameter_count();
				for _ in 0..argc {
					stack::pop(self.heap, *self.stack);
				}
				return StepOutcome::Unhandled(exception);
			}

			stack::leave(self.heap, *self.stack);
			let new_fp = stack::fp(self.heap, *self.stack);
			function_index = self.heap.word_at(new_fp.offset(stack::FUNCTION_OFFSET));
			let resume_pc = self.heap.word_at(new_fp.offset(stack::CALLER_PC_OFFSET));
			*pc = resume_pc;
			// The resume address is the instruction right after the call
			// that's still covered by the caller's try region; back up one
			// byte so a region ending exactly at the call site still
			// covers it.
			lookup_pc = resume_pc.saturating_sub(1);
		}
	}

	fn truncate_sp_to(&mut self, addr: usize) {
		while stack::sp(self.heap, *self.stack).0 > addr {
			stack::pop(self.heap, *self.stack);
		}
	}
}

enum StepOutcome {
	Continue,
	Return(i64),
	Unhandled(Addr),
}
