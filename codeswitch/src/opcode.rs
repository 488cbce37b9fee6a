//! The bytecode instruction set: one-byte opcodes, most carrying a single
//! VBN-encoded operand. Decoding happens off a `Cursor` the same way the
//! rest of this crate's binary formats are read.

use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Error, ErrorKind, Read, Result};

use crate::utilities::read_vbn;

macro_rules! debug_opcode {
	($name: ident, $f: expr, $self: expr, $ident: ident) => {
		if let $name::$ident = $self {
			return write!($f, "{}", stringify!($ident));
		}
	};
	($name: ident, $f: expr, $self: expr, $ident: ident($ty: ty)) => {
		if let $name::$ident(v) = $self {
			return write!($f, "{}({:?})", stringify!($ident), v);
		}
	};
}

macro_rules! define_opcodes {
    (
		enum $name: ident {
			$(
				$(#[$attr:meta])*
				$ident: ident $(($ty: ty))? = $discriminant: literal
			),* $(,)?
		}
	) => {
		#[repr(u8)]
		#[allow(non_camel_case_types)]
		#[derive(Copy, Clone, PartialEq)]
		pub enum $name {
			$(
				$(#[$attr])*
				$ident $(($ty))? = $discriminant
			),*
		}

		impl $name {
			pub fn read(stream: &mut Cursor<&[u8]>) -> Result<Self> {
				let mut discriminant = 0u8;
				stream.read_exact(std::slice::from_mut(&mut discriminant))?;
				match discriminant {
					$($discriminant => Ok($name::$ident $((read_vbn(stream)? as $ty))?),)*
					other => Err(Error::new(ErrorKind::InvalidData, format!("unknown opcode {other:#04x}"))),
				}
			}
		}

		impl Debug for $name {
			fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
				$(debug_opcode! { $name, f, self, $ident $(($ty))? })*
				Ok(())
			}
		}
	};
}

define_opcodes! {
	enum OpCode {
		/// Do nothing.
		nop = 0x00,
		/// Push the `i32` literal `0`.
		ldc_i4_0 = 0x01,
		/// Push a 32-bit integer literal.
		ldc_i4(i32) = 0x02,
		/// Push a 64-bit integer literal.
		ldc_i8(i64) = 0x03,
		/// Push a 32-bit float literal, bit-cast from its VBN-encoded bits.
		ldc_r4(i32) = 0x04,
		/// Push a 64-bit float literal, bit-cast from its VBN-encoded bits.
		ldc_r8(i64) = 0x05,
		/// Push the null reference.
		ldnull = 0x06,
		/// Duplicate the top of the expression stack.
		dup = 0x07,
		/// Discard the top of the expression stack.
		pop = 0x08,
		/// Load argument numbered `num` onto the stack.
		ldarg(u16) = 0x09,
		/// Pop a value into the argument numbered `num`.
		starg(u16) = 0x0A,
		/// Load local variable `num` onto the stack.
		ldloc(u16) = 0x0B,
		/// Pop a value into local variable `num`.
		stloc(u16) = 0x0C,
		/// Pop two numbers, push their sum.
		add = 0x10,
		/// Pop two numbers, push `value1 - value2`.
		sub = 0x11,
		/// Pop two numbers, push their product.
		mul = 0x12,
		/// Pop two numbers, push `value1 / value2`.
		div = 0x13,
		/// Pop two numbers, push `value1 % value2`.
		rem = 0x14,
		/// Negate the top of the stack.
		neg = 0x15,
		/// Bitwise AND.
		and = 0x16,
		/// Bitwise OR.
		or = 0x17,
		/// Bitwise XOR.
		xor = 0x18,
		/// Shift left.
		shl = 0x19,
		/// Arithmetic shift right.
		shr = 0x1A,
		/// Logical shift right.
		shr_un = 0x1B,
		/// Bitwise complement.
		not = 0x1C,
		/// Push `1` if the top two values are equal, else `0`.
		ceq = 0x20,
		/// Push `1` if `value1 > value2`, else `0`.
		cgt = 0x21,
		/// Push `1` if `value1 < value2`, else `0`.
		clt = 0x22,
		/// Pop two `f64` values, push their sum. The float instructions
		/// follow IEEE-754; division by zero yields an infinity, never a
		/// managed exception.
		fadd = 0x23,
		/// Pop two `f64` values, push `value1 - value2`.
		fsub = 0x24,
		/// Pop two `f64` values, push their product.
		fmul = 0x25,
		/// Pop two `f64` values, push `value1 / value2`.
		fdiv = 0x26,
		/// Truncate the `f64` on top of the stack to `i64`, saturating.
		fconv_i8 = 0x27,
		/// Convert the integer on top of the stack to `i32`.
		conv_i4 = 0x28,
		/// Convert the integer on top of the stack to `i64`.
		conv_i8 = 0x29,
		/// Convert the integer on top of the stack to `f32`.
		conv_r4 = 0x2A,
		/// Convert the integer on top of the stack to `f64`.
		conv_r8 = 0x2B,
		/// Push `1` if the top two `f64` values compare equal, else `0`.
		fceq = 0x2C,
		/// Push `1` if `value1 > value2` as `f64`, else `0`.
		fcgt = 0x2D,
		/// Push `1` if `value1 < value2` as `f64`, else `0`.
		fclt = 0x2E,
		/// Unconditional branch to a pc-offset.
		br(i32) = 0x30,
		/// Branch if the popped value is non-zero.
		brtrue(i32) = 0x31,
		/// Branch if the popped value is zero.
		brfalse(i32) = 0x32,
		/// Call the package-global function at the given index.
		callg(u32) = 0x33,
		/// Return from the current function, possibly with a value.
		ret = 0x34,
		/// Throw the reference on top of the stack.
		throw = 0x35,
		/// Allocate an instance of the class at the given constant index.
		allocobj(u32) = 0x40,
		/// Allocate an array of the element meta at the given index; pops
		/// the element count.
		newarr(u32) = 0x41,
		/// Push the length of the array reference on top of the stack.
		ldlen = 0x42,
		/// Push the plain-value field at the given word offset of the popped
		/// reference.
		ldfld(u32) = 0x43,
		/// Pop a value and a reference; store the value into the
		/// reference's field at the given word offset.
		stfld(u32) = 0x44,
		/// Pop an index and an array reference; push the plain-value element.
		ldelem = 0x45,
		/// Pop a value, an index, and an array reference; store the value.
		stelem = 0x46,
		/// Invoke the builtin with the given id.
		callbuiltin(u32) = 0x47,
		/// Push the reference field at the given word offset of the popped
		/// reference. Split from `ldfld` so the stack pointer map can type
		/// the loaded value without consulting class layouts.
		ldfldr(u32) = 0x48,
		/// Pop an index and an array reference; push the reference element.
		ldelemr = 0x49,
	}
}

impl OpCode {
	/// Instructions that may allocate or otherwise yield to the collector.
	/// The interpreter commits its pc-offset before executing one of these,
	/// and the stack pointer map carries a record for it. Instructions that
	/// can raise a managed exception belong here too: raising allocates the
	/// exception object.
	pub fn is_safepoint(&self) -> bool {
		matches!(
			self,
			OpCode::allocobj(_)
				| OpCode::newarr(_)
				| OpCode::callg(_)
				| OpCode::callbuiltin(_)
				| OpCode::div
				| OpCode::rem
				| OpCode::ldlen
				| OpCode::ldfld(_)
				| OpCode::ldfldr(_)
				| OpCode::stfld(_)
				| OpCode::ldelem
				| OpCode::ldelemr
				| OpCode::stelem
		)
	}

	/// Instructions after which control never falls through to the next
	/// instruction in byte order. A `callbuiltin` of a raising builtin
	/// counts: those builtins unwind instead of returning.
	pub fn ends_block(&self) -> bool {
		match self {
			OpCode::ret | OpCode::throw | OpCode::br(_) => true,
			OpCode::callbuiltin(id) => {
				crate::builtins::BuiltinId::from_repr(*id).is_some_and(|b| b.is_throwing())
			}
			_ => false,
		}
	}

	/// The pc-offset a branch instruction targets, if any.
	pub fn branch_target(&self, pc_after: usize) -> Option<usize> {
		match self {
			OpCode::br(delta) | OpCode::brtrue(delta) | OpCode::brfalse(delta) => {
				Some((pc_after as i64 + *delta as i64) as usize)
			}
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reads_a_no_operand_opcode() {
		let bytes = [0x08u8];
		let mut cursor = Cursor::new(&bytes[..]);
		assert_eq!(OpCode::read(&mut cursor).unwrap(), OpCode::pop);
	}

	#[test]
	fn reads_an_opcode_with_a_vbn_operand() {
		let mut bytes = vec![0x09u8];
		crate::utilities::write_vbn(7, &mut bytes);
		let mut cursor = Cursor::new(bytes.as_slice());
		assert_eq!(OpCode::read(&mut cursor).unwrap(), OpCode::ldarg(7));
	}

	#[test]
	fn rejects_an_unknown_discriminant() {
		let bytes = [0xFFu8];
		let mut cursor = Cursor::new(&bytes[..]);
		assert!(OpCode::read(&mut cursor).is_err());
	}
}
