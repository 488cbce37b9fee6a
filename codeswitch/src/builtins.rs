//! The builtin dispatch table: native routines and well-known-exception
//! raisers the interpreter's `callbuiltin` opcode invokes by id.

use codeswitch_derive::FromRepr;

/// The smallest catalog exercising every error-handling path this crate's
/// interpreter needs end to end: two real native routines plus one raiser
/// per managed exception kind `interpreter.rs` can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum BuiltinId {
	StringConcat = 0,
	StringCompare = 1,
	PrintString = 2,
	ThrowNullReference = 3,
	ThrowCastError = 4,
	ThrowIndexOutOfBounds = 5,
	ThrowArithmetic = 6,
	ThrowOutOfMemory = 7,
	I64ToString = 8,
}

impl BuiltinId {
	/// The raising builtins never return normally; the interpreter routes
	/// them straight into `do_throw` instead of pushing a result.
	pub fn is_throwing(self) -> bool {
		!matches!(
			self,
			BuiltinId::StringConcat | BuiltinId::StringCompare | BuiltinId::PrintString | BuiltinId::I64ToString
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_discriminant_round_trips_through_from_repr() {
		for id in [
			BuiltinId::StringConcat,
			BuiltinId::StringCompare,
			BuiltinId::PrintString,
			BuiltinId::ThrowNullReference,
			BuiltinId::ThrowCastError,
			BuiltinId::ThrowIndexOutOfBounds,
			BuiltinId::ThrowArithmetic,
			BuiltinId::ThrowOutOfMemory,
			BuiltinId::I64ToString,
		] {
			assert_eq!(BuiltinId::from_repr(id as u32), Some(id));
		}
	}

	#[test]
	fn only_error_raisers_are_throwing() {
		assert!(!BuiltinId::PrintString.is_throwing());
		assert!(BuiltinId::ThrowArithmetic.is_throwing());
	}
}
