//! Byte-stream and bit-twiddling helpers shared by the bytecode decoder
//! and the pointer-map machinery.

use std::io::{Cursor, Error, ErrorKind, Read};
use std::iter::repeat_with;

/// Reads a signed variable-byte number: 7 bits of payload per byte, high
/// bit set on every byte but the last, sign-extended from the final byte's
/// sixth bit. The one-byte form covers `[-64, 63]`.
pub fn read_vbn(stream: &mut Cursor<&[u8]>) -> std::io::Result<i64> {
	let mut result: i64 = 0;
	let mut shift = 0u32;
	loop {
		let mut byte = 0u8;
		stream.read_exact(std::slice::from_mut(&mut byte))?;
		result |= ((byte & 0x7f) as i64) << shift;
		shift += 7;
		if byte & 0x80 == 0 {
			if shift < 64 && (byte & 0x40) != 0 {
				result |= -1i64 << shift;
			}
			return Ok(result);
		}
		if shift >= 64 {
			return Err(Error::new(ErrorKind::InvalidData, "VBN too long"));
		}
	}
}

/// Writes `value` using the same encoding `read_vbn` decodes.
pub fn write_vbn(value: i64, out: &mut Vec<u8>) {
	let mut value = value;
	loop {
		let mut byte = (value & 0x7f) as u8;
		value >>= 7;
		let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
		if !done {
			byte |= 0x80;
		}
		out.push(byte);
		if done {
			return;
		}
	}
}

pub(crate) fn enumerate_set_bits(mut value: u64) -> impl Iterator<Item = usize> {
	repeat_with(move || match value.trailing_zeros() {
		usize::BITS => usize::MAX,
		idx => {
			let mask = !(1u64 << idx as u64);
			value &= mask;
			idx as usize
		}
	})
	.take_while(|i| *i != usize::MAX)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn vbn_round_trips_small_values() {
		for value in -64..64 {
			let mut buf = Vec::new();
			write_vbn(value, &mut buf);
			assert_eq!(buf.len(), 1, "small VBNs are one byte: {value}");
			let mut cursor = Cursor::new(buf.as_slice());
			assert_eq!(read_vbn(&mut cursor).unwrap(), value);
		}
	}

	#[test]
	fn vbn_round_trips_large_values() {
		for value in [i64::MIN, i64::MIN + 1, -1, 0, 1, 4096, -4096, i64::MAX] {
			let mut buf = Vec::new();
			write_vbn(value, &mut buf);
			let mut cursor = Cursor::new(buf.as_slice());
			assert_eq!(read_vbn(&mut cursor).unwrap(), value);
		}
	}

	#[test]
	fn enumerate_set_bits_lists_indices() {
		let bits: Vec<usize> = enumerate_set_bits(0x34).collect();
		assert_eq!(bits, vec![2, 4, 5]);
	}
}
