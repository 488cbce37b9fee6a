use std::fmt;

/// Resource exhaustion inside the managed heap, distinct from a managed
/// exception: the caller has no object to hold it, since the allocation
/// that would have carried it never happened.
#[derive(Debug)]
pub enum HeapError {
	OutOfMemory { requested_words: usize },
}

impl fmt::Display for HeapError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::OutOfMemory { requested_words } => {
				write!(f, "out of memory allocating {requested_words} words")
			}
		}
	}
}

/// Errors surfaced while reading a `Package` (function table, constant
/// pool) from a byte stream. Bytecode file-format parsing is out of scope;
/// this only covers the minimal in-memory structures the interpreter needs.
#[derive(Debug)]
pub enum LoadError {
	Io(std::io::Error),
	Heap(HeapError),
	MalformedBytecode { function: usize, offset: usize },
	UnknownBuiltin(u32),
}

impl fmt::Display for LoadError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Io(e) => write!(f, "{e}"),
			Self::Heap(e) => write!(f, "{e}"),
			Self::MalformedBytecode { function, offset } => {
				write!(f, "malformed bytecode in function {function} at offset {offset}")
			}
			Self::UnknownBuiltin(id) => write!(f, "unknown builtin id {id}"),
		}
	}
}

impl From<std::io::Error> for LoadError {
	fn from(value: std::io::Error) -> Self {
		Self::Io(value)
	}
}

impl From<HeapError> for LoadError {
	fn from(value: HeapError) -> Self {
		Self::Heap(value)
	}
}

impl std::error::Error for HeapError {}
impl std::error::Error for LoadError {}
