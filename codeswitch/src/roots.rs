//! The handful of blocks a VM needs before any package is loaded: metas for
//! the built-in array block kinds, the interpreter stack's meta, and the
//! class hierarchy backing the well-known exceptions the builtins raise.

use crate::block::{Addr, BlockType, Meta, MetaFlags};
use crate::heap::Heap;
use crate::stack;
use crate::types::{class_layout, class_meta};

/// One field, a `Ptr` to the exception's message string, shared by every
/// exception class bootstrapped here - their instances all have the same
/// shape, so one `Meta` describes all of them.
fn exception_instance_meta() -> Meta {
	Meta::fixed(BlockType::Object, 2, vec![0b10])
}

/// A plain array of one-word elements, used as a string's UTF-8 byte
/// backing store (one byte per word; the heap has no sub-word addressing)
/// and as the default shape `newarr` falls back to when a package supplies
/// no element meta of its own.
fn word_array_meta(block_type: BlockType) -> Meta {
	Meta {
		block_type,
		instance_size: 2,
		element_size: 1,
		length_offset: 1,
		flags: MetaFlags::empty(),
		object_pointer_map: Vec::new(),
		element_pointer_map: Vec::new(),
	}
}

/// An array of one-word reference elements.
fn ref_array_meta() -> Meta {
	Meta {
		block_type: BlockType::WordArray,
		instance_size: 2,
		element_size: 1,
		length_offset: 1,
		flags: MetaFlags::HAS_ELEMENT_POINTERS,
		object_pointer_map: Vec::new(),
		element_pointer_map: vec![0b1],
	}
}

pub struct Roots {
	pub string_meta: Addr,
	pub byte_array_meta: Addr,
	pub ref_array_meta: Addr,
	pub class_meta: Addr,
	pub stack_meta: Addr,
	pub object_class: Addr,
	pub exception_class: Addr,
	pub null_reference_exception: Addr,
	pub cast_exception: Addr,
	pub index_out_of_bounds_exception: Addr,
	pub arithmetic_exception: Addr,
	pub out_of_memory_exception: Addr,
	/// Pre-allocated instance of `out_of_memory_exception`, thrown when an
	/// allocation fails for good: allocating a fresh exception at that
	/// point would itself fail.
	pub out_of_memory_instance: Addr,
}

impl Roots {
	pub fn bootstrap(heap: &mut Heap) -> Roots {
		let string_meta = heap.allocate_meta(&word_array_meta(BlockType::String)).expect("bootstrap: string meta");
		let byte_array_meta = heap.allocate_meta(&word_array_meta(BlockType::ByteArray)).expect("bootstrap: byte array meta");
		let ref_array_meta = heap.allocate_meta(&ref_array_meta()).expect("bootstrap: ref array meta");
		let class_meta_addr = heap.allocate_meta(&class_meta()).expect("bootstrap: class meta");
		let stack_meta = heap.allocate_meta(&stack::meta()).expect("bootstrap: stack meta");
		let instance_meta = heap.allocate_meta(&exception_instance_meta()).expect("bootstrap: exception instance meta");

		let object_class = alloc_class(heap, class_meta_addr, Addr::NULL, instance_meta);
		let exception_class = alloc_class(heap, class_meta_addr, object_class, instance_meta);
		let null_reference_exception = alloc_class(heap, class_meta_addr, exception_class, instance_meta);
		let cast_exception = alloc_class(heap, class_meta_addr, exception_class, instance_meta);
		let index_out_of_bounds_exception = alloc_class(heap, class_meta_addr, exception_class, instance_meta);
		let arithmetic_exception = alloc_class(heap, class_meta_addr, exception_class, instance_meta);
		let out_of_memory_exception = alloc_class(heap, class_meta_addr, exception_class, instance_meta);

		let out_of_memory_instance = heap
			.allocate_fixed(instance_meta, &exception_instance_meta())
			.expect("bootstrap: out-of-memory instance");

		Roots {
			string_meta,
			byte_array_meta,
			ref_array_meta,
			class_meta: class_meta_addr,
			stack_meta,
			object_class,
			exception_class,
			null_reference_exception,
			cast_exception,
			index_out_of_bounds_exception,
			arithmetic_exception,
			out_of_memory_exception,
			out_of_memory_instance,
		}
	}

	/// Runs `f` over every well-known block address, in a fixed order, so
	/// the collector can read the whole set out and write the forwarded
	/// addresses back in.
	pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut Addr)) {
		f(&mut self.string_meta);
		f(&mut self.byte_array_meta);
		f(&mut self.ref_array_meta);
		f(&mut self.class_meta);
		f(&mut self.stack_meta);
		f(&mut self.object_class);
		f(&mut self.exception_class);
		f(&mut self.null_reference_exception);
		f(&mut self.cast_exception);
		f(&mut self.index_out_of_bounds_exception);
		f(&mut self.arithmetic_exception);
		f(&mut self.out_of_memory_exception);
		f(&mut self.out_of_memory_instance);
	}

	/// The bootstrap set as a flat value list, in `for_each_mut`'s order,
	/// for callers driving `Heap::collect` directly.
	pub fn as_roots(&self) -> Vec<Addr> {
		vec![
			self.string_meta,
			self.byte_array_meta,
			self.ref_array_meta,
			self.class_meta,
			self.stack_meta,
			self.object_class,
			self.exception_class,
			self.null_reference_exception,
			self.cast_exception,
			self.index_out_of_bounds_exception,
			self.arithmetic_exception,
			self.out_of_memory_exception,
			self.out_of_memory_instance,
		]
	}
}

fn alloc_class(heap: &mut Heap, class_meta_addr: Addr, superclass: Addr, instance_meta: Addr) -> Addr {
	let addr = heap.allocate_array(class_meta_addr, &class_meta(), 0).expect("bootstrap: class instance");
	heap.set_word_at(addr.offset(class_layout::SUPERCLASS), superclass.0);
	heap.set_word_at(addr.offset(class_layout::INSTANCE_META), instance_meta.0);
	addr
}
