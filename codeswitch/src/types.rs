//! The nominal type system: primitive kinds, classes with single
//! inheritance plus interfaces, and type parameters whose bounds are
//! resolved after construction to let generic signatures reference classes
//! that are still being loaded (and vice versa).

use bitflags::bitflags;
use codeswitch_derive::{BlockLayout, FromRepr};
use derivative::Derivative;

use crate::block::{Addr, BlockType, Meta, MetaFlags, Ptr, Slot, Word};
use crate::heap::Heap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(usize)]
pub enum Primitive {
	Unit = 0,
	Boolean = 1,
	I8 = 2,
	I16 = 3,
	I32 = 4,
	I64 = 5,
	F32 = 6,
	F64 = 7,
}

impl Primitive {
	pub fn width_bytes(self) -> usize {
		match self {
			Primitive::Unit => 0,
			Primitive::Boolean | Primitive::I8 => 1,
			Primitive::I16 => 2,
			Primitive::I32 | Primitive::F32 => 4,
			Primitive::I64 | Primitive::F64 => 8,
		}
	}
}

const TYPE_TAG_MASK: usize = 0b11;
const TYPE_TAG_PRIMITIVE: usize = 0b00;
const TYPE_TAG_CLASS: usize = 0b01;
const TYPE_TAG_TYPE_PARAMETER: usize = 0b10;

/// A type: a primitive kind, or a reference to a `Class` or `TypeParameter`
/// block. Stored as a `(kind_word, target_word)` pair rather than a single
/// packed word so that `target_word` is always either a real heap address
/// or `0` - never a small integer a generic pointer bitmap could mistake
/// for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
	Primitive(Primitive),
	Class(Addr),
	TypeParameter(Addr),
}

impl Type {
	pub fn decode_pair(kind_word: Word, target_word: Word) -> Type {
		match kind_word & TYPE_TAG_MASK {
			TYPE_TAG_PRIMITIVE => {
				Type::Primitive(Primitive::from_repr(kind_word >> 2).unwrap_or_else(|| panic!("corrupt primitive discriminant: {}", kind_word >> 2)))
			}
			TYPE_TAG_CLASS => Type::Class(Addr(target_word)),
			TYPE_TAG_TYPE_PARAMETER => Type::TypeParameter(Addr(target_word)),
			tag => panic!("corrupt type kind word tag: {tag:#04b}"),
		}
	}

	pub fn encode_pair(self) -> (Word, Word) {
		match self {
			Type::Primitive(p) => (((p as usize) << 2) | TYPE_TAG_PRIMITIVE, 0),
			Type::Class(addr) => (TYPE_TAG_CLASS, addr.0),
			Type::TypeParameter(addr) => (TYPE_TAG_TYPE_PARAMETER, addr.0),
		}
	}
}

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ClassFlags: u64 {
		const ABSTRACT = 1 << 0;
		const FINAL = 1 << 1;
	}
}

/// Word layout of a `Class` block's fixed region; interfaces follow as a
/// trailing array of one `Addr` each, counted by `interface_count`.
#[derive(BlockLayout)]
#[allow(dead_code)]
struct ClassFields {
	superclass: Ptr,
	instance_meta: Ptr,
	flags: Slot,
	interface_count: Slot,
}

pub use classfields_layout as class_layout;

/// The `Meta` describing `Class` blocks: the fixed fields of
/// `class_layout`, plus one trailing reference slot per implemented
/// interface, counted by the `interface_count` field.
pub fn class_meta() -> Meta {
	Meta {
		block_type: BlockType::Class,
		instance_size: class_layout::INSTANCE_SIZE,
		element_size: 1,
		length_offset: class_layout::INTERFACE_COUNT,
		flags: MetaFlags::HAS_POINTERS | MetaFlags::HAS_ELEMENT_POINTERS,
		object_pointer_map: vec![class_layout::POINTER_BITMAP],
		element_pointer_map: vec![0b1],
	}
}

/// A read-only view of a `Class` block: the address plus the heap needed
/// to interpret its fields. Mirrors the address-plus-heap pattern every
/// typed accessor in this crate uses instead of raw pointer casts.
#[derive(Derivative, Clone, Copy)]
#[derivative(Debug)]
pub struct ClassView<'h> {
	#[derivative(Debug = "ignore")]
	heap: &'h Heap,
	pub addr: Addr,
}

impl<'h> ClassView<'h> {
	pub fn new(heap: &'h Heap, addr: Addr) -> ClassView<'h> {
		ClassView { heap, addr }
	}

	pub fn superclass(&self) -> Option<ClassView<'h>> {
		let raw = self.heap.word_at(self.addr.offset(class_layout::SUPERCLASS));
		(raw != 0).then(|| ClassView::new(self.heap, Addr(raw)))
	}

	pub fn instance_meta_addr(&self) -> Addr {
		Addr(self.heap.word_at(self.addr.offset(class_layout::INSTANCE_META)))
	}

	pub fn flags(&self) -> ClassFlags {
		ClassFlags::from_bits_truncate(self.heap.word_at(self.addr.offset(class_layout::FLAGS)) as u64)
	}

	pub fn interface_count(&self) -> usize {
		self.heap.word_at(self.addr.offset(class_layout::INTERFACE_COUNT))
	}

	pub fn interface(&self, index: usize) -> ClassView<'h> {
		let slot = self.addr.offset(class_layout::INSTANCE_SIZE + index);
		ClassView::new(self.heap, Addr(self.heap.word_at(slot)))
	}

	/// Walks the superclass chain and every implemented interface's own
	/// chain, depth-first, looking for `other`.
	pub fn is_subclass_of(&self, other: &ClassView<'h>) -> bool {
		if self.addr == other.addr {
			return true;
		}
		if let Some(superclass) = self.superclass() {
			if superclass.is_subclass_of(other) {
				return true;
			}
		}
		(0..self.interface_count()).any(|i| self.interface(i).is_subclass_of(other))
	}
}

/// Word layout of a `TypeParameter` block: upper and lower bound, each
/// stored as a `(kind, target)` pair so bound mutation after construction
/// (resolving a cyclic type graph at load time) is a plain word write.
#[derive(BlockLayout)]
#[allow(dead_code)]
struct TypeParameterFields {
	upper_bound_kind: Slot,
	upper_bound_target: Ptr,
	lower_bound_kind: Slot,
	lower_bound_target: Ptr,
	flags: Slot,
}

pub use typeparameterfields_layout as type_parameter_layout;

pub fn type_parameter_meta() -> Meta {
	Meta::fixed(
		BlockType::TypeParameter,
		type_parameter_layout::INSTANCE_SIZE,
		vec![type_parameter_layout::POINTER_BITMAP],
	)
}

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct TypeParameterFlags: u64 {
		const COVARIANT = 1 << 0;
		const CONTRAVARIANT = 1 << 1;
	}
}

#[derive(Derivative, Clone, Copy)]
#[derivative(Debug)]
pub struct TypeParameterView<'h> {
	#[derivative(Debug = "ignore")]
	heap: &'h Heap,
	pub addr: Addr,
}

impl<'h> TypeParameterView<'h> {
	pub fn new(heap: &'h Heap, addr: Addr) -> TypeParameterView<'h> {
		TypeParameterView { heap, addr }
	}

	pub fn upper_bound(&self) -> Type {
		Type::decode_pair(
			self.heap.word_at(self.addr.offset(type_parameter_layout::UPPER_BOUND_KIND)),
			self.heap.word_at(self.addr.offset(type_parameter_layout::UPPER_BOUND_TARGET)),
		)
	}

	pub fn lower_bound(&self) -> Type {
		Type::decode_pair(
			self.heap.word_at(self.addr.offset(type_parameter_layout::LOWER_BOUND_KIND)),
			self.heap.word_at(self.addr.offset(type_parameter_layout::LOWER_BOUND_TARGET)),
		)
	}

	pub fn flags(&self) -> TypeParameterFlags {
		TypeParameterFlags::from_bits_truncate(self.heap.word_at(self.addr.offset(type_parameter_layout::FLAGS)) as u64)
	}
}

/// The bound setters below are the load-time half of the two-phase
/// initialisation that resolves cyclic type graphs: a `TypeParameter` is
/// allocated with null bounds first, so the classes its bounds mention can
/// be allocated (and can mention it back) before either bound is written.
/// Steady-state interpretation never mutates a bound.
pub fn set_type_parameter_flags(heap: &mut Heap, type_parameter: Addr, flags: TypeParameterFlags) {
	heap.set_word_at(type_parameter.offset(type_parameter_layout::FLAGS), flags.bits() as usize);
}

/// Mutates an already-allocated `TypeParameter`'s upper bound. Used during
/// package loading to close cycles between a generic class and the type
/// parameters that reference it back, after both have been allocated but
/// before either is reachable from a root.
pub fn set_upper_bound(heap: &mut Heap, type_parameter: Addr, bound: Type) {
	let (kind, target) = bound.encode_pair();
	heap.set_word_at(type_parameter.offset(type_parameter_layout::UPPER_BOUND_KIND), kind);
	heap.set_word_at(type_parameter.offset(type_parameter_layout::UPPER_BOUND_TARGET), target);
}

pub fn set_lower_bound(heap: &mut Heap, type_parameter: Addr, bound: Type) {
	let (kind, target) = bound.encode_pair();
	heap.set_word_at(type_parameter.offset(type_parameter_layout::LOWER_BOUND_KIND), kind);
	heap.set_word_at(type_parameter.offset(type_parameter_layout::LOWER_BOUND_TARGET), target);
}

/// `sub <: sup`. Reflexive for every type; a type parameter on the left
/// defers to its upper bound, on the right to its lower bound - the usual
/// bounded-quantification rule.
pub fn is_subtype(heap: &Heap, sub: Type, sup: Type) -> bool {
	if sub == sup {
		return true;
	}
	match (sub, sup) {
		(Type::Primitive(a), Type::Primitive(b)) => a == b,
		(Type::Class(a), Type::Class(b)) => ClassView::new(heap, a).is_subclass_of(&ClassView::new(heap, b)),
		(Type::TypeParameter(a), _) => is_subtype(heap, TypeParameterView::new(heap, a).upper_bound(), sup),
		(_, Type::TypeParameter(b)) => is_subtype(heap, sub, TypeParameterView::new(heap, b).lower_bound()),
		_ => false,
	}
}
