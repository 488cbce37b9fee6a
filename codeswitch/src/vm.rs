//! The embedding surface: a `Vm` owns the heap, the well-known roots, the
//! interpreter stack, and the handle storage, and is the single container
//! for all runtime state. External collaborators (the loader, a CLI) hand
//! it `Package`s and call loaded functions; everything else stays behind
//! this module's API.

use std::rc::Rc;

use bitflags::bitflags;

use crate::block::{Addr, Block, BlockType, Meta, MetaWord};
use crate::errors::{HeapError, LoadError};
use crate::function::{resolve_pointer_maps, FunctionBlueprint, TypeDesc};
use crate::gc;
use crate::handle::{HandleStorage, Persistent};
use crate::heap::{AllowAllocationScope, Heap};
use crate::interpreter::{CallResult, Interpreter, PackageBases};
use crate::roots::Roots;
use crate::stack;
use crate::types::{
	class_layout, class_meta, set_lower_bound, set_type_parameter_flags, set_upper_bound, type_parameter_meta, ClassView,
	Type, TypeParameterFlags,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct VmFlags: u64 {
		/// Run a full collection before every allocation. Catastrophically
		/// slow; exists to shake out missing roots and stale-pointer bugs
		/// in embedder code and in the interpreter itself.
		const COLLECT_EVERY_ALLOCATION = 1 << 0;
	}
}

pub const DEFAULT_HEAP_CAPACITY_WORDS: usize = 1 << 16;
pub const DEFAULT_STACK_CAPACITY_WORDS: usize = 1 << 12;

/// A loader-level class description. Indices reference classes earlier in
/// the same package's class list; `None`/absent means the built-in root
/// Object class. `instance_size` counts words including the meta-word.
pub struct ClassBlueprint {
	pub name: String,
	pub superclass: Option<u32>,
	pub interfaces: Vec<u32>,
	pub instance_size: usize,
	pub object_pointer_map: Vec<u64>,
}

/// A loader-level type parameter: flags plus both bounds. Bounds may
/// reference any class of the package, including ones whose own signatures
/// mention this parameter - `Vm::load` allocates every parameter block
/// before writing any bound, so such cycles resolve.
pub struct TypeParameterBlueprint {
	pub flags: TypeParameterFlags,
	pub upper_bound: TypeDesc,
	pub lower_bound: TypeDesc,
}

/// What the (external) loader produces: function blueprints plus the
/// constant-pool-like tables their bytecode operands index. This crate
/// deliberately has no file parser for it; tests and embedders assemble
/// packages in memory.
#[derive(Default)]
pub struct Package {
	pub functions: Vec<FunctionBlueprint>,
	pub classes: Vec<ClassBlueprint>,
	pub element_metas: Vec<Meta>,
	pub type_parameters: Vec<TypeParameterBlueprint>,
}

pub enum CallOutcome {
	Returned(i64),
	/// The exception that unwound past the outermost frame, already rooted:
	/// the embedder may run more calls (and thus collections) before
	/// inspecting it.
	UnhandledException(Persistent<Block>),
}

pub struct Vm {
	heap: Heap,
	handles: Rc<HandleStorage>,
	roots: Roots,
	functions: Vec<FunctionBlueprint>,
	packages: Vec<PackageBases>,
	classes: Vec<Addr>,
	element_metas: Vec<Addr>,
	type_parameters: Vec<Addr>,
	stack: Addr,
}

impl Vm {
	pub fn new(flags: VmFlags) -> Vm {
		Vm::with_capacities(flags, DEFAULT_HEAP_CAPACITY_WORDS, DEFAULT_STACK_CAPACITY_WORDS)
	}

	#[cfg_attr(feature = "tracing", instrument)]
	pub fn with_capacities(flags: VmFlags, heap_capacity_words: usize, stack_capacity_words: usize) -> Vm {
		let mut heap = Heap::with_capacity(heap_capacity_words);
		heap.set_collect_every_allocation(flags.contains(VmFlags::COLLECT_EVERY_ALLOCATION));
		let _allow = AllowAllocationScope::new(&heap);
		let roots = Roots::bootstrap(&mut heap);
		let stack = stack::allocate(&mut heap, roots.stack_meta, stack_capacity_words);
		Vm {
			heap,
			handles: HandleStorage::new(),
			roots,
			functions: Vec::new(),
			packages: Vec::new(),
			classes: Vec::new(),
			element_metas: Vec::new(),
			type_parameters: Vec::new(),
			stack,
		}
	}

	pub fn handles(&self) -> &Rc<HandleStorage> {
		&self.handles
	}

	pub fn heap(&self) -> &Heap {
		&self.heap
	}

	pub fn roots(&self) -> &Roots {
		&self.roots
	}

	/// Registers a package: allocates its classes, element metas, and type
	/// parameters as heap blocks (all rooted by the VM's tables), resolves
	/// the functions' pointer maps, and appends the functions. Returns the
	/// package's index; the package's own function 0 is at the global
	/// index `PackageBases::functions` of that entry.
	///
	/// Loading never collects: half-loaded blocks are not yet reachable
	/// from the VM's tables, so a collection here would sweep them. A heap
	/// too full to load into surfaces as `LoadError::Heap`.
	#[cfg_attr(feature = "tracing", instrument(skip(self, package)))]
	pub fn load(&mut self, package: Package) -> Result<usize, LoadError> {
		let _allow = AllowAllocationScope::new(&self.heap);
		let bases = PackageBases {
			functions: self.functions.len(),
			classes: self.classes.len(),
			element_metas: self.element_metas.len(),
		};

		for blueprint in &package.classes {
			let instance_meta_desc =
				Meta::fixed(BlockType::Object, blueprint.instance_size, blueprint.object_pointer_map.clone());
			let instance_meta = self.heap.allocate_meta(&instance_meta_desc)?;
			let class = self.heap.allocate_array(self.roots.class_meta, &class_meta(), blueprint.interfaces.len())?;
			let superclass = match blueprint.superclass {
				Some(index) => self.package_class(bases.classes, index),
				None => self.roots.object_class,
			};
			self.heap.set_word_at(class.offset(class_layout::SUPERCLASS), superclass.0);
			self.heap.set_word_at(class.offset(class_layout::INSTANCE_META), instance_meta.0);
			for (i, interface) in blueprint.interfaces.iter().enumerate() {
				let interface_addr = self.package_class(bases.classes, *interface);
				self.heap.set_word_at(class.offset(class_layout::INSTANCE_SIZE + i), interface_addr.0);
			}
			self.classes.push(class);
		}

		for meta in &package.element_metas {
			let addr = self.heap.allocate_meta(meta)?;
			self.element_metas.push(addr);
		}

		// Type parameters load in two phases: allocate every block with
		// null bounds first, then write the bounds, so bounds may reference
		// classes that reference these parameters back.
		let tp_base = self.type_parameters.len();
		let tp_meta_desc = type_parameter_meta();
		let tp_meta = self.heap.allocate_meta(&tp_meta_desc)?;
		for _ in &package.type_parameters {
			let tp = self.heap.allocate_fixed(tp_meta, &tp_meta_desc)?;
			self.type_parameters.push(tp);
		}
		for (i, blueprint) in package.type_parameters.iter().enumerate() {
			let tp = self.type_parameters[tp_base + i];
			set_type_parameter_flags(&mut self.heap, tp, blueprint.flags);
			let upper = self.resolve_type(bases.classes, blueprint.upper_bound);
			set_upper_bound(&mut self.heap, tp, upper);
			let lower = self.resolve_type(bases.classes, blueprint.lower_bound);
			set_lower_bound(&mut self.heap, tp, lower);
		}

		resolve_pointer_maps(&package.functions);
		let package_index = self.packages.len();
		for mut function in package.functions {
			function.package = package_index;
			self.functions.push(function);
		}
		self.packages.push(bases);
		Ok(package_index)
	}

	fn package_class(&self, class_base: usize, index: u32) -> Addr {
		*self
			.classes
			.get(class_base + index as usize)
			.unwrap_or_else(|| panic!("class index {index} references a class not yet loaded: malformed package"))
	}

	fn resolve_type(&self, class_base: usize, desc: TypeDesc) -> Type {
		match desc {
			TypeDesc::Primitive(primitive) => Type::Primitive(primitive),
			TypeDesc::Class(index) => Type::Class(self.package_class(class_base, index)),
		}
	}

	/// Synchronously runs the function at global index `function_index`.
	/// Arguments are raw word values typed by the function's parameter
	/// list; reference parameters must already be rooted by the caller.
	#[cfg_attr(feature = "tracing", instrument(skip(self, args)))]
	pub fn call(&mut self, function_index: usize, args: &[i64]) -> CallOutcome {
		let mut interpreter = Interpreter {
			heap: &mut self.heap,
			roots: &mut self.roots,
			handles: &self.handles,
			functions: &self.functions,
			packages: &self.packages,
			classes: &mut self.classes,
			element_metas: &mut self.element_metas,
			type_parameters: &mut self.type_parameters,
			stack: &mut self.stack,
		};
		let result = interpreter.call(function_index, args);
		match result {
			CallResult::Returned(value) => CallOutcome::Returned(value),
			CallResult::Unhandled(exception) => {
				CallOutcome::UnhandledException(Persistent::new(&self.handles, exception))
			}
		}
	}

	/// Allocates an instance of `class` for the embedder, collecting first
	/// if the heap is full. The caller must root the result through a
	/// handle before its next heap operation.
	pub fn allocate_instance(&mut self, class: Addr) -> Result<Addr, HeapError> {
		let class_handle = Persistent::<Block>::new(&self.handles, class);
		let words = {
			let instance_meta = ClassView::new(&self.heap, class).instance_meta_addr();
			self.heap.meta_of_block(instance_meta).size_of(0)
		};
		let _allow = AllowAllocationScope::new(&self.heap);
		let mut set = gc::RootSet {
			roots: &mut self.roots,
			classes: &mut self.classes,
			element_metas: &mut self.element_metas,
			type_parameters: &mut self.type_parameters,
			handles: &self.handles,
			stack: &mut self.stack,
			functions: &self.functions,
		};
		let addr = gc::allocate(&mut self.heap, words, &mut set)?;
		let instance_meta = ClassView::new(&self.heap, class_handle.get()).instance_meta_addr();
		self.heap.set_word_at(addr, MetaWord::Regular(instance_meta).encode());
		Ok(addr)
	}

	/// Allocates a string block holding `value`'s UTF-8 bytes. Strings have
	/// no literal form in bytecode; embedders create them here and pass
	/// them (rooted) as reference arguments.
	pub fn allocate_string(&mut self, value: &str) -> Result<Addr, HeapError> {
		let words = self.heap.meta_of_block(self.roots.string_meta).size_of(value.len());
		let _allow = AllowAllocationScope::new(&self.heap);
		let mut set = gc::RootSet {
			roots: &mut self.roots,
			classes: &mut self.classes,
			element_metas: &mut self.element_metas,
			type_parameters: &mut self.type_parameters,
			handles: &self.handles,
			stack: &mut self.stack,
			functions: &self.functions,
		};
		let addr = gc::allocate(&mut self.heap, words, &mut set)?;
		let meta = self.heap.meta_of_block(self.roots.string_meta);
		self.heap.set_word_at(addr, MetaWord::Regular(self.roots.string_meta).encode());
		self.heap.set_word_at(addr.offset(meta.length_offset), value.len());
		for (i, byte) in value.bytes().enumerate() {
			self.heap.set_word_at(addr.offset(meta.instance_size + i), byte as usize);
		}
		Ok(addr)
	}

	/// Forces one full collection, for embedders that know a good moment
	/// for the pause. Every handle stays valid; every raw `Addr` a caller
	/// kept outside a handle does not.
	pub fn collect_garbage(&mut self) -> usize {
		let mut set = gc::RootSet {
			roots: &mut self.roots,
			classes: &mut self.classes,
			element_metas: &mut self.element_metas,
			type_parameters: &mut self.type_parameters,
			handles: &self.handles,
			stack: &mut self.stack,
			functions: &self.functions,
		};
		gc::collect(&mut self.heap, &mut set)
	}
}
