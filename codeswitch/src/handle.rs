//! The two root-set mechanisms native code uses to keep heap blocks alive
//! across a collection: scoped local handles, cheap and stack-discipline
//! only, and ref-counted persistent handles that can outlive any scope.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::block::Addr;

/// Owns every local and persistent handle slot. A `VM` holds exactly one,
/// shared (via `Rc`) with every `Persistent<T>` so the last clone's `Drop`
/// can release its slot.
pub struct HandleStorage {
	can_create_local: Cell<bool>,
	local_slots: RefCell<Vec<Addr>>,
	persistent_slots: RefCell<Vec<Option<Addr>>>,
	persistent_free_list: RefCell<Vec<usize>>,
}

impl HandleStorage {
	pub fn new() -> Rc<HandleStorage> {
		Rc::new(HandleStorage {
			can_create_local: Cell::new(false),
			local_slots: RefCell::new(Vec::new()),
			persistent_slots: RefCell::new(Vec::new()),
			persistent_free_list: RefCell::new(Vec::new()),
		})
	}

	fn create_local(&self, addr: Addr) -> usize {
		assert!(self.can_create_local.get(), "no active HandleScope: local handles may only be created within one");
		let mut slots = self.local_slots.borrow_mut();
		slots.push(addr);
		slots.len() - 1
	}

	fn read_local(&self, slot: usize) -> Addr {
		self.local_slots.borrow()[slot]
	}

	fn write_local(&self, slot: usize, addr: Addr) {
		self.local_slots.borrow_mut()[slot] = addr;
	}

	fn local_count(&self) -> usize {
		self.local_slots.borrow().len()
	}

	fn truncate_locals(&self, to: usize) {
		self.local_slots.borrow_mut().truncate(to);
	}

	/// Enumerates every live local slot, for the collector's root pass.
	pub fn for_each_local_mut(&self, mut f: impl FnMut(&mut Addr)) {
		for slot in self.local_slots.borrow_mut().iter_mut() {
			f(slot);
		}
	}

	/// Enumerates every live persistent slot, for the collector's root
	/// pass.
	pub fn for_each_persistent_mut(&self, mut f: impl FnMut(&mut Addr)) {
		for slot in self.persistent_slots.borrow_mut().iter_mut().flatten() {
			f(slot);
		}
	}

	fn create_persistent(&self, addr: Addr) -> usize {
		let mut free_list = self.persistent_free_list.borrow_mut();
		if let Some(index) = free_list.pop() {
			self.persistent_slots.borrow_mut()[index] = Some(addr);
			index
		} else {
			let mut slots = self.persistent_slots.borrow_mut();
			slots.push(Some(addr));
			slots.len() - 1
		}
	}

	fn read_persistent(&self, slot: usize) -> Addr {
		self.persistent_slots.borrow()[slot].expect("persistent handle read after release")
	}

	fn destroy_persistent(&self, slot: usize) {
		self.persistent_slots.borrow_mut()[slot] = None;
		self.persistent_free_list.borrow_mut().push(slot);
	}
}

/// A scope of local handles: every `Local` created while a scope is active
/// is truncated away when the scope is dropped, except the one (at most)
/// passed to `escape`, which survives into the enclosing scope.
pub struct HandleScope<'s> {
	storage: &'s HandleStorage,
	escape_slot: usize,
	was_active: bool,
	escaped: bool,
}

impl<'s> HandleScope<'s> {
	/// Every scope reserves one local slot up front - the escape slot -
	/// positioned before any of the scope's own locals so it survives
	/// this scope's truncation without needing to move anything.
	pub fn new(storage: &'s HandleStorage) -> HandleScope<'s> {
		let was_active = storage.can_create_local.replace(true);
		let escape_slot = storage.create_local(Addr::NULL);
		HandleScope {
			storage,
			escape_slot,
			was_active,
			escaped: false,
		}
	}

	pub fn local<T>(&self, addr: Addr) -> Local<'s, T> {
		let slot = self.storage.create_local(addr);
		Local { storage: self.storage, slot, _marker: PhantomData }
	}

	/// Moves `local`'s value into this scope's reserved escape slot, so it
	/// survives this scope's truncation and is visible in the enclosing
	/// scope. Only the first call per scope has any lasting effect,
	/// matching the single-return-value discipline of a native function
	/// body.
	pub fn escape<T>(&mut self, local: Local<'s, T>) -> Local<'s, T> {
		self.storage.write_local(self.escape_slot, local.get());
		self.escaped = true;
		Local { storage: self.storage, slot: self.escape_slot, _marker: PhantomData }
	}
}

impl Drop for HandleScope<'_> {
	fn drop(&mut self) {
		let keep_to = if self.escaped { self.escape_slot + 1 } else { self.escape_slot };
		self.storage.truncate_locals(keep_to);
		self.storage.can_create_local.set(self.was_active);
	}
}

/// A handle into the local slot sequence, valid only while the scope that
/// created it (or an ancestor it escaped into) is alive. Borrowing
/// `&'s HandleStorage` directly, rather than holding a raw pointer, is what
/// keeps this type entirely free of `unsafe`.
pub struct Local<'s, T> {
	storage: &'s HandleStorage,
	slot: usize,
	_marker: PhantomData<T>,
}

impl<'s, T> Local<'s, T> {
	pub fn get(&self) -> Addr {
		self.storage.read_local(self.slot)
	}

	pub fn set(&self, addr: Addr) {
		self.storage.write_local(self.slot, addr);
	}
}

impl<T> Clone for Local<'_, T> {
	fn clone(&self) -> Self {
		Local { storage: self.storage, slot: self.slot, _marker: PhantomData }
	}
}

impl<T> Copy for Local<'_, T> {}

struct PersistentInner {
	storage: Rc<HandleStorage>,
	slot: usize,
}

impl Drop for PersistentInner {
	fn drop(&mut self) {
		self.storage.destroy_persistent(self.slot);
	}
}

/// A ref-counted handle that survives across scopes and collections,
/// released only once its last clone drops.
pub struct Persistent<T> {
	inner: Rc<PersistentInner>,
	_marker: PhantomData<T>,
}

impl<T> Persistent<T> {
	pub fn new(storage: &Rc<HandleStorage>, addr: Addr) -> Persistent<T> {
		let slot = storage.create_persistent(addr);
		Persistent {
			inner: Rc::new(PersistentInner { storage: Rc::clone(storage), slot }),
			_marker: PhantomData,
		}
	}

	pub fn get(&self) -> Addr {
		self.inner.storage.read_persistent(self.inner.slot)
	}

	/// Drops this handle's reference count eagerly; equivalent to letting
	/// the value fall out of scope, spelled out for call sites that want
	/// to document the release explicitly.
	pub fn release(self) {
		drop(self);
	}
}

impl<T> Clone for Persistent<T> {
	fn clone(&self) -> Self {
		Persistent { inner: Rc::clone(&self.inner), _marker: PhantomData }
	}
}
