use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Field, Fields, Type};

/// Assigns sequential word offsets to the fields of a block-layout marker
/// struct and records which offsets hold managed references.
///
/// Each field's type must be either `Ptr` (a slot holding a reference) or
/// `Slot` (a slot holding plain data); the field's own value is never
/// used, only its position and type. Word 0 of every block is the
/// meta-word and is never described by a layout struct - offsets start at
/// word 1.
pub fn derive(tokens: proc_macro::TokenStream) -> TokenStream {
	let DeriveInput { ident, data, .. } = syn::parse(tokens).unwrap();

	let data = match data {
		Data::Struct(data) => data,
		Data::Enum(_) => panic!("Enums are not supported"),
		Data::Union(_) => panic!("Unions are not supported"),
	};

	let fields = match data.fields {
		Fields::Named(named) => named.named,
		_ => panic!("BlockLayout requires named fields"),
	};

	let mut consts = Vec::with_capacity(fields.len());
	let mut pointer_offsets = Vec::new();
	let mut offset = 1usize; // word 0 is the meta-word, owned by the heap, never by the layout.

	for Field { ident: field_ident, ty, .. } in fields.iter() {
		let field_ident = field_ident.as_ref().expect("named field");
		let const_ident = format_ident!("{}", field_ident.to_string().to_uppercase());
		let is_pointer = match &ty {
			Type::Path(path) => path.path.is_ident("Ptr"),
			_ => panic!("BlockLayout fields must be `Ptr` or `Slot`"),
		};

		consts.push(quote! {
			pub const #const_ident: usize = #offset;
		});
		if is_pointer {
			pointer_offsets.push(offset);
		}
		offset += 1;
	}

	let instance_size = offset;
	let mod_ident = format_ident!("{}_layout", ident.to_string().to_lowercase());
	let bitmap: u64 = pointer_offsets.iter().fold(0u64, |acc, o| acc | (1u64 << *o));

	quote! {
		#[allow(dead_code)]
		pub mod #mod_ident {
			#(#consts)*
			pub const INSTANCE_SIZE: usize = #instance_size;
			pub const POINTER_BITMAP: u64 = #bitmap;
		}
	}
}
