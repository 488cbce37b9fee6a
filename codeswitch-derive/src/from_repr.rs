use proc_macro2::TokenStream;
use quote::quote;
use syn::{parse_quote, Data, DeriveInput, Fields, Type};

/// Generates `fn from_repr(discriminant) -> Option<Self>` for a fieldless
/// enum whose variants all carry explicit discriminants. Each match arm
/// compares the incoming value against the variant cast back to the
/// `#[repr]` type, so arbitrary constant expressions work as
/// discriminants without synthesising named constants for them.
pub fn derive(tokens: proc_macro::TokenStream) -> TokenStream {
	let DeriveInput { attrs, ident, generics, data, .. } = syn::parse(tokens).unwrap();

	let data = match data {
		Data::Enum(data) => data,
		Data::Struct(_) => panic!("FromRepr only supports enums"),
		Data::Union(_) => panic!("FromRepr only supports enums"),
	};

	if !generics.params.is_empty() {
		panic!("FromRepr does not support generic enums");
	}

	let mut repr: Type = parse_quote!(usize);
	for attr in attrs.iter() {
		if attr.path().is_ident("repr") {
			repr = attr.parse_args::<Type>().unwrap();
		}
	}

	let arms = data.variants.iter().map(|variant| {
		let name = &variant.ident;
		if variant.discriminant.is_none() {
			panic!("FromRepr requires an explicit discriminant for `{name}`");
		}
		if !matches!(variant.fields, Fields::Unit) {
			panic!("FromRepr requires fieldless variants; `{name}` has fields");
		}
		quote! {
			d if d == Self::#name as #repr => Some(Self::#name),
		}
	});

	quote! {
		impl #ident {
			pub(crate) fn from_repr(discriminant: #repr) -> Option<Self> {
				match discriminant {
					#(#arms)*
					_ => None,
				}
			}
		}
	}
}
