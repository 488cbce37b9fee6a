mod from_repr;
mod layout;

use proc_macro::TokenStream;

#[proc_macro_derive(FromRepr)]
pub fn derive_from_repr(input: TokenStream) -> TokenStream {
	from_repr::derive(input).into()
}

#[proc_macro_derive(BlockLayout)]
pub fn derive_block_layout(input: TokenStream) -> TokenStream {
	layout::derive(input).into()
}
