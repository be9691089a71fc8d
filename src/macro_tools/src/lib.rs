extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// Derive `apply_from`/`apply_to` between an in-memory mirror struct and the
/// on-disk struct named by `#[ApplyMemTo(Target)]`. Fields are matched by
/// name; the mirror may carry any subset of the target's fields.
#[proc_macro_derive(ApplyMem, attributes(ApplyMemTo))]
pub fn apply_mem_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    let name = &ast.ident;

    let target = ast
        .attrs
        .iter()
        .find(|a| a.path.is_ident("ApplyMemTo"))
        .and_then(|a| a.parse_args::<syn::Ident>().ok())
        .expect("ApplyMem requires #[ApplyMemTo(Target)]");

    let fields = match &ast.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => named
                .named
                .iter()
                .map(|f| f.ident.clone().expect("named field"))
                .collect::<Vec<_>>(),
            _ => panic!("ApplyMem only supports structs with named fields"),
        },
        _ => panic!("ApplyMem only supports structs"),
    };

    let gen = quote! {
        impl #name {
            /// Copy matching fields in from the on-disk struct.
            pub fn apply_from(&mut self, other: &#target) {
                #( self.#fields = other.#fields; )*
            }

            /// Copy matching fields out to the on-disk struct.
            pub fn apply_to(&self, other: &mut #target) {
                #( other.#fields = self.#fields; )*
            }
        }
    };
    gen.into()
}
