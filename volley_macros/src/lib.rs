use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemStruct, parse_macro_input};

extern crate proc_macro;

/// Turns a plain struct into a unit-of-work payload.
///
/// Adds the serde and std derives `UnitParams` requires and implements the
/// marker trait. `UnitParams` has to be in scope at the call site.
#[proc_macro_attribute]
pub fn unit_params(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let input_struct = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics UnitParams for #input_struct #ty_generics #where_clause {}
    };

    TokenStream::from(expanded)
}
