use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr, parse_macro_input};

#[proc_macro_derive(FuzzerState)]
pub fn derive_fuzzer_state(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields = match input.data {
        Data::Struct(ref data) => &data.fields,
        _ => {
            return syn::Error::new_spanned(name, "FuzzerState can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let field_access = match fields {
        Fields::Unnamed(fields) => {
            if fields.unnamed.len() == 1 {
                quote! { 0 }
            } else {
                return syn::Error::new_spanned(name, "FuzzerState derive currently only supports newtype structs (tuple structs with one field)").to_compile_error().into();
            }
        }
        Fields::Named(fields) => {
            let state_field = fields
                .named
                .iter()
                .find(|f| f.ident.as_ref().is_some_and(|id| id == "state"));

            if let Some(f) = state_field {
                let id = &f.ident;
                quote! { #id }
            } else {
                return syn::Error::new_spanned(
                    name,
                    "FuzzerState derive on named structs requires a field named 'state'",
                )
                .to_compile_error()
                .into();
            }
        }
        Fields::Unit => {
            return syn::Error::new_spanned(name, "FuzzerState cannot be derived for unit structs")
                .to_compile_error()
                .into();
        }
    };

    let expanded = quote! {
        impl AsRef<::callfuzz::fuzzer::FuzzerState> for #name {
            fn as_ref(&self) -> &::callfuzz::fuzzer::FuzzerState {
                &self.#field_access
            }
        }

        impl AsMut<::callfuzz::fuzzer::FuzzerState> for #name {
            fn as_mut(&mut self) -> &mut ::callfuzz::fuzzer::FuzzerState {
                &mut self.#field_access
            }
        }
    };

    TokenStream::from(expanded)
}

struct ObjectField {
    ident: syn::Ident,
    key: LitStr,
    readonly: bool,
}

/// Implements `callfuzz::value::Object` for a struct with named fields.
///
/// Every field must implement `callfuzz::value::FieldValue`, unless it is marked
/// `#[object(skip)]`. Fields marked `#[object(readonly)]` are listed and can be
/// read, but refuse new values. The struct must be `Clone`.
#[proc_macro_derive(Object, attributes(object))]
pub fn derive_object(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_object(&input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand_object(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let named = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "Object can only be derived for structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "Object can only be derived for structs",
            ));
        }
    };

    let mut fields = Vec::new();
    for field in named {
        let mut skip = false;
        let mut readonly = false;
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("object")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    skip = true;
                    Ok(())
                } else if meta.path.is_ident("readonly") {
                    readonly = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `skip` or `readonly`"))
                }
            })?;
        }
        if skip {
            continue;
        }
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new_spanned(field, "field has no name"))?;
        let key = LitStr::new(&ident.to_string(), ident.span());
        fields.push(ObjectField {
            ident,
            key,
            readonly,
        });
    }

    let keys: Vec<&LitStr> = fields.iter().map(|f| &f.key).collect();
    let getters = fields.iter().map(|f| {
        let (ident, key) = (&f.ident, &f.key);
        quote! {
            #key => Ok(::callfuzz::value::FieldValue::to_value(&self.#ident)),
        }
    });
    let setters = fields.iter().map(|f| {
        let (ident, key) = (&f.ident, &f.key);
        if f.readonly {
            quote! {
                #key => Err(::callfuzz::value::MutationFailure::ReadOnly(name.to_string())),
            }
        } else {
            quote! {
                #key => {
                    self.#ident = ::callfuzz::value::FieldValue::from_value(name, value)?;
                    Ok(())
                }
            }
        }
    });
    let type_name = LitStr::new(&name.to_string(), name.span());
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::callfuzz::value::Object for #name #ty_generics #where_clause {
            fn type_name(&self) -> &str {
                #type_name
            }

            fn list_fields(&self) -> Vec<String> {
                vec![#(#keys.to_string()),*]
            }

            fn get_field(
                &self,
                name: &str,
            ) -> Result<::callfuzz::value::Value, ::callfuzz::value::MutationFailure> {
                match name {
                    #(#getters)*
                    _ => Err(::callfuzz::value::MutationFailure::UnknownField(name.to_string())),
                }
            }

            #[allow(unused_variables)]
            fn set_field(
                &mut self,
                name: &str,
                value: ::callfuzz::value::Value,
            ) -> Result<(), ::callfuzz::value::MutationFailure> {
                match name {
                    #(#setters)*
                    _ => Err(::callfuzz::value::MutationFailure::UnknownField(name.to_string())),
                }
            }

            fn clone_object(&self) -> Box<dyn ::callfuzz::value::Object> {
                Box::new(::std::clone::Clone::clone(self))
            }
        }
    })
}
