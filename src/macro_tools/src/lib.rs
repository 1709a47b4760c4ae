extern crate proc_macro;

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DeriveInput, Fields, Lit, Meta, NestedMeta};

/// Generates `apply_to`/`capture_from` between an on-flash summary record
/// and its runtime counterpart, matched by field name. Used by the
/// checkpoint device-summary <-> runtime-state copy (the role the
/// teacher's `Ext2SuperBlockMem` pairing played for the ext2 superblock).
///
/// ```ignore
/// #[derive(ApplyMem)]
/// #[apply_mem(target = "DeviceRuntimeSummary")]
/// struct CheckpointSummaryRecord { erased_block_count: u32, ... }
/// ```
#[proc_macro_derive(ApplyMem, attributes(apply_mem))]
pub fn derive_apply_mem(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let target_ident = input
        .attrs
        .iter()
        .find_map(|attr| {
            if !attr.path.is_ident("apply_mem") {
                return None;
            }
            let meta = attr.parse_meta().ok()?;
            let Meta::List(list) = meta else { return None };
            list.nested.into_iter().find_map(|nested| {
                let NestedMeta::Meta(Meta::NameValue(nv)) = nested else { return None };
                if !nv.path.is_ident("target") {
                    return None;
                }
                match nv.lit {
                    Lit::Str(s) => Some(format_ident!("{}", s.value())),
                    _ => None,
                }
            })
        })
        .expect("ApplyMem requires #[apply_mem(target = \"TypeName\")]");

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => panic!("ApplyMem only supports structs with named fields"),
        },
        _ => panic!("ApplyMem only supports structs"),
    };

    let field_idents: Vec<_> = fields.iter().map(|f| f.ident.clone().unwrap()).collect();
    let apply_assignments = field_idents.iter().map(|f| quote! { target.#f = self.#f as _; });
    let capture_assignments = field_idents.iter().map(|f| quote! { #f: source.#f as _, });

    let expanded = quote! {
        impl #name {
            pub fn apply_to(&self, target: &mut #target_ident) {
                #(#apply_assignments)*
            }

            pub fn capture_from(source: &#target_ident) -> Self {
                Self {
                    #(#capture_assignments)*
                }
            }
        }
    };
    expanded.into()
}
