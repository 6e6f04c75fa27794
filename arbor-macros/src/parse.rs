use proc_macro2::{Span, TokenStream};
use quote::ToTokens;
use syn::parse::{Parse, ParseStream};
use syn::{AttrStyle, Attribute, Lit, Meta, PatType};

pub(crate) fn lit_str(lit: &Lit, field: &str) -> syn::Result<String> {
    match lit {
        Lit::Str(s) => Ok(s.value()),
        other => Err(syn::Error::new_spanned(
            other,
            format!("`{field}` expects a string literal."),
        )),
    }
}

pub(crate) fn lit_usize(lit: &Lit, field: &str) -> syn::Result<usize> {
    match lit {
        Lit::Int(int) => int.base10_parse().map_err(|e| {
            syn::Error::new_spanned(int, format!("`{field}` is not a valid integer: {e}"))
        }),
        other => Err(syn::Error::new_spanned(
            other,
            format!("`{field}` expects an integer literal."),
        )),
    }
}

/// `#[test]`, or the fully qualified `#[core::prelude::<edition>::test]` and
/// `#[std::prelude::<edition>::test]`.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let Meta::Path(path) = &attr.meta else {
        return false;
    };
    if path.segments.iter().any(|s| !s.arguments.is_none()) {
        return false;
    }

    let idents: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
    let idents: Vec<&str> = idents.iter().map(String::as_str).collect();
    match idents.as_slice() {
        ["test"] => path.leading_colon.is_none(),
        ["core" | "std", "prelude", _, "test"] => true,
        _ => false,
    }
}

pub(crate) fn with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}

/// The function an entry attribute is placed on.
pub(crate) struct EntryFn {
    pub(crate) item: syn::ItemFn,
}

impl Parse for EntryFn {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        Ok(Self {
            item: input.parse()?,
        })
    }
}

impl EntryFn {
    pub(crate) fn is_async(&self) -> bool {
        self.item.sig.asyncness.is_some()
    }

    pub(crate) fn find_test_attribute(&self) -> Option<&Attribute> {
        self.item.attrs.iter().find(|attr| is_test_attribute(attr))
    }

    /// The argument that receives the entry task, if the function takes one.
    pub(crate) fn task_arg(&self) -> syn::Result<Option<&PatType>> {
        let mut inputs = self.item.sig.inputs.iter();
        let arg = match inputs.next() {
            None => return Ok(None),
            Some(syn::FnArg::Typed(arg)) => arg,
            Some(receiver) => {
                let msg = "the entry function cannot take `self`";
                return Err(syn::Error::new_spanned(receiver, msg));
            }
        };

        match inputs.next() {
            Some(extra) => {
                let msg = "the entry function takes at most one argument, the entry task";
                Err(syn::Error::new_spanned(extra, msg))
            }
            None => Ok(Some(arg)),
        }
    }

    /// First and last span of the final statement, where rustc reports type
    /// mismatches of the body.
    pub(crate) fn tail_spans(&self) -> (Span, Span) {
        let tail = self
            .item
            .block
            .stmts
            .last()
            .map(ToTokens::to_token_stream)
            .unwrap_or_default();

        let mut tokens = tail.into_iter();
        let start = tokens.next().map_or_else(Span::call_site, |t| t.span());
        let end = tokens.last().map_or(start, |t| t.span());
        (start, end)
    }

    /// Emits the function with a synchronous signature and `body` in place of
    /// the original block.
    ///
    /// Inner attributes cannot stay inside the new block, they are lifted
    /// onto the function.
    pub(crate) fn into_tokens(self, generated_attrs: TokenStream, body: TokenStream) -> TokenStream {
        let syn::ItemFn {
            attrs,
            vis,
            mut sig,
            block,
        } = self.item;

        sig.asyncness = None;
        sig.inputs.clear();

        let mut tokens = TokenStream::new();
        for mut attr in attrs {
            attr.style = AttrStyle::Outer;
            attr.to_tokens(&mut tokens);
        }
        generated_attrs.to_tokens(&mut tokens);
        vis.to_tokens(&mut tokens);
        sig.to_tokens(&mut tokens);
        block.brace_token.surround(&mut tokens, |tokens| body.to_tokens(tokens));
        tokens
    }
}
