use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::punctuated::Punctuated;

use crate::parse::{EntryFn, lit_str, lit_usize, with_error};

type AttributeArgs = Punctuated<syn::Meta, syn::Token![,]>;

#[derive(Clone, Copy, PartialEq)]
enum Entry {
    Main,
    Test,
}

impl Entry {
    fn name(self) -> &'static str {
        match self {
            Entry::Main => "arbor::main",
            Entry::Test => "arbor::test",
        }
    }
}

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    expand(args, item, Entry::Main)
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    expand(args, item, Entry::Test)
}

/// For an item such as
///
/// ```no_compile
/// #[arbor::main(selector = "park")]
/// async fn main(task: arbor::Task) {
///     println!("Hello from {task}");
/// }
/// ```
///
/// `args` holds `selector = "park"` and `item` the function. The body becomes
/// the entry task of a fresh scheduler and `task` is bound to that task.
fn expand(args: TokenStream, item: TokenStream, entry: Entry) -> TokenStream {
    let input: EntryFn = match syn::parse2(item.clone()) {
        Ok(input) => input,
        Err(e) => return with_error(item, e),
    };

    match Config::parse(args, &input, entry) {
        Ok(config) => generate(input, entry, &config),
        // Expanding anyway keeps completions working inside the body.
        Err(e) => with_error(generate(input, entry, &Config::default()), e),
    }
}

#[derive(Clone, Copy, PartialEq, Default)]
enum SelectorKind {
    #[default]
    Poll,
    Park,
}

#[derive(Default)]
struct Config {
    selector: Option<SelectorKind>,
    ready_capacity: Option<usize>,
}

impl Config {
    fn parse(args: TokenStream, input: &EntryFn, entry: Entry) -> syn::Result<Config> {
        if entry == Entry::Test {
            if let Some(attr) = input.find_test_attribute() {
                let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
                return Err(syn::Error::new_spanned(attr, msg));
            }
        }
        if !input.is_async() {
            let msg = "the `async` keyword is missing from the function declaration";
            return Err(syn::Error::new_spanned(input.item.sig.fn_token, msg));
        }
        input.task_arg()?;

        let mut config = Config::default();
        for meta in AttributeArgs::parse_terminated.parse2(args)? {
            config.apply(meta, entry)?;
        }
        Ok(config)
    }

    fn apply(&mut self, meta: syn::Meta, entry: Entry) -> syn::Result<()> {
        let namevalue = match meta {
            syn::Meta::NameValue(namevalue) => namevalue,
            syn::Meta::Path(path) => {
                let name = path.get_ident().map(ToString::to_string).unwrap_or_default();
                let msg = match name.as_str() {
                    "poll" | "park" => {
                        format!("Set the selector with #[{}(selector = \"{name}\")].", entry.name())
                    }
                    "selector" | "ready_capacity" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    _ => unknown(&name),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(other, "Unknown attribute inside the macro"));
            }
        };

        let name = namevalue
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new_spanned(&namevalue, "Must have specified ident"))?
            .to_string();
        let syn::Expr::Lit(syn::ExprLit { lit, .. }) = &namevalue.value else {
            return Err(syn::Error::new_spanned(&namevalue.value, "Must be a literal"));
        };

        match name.as_str() {
            "selector" if self.selector.is_some() => {
                Err(syn::Error::new_spanned(lit, "`selector` set multiple times."))
            }
            "selector" => {
                self.selector = Some(match lit_str(lit, "selector")?.as_str() {
                    "poll" => SelectorKind::Poll,
                    "park" => SelectorKind::Park,
                    other => {
                        let msg = format!(
                            "No such selector `{other}`. The selectors are `poll` and `park`."
                        );
                        return Err(syn::Error::new_spanned(lit, msg));
                    }
                });
                Ok(())
            }
            "ready_capacity" if self.ready_capacity.is_some() => {
                Err(syn::Error::new_spanned(lit, "`ready_capacity` set multiple times."))
            }
            "ready_capacity" => match lit_usize(lit, "ready_capacity")? {
                0 => Err(syn::Error::new_spanned(lit, "`ready_capacity` may not be 0.")),
                n => {
                    self.ready_capacity = Some(n);
                    Ok(())
                }
            },
            _ => Err(syn::Error::new_spanned(&namevalue, unknown(&name))),
        }
    }
}

fn unknown(name: &str) -> String {
    format!("Unknown attribute {name} is specified; expected one of: `selector`, `ready_capacity`.")
}

fn generate(input: EntryFn, entry: Entry, config: &Config) -> TokenStream {
    let (tail_start, tail_end) = input.tail_spans();

    let mut builder = quote_spanned! {tail_start=> arbor::runtime::Builder::new() };
    if config.selector.unwrap_or_default() == SelectorKind::Park {
        builder = quote_spanned! {tail_start=>
            #builder.selector(arbor::runtime::ParkSelector::new())
        };
    }
    if let Some(n) = config.ready_capacity {
        builder = quote_spanned! {tail_start=> #builder.ready_capacity(#n) };
    }

    let generated_attrs = match entry {
        Entry::Test => quote! { #[::core::prelude::v1::test] },
        Entry::Main => quote! {},
    };

    let output = match &input.item.sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ty) => quote! { #ty },
    };

    let (task_pat, task_ty) = match input.task_arg() {
        Ok(Some(arg)) => {
            let (pat, ty) = (&arg.pat, &arg.ty);
            (quote! { #pat }, quote! { #ty })
        }
        _ => (quote! { _ }, quote! { arbor::Task }),
    };

    // The typed binding fixes the future's output, so `?` in the body knows
    // what to convert into.
    let block = &input.item.block;
    let body = quote! {
        let body = move |#task_pat: #task_ty| async move {
            let output: #output = #block;
            output
        };
    };

    // Spanned on the last statement so type errors point into the body. The
    // explicit `return` follows tokio-rs/tokio#4636.
    let run = quote_spanned! {tail_end=>
        #[allow(clippy::expect_used, clippy::diverging_sub_expression, clippy::needless_return)]
        {
            return #builder
                .try_build()
                .expect("Failed building the Scheduler")
                .block_on(move |task| async move {
                    ::core::result::Result::Ok::<_, arbor::Error>(body(task).await)
                })
                .expect("The entry task did not complete");
        }
    };

    input.into_tokens(generated_attrs, quote! { #body #run })
}
