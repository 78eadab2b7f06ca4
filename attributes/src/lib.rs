//! Procedural macros for `async-sanitizer`.
//!
//! Use these through the re-exports at the crate root
//! (`async_sanitizer::tracked`, `async_sanitizer::no_leaks`).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    AttributeArgs, ItemFn, Lit, Meta, MetaNameValue, NestedMeta,
};

/// Includes an async function in captured activity stacks.
///
/// Expands the body to `async_sanitizer::frame!(async move { .. }).await`,
/// so every poll of the function pushes a frame naming it. Blocking reports
/// for code inside the function then point at it instead of coming back
/// stackless.
#[proc_macro_attribute]
pub fn tracked(args: TokenStream, item: TokenStream) -> TokenStream {
    let function = syn::parse_macro_input!(item as ItemFn);
    expand_tracked(args.into(), function)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_tracked(args: TokenStream2, function: ItemFn) -> syn::Result<TokenStream2> {
    if !args.is_empty() {
        return Err(syn::Error::new_spanned(args, "#[tracked] takes no arguments"));
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = function;
    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            sig.fn_token,
            "#[tracked] requires an async function",
        ));
    }
    Ok(quote! {
        #(#attrs)*
        #vis #sig {
            ::async_sanitizer::frame!(async move #block).await
        }
    })
}

/// Runs a test function inside a detection scope and panics on findings.
///
/// Place it above the test attribute so it expands first:
///
/// ```ignore
/// #[no_leaks]
/// #[tokio::test]
/// async fn my_test() { .. }
/// ```
///
/// With no arguments all three detectors are armed and findings fail the
/// test. Naming detectors arms exactly those: `#[no_leaks(tasks)]`,
/// `#[no_leaks(tasks, blocking)]`, `#[no_leaks(all)]`. Key-value arguments
/// override individual settings:
///
/// ```ignore
/// #[no_leaks(task_action = "cancel", blocking_threshold_ms = 250)]
/// #[tokio::test]
/// async fn tolerant() { .. }
/// ```
///
/// Recognized keys: `tasks`, `threads`, `blocking` (bool), `task_action`,
/// `thread_action`, `blocking_action` (`"log"`, `"warn"`, `"raise"`, and
/// for tasks only `"cancel"`), `blocking_threshold_ms`,
/// `blocking_check_interval_ms` (non-zero integers), `track_task_creation`,
/// `exclude_background` (bool), `task_filter_contains`,
/// `thread_filter_contains` (string). Anything else is a compile error.
///
/// On a synchronous function only thread detection applies, matching
/// [`Scope::run_blocking`](../async_sanitizer/struct.Scope.html#method.run_blocking).
#[proc_macro_attribute]
pub fn no_leaks(args: TokenStream, item: TokenStream) -> TokenStream {
    let args = syn::parse_macro_input!(args as AttributeArgs);
    let function = syn::parse_macro_input!(item as ItemFn);
    expand_no_leaks(args, function)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Clone, Copy, PartialEq)]
enum Flag {
    Tasks,
    Threads,
    Blocking,
}

#[derive(Default)]
struct MarkerArgs {
    flags: Vec<Flag>,
    tasks: Option<bool>,
    threads: Option<bool>,
    blocking: Option<bool>,
    task_action: Option<TokenStream2>,
    thread_action: Option<TokenStream2>,
    blocking_action: Option<TokenStream2>,
    blocking_threshold_ms: Option<u64>,
    blocking_check_interval_ms: Option<u64>,
    track_task_creation: Option<bool>,
    exclude_background: Option<bool>,
    task_filter_contains: Option<String>,
    thread_filter_contains: Option<String>,
}

fn expand_no_leaks(args: AttributeArgs, function: ItemFn) -> syn::Result<TokenStream2> {
    let args = parse_marker_args(args)?;
    let config = config_expr(&args);

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = function;

    let body = if sig.asyncness.is_some() {
        quote! {
            ::async_sanitizer::init_logging();
            let __outcome = ::async_sanitizer::Scope::with_origin(
                #config,
                ::async_sanitizer::location!(),
            )
            .run(async move #block)
            .await;
            match __outcome {
                ::core::result::Result::Ok(__value) => __value,
                ::core::result::Result::Err(__finding) => ::core::panic!("{}", __finding),
            }
        }
    } else {
        quote! {
            ::async_sanitizer::init_logging();
            let __outcome = ::async_sanitizer::Scope::with_origin(
                #config,
                ::async_sanitizer::location!(),
            )
            .run_blocking(move || #block);
            match __outcome {
                ::core::result::Result::Ok(__value) => __value,
                ::core::result::Result::Err(__finding) => ::core::panic!("{}", __finding),
            }
        }
    };

    Ok(quote! {
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

fn parse_marker_args(args: AttributeArgs) -> syn::Result<MarkerArgs> {
    let mut parsed = MarkerArgs::default();
    for arg in args {
        match arg {
            NestedMeta::Meta(Meta::Path(path)) => match path_name(&path).as_deref() {
                Some("tasks") => parsed.flags.push(Flag::Tasks),
                Some("threads") => parsed.flags.push(Flag::Threads),
                Some("blocking") => parsed.flags.push(Flag::Blocking),
                Some("all") => {
                    parsed.flags.extend([Flag::Tasks, Flag::Threads, Flag::Blocking]);
                }
                _ => {
                    return Err(syn::Error::new_spanned(
                        path,
                        "unknown detector; expected `tasks`, `threads`, `blocking`, or `all`",
                    ))
                }
            },
            NestedMeta::Meta(Meta::NameValue(name_value)) => {
                parse_key_value(&mut parsed, name_value)?;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a detector name or a `key = value` argument",
                ))
            }
        }
    }
    Ok(parsed)
}

fn parse_key_value(parsed: &mut MarkerArgs, name_value: MetaNameValue) -> syn::Result<()> {
    let key = path_name(&name_value.path).unwrap_or_default();
    match key.as_str() {
        "tasks" => parsed.tasks = Some(bool_value(&name_value)?),
        "threads" => parsed.threads = Some(bool_value(&name_value)?),
        "blocking" => parsed.blocking = Some(bool_value(&name_value)?),
        "task_action" => parsed.task_action = Some(action_value(&name_value, true)?),
        "thread_action" => parsed.thread_action = Some(action_value(&name_value, false)?),
        "blocking_action" => parsed.blocking_action = Some(action_value(&name_value, false)?),
        "blocking_threshold_ms" => {
            parsed.blocking_threshold_ms = Some(duration_ms_value(&name_value)?)
        }
        "blocking_check_interval_ms" => {
            parsed.blocking_check_interval_ms = Some(duration_ms_value(&name_value)?)
        }
        "track_task_creation" => parsed.track_task_creation = Some(bool_value(&name_value)?),
        "exclude_background" => parsed.exclude_background = Some(bool_value(&name_value)?),
        "task_filter_contains" => parsed.task_filter_contains = Some(string_value(&name_value)?),
        "thread_filter_contains" => {
            parsed.thread_filter_contains = Some(string_value(&name_value)?)
        }
        _ => {
            return Err(syn::Error::new_spanned(
                &name_value.path,
                "unknown key; see the `no_leaks` documentation for the recognized set",
            ))
        }
    }
    Ok(())
}

fn path_name(path: &syn::Path) -> Option<String> {
    path.get_ident().map(|ident| ident.to_string())
}

fn bool_value(name_value: &MetaNameValue) -> syn::Result<bool> {
    match &name_value.lit {
        Lit::Bool(value) => Ok(value.value),
        other => Err(syn::Error::new_spanned(other, "expected `true` or `false`")),
    }
}

fn string_value(name_value: &MetaNameValue) -> syn::Result<String> {
    match &name_value.lit {
        Lit::Str(value) => Ok(value.value()),
        other => Err(syn::Error::new_spanned(other, "expected a string literal")),
    }
}

fn duration_ms_value(name_value: &MetaNameValue) -> syn::Result<u64> {
    let millis = match &name_value.lit {
        Lit::Int(value) => value.base10_parse::<u64>()?,
        other => {
            return Err(syn::Error::new_spanned(
                other,
                "expected an integer number of milliseconds",
            ))
        }
    };
    if millis == 0 {
        return Err(syn::Error::new_spanned(
            &name_value.lit,
            "must be non-zero",
        ));
    }
    Ok(millis)
}

fn action_value(name_value: &MetaNameValue, allow_cancel: bool) -> syn::Result<TokenStream2> {
    let value = match &name_value.lit {
        Lit::Str(value) => value,
        other => {
            return Err(syn::Error::new_spanned(
                other,
                "expected one of \"log\", \"warn\", \"raise\", \"cancel\"",
            ))
        }
    };
    match value.value().as_str() {
        "log" => Ok(quote! { ::async_sanitizer::Action::Log }),
        "warn" => Ok(quote! { ::async_sanitizer::Action::Warn }),
        "raise" => Ok(quote! { ::async_sanitizer::Action::Raise }),
        "cancel" if allow_cancel => Ok(quote! { ::async_sanitizer::Action::Cancel }),
        "cancel" => Err(syn::Error::new_spanned(
            value,
            "the cancel action only applies to tasks",
        )),
        _ => Err(syn::Error::new_spanned(
            value,
            "expected one of \"log\", \"warn\", \"raise\", \"cancel\"",
        )),
    }
}

fn config_expr(args: &MarkerArgs) -> TokenStream2 {
    // Positional flags narrow detection to the named detectors; with none
    // given everything is armed. Key-value booleans override either way.
    let flagged = !args.flags.is_empty();
    let mut tasks = !flagged || args.flags.contains(&Flag::Tasks);
    let mut threads = !flagged || args.flags.contains(&Flag::Threads);
    let mut blocking = !flagged || args.flags.contains(&Flag::Blocking);
    if let Some(value) = args.tasks {
        tasks = value;
    }
    if let Some(value) = args.threads {
        threads = value;
    }
    if let Some(value) = args.blocking {
        blocking = value;
    }

    let mut calls = vec![
        quote! { .detect_tasks(#tasks) },
        quote! { .detect_threads(#threads) },
        quote! { .detect_blocking(#blocking) },
    ];
    if let Some(action) = &args.task_action {
        calls.push(quote! { .task_action(#action) });
    }
    if let Some(action) = &args.thread_action {
        calls.push(quote! { .thread_action(#action) });
    }
    if let Some(action) = &args.blocking_action {
        calls.push(quote! { .blocking_action(#action) });
    }
    if let Some(millis) = args.blocking_threshold_ms {
        calls.push(quote! {
            .blocking_threshold(::core::time::Duration::from_millis(#millis))
        });
    }
    if let Some(millis) = args.blocking_check_interval_ms {
        calls.push(quote! {
            .blocking_check_interval(::core::time::Duration::from_millis(#millis))
        });
    }
    if let Some(value) = args.track_task_creation {
        calls.push(quote! { .track_task_creation(#value) });
    }
    if let Some(value) = args.exclude_background {
        calls.push(quote! { .exclude_background(#value) });
    }
    if let Some(fragment) = &args.task_filter_contains {
        calls.push(quote! {
            .task_filter(::async_sanitizer::NameFilter::contains(#fragment))
        });
    }
    if let Some(fragment) = &args.thread_filter_contains {
        calls.push(quote! {
            .thread_filter(::async_sanitizer::NameFilter::contains(#fragment))
        });
    }

    // Everything the builder rejects is already a compile error above, so
    // the expect cannot fire.
    quote! {
        ::async_sanitizer::Config::builder()
            #(#calls)*
            .build()
            .expect("detection configuration rejected")
    }
}
