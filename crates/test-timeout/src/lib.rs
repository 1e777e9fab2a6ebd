//! Test attribute for the bridge's async tests.
//!
//! `#[tokio_timeout_test]` runs an `async fn` on a fresh current-thread
//! runtime (the same single-threaded event model the bridge is written
//! for) on its own OS thread, failing the test if it outlives the budget.
//!
//! Options:
//! - `secs = N` sets the budget (default 30).
//! - `paused` starts the runtime with a paused clock so acknowledgment
//!   timeouts elapse instantly. Requires tokio's `test-util` feature in the
//!   calling crate's dev-dependencies.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_BUDGET_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut budget_secs = DEFAULT_BUDGET_SECS;
    let mut paused = false;

    let options = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            budget_secs = lit.base10_parse()?;
            if budget_secs == 0 {
                return Err(meta.error("budget must be greater than zero"));
            }
            Ok(())
        } else if meta.path.is_ident("paused") {
            paused = true;
            Ok(())
        } else {
            Err(meta.error("expected `secs = N` or `paused`"))
        }
    });
    parse_macro_input!(attr with options);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async test function",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let clock = if paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#budget_secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #clock
                    let runtime = builder.build().expect("failed to build test runtime");
                    runtime.block_on(async move #block);
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(budget) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its {}s budget", #budget_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Strips `#[test]` / `#[tokio::test]` so the generated wrapper is the only test.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
