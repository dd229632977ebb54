//! Test attributes that bound a test's wall-clock time.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one on a fresh
//! current-thread runtime. Both run the body on a helper thread and fail the
//! test when it does not finish in time. The limit defaults to 60 seconds, can
//! be given as a literal (`#[test_timeout::timeout(5)]`), and is overridden
//! at run time by `RENDEZVOUS_TEST_TIMEOUT_SECS`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const TIMEOUT_ENV: &str = "RENDEZVOUS_TEST_TIMEOUT_SECS";

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, &["tokio", "test"]);
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async move {
            tokio::time::timeout(__limit, async move #block)
                .await
                .expect("test timed out");
        });
    };

    wrap(attrs, vis, sig, timeout_secs, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test; use tokio_timeout_test for async tests",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, &["test"]);
    let body = quote! {
        let _ = __limit;
        #block
    };

    wrap(attrs, vis, sig, timeout_secs, body).into()
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

/// Drops attributes whose path is exactly `path` so the generated `#[test]`
/// is the only test marker left on the function.
fn strip_attrs(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            segments != path
        })
        .collect()
}

fn wrap(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    timeout_secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __limit = std::env::var(#TIMEOUT_ENV)
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| std::time::Duration::from_secs(#timeout_secs));
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(__limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", __limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}
