//! Checkout Web Frontend
//!
//! Leptos WASM checkout page. Step logic lives in
//! [`checkout_core::CheckoutFlow`]; this crate renders it, talks to the
//! checkout API and hands payment confirmation to Stripe.js.

mod api;
mod app;
mod components;
mod pages;
mod storage;
mod stripe;

pub use app::App;

use wasm_bindgen::prelude::*;

/// WASM entry point
#[wasm_bindgen(start)]
pub fn main() {
    console_error_panic_hook::set_once();
    leptos::mount::mount_to_body(App);
}
