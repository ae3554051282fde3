//! Browser storage
//!
//! The draft key goes to `sessionStorage` so it survives the processor's
//! redirect but not the tab. Cart and session are written to `localStorage`
//! by the rest of the storefront; checkout only reads them.

use checkout_core::wire::CartLineRequest;
use checkout_core::{DraftKey, DraftKeySlot, UserProfile};
use serde::Deserialize;
use web_sys::Storage;

const DRAFT_KEY: &str = "checkout.draft_key";
const CART_KEY: &str = "cart";
const SESSION_KEY: &str = "session";

fn session_storage() -> Option<Storage> {
    web_sys::window()?.session_storage().ok().flatten()
}

fn local_storage() -> Option<Storage> {
    web_sys::window()?.local_storage().ok().flatten()
}

/// [`DraftKeySlot`] backed by `sessionStorage`
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionDraftKeySlot;

impl DraftKeySlot for SessionDraftKeySlot {
    fn store(&mut self, key: &DraftKey) -> Result<(), String> {
        let storage = session_storage().ok_or("session storage unavailable")?;
        storage
            .set_item(DRAFT_KEY, key.as_str())
            .map_err(|_| "session storage is full or disabled".to_string())
    }

    fn load(&self) -> Option<DraftKey> {
        let raw = session_storage()?.get_item(DRAFT_KEY).ok().flatten()?;
        DraftKey::parse(&raw)
    }

    fn clear(&mut self) {
        if let Some(storage) = session_storage() {
            let _ = storage.remove_item(DRAFT_KEY);
        }
    }
}

/// Signed-in session as stored by the account pages
#[derive(Clone, Debug, Deserialize)]
pub struct StoredSession {
    pub token: String,
    pub profile: UserProfile,
}

fn read_json<T: for<'de> Deserialize<'de>>(key: &str) -> Option<T> {
    let raw = local_storage()?.get_item(key).ok().flatten()?;
    serde_json::from_str(&raw).ok()
}

/// Cart lines; an unreadable cart counts as empty
pub fn load_cart() -> Vec<CartLineRequest> {
    read_json(CART_KEY).unwrap_or_default()
}

pub fn load_session() -> Option<StoredSession> {
    read_json(SESSION_KEY)
}
