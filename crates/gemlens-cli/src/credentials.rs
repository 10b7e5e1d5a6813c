use std::sync::RwLock;

use axum::http::HeaderMap;
use gemlens_contracts::context::RequestContext;

pub const API_KEY_HEADER: &str = "x-api-key";

pub trait CredentialStore: Send + Sync {
    fn get_api_key(&self) -> Option<String>;
    fn set_api_key(&self, key: String);
}

/// The single process-wide credential, seeded from configuration and
/// replaced through the settings endpoint.
#[derive(Debug, Default)]
pub struct SharedCredential {
    key: RwLock<Option<String>>,
}

impl SharedCredential {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            key: RwLock::new(initial.filter(|value| !value.trim().is_empty())),
        }
    }
}

impl CredentialStore for SharedCredential {
    fn get_api_key(&self) -> Option<String> {
        self.key.read().ok().and_then(|guard| guard.clone())
    }

    fn set_api_key(&self, key: String) {
        if let Ok(mut guard) = self.key.write() {
            *guard = Some(key);
        }
    }
}

/// Header value wins over the stored key.
pub fn request_context(headers: &HeaderMap, store: &dyn CredentialStore) -> RequestContext {
    let from_header = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    RequestContext::new(from_header.or_else(|| store.get_api_key()))
}

pub fn mask_key(key: &str) -> String {
    "•".repeat(key.chars().count())
}
