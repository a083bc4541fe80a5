use http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::ProxyError;

/// The proxy's own access control: a single shared bearer key clients must
/// present on any path outside the configured public-endpoint prefixes. This
/// key is never forwarded upstream — upstream authorization always comes
/// from the pool key the Key Manager hands out.
pub struct AuthGate {
    access_key: String,
    public_endpoints: Vec<String>,
}

impl AuthGate {
    pub fn new(access_key: String, public_endpoints: Vec<String>) -> Self {
        Self {
            access_key,
            public_endpoints,
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_endpoints
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), ProxyError> {
        let provided = extract_bearer(headers).ok_or_else(ProxyError::client_auth)?;
        if constant_time_eq(&provided, &self.access_key) {
            Ok(())
        } else {
            Err(ProxyError::client_auth())
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.trim().strip_prefix("Bearer ")?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
