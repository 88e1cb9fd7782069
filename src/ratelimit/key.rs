//! Identity key generation.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// The parts of an inbound request the limiter cares about.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated user id, if the identity layer resolved one
    pub user_id: Option<String>,
    /// Network origin of the caller
    pub remote_addr: Option<IpAddr>,
    /// Request path
    pub path: String,
    /// Extra caller-supplied attributes, e.g. a login form's email field
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Signature of a custom key derivation function.
pub type KeyFn = dyn Fn(&RequestContext) -> String + Send + Sync;

/// Derives the identity a request is counted against.
#[derive(Clone, Default)]
pub enum KeyGenerator {
    /// `user:<id>`, then `ip:<addr>`, then `anonymous`
    #[default]
    Identity,
    /// A caller-supplied function
    Custom(Arc<KeyFn>),
}

impl KeyGenerator {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        KeyGenerator::Custom(Arc::new(f))
    }

    pub fn generate(&self, request: &RequestContext) -> String {
        match self {
            KeyGenerator::Identity => default_key(request),
            KeyGenerator::Custom(f) => f(request),
        }
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyGenerator::Identity => f.write_str("Identity"),
            KeyGenerator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn default_key(request: &RequestContext) -> String {
    if let Some(user_id) = request.user_id.as_deref().filter(|id| !id.is_empty()) {
        return format!("user:{}", user_id);
    }
    if let Some(addr) = request.remote_addr {
        return format!("ip:{}", addr);
    }
    "anonymous".to_string()
}

/// Separates the rule name from the identity in a storage key. Rule names
/// may not contain it, so the first occurrence always ends the rule name.
pub const KEY_SEPARATOR: char = '|';

/// Compose the counter store key for an identity under a rule.
pub fn storage_key(rule_name: &str, identity: &str) -> String {
    format!("{}{}{}", rule_name, KEY_SEPARATOR, identity)
}
