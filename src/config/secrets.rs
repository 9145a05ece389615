//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for working with
//! secrets read from the environment.

pub use secrecy::{ExposeSecret, SecretString};

/// Wrap a value as a secret, treating blank strings as unset.
pub fn optional_secret(value: Option<String>) -> Option<SecretString> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

/// Mask a connection URL's password for logging.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}
