//! Shared utility functions for provider adapters.

use la_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve an API key from the named environment variable.
///
/// An unset or empty variable yields `None` (local endpoints such as
/// Ollama need no key).
pub(crate) fn api_key_from_env(var: &str) -> Result<Option<String>> {
    if var.is_empty() {
        return Ok(None);
    }
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(v.trim().to_owned())),
        Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("reading {var}: {e}"))),
    }
}
