//! Related-origin validation against the RP's well-known WebAuthn
//! document.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Failure reported by an [`OriginFetcher`] implementation. Propagated to
/// callers unchanged.
#[derive(Debug, Error)]
#[error("origin fetch failed: {0}")]
pub struct FetchError(pub String);

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Caller-supplied fetcher for `https://` documents. Implementations must
/// be cancellation-safe; the library awaits at most one fetch per
/// operation.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Fetch `url` and return the response body as text.
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Error)]
pub enum OriginValidationError {
    /// The fetcher failed; carries its error unchanged.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The document was missing, malformed, or does not authorize the
    /// caller.
    #[error("invalid origin: {0}")]
    IllegalArgument(&'static str),
}

#[derive(Deserialize)]
struct WellKnownWebAuthn {
    origins: Option<Vec<String>>,
}

/// Check `caller_origin` against `https://{rp_id}/.well-known/webauthn`.
///
/// Returns the canonical `https://{rp_id}` URL when the RP's published
/// `origins` list contains the caller; fails otherwise. A `null` origins
/// list is a failure, not an open door.
pub async fn validate_origin(
    caller_origin: &str,
    rp_id: &str,
    fetcher: &dyn OriginFetcher,
) -> Result<String, OriginValidationError> {
    let url = format!("https://{rp_id}/.well-known/webauthn");
    debug!(%url, "fetching related-origins document");
    let body = fetcher.fetch(&url).await?;
    let document: WellKnownWebAuthn = serde_json::from_str(&body)
        .map_err(|_| OriginValidationError::IllegalArgument("malformed webauthn document"))?;
    let origins = document
        .origins
        .ok_or(OriginValidationError::IllegalArgument("no origins listed"))?;
    if origins.iter().any(|origin| origin == caller_origin) {
        Ok(format!("https://{rp_id}"))
    } else {
        Err(OriginValidationError::IllegalArgument(
            "caller origin not allowed by relying party",
        ))
    }
}
