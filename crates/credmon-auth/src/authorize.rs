//! Authorization request construction
//!
//! Builds the provider redirect for the first leg of the authorization-code
//! grant and generates the CSRF `state` that the provider echoes back on the
//! return leg.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::keyfile::ProviderDescriptor;

/// Generate an unguessable CSRF state value.
///
/// 24 random bytes encoded as URL-safe base64 without padding (32 chars),
/// safe to place in a query string unescaped.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the authorization URL for `descriptor`.
///
/// Parameters are appended to any query the configured `AuthorizationUrl`
/// already carries: `response_type`, `client_id`, `redirect_uri`, `scope`
/// (space-delimited, only when scopes were requested), `state`, and
/// `resource` when the record names an audience. `resource` is an extension
/// understood by SciTokens-style token servers.
pub fn build_authorization_url(descriptor: &ProviderDescriptor, state: &str) -> Result<String> {
    let mut url = Url::parse(&descriptor.authorization_url).map_err(|e| {
        Error::Parse(format!(
            "invalid AuthorizationUrl {:?} for {}: {e}",
            descriptor.authorization_url,
            descriptor.display_name()
        ))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &descriptor.client_id)
            .append_pair("redirect_uri", &descriptor.return_url);
        if let Some(scopes) = descriptor.scopes.as_ref().filter(|s| !s.is_empty()) {
            query.append_pair("scope", &scopes.join(" "));
        }
        query.append_pair("state", state);
        if let Some(audience) = &descriptor.audience {
            query.append_pair("resource", audience);
        }
    }

    Ok(url.into())
}
