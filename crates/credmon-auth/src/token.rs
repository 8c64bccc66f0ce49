//! Authorization-code exchange
//!
//! Handles the return leg of the flow:
//! 1. Upgrade the callback URL to https and pull `state`/`code` out of it
//! 2. Check `state` against the value stored when the flow began
//! 3. POST the code to the provider's token endpoint
//! 4. Look up the user's identity (best effort)
//! 5. Split the token response into the credential triad
//!
//! Step 2 always runs before any network traffic.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Url;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::credentials::{CredentialTriad, RefreshMetadata, RefreshToken};
use crate::error::{Error, Result};
use crate::keyfile::ProviderDescriptor;

/// Username recorded when the identity endpoint gives nothing usable.
pub const UNKNOWN_USERNAME: &str = "Unknown";

/// Query parameters of a provider callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Rewrite a plain-http callback URL to https. Other schemes pass through.
pub fn secure_callback_url(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

/// Upgrade and parse a callback URL.
pub fn parse_callback(url: &str) -> Result<CallbackParams> {
    let url = secure_callback_url(url);
    let parsed = Url::parse(&url)
        .map_err(|e| Error::TokenExchange(format!("invalid callback URL {url:?}: {e}")))?;

    let mut params = CallbackParams::default();
    for (key, value) in parsed.query_pairs() {
        let slot = match key.as_ref() {
            "code" => &mut params.code,
            "state" => &mut params.state,
            "error" => &mut params.error,
            "error_description" => &mut params.error_description,
            _ => continue,
        };
        slot.get_or_insert_with(|| value.into_owned());
    }
    Ok(params)
}

/// Check the echoed state, then return the authorization code.
///
/// A missing stored state (flow never started, or already completed) counts
/// as a mismatch. Provider-reported errors are only surfaced after the state
/// check passes.
pub fn verify_callback(
    params: &CallbackParams,
    expected_state: Option<&str>,
    provider: &str,
) -> Result<String> {
    match (expected_state, params.state.as_deref()) {
        (Some(expected), Some(got)) if expected == got => {}
        _ => return Err(Error::CsrfMismatch(provider.to_string())),
    }

    if let Some(error) = &params.error {
        let detail = params
            .error_description
            .as_deref()
            .map(|d| format!(": {d}"))
            .unwrap_or_default();
        return Err(Error::TokenExchange(format!(
            "provider {provider} denied authorization ({error}){detail}"
        )));
    }

    params
        .code
        .clone()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            Error::TokenExchange(format!("callback from {provider} carries no authorization code"))
        })
}

/// Exchange an authorization code at the descriptor's token endpoint.
///
/// Returns the token object as the provider sent it, with `scope` converted
/// to a list and `expires_at` (unix seconds) added when `expires_in` is
/// present. Non-2xx responses carry the provider body in the error.
pub async fn exchange_code(
    client: &reqwest::Client,
    descriptor: &ProviderDescriptor,
    code: &str,
    timeout: Duration,
) -> Result<Map<String, Value>> {
    let response = client
        .post(&descriptor.token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .timeout(timeout)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", descriptor.return_url.as_str()),
            ("client_id", descriptor.client_id.as_str()),
            ("client_secret", descriptor.client_secret.expose().as_str()),
        ])
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::TokenExchange(format!(
                    "token endpoint {} timed out after {}s",
                    descriptor.token_url,
                    timeout.as_secs_f64()
                ))
            } else {
                Error::TokenExchange(format!("token exchange request failed: {e}"))
            }
        })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::TokenExchange(format!("reading token response: {e}")))?;

    if !status.is_success() {
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token = parse_token_body(&body)?;

    // Some providers report failures with a 200 and an `error` member.
    if let Some(error) = token.get("error") {
        return Err(Error::TokenExchange(format!(
            "token endpoint returned error {error}: {body}"
        )));
    }
    if !token.get("access_token").is_some_and(Value::is_string) {
        return Err(Error::TokenExchange(
            "token response has no access_token".into(),
        ));
    }

    Ok(normalize_token(token, now_secs()))
}

/// Decode a token response body.
///
/// JSON is expected, but some providers answer with
/// `application/x-www-form-urlencoded` pairs regardless of `Accept`. The
/// form reading is only taken when it yields `access_token` or `error`.
pub fn parse_token_body(body: &str) -> Result<Map<String, Value>> {
    let json_err = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(_) => {
            return Err(Error::TokenExchange(format!(
                "token response is not a JSON object: {body}"
            )));
        }
        Err(e) => e,
    };

    let pairs: Map<String, Value> = url::form_urlencoded::parse(body.trim().as_bytes())
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    if pairs.contains_key("access_token") || pairs.contains_key("error") {
        debug!("token response decoded as form-encoded pairs");
        Ok(pairs)
    } else {
        Err(Error::TokenExchange(format!(
            "invalid token response: {json_err}"
        )))
    }
}

/// Convert `scope` to a list, coerce a textual `expires_in` to a number and
/// derive `expires_at` from it.
pub fn normalize_token(mut token: Map<String, Value>, now: f64) -> Map<String, Value> {
    if let Some(Value::String(scope)) = token.get("scope") {
        let scopes: Vec<Value> = scope
            .split_whitespace()
            .map(|s| Value::String(s.to_string()))
            .collect();
        token.insert("scope".into(), Value::Array(scopes));
    }

    if let Some(Value::String(raw)) = token.get("expires_in") {
        if let Ok(secs) = raw.trim().parse::<i64>() {
            token.insert("expires_in".into(), Value::from(secs));
        }
    }

    let expires_in = token.get("expires_in").and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    });
    if let Some(expires_in) = expires_in {
        token.insert("expires_at".into(), Value::from(now + expires_in));
    }
    token
}

/// Split the refresh token off the token object and build the triad.
///
/// A `refresh_token` that is neither a string nor null is rejected; the
/// refresher can only replay a string.
pub fn split_token(
    mut token: Map<String, Value>,
    descriptor: &ProviderDescriptor,
) -> Result<CredentialTriad> {
    let (refresh_token, use_refresh_token) = match token.remove("refresh_token") {
        Some(Value::String(s)) => (s, true),
        Some(Value::Null) | None => (String::new(), false),
        Some(other) => {
            return Err(Error::TokenExchange(format!(
                "refresh_token from {} is not a string: {other}",
                descriptor.display_name()
            )));
        }
    };

    Ok(CredentialTriad {
        access: token,
        refresh: RefreshToken { refresh_token },
        metadata: RefreshMetadata {
            client_id: descriptor.client_id.clone(),
            client_secret: descriptor.client_secret.expose().clone(),
            token_url: descriptor.token_url.clone(),
            use_refresh_token,
        },
    })
}

/// Pick a username out of an identity response body: `login` (GitHub, Box
/// style) wins over `sub` (OIDC / SciTokens). Anything else is `Unknown`.
pub fn resolve_username(body: &str) -> String {
    let Ok(Value::Object(info)) = serde_json::from_str::<Value>(body) else {
        return UNKNOWN_USERNAME.to_string();
    };
    ["login", "sub"]
        .iter()
        .find_map(|field| match info.get(*field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| UNKNOWN_USERNAME.to_string())
}

/// Fetch the user's identity with the new access token. Never fails: any
/// error, timeout or unusable body yields `Unknown`.
pub async fn fetch_username(
    client: &reqwest::Client,
    user_info_url: Option<&str>,
    access_token: &str,
    timeout: Duration,
) -> String {
    let Some(url) = user_info_url else {
        return UNKNOWN_USERNAME.to_string();
    };

    let response = client
        .get(url)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .timeout(timeout)
        .send()
        .await;

    let body = match response {
        Ok(r) if r.status().is_success() => r.text().await,
        Ok(r) => {
            warn!(url, status = %r.status(), "identity endpoint returned an error");
            return UNKNOWN_USERNAME.to_string();
        }
        Err(e) => {
            warn!(url, error = %e, "identity lookup failed");
            return UNKNOWN_USERNAME.to_string();
        }
    };

    match body {
        Ok(body) => {
            let username = resolve_username(&body);
            debug!(url, username, "resolved identity");
            username
        }
        Err(e) => {
            warn!(url, error = %e, "reading identity response failed");
            UNKNOWN_USERNAME.to_string()
        }
    }
}

/// Timeouts for the two outbound calls of a completion.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeTimeouts {
    pub exchange: Duration,
    pub identity: Duration,
}

/// Result of a completed exchange, ready for the credential writer.
#[derive(Debug, Clone)]
pub struct Exchanged {
    pub triad: CredentialTriad,
    pub username: String,
}

/// Exchange `code`, resolve the identity and split the token.
pub async fn complete_exchange(
    client: &reqwest::Client,
    descriptor: &ProviderDescriptor,
    code: &str,
    timeouts: ExchangeTimeouts,
) -> Result<Exchanged> {
    let token = exchange_code(client, descriptor, code, timeouts.exchange).await?;

    let access_token = token
        .get("access_token")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let username = fetch_username(
        client,
        descriptor.user_info_url.as_deref(),
        &access_token,
        timeouts.identity,
    )
    .await;

    Ok(Exchanged {
        triad: split_token(token, descriptor)?,
        username,
    })
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
