//! Two-phase authorization flow over a session
//!
//! `begin_authorization` prepares the redirect to the provider and records
//! the CSRF state plus the in-flight provider. `complete_authorization`
//! handles the provider's return: it resolves which provider is being
//! completed, checks the state, exchanges the code, writes the credential
//! files and marks the provider logged in.
//!
//! Session locks are only held for the bookkeeping steps, never across the
//! outbound token or identity calls.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use credmon_auth::{CredentialWriter, ExchangeTimeouts, TriadPaths};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::session::SessionStore;

/// Settings shared by every flow.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Directory holding key files and per-user credential directories.
    pub credential_dir: PathBuf,
    pub exchange_timeout: Duration,
    pub identity_timeout: Duration,
}

/// Outcome of a successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Provider that was actually completed (may differ from the callback
    /// path's provider when several handles share a return URL).
    pub provider: String,
    pub username: String,
    pub session_logged_in: bool,
    pub paths: TriadPaths,
}

pub struct OAuthFlow {
    store: Arc<SessionStore>,
    http_client: reqwest::Client,
    writer: CredentialWriter,
    settings: FlowSettings,
}

impl OAuthFlow {
    pub fn new(
        store: Arc<SessionStore>,
        http_client: reqwest::Client,
        settings: FlowSettings,
    ) -> Self {
        Self::with_writer(store, http_client, settings, CredentialWriter::new())
    }

    pub fn with_writer(
        store: Arc<SessionStore>,
        http_client: reqwest::Client,
        settings: FlowSettings,
        writer: CredentialWriter,
    ) -> Self {
        Self {
            store,
            http_client,
            writer,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// Start authorization for `provider` and return the URL to redirect
    /// the browser to.
    ///
    /// Any earlier outstanding state for the provider is replaced.
    pub async fn begin_authorization(&self, session_id: &str, provider: &str) -> Result<String> {
        let key_path = self
            .store
            .with_session(session_id, |record| {
                if !record.providers.contains_key(provider) {
                    return Err(Error::UnknownProvider(provider.to_string()));
                }
                Ok(record.key_path.clone())
            })
            .await?;

        let descriptor = credmon_auth::find_provider(provider, &key_path).await?;
        let state = credmon_auth::generate_state();
        let url = credmon_auth::build_authorization_url(&descriptor, &state)?;

        self.store
            .start_authorization(session_id, provider, state)
            .await?;

        info!(session = session_id, provider, "authorization started");
        Ok(url)
    }

    /// Finish authorization from the provider's callback.
    ///
    /// `called_provider` is the provider named by the return path; the
    /// in-flight record from `begin_authorization` takes precedence over it
    /// and is consumed either way. The callback is rejected with
    /// `CsrfMismatch` before any network call if its `state` does not match.
    pub async fn complete_authorization(
        &self,
        session_id: &str,
        called_provider: &str,
        callback_url: &str,
    ) -> Result<Completion> {
        let params = credmon_auth::parse_callback(callback_url)?;

        let (provider, code) = self
            .store
            .claim_callback(session_id, called_provider.trim_end(), |provider, entry| {
                let code =
                    credmon_auth::verify_callback(&params, entry.csrf_state.as_deref(), provider)?;
                entry.csrf_state = None;
                Ok(code)
            })
            .await
            .inspect_err(|e| {
                if matches!(e, Error::Auth(credmon_auth::Error::CsrfMismatch(_))) {
                    warn!(
                        session = session_id,
                        called_provider,
                        "rejected callback with mismatched state"
                    );
                }
            })?;

        let (key_path, local_username) = self
            .store
            .with_session(session_id, |record| {
                Ok((record.key_path.clone(), record.local_username.clone()))
            })
            .await?;

        let descriptor = credmon_auth::find_provider(&provider, &key_path).await?;
        let timeouts = ExchangeTimeouts {
            exchange: self.settings.exchange_timeout,
            identity: self.settings.identity_timeout,
        };

        let exchanged =
            match credmon_auth::complete_exchange(&self.http_client, &descriptor, &code, timeouts)
                .await
            {
                Ok(e) => {
                    metrics::counter!("credmon_token_exchanges_total", "outcome" => "success")
                        .increment(1);
                    e
                }
                Err(e) => {
                    metrics::counter!("credmon_token_exchanges_total", "outcome" => "failure")
                        .increment(1);
                    warn!(session = session_id, provider, error = %e, "token exchange failed");
                    return Err(e.into());
                }
            };
        info!(provider, user = %local_username, "got token");

        let paths = match self
            .writer
            .write_triad(
                &self.settings.credential_dir,
                &local_username,
                &provider,
                &exchanged.triad,
            )
            .await
        {
            Ok(paths) => {
                metrics::counter!("credmon_credential_writes_total", "outcome" => "success")
                    .increment(1);
                paths
            }
            Err(e) => {
                metrics::counter!("credmon_credential_writes_total", "outcome" => "failure")
                    .increment(1);
                warn!(provider, user = %local_username, error = %e, "writing credentials failed");
                return Err(e.into());
            }
        };

        let username = exchanged.username;
        let ((), session_logged_in) = self
            .store
            .mutate_provider(session_id, &provider, |entry| {
                entry.logged_in = true;
                entry.username = username.clone();
            })
            .await?;

        info!(
            session = session_id,
            provider,
            username,
            session_logged_in,
            "provider logged in"
        );
        Ok(Completion {
            provider,
            username,
            session_logged_in,
            paths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::routing::{get, post};
    use reqwest::Url;
    use tokio::net::TcpListener;

    /// Mock provider serving `/<name>/token` and `/<name>/user`.
    #[derive(Clone)]
    struct MockProvider {
        token_hits: Arc<AtomicUsize>,
    }

    async fn start_provider(
        routes: Vec<(&'static str, &'static str, &'static str)>,
    ) -> (String, MockProvider) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let mock = MockProvider {
            token_hits: Arc::new(AtomicUsize::new(0)),
        };

        let mut app = axum::Router::new();
        for (name, token_body, user_body) in routes {
            app = app
                .route(
                    &format!("/{name}/token"),
                    post(move |State(mock): State<MockProvider>| async move {
                        mock.token_hits.fetch_add(1, Ordering::SeqCst);
                        token_body
                    }),
                )
                .route(&format!("/{name}/user"), get(move || async move { user_body }));
        }
        let app = app.with_state(mock.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (base, mock)
    }

    fn key_record(base: &str, provider: &str, handle: &str, return_name: &str) -> String {
        format!(
            r#"[
  Provider = "{provider}";
  Handle = "{handle}";
  ClientId = "{provider}-client";
  ClientSecret = "{provider}-secret";
  AuthorizationUrl = "{base}/{provider}/authorize";
  TokenUrl = "{base}/{provider}/token";
  UserUrl = "{base}/{provider}/user";
  ReturnUrl = "https://submit.example.org/return/{return_name}";
  LocalUser = "alice";
]
"#
        )
    }

    struct Harness {
        _dir: tempfile::TempDir,
        cred_dir: PathBuf,
        flow: OAuthFlow,
        session: String,
    }

    async fn harness(key_contents: String) -> Harness {
        harness_with_identity_timeout(key_contents, Duration::from_secs(5)).await
    }

    async fn harness_with_identity_timeout(
        key_contents: String,
        identity_timeout: Duration,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cred_dir = dir.path().to_path_buf();
        let key_path = cred_dir.join("c0ffee");
        tokio::fs::write(&key_path, key_contents).await.unwrap();

        let store = Arc::new(SessionStore::new(Duration::from_secs(600)));
        let (session, _) = store.create_session(&key_path).await.unwrap();
        let flow = OAuthFlow::new(
            store,
            reqwest::Client::new(),
            FlowSettings {
                credential_dir: cred_dir.clone(),
                exchange_timeout: Duration::from_secs(5),
                identity_timeout,
            },
        );
        Harness {
            _dir: dir,
            cred_dir,
            flow,
            session,
        }
    }

    fn state_of(url: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    async fn read_json(path: &std::path::Path) -> serde_json::Value {
        serde_json::from_str(&tokio::fs::read_to_string(path).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn begin_stores_state_and_in_flight() {
        let h = harness(key_record("https://p.example.org", "github", "", "github")).await;

        let url = h.flow.begin_authorization(&h.session, "github").await.unwrap();
        assert!(url.starts_with("https://p.example.org/github/authorize?"));

        let record = h.flow.store().get_session(&h.session).await.unwrap();
        assert_eq!(record.in_flight.as_deref(), Some("github"));
        assert_eq!(
            record.provider("github").unwrap().csrf_state,
            Some(state_of(&url))
        );

        // A second begin replaces the outstanding state.
        let again = h.flow.begin_authorization(&h.session, "github").await.unwrap();
        let record = h.flow.store().get_session(&h.session).await.unwrap();
        assert_eq!(
            record.provider("github").unwrap().csrf_state,
            Some(state_of(&again))
        );
    }

    #[tokio::test]
    async fn begin_rejects_unknown_provider() {
        let h = harness(key_record("https://p.example.org", "github", "", "github")).await;
        let result = h.flow.begin_authorization(&h.session, "dropbox").await;
        assert!(matches!(result, Err(Error::UnknownProvider(p)) if p == "dropbox"));
    }

    #[tokio::test]
    async fn begin_rejects_unknown_session() {
        let h = harness(key_record("https://p.example.org", "github", "", "github")).await;
        let result = h.flow.begin_authorization("missing", "github").await;
        assert!(matches!(result, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn csrf_mismatch_never_reaches_the_token_endpoint() {
        let (base, mock) = start_provider(vec![(
            "github",
            r#"{"access_token":"a1"}"#,
            r#"{"login":"octocat"}"#,
        )])
        .await;
        let h = harness(key_record(&base, "github", "", "github")).await;
        h.flow.begin_authorization(&h.session, "github").await.unwrap();

        let result = h
            .flow
            .complete_authorization(
                &h.session,
                "github",
                "http://submit.example.org/return/github?state=forged&code=valid-code",
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::Auth(credmon_auth::Error::CsrfMismatch(_)))
        ));
        assert_eq!(mock.token_hits.load(Ordering::SeqCst), 0);

        let record = h.flow.store().get_session(&h.session).await.unwrap();
        assert!(!record.provider("github").unwrap().logged_in);
        assert!(!h.cred_dir.join("alice").exists());
    }

    #[tokio::test]
    async fn callback_without_begin_is_a_mismatch() {
        let (base, mock) = start_provider(vec![("github", r#"{"access_token":"a"}"#, "{}")]).await;
        let h = harness(key_record(&base, "github", "", "github")).await;

        let result = h
            .flow
            .complete_authorization(&h.session, "github", "https://s/return/github?state=&code=c")
            .await;
        assert!(matches!(
            result,
            Err(Error::Auth(credmon_auth::Error::CsrfMismatch(_)))
        ));
        assert_eq!(mock.token_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn state_cannot_be_replayed() {
        let (base, mock) =
            start_provider(vec![("github", r#"{"access_token":"a1"}"#, "{}")]).await;
        let h = harness(key_record(&base, "github", "", "github")).await;

        let url = h.flow.begin_authorization(&h.session, "github").await.unwrap();
        let callback = format!(
            "http://submit.example.org/return/github?state={}&code=c",
            state_of(&url)
        );
        h.flow
            .complete_authorization(&h.session, "github", &callback)
            .await
            .unwrap();
        let replay = h
            .flow
            .complete_authorization(&h.session, "github", &callback)
            .await;
        assert!(matches!(
            replay,
            Err(Error::Auth(credmon_auth::Error::CsrfMismatch(_)))
        ));
        assert_eq!(mock.token_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_provider_wins_over_return_path() {
        let (base, _) = start_provider(vec![(
            "box",
            r#"{"access_token":"work-token"}"#,
            r#"{"login":"alice@work"}"#,
        )])
        .await;
        // Two handles of one provider share the same return URL.
        let key = format!(
            "{}{}",
            key_record(&base, "box", "work", "box"),
            key_record(&base, "box", "home", "box")
        );
        let h = harness(key).await;

        let url = h.flow.begin_authorization(&h.session, "box work").await.unwrap();
        let completion = h
            .flow
            .complete_authorization(
                &h.session,
                "box",
                &format!("https://submit.example.org/return/box?state={}&code=c", state_of(&url)),
            )
            .await
            .unwrap();

        assert_eq!(completion.provider, "box work");
        assert_eq!(completion.username, "alice@work");
        assert!(!completion.session_logged_in);
        assert!(h.cred_dir.join("alice/box_work.use").exists());

        let record = h.flow.store().get_session(&h.session).await.unwrap();
        assert!(record.provider("box work").unwrap().logged_in);
        assert!(!record.provider("box home").unwrap().logged_in);
        assert!(record.in_flight.is_none());
    }

    #[tokio::test]
    async fn unknown_return_provider_without_in_flight_is_rejected() {
        let h = harness(key_record("https://p.example.org", "github", "", "github")).await;
        let result = h
            .flow
            .complete_authorization(&h.session, "gitlab", "https://s/return/gitlab?state=s&code=c")
            .await;
        assert!(matches!(result, Err(Error::UnknownProvider(p)) if p == "gitlab"));
    }

    #[tokio::test]
    async fn rejected_exchange_leaves_provider_logged_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = axum::Router::new().route(
            "/github/token",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    r#"{"error":"bad_verification_code"}"#,
                )
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let h = harness(key_record(&base, "github", "", "github")).await;
        let url = h.flow.begin_authorization(&h.session, "github").await.unwrap();
        let err = h
            .flow
            .complete_authorization(
                &h.session,
                "github",
                &format!("https://s/return/github?state={}&code=c", state_of(&url)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Auth(credmon_auth::Error::TokenExchange(_))
        ));
        assert!(err.to_string().contains("bad_verification_code"));

        let record = h.flow.store().get_session(&h.session).await.unwrap();
        assert!(!record.provider("github").unwrap().logged_in);
        assert!(!h.cred_dir.join("alice/github.use").exists());
    }

    #[tokio::test]
    async fn hung_identity_endpoint_still_completes_as_unknown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = axum::Router::new()
            .route(
                "/github/token",
                post(|| async { r#"{"access_token":"a1","refresh_token":"r1"}"# }),
            )
            .route(
                "/github/user",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    r#"{"login":"too-late"}"#
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let h = harness_with_identity_timeout(
            key_record(&base, "github", "", "github"),
            Duration::from_millis(300),
        )
        .await;
        let url = h.flow.begin_authorization(&h.session, "github").await.unwrap();
        let done = h
            .flow
            .complete_authorization(
                &h.session,
                "github",
                &format!("https://s/return/github?state={}&code=c", state_of(&url)),
            )
            .await
            .unwrap();

        assert_eq!(done.username, "Unknown");
        assert!(done.session_logged_in);
        assert!(h.cred_dir.join("alice/github.use").exists());
        let record = h.flow.store().get_session(&h.session).await.unwrap();
        assert_eq!(record.provider("github").unwrap().username, "Unknown");
    }

    #[tokio::test]
    async fn github_then_box_end_to_end() {
        let (base, mock) = start_provider(vec![
            (
                "github",
                r#"{"access_token":"a1","refresh_token":"r1","token_type":"bearer"}"#,
                r#"{"login":"octocat"}"#,
            ),
            (
                "box",
                r#"{"access_token":"b1","token_type":"bearer","expires_in":3600}"#,
                r#"{"sub":"12345"}"#,
            ),
        ])
        .await;
        let key = format!(
            "{}{}",
            key_record(&base, "github", "", "github"),
            key_record(&base, "box", "", "box")
        );
        let h = harness(key).await;
        let user_dir = h.cred_dir.join("alice");

        // github first
        let url = h.flow.begin_authorization(&h.session, "github").await.unwrap();
        let done = h
            .flow
            .complete_authorization(
                &h.session,
                "github",
                &format!(
                    "http://submit.example.org/return/github?state={}&code=gh-code",
                    state_of(&url)
                ),
            )
            .await
            .unwrap();
        assert_eq!(done.provider, "github");
        assert_eq!(done.username, "octocat");
        assert!(!done.session_logged_in);

        let access = read_json(&user_dir.join("github.use")).await;
        assert_eq!(access["access_token"], "a1");
        assert!(access.get("refresh_token").is_none());
        assert_eq!(
            read_json(&user_dir.join("github.top")).await,
            serde_json::json!({"refresh_token": "r1"})
        );
        let meta = read_json(&user_dir.join("github.meta")).await;
        assert_eq!(
            meta,
            serde_json::json!({
                "client_id": "github-client",
                "client_secret": "github-secret",
                "token_url": format!("{base}/github/token"),
                "use_refresh_token": true
            })
        );
        assert!(!h.flow.store().get_session(&h.session).await.unwrap().logged_in);

        // then box, which issues no refresh token
        let url = h.flow.begin_authorization(&h.session, "box").await.unwrap();
        let done = h
            .flow
            .complete_authorization(
                &h.session,
                "box",
                &format!(
                    "http://submit.example.org/return/box?state={}&code=box-code",
                    state_of(&url)
                ),
            )
            .await
            .unwrap();
        assert_eq!(done.username, "12345");
        assert!(done.session_logged_in);

        assert_eq!(
            read_json(&user_dir.join("box.top")).await,
            serde_json::json!({"refresh_token": ""})
        );
        assert_eq!(
            read_json(&user_dir.join("box.meta")).await["use_refresh_token"],
            false
        );
        assert!(
            read_json(&user_dir.join("box.use")).await.get("expires_at").is_some(),
            "expires_at must be derived from expires_in"
        );

        let record = h.flow.store().get_session(&h.session).await.unwrap();
        assert!(record.logged_in);
        assert_eq!(record.provider("github").unwrap().username, "octocat");
        assert_eq!(mock.token_hits.load(Ordering::SeqCst), 2);
    }
}
