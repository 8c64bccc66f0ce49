//! Browser-session bookkeeping for the credential monitor
//!
//! A session tracks one key file's providers through the authorization-code
//! dance. The store owns the state; `OAuthFlow` drives the two phases and
//! hands the issued tokens to the credential writer.
//!
//! Session lifecycle:
//! 1. `SessionStore::create_session()` when the user opens a key's page
//! 2. `OAuthFlow::begin_authorization()` per provider → redirect URL
//! 3. `OAuthFlow::complete_authorization()` on the provider's callback →
//!    credential files written, provider marked logged in
//! 4. The session reports `logged_in` once every provider is done

pub mod error;
pub mod flow;
pub mod session;
pub mod tracker;

pub use error::{Error, Result};
pub use flow::{Completion, FlowSettings, OAuthFlow};
pub use session::{ProviderSession, SessionRecord, SessionStore};
pub use tracker::all_logged_in;
