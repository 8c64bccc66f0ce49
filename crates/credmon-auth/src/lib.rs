//! OAuth credential issuance for the credential monitor
//!
//! Reads key files, drives the authorization-code grant against each
//! provider, and persists the resulting token material where the
//! credential refresher picks it up. Session bookkeeping lives in
//! `credmon-session`; this crate is stateless.
//!
//! Flow per provider:
//! 1. `keyfile::find_provider()` loads the provider's descriptor
//! 2. `authorize::build_authorization_url()` with a fresh `generate_state()`
//! 3. The provider redirects back; `token::parse_callback()` +
//!    `token::verify_callback()` check the state and extract the code
//! 4. `token::complete_exchange()` trades the code for tokens and splits them
//! 5. `credentials::CredentialWriter::write_triad()` persists the files

pub mod authorize;
pub mod classad;
pub mod credentials;
pub mod error;
pub mod keyfile;
pub mod token;

pub use authorize::{build_authorization_url, generate_state};
pub use credentials::{
    Commit, CredentialTriad, CredentialWriter, FileStage, RefreshMetadata, RefreshToken,
    RenameCommit, Stage, TriadPaths,
};
pub use error::{Error, Result};
pub use keyfile::{
    KeyFile, ProviderDescriptor, ProviderEntry, find_provider, provider_display_name,
    resolve_key_path,
};
pub use token::{
    CallbackParams, ExchangeTimeouts, Exchanged, UNKNOWN_USERNAME, complete_exchange,
    parse_callback, verify_callback,
};
