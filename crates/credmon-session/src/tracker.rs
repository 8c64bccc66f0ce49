//! Aggregate login status

use std::collections::BTreeMap;

use crate::session::ProviderSession;

/// A session is logged in once every one of its providers is.
pub fn all_logged_in(providers: &BTreeMap<String, ProviderSession>) -> bool {
    providers.values().all(|p| p.logged_in)
}
