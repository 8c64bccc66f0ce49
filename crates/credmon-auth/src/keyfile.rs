//! Key files and provider descriptors
//!
//! A key file lives in the credential directory under a hex key id and holds
//! one ClassAd per requested provider. Loading is read-only. Each operation
//! only demands the fields it uses: seeding a session needs `Provider` and
//! `LocalUser`, while a full [`ProviderDescriptor`] (needed to talk to the
//! provider) requires every connection field.

use std::path::{Path, PathBuf};

use common::Secret;
use tracing::debug;

use crate::classad::{self, ClassAd};
use crate::error::{Error, Result};

/// Display name for a `(Provider, Handle)` pair: `"provider handle"`, with
/// trailing spaces dropped when the handle is empty.
pub fn provider_display_name(provider: &str, handle: &str) -> String {
    format!("{provider} {handle}").trim_end_matches(' ').to_string()
}

/// Split a comma-separated `Scopes` attribute, trimming each entry.
pub fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Everything needed to run the authorization-code flow against one
/// provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub provider: String,
    pub handle: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub authorization_url: String,
    pub token_url: String,
    /// Identity endpoint (`UserUrl`). Optional: without it the username
    /// resolves to `Unknown`.
    pub user_info_url: Option<String>,
    pub return_url: String,
    pub scopes: Option<Vec<String>>,
    pub audience: Option<String>,
    pub local_username: String,
}

impl ProviderDescriptor {
    pub fn display_name(&self) -> String {
        provider_display_name(&self.provider, &self.handle)
    }

    fn from_ad(ad: &ClassAd) -> Result<Self> {
        let provider = required(ad, "Provider", "<unnamed>")?;
        let handle = ad.get_str("Handle")?.unwrap_or_default().to_string();
        let name = provider_display_name(&provider, &handle);

        Ok(Self {
            client_id: required(ad, "ClientId", &name)?,
            client_secret: Secret::new(required(ad, "ClientSecret", &name)?),
            authorization_url: required(ad, "AuthorizationUrl", &name)?,
            token_url: required(ad, "TokenUrl", &name)?,
            user_info_url: ad.get_str("UserUrl")?.map(str::to_string),
            return_url: required(ad, "ReturnUrl", &name)?,
            scopes: ad.get_str("Scopes")?.map(parse_scopes),
            audience: ad.get_str("Audience")?.map(str::to_string),
            local_username: required(ad, "LocalUser", &name)?,
            provider,
            handle,
        })
    }
}

/// The subset of a record a session is seeded from.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEntry {
    pub name: String,
    pub scopes: Option<Vec<String>>,
    pub audience: Option<String>,
}

/// A parsed key file.
#[derive(Debug, Clone)]
pub struct KeyFile {
    pub path: PathBuf,
    /// Shared by every record; loading fails if records disagree.
    pub local_username: String,
    pub entries: Vec<ProviderEntry>,
    ads: Vec<ClassAd>,
}

impl KeyFile {
    /// Read and parse the key file at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let ads = read_ads(path).await?;

        let mut local_username: Option<String> = None;
        let mut entries = Vec::with_capacity(ads.len());
        for ad in &ads {
            let provider = required(ad, "Provider", "<unnamed>")?;
            let handle = ad.get_str("Handle")?.unwrap_or_default();
            let name = provider_display_name(&provider, handle);

            let user = required(ad, "LocalUser", &name)?;
            match &local_username {
                Some(existing) if *existing != user => {
                    return Err(Error::Parse(format!(
                        "key file {} names conflicting local users {existing:?} and {user:?}",
                        path.display()
                    )));
                }
                Some(_) => {}
                None => local_username = Some(user),
            }

            entries.push(ProviderEntry {
                name,
                scopes: ad.get_str("Scopes")?.map(parse_scopes),
                audience: ad.get_str("Audience")?.map(str::to_string),
            });
        }

        let local_username = local_username
            .ok_or_else(|| Error::Parse(format!("key file {} has no records", path.display())))?;

        debug!(path = %path.display(), providers = entries.len(), "loaded key file");
        Ok(Self {
            path: path.to_path_buf(),
            local_username,
            entries,
            ads,
        })
    }

    /// Full descriptors for every record, in file order.
    pub fn descriptors(&self) -> Result<Vec<ProviderDescriptor>> {
        self.ads.iter().map(ProviderDescriptor::from_ad).collect()
    }

    /// First record whose display name equals `name`.
    pub fn descriptor(&self, name: &str) -> Result<ProviderDescriptor> {
        for ad in &self.ads {
            let Some(provider) = ad.get_str("Provider")? else {
                continue;
            };
            let handle = ad.get_str("Handle")?.unwrap_or_default();
            if provider_display_name(provider, handle) == name {
                return ProviderDescriptor::from_ad(ad);
            }
        }
        Err(Error::NotFound(format!(
            "provider {name} not in key file {}",
            self.path.display()
        )))
    }
}

/// Re-read the key file and return the descriptor for `name`.
pub async fn find_provider(name: &str, path: &Path) -> Result<ProviderDescriptor> {
    KeyFile::load(path).await?.descriptor(name)
}

/// Map a key id from the URL to its key file inside `credential_dir`.
///
/// The id must be non-empty hex; anything else is rejected before the
/// filesystem is touched.
pub async fn resolve_key_path(credential_dir: &Path, key_id: &str) -> Result<PathBuf> {
    if key_id.is_empty() || !key_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidKeyId(format!("{key_id:?} is not a hex key id")));
    }
    let path = credential_dir.join(key_id);
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Ok(path),
        Ok(false) => Err(Error::NotFound(format!(
            "key file {} doesn't exist",
            path.display()
        ))),
        Err(e) => Err(Error::NotFound(format!(
            "key file {} is not accessible: {e}",
            path.display()
        ))),
    }
}

async fn read_ads(path: &Path) -> Result<Vec<ClassAd>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!(
                "key file {} doesn't exist",
                path.display()
            )));
        }
        Err(e) => {
            return Err(Error::Parse(format!(
                "reading key file {}: {e}",
                path.display()
            )));
        }
    };

    let ads = classad::parse_ads(&contents)?;
    if ads.is_empty() {
        return Err(Error::Parse(format!(
            "key file {} has no records",
            path.display()
        )));
    }
    Ok(ads)
}

fn required(ad: &ClassAd, field: &'static str, provider: &str) -> Result<String> {
    ad.get_str(field)?
        .map(str::to_string)
        .ok_or_else(|| Error::MissingField {
            provider: provider.to_string(),
            field,
        })
}
