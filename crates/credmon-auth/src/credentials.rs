//! Credential triad persistence
//!
//! Every successful exchange produces three sibling files under
//! `<credential_dir>/<local_user>/`:
//!
//! - `<provider>.use`  access token object (no `refresh_token` key)
//! - `<provider>.top`  `{"refresh_token": "..."}`
//! - `<provider>.meta` client id/secret, token URL and the refresh flag
//!
//! The external refresher watches this directory, so a destination is only
//! ever replaced by renaming a fully written temp file from the same
//! directory over it. Each file swap is atomic on its own; the triad as a
//! whole is not.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const ACCESS_TOKEN_SUFFIX: &str = "use";
pub const REFRESH_TOKEN_SUFFIX: &str = "top";
pub const METADATA_SUFFIX: &str = "meta";

/// Contents of the `.top` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub refresh_token: String,
}

/// Contents of the `.meta` file, read by the refresher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshMetadata {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub use_refresh_token: bool,
}

/// The three documents written for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialTriad {
    pub access: serde_json::Map<String, serde_json::Value>,
    pub refresh: RefreshToken,
    pub metadata: RefreshMetadata,
}

/// Destination paths of a triad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriadPaths {
    pub access: PathBuf,
    pub refresh: PathBuf,
    pub metadata: PathBuf,
}

/// File stem for a provider display name: spaces become underscores.
pub fn credential_file_stem(provider: &str) -> String {
    provider.replace(' ', "_")
}

pub fn triad_paths(user_dir: &Path, provider: &str) -> TriadPaths {
    let stem = credential_file_stem(provider);
    TriadPaths {
        access: user_dir.join(format!("{stem}.{ACCESS_TOKEN_SUFFIX}")),
        refresh: user_dir.join(format!("{stem}.{REFRESH_TOKEN_SUFFIX}")),
        metadata: user_dir.join(format!("{stem}.{METADATA_SUFFIX}")),
    }
}

/// Moves a fully written temp file onto its destination.
///
/// Implementations must be atomic with respect to readers of `dest`. The
/// default is a plain same-directory rename.
pub trait Commit: Send + Sync {
    fn commit<'a>(
        &'a self,
        tmp: &'a Path,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>>;
}

/// `rename(2)` based commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameCommit;

impl Commit for RenameCommit {
    fn commit<'a>(
        &'a self,
        tmp: &'a Path,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>> {
        Box::pin(tokio::fs::rename(tmp, dest))
    }
}

/// Creates and fills a temp file that a later [`Commit`] moves into place.
///
/// `tmp` does not exist yet. On success the contents must be durable. On
/// failure the caller removes whatever was left at `tmp`.
pub trait Stage: Send + Sync {
    fn stage<'a>(
        &'a self,
        tmp: &'a Path,
        contents: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>>;
}

/// Exclusive create with mode 0600, write, `fsync`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStage;

impl Stage for FileStage {
    fn stage<'a>(
        &'a self,
        tmp: &'a Path,
        contents: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options.open(tmp).await?;
            file.write_all(contents).await?;
            file.sync_all().await
        })
    }
}

/// Writes credential triads into the credential directory.
#[derive(Clone)]
pub struct CredentialWriter {
    stager: Arc<dyn Stage>,
    committer: Arc<dyn Commit>,
}

impl Default for CredentialWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialWriter").finish_non_exhaustive()
    }
}

impl CredentialWriter {
    pub fn new() -> Self {
        Self::with_committer(Arc::new(RenameCommit))
    }

    pub fn with_committer(committer: Arc<dyn Commit>) -> Self {
        Self {
            stager: Arc::new(FileStage),
            committer,
        }
    }

    /// Replace how temp files are created and filled.
    pub fn with_stager(mut self, stager: Arc<dyn Stage>) -> Self {
        self.stager = stager;
        self
    }

    /// Persist `triad` for `provider` under `<credential_dir>/<local_username>/`.
    ///
    /// All three temp files are staged before the first rename, so a failure
    /// to create or fill one (e.g. an unwritable directory) leaves every
    /// destination untouched. A rename failure is reported as `Persistence`;
    /// files renamed before it stay committed and leftover temps are removed.
    pub async fn write_triad(
        &self,
        credential_dir: &Path,
        local_username: &str,
        provider: &str,
        triad: &CredentialTriad,
    ) -> Result<TriadPaths> {
        check_component("local username", local_username)?;
        check_component("provider name", provider)?;

        let user_dir = credential_dir.join(local_username);
        tokio::fs::create_dir_all(&user_dir).await.map_err(|e| {
            Error::Persistence(format!(
                "creating user credential directory {}: {e}",
                user_dir.display()
            ))
        })?;

        let paths = triad_paths(&user_dir, provider);
        let documents = [
            (&paths.access, to_json(&triad.access)?),
            (&paths.refresh, to_json(&triad.refresh)?),
            (&paths.metadata, to_json(&triad.metadata)?),
        ];

        let mut staged: Vec<(PathBuf, &PathBuf)> = Vec::with_capacity(documents.len());
        for (dest, contents) in &documents {
            match stage(self.stager.as_ref(), &user_dir, dest, contents).await {
                Ok(tmp) => staged.push((tmp, *dest)),
                Err(e) => {
                    remove_temps(staged.iter().map(|(tmp, _)| tmp)).await;
                    return Err(e);
                }
            }
        }

        for (i, (tmp, dest)) in staged.iter().enumerate() {
            if let Err(e) = self.committer.commit(tmp, dest).await {
                warn!(
                    dest = %dest.display(),
                    committed = i,
                    error = %e,
                    "credential rename failed"
                );
                remove_temps(staged[i..].iter().map(|(tmp, _)| tmp)).await;
                return Err(Error::Persistence(format!(
                    "replacing {}: {e}",
                    dest.display()
                )));
            }
            debug!(dest = %dest.display(), "committed credential file");
        }

        info!(
            provider,
            user = local_username,
            dir = %user_dir.display(),
            "wrote credential files"
        );
        Ok(paths)
    }
}

/// Stage `contents` in a new temp file next to `dest`.
/// The temp holds tokens or the client secret, hence 0600 in [`FileStage`].
async fn stage(
    stager: &dyn Stage,
    dir: &Path,
    dest: &Path,
    contents: &[u8],
) -> Result<PathBuf> {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(
        ".{file_name}.tmp.{}",
        uuid::Uuid::new_v4().as_simple()
    ));

    if let Err(e) = stager.stage(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::Persistence(format!(
            "writing temp file for {}: {e}",
            dest.display()
        )));
    }
    Ok(tmp)
}

async fn remove_temps<'a>(temps: impl Iterator<Item = &'a PathBuf>) {
    for tmp in temps {
        if let Err(e) = tokio::fs::remove_file(tmp).await {
            debug!(tmp = %tmp.display(), error = %e, "temp file cleanup failed");
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| Error::Persistence(format!("serializing credential file: {e}")))
}

/// Reject values that would escape the credential directory.
fn check_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
    {
        return Err(Error::Persistence(format!(
            "{what} {value:?} is not a valid path component"
        )));
    }
    Ok(())
}
