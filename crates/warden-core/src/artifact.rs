use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use sha1::Digest;

const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Makes sure an executable artifact exists locally before it is launched.
#[async_trait::async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch_if_absent(&self, local: &Path) -> anyhow::Result<PathBuf>;
}

/// Downloads the artifact over HTTP the first time it is needed.
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
    url: Option<String>,
    sha1: Option<String>,
}

impl HttpArtifactFetcher {
    pub fn new(url: Option<String>, sha1: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("warden")
            .timeout(Duration::from_secs(10 * 60))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            url,
            sha1: sha1.map(|s| s.trim().to_ascii_lowercase()),
        })
    }

    async fn download(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let res: anyhow::Result<Vec<u8>> = async {
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("download {url}"))?
                    .error_for_status()
                    .with_context(|| format!("download {url} (status)"))?;
                let b = resp.bytes().await.context("read artifact body")?;
                Ok(b.to_vec())
            }
            .await;

            match res {
                Ok(b) => return Ok(b),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "artifact download attempt failed");
                    last_err = Some(e);
                    if attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download failed")))
    }
}

pub(crate) fn verify_sha1(bytes: &[u8], expected: &str) -> anyhow::Result<()> {
    let got = hex::encode(sha1::Sha1::digest(bytes));
    if got != expected {
        anyhow::bail!("sha1 mismatch: expected {expected}, got {got}");
    }
    Ok(())
}

#[cfg(unix)]
async fn mark_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    let mut perms = meta.permissions();
    if perms.mode() & 0o111 != 0o111 {
        perms.set_mode(perms.mode() | 0o755);
        tokio::fs::set_permissions(path, perms)
            .await
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[async_trait::async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch_if_absent(&self, local: &Path) -> anyhow::Result<PathBuf> {
        if tokio::fs::try_exists(local).await.unwrap_or(false) {
            mark_executable(local).await?;
            return Ok(local.to_path_buf());
        }

        let Some(url) = self.url.as_deref() else {
            anyhow::bail!(
                "{} does not exist and no download url is configured",
                local.display()
            );
        };

        tracing::info!(url, path = %local.display(), "downloading artifact");
        let bytes = self.download(url).await?;
        if let Some(expected) = self.sha1.as_deref() {
            verify_sha1(&bytes, expected)?;
        }

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp = local.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        mark_executable(&tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, local).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("rename into {}", local.display()));
        }
        Ok(local.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_verification() {
        assert!(verify_sha1(b"abc", "a9993e364706816aba3e25717850c26c9cd0d89d").is_ok());
        let err = verify_sha1(b"abd", "a9993e364706816aba3e25717850c26c9cd0d89d").unwrap_err();
        assert!(err.to_string().contains("sha1 mismatch"));
    }

    #[tokio::test]
    async fn existing_file_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("agent");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();

        let fetcher = HttpArtifactFetcher::new(None, None).unwrap();
        let got = fetcher.fetch_if_absent(&bin).await.unwrap();
        assert_eq!(got, bin);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&bin).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn missing_file_without_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpArtifactFetcher::new(None, None).unwrap();
        let err = fetcher
            .fetch_if_absent(&dir.path().join("agent"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no download url"));
    }
}
