use std::fs::File;
use std::io::{self, Read as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tokio::fs;
use url::Url;

/// A published file, addressed by the SHA-256 of its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub digest: String,
    pub name: String,
    pub path: PathBuf,
    pub uri: String,
    pub bytes: u64,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn artifact_path(&self, digest: &str, name: &str) -> PathBuf;
    fn artifact_uri(&self, digest: &str, name: &str) -> anyhow::Result<String>;

    /// Copies `source` into the store. Storing identical content twice is a no-op.
    async fn put_file(&self, source: &Path, name: &str) -> anyhow::Result<StoredArtifact>;
}

#[derive(Debug, Clone)]
pub struct LocalFsArtifactStore {
    base_dir: PathBuf,
    public_base_url: Option<Url>,
}

impl LocalFsArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            public_base_url: None,
        }
    }

    /// Serve artifacts under `<base>/artifacts/<digest>/<name>` instead of `file://`.
    pub fn with_public_base_url(mut self, url: Url) -> Self {
        self.public_base_url = Some(url);
        self
    }

    fn artifacts_dir(&self) -> PathBuf {
        self.base_dir.join("artifacts")
    }
}

#[async_trait]
impl ArtifactStore for LocalFsArtifactStore {
    fn artifact_path(&self, digest: &str, name: &str) -> PathBuf {
        self.artifacts_dir().join(digest).join(name)
    }

    fn artifact_uri(&self, digest: &str, name: &str) -> anyhow::Result<String> {
        match &self.public_base_url {
            Some(base) => {
                let mut url = base.clone();
                url.path_segments_mut()
                    .map_err(|()| anyhow::anyhow!("public base url cannot have a path: {base}"))?
                    .pop_if_empty()
                    .extend(["artifacts", digest, name]);
                Ok(url.to_string())
            }
            None => {
                let path = std::path::absolute(self.artifact_path(digest, name))
                    .context("resolve artifact path")?;
                let url = Url::from_file_path(&path)
                    .map_err(|()| anyhow::anyhow!("not a file path: {}", path.display()))?;
                Ok(url.to_string())
            }
        }
    }

    async fn put_file(&self, source: &Path, name: &str) -> anyhow::Result<StoredArtifact> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            anyhow::bail!("invalid artifact name: {name:?}");
        }

        let source_for_blocking = source.to_path_buf();
        let (digest, bytes) =
            tokio::task::spawn_blocking(move || sha256_file_blocking(&source_for_blocking))
                .await
                .context("join digest task")??;

        let path = self.artifact_path(&digest, name);
        if fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(digest = %digest, name, "artifact already stored");
        } else {
            let dir = path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("artifact path has no parent"))?;
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create artifact dir: {}", dir.display()))?;
            // Copy then rename so readers never observe a partial file.
            let partial = path.with_extension("partial");
            fs::copy(source, &partial)
                .await
                .with_context(|| format!("copy artifact: {}", source.display()))?;
            fs::rename(&partial, &path)
                .await
                .with_context(|| format!("store artifact: {}", path.display()))?;
            tracing::info!(digest = %digest, name, bytes, "artifact stored");
        }

        Ok(StoredArtifact {
            uri: self.artifact_uri(&digest, name)?,
            digest,
            name: name.to_owned(),
            path,
            bytes,
        })
    }
}

fn sha256_file_blocking(path: &Path) -> anyhow::Result<(String, u64)> {
    let mut file = File::open(path).with_context(|| format!("open: {}", path.display()))?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).with_context(|| format!("read: {}", path.display())),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}
