use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// A destination for named report artifacts.
#[async_trait::async_trait]
pub trait WriteArtifact: Send + Sync {
    async fn write_artifact(&self, name: &str, contents: &[u8]) -> Result<()>;
}

/// Writes artifacts as files in a directory.
#[derive(Clone, Debug)]
pub struct ArtifactDir {
    root: PathBuf,
}

// === impl ArtifactDir ===

impl ArtifactDir {
    /// Creates the directory, and its parents, if needed.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl WriteArtifact for ArtifactDir {
    async fn write_artifact(&self, name: &str, contents: &[u8]) -> Result<()> {
        let path = self.root.join(name);
        fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), bytes = contents.len(), "Wrote artifact");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_files() {
        let root = std::env::temp_dir().join(format!("port-audit-artifacts-{}", std::process::id()));
        let dir = ArtifactDir::create(root.join("nested"))
            .await
            .expect("must create directory");

        dir.write_artifact("raw-ss-tcp", b"LISTEN 0 4096 *:22 *:*\n")
            .await
            .expect("must write artifact");
        let written = fs::read(dir.root().join("raw-ss-tcp"))
            .await
            .expect("must read artifact");
        assert_eq!(written, b"LISTEN 0 4096 *:22 *:*\n");

        fs::remove_dir_all(&root).await.expect("must clean up");
    }
}
