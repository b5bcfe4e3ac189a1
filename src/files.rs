//! A [FileStore] over a directory of printable files.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::traits::FileStore;

/// Serves file contents out of a single directory. A job's `file_id` is
/// the file name within that directory.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// A store rooted at the given directory.
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_owned() }
    }
}

#[async_trait::async_trait]
impl FileStore for LocalFileStore {
    async fn fetch(&self, file_id: &str) -> Result<String> {
        // file_id is a bare name, never a path.
        if file_id.contains(['/', '\\']) || file_id.contains("..") {
            anyhow::bail!("invalid file id: {}", file_id);
        }
        let path = self.root.join(file_id);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_and_reject_traversal() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("factory-files-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("part.gcode"), "G28\n").await?;

        let store = LocalFileStore::new(&dir);
        assert_eq!(store.fetch("part.gcode").await?, "G28\n");
        assert!(store.fetch("missing.gcode").await.is_err());
        assert!(store.fetch("../part.gcode").await.is_err());

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }
}
