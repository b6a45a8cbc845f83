use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub upload_id: Uuid,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Staging directory for uploaded CSV files awaiting import.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upload_path(&self, upload_id: Uuid) -> PathBuf {
        self.root.join(format!("{upload_id}.csv"))
    }

    /// Writes through a temp file and renames, so an import never observes a
    /// partially written upload.
    pub async fn store_upload(&self, bytes: &[u8]) -> anyhow::Result<StoredUpload> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating upload directory {}", self.root.display()))?;

        let upload_id = Uuid::new_v4();
        let path = self.upload_path(upload_id);
        let temp_path = self.root.join(format!(".{}.{}.tmp", upload_id, bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp upload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp upload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp upload file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp upload {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredUpload {
            upload_id,
            path,
            byte_size: bytes.len(),
        })
    }

    /// Copies an existing file into the staging directory, leaving the source
    /// untouched. Imports consume the staged copy.
    pub async fn stage_copy(&self, source: &Path) -> anyhow::Result<StoredUpload> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating upload directory {}", self.root.display()))?;

        let upload_id = Uuid::new_v4();
        let path = self.upload_path(upload_id);
        let temp_path = self.root.join(format!(".{upload_id}.copy.tmp"));
        let byte_size = fs::copy(source, &temp_path)
            .await
            .with_context(|| format!("copying {} -> {}", source.display(), temp_path.display()))?;
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("renaming staged copy to {}", path.display()));
        }

        Ok(StoredUpload {
            upload_id,
            path,
            byte_size: byte_size as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn uploads_land_complete_with_no_temp_leftovers() {
        let dir = tempdir().expect("tempdir");
        let store = UploadStore::new(dir.path().join("uploads"));

        let stored = store
            .store_upload(b"sku,name\nA,One\n")
            .await
            .expect("store");

        assert_eq!(stored.path, store.upload_path(stored.upload_id));
        assert_eq!(std::fs::read(&stored.path).expect("read"), b"sku,name\nA,One\n");
        let leftovers = std::fs::read_dir(store.root())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn each_upload_gets_its_own_file() {
        let dir = tempdir().expect("tempdir");
        let store = UploadStore::new(dir.path());
        let first = store.store_upload(b"same").await.expect("first");
        let second = store.store_upload(b"same").await.expect("second");
        assert_ne!(first.path, second.path);
        assert_eq!(second.byte_size, 4);
    }

    #[tokio::test]
    async fn staged_copy_leaves_the_source_in_place() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("products.csv");
        std::fs::write(&source, b"sku,name\nB,Two\n").expect("write");
        let store = UploadStore::new(dir.path().join("uploads"));

        let staged = store.stage_copy(&source).await.expect("stage");
        assert!(source.exists());
        assert_eq!(staged.byte_size, 15);
        assert_eq!(std::fs::read(&staged.path).expect("read"), b"sku,name\nB,Two\n");
    }
}
