use anyhow::{Result, Context};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use sha2::{Digest, Sha256};
use hex;

/// A completed file written by a [`Storage`] backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size: u64,
    /// Hex SHA-256 of the written bytes.
    pub sha256: String,
}

/// Storage trait for received files handed off by the transfer engine.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_file(&self, file_name: &str, data: &[u8]) -> Result<StoredFile>;
    async fn get_file(&self, file_name: &str) -> Result<Option<Vec<u8>>>;
}

/// Local filesystem-based storage implementation.
#[derive(Clone)]
pub struct LocalStorage {
    files_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)
            .context("Failed to create received files directory")?;

        Ok(Self { files_dir: base_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.files_dir
    }

    /// First free path for `name`, suffixing " (n)" before the extension
    /// so an earlier download is never overwritten.
    async fn free_path(&self, name: &str) -> PathBuf {
        let candidate = self.files_dir.join(name);
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }

        let (stem, ext) = match name.rfind('.') {
            Some(i) if i > 0 => (&name[..i], &name[i..]),
            _ => (name, ""),
        };
        let mut n = 1u32;
        loop {
            let candidate = self.files_dir.join(format!("{} ({}){}", stem, n, ext));
            if !fs::try_exists(&candidate).await.unwrap_or(false) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Reduce a sender-supplied file name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();

    let cleaned: String = last
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put_file(&self, file_name: &str, data: &[u8]) -> Result<StoredFile> {
        let name = sanitize_file_name(file_name);
        let path = self.free_path(&name).await;

        let mut hasher = Sha256::new();
        hasher.update(data);
        let sha256 = hex::encode(hasher.finalize());

        fs::write(&path, data).await
            .with_context(|| format!("Failed to write file {}", path.display()))?;

        tracing::debug!("Stored {} ({} bytes, sha256 {})", path.display(), data.len(), sha256);
        Ok(StoredFile {
            path,
            size: data.len() as u64,
            sha256,
        })
    }

    async fn get_file(&self, file_name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.files_dir.join(sanitize_file_name(file_name));

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let data = fs::read(&path).await
            .with_context(|| format!("Failed to read file {}", path.display()))?;

        tracing::debug!("Retrieved {} ({} bytes)", path.display(), data.len());
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_storage_roundtrip() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = LocalStorage::new(temp.path().to_path_buf())?;

        let data = b"test file data";
        let stored = storage.put_file("notes.txt", data).await?;
        assert_eq!(stored.size, data.len() as u64);
        assert_eq!(stored.sha256.len(), 64);

        let retrieved = storage.get_file("notes.txt").await?;
        assert_eq!(retrieved, Some(data.to_vec()));

        let missing = storage.get_file("nonexistent").await?;
        assert_eq!(missing, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_existing_file_not_overwritten() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = LocalStorage::new(temp.path().to_path_buf())?;

        let first = storage.put_file("photo.jpg", b"one").await?;
        let second = storage.put_file("photo.jpg", b"two").await?;

        assert_ne!(first.path, second.path);
        assert_eq!(second.path.file_name().unwrap(), "photo (1).jpg");
        assert_eq!(std::fs::read(&first.path)?, b"one");
        Ok(())
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(".."), "unnamed");
        assert_eq!(sanitize_file_name("  "), "unnamed");
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
    }
}
