//! File storage backends.
//!
//! Stored files are addressed by a relative path such as
//! `private/files/order/invoice/12`; the path is what the owning row keeps
//! in its column.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::entity::{FieldDescriptor, FieldType};

/// File storage backend trait.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Write data at the given path, replacing any previous content.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read data stored at the given path.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a stored file. Missing files are not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a file exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get the storage scheme (e.g., "local").
    fn scheme(&self) -> &'static str;
}

/// Top-level storage directory of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

/// Directory an upload lands in, derived from its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Images,
    Files,
}

impl UploadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadKind::Images => "images",
            UploadKind::Files => "files",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "images" => Some(UploadKind::Images),
            "files" => Some(UploadKind::Files),
            _ => None,
        }
    }
}

/// Where the uploads of one field of one entity live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub visibility: Visibility,
    pub kind: UploadKind,
    pub entity: String,
    pub field: String,
}

impl FileLocation {
    /// Location for an upload field. Returns `None` for non-upload fields.
    pub fn for_field(entity: &str, field: &FieldDescriptor) -> Option<Self> {
        let kind = match field.field_type {
            FieldType::Image => UploadKind::Images,
            FieldType::File => UploadKind::Files,
            _ => return None,
        };
        let visibility = if field.public {
            Visibility::Public
        } else {
            Visibility::Private
        };
        Some(Self {
            visibility,
            kind,
            entity: entity.to_string(),
            field: field.key.clone(),
        })
    }

    /// Private files are encrypted at rest; private images are not.
    pub fn is_encrypted(&self) -> bool {
        self.visibility == Visibility::Private && self.kind == UploadKind::Files
    }

    fn directory(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.visibility.as_str(),
            self.kind.as_str(),
            self.entity,
            self.field
        )
    }

    /// Path of the single upload owned by row `id`.
    pub fn single(&self, id: &str) -> String {
        format!("{}/{}", self.directory(), id)
    }

    /// Path of the `n`-th upload of a multi-file field.
    pub fn multiple(&self, id: &str, n: usize, filename: &str) -> String {
        format!(
            "{}/{}_{}_{}",
            self.directory(),
            id,
            n,
            sanitize_filename(filename)
        )
    }
}

/// Local filesystem storage.
pub struct LocalFileStorage {
    /// Base path for file storage.
    base_path: PathBuf,
}

impl LocalFileStorage {
    /// Create a new local file storage.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Resolve a stored path below the base directory.
    ///
    /// Rejects absolute paths and `..` components.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            bail!("empty storage path");
        }
        for component in Path::new(path).components() {
            if !matches!(component, Component::Normal(_)) {
                bail!("storage path must be relative without traversal: {path}");
            }
        }
        Ok(self.base_path.join(path))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;

        // Create parent directories if needed
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .context("failed to create directories")?;
        }

        let mut file = fs::File::create(&full)
            .await
            .context("failed to create file")?;
        file.write_all(data).await.context("failed to write file")?;
        file.flush().await.context("failed to flush file")?;

        debug!(path = %path, size = data.len(), "file written");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        let data = fs::read(&full).await.context("failed to read file")?;
        debug!(path = %path, size = data.len(), "file read");
        Ok(data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;

        if fs::try_exists(&full).await.unwrap_or(false) {
            fs::remove_file(&full)
                .await
                .context("failed to delete file")?;
            debug!(path = %path, "file deleted");
        } else {
            warn!(path = %path, "file not found for deletion");
        }

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        fs::try_exists(&full)
            .await
            .context("failed to stat file")
    }

    fn scheme(&self) -> &'static str {
        "local"
    }
}

impl std::fmt::Debug for LocalFileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileStorage")
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// Sanitize a client-supplied filename for safe storage.
pub fn sanitize_filename(filename: &str) -> String {
    // Get just the filename part (no path)
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);

    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .take(200)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn field(key: &str, field_type: FieldType, public: bool) -> FieldDescriptor {
        serde_json::from_value(serde_json::json!({
            "key": key,
            "type": field_type,
            "public": public,
        }))
        .unwrap()
    }

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(sanitize_filename("test.jpg"), "test.jpg");
        assert_eq!(sanitize_filename("my file.jpg"), "my_file.jpg");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("test<script>.jpg"), "test_script_.jpg");

        let result = sanitize_filename("..%2F..%2Fetc%2Fpasswd");
        assert!(!result.contains('%'));
        assert!(!result.contains('/'));
    }

    #[test]
    fn locations_follow_field_metadata() {
        let invoice = FileLocation::for_field("order", &field("invoice", FieldType::File, false))
            .unwrap();
        assert_eq!(invoice.single("12"), "private/files/order/invoice/12");
        assert!(invoice.is_encrypted());

        let photo = FileLocation::for_field("order", &field("photo", FieldType::Image, true))
            .unwrap();
        assert_eq!(
            photo.multiple("12", 0, "front view.png"),
            "public/images/order/photo/12_0_front_view.png"
        );
        assert!(!photo.is_encrypted());

        assert!(FileLocation::for_field("order", &field("code", FieldType::String, false)).is_none());
    }

    #[test]
    fn private_images_are_not_encrypted() {
        let scan = FileLocation::for_field("order", &field("scan", FieldType::Image, false)).unwrap();
        assert_eq!(scan.visibility, Visibility::Private);
        assert!(!scan.is_encrypted());
    }

    #[test]
    fn rejects_traversal() {
        let storage = LocalFileStorage::new("/tmp/uploads");
        assert!(storage.resolve("public/images/../../etc/passwd").is_err());
        assert!(storage.resolve("/etc/passwd").is_err());
        assert!(storage.resolve("").is_err());
        assert_eq!(
            storage.resolve("public/files/order/invoice/1").unwrap(),
            PathBuf::from("/tmp/uploads/public/files/order/invoice/1")
        );
    }

    #[tokio::test]
    async fn write_read_delete() {
        let dir = std::env::temp_dir().join(format!("autocrud-storage-{}", std::process::id()));
        let storage = LocalFileStorage::new(&dir);

        storage.write("public/files/t/f/1", b"hello").await.unwrap();
        assert!(storage.exists("public/files/t/f/1").await.unwrap());
        assert_eq!(storage.read("public/files/t/f/1").await.unwrap(), b"hello");

        storage.delete("public/files/t/f/1").await.unwrap();
        assert!(!storage.exists("public/files/t/f/1").await.unwrap());
        // Deleting twice is fine.
        storage.delete("public/files/t/f/1").await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
