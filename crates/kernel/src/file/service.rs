//! Upload handling for image and file fields.
//!
//! Private `file` uploads are encrypted with AES-256-GCM before they reach
//! storage. The stored layout is `ENC1 || nonce (12 bytes) || ciphertext`;
//! anything without the marker is returned as-is.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{Context, Result, bail};
use rand::RngCore;
use tracing::{debug, info, warn};

use super::storage::{FileLocation, FileStorage};

const ENCRYPTED_MARKER: &[u8; 4] = b"ENC1";
const NONCE_LEN: usize = 12;

/// A file received in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Client-side filename, unsanitized.
    pub file_name: String,
    /// Content type announced by the client, if any.
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl UploadedFile {
    /// Size in kilobytes, rounded up.
    pub fn size_kb(&self) -> u64 {
        (self.data.len() as u64).div_ceil(1024)
    }

    /// Lower-cased extension of the client filename.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }
}

/// File contents ready to be served.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Stores, reads and removes uploads.
pub struct FileService {
    storage: Arc<dyn FileStorage>,
    encryption_key: Option<[u8; 32]>,
}

impl FileService {
    pub fn new(storage: Arc<dyn FileStorage>, encryption_key: Option<[u8; 32]>) -> Self {
        if encryption_key.is_none() {
            warn!("FILE_ENCRYPTION_KEY is not set; private files will be stored unencrypted");
        }
        Self {
            storage,
            encryption_key,
        }
    }

    /// Store the single upload of row `id` and return its path.
    pub async fn store_single(
        &self,
        location: &FileLocation,
        id: &str,
        upload: &UploadedFile,
    ) -> Result<String> {
        let path = location.single(id);
        self.put(location, &path, &upload.data).await?;
        Ok(path)
    }

    /// Append uploads to a multi-file field and return the new path list.
    ///
    /// Indices continue after the existing entries and skip any path that
    /// is already taken.
    pub async fn store_multiple(
        &self,
        location: &FileLocation,
        id: &str,
        existing: Vec<String>,
        uploads: &[UploadedFile],
    ) -> Result<Vec<String>> {
        let mut paths = existing;
        let mut n = paths.len();
        for upload in uploads {
            let mut path = location.multiple(id, n, &upload.file_name);
            while paths.contains(&path) {
                n += 1;
                path = location.multiple(id, n, &upload.file_name);
            }
            self.put(location, &path, &upload.data).await?;
            paths.push(path);
            n += 1;
        }
        Ok(paths)
    }

    async fn put(&self, location: &FileLocation, path: &str, data: &[u8]) -> Result<()> {
        let bytes = if location.is_encrypted() {
            self.encrypt(data)?
        } else {
            data.to_vec()
        };
        self.storage
            .write(path, &bytes)
            .await
            .context("failed to write file to storage")?;
        info!(
            path = %path,
            size = data.len(),
            encrypted = location.is_encrypted(),
            "upload stored"
        );
        Ok(())
    }

    /// Read a stored file, decrypting it when needed, and sniff its type.
    pub async fn read(&self, path: &str) -> Result<StoredFile> {
        let raw = self
            .storage
            .read(path)
            .await
            .with_context(|| format!("failed to read {path}"))?;
        let data = self.decrypt(raw)?;
        let mime_type = infer::get(&data)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        debug!(path = %path, mime = %mime_type, "file served");
        Ok(StoredFile { data, mime_type })
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.storage.exists(path).await
    }

    /// Delete a stored file; failures are logged, not returned.
    pub async fn delete(&self, path: &str) {
        if let Err(e) = self.storage.delete(path).await {
            warn!(error = %e, path = %path, "failed to delete stored file");
        }
    }

    /// Encrypt file contents. Without a key the data is returned unchanged.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(key) = &self.encryption_key else {
            return Ok(plaintext.to_vec());
        };

        let cipher = Aes256Gcm::new(key.into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut combined =
            Vec::with_capacity(ENCRYPTED_MARKER.len() + NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(ENCRYPTED_MARKER);
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    /// Decrypt stored contents. Data without the marker passes through.
    pub fn decrypt(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        if !stored.starts_with(ENCRYPTED_MARKER) {
            return Ok(stored);
        }
        let body = &stored[ENCRYPTED_MARKER.len()..];
        let Some(key) = &self.encryption_key else {
            bail!("encrypted file but no FILE_ENCRYPTION_KEY configured");
        };
        if body.len() < NONCE_LEN {
            bail!("encrypted file too short");
        }

        let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(key.into());
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))
    }

    pub fn storage(&self) -> &Arc<dyn FileStorage> {
        &self.storage
    }
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("scheme", &self.storage.scheme())
            .field("encrypted", &self.encryption_key.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::file::storage::{LocalFileStorage, UploadKind, Visibility};

    const PNG_HEADER: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn service(dir: &std::path::Path, key: Option<[u8; 32]>) -> FileService {
        FileService::new(Arc::new(LocalFileStorage::new(dir)), key)
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("autocrud-{name}-{}", std::process::id()))
    }

    fn location(visibility: Visibility, kind: UploadKind) -> FileLocation {
        FileLocation {
            visibility,
            kind,
            entity: "order".into(),
            field: "invoice".into(),
        }
    }

    fn upload(name: &str, data: &[u8]) -> UploadedFile {
        UploadedFile {
            file_name: name.into(),
            content_type: None,
            data: data.to_vec(),
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let files = service(&temp_dir("unused"), Some([0x42; 32]));
        let encrypted = files.encrypt(b"secret contents").unwrap();

        assert!(encrypted.starts_with(ENCRYPTED_MARKER));
        assert_ne!(&encrypted[ENCRYPTED_MARKER.len() + NONCE_LEN..], b"secret contents");
        assert_eq!(files.decrypt(encrypted).unwrap(), b"secret contents");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let encrypted = service(&temp_dir("unused"), Some([1; 32]))
            .encrypt(b"data")
            .unwrap();
        assert!(service(&temp_dir("unused"), Some([2; 32])).decrypt(encrypted.clone()).is_err());
        assert!(service(&temp_dir("unused"), None).decrypt(encrypted).is_err());
    }

    #[test]
    fn plaintext_passes_through() {
        let files = service(&temp_dir("unused"), Some([0x42; 32]));
        assert_eq!(files.decrypt(b"plain".to_vec()).unwrap(), b"plain");
        let keyless = service(&temp_dir("unused"), None);
        assert_eq!(keyless.encrypt(b"plain").unwrap(), b"plain");
    }

    #[test]
    fn upload_helpers() {
        let file = upload("Scan.PDF", &[0; 1025]);
        assert_eq!(file.size_kb(), 2);
        assert_eq!(file.extension().as_deref(), Some("pdf"));
        assert_eq!(upload("noext", b"").extension(), None);
    }

    #[tokio::test]
    async fn private_files_are_encrypted_at_rest() {
        let dir = temp_dir("private");
        let files = service(&dir, Some([7; 32]));
        let loc = location(Visibility::Private, UploadKind::Files);

        let path = files
            .store_single(&loc, "5", &upload("a.png", PNG_HEADER))
            .await
            .unwrap();
        assert_eq!(path, "private/files/order/invoice/5");

        let raw = files.storage().read(&path).await.unwrap();
        assert!(raw.starts_with(ENCRYPTED_MARKER));

        let served = files.read(&path).await.unwrap();
        assert_eq!(served.data, PNG_HEADER);
        assert_eq!(served.mime_type, "image/png");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn multiple_uploads_get_fresh_indices() {
        let dir = temp_dir("multiple");
        let files = service(&dir, None);
        let loc = location(Visibility::Public, UploadKind::Files);

        let first = files
            .store_multiple(&loc, "3", Vec::new(), &[upload("a.txt", b"a"), upload("b.txt", b"b")])
            .await
            .unwrap();
        assert_eq!(
            first,
            [
                "public/files/order/invoice/3_0_a.txt",
                "public/files/order/invoice/3_1_b.txt"
            ]
        );

        // After removing the first entry, index 1 is taken by b.txt.
        let kept = vec![first[1].clone()];
        let second = files
            .store_multiple(&loc, "3", kept, &[upload("b.txt", b"again")])
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1], "public/files/order/invoice/3_2_b.txt");

        let served = files.read(&second[1]).await.unwrap();
        assert_eq!(served.data, b"again");
        assert_eq!(served.mime_type, "application/octet-stream");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
