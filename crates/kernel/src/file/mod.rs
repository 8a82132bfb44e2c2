//! Uploaded files for image and file fields.
//!
//! Provides path layout, local storage and at-rest encryption.

pub mod service;
pub mod storage;

pub use service::{FileService, StoredFile, UploadedFile};
pub use storage::{
    FileLocation, FileStorage, LocalFileStorage, UploadKind, Visibility, sanitize_filename,
};
