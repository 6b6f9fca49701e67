use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use actix_multipart::{Multipart, MultipartError};
use actix_web::error::BlockingError;
use actix_web::web;
use futures::{StreamExt, TryStreamExt};
use log::{debug, warn};
use uuid::Uuid;

/// Multipart field carrying the image to classify.
pub const IMAGE_FIELD: &str = "image";

/// An uploaded file on disk. The file is removed when the guard drops,
/// whatever path the request took.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    /// Creates an empty, uniquely named file in `dir`.
    pub fn create(dir: &Path) -> io::Result<(Self, File)> {
        let path = dir.join(Uuid::new_v4().simple().to_string());
        let file = File::create_new(&path)?;
        Ok((Self { path }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed upload {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove upload {}: {}", self.path.display(), e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("failed to store upload: {0}")]
    Io(#[from] io::Error),
    #[error("upload writer was cancelled: {0}")]
    Blocking(#[from] BlockingError),
}

/// Streams the first `image` field of the body into `dir`. Other fields are
/// drained and ignored. Returns `None` when the body has no image field.
pub async fn receive_image(
    mut payload: Multipart,
    dir: &Path,
) -> Result<Option<TempUpload>, UploadError> {
    let mut upload = None;

    while let Some(mut field) = payload.try_next().await? {
        let wanted = upload.is_none() && field.name() == Some(IMAGE_FIELD);
        if !wanted {
            while let Some(chunk) = field.next().await {
                chunk?;
            }
            continue;
        }

        let target = dir.to_path_buf();
        let (temp, mut file) = web::block(move || TempUpload::create(&target)).await??;
        let mut size = 0usize;
        while let Some(chunk) = field.next().await {
            let data = chunk?;
            size += data.len();
            // File writes are blocking, keep them off the async worker.
            file = web::block(move || file.write_all(&data).map(|()| file)).await??;
        }
        debug!("Stored {} byte upload at {}", size, temp.path().display());
        upload = Some(temp);
    }

    Ok(upload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (upload, mut file) = TempUpload::create(dir.path()).unwrap();
        file.write_all(b"bytes").unwrap();
        drop(file);

        let path = upload.path().to_path_buf();
        assert_eq!(upload.read().unwrap(), b"bytes");
        drop(upload);
        assert!(!path.exists());
    }

    #[test]
    fn names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = TempUpload::create(dir.path()).unwrap();
        let (b, _) = TempUpload::create(dir.path()).unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn already_removed_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (upload, _) = TempUpload::create(dir.path()).unwrap();
        fs::remove_file(upload.path()).unwrap();
        drop(upload);
    }
}
