//! Filesystem-backed storage rooted at a single directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use transforge_common::{Error, Result};
use uuid::Uuid;

use super::{ObjectStat, OpenedObject, Storage};
use crate::validate::path::{canonicalize_within, relative_output_path, relative_ref};

/// Storage over a local directory. Every reference is resolved by the
/// filesystem and must stay under the root.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create the root if needed and pin its canonical form.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| Error::storage(format!("Failed to create storage root: {e}")))?;
        let root = root
            .canonicalize()
            .map_err(|e| Error::storage(format!("Failed to resolve storage root: {e}")))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn resolve(&self, reference: &str) -> Result<PathBuf> {
        Ok(canonicalize_within(&self.root, reference).await?)
    }

    /// Create the parent directory of an output reference and confirm that,
    /// once resolved, it is still under the root.
    async fn prepare_output(&self, reference: &str) -> Result<PathBuf> {
        let rel = relative_output_path(reference)?;
        let file_name = rel
            .file_name()
            .ok_or_else(|| Error::storage("output reference has no file name"))?
            .to_owned();
        let parent = self.root.join(rel.parent().unwrap_or_else(|| Path::new("")));

        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::storage(format!("Failed to create output directory: {e}")))?;
        let parent = tokio::fs::canonicalize(&parent)
            .await
            .map_err(|e| Error::storage(format!("Failed to resolve output directory: {e}")))?;
        if !parent.starts_with(&self.root) {
            return Err(transforge_common::ValidationError::PathEscapesRoot.into());
        }
        Ok(parent.join(file_name))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn canonicalize(&self, reference: &str) -> Result<String> {
        let path = self.resolve(reference).await?;
        Ok(relative_ref(&self.root, &path)?)
    }

    async fn stat(&self, reference: &str) -> Result<ObjectStat> {
        let path = match self.resolve(reference).await {
            Ok(p) => p,
            Err(Error::Validation(transforge_common::ValidationError::InputNotFound(_))) => {
                return Ok(ObjectStat::missing())
            }
            Err(e) => return Err(e),
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(ObjectStat {
                exists: true,
                size: meta.len(),
                is_file: meta.is_file(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ObjectStat::missing()),
            Err(e) => Err(Error::storage(format!("stat failed: {e}"))),
        }
    }

    async fn get(&self, reference: &str) -> Result<OpenedObject> {
        let path = self.resolve(reference).await?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::storage(format!("open failed: {e}")))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| Error::storage(format!("stat of opened file failed: {e}")))?;
        if !meta.is_file() {
            return Err(Error::storage("reference is not a regular file"));
        }
        Ok(OpenedObject {
            size: meta.len(),
            reader: Box::new(file),
        })
    }

    async fn put(
        &self,
        reference: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        let dest = self.prepare_output(reference).await?;
        let parent = dest
            .parent()
            .ok_or_else(|| Error::storage("output has no parent directory"))?;
        let tmp = parent.join(format!(".upload-{}", Uuid::new_v4()));
        // Removes the partial file if this future is dropped mid-copy.
        let partial = tempfile::TempPath::from_path(&tmp);

        let result = async {
            let file = tokio::fs::File::create(&tmp).await?;
            let mut writer = BufWriter::new(file);
            tokio::io::copy(reader, &mut writer).await?;
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            tokio::fs::rename(&tmp, &dest).await
        }
        .await;

        if let Err(e) = result {
            drop(partial);
            return Err(Error::storage(format!("write failed: {e}")));
        }
        // Renamed into place; nothing left to remove.
        let _ = partial.keep();

        Ok(relative_ref(&self.root, &dest)?)
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        let path = match self.resolve(reference).await {
            Ok(p) => p,
            Err(Error::Validation(transforge_common::ValidationError::InputNotFound(_))) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!("delete failed: {e}"))),
        }
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
