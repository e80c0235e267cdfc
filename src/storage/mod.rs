//! Storage collaborator.
//!
//! The core reads inputs and writes outputs only through [`Storage`], so a
//! local directory and an object store are interchangeable. References are
//! backend-relative strings; [`Storage::canonicalize`] is the single place
//! that turns caller input into one.

mod local;

pub use local::LocalStorage;

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use transforge_common::Result;

/// Result of a metadata probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub exists: bool,
    pub size: u64,
    /// False for directories and other non-regular entries.
    pub is_file: bool,
}

impl ObjectStat {
    pub fn missing() -> Self {
        Self {
            exists: false,
            size: 0,
            is_file: false,
        }
    }
}

/// An object opened for streaming reads.
///
/// `size` is taken from the opened handle, so it describes exactly the bytes
/// `reader` will produce even if the reference is replaced afterwards.
pub struct OpenedObject {
    pub size: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for OpenedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Resolve a caller-supplied reference to its canonical form, rejecting
    /// anything that lands outside the backend's root.
    async fn canonicalize(&self, reference: &str) -> Result<String>;

    /// Probe size and existence without reading content.
    async fn stat(&self, reference: &str) -> Result<ObjectStat>;

    /// Open an object for streaming reads.
    async fn get(&self, reference: &str) -> Result<OpenedObject>;

    /// Stream `reader` into `reference`, replacing any existing object
    /// atomically. Returns the stored reference.
    async fn put(
        &self,
        reference: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, reference: &str) -> Result<()>;

    /// Local directory the objects live in, for backends that have one.
    fn local_root(&self) -> Option<&Path> {
        None
    }
}
