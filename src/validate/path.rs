//! Path canonicalization under a permitted root.
//!
//! References are resolved by the filesystem first (symlinks, `.` and `..`
//! segments) and only the resolved path is compared against the root. A
//! lexical check on the raw string would let a symlink inside the root point
//! anywhere.

use std::path::{Component, Path, PathBuf};

use transforge_common::ValidationError;

use super::filename::validate_filename;

/// Resolve `reference` against `root` and require the result to stay under it.
///
/// `root` must itself be canonical. Absolute references are resolved as-is
/// and therefore only pass when they already point inside `root`.
pub async fn canonicalize_within(root: &Path, reference: &str) -> Result<PathBuf, ValidationError> {
    if reference.trim().is_empty() {
        return Err(ValidationError::MissingField("input"));
    }
    if reference.contains('\0') {
        return Err(ValidationError::InvalidFilename(reference.replace('\0', "\\0")));
    }

    let candidate = root.join(reference);
    let canonical = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| ValidationError::InputNotFound(reference.to_string()))?;

    if !canonical.starts_with(root) {
        return Err(ValidationError::PathEscapesRoot);
    }
    Ok(canonical)
}

/// Express a canonical path under `root` as a `/`-separated reference.
pub fn relative_ref(root: &Path, canonical: &Path) -> Result<String, ValidationError> {
    let rel = canonical
        .strip_prefix(root)
        .map_err(|_| ValidationError::PathEscapesRoot)?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    Ok(parts.join("/"))
}

/// Check a reference that may not exist yet (an output location).
///
/// Only plain relative segments are accepted, each of which must be a valid
/// filename. The caller still canonicalizes the existing parent directory
/// before writing, since a directory on the way may be a symlink.
pub fn relative_output_path(reference: &str) -> Result<PathBuf, ValidationError> {
    let path = Path::new(reference);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(seg) => {
                let seg = seg.to_str().ok_or_else(|| {
                    ValidationError::InvalidFilename(seg.to_string_lossy().into_owned())
                })?;
                validate_filename(seg)?;
                out.push(seg);
            }
            _ => return Err(ValidationError::PathEscapesRoot),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ValidationError::MissingField("output"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical_root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn resolves_inside_root() {
        let (_dir, root) = canonical_root();
        std::fs::create_dir(root.join("clips")).unwrap();
        std::fs::write(root.join("clips/a.mov"), b"x").unwrap();

        let p = canonicalize_within(&root, "clips/../clips/./a.mov").await.unwrap();
        assert_eq!(p, root.join("clips/a.mov"));
        assert_eq!(relative_ref(&root, &p).unwrap(), "clips/a.mov");
    }

    #[tokio::test]
    async fn rejects_dotdot_escape() {
        let (_dir, root) = canonical_root();
        let inner = root.join("inner");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(root.join("secret.txt"), b"x").unwrap();

        let err = canonicalize_within(&inner, "../secret.txt").await.unwrap_err();
        assert_eq!(err, ValidationError::PathEscapesRoot);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejects_symlink_escape() {
        let (_outside_dir, outside) = canonical_root();
        std::fs::write(outside.join("passwd"), b"root:x").unwrap();

        let (_dir, root) = canonical_root();
        std::os::unix::fs::symlink(outside.join("passwd"), root.join("innocent.mov")).unwrap();

        let err = canonicalize_within(&root, "innocent.mov").await.unwrap_err();
        assert_eq!(err, ValidationError::PathEscapesRoot);
    }

    #[tokio::test]
    async fn rejects_absolute_outside() {
        let (_dir, root) = canonical_root();
        let err = canonicalize_within(&root, "/").await.unwrap_err();
        assert_eq!(err, ValidationError::PathEscapesRoot);
    }

    #[tokio::test]
    async fn missing_and_empty() {
        let (_dir, root) = canonical_root();
        assert!(matches!(
            canonicalize_within(&root, "nope.mov").await,
            Err(ValidationError::InputNotFound(_))
        ));
        assert_eq!(
            canonicalize_within(&root, "  ").await.unwrap_err(),
            ValidationError::MissingField("input")
        );
    }

    #[test]
    fn output_paths_are_plain_segments() {
        assert_eq!(
            relative_output_path("outputs/job-1/clip.mp4").unwrap(),
            PathBuf::from("outputs/job-1/clip.mp4")
        );
        assert!(relative_output_path("../x.mp4").is_err());
        assert!(relative_output_path("/abs/x.mp4").is_err());
        assert!(relative_output_path("outputs/-rf.mp4").is_err());
        assert!(relative_output_path("").is_err());
    }
}
