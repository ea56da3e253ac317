use std::path::{Component, Path};

use rft_protocol::{STAGING_META_SUFFIX, STAGING_SUFFIX};

use crate::TransferError;

/// Validates a catalog-resolved path before it is joined to the storage root.
///
/// Rejects:
/// - Empty paths and paths ending in `/`
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Names that collide with the staging or sidecar artifacts
pub fn validate_resolved_path(resolved: &str) -> Result<(), TransferError> {
    if resolved.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }
    if resolved.ends_with('/') {
        return Err(TransferError::InvalidPath(format!(
            "path names a directory: {resolved}"
        )));
    }
    if resolved.ends_with(STAGING_SUFFIX) || resolved.ends_with(STAGING_META_SUFFIX) {
        return Err(TransferError::InvalidPath(format!(
            "path uses a reserved staging suffix: {resolved}"
        )));
    }

    let path = Path::new(resolved);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {resolved}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {resolved}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {resolved}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    if path.file_name().is_none() {
        return Err(TransferError::InvalidPath(format!(
            "path has no file name: {resolved}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_catalog_paths() {
        assert!(validate_resolved_path("scan.tif").is_ok());
        assert!(validate_resolved_path("plant/2024/scan.tif").is_ok());
        assert!(validate_resolved_path("./plant/scan.tif").is_ok());
    }

    #[test]
    fn rejects_empty_and_directory_paths() {
        assert!(validate_resolved_path("").is_err());
        assert!(validate_resolved_path("plant/").is_err());
        assert!(validate_resolved_path(".").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_resolved_path("../etc/passwd").is_err());
        assert!(validate_resolved_path("plant/../../escape").is_err());
        assert!(validate_resolved_path("..").is_err());
    }

    #[test]
    fn rejects_absolute() {
        assert!(matches!(
            validate_resolved_path("/srv/data/scan.tif"),
            Err(TransferError::InvalidPath(_))
        ));
    }

    #[test]
    fn rejects_staging_names() {
        assert!(validate_resolved_path("plant/scan.tif.part").is_err());
        assert!(validate_resolved_path("plant/scan.tif.part.meta").is_err());
    }
}
