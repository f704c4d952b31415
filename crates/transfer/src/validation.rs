use std::path::{Component, Path};

use crate::TransferError;

/// Validates a destination file name: non-empty, a single path component.
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(TransferError::InvalidName(format!("{name:?}")));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(TransferError::InvalidName(format!(
            "separator or NUL in {name:?}"
        )));
    }
    Ok(())
}

/// Validates that a relative sub-directory path stays under its directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_sub_path(sub_path: &str) -> Result<(), TransferError> {
    if sub_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(sub_path);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {sub_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {sub_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {sub_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
