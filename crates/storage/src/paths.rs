use std::path::{Component, Path, PathBuf};

use relayer_types::{RelayerError, SecurityIssue};

/// Resolve a configured storage directory against the project root.
///
/// Rejects any path containing `..` and any absolute path that escapes the
/// root. The returned path is always inside `root`.
pub fn resolve_storage_dir(root: &Path, configured: &str) -> Result<PathBuf, RelayerError> {
    let candidate = Path::new(configured);
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(SecurityIssue::PathEscape.into());
    }

    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    if !resolved.starts_with(root) {
        return Err(SecurityIssue::PathEscape.into());
    }
    Ok(resolved)
}

/// State files must stay within `[A-Za-z0-9_.-]+`.
pub fn validate_filename(name: &str) -> Result<(), RelayerError> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(SecurityIssue::UnsafeFilename.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_components_and_escapes() {
        let root = Path::new("/srv/relayer");
        assert!(resolve_storage_dir(root, "../elsewhere").is_err());
        assert!(resolve_storage_dir(root, "state/../../etc").is_err());
        assert!(resolve_storage_dir(root, "/tmp/outside").is_err());

        let ok = resolve_storage_dir(root, "state").unwrap();
        assert_eq!(ok, Path::new("/srv/relayer/state"));
        let abs = resolve_storage_dir(root, "/srv/relayer/state").unwrap();
        assert_eq!(abs, Path::new("/srv/relayer/state"));
    }

    #[test]
    fn filename_charset_is_enforced() {
        assert!(validate_filename("processed_messages.json").is_ok());
        assert!(validate_filename("swaps.json").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("sw aps.json").is_err());
        assert!(validate_filename("swaps/evil.json").is_err());
    }
}
