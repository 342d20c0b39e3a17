use std::path::{Path, PathBuf};

/// Resolves a user-supplied workspace root to an absolute, canonicalized
/// form where possible, without requiring the path to already exist.
pub fn normalize_workspace_path(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let as_path = PathBuf::from(trimmed);
    let absolute = if as_path.is_absolute() {
        as_path
    } else {
        std::env::current_dir().ok()?.join(as_path)
    };
    let normalized = if absolute.exists() {
        absolute.canonicalize().ok()?
    } else {
        absolute
    };
    Some(normalized.to_string_lossy().to_string())
}

/// Sandbox check: is `path` contained within `workspace_root`? Used before
/// any `readFile`/`writeFile` call the workspace contract exposes, so a
/// task or tool cannot escape the workspace via `..` or a symlink.
pub fn is_within_workspace_root(path: &Path, workspace_root: &Path) -> bool {
    let candidate = if path.exists() {
        path.canonicalize().ok()
    } else if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        std::env::current_dir().ok().map(|cwd| cwd.join(path))
    };
    let Some(candidate) = candidate else {
        return false;
    };
    let root = if workspace_root.exists() {
        workspace_root
            .canonicalize()
            .unwrap_or_else(|_| workspace_root.to_path_buf())
    } else {
        workspace_root.to_path_buf()
    };
    let candidate = normalize_for_workspace_compare(candidate);
    let root = normalize_for_workspace_compare(root);
    candidate.starts_with(root)
}

fn normalize_for_workspace_compare(path: PathBuf) -> PathBuf {
    #[cfg(windows)]
    {
        let mut text = path.to_string_lossy().replace('/', "\\");
        if let Some(rest) = text.strip_prefix(r"\\?\UNC\") {
            text = format!(r"\\{}", rest);
        } else if let Some(rest) = text.strip_prefix(r"\\?\") {
            text = rest.to_string();
        }
        PathBuf::from(text.to_ascii_lowercase())
    }

    #[cfg(not(windows))]
    {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_blank_input() {
        assert!(normalize_workspace_path("   ").is_none());
    }

    #[test]
    fn within_root_accepts_nested_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let nested = root.join("goals").join("g-1.md");
        assert!(is_within_workspace_root(&nested, root));
    }

    #[test]
    fn within_root_rejects_parent_escape() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("workspace");
        std::fs::create_dir_all(&root).expect("mkdir");
        let escape = tmp.path().join("outside.md");
        assert!(!is_within_workspace_root(&escape, &root));
    }

    #[cfg(windows)]
    #[test]
    fn workspace_root_compare_handles_verbatim_prefix_mismatch() {
        let workspace = PathBuf::from(r"\\?\C:\Users\test\work\conductor");
        let candidate = PathBuf::from(r"C:\Users\test\work\conductor\goals");
        assert!(is_within_workspace_root(&candidate, &workspace));
    }
}
