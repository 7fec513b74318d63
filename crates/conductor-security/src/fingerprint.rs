use conductor_core::ConductorResult;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Lowercase hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint a file's current content.
pub async fn fingerprint_file(path: &Path) -> ConductorResult<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(fingerprint(&bytes))
}

/// Constant-time comparison of two hex digests, case-insensitive.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    let a = expected.trim().to_ascii_lowercase();
    let b = actual.trim().to_ascii_lowercase();
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Join a worker-supplied relative path onto `root`, refusing anything that
/// could escape it (absolute paths, `..`, drive prefixes).
pub fn contained_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    if relative.is_empty() {
        return None;
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(root.join(rel))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_fingerprint_file_tracks_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("report.txt");
        tokio::fs::write(&path, b"all tests passed").await.unwrap();
        let before = fingerprint_file(&path).await.unwrap();
        tokio::fs::write(&path, b"all tests passed!").await.unwrap();
        let after = fingerprint_file(&path).await.unwrap();
        assert_ne!(before, after);
        assert!(digests_match(&after, &after.to_uppercase()));
        assert!(!digests_match(&before, &after));
    }

    #[test]
    fn test_contained_path_rejects_escapes() {
        let root = Path::new("/state/work/T1");
        assert_eq!(
            contained_path(root, "out/log.txt"),
            Some(root.join("out/log.txt"))
        );
        assert!(contained_path(root, "../T2/log.txt").is_none());
        assert!(contained_path(root, "/etc/passwd").is_none());
        assert!(contained_path(root, "").is_none());
    }
}
