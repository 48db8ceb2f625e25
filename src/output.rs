use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// `<dir>/<n>.mp4` with `n` one past the number of entries already in `dir`,
/// bumped further while that name is taken.
pub fn next_output_path(dir: &Path) -> Result<PathBuf> {
    let existing = if dir.exists() {
        std::fs::read_dir(dir)
            .with_context(|| format!("listing {}", dir.display()))?
            .count()
    } else {
        0
    };

    let mut n = existing + 1;
    loop {
        let candidate = dir.join(format!("{}.mp4", n));
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_or_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_output_path(dir.path()).unwrap(), dir.path().join("1.mp4"));
        let missing = dir.path().join("out");
        assert_eq!(next_output_path(&missing).unwrap(), missing.join("1.mp4"));
    }

    #[test]
    fn test_counts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1.jpg"), b"").unwrap();
        std::fs::write(dir.path().join("1.mp4"), b"").unwrap();
        assert_eq!(next_output_path(dir.path()).unwrap(), dir.path().join("3.mp4"));
    }

    #[test]
    fn test_skips_taken_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2.mp4"), b"").unwrap();
        // one entry → 2.mp4, which is taken
        assert_eq!(next_output_path(dir.path()).unwrap(), dir.path().join("3.mp4"));
    }
}
