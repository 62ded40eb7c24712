//! Safety utilities to prevent overwriting pipeline inputs.
//!
//! The merge writes its output by renaming a finished temp file onto the
//! target path, which would silently destroy an input that happened to live
//! at that path. These checks run before any work starts.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Best-effort absolute form of `path`. Files that do not exist yet are
/// resolved through their parent directory.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

/// Validates that an output path is safe to overwrite.
///
/// The output (and its `.partial` sibling) must not resolve to any of
/// `source_paths`: the base table, the metadata log, the progress store.
pub fn validate_output_path(output: &Path, source_paths: &[&Path]) -> Result<()> {
    if output.file_name().is_none() {
        bail!(
            "Safety check failed: output '{}' does not name a file",
            output.display()
        );
    }

    let target = resolve(output);
    let partial = resolve(&partial_path(output));
    for source in source_paths {
        let source_resolved = resolve(source);
        if target == source_resolved || partial == source_resolved {
            bail!(
                "Safety check failed: output '{}' cannot be the same as source '{}'",
                output.display(),
                source.display()
            );
        }
    }

    Ok(())
}

/// Temp path the merge streams into before the final rename.
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_valid_output() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("history.csv");
        std::fs::write(&base, "a\n").unwrap();
        let output = dir.path().join("history_enriched.csv");
        assert!(validate_output_path(&output, &[&base]).is_ok());
    }

    #[test]
    fn test_output_equals_source() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("history.csv");
        std::fs::write(&base, "a\n").unwrap();

        // Same file reached through a different spelling
        let output = dir.path().join(".").join("history.csv");
        let result = validate_output_path(&output, &[&base]);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot be the same as source"));
    }

    #[test]
    fn test_partial_sibling_equals_source() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("out.csv.partial");
        std::fs::write(&log, "a\n").unwrap();
        assert!(validate_output_path(&dir.path().join("out.csv"), &[&log]).is_err());
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/data/out.csv")),
            PathBuf::from("/data/out.csv.partial")
        );
    }
}
