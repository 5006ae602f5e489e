use anyhow::{Context, Result};
use std::path::Path;
use walkdir::WalkDir;

use crate::library::grouping::is_supported_extension;
use crate::library::models::{FileContent, RawFile};

/// Scan a directory recursively and return every supported audio file,
/// with paths relative to `directory` and `/` as the separator.
pub fn scan_directory<P: AsRef<Path>>(directory: P) -> Result<Vec<RawFile>> {
    let root = directory.as_ref();
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }

    let mut files = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        // Skip directories
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(extension) = path.extension().map(|e| e.to_string_lossy().to_string()) else {
            continue;
        };
        if !is_supported_extension(&extension) {
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("{} escaped the scan root", path.display()))?;
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        files.push(RawFile {
            relative_path,
            extension,
            content: FileContent::Path(path.to_path_buf()),
        });
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scan_finds_supported_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("album")).unwrap();
        fs::write(dir.path().join("album/Song_(Bass).flac"), b"x").unwrap();
        fs::write(dir.path().join("album/Song_(Vocals).WAV"), b"x").unwrap();
        fs::write(dir.path().join("album/cover.jpg"), b"x").unwrap();
        fs::write(dir.path().join("Intro.mp3"), b"x").unwrap();

        let files = scan_directory(dir.path()).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["Intro.mp3", "album/Song_(Bass).flac", "album/Song_(Vocals).WAV"]
        );
        assert!(matches!(files[0].content, FileContent::Path(ref p) if p.ends_with("Intro.mp3")));
    }

    #[test]
    fn test_scan_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_directory(dir.path().join("nope")).is_err());
    }
}
