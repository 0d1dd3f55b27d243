//! Input discovery
//!
//! Expands command-line inputs into the list of video files to upscale.
//! Files are taken as given; directories are walked recursively.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Video file extensions picked up from directories (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[".mkv", ".mp4", ".avi", ".mov", ".m4v", ".ts", ".m2ts"];

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Walk `root` for video files, skipping hidden directories and `exclude`
fn scan_directory(root: &Path, exclude: Option<&Path>) -> Vec<PathBuf> {
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() || entry.depth() == 0 {
                return true;
            }
            let hidden = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            !hidden && exclude.map_or(true, |dir| entry.path() != dir)
        });

    walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_video_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

/// Expand `inputs` into video files, in input order and without duplicates
///
/// Paths that are not directories are passed through untouched (including
/// missing ones, which then fail at job submission with a clear error).
/// Directory walks skip hidden directories and `exclude`, typically the
/// output directory, so earlier results are not picked up again.
pub fn collect_inputs(inputs: &[PathBuf], exclude: Option<&Path>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for input in inputs {
        let found = if input.is_dir() {
            scan_directory(input, exclude)
        } else {
            vec![input.clone()]
        };
        for path in found {
            if seen.insert(path.clone()) {
                files.push(path);
            }
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_extension_match_ignores_case(idx in 0usize..VIDEO_EXTENSIONS.len(), upper in any::<bool>()) {
            let ext = &VIDEO_EXTENSIONS[idx][1..];
            let ext = if upper { ext.to_uppercase() } else { ext.to_string() };
            let path = PathBuf::from(format!("/media/clip.{}", ext));
            prop_assert!(is_video_file(&path));
        }
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/media/movie.mkv")));
        assert!(is_video_file(Path::new("/media/movie.M2TS")));
        assert!(!is_video_file(Path::new("/media/movie.txt")));
        assert!(!is_video_file(Path::new("/media/mkv")));
        assert!(!is_video_file(Path::new("/media/frame_000001.png")));
    }

    #[test]
    fn test_collect_walks_directories() {
        let root = TempDir::new().unwrap();
        let dir = root.path();
        fs::create_dir_all(dir.join("season1")).unwrap();
        fs::create_dir_all(dir.join(".cache")).unwrap();
        fs::create_dir_all(dir.join("output_videos")).unwrap();
        for name in [
            "b.mp4",
            "a.MKV",
            "notes.txt",
            "season1/ep1.avi",
            ".cache/hidden.mp4",
            "output_videos/a_upscaled.mp4",
        ] {
            File::create(dir.join(name)).unwrap();
        }

        let exclude = dir.join("output_videos");
        let files = collect_inputs(&[dir.to_path_buf()], Some(&exclude));

        assert_eq!(
            files,
            vec![dir.join("a.MKV"), dir.join("b.mp4"), dir.join("season1/ep1.avi")]
        );
    }

    #[test]
    fn test_collect_passes_files_through_and_dedupes() {
        let root = TempDir::new().unwrap();
        let clip = root.path().join("clip.webm");
        File::create(&clip).unwrap();
        let missing = root.path().join("missing.mp4");

        let files = collect_inputs(&[clip.clone(), missing.clone(), clip.clone()], None);

        assert_eq!(files, vec![clip, missing]);
    }
}
