//! File classification helpers used by the rule planner.
//!
//! MIME types are looked up from the extension only; file content is never
//! sniffed.

use regex::Regex;
use std::path::Path;
use tracing::debug;

use crate::model::MISC_FOLDER;

/// Extension reported for files without one.
pub const NO_EXTENSION: &str = "no_extension";

/// Lower-cased extension without the leading dot, or `no_extension`.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| NO_EXTENSION.to_string())
}

/// Best-effort MIME type from the extension, lower-case; empty when unknown.
pub fn guess_mime(path: &Path) -> &'static str {
    mime_guess::from_path(path).first_raw().unwrap_or("")
}

/// Turn a configured folder name into a single path component.
///
/// Path separators become underscores; `.`/`..` and blank names fall back to
/// the misc folder.
pub fn sanitize_folder_name(name: &str) -> String {
    let trimmed = name.trim();
    let cleaned: String = trimmed
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return MISC_FOLDER.to_string();
    }
    cleaned
}

/// Compile a rule regex. Empty and invalid patterns yield `None`.
pub fn compile_regex(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            debug!("Ignoring invalid rule regex '{}': {}", pattern, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("/a/Photo.JPG")), "jpg");
        assert_eq!(extension_of(Path::new("/a/README")), NO_EXTENSION);
        assert_eq!(extension_of(Path::new("/a/archive.tar.gz")), "gz");
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime(Path::new("x/IMG_1.JPEG")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("x/clip.mp4")), "video/mp4");
        assert!(guess_mime(Path::new("x/song.FLAC")).starts_with("audio/"));
        assert!(guess_mime(Path::new("x/scan.tiff")).starts_with("image/"));
        assert_eq!(guess_mime(Path::new("x/unknown.qqq")), "");
        assert_eq!(guess_mime(Path::new("x/Makefile")), "");
    }

    #[test]
    fn test_sanitize_folder_name() {
        assert_eq!(sanitize_folder_name("images"), "images");
        assert_eq!(sanitize_folder_name(" a/b\\c "), "a_b_c");
        assert_eq!(sanitize_folder_name(""), MISC_FOLDER);
        assert_eq!(sanitize_folder_name(".."), MISC_FOLDER);
    }

    #[test]
    fn test_compile_regex_degrades() {
        assert!(compile_regex("").is_none());
        assert!(compile_regex("([unclosed").is_none());
        let re = compile_regex(r"^IMG_\d+").expect("valid regex");
        assert!(re.is_match("IMG_0042.jpg"));
    }
}
