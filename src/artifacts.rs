//! The shared artifact directory and recognition of artifact paths in
//! agent output.
//!
//! Every worker writes collected data and charts under one directory. The
//! location is only a convention communicated through instructions, so the
//! controller finds artifacts by scanning worker answers for file paths.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// What an artifact file holds, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Data,
    Image,
}

const DATA_EXTENSIONS: &[&str] = &["json", "jsonl", "csv", "tsv", "xlsx", "parquet"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "svg", "gif", "webp"];

impl ArtifactKind {
    pub fn of(path: &str) -> Option<Self> {
        let ext = Path::new(path)
            .extension()?
            .to_str()?
            .to_ascii_lowercase();
        if DATA_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Data)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else {
            None
        }
    }
}

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // The extension must not run on into ASCII word characters. Any other
        // character may follow, including Hangul particles such as `에`.
        Regex::new(r"(?i)((?:[A-Za-z]:)?[\w~./\\-]*[\w-]\.(?:jsonl|json|csv|tsv|xlsx|parquet|png|jpe?g|svg|gif|webp))(?:[^A-Za-z0-9_]|$)")
            .expect("valid regex")
    })
}

/// File paths of the given kind mentioned in `text`, in order of first
/// appearance, without duplicates. Relative paths are resolved against
/// `artifact_dir`; URLs are ignored.
pub fn find_paths(text: &str, kind: ArtifactKind, artifact_dir: &Path) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in path_pattern().captures_iter(text) {
        let Some(m) = caps.get(1) else {
            continue;
        };
        // Skip the path part of URLs like https://host/data.csv
        let word_start = text[..m.start()]
            .rfind(char::is_whitespace)
            .map_or(0, |i| i + text[i..].chars().next().map_or(1, char::len_utf8));
        if text[word_start..m.end()].contains("://") {
            continue;
        }
        let raw = m.as_str();
        if ArtifactKind::of(raw) != Some(kind) {
            continue;
        }
        let resolved = resolve(raw, artifact_dir);
        if !found.contains(&resolved) {
            found.push(resolved);
        }
    }
    found
}

fn resolve(raw: &str, artifact_dir: &Path) -> String {
    let path = Path::new(raw);
    if path.is_absolute() || raw.starts_with('~') {
        return raw.to_string();
    }
    let trimmed = raw.trim_start_matches("./");
    // A bare file name or a path that already names the artifact dir.
    let dir_name = artifact_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let relative = match trimmed.split_once('/') {
        Some((first, rest)) if !dir_name.is_empty() && first == dir_name => rest,
        _ => trimmed,
    };
    artifact_dir.join(relative).to_string_lossy().to_string()
}

/// Create the artifact directory if needed and return its absolute path.
pub fn ensure_dir(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    dir.canonicalize()
}
