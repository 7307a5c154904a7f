//! File tools confined to the artifact directory: find, grep, read.

use std::path::Path;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{resolve_in_root, Tool, ToolContext};

/// Files above this size are skipped by search and refused by read.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

const MAX_RESULTS: usize = 100;

/// A compiled file glob. A pattern without a directory part matches file
/// names at any depth.
struct PathGlob {
    matcher: GlobMatcher,
    has_dir: bool,
}

impl PathGlob {
    fn new(pattern: &str) -> anyhow::Result<Self> {
        let pattern = pattern.trim().trim_start_matches("./");
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid glob '{}': {}", pattern, e))?
            .compile_matcher();
        Ok(Self {
            matcher,
            has_dir: pattern.contains('/'),
        })
    }

    fn matches(&self, relative: &str) -> bool {
        if self.has_dir {
            self.matcher.is_match(relative)
        } else {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            self.matcher.is_match(name)
        }
    }
}

/// Regular files under `root` (hidden entries excluded), as
/// `(relative path, absolute path, size)`.
fn walk_files(root: &Path) -> impl Iterator<Item = (String, std::path::PathBuf, u64)> + '_ {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(move |e| {
            let size = e.metadata().ok()?.len();
            let relative = e
                .path()
                .strip_prefix(root)
                .ok()?
                .to_string_lossy()
                .replace('\\', "/");
            Some((relative, e.path().to_path_buf(), size))
        })
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Find files by glob.
pub struct FileSearch;

#[async_trait]
impl Tool for FileSearch {
    fn name(&self) -> &str {
        "file_search"
    }

    fn description(&self) -> &str {
        "Find files in the artifact directory by glob pattern (e.g. '*.csv', 'data/**/*.json'). Returns relative paths with sizes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern. Without a '/', matches file names at any depth."
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let pattern = args["pattern"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'pattern' argument"))?;
        let glob = PathGlob::new(pattern)?;
        let root = ctx.artifact_dir.clone();

        let matches = tokio::task::spawn_blocking(move || {
            let mut found: Vec<(String, u64)> = walk_files(&root)
                .filter(|(rel, _, _)| glob.matches(rel))
                .map(|(rel, _, size)| (rel, size))
                .collect();
            found.sort();
            found
        })
        .await?;

        if matches.is_empty() {
            return Ok(format!("No files matching '{}' in the artifact directory", pattern));
        }

        let total = matches.len();
        let mut lines: Vec<String> = matches
            .into_iter()
            .take(MAX_RESULTS)
            .map(|(rel, size)| format!("{} ({})", rel, format_size(size)))
            .collect();
        if total > MAX_RESULTS {
            lines.push(format!("... {} more", total - MAX_RESULTS));
        }
        Ok(lines.join("\n"))
    }
}

/// Search file contents by regex.
pub struct GrepSearch;

#[async_trait]
impl Tool for GrepSearch {
    fn name(&self) -> &str {
        "grep_search"
    }

    fn description(&self) -> &str {
        "Search file contents in the artifact directory with a regular expression. Returns 'path:line: text' matches. Files over 10 MB are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for."
                },
                "include": {
                    "type": "string",
                    "description": "Optional: glob limiting which files are searched (e.g. '*.py')."
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let pattern = args["pattern"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'pattern' argument"))?;
        let re = Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
        let include = args["include"].as_str().map(PathGlob::new).transpose()?;
        let root = ctx.artifact_dir.clone();

        let (matches, skipped) = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            let mut skipped = 0usize;
            for (rel, path, size) in walk_files(&root) {
                if let Some(glob) = &include {
                    if !glob.matches(&rel) {
                        continue;
                    }
                }
                if size > MAX_FILE_BYTES {
                    skipped += 1;
                    continue;
                }
                // Binary or non-UTF-8 files are not searchable.
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                for (i, line) in content.lines().enumerate() {
                    if re.is_match(line) {
                        matches.push(format!("{}:{}: {}", rel, i + 1, line.trim_end()));
                        if matches.len() >= MAX_RESULTS {
                            return (matches, skipped);
                        }
                    }
                }
            }
            (matches, skipped)
        })
        .await?;

        let mut result = if matches.is_empty() {
            format!("No matches for '{}'", pattern)
        } else {
            matches.join("\n")
        };
        if skipped > 0 {
            result.push_str(&format!("\n({} files over 10 MB skipped)", skipped));
        }
        Ok(result)
    }
}

/// Read a file with line numbers.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the artifact directory. Returns the content with line numbers."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the artifact directory (absolute paths must lie inside it)."
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: start reading from this line number (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: stop reading at this line number (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;

        let full_path = resolve_in_root(path, &ctx.artifact_dir)?;
        let metadata = tokio::fs::metadata(&full_path)
            .await
            .map_err(|_| anyhow::anyhow!("File not found: {}", path))?;
        if metadata.len() > MAX_FILE_BYTES {
            return Err(anyhow::anyhow!(
                "File is {} which exceeds the 10 MB read limit; use grep_search or code to inspect it",
                format_size(metadata.len())
            ));
        }

        let content = tokio::fs::read_to_string(&full_path).await?;
        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        let start_line = args["start_line"].as_u64().map(|n| n as usize);
        let end_line = args["end_line"].as_u64().map(|n| n as usize);

        let start = start_line.unwrap_or(1).saturating_sub(1).min(total_lines);
        let end = end_line.unwrap_or(total_lines).min(total_lines);
        let (start, end) = if start > end { (end, start) } else { (start, end) };

        if start_line.is_some() && start >= total_lines {
            return Ok(format!(
                "File has {} lines, requested start line {} is beyond end of file",
                total_lines,
                start + 1
            ));
        }

        let numbered: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
            .collect();

        Ok(numbered.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::ThreadId;

    fn fixture() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/raw")).unwrap();
        std::fs::create_dir_all(dir.path().join(".scripts")).unwrap();
        std::fs::write(dir.path().join("data/population.csv"), "country,pop\nChina,1400\nIndia,1420\n").unwrap();
        std::fs::write(dir.path().join("data/raw/page.json"), "{\"country\": \"India\"}").unwrap();
        std::fs::write(dir.path().join("scraper.py"), "import requests\nprint('India')\n").unwrap();
        std::fs::write(dir.path().join(".scripts/old.py"), "print('India')").unwrap();
        let ctx = ToolContext::new(dir.path(), ThreadId::new("t"));
        (dir, ctx)
    }

    #[test]
    fn test_glob_matching() {
        let glob = PathGlob::new("data/**/*.json").unwrap();
        assert!(glob.matches("data/raw/page.json"));
        assert!(glob.matches("data/page.json"));
        assert!(!glob.matches("other/page.json"));
        assert!(PathGlob::new("*.c?v").unwrap().matches("rows.csv"));

        let alternatives = PathGlob::new("*.{csv,json}").unwrap();
        assert!(alternatives.matches("data/population.csv"));
        assert!(alternatives.matches("data/raw/page.json"));
        assert!(!alternatives.matches("scraper.py"));
        assert!(PathGlob::new("[!s]*.py").unwrap().matches("run.py"));
        assert!(!PathGlob::new("[!s]*.py").unwrap().matches("scraper.py"));
        assert!(PathGlob::new("data/[").is_err());
    }

    #[tokio::test]
    async fn test_file_search_with_alternatives() {
        let (_dir, ctx) = fixture();
        let out = FileSearch
            .execute(json!({"pattern": "*.{csv,json}"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.lines().count(), 2, "{}", out);
    }

    #[tokio::test]
    async fn test_file_search() {
        let (_dir, ctx) = fixture();
        let out = FileSearch.execute(json!({"pattern": "*.csv"}), &ctx).await.unwrap();
        assert!(out.starts_with("data/population.csv ("));

        let out = FileSearch.execute(json!({"pattern": "*.py"}), &ctx).await.unwrap();
        assert_eq!(out.lines().count(), 1, "hidden dirs are skipped: {}", out);

        let out = FileSearch.execute(json!({"pattern": "*.xlsx"}), &ctx).await.unwrap();
        assert!(out.starts_with("No files matching"));
    }

    #[tokio::test]
    async fn test_grep_search_with_include() {
        let (_dir, ctx) = fixture();
        let out = GrepSearch
            .execute(json!({"pattern": "India", "include": "*.csv"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "data/population.csv:3: India,1420");

        let all = GrepSearch.execute(json!({"pattern": "India"}), &ctx).await.unwrap();
        assert_eq!(all.lines().count(), 3);

        assert!(GrepSearch.execute(json!({"pattern": "("}), &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_read_file_range_and_confinement() {
        let (_dir, ctx) = fixture();
        let out = ReadFile
            .execute(json!({"path": "data/population.csv", "start_line": 2, "end_line": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "   2| China,1400");

        assert!(ReadFile.execute(json!({"path": "../outside.txt"}), &ctx).await.is_err());
        assert!(ReadFile.execute(json!({"path": "missing.csv"}), &ctx).await.is_err());
    }
}
