//! Architectural Enforcement
//!
//! Source scanners shared by the integration tests in `tests/`. They walk the
//! gateway's production code and report rule violations as
//! `path:line - code` strings.
//!
//! Production code means every `.rs` file under `gateway/core/src` except the
//! crate-internal test utilities, cut off at the first `#[cfg(test)]`
//! attribute (test modules live at the bottom of each file).

use std::fs;
use std::path::{Path, PathBuf};

/// File name of the crate-internal test helpers
const TEST_UTILS_FILE: &str = "test_utils.rs";

/// Gateway library sources, relative to the workspace root
pub const GATEWAY_SRC: &str = "gateway/core/src";

/// One production source file
#[derive(Debug)]
pub struct SourceFile {
    /// Location on disk
    pub path: PathBuf,
    /// Lines before the test module
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Parse file contents, dropping everything from `#[cfg(test)]` on
    #[must_use]
    pub fn from_content(path: PathBuf, content: &str) -> Self {
        let lines = content
            .lines()
            .take_while(|line| line.trim() != "#[cfg(test)]")
            .map(str::to_string)
            .collect();
        Self { path, lines }
    }

    /// Format a violation at the zero-based line `idx`
    #[must_use]
    pub fn violation(&self, idx: usize) -> String {
        format!(
            "{}:{} - {}",
            self.path.display(),
            idx + 1,
            self.lines[idx].trim()
        )
    }
}

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// All production sources under `dir` (relative to the workspace root)
#[must_use]
pub fn production_sources(dir: &str) -> Vec<SourceFile> {
    let root = workspace_root().join(dir);
    if !root.exists() {
        return Vec::new();
    }

    let mut files: Vec<SourceFile> = walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter(|e| e.file_name() != TEST_UTILS_FILE)
        .filter_map(|e| {
            let content = fs::read_to_string(e.path()).ok()?;
            Some(SourceFile::from_content(e.path().to_path_buf(), &content))
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

/// The part of a line before any `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether the function enclosing line `idx` is `async`
///
/// Scans backwards for the nearest function signature. Lines outside any
/// function count as not async.
#[must_use]
pub fn in_async_fn(lines: &[String], idx: usize) -> bool {
    for line in lines[..=idx].iter().rev() {
        let code = code_part(line).trim_start();
        let signature = code
            .trim_start_matches("pub(crate) ")
            .trim_start_matches("pub ");
        if signature.starts_with("async fn ") {
            return true;
        }
        if signature.starts_with("fn ") || signature.starts_with("const fn ") {
            return false;
        }
    }
    false
}

/// Lines in production code matching `predicate`
pub fn find_violations<F>(dir: &str, predicate: F) -> Vec<String>
where
    F: Fn(&SourceFile, usize, &str) -> bool,
{
    let mut violations = Vec::new();
    for file in production_sources(dir) {
        for (idx, line) in file.lines.iter().enumerate() {
            if predicate(&file, idx, code_part(line)) {
                violations.push(file.violation(idx));
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(code: &[&str]) -> Vec<String> {
        code.iter().map(|l| (*l).to_string()).collect()
    }

    #[test]
    fn test_test_module_is_cut_off() {
        let file = SourceFile::from_content(
            PathBuf::from("x.rs"),
            "fn a() {}\n\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n",
        );
        assert_eq!(file.lines.len(), 2);
    }

    #[test]
    fn test_comments_are_ignored() {
        assert_eq!(code_part("let a = b; // c.unwrap()"), "let a = b; ");
        assert_eq!(code_part("/// docs"), "");
    }

    #[test]
    fn test_async_detection() {
        let code = lines(&[
            "pub async fn generate(&self) {",
            "    let x = std::fs::read(path);",
            "}",
            "fn load() {",
            "    let y = std::fs::read(path);",
            "}",
        ]);
        assert!(in_async_fn(&code, 1));
        assert!(!in_async_fn(&code, 4));
    }

    #[test]
    fn test_gateway_sources_found() {
        let files = production_sources(GATEWAY_SRC);
        assert!(files.iter().any(|f| f.path.ends_with("router.rs")));
        assert!(!files.iter().any(|f| f.path.ends_with(TEST_UTILS_FILE)));
    }
}
