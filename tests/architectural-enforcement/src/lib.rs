//! Architectural Enforcement Integration Tests
//!
//! This package contains tests that enforce architectural principles over the
//! switchboard sources:
//! - No blocking `std::thread::sleep` in production code
//! - No `unwrap()` / `expect()` outside test modules
//! - Window usage is only mutated inside the window governor
//!
//! These tests are designed to catch violations early in the development cycle.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// One rule violation
#[derive(Debug)]
pub struct Violation {
    pub file: PathBuf,
    pub line: usize,
    pub text: String,
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Rust sources of the production crates
pub fn production_sources() -> Vec<PathBuf> {
    let root = workspace_root();
    ["switchboard/core/src", "switchboard/daemon/src"]
        .iter()
        .flat_map(|dir| WalkDir::new(root.join(dir)).into_iter().filter_map(Result::ok))
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.into_path())
        .collect()
}

/// Lines before the first `#[cfg(test)]`, skipping comments
///
/// Test modules sit at the bottom of each file, so everything above the
/// first test attribute is production code.
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let Ok(source) = fs::read_to_string(path) else {
        return Vec::new();
    };
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line.to_string()))
        .collect()
}

/// Scan production code for lines matching `predicate`
pub fn scan<F>(files: &[PathBuf], predicate: F) -> Vec<Violation>
where
    F: Fn(&Path, &str) -> bool,
{
    let mut violations = Vec::new();
    for file in files {
        for (line, text) in production_lines(file) {
            if predicate(file, &text) {
                violations.push(Violation {
                    file: file.clone(),
                    line,
                    text: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

fn report(rule: &str, violations: &[Violation]) -> String {
    let mut out = format!("{rule}: {} violation(s)\n", violations.len());
    for v in violations {
        out.push_str(&format!("  {}:{}: {}\n", v.file.display(), v.line, v.text));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_found() {
        let files = production_sources();
        assert!(
            files.iter().any(|f| f.ends_with("engine/mod.rs")),
            "engine sources not found under {}",
            workspace_root().display()
        );
    }

    #[test]
    fn test_no_blocking_sleep() {
        let violations = scan(&production_sources(), |_, line| line.contains("thread::sleep"));
        assert!(violations.is_empty(), "{}", report("blocking sleep", &violations));
    }

    #[test]
    fn test_no_unwrap_outside_tests() {
        let violations = scan(&production_sources(), |_, line| {
            line.contains(".unwrap()") || line.contains(".expect(")
        });
        assert!(violations.is_empty(), "{}", report("unwrap/expect", &violations));
    }

    #[test]
    fn test_window_usage_mutated_only_by_governor() {
        let fields = ["usage.in_flight", "usage.tokens_used", "usage.usd_used"];
        let violations = scan(&production_sources(), |path, line| {
            let in_window = path.components().any(|c| c.as_os_str() == "window");
            !in_window
                && fields.iter().any(|field| {
                    line.split(field)
                        .nth(1)
                        .is_some_and(|rest| {
                            let rest = rest.trim_start();
                            (rest.starts_with('=') && !rest.starts_with("=="))
                                || rest.starts_with("+=")
                                || rest.starts_with("-=")
                        })
                })
        });
        assert!(violations.is_empty(), "{}", report("window mutation", &violations));
    }
}
