//! Input-closure computation.
//!
//! The engine needs the set of files a compile will read so it can stage
//! them remotely. The lexical scanner here follows `#include` lines
//! breadth-first through the project's include directories; it is not a
//! preprocessor (conditional includes are followed unconditionally, which
//! over-approximates, and a superset of inputs is always safe to stage).
//! System headers resolve on the remote side from the toolchain image, so
//! only project-relative and `-I` includes are chased.

use async_trait::async_trait;
use cpx_common::errors::TaskError;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

/// Computes the full input set for a compile or link.
#[async_trait]
pub trait IncludeScanner: Send + Sync {
    async fn scan(
        &self,
        primary_source: &Path,
        extra_inputs: &[PathBuf],
        include_dirs: &[PathBuf],
        cwd: &Path,
    ) -> Result<Vec<PathBuf>, TaskError>;
}

/// Breadth-first `#include` chaser.
pub struct LexicalIncludeScanner {
    /// Hard cap on files visited, against include cycles and pathological
    /// trees.
    max_files: usize,
}

impl LexicalIncludeScanner {
    pub fn new() -> Self {
        Self { max_files: 16_384 }
    }
}

impl Default for LexicalIncludeScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// One `#include` directive.
#[derive(Debug, PartialEq, Eq)]
enum IncludeRef {
    /// `#include "x.h"`, resolved relative to the includer first.
    Quoted(String),
    /// `#include <x.h>`, resolved against include dirs only.
    Angled(String),
}

fn parse_include_line(line: &str) -> Option<IncludeRef> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix("include")?.trim_start();
    if let Some(inner) = rest.strip_prefix('"') {
        let end = inner.find('"')?;
        return Some(IncludeRef::Quoted(inner[..end].to_string()));
    }
    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        return Some(IncludeRef::Angled(inner[..end].to_string()));
    }
    None
}

#[async_trait]
impl IncludeScanner for LexicalIncludeScanner {
    async fn scan(
        &self,
        primary_source: &Path,
        extra_inputs: &[PathBuf],
        include_dirs: &[PathBuf],
        cwd: &Path,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut queue: VecDeque<PathBuf> = VecDeque::new();

        let root = if primary_source.is_absolute() {
            primary_source.to_path_buf()
        } else {
            cwd.join(primary_source)
        };
        if !root.exists() {
            return Err(TaskError::IncludeScan(format!(
                "source not found: {}",
                root.display()
            )));
        }
        queue.push_back(root);
        for extra in extra_inputs {
            queue.push_back(extra.clone());
        }

        let mut inputs = Vec::new();
        while let Some(path) = queue.pop_front() {
            let canonical = path.canonicalize().unwrap_or(path.clone());
            if !seen.insert(canonical.clone()) {
                continue;
            }
            if seen.len() > self.max_files {
                return Err(TaskError::IncludeScan(format!(
                    "include closure exceeds {} files",
                    self.max_files
                )));
            }

            let content = match tokio::fs::read_to_string(&canonical).await {
                Ok(c) => c,
                Err(e) if path.extension().is_some_and(|x| x == "h" || x == "hpp") => {
                    return Err(TaskError::IncludeScan(format!(
                        "read {}: {e}",
                        canonical.display()
                    )));
                }
                Err(_) => {
                    // Binary or unreadable non-header input; stage as-is.
                    inputs.push(canonical);
                    continue;
                }
            };
            inputs.push(canonical.clone());

            let includer_dir = canonical.parent().map(Path::to_path_buf);
            for line in content.lines() {
                let Some(include) = parse_include_line(line) else {
                    continue;
                };
                let (name, search_includer_first) = match include {
                    IncludeRef::Quoted(n) => (n, true),
                    IncludeRef::Angled(n) => (n, false),
                };

                let mut resolved = None;
                if search_includer_first {
                    if let Some(dir) = &includer_dir {
                        let candidate = dir.join(&name);
                        if candidate.exists() {
                            resolved = Some(candidate);
                        }
                    }
                }
                if resolved.is_none() {
                    for dir in include_dirs {
                        let candidate = dir.join(&name);
                        if candidate.exists() {
                            resolved = Some(candidate);
                            break;
                        }
                    }
                }
                // Unresolved includes are assumed to be system headers,
                // which the remote toolchain provides.
                if let Some(found) = resolved {
                    queue.push_back(found);
                }
            }
        }

        Ok(inputs)
    }
}

/// Input scanner for link invocations: the inputs are the named objects
/// and archives themselves; nothing to chase.
pub struct LinkInputScanner;

#[async_trait]
impl IncludeScanner for LinkInputScanner {
    async fn scan(
        &self,
        primary_source: &Path,
        extra_inputs: &[PathBuf],
        _include_dirs: &[PathBuf],
        cwd: &Path,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let mut inputs = Vec::new();
        let mut push = |p: &Path| {
            let abs = if p.is_absolute() {
                p.to_path_buf()
            } else {
                cwd.join(p)
            };
            if abs.exists() {
                inputs.push(abs);
                Ok(())
            } else {
                Err(TaskError::IncludeScan(format!(
                    "link input not found: {}",
                    abs.display()
                )))
            }
        };
        push(primary_source)?;
        for extra in extra_inputs {
            push(extra)?;
        }
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_include_line_forms() {
        assert_eq!(
            parse_include_line("#include \"a.h\""),
            Some(IncludeRef::Quoted("a.h".to_string()))
        );
        assert_eq!(
            parse_include_line("  #  include  <vector>"),
            Some(IncludeRef::Angled("vector".to_string()))
        );
        assert_eq!(parse_include_line("int x = 1; // #include \"no\""), None);
        assert_eq!(parse_include_line("#define FOO"), None);
    }

    #[tokio::test]
    async fn test_scan_follows_quoted_includes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.c");
        let header = dir.path().join("util.h");
        let nested = dir.path().join("deep.h");
        std::fs::write(&src, "#include \"util.h\"\nint main() {}\n").unwrap();
        std::fs::write(&header, "#include \"deep.h\"\n").unwrap();
        std::fs::write(&nested, "int deep;\n").unwrap();

        let scanner = LexicalIncludeScanner::new();
        let inputs = scanner
            .scan(&src, &[], &[], dir.path())
            .await
            .unwrap();
        assert_eq!(inputs.len(), 3);
    }

    #[tokio::test]
    async fn test_scan_resolves_angled_via_include_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let inc = dir.path().join("include");
        std::fs::create_dir(&inc).unwrap();
        let src = dir.path().join("a.c");
        std::fs::write(&src, "#include <proj.h>\n").unwrap();
        std::fs::write(inc.join("proj.h"), "int p;\n").unwrap();

        let scanner = LexicalIncludeScanner::new();
        let inputs = scanner
            .scan(&src, &[], &[inc.clone()], dir.path())
            .await
            .unwrap();
        assert_eq!(inputs.len(), 2);
        assert!(inputs.iter().any(|p| p.ends_with("proj.h")));
    }

    #[tokio::test]
    async fn test_unresolved_system_header_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.c");
        std::fs::write(&src, "#include <stdio.h>\nint main() {}\n").unwrap();

        let scanner = LexicalIncludeScanner::new();
        let inputs = scanner.scan(&src, &[], &[], dir.path()).await.unwrap();
        // Only the source itself; stdio.h comes from the remote toolchain.
        assert_eq!(inputs.len(), 1);
    }

    #[tokio::test]
    async fn test_include_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.h");
        let b = dir.path().join("b.h");
        std::fs::write(&a, "#include \"b.h\"\n").unwrap();
        std::fs::write(&b, "#include \"a.h\"\n").unwrap();
        let src = dir.path().join("main.c");
        std::fs::write(&src, "#include \"a.h\"\n").unwrap();

        let scanner = LexicalIncludeScanner::new();
        let inputs = scanner.scan(&src, &[], &[], dir.path()).await.unwrap();
        assert_eq!(inputs.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_source_is_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = LexicalIncludeScanner::new();
        let err = scanner
            .scan(Path::new("ghost.c"), &[], &[], dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::IncludeScan(_)));
    }

    #[tokio::test]
    async fn test_link_scanner_requires_existing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("a.o");
        std::fs::write(&obj, b"\x7fELFfake").unwrap();

        let inputs = LinkInputScanner
            .scan(&obj, &[], &[], dir.path())
            .await
            .unwrap();
        assert_eq!(inputs.len(), 1);

        let err = LinkInputScanner
            .scan(Path::new("missing.o"), &[], &[], dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::IncludeScan(_)));
    }
}
