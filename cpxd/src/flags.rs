//! Compiler invocation classification.
//!
//! The full flag grammar belongs to the parser collaborators; the engine
//! only needs the classification and the extracted paths. The gcc-style
//! parser here covers the common driver surface (`-c`, `-o`, `-E`, `-I`,
//! `-include`, positional sources and objects) which is enough to route
//! real-world compile and link lines.

use cpx_common::errors::TaskError;
use std::path::{Path, PathBuf};

/// What kind of work the command line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationKind {
    /// Source → object; the remote-friendly case.
    Compile,
    /// Produces preprocessed output; cheap enough to run locally.
    Preprocess,
    /// Links objects; remote-eligible via the linker-input scanner.
    Link,
    /// Anything the proxy should not attempt remotely.
    Unsupported(String),
}

/// Extracted view of one invocation.
#[derive(Debug, Clone)]
pub struct ParsedFlags {
    pub kind: InvocationKind,
    /// The source file driving a compile, if there is exactly one.
    pub primary_source: Option<PathBuf>,
    /// All positional input files (sources for compiles, objects for links).
    pub input_files: Vec<PathBuf>,
    /// Files force-included with `-include`.
    pub extra_inputs: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub output_paths: Vec<PathBuf>,
}

/// Classifies argv and extracts inputs.
pub trait FlagsParser: Send + Sync {
    fn parse(&self, argv: &[String], cwd: &Path) -> Result<ParsedFlags, TaskError>;
}

/// Driver-style parser for gcc/clang command lines.
pub struct GccStyleFlags;

const SOURCE_EXTS: &[&str] = &["c", "cc", "cpp", "cxx", "c++", "m", "mm", "s", "S"];
const OBJECT_EXTS: &[&str] = &["o", "obj", "a", "lo"];

fn has_ext(path: &Path, exts: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| exts.contains(&e))
        .unwrap_or(false)
}

fn absolutize(cwd: &Path, p: &str) -> PathBuf {
    let path = PathBuf::from(p);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

impl FlagsParser for GccStyleFlags {
    fn parse(&self, argv: &[String], cwd: &Path) -> Result<ParsedFlags, TaskError> {
        if argv.is_empty() {
            return Err(TaskError::CompilerNotFound("empty argv".to_string()));
        }

        let mut compile_only = false;
        let mut preprocess = false;
        let mut sources = Vec::new();
        let mut objects = Vec::new();
        let mut extra_inputs = Vec::new();
        let mut include_dirs = Vec::new();
        let mut outputs = Vec::new();

        let mut iter = argv.iter().skip(1).peekable();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-c" => compile_only = true,
                "-E" => preprocess = true,
                "-S" => {
                    return Ok(ParsedFlags {
                        kind: InvocationKind::Unsupported("assembly output (-S)".to_string()),
                        primary_source: None,
                        input_files: vec![],
                        extra_inputs: vec![],
                        include_dirs: vec![],
                        output_paths: vec![],
                    });
                }
                "-o" => {
                    if let Some(out) = iter.next() {
                        outputs.push(absolutize(cwd, out));
                    }
                }
                "-I" => {
                    if let Some(dir) = iter.next() {
                        include_dirs.push(absolutize(cwd, dir));
                    }
                }
                "-include" => {
                    if let Some(file) = iter.next() {
                        extra_inputs.push(absolutize(cwd, file));
                    }
                }
                "-MF" | "-MT" | "-MQ" => {
                    // Dep-file bookkeeping; the value is not a compile input.
                    iter.next();
                }
                _ => {
                    if let Some(dir) = arg.strip_prefix("-I") {
                        include_dirs.push(absolutize(cwd, dir));
                    } else if let Some(out) = arg.strip_prefix("-o") {
                        if !out.is_empty() {
                            outputs.push(absolutize(cwd, out));
                        }
                    } else if arg.starts_with('-') {
                        // Flag we don't model; harmless for classification.
                    } else {
                        let path = absolutize(cwd, arg);
                        if has_ext(&path, SOURCE_EXTS) {
                            sources.push(path);
                        } else if has_ext(&path, OBJECT_EXTS) {
                            objects.push(path);
                        }
                    }
                }
            }
        }

        if preprocess {
            return Ok(ParsedFlags {
                kind: InvocationKind::Preprocess,
                primary_source: sources.first().cloned(),
                input_files: sources,
                extra_inputs,
                include_dirs,
                output_paths: outputs,
            });
        }

        if compile_only {
            if sources.is_empty() {
                return Ok(ParsedFlags {
                    kind: InvocationKind::Unsupported("-c with no source file".to_string()),
                    primary_source: None,
                    input_files: vec![],
                    extra_inputs,
                    include_dirs,
                    output_paths: outputs,
                });
            }
            // Default output: source stem with .o, in cwd.
            if outputs.is_empty() {
                if let Some(src) = sources.first() {
                    let stem = src.file_stem().unwrap_or_default();
                    outputs.push(cwd.join(format!("{}.o", stem.to_string_lossy())));
                }
            }
            let primary = sources.first().cloned();
            return Ok(ParsedFlags {
                kind: InvocationKind::Compile,
                primary_source: primary,
                input_files: sources,
                extra_inputs,
                include_dirs,
                output_paths: outputs,
            });
        }

        if !objects.is_empty() || (!sources.is_empty() && !outputs.is_empty()) {
            let mut inputs = objects;
            inputs.extend(sources);
            if outputs.is_empty() {
                outputs.push(cwd.join("a.out"));
            }
            return Ok(ParsedFlags {
                kind: InvocationKind::Link,
                primary_source: None,
                input_files: inputs,
                extra_inputs,
                include_dirs,
                output_paths: outputs,
            });
        }

        Ok(ParsedFlags {
            kind: InvocationKind::Unsupported("no recognisable inputs".to_string()),
            primary_source: None,
            input_files: vec![],
            extra_inputs,
            include_dirs,
            output_paths: outputs,
        })
    }
}
