//! `%IMPORT` expansion, run before the lexer ever sees the source.
//!
//! An import line is replaced by the imported file's full contents,
//! recursively. Relative import paths are resolved against the directory
//! of the file given to [`preprocess`], so a macro file and its helpers
//! travel as one directory.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Invalid import statement: '{0}'")]
    InvalidImport(String),

    #[error("Circular import of '{}'", .0.display())]
    CircularImport(PathBuf),

    #[error("Cannot read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub fn preprocess(path: &Path) -> Result<String, PreprocessError> {
    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let mut active = Vec::new();
    expand(path, &base_dir, &mut active)
}

fn expand(
    path: &Path,
    base_dir: &Path,
    active: &mut Vec<PathBuf>,
) -> Result<String, PreprocessError> {
    let identity = path
        .canonicalize()
        .map_err(|source| PreprocessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if active.contains(&identity) {
        return Err(PreprocessError::CircularImport(path.to_path_buf()));
    }
    active.push(identity);

    let text = fs::read_to_string(path).map_err(|source| PreprocessError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut output = String::with_capacity(text.len());
    for line in text.lines() {
        if line.starts_with("%IMPORT") {
            let target = import_target(line)?;
            let target = if target.is_absolute() {
                target
            } else {
                base_dir.join(target)
            };
            output.push_str(&expand(&target, base_dir, active)?);
        } else {
            output.push_str(line);
            output.push('\n');
        }
    }

    active.pop();
    Ok(output)
}

fn import_target(line: &str) -> Result<PathBuf, PreprocessError> {
    match line.split_whitespace().nth(1) {
        Some(name) => Ok(PathBuf::from(name)),
        None => Err(PreprocessError::InvalidImport(line.to_string())),
    }
}
