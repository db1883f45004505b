pub mod ast;
pub mod backend;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod preprocessor;
pub mod program;
pub mod token;
pub mod vm;

use std::path::Path;

use anyhow::Result;

use crate::compiler::CompiledProgram;

/// Front end in one call: lex, parse, and lower a source string. The
/// result still needs [`CompiledProgram::validate`] before execution.
pub fn compile_source(source: &str) -> Result<CompiledProgram> {
    let tokens = lexer::tokenize(source)?;
    let tree = parser::parse_tokens(tokens)?;
    Ok(compiler::compile(&tree)?)
}

/// Loads a macro file from disk, expanding `%IMPORT` directives first.
pub fn compile_file(path: &Path) -> Result<CompiledProgram> {
    let source = preprocessor::preprocess(path)?;
    compile_source(&source)
}
