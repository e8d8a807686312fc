//! The WebAssembly backend.
//!
//! Pipeline: the code generator lowers a typed AST into the IR module, the
//! peephole pass (when enabled) rewrites function bodies, and the serializer
//! prints WAT text in the configured writing style. `validator` closes the
//! loop by assembling and validating the text.

pub mod codegen;
pub mod host_functions;
pub mod instructions;
pub mod optimizer;
pub mod static_memory;
pub mod validator;
pub mod wasm_module;
pub mod wat_emitter;

use crate::compiler::ast_nodes::TypedExpr;
use crate::compiler::compiler_errors::CompileError;
use crate::compiler::config::CompilerConfig;

/// Compile a typed program all the way to WAT text.
pub fn compile_to_wat(ast: &TypedExpr, config: &CompilerConfig) -> Result<String, CompileError> {
    let mut module = codegen::compile_module(ast, config)?;
    if config.peephole {
        optimizer::optimize_module(&mut module);
    }
    Ok(wat_emitter::emit_wat(&module, config.style))
}
