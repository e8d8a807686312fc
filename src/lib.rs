//! WebAssembly backend for the Hygge language.
//!
//! The frontend (lexer, parser, type checker) and the driver live elsewhere;
//! this crate takes a fully typed AST and produces a textual WebAssembly
//! module: closure conversion through a function table, a static layout for
//! compile-time-known data, inline runtime checks that exit with the
//! sentinel code 42, an optional peephole pass, and a WAT serializer with
//! linear and folded writing styles.

pub mod backends;
pub mod compiler;
pub mod file_output;

pub use backends::wasm::codegen::compile_module;
pub use backends::wasm::compile_to_wat;
pub use backends::wasm::optimizer::optimize_module;
pub use backends::wasm::validator::{assemble_wat, validate_module};
pub use backends::wasm::wat_emitter::emit_wat;
pub use compiler::compiler_errors::{CompileError, ErrorType};
pub use compiler::config::{AllocationStrategy, CompilerConfig, SyscallInterface, WritingStyle};
