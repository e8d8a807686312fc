//! # Compiler Error Handling
//!
//! Unified error type for the Wasm lowering backend. All failure categories
//! are consolidated here with structured metadata so that a driver (CLI, LSP,
//! test harness) can render or analyze them without re-parsing messages.
//!
//! Every compile-time error raised by this crate is fatal: the backend never
//! attempts recovery. Runtime violations are *not* errors at this level; they
//! are compiled into the produced module as the sentinel exit code 42.
//!
//! The error kinds are:
//! - **InvalidAst**: an AST variant the backend considers a design-time
//!   impossibility (e.g. `pointer` expressions surviving the type checker)
//! - **UnresolvedIdentifier**: a variable reference with no storage entry,
//!   indicating a bug in typing or prior lowering
//! - **StorageKindMismatch**: a variable's stored kind is inconsistent with
//!   the way it is being used
//! - **DuplicateSymbol** / **ConflictingImport**: module-level invariant
//!   violations while building or merging IR
//! - **InvalidSize**: non-positive static allocation request
//! - **WasmValidation**: the emitted text failed to assemble or validate
//! - **File**: file system errors while writing output

use crate::compiler::ast_nodes::{CharPosition, TextLocation};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// The final set of errors emitted from a lowering run.
#[derive(Debug)]
pub struct CompilerMessages {
    pub errors: Vec<CompileError>,
}

impl CompilerMessages {
    pub fn new() -> Self {
        CompilerMessages { errors: Vec::new() }
    }
}

impl Default for CompilerMessages {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Eq, Hash, PartialEq, Clone)]
pub enum ErrorMetaDataKey {
    VariableName,
    FunctionLabel,
    CompilationStage,

    // Optional suggestions
    PrimarySuggestion,
    AlternativeSuggestion,

    // Storage / type information
    ExpectedStorage,
    FoundStorage,
    ExpectedType,
    FoundType,
    ImportKey,
}

// A completely owned location so errors can travel up
// without dragging the source text along
#[derive(Debug, Clone)]
pub struct ErrorLocation {
    pub scope: PathBuf,
    pub start_pos: CharPosition,
    pub end_pos: CharPosition,
}

impl ErrorLocation {
    pub fn new(path_buf: PathBuf, start: CharPosition, end: CharPosition) -> ErrorLocation {
        ErrorLocation {
            scope: path_buf,
            start_pos: start,
            end_pos: end,
        }
    }

    pub fn default() -> ErrorLocation {
        ErrorLocation {
            scope: PathBuf::new(),
            start_pos: CharPosition::default(),
            end_pos: CharPosition::default(),
        }
    }
}

impl From<&TextLocation> for ErrorLocation {
    fn from(location: &TextLocation) -> Self {
        ErrorLocation {
            scope: PathBuf::new(),
            start_pos: location.start,
            end_pos: location.end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileError {
    pub msg: String,
    pub location: ErrorLocation,
    pub error_type: ErrorType,

    // Structured detail for drivers and tooling
    pub metadata: HashMap<ErrorMetaDataKey, &'static str>,
}

impl CompileError {
    pub fn new(
        msg: impl Into<String>,
        location: ErrorLocation,
        error_type: ErrorType,
    ) -> CompileError {
        CompileError {
            msg: msg.into(),
            location,
            error_type,
            metadata: HashMap::new(),
        }
    }

    pub fn with_file_path(mut self, file_path: PathBuf) -> Self {
        self.location.scope = file_path;
        self
    }

    pub fn new_metadata_entry(&mut self, key: ErrorMetaDataKey, value: &'static str) {
        self.metadata.insert(key, value);
    }

    /// Create a module-level invariant violation for a duplicated function label.
    pub fn duplicate_symbol(msg: impl Into<String>) -> Self {
        CompileError {
            msg: msg.into(),
            location: ErrorLocation::default(),
            error_type: ErrorType::DuplicateSymbol,
            metadata: HashMap::new(),
        }
    }

    /// Create a module-level invariant violation for a conflicting import.
    pub fn conflicting_import(msg: impl Into<String>) -> Self {
        CompileError {
            msg: msg.into(),
            location: ErrorLocation::default(),
            error_type: ErrorType::ConflictingImport,
            metadata: HashMap::new(),
        }
    }

    /// Create an invalid static allocation error.
    pub fn invalid_size(msg: impl Into<String>) -> Self {
        CompileError {
            msg: msg.into(),
            location: ErrorLocation::default(),
            error_type: ErrorType::InvalidSize,
            metadata: HashMap::new(),
        }
    }

    /// Create a validation error for emitted WAT that failed to assemble.
    pub fn wasm_validation(msg: impl Into<String>) -> Self {
        CompileError {
            msg: msg.into(),
            location: ErrorLocation::default(),
            error_type: ErrorType::WasmValidation,
            metadata: HashMap::new(),
        }
    }

    /// Create a file system error from a Path.
    pub fn file_error(path: &std::path::Path, msg: impl Into<String>) -> Self {
        CompileError {
            msg: msg.into(),
            location: ErrorLocation::new(
                path.to_path_buf(),
                CharPosition::default(),
                CharPosition::default(),
            ),
            error_type: ErrorType::File,
            metadata: HashMap::new(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}:{}: {}",
            error_type_to_str(&self.error_type),
            self.location.start_pos.line,
            self.location.start_pos.column,
            self.msg
        )
    }
}

impl std::error::Error for CompileError {}

#[derive(PartialEq, Debug, Clone)]
pub enum ErrorType {
    InvalidAst,
    UnresolvedIdentifier,
    StorageKindMismatch,
    DuplicateSymbol,
    ConflictingImport,
    InvalidSize,
    WasmValidation,
    File,
}

pub fn error_type_to_str(e_type: &ErrorType) -> &'static str {
    match e_type {
        ErrorType::InvalidAst => "Invalid AST",
        ErrorType::UnresolvedIdentifier => "Unresolved Identifier",
        ErrorType::StorageKindMismatch => "Storage Kind Mismatch",
        ErrorType::DuplicateSymbol => "Duplicate Symbol",
        ErrorType::ConflictingImport => "Conflicting Import",
        ErrorType::InvalidSize => "Invalid Allocation Size",
        ErrorType::WasmValidation => "WASM Validation",
        ErrorType::File => "File Error",
    }
}

/// Returns a new CompileError for AST variants the backend must never see.
///
/// These indicate either a type checker bug or a stage ordering bug, never a
/// user mistake that reaches this far.
///
/// Usage:
/// `return_invalid_ast_error!("message", location, {
///     CompilationStage => "Wasm Lowering",
///     PrimarySuggestion => "Pointers are rejected before codegen",
/// })`;
#[macro_export]
macro_rules! return_invalid_ast_error {
    ($msg:expr, $loc:expr, { $( $key:ident => $value:expr ),* $(,)? }) => {
        return Err($crate::compiler::compiler_errors::CompileError {
            msg: $msg.into(),
            location: $loc,
            error_type: $crate::compiler::compiler_errors::ErrorType::InvalidAst,
            metadata: {
                let mut map = std::collections::HashMap::new();
                $( map.insert($crate::compiler::compiler_errors::ErrorMetaDataKey::$key, $value); )*
                map
            },
        })
    };
    ($msg:expr, $loc:expr) => {
        return Err($crate::compiler::compiler_errors::CompileError {
            msg: $msg.into(),
            location: $loc,
            error_type: $crate::compiler::compiler_errors::ErrorType::InvalidAst,
            metadata: std::collections::HashMap::new(),
        })
    };
}

/// Returns a new CompileError for a variable reference without a storage entry.
///
/// Usage:
/// `return_unresolved_identifier_error!("message", location, { VariableName => "x" })`;
#[macro_export]
macro_rules! return_unresolved_identifier_error {
    ($msg:expr, $loc:expr, { $( $key:ident => $value:expr ),* $(,)? }) => {
        return Err($crate::compiler::compiler_errors::CompileError {
            msg: $msg.into(),
            location: $loc,
            error_type: $crate::compiler::compiler_errors::ErrorType::UnresolvedIdentifier,
            metadata: {
                let mut map = std::collections::HashMap::new();
                $( map.insert($crate::compiler::compiler_errors::ErrorMetaDataKey::$key, $value); )*
                map
            },
        })
    };
    ($msg:expr, $loc:expr) => {
        return Err($crate::compiler::compiler_errors::CompileError {
            msg: $msg.into(),
            location: $loc,
            error_type: $crate::compiler::compiler_errors::ErrorType::UnresolvedIdentifier,
            metadata: std::collections::HashMap::new(),
        })
    };
}

/// Returns a new CompileError for a storage entry used against its kind.
///
/// Usage:
/// `return_storage_error!("message", location, { ExpectedStorage => "Label", FoundStorage => "Id" })`;
#[macro_export]
macro_rules! return_storage_error {
    ($msg:expr, $loc:expr, { $( $key:ident => $value:expr ),* $(,)? }) => {
        return Err($crate::compiler::compiler_errors::CompileError {
            msg: $msg.into(),
            location: $loc,
            error_type: $crate::compiler::compiler_errors::ErrorType::StorageKindMismatch,
            metadata: {
                let mut map = std::collections::HashMap::new();
                $( map.insert($crate::compiler::compiler_errors::ErrorMetaDataKey::$key, $value); )*
                map
            },
        })
    };
    ($msg:expr, $loc:expr) => {
        return Err($crate::compiler::compiler_errors::CompileError {
            msg: $msg.into(),
            location: $loc,
            error_type: $crate::compiler::compiler_errors::ErrorType::StorageKindMismatch,
            metadata: std::collections::HashMap::new(),
        })
    };
}

/// Returns a new CompileError for IR-level invariant violations
/// (duplicate function labels, conflicting imports).
///
/// Usage:
/// `return_module_error!(DuplicateSymbol, "message", { FunctionLabel => "f" })`;
#[macro_export]
macro_rules! return_module_error {
    ($kind:ident, $msg:expr, { $( $key:ident => $value:expr ),* $(,)? }) => {
        return Err($crate::compiler::compiler_errors::CompileError {
            msg: $msg.into(),
            location: $crate::compiler::compiler_errors::ErrorLocation::default(),
            error_type: $crate::compiler::compiler_errors::ErrorType::$kind,
            metadata: {
                let mut map = std::collections::HashMap::new();
                $( map.insert($crate::compiler::compiler_errors::ErrorMetaDataKey::$key, $value); )*
                map
            },
        })
    };
    ($kind:ident, $msg:expr) => {
        return Err($crate::compiler::compiler_errors::CompileError {
            msg: $msg.into(),
            location: $crate::compiler::compiler_errors::ErrorLocation::default(),
            error_type: $crate::compiler::compiler_errors::ErrorType::$kind,
            metadata: std::collections::HashMap::new(),
        })
    };
}

/// Prints every accumulated error to stderr in a plain, driver-agnostic form.
pub fn print_errors(messages: &CompilerMessages) {
    for error in &messages.errors {
        eprintln!("{}", error);
    }
}
