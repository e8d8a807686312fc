//! Validation of emitted modules.
//!
//! The serializer's output is assembled with the `wat` crate and validated
//! with `wasmparser`, which pins the round-trip property: everything this
//! backend emits is accepted by a conformant text parser and is a valid
//! module. Drivers run this after serialization; the integration tests run
//! it on every compiled program.

use crate::compiler::compiler_errors::CompileError;

/// Assemble WAT text into binary Wasm.
pub fn assemble_wat(wat_text: &str) -> Result<Vec<u8>, CompileError> {
    wat::parse_str(wat_text).map_err(|error| {
        CompileError::wasm_validation(format!("emitted WAT failed to assemble: {}", error))
    })
}

/// Assemble and validate WAT text, returning the binary module.
pub fn validate_module(wat_text: &str) -> Result<Vec<u8>, CompileError> {
    let bytes = assemble_wat(wat_text)?;
    wasmparser::validate(&bytes).map_err(|error| {
        CompileError::wasm_validation(format!("emitted module failed validation: {}", error))
    })?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compiler_errors::ErrorType;

    #[test]
    fn valid_text_assembles_and_validates() {
        let bytes = validate_module("(module (func (export \"_start\") (result i32) i32.const 0))")
            .unwrap();
        // Binary magic + version
        assert_eq!(&bytes[0..4], b"\0asm");
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
    }

    #[test]
    fn malformed_text_is_a_validation_error() {
        let err = assemble_wat("(module (func (wrong))").unwrap_err();
        assert_eq!(err.error_type, ErrorType::WasmValidation);
    }

    #[test]
    fn type_incorrect_module_fails_validation() {
        // Body pushes an f32 where the result must be i32
        let err =
            validate_module("(module (func (result i32) f32.const 1))").unwrap_err();
        assert_eq!(err.error_type, ErrorType::WasmValidation);
    }
}
