//! Host functions known to the Hygge syscall interface.
//!
//! The emitted module imports only the primitives the source program
//! actually uses; adding the same import twice is idempotent at the module
//! level. `malloc` is special: under the internal allocation strategy it is
//! synthesised inside the module instead of imported, but keeps the same
//! label so call sites never change.

use crate::backends::wasm::instructions::ValueType;

/// The import module every host primitive lives under.
pub const HOST_MODULE: &str = "env";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFunction {
    /// `malloc(size: i32) -> i32`: runtime allocation for structs and arrays.
    Malloc,
    /// `readInt() -> i32`
    ReadInt,
    /// `readFloat() -> f32`
    ReadFloat,
    /// `writeInt(value: i32)`
    WriteInt,
    /// `writeFloat(value: f32)`
    WriteFloat,
    /// `writeS(pointer: i32, byte_length: i32)`
    WriteS,
}

/// Import signature of one host function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFunctionDef {
    /// Label used for the imported function inside the module (`$label`).
    pub label: &'static str,
    /// Name under `env` in the import section.
    pub import_name: &'static str,
    pub params: &'static [ValueType],
    pub results: &'static [ValueType],
}

impl HostFunction {
    pub fn def(self) -> HostFunctionDef {
        match self {
            HostFunction::Malloc => HostFunctionDef {
                label: "malloc",
                import_name: "malloc",
                params: &[ValueType::I32],
                results: &[ValueType::I32],
            },
            HostFunction::ReadInt => HostFunctionDef {
                label: "readInt",
                import_name: "readInt",
                params: &[],
                results: &[ValueType::I32],
            },
            HostFunction::ReadFloat => HostFunctionDef {
                label: "readFloat",
                import_name: "readFloat",
                params: &[],
                results: &[ValueType::F32],
            },
            HostFunction::WriteInt => HostFunctionDef {
                label: "writeInt",
                import_name: "writeInt",
                params: &[ValueType::I32],
                results: &[],
            },
            HostFunction::WriteFloat => HostFunctionDef {
                label: "writeFloat",
                import_name: "writeFloat",
                params: &[ValueType::F32],
                results: &[],
            },
            HostFunction::WriteS => HostFunctionDef {
                label: "writeS",
                import_name: "writeS",
                params: &[ValueType::I32, ValueType::I32],
                results: &[],
            },
        }
    }

    pub fn label(self) -> &'static str {
        self.def().label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_match_syscall_interface() {
        let write_s = HostFunction::WriteS.def();
        assert_eq!(write_s.import_name, "writeS");
        assert_eq!(write_s.params, &[ValueType::I32, ValueType::I32]);
        assert!(write_s.results.is_empty());

        let read_float = HostFunction::ReadFloat.def();
        assert_eq!(read_float.results, &[ValueType::F32]);
    }
}
