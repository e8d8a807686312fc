//! In-memory representation of a Wasm module.
//!
//! The code generator builds exactly one of these per compilation; the
//! peephole pass rewrites function bodies in place; the serializer prints
//! the finished module as WAT. All collections keep insertion order so the
//! output is deterministic.
//!
//! Invariants maintained here:
//! - function labels are unique within a module
//! - each signature appears once in the type table, under a canonical name
//! - each indirectly-called function appears exactly once in the element
//!   segment, at the index callers use

use crate::backends::wasm::instructions::{ValueType, WasmInst};
use crate::compiler::compiler_errors::CompileError;
use rustc_hash::FxHashMap;

/// A deduplicated function signature, referenced by canonical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub name: String,
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

/// What an import binds: a function signature, a table, a memory, or a global.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportKind {
    Func {
        label: String,
        params: Vec<ValueType>,
        results: Vec<ValueType>,
    },
    Table {
        min: u32,
    },
    Memory {
        min_pages: u32,
        max_pages: Option<u32>,
    },
    Global {
        label: String,
        ty: ValueType,
        mutable: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub kind: ImportKind,
}

/// Constant initializer of a global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlobalInit {
    I32(i32),
    F32(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub label: String,
    pub ty: ValueType,
    pub mutable: bool,
    pub init: GlobalInit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDecl {
    pub min_pages: u32,
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Global,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    /// Label of the exported function or global; ignored for memory, which
    /// is always index 0.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WasmFunction {
    pub label: String,
    /// Canonical name of this function's signature in the type table.
    pub type_name: String,
    pub params: Vec<(String, ValueType)>,
    pub results: Vec<ValueType>,
    pub locals: Vec<(String, ValueType)>,
    pub body: Vec<WasmInst>,
    /// Optional comment printed above the function.
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WasmModule {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    pub globals: Vec<Global>,
    pub memory: Option<MemoryDecl>,
    /// Element segment: function labels in table-index order.
    pub table_entries: Vec<String>,
    pub functions: Vec<WasmFunction>,
    pub data_segments: Vec<DataSegment>,
    pub exports: Vec<Export>,

    function_index: FxHashMap<String, usize>,
    type_index: FxHashMap<String, usize>,

    // Scratch instruction buffer; lowering accumulates here between
    // well-defined boundaries, then commits to a named function.
    temp: Vec<WasmInst>,
}

impl WasmModule {
    pub fn new() -> Self {
        WasmModule::default()
    }

    // =========================================================================
    // Type table
    // =========================================================================

    /// Canonical name for a signature, e.g. `fun_i32_f32_to_i32` or
    /// `fun_to_void` for `() -> ()`.
    pub fn canonical_type_name(params: &[ValueType], results: &[ValueType]) -> String {
        let mut name = String::from("fun");
        for param in params {
            name.push('_');
            name.push_str(&param.to_string());
        }
        name.push_str("_to");
        if results.is_empty() {
            name.push_str("_void");
        } else {
            for result in results {
                name.push('_');
                name.push_str(&result.to_string());
            }
        }
        name
    }

    /// Register a signature, returning its canonical name. Registering the
    /// same signature twice returns the same name without growing the table.
    pub fn register_func_type(&mut self, params: &[ValueType], results: &[ValueType]) -> String {
        let name = Self::canonical_type_name(params, results);
        if !self.type_index.contains_key(&name) {
            self.type_index.insert(name.clone(), self.types.len());
            self.types.push(FuncType {
                name: name.clone(),
                params: params.to_vec(),
                results: results.to_vec(),
            });
        }
        name
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.type_index.contains_key(name)
    }

    // =========================================================================
    // Functions
    // =========================================================================

    pub fn add_function(&mut self, function: WasmFunction) -> Result<(), CompileError> {
        if self.function_index.contains_key(&function.label) {
            return Err(CompileError::duplicate_symbol(format!(
                "function label '{}' is already defined in this module",
                function.label
            )));
        }
        self.function_index
            .insert(function.label.clone(), self.functions.len());
        self.functions.push(function);
        Ok(())
    }

    pub fn has_function(&self, label: &str) -> bool {
        self.function_index.contains_key(label)
    }

    pub fn function(&self, label: &str) -> Option<&WasmFunction> {
        self.function_index
            .get(label)
            .map(|&index| &self.functions[index])
    }

    pub fn function_mut(&mut self, label: &str) -> Option<&mut WasmFunction> {
        let index = *self.function_index.get(label)?;
        self.functions.get_mut(index)
    }

    /// Replace the body of a named function.
    pub fn set_function_body(
        &mut self,
        label: &str,
        body: Vec<WasmInst>,
    ) -> Result<(), CompileError> {
        match self.function_mut(label) {
            Some(function) => {
                function.body = body;
                Ok(())
            }
            None => Err(CompileError::duplicate_symbol(format!(
                "cannot attach body: no function labelled '{}'",
                label
            ))),
        }
    }

    /// Append instructions to the body of a named function.
    pub fn append_to_function(
        &mut self,
        label: &str,
        code: impl IntoIterator<Item = WasmInst>,
    ) -> Result<(), CompileError> {
        match self.function_mut(label) {
            Some(function) => {
                function.body.extend(code);
                Ok(())
            }
            None => Err(CompileError::duplicate_symbol(format!(
                "cannot append code: no function labelled '{}'",
                label
            )))
        }
    }

    // =========================================================================
    // Temp buffer
    // =========================================================================

    pub fn append_temp(&mut self, inst: WasmInst) {
        self.temp.push(inst);
    }

    pub fn append_temp_many(&mut self, code: impl IntoIterator<Item = WasmInst>) {
        self.temp.extend(code);
    }

    pub fn reset_temp(&mut self) {
        self.temp.clear();
    }

    /// Take the accumulated scratch instructions, leaving the buffer empty.
    pub fn take_temp(&mut self) -> Vec<WasmInst> {
        std::mem::take(&mut self.temp)
    }

    /// Move the accumulated scratch instructions into a named function.
    pub fn commit_temp_to(&mut self, label: &str) -> Result<(), CompileError> {
        let code = self.take_temp();
        self.append_to_function(label, code)
    }

    // =========================================================================
    // Imports, globals, memory, table, data, exports
    // =========================================================================

    /// Add an import. Identical re-imports are idempotent; a differing
    /// signature under the same `(module, name)` key is a conflict.
    pub fn add_import(&mut self, import: Import) -> Result<(), CompileError> {
        if let Some(existing) = self
            .imports
            .iter()
            .find(|i| i.module == import.module && i.name == import.name)
        {
            if existing.kind == import.kind {
                return Ok(());
            }
            return Err(CompileError::conflicting_import(format!(
                "import '{}.{}' is already declared with a different signature",
                import.module, import.name
            )));
        }
        self.imports.push(import);
        Ok(())
    }

    pub fn has_import(&self, module: &str, name: &str) -> bool {
        self.imports
            .iter()
            .any(|i| i.module == module && i.name == name)
    }

    /// Add a global. Re-adding an identical definition is idempotent.
    pub fn add_global(&mut self, global: Global) -> Result<(), CompileError> {
        if let Some(existing) = self.globals.iter().find(|g| g.label == global.label) {
            if *existing == global {
                return Ok(());
            }
            return Err(CompileError::duplicate_symbol(format!(
                "global '{}' is already defined with a different shape",
                global.label
            )));
        }
        self.globals.push(global);
        Ok(())
    }

    pub fn has_global(&self, label: &str) -> bool {
        self.globals.iter().any(|g| g.label == label)
    }

    /// Declare the module memory, merging limits: the widest initial and
    /// maximum win.
    pub fn add_memory(&mut self, min_pages: u32, max_pages: Option<u32>) {
        self.memory = Some(match self.memory {
            None => MemoryDecl {
                min_pages,
                max_pages,
            },
            Some(existing) => MemoryDecl {
                min_pages: existing.min_pages.max(min_pages),
                max_pages: match (existing.max_pages, max_pages) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                },
            },
        });
    }

    /// Register a function in the table's element segment, returning its
    /// index. A label already present keeps its original index.
    pub fn add_table_entry(&mut self, label: impl Into<String>) -> u32 {
        let label = label.into();
        if let Some(index) = self.table_entries.iter().position(|l| *l == label) {
            return index as u32;
        }
        self.table_entries.push(label);
        (self.table_entries.len() - 1) as u32
    }

    pub fn table_size(&self) -> u32 {
        self.table_entries.len() as u32
    }

    pub fn add_data_segment(
        &mut self,
        offset: u32,
        bytes: Vec<u8>,
        comment: Option<String>,
    ) {
        self.data_segments.push(DataSegment {
            offset,
            bytes,
            comment,
        });
    }

    /// Add an export. Identical re-exports are idempotent; reusing an export
    /// name for a different target is a duplicate-symbol violation.
    pub fn add_export(
        &mut self,
        name: impl Into<String>,
        kind: ExportKind,
        target: impl Into<String>,
    ) -> Result<(), CompileError> {
        let export = Export {
            name: name.into(),
            kind,
            target: target.into(),
        };
        if let Some(existing) = self.exports.iter().find(|e| e.name == export.name) {
            if *existing == export {
                return Ok(());
            }
            return Err(CompileError::duplicate_symbol(format!(
                "export '{}' is already bound to a different item",
                export.name
            )));
        }
        self.exports.push(export);
        Ok(())
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Union of two modules, de-duplicating by unique key: function label
    /// for functions, `(module, name)` for imports, name for globals and
    /// exports, canonical name for types. Table entries keep their target
    /// labels (indices may shift); identical data segments collapse.
    pub fn merge(&mut self, other: WasmModule) -> Result<(), CompileError> {
        for func_type in other.types {
            self.register_func_type(&func_type.params, &func_type.results);
        }
        for import in other.imports {
            self.add_import(import)?;
        }
        for global in other.globals {
            self.add_global(global)?;
        }
        if let Some(memory) = other.memory {
            self.add_memory(memory.min_pages, memory.max_pages);
        }
        for label in other.table_entries {
            self.add_table_entry(label);
        }
        for function in other.functions {
            self.add_function(function)?;
        }
        for segment in other.data_segments {
            if !self.data_segments.contains(&segment) {
                self.data_segments.push(segment);
            }
        }
        for export in other.exports {
            self.add_export(export.name, export.kind, export.target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::wasm::instructions::WasmOp;
    use crate::compiler::compiler_errors::ErrorType;

    fn named_function(label: &str) -> WasmFunction {
        WasmFunction {
            label: label.to_string(),
            type_name: "fun_to_i32".to_string(),
            params: Vec::new(),
            results: vec![ValueType::I32],
            locals: Vec::new(),
            body: vec![WasmOp::I32Const(0).into(), WasmOp::Return.into()],
            comment: None,
        }
    }

    #[test]
    fn type_table_collapses_duplicate_signatures() {
        let mut module = WasmModule::new();
        let a = module.register_func_type(&[ValueType::I32], &[ValueType::I32]);
        let b = module.register_func_type(&[ValueType::I32], &[ValueType::I32]);
        assert_eq!(a, b);
        assert_eq!(module.types.len(), 1);
        assert_eq!(a, "fun_i32_to_i32");

        let unit = module.register_func_type(&[], &[]);
        assert_eq!(unit, "fun_to_void");
        assert_eq!(module.types.len(), 2);
    }

    #[test]
    fn duplicate_function_labels_are_rejected() {
        let mut module = WasmModule::new();
        module.add_function(named_function("f")).unwrap();
        let err = module.add_function(named_function("f")).unwrap_err();
        assert_eq!(err.error_type, ErrorType::DuplicateSymbol);
    }

    #[test]
    fn identical_imports_are_idempotent_but_conflicts_fail() {
        let mut module = WasmModule::new();
        let import = Import {
            module: "env".to_string(),
            name: "writeInt".to_string(),
            kind: ImportKind::Func {
                label: "writeInt".to_string(),
                params: vec![ValueType::I32],
                results: Vec::new(),
            },
        };
        module.add_import(import.clone()).unwrap();
        module.add_import(import.clone()).unwrap();
        assert_eq!(module.imports.len(), 1);

        let conflicting = Import {
            kind: ImportKind::Func {
                label: "writeInt".to_string(),
                params: vec![ValueType::F32],
                results: Vec::new(),
            },
            ..import
        };
        let err = module.add_import(conflicting).unwrap_err();
        assert_eq!(err.error_type, ErrorType::ConflictingImport);
    }

    #[test]
    fn memory_limits_merge_to_widest() {
        let mut module = WasmModule::new();
        module.add_memory(1, Some(4));
        module.add_memory(2, Some(2));
        assert_eq!(
            module.memory,
            Some(MemoryDecl {
                min_pages: 2,
                max_pages: Some(4)
            })
        );
        // A missing maximum means unbounded and wins the merge
        module.add_memory(1, None);
        assert_eq!(module.memory.unwrap().max_pages, None);
    }

    #[test]
    fn table_entries_are_registered_once() {
        let mut module = WasmModule::new();
        assert_eq!(module.add_table_entry("f"), 0);
        assert_eq!(module.add_table_entry("g"), 1);
        assert_eq!(module.add_table_entry("f"), 0);
        assert_eq!(module.table_size(), 2);
    }

    #[test]
    fn temp_buffer_commits_into_named_function() {
        let mut module = WasmModule::new();
        module.register_func_type(&[], &[ValueType::I32]);
        module
            .add_function(WasmFunction {
                body: Vec::new(),
                ..named_function("main")
            })
            .unwrap();

        module.append_temp(WasmOp::I32Const(7).into());
        module.append_temp(WasmOp::Return.into());
        module.commit_temp_to("main").unwrap();

        assert_eq!(module.function("main").unwrap().body.len(), 2);
        assert!(module.take_temp().is_empty());
    }

    #[test]
    fn merge_unions_and_deduplicates() {
        let mut left = WasmModule::new();
        left.register_func_type(&[], &[ValueType::I32]);
        left.add_function(named_function("shared_helper")).unwrap();
        left.add_table_entry("shared_helper");
        left.add_export("_start", ExportKind::Func, "shared_helper")
            .unwrap();

        let mut right = WasmModule::new();
        right.register_func_type(&[], &[ValueType::I32]);
        right.add_function(named_function("other")).unwrap();
        right.add_table_entry("shared_helper");
        right.add_memory(2, None);
        right
            .add_export("_start", ExportKind::Func, "shared_helper")
            .unwrap();

        left.merge(right).unwrap();
        assert_eq!(left.types.len(), 1);
        assert_eq!(left.functions.len(), 2);
        assert_eq!(left.table_entries, vec!["shared_helper".to_string()]);
        assert_eq!(left.exports.len(), 1);
        assert_eq!(left.memory.unwrap().min_pages, 2);
    }

    #[test]
    fn merge_with_colliding_function_labels_fails() {
        let mut left = WasmModule::new();
        left.add_function(named_function("f")).unwrap();
        let mut right = WasmModule::new();
        right.add_function(named_function("f")).unwrap();

        let err = left.merge(right).unwrap_err();
        assert_eq!(err.error_type, ErrorType::DuplicateSymbol);
    }
}
