//! Lowering context and per-function instruction builder.
//!
//! The context is threaded mutably through the whole recursion: it owns the
//! variable-storage map, the static allocator, the union-tag interner, and
//! the symbol counter that mints fresh labels. Lexical scoping is implemented
//! by saving the previous binding on entry to a scope and restoring it on
//! exit, so a storage entry always exists before any instruction that
//! references it is emitted.

use crate::backends::wasm::instructions::{ValueType, WasmInst};
use crate::backends::wasm::static_memory::StaticAllocator;
use crate::backends::wasm::wasm_module::{WasmFunction, WasmModule};
use crate::compiler::compiler_errors::CompileError;
use crate::compiler::config::CompilerConfig;
use crate::compiler::datatypes::{TypeEnv, WasmRepr};
use crate::compiler::string_interning::StringTable;
use rustc_hash::{FxHashMap, FxHashSet};

/// Where an AST-level identifier lives at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum VarStorage {
    /// A named local of the current function, or a named module global.
    Label(String),
    /// A local referenced by index in the current function's locals vector.
    Offset(u32),
    /// A fixed linear-memory address holding the value (statically-allocated
    /// cells, including captured mutable variables).
    Memory(u32),
    /// A capture-free function: direct call target plus its statically
    /// initialized closure cell for value uses.
    TableEntry {
        label: String,
        index: u32,
        cell: u32,
    },
    /// A recursive closure: the cell lives at a static address but its
    /// `(table_index, env_pointer)` words are stored at runtime.
    FuncRef {
        label: String,
        index: u32,
        cell: u32,
    },
    /// A compile-time integer constant (union tags).
    Id(i32),
}

impl VarStorage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            VarStorage::Label(_) => "Label",
            VarStorage::Offset(_) => "Offset",
            VarStorage::Memory(_) => "Memory",
            VarStorage::TableEntry { .. } => "TableEntry",
            VarStorage::FuncRef { .. } => "FuncRef",
            VarStorage::Id(_) => "Id",
        }
    }

    /// True when the value can be addressed without touching the enclosing
    /// function's locals, so closures reach it without capturing it.
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            VarStorage::Memory(_)
                | VarStorage::TableEntry { .. }
                | VarStorage::FuncRef { .. }
                | VarStorage::Id(_)
        )
    }
}

/// A storage entry together with the Wasm representation of the bound value,
/// which capture sites need when no typed AST node is at hand.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub storage: VarStorage,
    pub repr: WasmRepr,
}

#[derive(Debug)]
pub struct CodegenContext {
    pub config: CompilerConfig,
    pub allocator: StaticAllocator,
    /// Union-constructor tag interner.
    pub tags: StringTable,
    /// Alias environment accumulated from `type` declarations in scope.
    pub type_env: TypeEnv,
    /// Labels of module globals, so `Label` storage can dispatch between
    /// `local.get` and `global.get`.
    pub globals: FxHashSet<String>,
    /// String literal → header cell address, for deduplication.
    pub string_headers: FxHashMap<String, u32>,

    storage: FxHashMap<String, Binding>,
    symbol_counter: u32,
}

impl CodegenContext {
    pub fn new(config: CompilerConfig) -> Self {
        CodegenContext {
            config,
            allocator: StaticAllocator::new(),
            tags: StringTable::new(),
            type_env: TypeEnv::new(),
            globals: FxHashSet::default(),
            string_headers: FxHashMap::default(),
            storage: FxHashMap::default(),
            symbol_counter: 0,
        }
    }

    /// Mint a unique label from a base name. User identifiers are sanitized
    /// so every minted name is a valid WAT id.
    pub fn fresh_name(&mut self, base: &str) -> String {
        let mut name = String::with_capacity(base.len() + 4);
        for c in base.chars() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
            } else {
                name.push('_');
            }
        }
        if name.is_empty() {
            name.push('v');
        }
        let minted = format!("{}_{}", name, self.symbol_counter);
        self.symbol_counter += 1;
        minted
    }

    /// Install a binding, returning whatever it shadowed so the caller can
    /// restore it on scope exit.
    pub fn bind(&mut self, name: &str, binding: Binding) -> Option<Binding> {
        self.storage.insert(name.to_string(), binding)
    }

    /// Undo a `bind`, restoring the shadowed entry (or removing the name).
    pub fn restore(&mut self, name: &str, previous: Option<Binding>) {
        match previous {
            Some(binding) => {
                self.storage.insert(name.to_string(), binding);
            }
            None => {
                self.storage.remove(name);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.storage.get(name)
    }

    pub fn is_global(&self, label: &str) -> bool {
        self.globals.contains(label)
    }
}

/// Accumulates one function's parameters, locals, and code during lowering.
/// Branch bodies are lowered into scratch vectors, but locals always register
/// here so the finished function declares everything it uses.
#[derive(Debug)]
pub struct FunctionBuilder {
    pub label: String,
    pub params: Vec<(String, ValueType)>,
    pub results: Vec<ValueType>,
    pub locals: Vec<(String, ValueType)>,
    pub comment: Option<String>,
}

impl FunctionBuilder {
    pub fn new(
        label: impl Into<String>,
        params: Vec<(String, ValueType)>,
        results: Vec<ValueType>,
    ) -> Self {
        FunctionBuilder {
            label: label.into(),
            params,
            results,
            locals: Vec::new(),
            comment: None,
        }
    }

    /// Declare a fresh named local and return its name.
    pub fn fresh_local(
        &mut self,
        ctx: &mut CodegenContext,
        base: &str,
        ty: ValueType,
    ) -> String {
        let name = ctx.fresh_name(base);
        self.locals.push((name.clone(), ty));
        name
    }

    /// Register this function's signature and add it to the module with the
    /// given body.
    pub fn finish(
        self,
        module: &mut WasmModule,
        body: Vec<WasmInst>,
    ) -> Result<(), CompileError> {
        let param_types: Vec<ValueType> = self.params.iter().map(|(_, ty)| *ty).collect();
        let type_name = module.register_func_type(&param_types, &self.results);
        module.add_function(WasmFunction {
            label: self.label,
            type_name,
            params: self.params,
            results: self.results,
            locals: self.locals,
            body,
            comment: self.comment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::datatypes::WasmRepr;

    #[test]
    fn bindings_restore_lexically() {
        let mut ctx = CodegenContext::new(CompilerConfig::default());
        let outer = Binding {
            storage: VarStorage::Label("x_0".to_string()),
            repr: WasmRepr::I32,
        };
        let inner = Binding {
            storage: VarStorage::Id(3),
            repr: WasmRepr::I32,
        };

        assert!(ctx.bind("x", outer.clone()).is_none());
        let shadowed = ctx.bind("x", inner.clone());
        assert_eq!(ctx.lookup("x"), Some(&inner));

        ctx.restore("x", shadowed);
        assert_eq!(ctx.lookup("x"), Some(&outer));
        ctx.restore("x", None);
        assert!(ctx.lookup("x").is_none());
    }

    #[test]
    fn fresh_names_are_unique_and_wat_safe() {
        let mut ctx = CodegenContext::new(CompilerConfig::default());
        let a = ctx.fresh_name("x");
        let b = ctx.fresh_name("x");
        assert_ne!(a, b);
        assert_eq!(ctx.fresh_name("weird name!"), "weird_name__2");
    }

    #[test]
    fn static_storage_kinds_do_not_need_capturing() {
        assert!(VarStorage::Memory(16).is_static());
        assert!(VarStorage::Id(1).is_static());
        assert!(!VarStorage::Label("x".to_string()).is_static());
        assert!(!VarStorage::Offset(2).is_static());
    }
}
