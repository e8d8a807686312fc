//! Typed-AST → Wasm IR lowering.
//!
//! `compile_module` is the backend entry point: it synthesises the `_start`
//! entry function, lowers the whole program into it, publishes the static
//! allocator's high-water mark as the `heap_base` global, sizes the linear
//! memory, and wires up the exports. Under the internal allocation strategy
//! it also synthesises the module's own bump `malloc`.

pub mod aggregates;
pub mod context;
pub mod control_flow;
pub mod expressions;
pub mod free_vars;
pub mod functions;

use crate::backends::wasm::codegen::context::{CodegenContext, FunctionBuilder};
use crate::backends::wasm::codegen::expressions::{lower_expr, repr_of};
use crate::backends::wasm::instructions::{Id, InstSink, ValueType, WasmInst, WasmOp};
use crate::backends::wasm::wasm_module::{
    ExportKind, Global, GlobalInit, WasmFunction, WasmModule,
};
use crate::codegen_log;
use crate::compiler::ast_nodes::TypedExpr;
use crate::compiler::compiler_errors::CompileError;
use crate::compiler::config::{AllocationStrategy, CompilerConfig};
use crate::compiler::datatypes::WasmRepr;

/// Label of the synthesized entry function.
pub const ENTRY_POINT: &str = "_start";

/// Lower a typed program into a complete Wasm module.
pub fn compile_module(
    ast: &TypedExpr,
    config: &CompilerConfig,
) -> Result<WasmModule, CompileError> {
    let mut ctx = CodegenContext::new(config.clone());
    let mut module = WasmModule::new();

    // Runtime-check failures record the sentinel here; _start returns it
    module.add_global(Global {
        label: "exit_code".to_string(),
        ty: ValueType::I32,
        mutable: true,
        init: GlobalInit::I32(0),
    })?;

    // Reserve the entry function up front so it heads the function section
    let start_type = module.register_func_type(&[], &[ValueType::I32]);
    module.add_function(WasmFunction {
        label: ENTRY_POINT.to_string(),
        type_name: start_type,
        params: Vec::new(),
        results: vec![ValueType::I32],
        locals: Vec::new(),
        body: Vec::new(),
        comment: Some("program entry point".to_string()),
    })?;

    let mut func = FunctionBuilder::new(ENTRY_POINT, Vec::new(), vec![ValueType::I32]);
    let mut code: Vec<WasmInst> = Vec::new();
    lower_expr(&mut ctx, &mut module, &mut func, &mut code, ast)?;
    if repr_of(&ctx, &ast.ty) != WasmRepr::None {
        code.op(WasmOp::Drop);
    }
    code.op_comment(
        WasmOp::GlobalGet(Id::name("exit_code")),
        "0 on success, 42 after a failed runtime check",
    );
    code.op(WasmOp::Return);

    if config.allocation_strategy == AllocationStrategy::Internal {
        synthesize_malloc(&mut module)?;
        let mut prologue: Vec<WasmInst> = Vec::new();
        prologue.op_comment(
            WasmOp::GlobalGet(Id::name("heap_base")),
            "bump allocation starts after static data",
        );
        prologue.op(WasmOp::GlobalSet(Id::name("heap_ptr")));
        prologue.extend(code);
        code = prologue;
    }

    let high_water_mark = ctx.allocator.high_water_mark();
    module.add_global(Global {
        label: "heap_base".to_string(),
        ty: ValueType::I32,
        mutable: false,
        init: GlobalInit::I32(high_water_mark as i32),
    })?;
    module.add_memory(ctx.allocator.page_count().max(1), None);

    module.append_temp_many(code);
    module.commit_temp_to(ENTRY_POINT)?;
    if let Some(start) = module.function_mut(ENTRY_POINT) {
        start.locals = func.locals;
    }

    module.add_export(ENTRY_POINT, ExportKind::Func, ENTRY_POINT)?;
    module.add_export("memory", ExportKind::Memory, "memory")?;
    module.add_export("heap_base_ptr", ExportKind::Global, "heap_base")?;

    codegen_log!(
        "lowered module: {} functions, {} table entries, {} bytes of static data",
        module.functions.len(),
        module.table_size(),
        high_water_mark
    );
    Ok(module)
}

/// The self-hosted allocator: a bump pointer in a mutable global, growing
/// memory one page at a time when the mark passes the current size.
fn synthesize_malloc(module: &mut WasmModule) -> Result<(), CompileError> {
    module.add_global(Global {
        label: "heap_ptr".to_string(),
        ty: ValueType::I32,
        mutable: true,
        init: GlobalInit::I32(0),
    })?;

    let mut body: Vec<WasmInst> = Vec::new();
    body.op_comment(WasmOp::GlobalGet(Id::name("heap_ptr")), "bump allocation");
    body.op(WasmOp::LocalSet(Id::name("ptr")));
    body.op(WasmOp::GlobalGet(Id::name("heap_ptr")));
    body.op(WasmOp::LocalGet(Id::name("size")));
    body.op(WasmOp::I32Add);
    body.op(WasmOp::GlobalSet(Id::name("heap_ptr")));

    let mut grow_loop: Vec<WasmInst> = Vec::new();
    grow_loop.op(WasmOp::GlobalGet(Id::name("heap_ptr")));
    grow_loop.op(WasmOp::MemorySize);
    grow_loop.op(WasmOp::I32Const(65_536));
    grow_loop.op(WasmOp::I32Mul);
    grow_loop.op_comment(WasmOp::I32LeS, "mark still inside current memory?");
    grow_loop.op(WasmOp::BrIf(Id::name("grown")));
    grow_loop.op(WasmOp::I32Const(1));
    grow_loop.op(WasmOp::MemoryGrow);
    grow_loop.op(WasmOp::I32Const(0));
    grow_loop.op(WasmOp::I32LtS);
    grow_loop.push(
        WasmOp::If {
            result: None,
            then_branch: vec![WasmOp::Unreachable.comment("out of memory")],
            else_branch: Vec::new(),
        }
        .into(),
    );
    grow_loop.op(WasmOp::Br(Id::name("check")));

    body.push(
        WasmOp::Block {
            label: Some("grown".to_string()),
            result: None,
            body: vec![
                WasmOp::Loop {
                    label: Some("check".to_string()),
                    result: None,
                    body: grow_loop,
                }
                .into(),
            ],
        }
        .into(),
    );
    body.op(WasmOp::LocalGet(Id::name("ptr")));

    let type_name = module.register_func_type(&[ValueType::I32], &[ValueType::I32]);
    module.add_function(WasmFunction {
        label: "malloc".to_string(),
        type_name,
        params: vec![("size".to_string(), ValueType::I32)],
        results: vec![ValueType::I32],
        locals: vec![("ptr".to_string(), ValueType::I32)],
        body,
        comment: Some("module-internal bump allocator".to_string()),
    })
}
