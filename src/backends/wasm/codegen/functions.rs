//! First-class functions and closures.
//!
//! Every lambda compiles to a top-level function whose leading parameter is
//! an environment pointer. A function value is a two-word cell of
//! `(table_index, env_pointer)`; indirect calls go through the module's
//! single function table against a canonical per-signature type.
//!
//! Capture-free `let`/`let rec` lambdas hoist: their cell is laid out as a
//! data segment at compile time and call sites stay direct `call`s. A
//! recursive lambda with captures gets its cell address *before* its body is
//! lowered, so the body can reference itself through the static cell.

use crate::backends::wasm::codegen::context::{Binding, CodegenContext, FunctionBuilder, VarStorage};
use crate::backends::wasm::codegen::expressions::{lower_expr, repr_of, use_host, value_type_of};
use crate::backends::wasm::codegen::free_vars::free_vars;
use crate::backends::wasm::host_functions::HostFunction;
use crate::backends::wasm::instructions::{Id, InstSink, MemArg, ValueType, WasmInst, WasmOp};
use crate::backends::wasm::wasm_module::WasmModule;
use crate::compiler::ast_nodes::{ExprKind, TextLocation, TypedExpr};
use crate::compiler::compiler_errors::CompileError;
use crate::compiler::datatypes::{Type, WasmRepr};
use crate::return_invalid_ast_error;

/// The variables a lambda would capture: its free variables that live in the
/// enclosing function's locals. Statically-addressed storage (globals,
/// memory cells, hoisted functions, tags) needs no environment slot.
pub(crate) fn capture_set(ctx: &CodegenContext, lambda: &TypedExpr) -> Vec<(String, Binding)> {
    free_vars(lambda)
        .into_iter()
        .filter_map(|name| {
            let binding = ctx.lookup(&name)?;
            if binding.storage.is_static() || binding.repr == WasmRepr::None {
                return None;
            }
            if let VarStorage::Label(label) = &binding.storage {
                if ctx.is_global(label) {
                    return None;
                }
            }
            Some((name, binding.clone()))
        })
        .collect()
}

/// True for a `let` initializer that can hoist to a named top-level
/// function: a lambda with an empty capture set.
pub(crate) fn hoistable_lambda(ctx: &CodegenContext, init: &TypedExpr) -> bool {
    matches!(init.kind, ExprKind::Lambda { .. }) && capture_set(ctx, init).is_empty()
}

/// Compile a lambda into a top-level function `(i32 cenv, …) -> ret`.
/// The prologue unpacks each captured value from the environment record
/// into a named local.
fn generate_lambda_function(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    label: &str,
    params: &[(String, Type)],
    body: &TypedExpr,
    captured: &[(String, Binding)],
) -> Result<(), CompileError> {
    let cenv = ctx.fresh_name("cenv");
    let mut wasm_params = vec![(cenv.clone(), ValueType::I32)];
    let mut restores: Vec<(String, Option<Binding>)> = Vec::new();

    for (param, param_ty) in params {
        let repr = repr_of(ctx, param_ty);
        let binding = match value_type_of(repr) {
            Some(value_type) => {
                let local = ctx.fresh_name(param);
                wasm_params.push((local.clone(), value_type));
                Binding {
                    storage: VarStorage::Label(local),
                    repr,
                }
            }
            // Unit parameters contribute no Wasm parameter
            None => Binding {
                storage: VarStorage::Label(ctx.fresh_name(param)),
                repr,
            },
        };
        restores.push((param.clone(), ctx.bind(param, binding)));
    }

    let results: Vec<ValueType> = value_type_of(repr_of(ctx, &body.ty)).into_iter().collect();
    let mut builder = FunctionBuilder::new(label, wasm_params, results);
    let mut code = Vec::new();

    for (slot, (name, outer)) in captured.iter().enumerate() {
        let Some(value_type) = value_type_of(outer.repr) else {
            continue;
        };
        let local = builder.fresh_local(ctx, name, value_type);
        code.op(WasmOp::LocalGet(Id::name(&cenv)));
        code.op_comment(
            match value_type {
                ValueType::I32 => WasmOp::I32Load(MemArg::offset(slot as u32 * 4)),
                ValueType::F32 => WasmOp::F32Load(MemArg::offset(slot as u32 * 4)),
            },
            format!("captured '{}'", name),
        );
        code.op(WasmOp::LocalSet(Id::name(&local)));
        restores.push((
            name.clone(),
            ctx.bind(
                name,
                Binding {
                    storage: VarStorage::Label(local),
                    repr: outer.repr,
                },
            ),
        ));
    }

    let lowered = lower_expr(ctx, module, &mut builder, &mut code, body);
    for (name, previous) in restores.into_iter().rev() {
        ctx.restore(&name, previous);
    }
    lowered?;
    builder.finish(module, code)
}

/// Store `(table_index, env_pointer)` into a closure cell at runtime,
/// building the environment record for the captured values.
fn emit_closure_cell_init(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    index: u32,
    cell: u32,
    captured: &[(String, Binding)],
) -> Result<(), CompileError> {
    code.op_comment(WasmOp::I32Const(cell as i32), "closure cell");
    code.op_comment(WasmOp::I32Const(index as i32), "table index");
    code.op(WasmOp::I32Store(MemArg::default()));

    let malloc = use_host(ctx, module, HostFunction::Malloc)?;
    code.op(WasmOp::I32Const((captured.len() * 4) as i32));
    code.op_comment(WasmOp::Call(malloc.to_string()), "closure environment record");
    let env = func.fresh_local(ctx, "env_record", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&env)));

    for (slot, (name, binding)) in captured.iter().enumerate() {
        let Some(value_type) = value_type_of(binding.repr) else {
            continue;
        };
        code.op(WasmOp::LocalGet(Id::name(&env)));
        match &binding.storage {
            VarStorage::Label(label) => code.op(WasmOp::LocalGet(Id::Name(label.clone()))),
            VarStorage::Offset(offset) => code.op(WasmOp::LocalGet(Id::Index(*offset))),
            // capture_set only returns function-local storage
            _ => code.op(WasmOp::I32Const(0)),
        }
        code.op_comment(
            match value_type {
                ValueType::I32 => WasmOp::I32Store(MemArg::offset(slot as u32 * 4)),
                ValueType::F32 => WasmOp::F32Store(MemArg::offset(slot as u32 * 4)),
            },
            format!("capture '{}'", name),
        );
    }

    code.op(WasmOp::I32Const(cell as i32));
    code.op(WasmOp::LocalGet(Id::name(&env)));
    code.op_comment(WasmOp::I32Store(MemArg::offset(4)), "environment pointer");
    Ok(())
}

/// Lay out a statically-known closure cell `(table_index, 0)` as data.
fn emit_static_closure_cell(module: &mut WasmModule, label: &str, index: u32, cell: u32) {
    let mut bytes = Vec::with_capacity(8);
    bytes.extend_from_slice(&index.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    module.add_data_segment(
        cell,
        bytes,
        Some(format!("closure cell of ${} (table index {})", label, index)),
    );
}

/// An anonymous lambda in value position: compile the function, build its
/// cell, and leave the cell address on the stack.
pub(crate) fn lower_closure_value(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    expr: &TypedExpr,
) -> Result<(), CompileError> {
    let ExprKind::Lambda { params, body } = &expr.kind else {
        return_invalid_ast_error!(
            "closure lowering expects a lambda",
            (&expr.location).into()
        );
    };
    let captured = capture_set(ctx, expr);
    let label = ctx.fresh_name("lambda");
    generate_lambda_function(ctx, module, &label, params, body, &captured)?;

    let index = module.add_table_entry(&label);
    let cell = ctx.allocator.allocate_words(2)?;
    if captured.is_empty() {
        emit_static_closure_cell(module, &label, index, cell);
    } else {
        emit_closure_cell_init(ctx, module, func, code, index, cell, &captured)?;
    }
    code.op_comment(WasmOp::I32Const(cell as i32), "closure value");
    Ok(())
}

/// `let name = λ…` with an empty capture set: hoist to a named function,
/// bind as a direct-call target, no runtime cell construction.
pub(crate) fn lower_hoisted_binding(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    name: &str,
    init: &TypedExpr,
    scope: &TypedExpr,
) -> Result<(), CompileError> {
    let ExprKind::Lambda { params, body } = &init.kind else {
        return_invalid_ast_error!(
            "hoisting expects a lambda initializer",
            (&init.location).into()
        );
    };
    let label = ctx.fresh_name(name);
    generate_lambda_function(ctx, module, &label, params, body, &[])?;

    let index = module.add_table_entry(&label);
    let cell = ctx.allocator.allocate_words(2)?;
    emit_static_closure_cell(module, &label, index, cell);

    let previous = ctx.bind(
        name,
        Binding {
            storage: VarStorage::TableEntry { label, index, cell },
            repr: WasmRepr::I32,
        },
    );
    let result = lower_expr(ctx, module, func, code, scope);
    ctx.restore(name, previous);
    result
}

/// `let rec`: the binding is installed before the body is lowered so the
/// body can call itself. Capture-free recursions hoist exactly like `let`;
/// capturing ones get a static cell whose words are stored at runtime.
pub(crate) fn lower_let_rec(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    name: &str,
    init: &TypedExpr,
    scope: &TypedExpr,
    location: &TextLocation,
) -> Result<(), CompileError> {
    let ExprKind::Lambda { params, body } = &init.kind else {
        return_invalid_ast_error!(
            "'let rec' requires a lambda initializer",
            location.into(),
            { CompilationStage => "Wasm Lowering" }
        );
    };
    let captured = capture_set(ctx, init);
    let label = ctx.fresh_name(name);
    let index = module.add_table_entry(&label);
    let cell = ctx.allocator.allocate_words(2)?;

    let binding = if captured.is_empty() {
        emit_static_closure_cell(module, &label, index, cell);
        Binding {
            storage: VarStorage::TableEntry {
                label: label.clone(),
                index,
                cell,
            },
            repr: WasmRepr::I32,
        }
    } else {
        Binding {
            storage: VarStorage::FuncRef {
                label: label.clone(),
                index,
                cell,
            },
            repr: WasmRepr::I32,
        }
    };

    let previous = ctx.bind(name, binding);
    let result = generate_lambda_function(ctx, module, &label, params, body, &captured)
        .and_then(|_| {
            if !captured.is_empty() {
                emit_closure_cell_init(ctx, module, func, code, index, cell, &captured)?;
            }
            lower_expr(ctx, module, func, code, scope)
        });
    ctx.restore(name, previous);
    result
}

/// Function application. Hoisted callees are direct `call`s with a null
/// environment; everything else evaluates to a closure cell and dispatches
/// through `call_indirect` against the callee's canonical signature.
pub(crate) fn lower_application(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    callee: &TypedExpr,
    args: &[TypedExpr],
    location: &TextLocation,
) -> Result<(), CompileError> {
    let signature = callee
        .ty
        .fun_signature(&ctx.type_env)
        .map(|(params, ret)| (params.to_vec(), ret.clone()));
    let Some((arg_tys, ret_ty)) = signature else {
        return_invalid_ast_error!(
            format!("cannot call a value of type {}", callee.ty),
            location.into(),
            { CompilationStage => "Wasm Lowering" }
        );
    };

    let mut params = vec![ValueType::I32];
    for arg_ty in &arg_tys {
        if let Some(value_type) = value_type_of(repr_of(ctx, arg_ty)) {
            params.push(value_type);
        }
    }
    let results: Vec<ValueType> = value_type_of(repr_of(ctx, &ret_ty)).into_iter().collect();

    if let ExprKind::Variable(name) = &callee.kind {
        let direct = match ctx.lookup(name) {
            Some(Binding {
                storage: VarStorage::TableEntry { label, .. },
                ..
            }) => Some(label.clone()),
            _ => None,
        };
        if let Some(label) = direct {
            code.op_comment(WasmOp::I32Const(0), "no closure environment");
            for arg in args {
                lower_expr(ctx, module, func, code, arg)?;
            }
            code.op(WasmOp::Call(label));
            return Ok(());
        }
    }

    lower_expr(ctx, module, func, code, callee)?;
    let closure = func.fresh_local(ctx, "closure", ValueType::I32);
    code.op(WasmOp::LocalTee(Id::name(&closure)));
    code.op_comment(WasmOp::I32Load(MemArg::offset(4)), "environment pointer");
    for arg in args {
        lower_expr(ctx, module, func, code, arg)?;
    }
    code.op(WasmOp::LocalGet(Id::name(&closure)));
    code.op_comment(WasmOp::I32Load(MemArg::default()), "table index");
    let type_name = module.register_func_type(&params, &results);
    code.op(WasmOp::CallIndirect(type_name));
    Ok(())
}
