//! The recursive, type-directed lowering routine.
//!
//! `lower_expr` dispatches on the AST variant and appends instructions to
//! the caller's code sink. Operands are lowered left-to-right; every helper
//! leaves exactly the values its Hygge type says on the Wasm stack (nothing
//! for unit). Control flow, functions/closures and aggregate values live in
//! the sibling modules.

use crate::backends::wasm::codegen::context::{Binding, CodegenContext, FunctionBuilder, VarStorage};
use crate::backends::wasm::codegen::free_vars::captured_in_lambda;
use crate::backends::wasm::codegen::{aggregates, control_flow, functions};
use crate::backends::wasm::host_functions::{HOST_MODULE, HostFunction};
use crate::backends::wasm::instructions::{Id, InstSink, MemArg, ValueType, WasmInst, WasmOp};
use crate::backends::wasm::wasm_module::{Global, GlobalInit, Import, ImportKind, WasmModule};
use crate::compiler::ast_nodes::{ArithOp, CompareOp, ExprKind, LogicOp, TypedExpr};
use crate::compiler::compiler_errors::CompileError;
use crate::compiler::config::AllocationStrategy;
use crate::compiler::datatypes::{Type, WasmRepr};
use crate::{return_invalid_ast_error, return_storage_error, return_unresolved_identifier_error};

/// Wasm representation of a type under the current alias environment.
pub(crate) fn repr_of(ctx: &CodegenContext, ty: &Type) -> WasmRepr {
    ty.wasm_repr(&ctx.type_env)
}

pub(crate) fn value_type_of(repr: WasmRepr) -> Option<ValueType> {
    match repr {
        WasmRepr::I32 => Some(ValueType::I32),
        WasmRepr::F32 => Some(ValueType::F32),
        WasmRepr::None => None,
    }
}

/// Ensure a host function is available and return its call label.
///
/// Under the internal allocation strategy `malloc` is synthesised into the
/// module after lowering instead of imported, but call sites are identical.
pub(crate) fn use_host(
    ctx: &CodegenContext,
    module: &mut WasmModule,
    host: HostFunction,
) -> Result<&'static str, CompileError> {
    let def = host.def();
    let internal_malloc = host == HostFunction::Malloc
        && ctx.config.allocation_strategy == AllocationStrategy::Internal;
    if !internal_malloc {
        module.add_import(Import {
            module: HOST_MODULE.to_string(),
            name: def.import_name.to_string(),
            kind: ImportKind::Func {
                label: def.label.to_string(),
                params: def.params.to_vec(),
                results: def.results.to_vec(),
            },
        })?;
    }
    Ok(def.label)
}

/// The failure idiom shared by assertions, bounds checks, slice checks,
/// division guards and unmatched scrutinees: record the sentinel in the
/// `exit_code` global, push the enclosing function's zero value, and return.
pub(crate) fn check_failure_code(func: &FunctionBuilder, why: &str) -> Vec<WasmInst> {
    let mut seq = Vec::new();
    seq.op_comment(WasmOp::I32Const(42), why);
    seq.op(WasmOp::GlobalSet(Id::name("exit_code")));
    if func.label != "_start" {
        for result in &func.results {
            match result {
                ValueType::I32 => seq.op(WasmOp::I32Const(0)),
                ValueType::F32 => seq.op(WasmOp::F32Const(0.0)),
            }
        }
    } else {
        // _start reports the sentinel directly as its exit code
        seq.op(WasmOp::I32Const(42));
    }
    seq.op(WasmOp::Return);
    seq
}

/// Push the current value of a variable according to its storage entry.
pub(crate) fn emit_variable_read(
    ctx: &mut CodegenContext,
    code: &mut Vec<WasmInst>,
    name: &str,
    expr: &TypedExpr,
) -> Result<(), CompileError> {
    let Some(binding) = ctx.lookup(name).cloned() else {
        return_unresolved_identifier_error!(
            format!("variable '{}' has no storage entry", name),
            (&expr.location).into(),
            { CompilationStage => "Wasm Lowering" }
        );
    };
    match binding.storage {
        VarStorage::Label(label) => match binding.repr {
            WasmRepr::None => {}
            _ if ctx.is_global(&label) => code.op(WasmOp::GlobalGet(Id::Name(label))),
            _ => code.op(WasmOp::LocalGet(Id::Name(label))),
        },
        VarStorage::Offset(index) => code.op(WasmOp::LocalGet(Id::Index(index))),
        VarStorage::Memory(addr) => match binding.repr {
            WasmRepr::None => {}
            WasmRepr::I32 => {
                code.op_comment(WasmOp::I32Const(addr as i32), format!("cell of '{}'", name));
                code.op(WasmOp::I32Load(MemArg::default()));
            }
            WasmRepr::F32 => {
                code.op_comment(WasmOp::I32Const(addr as i32), format!("cell of '{}'", name));
                code.op(WasmOp::F32Load(MemArg::default()));
            }
        },
        VarStorage::Id(value) => code.op(WasmOp::I32Const(value)),
        VarStorage::TableEntry { cell, .. } | VarStorage::FuncRef { cell, .. } => {
            code.op_comment(
                WasmOp::I32Const(cell as i32),
                format!("closure cell of '{}'", name),
            );
        }
    }
    Ok(())
}

/// Write the value on top of the stack into a variable's storage.
/// When `leave_value` is set the stored value is left on the stack, via
/// `local.tee` or a reload, matching the value of an assignment expression.
fn emit_variable_write(
    ctx: &mut CodegenContext,
    code: &mut Vec<WasmInst>,
    name: &str,
    leave_value: bool,
    expr: &TypedExpr,
) -> Result<(), CompileError> {
    let Some(binding) = ctx.lookup(name).cloned() else {
        return_unresolved_identifier_error!(
            format!("assignment to '{}' without a storage entry", name),
            (&expr.location).into(),
            { CompilationStage => "Wasm Lowering" }
        );
    };
    match binding.storage {
        VarStorage::Label(label) => match binding.repr {
            WasmRepr::None => {}
            _ if ctx.is_global(&label) => {
                code.op(WasmOp::GlobalSet(Id::Name(label.clone())));
                if leave_value {
                    code.op(WasmOp::GlobalGet(Id::Name(label)));
                }
            }
            _ => {
                if leave_value {
                    code.op(WasmOp::LocalTee(Id::Name(label)));
                } else {
                    code.op(WasmOp::LocalSet(Id::Name(label)));
                }
            }
        },
        VarStorage::Offset(index) => {
            if leave_value {
                code.op(WasmOp::LocalTee(Id::Index(index)));
            } else {
                code.op(WasmOp::LocalSet(Id::Index(index)));
            }
        }
        VarStorage::Memory(_) => {
            // Memory cells need the address below the value; the assignment
            // lowering pushes it before the right-hand side.
            return_storage_error!(
                format!("memory-backed variable '{}' written without an address", name),
                (&expr.location).into(),
                { ExpectedStorage => "Label", FoundStorage => "Memory" }
            );
        }
        other => {
            return_storage_error!(
                format!("variable '{}' is not assignable", name),
                (&expr.location).into(),
                { FoundStorage => other.kind_name() }
            );
        }
    }
    Ok(())
}

pub(crate) fn lower_expr(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    expr: &TypedExpr,
) -> Result<(), CompileError> {
    match &expr.kind {
        ExprKind::Unit => {}
        ExprKind::Int(value) => code.op(WasmOp::I32Const(*value)),
        ExprKind::Bool(value) => code.op(WasmOp::I32Const(*value as i32)),
        ExprKind::Float(value) => code.op(WasmOp::F32Const(*value)),
        ExprKind::Str(value) => aggregates::lower_string_literal(ctx, module, code, value)?,

        ExprKind::Variable(name) => emit_variable_read(ctx, code, name, expr)?,

        ExprKind::Arith(op, lhs, rhs) => lower_arith(ctx, module, func, code, *op, lhs, rhs)?,
        ExprKind::Sqrt(inner) => {
            lower_expr(ctx, module, func, code, inner)?;
            code.op(WasmOp::F32Sqrt);
        }
        ExprKind::Compare(op, lhs, rhs) => {
            lower_expr(ctx, module, func, code, lhs)?;
            lower_expr(ctx, module, func, code, rhs)?;
            let float = repr_of(ctx, &lhs.ty) == WasmRepr::F32;
            code.op(match (op, float) {
                (CompareOp::Eq, false) => WasmOp::I32Eq,
                (CompareOp::Less, false) => WasmOp::I32LtS,
                (CompareOp::LessEq, false) => WasmOp::I32LeS,
                (CompareOp::Greater, false) => WasmOp::I32GtS,
                (CompareOp::GreaterEq, false) => WasmOp::I32GeS,
                (CompareOp::Eq, true) => WasmOp::F32Eq,
                (CompareOp::Less, true) => WasmOp::F32Lt,
                (CompareOp::LessEq, true) => WasmOp::F32Le,
                (CompareOp::Greater, true) => WasmOp::F32Gt,
                (CompareOp::GreaterEq, true) => WasmOp::F32Ge,
            });
        }
        ExprKind::Logic(op, lhs, rhs) => {
            lower_expr(ctx, module, func, code, lhs)?;
            lower_expr(ctx, module, func, code, rhs)?;
            code.op(match op {
                LogicOp::And => WasmOp::I32And,
                LogicOp::Or => WasmOp::I32Or,
                LogicOp::Xor => WasmOp::I32Xor,
            });
        }
        ExprKind::Not(inner) => {
            lower_expr(ctx, module, func, code, inner)?;
            code.op(WasmOp::I32Eqz);
        }
        ExprKind::ShortAnd(lhs, rhs) => {
            control_flow::lower_short_circuit(ctx, module, func, code, lhs, rhs, true)?
        }
        ExprKind::ShortOr(lhs, rhs) => {
            control_flow::lower_short_circuit(ctx, module, func, code, lhs, rhs, false)?
        }

        ExprKind::If {
            condition,
            then_branch,
            else_branch,
        } => control_flow::lower_if(ctx, module, func, code, condition, then_branch, else_branch, &expr.ty)?,
        ExprKind::Seq(items) => {
            for (position, item) in items.iter().enumerate() {
                lower_expr(ctx, module, func, code, item)?;
                let is_last = position + 1 == items.len();
                if !is_last && repr_of(ctx, &item.ty) != WasmRepr::None {
                    code.op(WasmOp::Drop);
                }
            }
        }
        ExprKind::Ascription(inner) => lower_expr(ctx, module, func, code, inner)?,
        ExprKind::Assertion(inner) => control_flow::lower_assertion(ctx, module, func, code, inner)?,

        ExprKind::Print(inner) | ExprKind::PrintLn(inner) => {
            lower_print(ctx, module, func, code, inner, &expr.location)?
        }
        ExprKind::ReadInt => {
            let label = use_host(ctx, module, HostFunction::ReadInt)?;
            code.op(WasmOp::Call(label.to_string()));
        }
        ExprKind::ReadFloat => {
            let label = use_host(ctx, module, HostFunction::ReadFloat)?;
            code.op(WasmOp::Call(label.to_string()));
        }

        ExprKind::Let { name, init, scope } => {
            if functions::hoistable_lambda(ctx, init) {
                functions::lower_hoisted_binding(ctx, module, func, code, name, init, scope)?;
            } else {
                lower_let(ctx, module, func, code, name, init, scope)?;
            }
        }
        ExprKind::LetMut { name, init, scope } => {
            lower_let_mut(ctx, module, func, code, name, init, scope)?
        }
        ExprKind::LetRec { name, init, scope } => {
            functions::lower_let_rec(ctx, module, func, code, name, init, scope, &expr.location)?
        }
        ExprKind::Lambda { .. } => functions::lower_closure_value(ctx, module, func, code, expr)?,
        ExprKind::Application { callee, args } => {
            functions::lower_application(ctx, module, func, code, callee, args, &expr.location)?
        }

        ExprKind::StructCons(fields) => {
            aggregates::lower_struct_literal(ctx, module, func, code, fields)?
        }
        ExprKind::FieldSelect { target, field } => {
            aggregates::lower_field_select(ctx, module, func, code, target, field, &expr.location)?
        }
        ExprKind::ArrayCons { length, init } => {
            aggregates::lower_array_literal(ctx, module, func, code, length, init)?
        }
        ExprKind::ArrayLength(target) => {
            lower_expr(ctx, module, func, code, target)?;
            code.op_comment(WasmOp::I32Load(MemArg::offset(4)), "array length");
        }
        ExprKind::ArrayElem { target, index } => {
            aggregates::lower_array_access(ctx, module, func, code, target, index, &expr.location)?
        }
        ExprKind::ArraySlice { target, start, end } => {
            aggregates::lower_array_slice(ctx, module, func, code, target, start, end)?
        }

        ExprKind::UnionCons { label, value } => {
            aggregates::lower_union_literal(ctx, module, func, code, label, value)?
        }
        ExprKind::Match { scrutinee, cases } => {
            control_flow::lower_match(ctx, module, func, code, scrutinee, cases, expr)?
        }

        ExprKind::Assign { target, value } => {
            lower_assign(ctx, module, func, code, target, value, expr)?
        }
        ExprKind::CompoundAssign { op, name, value } => {
            lower_compound_assign(ctx, module, func, code, *op, name, value, expr)?
        }
        ExprKind::PreIncr(name) => lower_step(ctx, module, func, code, name, 1, true, expr)?,
        ExprKind::PreDecr(name) => lower_step(ctx, module, func, code, name, -1, true, expr)?,
        ExprKind::PostIncr(name) => lower_step(ctx, module, func, code, name, 1, false, expr)?,
        ExprKind::PostDecr(name) => lower_step(ctx, module, func, code, name, -1, false, expr)?,

        ExprKind::While { condition, body } => {
            control_flow::lower_while(ctx, module, func, code, condition, body)?
        }
        ExprKind::DoWhile { condition, body } => {
            control_flow::lower_do_while(ctx, module, func, code, condition, body)?
        }
        ExprKind::For {
            init,
            condition,
            update,
            body,
        } => control_flow::lower_for(ctx, module, func, code, init, condition, update, body)?,

        ExprKind::TypeAlias {
            name,
            definition,
            scope,
        } => {
            let previous = ctx.type_env.bind_alias(name.clone(), definition.clone());
            lower_expr(ctx, module, func, code, scope)?;
            ctx.type_env.restore_alias(name, previous);
        }

        ExprKind::Pointer(_) => {
            return_invalid_ast_error!(
                "pointer expressions cannot reach the Wasm backend",
                (&expr.location).into(),
                {
                    CompilationStage => "Wasm Lowering",
                    PrimarySuggestion => "pointers are an interpreter-internal construct"
                }
            );
        }
    }
    Ok(())
}

fn lower_arith(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    op: ArithOp,
    lhs: &TypedExpr,
    rhs: &TypedExpr,
) -> Result<(), CompileError> {
    lower_expr(ctx, module, func, code, lhs)?;
    lower_expr(ctx, module, func, code, rhs)?;
    let float = repr_of(ctx, &lhs.ty) == WasmRepr::F32;
    if float {
        code.op(match op {
            ArithOp::Add => WasmOp::F32Add,
            ArithOp::Sub => WasmOp::F32Sub,
            ArithOp::Mul => WasmOp::F32Mul,
            ArithOp::Div => WasmOp::F32Div,
            ArithOp::Rem => WasmOp::F32Sub, // unreachable: rejected by the type checker
            ArithOp::Min => WasmOp::F32Min,
            ArithOp::Max => WasmOp::F32Max,
        });
        return Ok(());
    }
    match op {
        ArithOp::Add => code.op(WasmOp::I32Add),
        ArithOp::Sub => code.op(WasmOp::I32Sub),
        ArithOp::Mul => code.op(WasmOp::I32Mul),
        ArithOp::Div | ArithOp::Rem => {
            // Signed division traps on zero; fail with the sentinel instead
            let divisor = func.fresh_local(ctx, "divisor", ValueType::I32);
            code.op(WasmOp::LocalTee(Id::name(&divisor)));
            code.op(WasmOp::I32Eqz);
            code.push(
                WasmOp::If {
                    result: None,
                    then_branch: check_failure_code(func, "division by zero"),
                    else_branch: Vec::new(),
                }
                .into(),
            );
            code.op(WasmOp::LocalGet(Id::name(&divisor)));
            code.op(if op == ArithOp::Div {
                WasmOp::I32DivS
            } else {
                WasmOp::I32RemS
            });
        }
        ArithOp::Min | ArithOp::Max => {
            // select keeps the smaller (or larger) of the two operands
            let right = func.fresh_local(ctx, "cmp_rhs", ValueType::I32);
            let left = func.fresh_local(ctx, "cmp_lhs", ValueType::I32);
            code.op(WasmOp::LocalSet(Id::name(&right)));
            code.op(WasmOp::LocalSet(Id::name(&left)));
            code.op(WasmOp::LocalGet(Id::name(&left)));
            code.op(WasmOp::LocalGet(Id::name(&right)));
            code.op(WasmOp::LocalGet(Id::name(&left)));
            code.op(WasmOp::LocalGet(Id::name(&right)));
            code.op(if op == ArithOp::Min {
                WasmOp::I32LtS
            } else {
                WasmOp::I32GtS
            });
            code.op(WasmOp::Select);
        }
    }
    Ok(())
}

fn lower_print(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    argument: &TypedExpr,
    location: &crate::compiler::ast_nodes::TextLocation,
) -> Result<(), CompileError> {
    let expanded = ctx.type_env.expand(&argument.ty).clone();
    match expanded {
        Type::Int | Type::Bool => {
            lower_expr(ctx, module, func, code, argument)?;
            let label = use_host(ctx, module, HostFunction::WriteInt)?;
            code.op(WasmOp::Call(label.to_string()));
        }
        Type::Float => {
            lower_expr(ctx, module, func, code, argument)?;
            let label = use_host(ctx, module, HostFunction::WriteFloat)?;
            code.op(WasmOp::Call(label.to_string()));
        }
        Type::Str => {
            lower_expr(ctx, module, func, code, argument)?;
            let header = func.fresh_local(ctx, "str_header", ValueType::I32);
            code.op(WasmOp::LocalTee(Id::name(&header)));
            code.op_comment(WasmOp::I32Load(MemArg::default()), "string data pointer");
            code.op(WasmOp::LocalGet(Id::name(&header)));
            code.op_comment(WasmOp::I32Load(MemArg::offset(4)), "string byte length");
            let label = use_host(ctx, module, HostFunction::WriteS)?;
            code.op(WasmOp::Call(label.to_string()));
        }
        other => {
            return_invalid_ast_error!(
                format!("print is not defined for values of type {}", other),
                location.into(),
                { CompilationStage => "Wasm Lowering" }
            );
        }
    }
    Ok(())
}

fn lower_let(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    name: &str,
    init: &TypedExpr,
    scope: &TypedExpr,
) -> Result<(), CompileError> {
    let repr = repr_of(ctx, &init.ty);
    lower_expr(ctx, module, func, code, init)?;
    let binding = match value_type_of(repr) {
        None => Binding {
            storage: VarStorage::Label(ctx.fresh_name(name)),
            repr,
        },
        Some(value_type) => {
            let local = func.fresh_local(ctx, name, value_type);
            code.op_comment(WasmOp::LocalSet(Id::name(&local)), format!("let {}", name));
            Binding {
                storage: VarStorage::Label(local),
                repr,
            }
        }
    };
    let previous = ctx.bind(name, binding);
    let result = lower_expr(ctx, module, func, code, scope);
    ctx.restore(name, previous);
    result
}

fn lower_let_mut(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    name: &str,
    init: &TypedExpr,
    scope: &TypedExpr,
) -> Result<(), CompileError> {
    let repr = repr_of(ctx, &init.ty);
    let binding = match value_type_of(repr) {
        None => {
            lower_expr(ctx, module, func, code, init)?;
            Binding {
                storage: VarStorage::Label(ctx.fresh_name(name)),
                repr,
            }
        }
        Some(value_type) if func.label == "_start" => {
            // Top-level mutables become mutable globals, reachable from
            // closures without capture
            let global = ctx.fresh_name(name);
            module.add_global(Global {
                label: global.clone(),
                ty: value_type,
                mutable: true,
                init: match value_type {
                    ValueType::I32 => GlobalInit::I32(0),
                    ValueType::F32 => GlobalInit::F32(0.0),
                },
            })?;
            ctx.globals.insert(global.clone());
            lower_expr(ctx, module, func, code, init)?;
            code.op_comment(
                WasmOp::GlobalSet(Id::name(&global)),
                format!("let mutable {}", name),
            );
            Binding {
                storage: VarStorage::Label(global),
                repr,
            }
        }
        Some(value_type) if captured_in_lambda(name, scope) => {
            // Captured inner mutables live in a one-cell record at a static
            // address so closures share the same backing store
            let addr = ctx.allocator.allocate_words(1)?;
            code.op_comment(
                WasmOp::I32Const(addr as i32),
                format!("cell for captured mutable {}", name),
            );
            lower_expr(ctx, module, func, code, init)?;
            code.op(match value_type {
                ValueType::I32 => WasmOp::I32Store(MemArg::default()),
                ValueType::F32 => WasmOp::F32Store(MemArg::default()),
            });
            Binding {
                storage: VarStorage::Memory(addr),
                repr,
            }
        }
        Some(value_type) => {
            lower_expr(ctx, module, func, code, init)?;
            let local = func.fresh_local(ctx, name, value_type);
            code.op_comment(
                WasmOp::LocalSet(Id::name(&local)),
                format!("let mutable {}", name),
            );
            Binding {
                storage: VarStorage::Label(local),
                repr,
            }
        }
    };
    let previous = ctx.bind(name, binding);
    let result = lower_expr(ctx, module, func, code, scope);
    ctx.restore(name, previous);
    result
}

fn lower_assign(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    target: &TypedExpr,
    value: &TypedExpr,
    expr: &TypedExpr,
) -> Result<(), CompileError> {
    let leave_value = repr_of(ctx, &expr.ty) != WasmRepr::None;
    match &target.kind {
        ExprKind::Variable(name) => {
            let binding = ctx.lookup(name).cloned();
            match binding.map(|b| b.storage) {
                Some(VarStorage::Memory(addr)) => {
                    let value_repr = repr_of(ctx, &value.ty);
                    code.op_comment(WasmOp::I32Const(addr as i32), format!("cell of '{}'", name));
                    lower_expr(ctx, module, func, code, value)?;
                    match value_repr {
                        WasmRepr::F32 => code.op(WasmOp::F32Store(MemArg::default())),
                        _ => code.op(WasmOp::I32Store(MemArg::default())),
                    }
                    if leave_value {
                        code.op(WasmOp::I32Const(addr as i32));
                        match value_repr {
                            WasmRepr::F32 => code.op(WasmOp::F32Load(MemArg::default())),
                            _ => code.op(WasmOp::I32Load(MemArg::default())),
                        }
                    }
                }
                Some(_) => {
                    lower_expr(ctx, module, func, code, value)?;
                    emit_variable_write(ctx, code, name, leave_value, expr)?;
                }
                None => {
                    return_unresolved_identifier_error!(
                        format!("assignment to unknown variable '{}'", name),
                        (&expr.location).into(),
                        { CompilationStage => "Wasm Lowering" }
                    );
                }
            }
        }
        ExprKind::FieldSelect {
            target: object,
            field,
        } => {
            let field_info = object
                .ty
                .struct_field(&ctx.type_env, field)
                .map(|(index, ty)| (index, ty.clone()));
            let Some((index, field_ty)) = field_info else {
                return_invalid_ast_error!(
                    format!("assignment to unknown struct field '{}'", field),
                    (&expr.location).into(),
                    { CompilationStage => "Wasm Lowering" }
                );
            };
            let field_repr = repr_of(ctx, &field_ty);
            lower_expr(ctx, module, func, code, object)?;
            match value_type_of(field_repr) {
                None => {
                    // Unit fields occupy a slot but store nothing
                    code.op(WasmOp::Drop);
                    lower_expr(ctx, module, func, code, value)?;
                }
                Some(value_type) => {
                    code.op_comment(
                        WasmOp::I32Const((index * 4) as i32),
                        format!("offset of field '{}'", field),
                    );
                    code.op(WasmOp::I32Add);
                    let addr = if leave_value {
                        let addr = func.fresh_local(ctx, "field_addr", ValueType::I32);
                        code.op(WasmOp::LocalTee(Id::name(&addr)));
                        Some(addr)
                    } else {
                        None
                    };
                    lower_expr(ctx, module, func, code, value)?;
                    code.op(match value_type {
                        ValueType::I32 => WasmOp::I32Store(MemArg::default()),
                        ValueType::F32 => WasmOp::F32Store(MemArg::default()),
                    });
                    if let Some(addr) = addr {
                        code.op(WasmOp::LocalGet(Id::name(&addr)));
                        code.op(match value_type {
                            ValueType::I32 => WasmOp::I32Load(MemArg::default()),
                            ValueType::F32 => WasmOp::F32Load(MemArg::default()),
                        });
                    }
                }
            }
        }
        ExprKind::ArrayElem {
            target: array,
            index,
        } => {
            aggregates::lower_array_store(
                ctx, module, func, code, array, index, value, leave_value, &expr.location,
            )?;
        }
        _ => {
            return_invalid_ast_error!(
                "assignment target must be a variable, field, or array element",
                (&expr.location).into(),
                { CompilationStage => "Wasm Lowering" }
            );
        }
    }
    Ok(())
}

fn lower_compound_assign(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    op: ArithOp,
    name: &str,
    value: &TypedExpr,
    expr: &TypedExpr,
) -> Result<(), CompileError> {
    let leave_value = repr_of(ctx, &expr.ty) != WasmRepr::None;
    let var_expr = TypedExpr::new(
        ExprKind::Variable(name.to_string()),
        value.ty.clone(),
        expr.location,
    );
    let binding = ctx.lookup(name).cloned();
    match binding.map(|b| b.storage) {
        Some(VarStorage::Memory(addr)) => {
            let repr = repr_of(ctx, &value.ty);
            code.op(WasmOp::I32Const(addr as i32));
            emit_variable_read(ctx, code, name, &var_expr)?;
            lower_arith_applied(ctx, module, func, code, op, repr, value)?;
            match repr {
                WasmRepr::F32 => code.op(WasmOp::F32Store(MemArg::default())),
                _ => code.op(WasmOp::I32Store(MemArg::default())),
            }
            if leave_value {
                code.op(WasmOp::I32Const(addr as i32));
                match repr {
                    WasmRepr::F32 => code.op(WasmOp::F32Load(MemArg::default())),
                    _ => code.op(WasmOp::I32Load(MemArg::default())),
                }
            }
        }
        Some(_) => {
            let repr = repr_of(ctx, &value.ty);
            emit_variable_read(ctx, code, name, &var_expr)?;
            lower_arith_applied(ctx, module, func, code, op, repr, value)?;
            emit_variable_write(ctx, code, name, leave_value, expr)?;
        }
        None => {
            return_unresolved_identifier_error!(
                format!("compound assignment to unknown variable '{}'", name),
                (&expr.location).into(),
                { CompilationStage => "Wasm Lowering" }
            );
        }
    }
    Ok(())
}

/// Lower `value` and apply `op` against whatever is already on the stack.
fn lower_arith_applied(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    op: ArithOp,
    repr: WasmRepr,
    value: &TypedExpr,
) -> Result<(), CompileError> {
    lower_expr(ctx, module, func, code, value)?;
    if repr == WasmRepr::F32 {
        code.op(match op {
            ArithOp::Add => WasmOp::F32Add,
            ArithOp::Sub => WasmOp::F32Sub,
            ArithOp::Mul => WasmOp::F32Mul,
            _ => WasmOp::F32Div,
        });
    } else {
        match op {
            ArithOp::Add => code.op(WasmOp::I32Add),
            ArithOp::Sub => code.op(WasmOp::I32Sub),
            ArithOp::Mul => code.op(WasmOp::I32Mul),
            ArithOp::Div | ArithOp::Rem => {
                let divisor = func.fresh_local(ctx, "divisor", ValueType::I32);
                code.op(WasmOp::LocalTee(Id::name(&divisor)));
                code.op(WasmOp::I32Eqz);
                code.push(
                    WasmOp::If {
                        result: None,
                        then_branch: check_failure_code(func, "division by zero"),
                        else_branch: Vec::new(),
                    }
                    .into(),
                );
                code.op(WasmOp::LocalGet(Id::name(&divisor)));
                code.op(if op == ArithOp::Div {
                    WasmOp::I32DivS
                } else {
                    WasmOp::I32RemS
                });
            }
            ArithOp::Min | ArithOp::Max => {
                // compound min/max assignment is not surface syntax
                code.op(WasmOp::Drop);
            }
        }
    }
    Ok(())
}

/// Pre/post increment and decrement. Pre-ops leave the updated value on the
/// stack via `local.tee`; post-ops update the storage and leave nothing.
fn lower_step(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    name: &str,
    delta: i32,
    leave_value: bool,
    expr: &TypedExpr,
) -> Result<(), CompileError> {
    let Some(binding) = ctx.lookup(name).cloned() else {
        return_unresolved_identifier_error!(
            format!("increment of unknown variable '{}'", name),
            (&expr.location).into(),
            { CompilationStage => "Wasm Lowering" }
        );
    };
    let var_expr = TypedExpr::new(
        ExprKind::Variable(name.to_string()),
        if binding.repr == WasmRepr::F32 {
            Type::Float
        } else {
            Type::Int
        },
        expr.location,
    );
    let step_ops = |code: &mut Vec<WasmInst>| {
        if binding.repr == WasmRepr::F32 {
            code.op(WasmOp::F32Const(delta as f32));
            code.op(WasmOp::F32Add);
        } else {
            code.op(WasmOp::I32Const(delta));
            code.op(WasmOp::I32Add);
        }
    };
    match &binding.storage {
        VarStorage::Memory(addr) => {
            code.op(WasmOp::I32Const(*addr as i32));
            emit_variable_read(ctx, code, name, &var_expr)?;
            step_ops(code);
            code.op(match binding.repr {
                WasmRepr::F32 => WasmOp::F32Store(MemArg::default()),
                _ => WasmOp::I32Store(MemArg::default()),
            });
            if leave_value {
                code.op(WasmOp::I32Const(*addr as i32));
                code.op(match binding.repr {
                    WasmRepr::F32 => WasmOp::F32Load(MemArg::default()),
                    _ => WasmOp::I32Load(MemArg::default()),
                });
            }
        }
        _ => {
            emit_variable_read(ctx, code, name, &var_expr)?;
            step_ops(code);
            emit_variable_write(ctx, code, name, leave_value, expr)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::config::CompilerConfig;

    fn read_ops(binding: Binding) -> Vec<WasmOp> {
        let mut ctx = CodegenContext::new(CompilerConfig::default());
        ctx.bind("v", binding);
        let mut code = Vec::new();
        let expr = TypedExpr::variable("v", Type::Int);
        emit_variable_read(&mut ctx, &mut code, "v", &expr).unwrap();
        code.into_iter().map(|inst| inst.op).collect()
    }

    #[test]
    fn label_storage_reads_a_named_local() {
        let ops = read_ops(Binding {
            storage: VarStorage::Label("v_0".to_string()),
            repr: WasmRepr::I32,
        });
        assert_eq!(ops, vec![WasmOp::LocalGet(Id::name("v_0"))]);
    }

    #[test]
    fn offset_storage_reads_a_local_by_index() {
        let ops = read_ops(Binding {
            storage: VarStorage::Offset(3),
            repr: WasmRepr::I32,
        });
        assert_eq!(ops, vec![WasmOp::LocalGet(Id::Index(3))]);
    }

    #[test]
    fn memory_storage_loads_from_its_cell() {
        let ops = read_ops(Binding {
            storage: VarStorage::Memory(16),
            repr: WasmRepr::I32,
        });
        assert_eq!(
            ops,
            vec![WasmOp::I32Const(16), WasmOp::I32Load(MemArg::default())]
        );
    }

    #[test]
    fn id_storage_is_a_compile_time_constant() {
        let ops = read_ops(Binding {
            storage: VarStorage::Id(7),
            repr: WasmRepr::I32,
        });
        assert_eq!(ops, vec![WasmOp::I32Const(7)]);
    }

    #[test]
    fn closure_storage_pushes_the_cell_address() {
        let ops = read_ops(Binding {
            storage: VarStorage::TableEntry {
                label: "f_0".to_string(),
                index: 2,
                cell: 24,
            },
            repr: WasmRepr::I32,
        });
        assert_eq!(ops, vec![WasmOp::I32Const(24)]);
    }

    #[test]
    fn unresolved_variables_are_rejected() {
        let mut ctx = CodegenContext::new(CompilerConfig::default());
        let mut code = Vec::new();
        let expr = TypedExpr::variable("ghost", Type::Int);
        let err = emit_variable_read(&mut ctx, &mut code, "ghost", &expr).unwrap_err();
        assert_eq!(
            err.error_type,
            crate::compiler::compiler_errors::ErrorType::UnresolvedIdentifier
        );
    }
}
