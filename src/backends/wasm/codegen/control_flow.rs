//! Structured control flow lowering.
//!
//! Wasm only has structured control, so every source construct maps onto
//! `block`/`loop`/`if` nests: loops become a `block $exit (loop $begin …)`
//! pair, short-circuit connectives become an `if` that only evaluates the
//! right-hand side when needed, and union matches become a chain of tag
//! tests with the unmatched case falling through to the failure idiom.

use crate::backends::wasm::codegen::context::{Binding, CodegenContext, FunctionBuilder, VarStorage};
use crate::backends::wasm::codegen::expressions::{
    check_failure_code, lower_expr, repr_of, value_type_of,
};
use crate::backends::wasm::instructions::{Id, InstSink, MemArg, ValueType, WasmInst, WasmOp};
use crate::backends::wasm::wasm_module::WasmModule;
use crate::compiler::ast_nodes::{MatchCase, TypedExpr};
use crate::compiler::compiler_errors::CompileError;
use crate::compiler::datatypes::{Type, WasmRepr};

pub(crate) fn lower_if(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    condition: &TypedExpr,
    then_branch: &TypedExpr,
    else_branch: &TypedExpr,
    result_ty: &Type,
) -> Result<(), CompileError> {
    lower_expr(ctx, module, func, code, condition)?;
    let result = value_type_of(repr_of(ctx, result_ty));

    let mut then_code = Vec::new();
    lower_expr(ctx, module, func, &mut then_code, then_branch)?;
    let mut else_code = Vec::new();
    lower_expr(ctx, module, func, &mut else_code, else_branch)?;

    code.push(
        WasmOp::If {
            result,
            then_branch: then_code,
            else_branch: else_code,
        }
        .into(),
    );
    Ok(())
}

/// `a && b` evaluates `b` only when `a` is true; `a || b` only when `a` is
/// false. Both yield a boolean on the stack.
pub(crate) fn lower_short_circuit(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    lhs: &TypedExpr,
    rhs: &TypedExpr,
    is_and: bool,
) -> Result<(), CompileError> {
    lower_expr(ctx, module, func, code, lhs)?;
    let mut rhs_code = Vec::new();
    lower_expr(ctx, module, func, &mut rhs_code, rhs)?;

    let (then_branch, else_branch) = if is_and {
        (rhs_code, vec![WasmOp::I32Const(0).into()])
    } else {
        (vec![WasmOp::I32Const(1).into()], rhs_code)
    };
    code.push(
        WasmOp::If {
            result: Some(ValueType::I32),
            then_branch,
            else_branch,
        }
        .into(),
    );
    Ok(())
}

/// An assertion is an `if` that is empty on success and runs the failure
/// idiom when the condition is false.
pub(crate) fn lower_assertion(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    condition: &TypedExpr,
) -> Result<(), CompileError> {
    lower_expr(ctx, module, func, code, condition)?;
    code.push(
        WasmOp::If {
            result: None,
            then_branch: Vec::new(),
            else_branch: check_failure_code(func, "assertion failed"),
        }
        .into(),
    );
    Ok(())
}

pub(crate) fn lower_while(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    condition: &TypedExpr,
    body: &TypedExpr,
) -> Result<(), CompileError> {
    let exit = ctx.fresh_name("loop_exit");
    let begin = ctx.fresh_name("loop_begin");

    let mut loop_body = Vec::new();
    lower_expr(ctx, module, func, &mut loop_body, condition)?;
    loop_body.op(WasmOp::I32Eqz);
    loop_body.op_comment(WasmOp::BrIf(Id::name(&exit)), "loop condition");
    lower_expr(ctx, module, func, &mut loop_body, body)?;
    if repr_of(ctx, &body.ty) != WasmRepr::None {
        loop_body.op(WasmOp::Drop);
    }
    loop_body.op(WasmOp::Br(Id::name(&begin)));

    code.push(
        WasmOp::Block {
            label: Some(exit),
            result: None,
            body: vec![
                WasmOp::Loop {
                    label: Some(begin),
                    result: None,
                    body: loop_body,
                }
                .into(),
            ],
        }
        .into(),
    );
    Ok(())
}

/// `do b while c` runs the body once, then behaves exactly like the
/// corresponding `while`; the body is lowered twice.
pub(crate) fn lower_do_while(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    condition: &TypedExpr,
    body: &TypedExpr,
) -> Result<(), CompileError> {
    lower_expr(ctx, module, func, code, body)?;
    if repr_of(ctx, &body.ty) != WasmRepr::None {
        code.op(WasmOp::Drop);
    }
    lower_while(ctx, module, func, code, condition, body)
}

/// `for(init; c; u) b` is `init` followed by `while c { b; u }`.
pub(crate) fn lower_for(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    init: &TypedExpr,
    condition: &TypedExpr,
    update: &TypedExpr,
    body: &TypedExpr,
) -> Result<(), CompileError> {
    lower_expr(ctx, module, func, code, init)?;
    if repr_of(ctx, &init.ty) != WasmRepr::None {
        code.op(WasmOp::Drop);
    }

    let exit = ctx.fresh_name("loop_exit");
    let begin = ctx.fresh_name("loop_begin");

    let mut loop_body = Vec::new();
    lower_expr(ctx, module, func, &mut loop_body, condition)?;
    loop_body.op(WasmOp::I32Eqz);
    loop_body.op_comment(WasmOp::BrIf(Id::name(&exit)), "loop condition");
    lower_expr(ctx, module, func, &mut loop_body, body)?;
    if repr_of(ctx, &body.ty) != WasmRepr::None {
        loop_body.op(WasmOp::Drop);
    }
    lower_expr(ctx, module, func, &mut loop_body, update)?;
    if repr_of(ctx, &update.ty) != WasmRepr::None {
        loop_body.op(WasmOp::Drop);
    }
    loop_body.op(WasmOp::Br(Id::name(&begin)));

    code.push(
        WasmOp::Block {
            label: Some(exit),
            result: None,
            body: vec![
                WasmOp::Loop {
                    label: Some(begin),
                    result: None,
                    body: loop_body,
                }
                .into(),
            ],
        }
        .into(),
    );
    Ok(())
}

/// A union match is a chain of `if` tests on the tag word. Each arm binds a
/// fresh local to the payload word before lowering its body; an unmatched
/// scrutinee runs the failure idiom.
pub(crate) fn lower_match(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    scrutinee: &TypedExpr,
    cases: &[MatchCase],
    expr: &TypedExpr,
) -> Result<(), CompileError> {
    let result = value_type_of(repr_of(ctx, &expr.ty));

    lower_expr(ctx, module, func, code, scrutinee)?;
    let target = func.fresh_local(ctx, "match_target", ValueType::I32);
    code.op_comment(
        WasmOp::LocalSet(Id::name(&target)),
        "union value under scrutiny",
    );

    // Build the chain inside-out: the innermost else is the unmatched case
    let mut chain = check_failure_code(func, "unmatched union value");
    for case in cases.iter().rev() {
        let payload_ty = scrutinee
            .ty
            .union_payload(&ctx.type_env, &case.label)
            .cloned()
            .unwrap_or(Type::Unit);
        let payload_repr = repr_of(ctx, &payload_ty);
        let tag = ctx.tags.intern(&case.label).as_u32() as i32;

        let mut arm = Vec::new();
        let binding = match value_type_of(payload_repr) {
            Some(value_type) => {
                let payload = func.fresh_local(ctx, &case.var, value_type);
                arm.op(WasmOp::LocalGet(Id::name(&target)));
                arm.op_comment(
                    match value_type {
                        ValueType::I32 => WasmOp::I32Load(MemArg::offset(4)),
                        ValueType::F32 => WasmOp::F32Load(MemArg::offset(4)),
                    },
                    format!("payload of '{}'", case.label),
                );
                arm.op(WasmOp::LocalSet(Id::name(&payload)));
                Binding {
                    storage: VarStorage::Label(payload),
                    repr: payload_repr,
                }
            }
            None => Binding {
                storage: VarStorage::Label(ctx.fresh_name(&case.var)),
                repr: WasmRepr::None,
            },
        };

        let previous = ctx.bind(&case.var, binding);
        let lowered = lower_expr(ctx, module, func, &mut arm, &case.body);
        ctx.restore(&case.var, previous);
        lowered?;

        let mut test = Vec::new();
        test.op(WasmOp::LocalGet(Id::name(&target)));
        test.op_comment(WasmOp::I32Load(MemArg::default()), "union tag");
        test.op_comment(WasmOp::I32Const(tag), format!("tag of '{}'", case.label));
        test.op(WasmOp::I32Eq);
        test.push(
            WasmOp::If {
                result,
                then_branch: arm,
                else_branch: chain,
            }
            .into(),
        );
        chain = test;
    }
    code.extend(chain);
    Ok(())
}
