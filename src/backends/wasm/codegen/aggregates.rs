//! Heap-shaped values: strings, structs, arrays, unions.
//!
//! String literals are laid out entirely at compile time: payload bytes and
//! a two-word `(pointer, byte_length)` header become data segments at
//! allocator-assigned addresses, so a literal lowers to one `i32.const`.
//! Structs and arrays are runtime-sized and call `malloc`; arrays carry a
//! `(data_pointer, length)` header and every access is bounds-checked
//! against the length word.

use crate::backends::wasm::codegen::context::{CodegenContext, FunctionBuilder};
use crate::backends::wasm::codegen::expressions::{
    check_failure_code, lower_expr, repr_of, use_host, value_type_of,
};
use crate::backends::wasm::host_functions::HostFunction;
use crate::backends::wasm::instructions::{Id, InstSink, MemArg, ValueType, WasmInst, WasmOp};
use crate::backends::wasm::wasm_module::WasmModule;
use crate::compiler::ast_nodes::{TextLocation, TypedExpr};
use crate::compiler::compiler_errors::CompileError;
use crate::return_invalid_ast_error;

/// Push the header address of a string literal, laying the literal out in
/// static memory on first use. Identical literals share one layout.
pub(crate) fn lower_string_literal(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    code: &mut Vec<WasmInst>,
    value: &str,
) -> Result<(), CompileError> {
    let existing = ctx.string_headers.get(value).copied();
    let header = match existing {
        Some(header) => header,
        None => {
            let bytes = value.as_bytes();
            let length = bytes.len() as u32;
            // Empty literals keep a null payload pointer; nothing reads it
            let payload = if length > 0 {
                // Pad to the allocator's word stride so the header stays aligned
                let payload = ctx.allocator.allocate(length.next_multiple_of(4))?;
                module.add_data_segment(
                    payload,
                    bytes.to_vec(),
                    Some(format!("bytes of {}", preview(value))),
                );
                payload
            } else {
                0
            };
            let header = ctx.allocator.allocate_words(2)?;
            let mut header_bytes = Vec::with_capacity(8);
            header_bytes.extend_from_slice(&payload.to_le_bytes());
            header_bytes.extend_from_slice(&length.to_le_bytes());
            module.add_data_segment(
                header,
                header_bytes,
                Some("string header (data pointer, byte length)".to_string()),
            );
            ctx.string_headers.insert(value.to_string(), header);
            header
        }
    };
    code.op_comment(
        WasmOp::I32Const(header as i32),
        format!("string literal {}", preview(value)),
    );
    Ok(())
}

fn preview(value: &str) -> String {
    let mut shortened: String = value.chars().take(24).collect();
    if shortened.len() < value.len() {
        shortened.push('…');
    }
    format!("{:?}", shortened)
}

/// A struct literal: `malloc(4 × field_count)`, then one store per field at
/// its declaration offset. Unit fields occupy a slot but store nothing.
pub(crate) fn lower_struct_literal(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    fields: &[(String, TypedExpr)],
) -> Result<(), CompileError> {
    let malloc = use_host(ctx, module, HostFunction::Malloc)?;
    code.op_comment(
        WasmOp::I32Const((fields.len() * 4) as i32),
        "struct size in bytes",
    );
    code.op(WasmOp::Call(malloc.to_string()));
    let base = func.fresh_local(ctx, "struct_base", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&base)));

    for (slot, (field, value)) in fields.iter().enumerate() {
        match value_type_of(repr_of(ctx, &value.ty)) {
            Some(value_type) => {
                code.op(WasmOp::LocalGet(Id::name(&base)));
                code.op_comment(
                    WasmOp::I32Const((slot * 4) as i32),
                    format!("offset of field '{}'", field),
                );
                code.op(WasmOp::I32Add);
                lower_expr(ctx, module, func, code, value)?;
                code.op(match value_type {
                    ValueType::I32 => WasmOp::I32Store(MemArg::default()),
                    ValueType::F32 => WasmOp::F32Store(MemArg::default()),
                });
            }
            // Unit field: evaluate for effects only
            None => lower_expr(ctx, module, func, code, value)?,
        }
    }
    code.op(WasmOp::LocalGet(Id::name(&base)));
    Ok(())
}

/// Field selection: base + declaration offset, then a typed load.
pub(crate) fn lower_field_select(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    target: &TypedExpr,
    field: &str,
    location: &TextLocation,
) -> Result<(), CompileError> {
    let field_info = target
        .ty
        .struct_field(&ctx.type_env, field)
        .map(|(index, ty)| (index, ty.clone()));
    let Some((index, field_ty)) = field_info else {
        return_invalid_ast_error!(
            format!("selection of unknown struct field '{}'", field),
            location.into(),
            { CompilationStage => "Wasm Lowering" }
        );
    };
    lower_expr(ctx, module, func, code, target)?;
    match value_type_of(repr_of(ctx, &field_ty)) {
        // Unit-typed fields emit nothing
        None => code.op(WasmOp::Drop),
        Some(value_type) => {
            code.op_comment(
                WasmOp::I32Const((index * 4) as i32),
                format!("offset of field '{}'", field),
            );
            code.op(WasmOp::I32Add);
            code.op(match value_type {
                ValueType::I32 => WasmOp::I32Load(MemArg::default()),
                ValueType::F32 => WasmOp::F32Load(MemArg::default()),
            });
        }
    }
    Ok(())
}

/// `array(length, init)`: guard `length ≥ 1`, allocate the two-word header
/// and the data region, then fill every element with the init value.
pub(crate) fn lower_array_literal(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    length: &TypedExpr,
    init: &TypedExpr,
) -> Result<(), CompileError> {
    let malloc = use_host(ctx, module, HostFunction::Malloc)?;

    lower_expr(ctx, module, func, code, length)?;
    let len = func.fresh_local(ctx, "arr_len", ValueType::I32);
    code.op(WasmOp::LocalTee(Id::name(&len)));
    code.op(WasmOp::I32Const(1));
    code.op(WasmOp::I32LtS);
    code.push(
        WasmOp::If {
            result: None,
            then_branch: check_failure_code(func, "array length must be at least 1"),
            else_branch: Vec::new(),
        }
        .into(),
    );

    code.op_comment(WasmOp::I32Const(8), "array header size");
    code.op(WasmOp::Call(malloc.to_string()));
    let header = func.fresh_local(ctx, "arr_header", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&header)));

    code.op(WasmOp::LocalGet(Id::name(&len)));
    code.op(WasmOp::I32Const(4));
    code.op(WasmOp::I32Mul);
    code.op_comment(WasmOp::Call(malloc.to_string()), "array data region");
    let data = func.fresh_local(ctx, "arr_data", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&data)));

    code.op(WasmOp::LocalGet(Id::name(&header)));
    code.op(WasmOp::LocalGet(Id::name(&data)));
    code.op_comment(WasmOp::I32Store(MemArg::default()), "data pointer");
    code.op(WasmOp::LocalGet(Id::name(&header)));
    code.op(WasmOp::LocalGet(Id::name(&len)));
    code.op_comment(WasmOp::I32Store(MemArg::offset(4)), "length");

    match value_type_of(repr_of(ctx, &init.ty)) {
        Some(value_type) => {
            lower_expr(ctx, module, func, code, init)?;
            let fill = func.fresh_local(ctx, "arr_fill", value_type);
            code.op(WasmOp::LocalSet(Id::name(&fill)));

            let counter = func.fresh_local(ctx, "arr_index", ValueType::I32);
            code.op(WasmOp::I32Const(0));
            code.op(WasmOp::LocalSet(Id::name(&counter)));

            let exit = ctx.fresh_name("fill_exit");
            let begin = ctx.fresh_name("fill_begin");
            let mut fill_loop = Vec::new();
            fill_loop.op(WasmOp::LocalGet(Id::name(&counter)));
            fill_loop.op(WasmOp::LocalGet(Id::name(&len)));
            fill_loop.op(WasmOp::I32GeS);
            fill_loop.op(WasmOp::BrIf(Id::name(&exit)));
            fill_loop.op(WasmOp::LocalGet(Id::name(&data)));
            fill_loop.op(WasmOp::LocalGet(Id::name(&counter)));
            fill_loop.op(WasmOp::I32Const(4));
            fill_loop.op(WasmOp::I32Mul);
            fill_loop.op(WasmOp::I32Add);
            fill_loop.op(WasmOp::LocalGet(Id::name(&fill)));
            fill_loop.op(match value_type {
                ValueType::I32 => WasmOp::I32Store(MemArg::default()),
                ValueType::F32 => WasmOp::F32Store(MemArg::default()),
            });
            fill_loop.op(WasmOp::LocalGet(Id::name(&counter)));
            fill_loop.op(WasmOp::I32Const(1));
            fill_loop.op(WasmOp::I32Add);
            fill_loop.op(WasmOp::LocalSet(Id::name(&counter)));
            fill_loop.op(WasmOp::Br(Id::name(&begin)));

            code.push(
                WasmOp::Block {
                    label: Some(exit),
                    result: None,
                    body: vec![
                        WasmOp::Loop {
                            label: Some(begin),
                            result: None,
                            body: fill_loop,
                        }
                        .into(),
                    ],
                }
                .into(),
            );
        }
        // Unit elements: evaluate the initializer once for effects
        None => lower_expr(ctx, module, func, code, init)?,
    }

    code.op_comment(WasmOp::LocalGet(Id::name(&header)), "array value");
    Ok(())
}

/// Bounds check shared by element loads and stores:
/// fail unless `0 ≤ index < length`.
fn emit_bounds_check(
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    header: &str,
    index: &str,
) {
    code.op(WasmOp::LocalGet(Id::name(index)));
    code.op(WasmOp::I32Const(0));
    code.op(WasmOp::I32LtS);
    code.push(
        WasmOp::If {
            result: None,
            then_branch: check_failure_code(func, "array index below zero"),
            else_branch: Vec::new(),
        }
        .into(),
    );
    code.op(WasmOp::LocalGet(Id::name(index)));
    code.op(WasmOp::LocalGet(Id::name(header)));
    code.op_comment(WasmOp::I32Load(MemArg::offset(4)), "array length");
    code.op(WasmOp::I32GeS);
    code.push(
        WasmOp::If {
            result: None,
            then_branch: check_failure_code(func, "array index out of bounds"),
            else_branch: Vec::new(),
        }
        .into(),
    );
}

/// Push the address of element `index`: `data_pointer + index × 4`.
fn emit_element_address(code: &mut Vec<WasmInst>, header: &str, index: &str) {
    code.op(WasmOp::LocalGet(Id::name(header)));
    code.op_comment(WasmOp::I32Load(MemArg::default()), "data pointer");
    code.op(WasmOp::LocalGet(Id::name(index)));
    code.op(WasmOp::I32Const(4));
    code.op(WasmOp::I32Mul);
    code.op(WasmOp::I32Add);
}

pub(crate) fn lower_array_access(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    target: &TypedExpr,
    index: &TypedExpr,
    location: &TextLocation,
) -> Result<(), CompileError> {
    let element_ty = target.ty.array_element(&ctx.type_env).cloned();
    let Some(element_ty) = element_ty else {
        return_invalid_ast_error!(
            format!("indexed access into a value of type {}", target.ty),
            location.into(),
            { CompilationStage => "Wasm Lowering" }
        );
    };

    lower_expr(ctx, module, func, code, target)?;
    let header = func.fresh_local(ctx, "arr_header", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&header)));
    lower_expr(ctx, module, func, code, index)?;
    let idx = func.fresh_local(ctx, "arr_index", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&idx)));

    emit_bounds_check(func, code, &header, &idx);

    if let Some(value_type) = value_type_of(repr_of(ctx, &element_ty)) {
        emit_element_address(code, &header, &idx);
        code.op(match value_type {
            ValueType::I32 => WasmOp::I32Load(MemArg::default()),
            ValueType::F32 => WasmOp::F32Load(MemArg::default()),
        });
    }
    Ok(())
}

/// Assignment to an element: same bounds check, then a typed store. When the
/// assignment's value is needed, the element address is kept in a local and
/// the stored value reloaded.
pub(crate) fn lower_array_store(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    target: &TypedExpr,
    index: &TypedExpr,
    value: &TypedExpr,
    leave_value: bool,
    location: &TextLocation,
) -> Result<(), CompileError> {
    let element_ty = target.ty.array_element(&ctx.type_env).cloned();
    let Some(element_ty) = element_ty else {
        return_invalid_ast_error!(
            format!("indexed assignment into a value of type {}", target.ty),
            location.into(),
            { CompilationStage => "Wasm Lowering" }
        );
    };

    lower_expr(ctx, module, func, code, target)?;
    let header = func.fresh_local(ctx, "arr_header", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&header)));
    lower_expr(ctx, module, func, code, index)?;
    let idx = func.fresh_local(ctx, "arr_index", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&idx)));

    emit_bounds_check(func, code, &header, &idx);

    match value_type_of(repr_of(ctx, &element_ty)) {
        Some(value_type) => {
            emit_element_address(code, &header, &idx);
            let address = if leave_value {
                let address = func.fresh_local(ctx, "elem_addr", ValueType::I32);
                code.op(WasmOp::LocalTee(Id::name(&address)));
                Some(address)
            } else {
                None
            };
            lower_expr(ctx, module, func, code, value)?;
            code.op(match value_type {
                ValueType::I32 => WasmOp::I32Store(MemArg::default()),
                ValueType::F32 => WasmOp::F32Store(MemArg::default()),
            });
            if let Some(address) = address {
                code.op(WasmOp::LocalGet(Id::name(&address)));
                code.op(match value_type {
                    ValueType::I32 => WasmOp::I32Load(MemArg::default()),
                    ValueType::F32 => WasmOp::F32Load(MemArg::default()),
                });
            }
        }
        None => lower_expr(ctx, module, func, code, value)?,
    }
    Ok(())
}

/// Slicing shares the original data region: the new header points at
/// `data + start × 4` with length `end − start`. Invalid ranges fail with
/// the sentinel.
pub(crate) fn lower_array_slice(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    target: &TypedExpr,
    start: &TypedExpr,
    end: &TypedExpr,
) -> Result<(), CompileError> {
    let malloc = use_host(ctx, module, HostFunction::Malloc)?;

    lower_expr(ctx, module, func, code, target)?;
    let header = func.fresh_local(ctx, "arr_header", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&header)));
    lower_expr(ctx, module, func, code, start)?;
    let from = func.fresh_local(ctx, "slice_start", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&from)));
    lower_expr(ctx, module, func, code, end)?;
    let to = func.fresh_local(ctx, "slice_end", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&to)));

    code.op(WasmOp::LocalGet(Id::name(&from)));
    code.op(WasmOp::I32Const(0));
    code.op(WasmOp::I32LtS);
    code.push(
        WasmOp::If {
            result: None,
            then_branch: check_failure_code(func, "slice start below zero"),
            else_branch: Vec::new(),
        }
        .into(),
    );
    code.op(WasmOp::LocalGet(Id::name(&to)));
    code.op(WasmOp::LocalGet(Id::name(&header)));
    code.op_comment(WasmOp::I32Load(MemArg::offset(4)), "array length");
    code.op(WasmOp::I32GtS);
    code.push(
        WasmOp::If {
            result: None,
            then_branch: check_failure_code(func, "slice end out of bounds"),
            else_branch: Vec::new(),
        }
        .into(),
    );
    code.op(WasmOp::LocalGet(Id::name(&to)));
    code.op(WasmOp::LocalGet(Id::name(&from)));
    code.op(WasmOp::I32LeS);
    code.push(
        WasmOp::If {
            result: None,
            then_branch: check_failure_code(func, "slice range is empty"),
            else_branch: Vec::new(),
        }
        .into(),
    );

    code.op_comment(WasmOp::I32Const(8), "slice header size");
    code.op(WasmOp::Call(malloc.to_string()));
    let slice = func.fresh_local(ctx, "slice_header", ValueType::I32);
    code.op(WasmOp::LocalSet(Id::name(&slice)));

    code.op(WasmOp::LocalGet(Id::name(&slice)));
    code.op(WasmOp::LocalGet(Id::name(&header)));
    code.op(WasmOp::I32Load(MemArg::default()));
    code.op(WasmOp::LocalGet(Id::name(&from)));
    code.op(WasmOp::I32Const(4));
    code.op(WasmOp::I32Mul);
    code.op(WasmOp::I32Add);
    code.op_comment(WasmOp::I32Store(MemArg::default()), "shared data pointer");

    code.op(WasmOp::LocalGet(Id::name(&slice)));
    code.op(WasmOp::LocalGet(Id::name(&to)));
    code.op(WasmOp::LocalGet(Id::name(&from)));
    code.op(WasmOp::I32Sub);
    code.op_comment(WasmOp::I32Store(MemArg::offset(4)), "slice length");

    code.op_comment(WasmOp::LocalGet(Id::name(&slice)), "slice value");
    Ok(())
}

/// A union value is a two-word `(tag, payload)` record; the tag is the
/// interned id of the constructor label.
pub(crate) fn lower_union_literal(
    ctx: &mut CodegenContext,
    module: &mut WasmModule,
    func: &mut FunctionBuilder,
    code: &mut Vec<WasmInst>,
    label: &str,
    value: &TypedExpr,
) -> Result<(), CompileError> {
    let malloc = use_host(ctx, module, HostFunction::Malloc)?;
    let tag = ctx.tags.intern(label).as_u32() as i32;

    code.op_comment(WasmOp::I32Const(8), "union record size");
    code.op(WasmOp::Call(malloc.to_string()));
    let record = func.fresh_local(ctx, "union_record", ValueType::I32);
    code.op(WasmOp::LocalTee(Id::name(&record)));
    code.op_comment(WasmOp::I32Const(tag), format!("tag of '{}'", label));
    code.op(WasmOp::I32Store(MemArg::default()));

    match value_type_of(repr_of(ctx, &value.ty)) {
        Some(value_type) => {
            code.op(WasmOp::LocalGet(Id::name(&record)));
            lower_expr(ctx, module, func, code, value)?;
            code.op(match value_type {
                ValueType::I32 => WasmOp::I32Store(MemArg::offset(4)),
                ValueType::F32 => WasmOp::F32Store(MemArg::offset(4)),
            });
        }
        None => lower_expr(ctx, module, func, code, value)?,
    }
    code.op_comment(WasmOp::LocalGet(Id::name(&record)), "union value");
    Ok(())
}
