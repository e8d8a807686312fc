//! Deterministic WAT pretty-printer.
//!
//! Module components are always emitted in the same order: types, imports,
//! memory, globals, table, element segments, functions (with their locals
//! inline), data segments, exports. Instruction comments print as `;; …` on
//! the same line.
//!
//! Two writing styles are supported. *Linear* prints one instruction per
//! line with `block`/`loop`/`if … else … end` keywords; *folded* prints
//! S-expressions where the children of a control instruction appear as its
//! operands. Both parse to the same binary module.

use crate::backends::wasm::instructions::{ValueType, WasmInst, WasmOp};
use crate::backends::wasm::wasm_module::{
    DataSegment, Export, ExportKind, FuncType, Global, GlobalInit, Import, ImportKind, WasmFunction,
    WasmModule,
};
use crate::compiler::config::WritingStyle;
use crate::wat_log;

const INDENT: &str = "  ";

/// Serialize a module to WAT text in the requested style.
pub fn emit_wat(module: &WasmModule, style: WritingStyle) -> String {
    let mut out = String::new();
    out.push_str("(module\n");

    for func_type in &module.types {
        write_type(&mut out, func_type);
    }
    for import in &module.imports {
        write_import(&mut out, import);
    }
    if let Some(memory) = &module.memory {
        match memory.max_pages {
            Some(max) => push_line(&mut out, 1, &format!("(memory {} {})", memory.min_pages, max)),
            None => push_line(&mut out, 1, &format!("(memory {})", memory.min_pages)),
        }
    }
    for global in &module.globals {
        write_global(&mut out, global);
    }
    if !module.table_entries.is_empty() {
        push_line(
            &mut out,
            1,
            &format!("(table {} funcref)", module.table_entries.len()),
        );
        let labels: Vec<String> = module
            .table_entries
            .iter()
            .map(|label| format!("${}", label))
            .collect();
        push_line(
            &mut out,
            1,
            &format!("(elem (i32.const 0) {})", labels.join(" ")),
        );
    }
    for function in &module.functions {
        write_function(&mut out, function, style);
    }
    for segment in &module.data_segments {
        write_data_segment(&mut out, segment);
    }
    for export in &module.exports {
        write_export(&mut out, export);
    }

    out.push_str(")\n");
    wat_log!("{}", out);
    out
}

fn push_line(out: &mut String, depth: usize, text: &str) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push_str(text);
    out.push('\n');
}

/// Comments must stay on one line to remain comments.
fn sanitize_comment(comment: &str) -> String {
    comment.replace(['\n', '\r'], " ")
}

fn write_type(out: &mut String, func_type: &FuncType) {
    let mut text = format!("(type ${} (func", func_type.name);
    if !func_type.params.is_empty() {
        text.push_str(" (param");
        for param in &func_type.params {
            text.push(' ');
            text.push_str(&param.to_string());
        }
        text.push(')');
    }
    if !func_type.results.is_empty() {
        text.push_str(" (result");
        for result in &func_type.results {
            text.push(' ');
            text.push_str(&result.to_string());
        }
        text.push(')');
    }
    text.push_str("))");
    push_line(out, 1, &text);
}

fn write_import(out: &mut String, import: &Import) {
    let desc = match &import.kind {
        ImportKind::Func {
            label,
            params,
            results,
        } => {
            let mut text = format!("(func ${}", label);
            if !params.is_empty() {
                text.push_str(" (param");
                for param in params {
                    text.push(' ');
                    text.push_str(&param.to_string());
                }
                text.push(')');
            }
            if !results.is_empty() {
                text.push_str(" (result");
                for result in results {
                    text.push(' ');
                    text.push_str(&result.to_string());
                }
                text.push(')');
            }
            text.push(')');
            text
        }
        ImportKind::Table { min } => format!("(table {} funcref)", min),
        ImportKind::Memory {
            min_pages,
            max_pages,
        } => match max_pages {
            Some(max) => format!("(memory {} {})", min_pages, max),
            None => format!("(memory {})", min_pages),
        },
        ImportKind::Global { label, ty, mutable } => {
            if *mutable {
                format!("(global ${} (mut {}))", label, ty)
            } else {
                format!("(global ${} {})", label, ty)
            }
        }
    };
    push_line(
        out,
        1,
        &format!("(import {:?} {:?} {})", import.module, import.name, desc),
    );
}

fn write_global(out: &mut String, global: &Global) {
    let init = match global.init {
        GlobalInit::I32(value) => format!("(i32.const {})", value),
        GlobalInit::F32(value) => format!("(f32.const {})", render_f32_init(value)),
    };
    let ty = if global.mutable {
        format!("(mut {})", global.ty)
    } else {
        global.ty.to_string()
    };
    push_line(
        out,
        1,
        &format!("(global ${} {} {})", global.label, ty, init),
    );
}

fn render_f32_init(value: f32) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{:?}", value)
    }
}

fn write_data_segment(out: &mut String, segment: &DataSegment) {
    let mut text = format!(
        "(data (i32.const {}) \"{}\")",
        segment.offset,
        escape_bytes(&segment.bytes)
    );
    if let Some(comment) = &segment.comment {
        text.push_str(" ;; ");
        text.push_str(&sanitize_comment(comment));
    }
    push_line(out, 1, &text);
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut escaped = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'"' => escaped.push_str("\\\""),
            b'\\' => escaped.push_str("\\\\"),
            0x20..=0x7e => escaped.push(byte as char),
            _ => escaped.push_str(&format!("\\{:02x}", byte)),
        }
    }
    escaped
}

fn write_export(out: &mut String, export: &Export) {
    let desc = match export.kind {
        ExportKind::Func => format!("(func ${})", export.target),
        ExportKind::Global => format!("(global ${})", export.target),
        ExportKind::Memory => "(memory 0)".to_string(),
    };
    push_line(out, 1, &format!("(export {:?} {})", export.name, desc));
}

fn write_function(out: &mut String, function: &WasmFunction, style: WritingStyle) {
    if let Some(comment) = &function.comment {
        push_line(out, 1, &format!(";; {}", sanitize_comment(comment)));
    }
    let mut header = format!("(func ${} (type ${})", function.label, function.type_name);
    for (name, ty) in &function.params {
        header.push_str(&format!(" (param ${} {})", name, ty));
    }
    if !function.results.is_empty() {
        header.push_str(" (result");
        for result in &function.results {
            header.push(' ');
            header.push_str(&result.to_string());
        }
        header.push(')');
    }
    push_line(out, 1, &header);
    for (name, ty) in &function.locals {
        push_line(out, 2, &format!("(local ${} {})", name, ty));
    }
    for inst in &function.body {
        match style {
            WritingStyle::Linear => write_inst_linear(out, inst, 2),
            WritingStyle::Folded => write_inst_folded(out, inst, 2),
        }
    }
    push_line(out, 1, ")");
}

fn block_header(keyword: &str, label: &Option<String>, result: &Option<ValueType>) -> String {
    let mut text = keyword.to_string();
    if let Some(label) = label {
        text.push_str(&format!(" ${}", label));
    }
    if let Some(result) = result {
        text.push_str(&format!(" (result {})", result));
    }
    text
}

fn append_comment(text: &mut String, comment: &Option<String>) {
    if let Some(comment) = comment {
        text.push_str(" ;; ");
        text.push_str(&sanitize_comment(comment));
    }
}

fn write_inst_linear(out: &mut String, inst: &WasmInst, depth: usize) {
    match &inst.op {
        WasmOp::Block {
            label,
            result,
            body,
        } => {
            let mut text = block_header("block", label, result);
            append_comment(&mut text, &inst.comment);
            push_line(out, depth, &text);
            for child in body {
                write_inst_linear(out, child, depth + 1);
            }
            push_line(out, depth, "end");
        }
        WasmOp::Loop {
            label,
            result,
            body,
        } => {
            let mut text = block_header("loop", label, result);
            append_comment(&mut text, &inst.comment);
            push_line(out, depth, &text);
            for child in body {
                write_inst_linear(out, child, depth + 1);
            }
            push_line(out, depth, "end");
        }
        WasmOp::If {
            result,
            then_branch,
            else_branch,
        } => {
            let mut text = block_header("if", &None, result);
            append_comment(&mut text, &inst.comment);
            push_line(out, depth, &text);
            for child in then_branch {
                write_inst_linear(out, child, depth + 1);
            }
            if !else_branch.is_empty() {
                push_line(out, depth, "else");
                for child in else_branch {
                    write_inst_linear(out, child, depth + 1);
                }
            }
            push_line(out, depth, "end");
        }
        flat => {
            let mut text = match flat.render_flat() {
                Some(text) => text,
                None => String::new(),
            };
            append_comment(&mut text, &inst.comment);
            push_line(out, depth, &text);
        }
    }
}

fn write_inst_folded(out: &mut String, inst: &WasmInst, depth: usize) {
    match &inst.op {
        WasmOp::Block {
            label,
            result,
            body,
        } => {
            let mut text = format!("({}", block_header("block", label, result));
            append_comment(&mut text, &inst.comment);
            push_line(out, depth, &text);
            for child in body {
                write_inst_folded(out, child, depth + 1);
            }
            push_line(out, depth, ")");
        }
        WasmOp::Loop {
            label,
            result,
            body,
        } => {
            let mut text = format!("({}", block_header("loop", label, result));
            append_comment(&mut text, &inst.comment);
            push_line(out, depth, &text);
            for child in body {
                write_inst_folded(out, child, depth + 1);
            }
            push_line(out, depth, ")");
        }
        WasmOp::If {
            result,
            then_branch,
            else_branch,
        } => {
            let mut text = format!("({}", block_header("if", &None, result));
            append_comment(&mut text, &inst.comment);
            push_line(out, depth, &text);
            push_line(out, depth + 1, "(then");
            for child in then_branch {
                write_inst_folded(out, child, depth + 2);
            }
            push_line(out, depth + 1, ")");
            if !else_branch.is_empty() {
                push_line(out, depth + 1, "(else");
                for child in else_branch {
                    write_inst_folded(out, child, depth + 2);
                }
                push_line(out, depth + 1, ")");
            }
            push_line(out, depth, ")");
        }
        flat => {
            let mut text = match flat.render_flat() {
                Some(text) => format!("({})", text),
                None => String::new(),
            };
            append_comment(&mut text, &inst.comment);
            push_line(out, depth, &text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::wasm::instructions::Id;
    use crate::backends::wasm::wasm_module::WasmFunction;

    fn sample_module() -> WasmModule {
        let mut module = WasmModule::new();
        let type_name = module.register_func_type(&[], &[ValueType::I32]);
        module
            .add_function(WasmFunction {
                label: "_start".to_string(),
                type_name,
                params: Vec::new(),
                results: vec![ValueType::I32],
                locals: vec![("x_0".to_string(), ValueType::I32)],
                body: vec![
                    WasmOp::I32Const(1).comment("condition"),
                    WasmOp::If {
                        result: Some(ValueType::I32),
                        then_branch: vec![WasmOp::I32Const(2).into()],
                        else_branch: vec![WasmOp::I32Const(3).into()],
                    }
                    .into(),
                    WasmOp::LocalTee(Id::name("x_0")).into(),
                    WasmOp::Return.into(),
                ],
                comment: None,
            })
            .unwrap();
        module.add_memory(1, None);
        module
            .add_export("_start", ExportKind::Func, "_start")
            .unwrap();
        module.add_data_segment(16, b"hi\"\\\x01".to_vec(), Some("payload".to_string()));
        module
    }

    #[test]
    fn linear_style_uses_end_keywords() {
        let wat = emit_wat(&sample_module(), WritingStyle::Linear);
        assert!(wat.contains("if (result i32)"));
        assert!(wat.contains("\n      i32.const 2\n"));
        assert!(wat.contains("else"));
        assert!(wat.contains("end"));
        assert!(wat.contains("i32.const 1 ;; condition"));
        assert!(!wat.contains("(then"));
    }

    #[test]
    fn folded_style_nests_control_children() {
        let wat = emit_wat(&sample_module(), WritingStyle::Folded);
        assert!(wat.contains("(if (result i32)"));
        assert!(wat.contains("(then"));
        assert!(wat.contains("(else"));
        assert!(wat.contains("(i32.const 1) ;; condition"));
        assert!(!wat.contains("end\n"));
    }

    #[test]
    fn data_bytes_are_escaped() {
        let wat = emit_wat(&sample_module(), WritingStyle::Linear);
        assert!(wat.contains(r#"(data (i32.const 16) "hi\"\\\01")"#));
    }

    #[test]
    fn component_order_is_deterministic() {
        let wat = emit_wat(&sample_module(), WritingStyle::Linear);
        let type_pos = wat.find("(type").unwrap();
        let memory_pos = wat.find("(memory").unwrap();
        let func_pos = wat.find("(func $_start").unwrap();
        let data_pos = wat.find("(data").unwrap();
        let export_pos = wat.find("(export").unwrap();
        assert!(type_pos < memory_pos);
        assert!(memory_pos < func_pos);
        assert!(func_pos < data_pos);
        assert!(data_pos < export_pos);
    }
}
