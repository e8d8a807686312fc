//! Instruction model for the Wasm IR.
//!
//! Control instructions own their child instruction sequences, which keeps
//! the peephole rules local (a rewrite never has to scan for a matching
//! `end`) and lets the serializer choose between the linear and folded
//! writing styles at print time.
//!
//! Every instruction carries an optional human-readable comment that the
//! serializer prints as `;; …` on the same line.

use std::fmt;

/// The two Wasm value types this backend emits. Hygge ints, bools and every
/// pointer-shaped value are `i32`; floats are `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    F32,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::I32 => write!(f, "i32"),
            ValueType::F32 => write!(f, "f32"),
        }
    }
}

/// A local, global, or label reference: by declared name or by raw index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Id {
    Name(String),
    Index(u32),
}

impl Id {
    pub fn name(name: impl Into<String>) -> Id {
        Id::Name(name.into())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Name(name) => write!(f, "${}", name),
            Id::Index(index) => write!(f, "{}", index),
        }
    }
}

/// Static offset and alignment immediates of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemArg {
    pub offset: u32,
    /// Alignment exponent; `None` uses the natural alignment.
    pub align: Option<u32>,
}

impl MemArg {
    pub fn offset(offset: u32) -> MemArg {
        MemArg {
            offset,
            align: None,
        }
    }
}

// Both immediates are omitted entirely when they are defaults, which the
// text format allows.
impl fmt::Display for MemArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset != 0 {
            write!(f, " offset={}", self.offset)?;
        }
        if let Some(align) = self.align {
            write!(f, " align={}", align)?;
        }
        Ok(())
    }
}

/// One Wasm operation. Control operations own their bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum WasmOp {
    // Control
    Block {
        label: Option<String>,
        result: Option<ValueType>,
        body: Vec<WasmInst>,
    },
    Loop {
        label: Option<String>,
        result: Option<ValueType>,
        body: Vec<WasmInst>,
    },
    If {
        result: Option<ValueType>,
        then_branch: Vec<WasmInst>,
        else_branch: Vec<WasmInst>,
    },
    Br(Id),
    BrIf(Id),
    Return,
    Unreachable,
    Nop,

    // Parametric
    Drop,
    Select,

    // Variables
    LocalGet(Id),
    LocalSet(Id),
    LocalTee(Id),
    GlobalGet(Id),
    GlobalSet(Id),

    // Memory
    I32Load(MemArg),
    F32Load(MemArg),
    I32Store(MemArg),
    F32Store(MemArg),
    MemorySize,
    MemoryGrow,

    // Numeric constants
    I32Const(i32),
    F32Const(f32),

    // i32 arithmetic, comparison, bitwise
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32RemS,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LeS,
    I32GtS,
    I32GeS,
    I32Eqz,
    I32And,
    I32Or,
    I32Xor,

    // f32 arithmetic and comparison (IEEE semantics)
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F32Sqrt,
    F32Min,
    F32Max,
    F32Eq,
    F32Ne,
    F32Lt,
    F32Le,
    F32Gt,
    F32Ge,

    // Calls
    Call(String),
    /// Indirect call through the module's function table, against a
    /// canonical signature name from the type table.
    CallIndirect(String),
}

impl WasmOp {
    /// True for the three structured control operations that own bodies.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            WasmOp::Block { .. } | WasmOp::Loop { .. } | WasmOp::If { .. }
        )
    }

    /// Renders a non-structured operation with its immediates, e.g.
    /// `i32.const 42` or `local.get $x`. Structured operations return `None`;
    /// the serializer assembles those from their parts.
    pub fn render_flat(&self) -> Option<String> {
        let text = match self {
            WasmOp::Block { .. } | WasmOp::Loop { .. } | WasmOp::If { .. } => return None,
            WasmOp::Br(target) => format!("br {}", target),
            WasmOp::BrIf(target) => format!("br_if {}", target),
            WasmOp::Return => "return".to_string(),
            WasmOp::Unreachable => "unreachable".to_string(),
            WasmOp::Nop => "nop".to_string(),
            WasmOp::Drop => "drop".to_string(),
            WasmOp::Select => "select".to_string(),
            WasmOp::LocalGet(id) => format!("local.get {}", id),
            WasmOp::LocalSet(id) => format!("local.set {}", id),
            WasmOp::LocalTee(id) => format!("local.tee {}", id),
            WasmOp::GlobalGet(id) => format!("global.get {}", id),
            WasmOp::GlobalSet(id) => format!("global.set {}", id),
            WasmOp::I32Load(mem) => format!("i32.load{}", mem),
            WasmOp::F32Load(mem) => format!("f32.load{}", mem),
            WasmOp::I32Store(mem) => format!("i32.store{}", mem),
            WasmOp::F32Store(mem) => format!("f32.store{}", mem),
            WasmOp::MemorySize => "memory.size".to_string(),
            WasmOp::MemoryGrow => "memory.grow".to_string(),
            WasmOp::I32Const(value) => format!("i32.const {}", value),
            WasmOp::F32Const(value) => format!("f32.const {}", render_f32(*value)),
            WasmOp::I32Add => "i32.add".to_string(),
            WasmOp::I32Sub => "i32.sub".to_string(),
            WasmOp::I32Mul => "i32.mul".to_string(),
            WasmOp::I32DivS => "i32.div_s".to_string(),
            WasmOp::I32RemS => "i32.rem_s".to_string(),
            WasmOp::I32Eq => "i32.eq".to_string(),
            WasmOp::I32Ne => "i32.ne".to_string(),
            WasmOp::I32LtS => "i32.lt_s".to_string(),
            WasmOp::I32LeS => "i32.le_s".to_string(),
            WasmOp::I32GtS => "i32.gt_s".to_string(),
            WasmOp::I32GeS => "i32.ge_s".to_string(),
            WasmOp::I32Eqz => "i32.eqz".to_string(),
            WasmOp::I32And => "i32.and".to_string(),
            WasmOp::I32Or => "i32.or".to_string(),
            WasmOp::I32Xor => "i32.xor".to_string(),
            WasmOp::F32Add => "f32.add".to_string(),
            WasmOp::F32Sub => "f32.sub".to_string(),
            WasmOp::F32Mul => "f32.mul".to_string(),
            WasmOp::F32Div => "f32.div".to_string(),
            WasmOp::F32Sqrt => "f32.sqrt".to_string(),
            WasmOp::F32Min => "f32.min".to_string(),
            WasmOp::F32Max => "f32.max".to_string(),
            WasmOp::F32Eq => "f32.eq".to_string(),
            WasmOp::F32Ne => "f32.ne".to_string(),
            WasmOp::F32Lt => "f32.lt".to_string(),
            WasmOp::F32Le => "f32.le".to_string(),
            WasmOp::F32Gt => "f32.gt".to_string(),
            WasmOp::F32Ge => "f32.ge".to_string(),
            WasmOp::Call(label) => format!("call ${}", label),
            WasmOp::CallIndirect(type_name) => format!("call_indirect (type ${})", type_name),
        };
        Some(text)
    }

    /// Attach a comment, producing a finished instruction.
    pub fn comment(self, text: impl Into<String>) -> WasmInst {
        WasmInst {
            op: self,
            comment: Some(text.into()),
        }
    }
}

/// Text rendering for `f32.const` immediates. `{:?}` keeps the shortest
/// round-tripping decimal form and prints infinities as `inf`, which the
/// text format accepts; NaN needs the lowercase spelling.
fn render_f32(value: f32) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{:?}", value)
    }
}

/// An operation plus its optional serializer comment.
#[derive(Debug, Clone, PartialEq)]
pub struct WasmInst {
    pub op: WasmOp,
    pub comment: Option<String>,
}

impl From<WasmOp> for WasmInst {
    fn from(op: WasmOp) -> WasmInst {
        WasmInst { op, comment: None }
    }
}

/// Sink extension so lowering code can push operations without wrapping
/// every one in `WasmInst` by hand.
pub trait InstSink {
    fn op(&mut self, op: WasmOp);
    fn op_comment(&mut self, op: WasmOp, comment: impl Into<String>);
}

impl InstSink for Vec<WasmInst> {
    fn op(&mut self, op: WasmOp) {
        self.push(op.into());
    }

    fn op_comment(&mut self, op: WasmOp, comment: impl Into<String>) {
        self.push(op.comment(comment));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_rendering_includes_immediates() {
        assert_eq!(
            WasmOp::I32Const(-7).render_flat().as_deref(),
            Some("i32.const -7")
        );
        assert_eq!(
            WasmOp::LocalGet(Id::name("x")).render_flat().as_deref(),
            Some("local.get $x")
        );
        assert_eq!(
            WasmOp::I32Load(MemArg::offset(4)).render_flat().as_deref(),
            Some("i32.load offset=4")
        );
        assert_eq!(
            WasmOp::CallIndirect("fun_i32_to_i32".to_string())
                .render_flat()
                .as_deref(),
            Some("call_indirect (type $fun_i32_to_i32)")
        );
    }

    #[test]
    fn float_immediates_round_trip_textually() {
        assert_eq!(
            WasmOp::F32Const(1.5).render_flat().as_deref(),
            Some("f32.const 1.5")
        );
        assert_eq!(
            WasmOp::F32Const(2.0).render_flat().as_deref(),
            Some("f32.const 2.0")
        );
        assert_eq!(
            WasmOp::F32Const(f32::NAN).render_flat().as_deref(),
            Some("f32.const nan")
        );
    }

    #[test]
    fn structured_ops_have_no_flat_form() {
        let block = WasmOp::Block {
            label: None,
            result: None,
            body: Vec::new(),
        };
        assert!(block.render_flat().is_none());
        assert!(block.is_structured());
    }
}
