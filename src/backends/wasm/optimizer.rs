//! Rule-based peephole optimizer.
//!
//! Rewrites each function body locally until a fixed point, recursing into
//! `block`/`loop`/`if` children first. Every rule preserves the program's
//! exit code and its sequence of observable host calls: only pure pushes are
//! ever cancelled against drops, and trapping operators (signed division,
//! loads, stores) are never touched.
//!
//! Rule families:
//! 1. pure push before `drop` is erased (with pure operators commuted into
//!    drops of their operands so the cancellation cascades)
//! 2. `local.set x; local.get x` collapses to `local.tee x`, and
//!    `local.tee x; drop` to `local.set x`
//! 3. code after an unconditional exit (`return`, `br`, `unreachable`) is
//!    dead up to the end of the enclosing block
//! 4. an `if` behind a constant condition is replaced by the taken branch
//! 5. arithmetic identities that the lowering shape produces (`i32.const 0;
//!    i32.add`) and `nop` are erased

use crate::backends::wasm::instructions::{WasmInst, WasmOp};
use crate::backends::wasm::wasm_module::WasmModule;

/// Run the peephole pass over every function body in the module.
pub fn optimize_module(module: &mut WasmModule) {
    for function in &mut module.functions {
        optimize_body(&mut function.body);
    }
}

/// Rewrite one instruction tree to a fixed point.
pub fn optimize_body(body: &mut Vec<WasmInst>) {
    while rewrite_pass(body) {}
}

/// Number of stack operands an always-succeeding operator consumes to
/// produce exactly one value. `None` marks instructions the optimizer must
/// treat as opaque (side effects, traps, control).
fn pure_arity(op: &WasmOp) -> Option<usize> {
    match op {
        WasmOp::I32Const(_) | WasmOp::F32Const(_) | WasmOp::LocalGet(_) | WasmOp::GlobalGet(_) => {
            Some(0)
        }
        WasmOp::I32Eqz | WasmOp::F32Sqrt => Some(1),
        WasmOp::I32Add
        | WasmOp::I32Sub
        | WasmOp::I32Mul
        | WasmOp::I32And
        | WasmOp::I32Or
        | WasmOp::I32Xor
        | WasmOp::I32Eq
        | WasmOp::I32Ne
        | WasmOp::I32LtS
        | WasmOp::I32LeS
        | WasmOp::I32GtS
        | WasmOp::I32GeS
        | WasmOp::F32Add
        | WasmOp::F32Sub
        | WasmOp::F32Mul
        | WasmOp::F32Div
        | WasmOp::F32Min
        | WasmOp::F32Max
        | WasmOp::F32Eq
        | WasmOp::F32Ne
        | WasmOp::F32Lt
        | WasmOp::F32Le
        | WasmOp::F32Gt
        | WasmOp::F32Ge => Some(2),
        WasmOp::Select => Some(3),
        _ => None,
    }
}

fn is_unconditional_exit(op: &WasmOp) -> bool {
    matches!(op, WasmOp::Return | WasmOp::Br(_) | WasmOp::Unreachable)
}

fn rewrite_pass(body: &mut Vec<WasmInst>) -> bool {
    let mut changed = false;

    // Children first, so branch replacement splices optimized code
    for inst in body.iter_mut() {
        match &mut inst.op {
            WasmOp::Block { body: inner, .. } | WasmOp::Loop { body: inner, .. } => {
                changed |= rewrite_pass(inner);
            }
            WasmOp::If {
                then_branch,
                else_branch,
                ..
            } => {
                changed |= rewrite_pass(then_branch);
                changed |= rewrite_pass(else_branch);
            }
            _ => {}
        }
    }

    let old = std::mem::take(body);
    let count = old.len();
    let mut out: Vec<WasmInst> = Vec::with_capacity(count);
    let mut i = 0;
    while i < count {
        let inst = &old[i];
        let next = old.get(i + 1);

        // Rule 5: nop erasure
        if matches!(inst.op, WasmOp::Nop) {
            changed = true;
            i += 1;
            continue;
        }

        // Rules 1 and 5: cancel pure producers against a following drop
        if let Some(arity) = pure_arity(&inst.op) {
            if matches!(next.map(|n| &n.op), Some(WasmOp::Drop)) {
                for _ in 0..arity {
                    out.push(WasmOp::Drop.into());
                }
                changed = true;
                i += 2;
                continue;
            }
        }

        // Rule 2: set-then-get collapses to tee, tee-then-drop to set
        if let (WasmOp::LocalSet(target), Some(WasmOp::LocalGet(source))) =
            (&inst.op, next.map(|n| &n.op))
        {
            if target == source {
                out.push(WasmInst {
                    op: WasmOp::LocalTee(target.clone()),
                    comment: inst.comment.clone(),
                });
                changed = true;
                i += 2;
                continue;
            }
        }
        if let (WasmOp::LocalTee(target), Some(WasmOp::Drop)) = (&inst.op, next.map(|n| &n.op)) {
            out.push(WasmInst {
                op: WasmOp::LocalSet(target.clone()),
                comment: inst.comment.clone(),
            });
            changed = true;
            i += 2;
            continue;
        }

        // Rule 5: additive identity produced by field-offset lowering
        if matches!(inst.op, WasmOp::I32Const(0))
            && matches!(next.map(|n| &n.op), Some(WasmOp::I32Add))
        {
            changed = true;
            i += 2;
            continue;
        }

        // Rule 4: constant condition selects its branch statically
        if let (
            WasmOp::I32Const(condition),
            Some(WasmOp::If {
                then_branch,
                else_branch,
                ..
            }),
        ) = (&inst.op, next.map(|n| &n.op))
        {
            let taken = if *condition != 0 {
                then_branch
            } else {
                else_branch
            };
            out.extend(taken.iter().cloned());
            changed = true;
            i += 2;
            continue;
        }

        // Rule 3: nothing is reachable after an unconditional exit
        if is_unconditional_exit(&inst.op) {
            out.push(inst.clone());
            if i + 1 < count {
                changed = true;
            }
            break;
        }

        out.push(inst.clone());
        i += 1;
    }
    *body = out;
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::wasm::instructions::{Id, ValueType, WasmOp};
    use proptest::prelude::*;

    fn ops(body: &[WasmInst]) -> Vec<&WasmOp> {
        body.iter().map(|inst| &inst.op).collect()
    }

    #[test]
    fn push_drop_pairs_are_erased() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::I32Const(5).into(),
            WasmOp::Drop.into(),
            WasmOp::LocalGet(Id::name("x")).into(),
            WasmOp::Drop.into(),
        ];
        optimize_body(&mut body);
        assert!(body.is_empty());
    }

    #[test]
    fn pure_operators_commute_into_their_operands() {
        // (1 + 2) dropped: the add and both constants disappear
        let mut body: Vec<WasmInst> = vec![
            WasmOp::I32Const(1).into(),
            WasmOp::I32Const(2).into(),
            WasmOp::I32Add.into(),
            WasmOp::Drop.into(),
        ];
        optimize_body(&mut body);
        assert!(body.is_empty());
    }

    #[test]
    fn trapping_division_is_never_cancelled() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::LocalGet(Id::name("a")).into(),
            WasmOp::LocalGet(Id::name("b")).into(),
            WasmOp::I32DivS.into(),
            WasmOp::Drop.into(),
        ];
        let before = body.clone();
        optimize_body(&mut body);
        assert_eq!(body, before);
    }

    #[test]
    fn set_get_collapses_to_tee() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::I32Const(7).into(),
            WasmOp::LocalSet(Id::name("x")).into(),
            WasmOp::LocalGet(Id::name("x")).into(),
        ];
        optimize_body(&mut body);
        assert_eq!(
            ops(&body),
            vec![
                &WasmOp::I32Const(7),
                &WasmOp::LocalTee(Id::name("x")),
            ]
        );
    }

    #[test]
    fn set_get_of_different_locals_is_kept() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::LocalSet(Id::name("x")).into(),
            WasmOp::LocalGet(Id::name("y")).into(),
        ];
        let before = body.clone();
        optimize_body(&mut body);
        assert_eq!(body, before);
    }

    #[test]
    fn tee_drop_becomes_set() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::I32Const(7).into(),
            WasmOp::LocalTee(Id::name("x")).into(),
            WasmOp::Drop.into(),
        ];
        optimize_body(&mut body);
        assert_eq!(
            ops(&body),
            vec![&WasmOp::I32Const(7), &WasmOp::LocalSet(Id::name("x"))]
        );
    }

    #[test]
    fn code_after_a_branch_is_dead() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::Br(Id::name("exit")).into(),
            WasmOp::I32Const(1).into(),
            WasmOp::Drop.into(),
        ];
        optimize_body(&mut body);
        assert_eq!(ops(&body), vec![&WasmOp::Br(Id::name("exit"))]);
    }

    #[test]
    fn constant_conditions_select_their_branch() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::I32Const(0).into(),
            WasmOp::If {
                result: Some(ValueType::I32),
                then_branch: vec![WasmOp::I32Const(1).into()],
                else_branch: vec![WasmOp::I32Const(2).into()],
            }
            .into(),
        ];
        optimize_body(&mut body);
        assert_eq!(ops(&body), vec![&WasmOp::I32Const(2)]);

        let mut body: Vec<WasmInst> = vec![
            WasmOp::I32Const(3).into(),
            WasmOp::If {
                result: Some(ValueType::I32),
                then_branch: vec![WasmOp::I32Const(1).into()],
                else_branch: vec![WasmOp::I32Const(2).into()],
            }
            .into(),
        ];
        optimize_body(&mut body);
        assert_eq!(ops(&body), vec![&WasmOp::I32Const(1)]);
    }

    #[test]
    fn additive_identity_is_erased() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::LocalGet(Id::name("base")).into(),
            WasmOp::I32Const(0).into(),
            WasmOp::I32Add.into(),
            WasmOp::I32Load(Default::default()).into(),
        ];
        optimize_body(&mut body);
        assert_eq!(
            ops(&body),
            vec![
                &WasmOp::LocalGet(Id::name("base")),
                &WasmOp::I32Load(Default::default()),
            ]
        );
    }

    #[test]
    fn rules_apply_inside_nested_blocks() {
        let mut body: Vec<WasmInst> = vec![
            WasmOp::Block {
                label: Some("b".to_string()),
                result: None,
                body: vec![
                    WasmOp::I32Const(1).into(),
                    WasmOp::Drop.into(),
                    WasmOp::Nop.into(),
                ],
            }
            .into(),
        ];
        optimize_body(&mut body);
        match &body[0].op {
            WasmOp::Block { body: inner, .. } => assert!(inner.is_empty()),
            other => panic!("expected a block, found {:?}", other),
        }
    }

    fn arbitrary_flat_inst() -> impl Strategy<Value = WasmInst> {
        prop_oneof![
            any::<i32>().prop_map(|v| WasmInst::from(WasmOp::I32Const(v))),
            Just(WasmInst::from(WasmOp::Drop)),
            Just(WasmInst::from(WasmOp::Nop)),
            Just(WasmInst::from(WasmOp::I32Add)),
            Just(WasmInst::from(WasmOp::LocalGet(Id::name("x")))),
            Just(WasmInst::from(WasmOp::LocalSet(Id::name("x")))),
            Just(WasmInst::from(WasmOp::LocalTee(Id::name("x")))),
            Just(WasmInst::from(WasmOp::Return)),
        ]
    }

    proptest! {
        // A fixed point really is fixed: running the pass again changes nothing
        #[test]
        fn optimizer_is_idempotent(insts in proptest::collection::vec(arbitrary_flat_inst(), 0..24)) {
            let mut once = insts.clone();
            optimize_body(&mut once);
            let mut twice = once.clone();
            optimize_body(&mut twice);
            prop_assert_eq!(once, twice);
        }
    }
}
