//! Free-variable analysis for closure conversion.
//!
//! Capture sets must be deterministic because they fix the layout of closure
//! environment records, so results come back as `BTreeSet`s.

use crate::compiler::ast_nodes::{ExprKind, TypedExpr};
use std::collections::BTreeSet;

/// All variables occurring free in `expr`.
pub fn free_vars(expr: &TypedExpr) -> BTreeSet<String> {
    let mut free = BTreeSet::new();
    let mut bound: Vec<String> = Vec::new();
    collect(expr, &mut bound, &mut free);
    free
}

/// True when `name` occurs free inside some lambda within `expr`, i.e. a
/// closure created in this scope would capture it. Shadowing binders cut the
/// search off.
pub fn captured_in_lambda(name: &str, expr: &TypedExpr) -> bool {
    match &expr.kind {
        ExprKind::Lambda { .. } => free_vars(expr).contains(name),
        ExprKind::Let { name: n, init, scope } | ExprKind::LetMut { name: n, init, scope } => {
            captured_in_lambda(name, init) || (n != name && captured_in_lambda(name, scope))
        }
        ExprKind::LetRec { name: n, init, scope } => {
            n != name && (captured_in_lambda(name, init) || captured_in_lambda(name, scope))
        }
        ExprKind::Match { scrutinee, cases } => {
            captured_in_lambda(name, scrutinee)
                || cases
                    .iter()
                    .any(|case| case.var != name && captured_in_lambda(name, &case.body))
        }
        ExprKind::TypeAlias { scope, .. } => captured_in_lambda(name, scope),
        _ => {
            let mut found = false;
            for_each_child(expr, &mut |child| {
                found = found || captured_in_lambda(name, child);
            });
            found
        }
    }
}

fn mark(name: &str, bound: &[String], free: &mut BTreeSet<String>) {
    if !bound.iter().any(|b| b == name) {
        free.insert(name.to_string());
    }
}

fn collect(expr: &TypedExpr, bound: &mut Vec<String>, free: &mut BTreeSet<String>) {
    match &expr.kind {
        ExprKind::Variable(name) => mark(name, bound, free),
        ExprKind::PreIncr(name)
        | ExprKind::PreDecr(name)
        | ExprKind::PostIncr(name)
        | ExprKind::PostDecr(name) => mark(name, bound, free),
        ExprKind::CompoundAssign { name, value, .. } => {
            mark(name, bound, free);
            collect(value, bound, free);
        }
        ExprKind::Let { name, init, scope } | ExprKind::LetMut { name, init, scope } => {
            collect(init, bound, free);
            bound.push(name.clone());
            collect(scope, bound, free);
            bound.pop();
        }
        ExprKind::LetRec { name, init, scope } => {
            bound.push(name.clone());
            collect(init, bound, free);
            collect(scope, bound, free);
            bound.pop();
        }
        ExprKind::Lambda { params, body } => {
            for (param, _) in params {
                bound.push(param.clone());
            }
            collect(body, bound, free);
            for _ in params {
                bound.pop();
            }
        }
        ExprKind::Match { scrutinee, cases } => {
            collect(scrutinee, bound, free);
            for case in cases {
                bound.push(case.var.clone());
                collect(&case.body, bound, free);
                bound.pop();
            }
        }
        ExprKind::TypeAlias { scope, .. } => collect(scope, bound, free),
        _ => {
            for_each_child(expr, &mut |child| collect(child, bound, free));
        }
    }
}

/// Visits the direct child expressions of every non-binding variant.
/// Binding variants are handled explicitly by the callers above.
fn for_each_child<'a>(expr: &'a TypedExpr, visit: &mut dyn FnMut(&'a TypedExpr)) {
    match &expr.kind {
        ExprKind::Unit
        | ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Bool(_)
        | ExprKind::Str(_)
        | ExprKind::Variable(_)
        | ExprKind::ReadInt
        | ExprKind::ReadFloat
        | ExprKind::PreIncr(_)
        | ExprKind::PreDecr(_)
        | ExprKind::PostIncr(_)
        | ExprKind::PostDecr(_)
        | ExprKind::Pointer(_) => {}

        ExprKind::Arith(_, lhs, rhs)
        | ExprKind::Compare(_, lhs, rhs)
        | ExprKind::Logic(_, lhs, rhs)
        | ExprKind::ShortAnd(lhs, rhs)
        | ExprKind::ShortOr(lhs, rhs) => {
            visit(lhs);
            visit(rhs);
        }
        ExprKind::Sqrt(inner)
        | ExprKind::Not(inner)
        | ExprKind::Ascription(inner)
        | ExprKind::Assertion(inner)
        | ExprKind::Print(inner)
        | ExprKind::PrintLn(inner)
        | ExprKind::ArrayLength(inner) => visit(inner),

        ExprKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            visit(condition);
            visit(then_branch);
            visit(else_branch);
        }
        ExprKind::Seq(items) => {
            for item in items {
                visit(item);
            }
        }
        ExprKind::Application { callee, args } => {
            visit(callee);
            for arg in args {
                visit(arg);
            }
        }
        ExprKind::StructCons(fields) => {
            for (_, value) in fields {
                visit(value);
            }
        }
        ExprKind::FieldSelect { target, .. } => visit(target),
        ExprKind::ArrayCons { length, init } => {
            visit(length);
            visit(init);
        }
        ExprKind::ArrayElem { target, index } => {
            visit(target);
            visit(index);
        }
        ExprKind::ArraySlice { target, start, end } => {
            visit(target);
            visit(start);
            visit(end);
        }
        ExprKind::UnionCons { value, .. } => visit(value),
        ExprKind::Assign { target, value } => {
            visit(target);
            visit(value);
        }
        ExprKind::While { condition, body } | ExprKind::DoWhile { condition, body } => {
            visit(condition);
            visit(body);
        }
        ExprKind::For {
            init,
            condition,
            update,
            body,
        } => {
            visit(init);
            visit(condition);
            visit(update);
            visit(body);
        }
        ExprKind::CompoundAssign { value, .. } => visit(value),

        // Binding forms; when reached through this helper the caller has
        // already decided scoping does not matter for its question.
        ExprKind::Let { init, scope, .. }
        | ExprKind::LetMut { init, scope, .. }
        | ExprKind::LetRec { init, scope, .. } => {
            visit(init);
            visit(scope);
        }
        ExprKind::Lambda { body, .. } => visit(body),
        ExprKind::Match { scrutinee, cases } => {
            visit(scrutinee);
            for case in cases {
                visit(&case.body);
            }
        }
        ExprKind::TypeAlias { scope, .. } => visit(scope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast_nodes::{ArithOp, ExprKind, TypedExpr};
    use crate::compiler::datatypes::Type;

    fn add(lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
        TypedExpr::new(
            ExprKind::Arith(ArithOp::Add, lhs.boxed(), rhs.boxed()),
            Type::Int,
            Default::default(),
        )
    }

    fn lambda(params: &[&str], body: TypedExpr) -> TypedExpr {
        let fun_ty = Type::Fun(
            params.iter().map(|_| Type::Int).collect(),
            Box::new(body.ty.clone()),
        );
        TypedExpr::new(
            ExprKind::Lambda {
                params: params.iter().map(|p| (p.to_string(), Type::Int)).collect(),
                body: body.boxed(),
            },
            fun_ty,
            Default::default(),
        )
    }

    #[test]
    fn parameters_are_not_free() {
        let body = add(
            TypedExpr::variable("x", Type::Int),
            TypedExpr::variable("y", Type::Int),
        );
        let lam = lambda(&["x"], body);
        let free = free_vars(&lam);
        assert!(!free.contains("x"));
        assert!(free.contains("y"));
    }

    #[test]
    fn let_bindings_shadow_their_scope_only() {
        // let x = y in x + z
        let expr = TypedExpr::new(
            ExprKind::Let {
                name: "x".to_string(),
                init: TypedExpr::variable("y", Type::Int).boxed(),
                scope: add(
                    TypedExpr::variable("x", Type::Int),
                    TypedExpr::variable("z", Type::Int),
                )
                .boxed(),
            },
            Type::Int,
            Default::default(),
        );
        let free = free_vars(&expr);
        assert_eq!(
            free.into_iter().collect::<Vec<_>>(),
            vec!["y".to_string(), "z".to_string()]
        );
    }

    #[test]
    fn let_rec_binds_inside_its_own_initializer() {
        let expr = TypedExpr::new(
            ExprKind::LetRec {
                name: "f".to_string(),
                init: lambda(
                    &["n"],
                    TypedExpr::new(
                        ExprKind::Application {
                            callee: TypedExpr::variable(
                                "f",
                                Type::Fun(vec![Type::Int], Box::new(Type::Int)),
                            )
                            .boxed(),
                            args: vec![TypedExpr::variable("n", Type::Int)],
                        },
                        Type::Int,
                        Default::default(),
                    ),
                )
                .boxed(),
                scope: TypedExpr::int(0).boxed(),
            },
            Type::Int,
            Default::default(),
        );
        assert!(free_vars(&expr).is_empty());
    }

    #[test]
    fn capture_detection_sees_through_nesting() {
        // c is captured: fn(d) -> c + d
        let scope = lambda(
            &["d"],
            add(
                TypedExpr::variable("c", Type::Int),
                TypedExpr::variable("d", Type::Int),
            ),
        );
        assert!(captured_in_lambda("c", &scope));
        assert!(!captured_in_lambda("e", &scope));

        // shadowed: fn(c) -> c
        let shadowed = lambda(&["c"], TypedExpr::variable("c", Type::Int));
        assert!(!captured_in_lambda("c", &shadowed));
    }
}
