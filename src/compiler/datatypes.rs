//! Hygge type lattice as seen by the backend.
//!
//! The type checker resolves every expression to one of these types before
//! codegen runs. The backend only needs three things from the lattice:
//! alias resolution, the subtyping predicate, and the mapping from Hygge
//! types to their Wasm value representation.

use rustc_hash::FxHashMap;
use std::fmt;

/// A resolved Hygge type attached to a typed AST node.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    /// Bottom of the subtyping lattice, only produced for stuck typings.
    Bottom,
    Unit,
    Bool,
    /// 32-bit signed integer.
    Int,
    /// 32-bit IEEE-754 float.
    Float,
    /// Struct of pointer + byte length once lowered.
    Str,
    /// Closure type: argument types and return type.
    Fun(Vec<Type>, Box<Type>),
    /// Field name/type pairs in declaration order.
    Struct(Vec<(String, Type)>),
    /// Homogeneous array, lowered as a (data pointer, length) header.
    Array(Box<Type>),
    /// Labelled alternatives; payload types per label.
    Union(Vec<(String, Type)>),
    /// A type variable, resolved through the alias environment.
    Var(String),
}

/// The Wasm value-stack representation of a Hygge type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmRepr {
    I32,
    F32,
    /// No value on the stack (unit).
    None,
}

/// Alias environment built from `type` declarations in scope.
///
/// Typed AST nodes arrive with their types resolved, but aliases can still
/// appear nested inside struct fields and union payloads, so the backend
/// threads this environment through lowering.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    aliases: FxHashMap<String, Type>,
}

impl TypeEnv {
    pub fn new() -> Self {
        TypeEnv {
            aliases: FxHashMap::default(),
        }
    }

    pub fn bind_alias(&mut self, name: impl Into<String>, def: Type) -> Option<Type> {
        self.aliases.insert(name.into(), def)
    }

    pub fn remove_alias(&mut self, name: &str) -> Option<Type> {
        self.aliases.remove(name)
    }

    pub fn restore_alias(&mut self, name: &str, previous: Option<Type>) {
        match previous {
            Some(def) => {
                self.aliases.insert(name.to_string(), def);
            }
            None => {
                self.aliases.remove(name);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Type> {
        self.aliases.get(name)
    }

    /// Chases type variables until a structural type (or an unbound variable)
    /// is reached. Alias cycles are cut off after the environment size.
    pub fn expand<'a>(&'a self, ty: &'a Type) -> &'a Type {
        let mut current = ty;
        let mut fuel = self.aliases.len() + 1;
        while let Type::Var(name) = current {
            match self.aliases.get(name) {
                Some(def) if fuel > 0 => {
                    current = def;
                    fuel -= 1;
                }
                _ => break,
            }
        }
        current
    }
}

impl Type {
    /// The Wasm value representation of this type: `f32` for floats, nothing
    /// for unit, `i32` for everything else (ints, bools, and every pointer-
    /// shaped value: strings, structs, arrays, unions, closures).
    pub fn wasm_repr(&self, env: &TypeEnv) -> WasmRepr {
        match env.expand(self) {
            Type::Unit => WasmRepr::None,
            Type::Float => WasmRepr::F32,
            _ => WasmRepr::I32,
        }
    }

    /// Looks up a struct field, returning its declaration index and type.
    pub fn struct_field<'a>(&'a self, env: &'a TypeEnv, field: &str) -> Option<(usize, &'a Type)> {
        match env.expand(self) {
            Type::Struct(fields) => fields
                .iter()
                .enumerate()
                .find(|(_, (name, _))| name == field)
                .map(|(i, (_, ty))| (i, ty)),
            _ => None,
        }
    }

    /// The element type of an array, if this is one.
    pub fn array_element<'a>(&'a self, env: &'a TypeEnv) -> Option<&'a Type> {
        match env.expand(self) {
            Type::Array(elem) => Some(elem),
            _ => None,
        }
    }

    /// The payload type of a union label, if this is a union declaring it.
    pub fn union_payload<'a>(&'a self, env: &'a TypeEnv, label: &str) -> Option<&'a Type> {
        match env.expand(self) {
            Type::Union(cases) => cases
                .iter()
                .find(|(name, _)| name == label)
                .map(|(_, ty)| ty),
            _ => None,
        }
    }

    /// The argument and return types of a function type, if this is one.
    pub fn fun_signature<'a>(&'a self, env: &'a TypeEnv) -> Option<(&'a [Type], &'a Type)> {
        match env.expand(self) {
            Type::Fun(args, ret) => Some((args.as_slice(), ret)),
            _ => None,
        }
    }
}

/// The subtyping predicate of the Hygge lattice.
///
/// Bottom is below everything. Structs use width subtyping (a struct with
/// more leading fields is a subtype of one with fewer), unions are covariant
/// with label-set widening, functions are contravariant in arguments and
/// covariant in the result.
pub fn is_subtype_of(env: &TypeEnv, t: &Type, u: &Type) -> bool {
    let t = env.expand(t);
    let u = env.expand(u);
    match (t, u) {
        (Type::Bottom, _) => true,
        (Type::Unit, Type::Unit)
        | (Type::Bool, Type::Bool)
        | (Type::Int, Type::Int)
        | (Type::Float, Type::Float)
        | (Type::Str, Type::Str) => true,
        (Type::Var(a), Type::Var(b)) => a == b,
        (Type::Array(a), Type::Array(b)) => {
            // Arrays are mutable, so element types must match both ways
            is_subtype_of(env, a, b) && is_subtype_of(env, b, a)
        }
        (Type::Struct(fields_t), Type::Struct(fields_u)) => {
            fields_t.len() >= fields_u.len()
                && fields_u.iter().zip(fields_t.iter()).all(|((nu, tu), (nt, tt))| {
                    nu == nt && is_subtype_of(env, tt, tu)
                })
        }
        (Type::Union(cases_t), Type::Union(cases_u)) => cases_t.iter().all(|(label, tt)| {
            cases_u
                .iter()
                .any(|(lu, tu)| lu == label && is_subtype_of(env, tt, tu))
        }),
        (Type::Fun(args_t, ret_t), Type::Fun(args_u, ret_u)) => {
            args_t.len() == args_u.len()
                && args_u
                    .iter()
                    .zip(args_t.iter())
                    .all(|(au, at)| is_subtype_of(env, au, at))
                && is_subtype_of(env, ret_t, ret_u)
        }
        _ => false,
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bottom => write!(f, "bottom"),
            Type::Unit => write!(f, "unit"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "string"),
            Type::Fun(args, ret) => {
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ") -> {}", ret)
            }
            Type::Struct(fields) => {
                write!(f, "struct {{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}: {}", name, ty)?;
                }
                write!(f, "}}")
            }
            Type::Array(elem) => write!(f, "array {{{}}}", elem),
            Type::Union(cases) => {
                write!(f, "union {{")?;
                for (i, (label, ty)) in cases.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}: {}", label, ty)?;
                }
                write!(f, "}}")
            }
            Type::Var(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_expansion_resolves_chains() {
        let mut env = TypeEnv::new();
        env.bind_alias("money", Type::Int);
        env.bind_alias("cash", Type::Var("money".to_string()));

        assert_eq!(env.expand(&Type::Var("cash".to_string())), &Type::Int);
    }

    #[test]
    fn struct_width_subtyping() {
        let env = TypeEnv::new();
        let wide = Type::Struct(vec![
            ("x".to_string(), Type::Int),
            ("y".to_string(), Type::Float),
        ]);
        let narrow = Type::Struct(vec![("x".to_string(), Type::Int)]);

        assert!(is_subtype_of(&env, &wide, &narrow));
        assert!(!is_subtype_of(&env, &narrow, &wide));
    }

    #[test]
    fn function_subtyping_is_contravariant_in_arguments() {
        let env = TypeEnv::new();
        let narrow_struct = Type::Struct(vec![("x".to_string(), Type::Int)]);
        let wide_struct = Type::Struct(vec![
            ("x".to_string(), Type::Int),
            ("y".to_string(), Type::Int),
        ]);
        let takes_narrow = Type::Fun(vec![narrow_struct.clone()], Box::new(Type::Int));
        let takes_wide = Type::Fun(vec![wide_struct.clone()], Box::new(Type::Int));

        // A function accepting the narrow struct accepts every wide one too
        assert!(is_subtype_of(&env, &takes_narrow, &takes_wide));
        assert!(!is_subtype_of(&env, &takes_wide, &takes_narrow));
    }

    #[test]
    fn wasm_repr_follows_representation_rule() {
        let env = TypeEnv::new();
        assert_eq!(Type::Int.wasm_repr(&env), WasmRepr::I32);
        assert_eq!(Type::Bool.wasm_repr(&env), WasmRepr::I32);
        assert_eq!(Type::Str.wasm_repr(&env), WasmRepr::I32);
        assert_eq!(Type::Float.wasm_repr(&env), WasmRepr::F32);
        assert_eq!(Type::Unit.wasm_repr(&env), WasmRepr::None);
    }
}
