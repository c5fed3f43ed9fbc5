//! Type system for Orus
//!
//! Primitive types are plain enum variants; struct types are interned by
//! name in a [`TypeRegistry`]. Two types are equal iff their kind matches and
//! their recursive components are equal. Generic instantiation substitutes
//! type arguments and interns a fresh struct type under a mangled key.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A resolved Orus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Nil,
    Bool,
    I32,
    I64,
    U32,
    U64,
    F64,
    Str,
    /// Statement / procedure result type
    Void,
    Array(Box<Type>),
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
    },
    /// Named struct type, interned in the [`TypeRegistry`]
    Struct(String),
    /// Unsubstituted generic parameter, e.g. `T` in `struct Box<T>`
    Generic(String),
}

impl Type {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Type::I32 | Type::I64 | Type::U32 | Type::U64 | Type::F64
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::I32 | Type::I64 | Type::U32 | Type::U64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Type::U32 | Type::U64)
    }

    /// Compact code for numeric-cast operands in bytecode.
    pub fn cast_code(&self) -> Option<u8> {
        match self {
            Type::I32 => Some(0),
            Type::I64 => Some(1),
            Type::U32 => Some(2),
            Type::U64 => Some(3),
            Type::F64 => Some(4),
            Type::Bool => Some(5),
            _ => None,
        }
    }

    pub fn from_cast_code(code: u8) -> Option<Type> {
        match code {
            0 => Some(Type::I32),
            1 => Some(Type::I64),
            2 => Some(Type::U32),
            3 => Some(Type::U64),
            4 => Some(Type::F64),
            5 => Some(Type::Bool),
            _ => None,
        }
    }

    /// Substitute generic parameters with concrete arguments.
    fn substitute(&self, subst: &HashMap<&str, &Type>) -> Type {
        match self {
            Type::Generic(name) => match subst.get(name.as_str()) {
                Some(ty) => (*ty).clone(),
                None => self.clone(),
            },
            Type::Array(elem) => Type::Array(Box::new(elem.substitute(subst))),
            Type::Function { params, ret } => Type::Function {
                params: params.iter().map(|p| p.substitute(subst)).collect(),
                ret: Box::new(ret.substitute(subst)),
            },
            other => other.clone(),
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Nil => write!(f, "nil"),
            Type::Bool => write!(f, "bool"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::U32 => write!(f, "u32"),
            Type::U64 => write!(f, "u64"),
            Type::F64 => write!(f, "f64"),
            Type::Str => write!(f, "string"),
            Type::Void => write!(f, "void"),
            Type::Array(elem) => write!(f, "[{}]", elem),
            Type::Function { params, ret } => {
                let params: Vec<_> = params.iter().map(|p| p.to_string()).collect();
                write!(f, "fn({}) -> {}", params.join(", "), ret)
            }
            Type::Struct(name) => write!(f, "{}", name),
            Type::Generic(name) => write!(f, "{}", name),
        }
    }
}

/// A named field in a struct definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
}

/// A struct type as registered by a `struct` declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub generics: Vec<String>,
    pub fields: Vec<FieldDef>,
}

/// Process-wide registry of struct types, keyed by name.
///
/// Generic instantiations are interned under `Name<arg, ...>` so repeated
/// instantiation with the same arguments yields the same type.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    structs: HashMap<String, StructDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    /// Register a struct definition. Re-registering the same name is an error.
    pub fn register(&mut self, def: StructDef) -> Result<(), String> {
        if self.structs.contains_key(&def.name) {
            return Err(format!("struct '{}' is already defined", def.name));
        }
        self.structs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StructDef> {
        self.structs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.structs.contains_key(name)
    }

    /// Index and type of a field, if the struct and field exist.
    pub fn field(&self, struct_name: &str, field_name: &str) -> Option<(usize, &Type)> {
        let def = self.structs.get(struct_name)?;
        def.fields
            .iter()
            .enumerate()
            .find(|(_, field)| field.name == field_name)
            .map(|(index, field)| (index, &field.ty))
    }

    /// Instantiate a generic struct with concrete type arguments.
    ///
    /// Returns the interned name of the instantiation (e.g. `Box<i32>`).
    pub fn instantiate(&mut self, name: &str, args: &[Type]) -> Result<String, String> {
        let def = self
            .structs
            .get(name)
            .ok_or_else(|| format!("unknown struct '{}'", name))?
            .clone();

        if def.generics.len() != args.len() {
            return Err(format!(
                "struct '{}' expects {} type argument(s), got {}",
                name,
                def.generics.len(),
                args.len()
            ));
        }
        if args.is_empty() {
            return Ok(name.to_string());
        }

        let arg_names: Vec<_> = args.iter().map(|a| a.to_string()).collect();
        let key = format!("{}<{}>", name, arg_names.join(", "));
        if self.structs.contains_key(&key) {
            return Ok(key);
        }

        let subst: HashMap<&str, &Type> = def
            .generics
            .iter()
            .map(|g| g.as_str())
            .zip(args.iter())
            .collect();
        let fields = def
            .fields
            .iter()
            .map(|field| FieldDef {
                name: field.name.clone(),
                ty: field.ty.substitute(&subst),
            })
            .collect();

        self.structs.insert(
            key.clone(),
            StructDef {
                name: key.clone(),
                generics: Vec::new(),
                fields,
            },
        );
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> StructDef {
        StructDef {
            name: "Point".to_string(),
            generics: Vec::new(),
            fields: vec![
                FieldDef {
                    name: "x".to_string(),
                    ty: Type::I32,
                },
                FieldDef {
                    name: "y".to_string(),
                    ty: Type::I32,
                },
            ],
        }
    }

    #[test]
    fn structural_equality() {
        assert_eq!(Type::Array(Box::new(Type::I32)), Type::Array(Box::new(Type::I32)));
        assert_ne!(Type::Array(Box::new(Type::I32)), Type::Array(Box::new(Type::I64)));
        assert_ne!(Type::I32, Type::U32);
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = TypeRegistry::new();
        registry.register(point()).unwrap();
        assert!(registry.register(point()).is_err());
    }

    #[test]
    fn field_lookup() {
        let mut registry = TypeRegistry::new();
        registry.register(point()).unwrap();
        let (index, ty) = registry.field("Point", "y").unwrap();
        assert_eq!(index, 1);
        assert_eq!(*ty, Type::I32);
        assert!(registry.field("Point", "z").is_none());
    }

    #[test]
    fn generic_instantiation_interns() {
        let mut registry = TypeRegistry::new();
        registry
            .register(StructDef {
                name: "Box".to_string(),
                generics: vec!["T".to_string()],
                fields: vec![FieldDef {
                    name: "value".to_string(),
                    ty: Type::Generic("T".to_string()),
                }],
            })
            .unwrap();

        let a = registry.instantiate("Box", &[Type::I32]).unwrap();
        let b = registry.instantiate("Box", &[Type::I32]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "Box<i32>");

        let (_, ty) = registry.field(&a, "value").unwrap();
        assert_eq!(*ty, Type::I32);
    }

    #[test]
    fn arity_mismatch_is_an_error() {
        let mut registry = TypeRegistry::new();
        registry
            .register(StructDef {
                name: "Pair".to_string(),
                generics: vec!["A".to_string(), "B".to_string()],
                fields: Vec::new(),
            })
            .unwrap();
        assert!(registry.instantiate("Pair", &[Type::I32]).is_err());
    }

    #[test]
    fn display_formats() {
        let ty = Type::Function {
            params: vec![Type::I32, Type::Array(Box::new(Type::F64))],
            ret: Box::new(Type::Bool),
        };
        assert_eq!(ty.to_string(), "fn(i32, [f64]) -> bool");
    }
}
