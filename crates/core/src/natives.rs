//! Native function signatures
//!
//! The compiler resolves calls to natives at compile time and emits
//! `CALL_NATIVE index argc`; the runtime binds implementations by the same
//! index. Keeping the signature table here is what ties the two together.
//! Surface programs reach natives through their reserved `__`-prefixed
//! names; the embedded stdlib wraps them in ordinary functions.

/// Parameter/return slots in a native signature.
///
/// Natives only traffic in a handful of shapes, so this is deliberately
/// simpler than the full [`Type`](crate::types::Type) language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    I32,
    I64,
    F64,
    Str,
    /// An array of any element type
    Array,
    /// Any value at all
    Any,
    /// A string or an array (`__len`)
    StrOrArray,
    /// The element type of the first argument (`__pop`)
    ElemOfFirst,
    /// No meaningful return value
    Void,
}

/// Signature of one native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeDef {
    pub name: &'static str,
    pub params: &'static [NativeType],
    pub ret: NativeType,
}

/// The fixed native table, in index order. The runtime's implementation
/// table must stay parallel to this one.
pub const NATIVES: &[NativeDef] = &[
    NativeDef { name: "__sqrt", params: &[NativeType::F64], ret: NativeType::F64 },
    NativeDef { name: "__floor", params: &[NativeType::F64], ret: NativeType::F64 },
    NativeDef { name: "__ceil", params: &[NativeType::F64], ret: NativeType::F64 },
    NativeDef { name: "__pow", params: &[NativeType::F64, NativeType::F64], ret: NativeType::F64 },
    NativeDef { name: "__fabs", params: &[NativeType::F64], ret: NativeType::F64 },
    NativeDef { name: "__iabs", params: &[NativeType::I32], ret: NativeType::I32 },
    NativeDef { name: "__len", params: &[NativeType::StrOrArray], ret: NativeType::I32 },
    NativeDef { name: "__push", params: &[NativeType::Array, NativeType::Any], ret: NativeType::Void },
    NativeDef { name: "__pop", params: &[NativeType::Array], ret: NativeType::ElemOfFirst },
    NativeDef { name: "__str", params: &[NativeType::Any], ret: NativeType::Str },
    NativeDef { name: "__clock_ms", params: &[], ret: NativeType::I64 },
];

/// Look up a native by surface name.
pub fn lookup(name: &str) -> Option<(u8, &'static NativeDef)> {
    NATIVES
        .iter()
        .position(|def| def.name == name)
        .map(|index| (index as u8, &NATIVES[index]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let (index, def) = lookup("__sqrt").unwrap();
        assert_eq!(index, 0);
        assert_eq!(def.params.len(), 1);
        assert!(lookup("sqrt").is_none());
    }

    #[test]
    fn table_fits_one_byte_and_names_are_reserved() {
        assert!(NATIVES.len() <= u8::MAX as usize);
        for def in NATIVES {
            assert!(def.name.starts_with("__"), "{} must be reserved", def.name);
        }
    }
}
