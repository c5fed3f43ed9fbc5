//! Embedded standard library
//!
//! Stdlib modules are embedded at compile time so the interpreter is fully
//! self-contained; the module loader consults this table after disk
//! resolution fails. Keys are slash-joined module paths as they appear in
//! `use` statements (`use std::math` -> `std/math.orus`).

use std::collections::HashMap;
use std::sync::LazyLock;

static STDLIB: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    m.insert("std/math.orus", include_str!("../stdlib/math.orus"));
    m.insert("std/arrays.orus", include_str!("../stdlib/arrays.orus"));
    m
});

/// Get an embedded stdlib module by path.
pub fn get_stdlib(path: &str) -> Option<&'static str> {
    STDLIB.get(path).copied()
}

/// Check whether a stdlib module exists (embedded).
pub fn has_stdlib(path: &str) -> bool {
    STDLIB.contains_key(path)
}

/// List all embedded stdlib module paths.
pub fn list_stdlib() -> Vec<&'static str> {
    STDLIB.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_stdlib_exists() {
        assert!(has_stdlib("std/math.orus"));
        let content = get_stdlib("std/math.orus").unwrap();
        assert!(content.contains("sqrt"));
    }

    #[test]
    fn arrays_stdlib_exists() {
        assert!(has_stdlib("std/arrays.orus"));
        assert!(get_stdlib("std/arrays.orus").unwrap().contains("len"));
    }

    #[test]
    fn nonexistent_stdlib() {
        assert!(!has_stdlib("std/nonexistent.orus"));
        assert!(get_stdlib("std/nonexistent.orus").is_none());
    }
}
