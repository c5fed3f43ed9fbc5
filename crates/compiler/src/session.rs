//! Compilation session state shared across modules
//!
//! Globals and functions live in process-wide tables indexed 0..255 by
//! insertion order; every module compiled in a session allocates from the
//! same tables, which is what lets one module's bytecode refer to another
//! module's exports by slot. A [`ModuleUnit`] is the serializable result of
//! compiling one module: its chunk plus the table entries it introduced,
//! which is exactly what the bytecode cache needs to replay a load without
//! re-parsing.

use serde::{Deserialize, Serialize};

use orus_core::chunk::Chunk;
use orus_core::types::{StructDef, Type, TypeRegistry};
use orus_core::{FUNCTIONS_MAX, GLOBALS_MAX};

/// One entry in the process-wide global table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalEntry {
    pub name: String,
    pub ty: Type,
    pub mutable: bool,
    pub public: bool,
}

/// The global symbol table. Slots are assigned by insertion; shadowing a
/// name allocates a fresh slot and later lookups see the newest binding.
#[derive(Debug, Default)]
pub struct Globals {
    entries: Vec<GlobalEntry>,
}

impl Globals {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn define(&mut self, entry: GlobalEntry) -> Option<u8> {
        if self.entries.len() >= GLOBALS_MAX {
            return None;
        }
        self.entries.push(entry);
        Some((self.entries.len() - 1) as u8)
    }

    /// Newest slot bound to `name`.
    pub fn resolve(&self, name: &str) -> Option<u8> {
        self.entries
            .iter()
            .rposition(|entry| entry.name == name)
            .map(|slot| slot as u8)
    }

    pub fn entry(&self, slot: u8) -> Option<&GlobalEntry> {
        self.entries.get(slot as usize)
    }

    pub fn entries(&self) -> &[GlobalEntry] {
        &self.entries
    }
}

/// One entry in the process-wide function table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub arity: u8,
    /// Byte offset of the function body in its chunk.
    pub entry: u32,
    /// Which chunk the body lives in; assigned at registration.
    #[serde(skip)]
    pub chunk_id: u16,
    pub params: Vec<Type>,
    /// Global slots the parameters bind to, in declaration order.
    pub param_slots: Vec<u8>,
    pub ret: Type,
    pub public: bool,
}

#[derive(Debug, Default)]
pub struct FunctionTable {
    entries: Vec<FunctionInfo>,
}

impl FunctionTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn define(&mut self, info: FunctionInfo) -> Option<u8> {
        if self.entries.len() >= FUNCTIONS_MAX {
            return None;
        }
        self.entries.push(info);
        Some((self.entries.len() - 1) as u8)
    }

    pub fn resolve(&self, name: &str) -> Option<u8> {
        self.entries
            .iter()
            .rposition(|info| info.name == name)
            .map(|index| index as u8)
    }

    pub fn get(&self, index: u8) -> Option<&FunctionInfo> {
        self.entries.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u8) -> Option<&mut FunctionInfo> {
        self.entries.get_mut(index as usize)
    }

    pub fn entries(&self) -> &[FunctionInfo] {
        &self.entries
    }
}

/// Everything the compiler reads and extends while compiling a module.
#[derive(Debug, Default)]
pub struct Session {
    pub globals: Globals,
    pub functions: FunctionTable,
    pub types: TypeRegistry,
}

impl Session {
    pub fn new() -> Self {
        Session::default()
    }

    /// Replay a cached unit's table entries, assigning `chunk_id` to its
    /// functions. The caller has already verified the watermarks match.
    pub fn apply_unit(&mut self, unit: &ModuleUnit, chunk_id: u16) {
        for global in &unit.globals {
            self.globals.define(global.clone());
        }
        for function in &unit.functions {
            let mut info = function.clone();
            info.chunk_id = chunk_id;
            self.functions.define(info);
        }
        for def in &unit.structs {
            // A duplicate here means the struct was registered by an earlier
            // load of the same unit; keep the existing definition.
            let _ = self.types.register(def.clone());
        }
    }
}

/// The compiled form of one module (or of the entry program).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleUnit {
    pub chunk: Chunk,
    /// Table watermarks when compilation began; a cached unit only replays
    /// cleanly if the session is back at the same watermarks.
    pub base_global: u8,
    pub base_function: u8,
    /// Table entries introduced by this unit, in allocation order.
    pub globals: Vec<GlobalEntry>,
    pub functions: Vec<FunctionInfo>,
    pub structs: Vec<StructDef>,
    /// Module paths this unit imports, for cache loads to pre-load.
    pub imports: Vec<String>,
}

/// Magic prefix of a cached module image.
pub const UNIT_MAGIC: [u8; 4] = *b"ORSU";

impl ModuleUnit {
    /// Serialize for the bytecode cache: a raw little-endian header binding
    /// the image to its source mtime, then a bincode body.
    pub fn to_cache_bytes(&self, mtime: u64) -> Result<Vec<u8>, bincode::Error> {
        let mut out = Vec::new();
        out.extend_from_slice(&UNIT_MAGIC);
        out.extend_from_slice(&orus_core::CHUNK_VERSION.to_le_bytes());
        out.extend_from_slice(&mtime.to_le_bytes());
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    /// Deserialize a cached image; `None` on any magic/version/mtime
    /// mismatch so the caller falls back to recompiling.
    pub fn from_cache_bytes(bytes: &[u8], expected_mtime: u64) -> Option<ModuleUnit> {
        if bytes.len() < 14 || bytes[0..4] != UNIT_MAGIC {
            return None;
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != orus_core::CHUNK_VERSION {
            return None;
        }
        let mtime = u64::from_le_bytes(bytes[6..14].try_into().ok()?);
        if mtime != expected_mtime {
            return None;
        }
        bincode::deserialize(&bytes[14..]).ok()
    }

    /// Public globals and functions, i.e. the module's exports.
    pub fn exported_globals(&self) -> impl Iterator<Item = (&str, u8)> {
        self.globals.iter().enumerate().filter_map(|(offset, g)| {
            g.public
                .then_some((g.name.as_str(), self.base_global + offset as u8))
        })
    }

    pub fn exported_functions(&self) -> impl Iterator<Item = (&str, u8)> {
        self.functions.iter().enumerate().filter_map(|(offset, f)| {
            f.public
                .then_some((f.name.as_str(), self.base_function + offset as u8))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_resolve_newest_binding() {
        let mut globals = Globals::default();
        let first = globals
            .define(GlobalEntry {
                name: "x".to_string(),
                ty: Type::I32,
                mutable: true,
                public: false,
            })
            .unwrap();
        let second = globals
            .define(GlobalEntry {
                name: "x".to_string(),
                ty: Type::F64,
                mutable: false,
                public: false,
            })
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(globals.resolve("x"), Some(second));
    }

    #[test]
    fn global_table_is_bounded() {
        let mut globals = Globals::default();
        for i in 0..GLOBALS_MAX {
            assert!(
                globals
                    .define(GlobalEntry {
                        name: format!("g{}", i),
                        ty: Type::I32,
                        mutable: false,
                        public: false,
                    })
                    .is_some()
            );
        }
        assert!(
            globals
                .define(GlobalEntry {
                    name: "overflow".to_string(),
                    ty: Type::I32,
                    mutable: false,
                    public: false,
                })
                .is_none()
        );
    }

    #[test]
    fn unit_exports_only_public_entries() {
        let unit = ModuleUnit {
            chunk: Chunk::new(),
            base_global: 3,
            base_function: 1,
            globals: vec![
                GlobalEntry {
                    name: "hidden".to_string(),
                    ty: Type::I32,
                    mutable: false,
                    public: false,
                },
                GlobalEntry {
                    name: "shown".to_string(),
                    ty: Type::I32,
                    mutable: false,
                    public: true,
                },
            ],
            functions: Vec::new(),
            structs: Vec::new(),
            imports: Vec::new(),
        };
        let exports: Vec<_> = unit.exported_globals().collect();
        assert_eq!(exports, vec![("shown", 4)]);
    }

    #[test]
    fn apply_unit_replays_tables() {
        let mut session = Session::new();
        let unit = ModuleUnit {
            chunk: Chunk::new(),
            base_global: 0,
            base_function: 0,
            globals: vec![GlobalEntry {
                name: "pi".to_string(),
                ty: Type::F64,
                mutable: false,
                public: true,
            }],
            functions: vec![FunctionInfo {
                name: "sq".to_string(),
                arity: 1,
                entry: 3,
                chunk_id: 0,
                params: vec![Type::F64],
                param_slots: vec![1],
                ret: Type::F64,
                public: true,
            }],
            structs: Vec::new(),
            imports: Vec::new(),
        };
        session.apply_unit(&unit, 7);
        assert_eq!(session.globals.resolve("pi"), Some(0));
        let index = session.functions.resolve("sq").unwrap();
        assert_eq!(session.functions.get(index).unwrap().chunk_id, 7);
    }
}
