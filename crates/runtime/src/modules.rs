//! Module loading
//!
//! `compile_module` resolves a module path to source (disk first, then the
//! stdlib directory, then the embedded stdlib), compiles it against the
//! shared session, and registers it. A loading stack detects import cycles.
//! Compiled modules are cached as `<stem>.obc` images keyed by source mtime;
//! a stale, foreign, or watermark-mismatched cache file is ignored and the
//! module recompiles.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use orus_core::diag::{Diagnostic, RuntimeErrorKind, Span};
use orusc::{CompileOptions, ImportMap, ImportedModule, ModuleUnit, compile, parse, use_paths};

use crate::interpreter::Interpreter;

/// A registered module.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub path: String,
    pub chunk_id: u16,
    pub executed: bool,
    pub disk_path: Option<PathBuf>,
    pub mtime: u64,
    pub from_embedded: bool,
    pub exports_globals: Vec<(String, u8)>,
    pub exports_functions: Vec<(String, u8)>,
}

/// Module registry plus resolution configuration.
#[derive(Debug, Default)]
pub struct ModuleLoader {
    registry: Vec<Module>,
    by_path: HashMap<String, usize>,
    loading: Vec<String>,
    pub std_path: Option<PathBuf>,
    pub cache_path: Option<PathBuf>,
}

/// Source text resolved for a module.
enum ResolvedSource {
    Disk {
        source: String,
        disk_path: PathBuf,
        mtime: u64,
    },
    Embedded(&'static str),
}

/// Last path segment without the source extension.
fn module_stem(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    base.strip_suffix(".orus").unwrap_or(base)
}

impl ModuleLoader {
    pub fn new() -> Self {
        ModuleLoader::default()
    }

    pub fn module_index(&self, path: &str) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    pub fn module(&self, index: usize) -> &Module {
        &self.registry[index]
    }

    pub fn chunk_id(&self, index: usize) -> u16 {
        self.registry[index].chunk_id
    }

    /// Flip `executed` on, returning whether the module had already run.
    pub fn mark_executed(&mut self, index: usize) -> bool {
        std::mem::replace(&mut self.registry[index].executed, true)
    }

    /// The exports of every registered module, keyed by module path.
    pub fn import_map(&self) -> ImportMap {
        self.registry
            .iter()
            .map(|module| {
                (
                    module.path.clone(),
                    ImportedModule {
                        globals: module.exports_globals.iter().cloned().collect(),
                        functions: module.exports_functions.iter().cloned().collect(),
                    },
                )
            })
            .collect()
    }

    fn resolve_source(&self, path: &str) -> Option<ResolvedSource> {
        let candidates = std::iter::once(PathBuf::from(path))
            .chain(self.std_path.iter().map(|root| root.join(path)));
        for candidate in candidates {
            if let Ok(source) = fs::read_to_string(&candidate) {
                let mtime = fs::metadata(&candidate)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                    .map(|duration| duration.as_secs())
                    .unwrap_or(0);
                return Some(ResolvedSource::Disk {
                    source,
                    disk_path: candidate,
                    mtime,
                });
            }
        }
        orusc::stdlib_embed::get_stdlib(path).map(ResolvedSource::Embedded)
    }

    fn cache_file(&self, path: &str) -> Option<PathBuf> {
        self.cache_path
            .as_ref()
            .map(|root| root.join(module_stem(path)).with_extension("obc"))
    }
}

impl Interpreter {
    /// Load, compile, cache, and register a module (and, recursively, its
    /// imports). Already-registered modules return immediately; a module
    /// found on the loading stack is an import cycle.
    pub fn compile_module(&mut self, path: &str) -> Result<(), Diagnostic> {
        if self.loader.by_path.contains_key(path) {
            return Ok(());
        }
        if self.loader.loading.iter().any(|loading| loading == path) {
            // Report the module whose compilation discovered the cycle.
            let reporter = self
                .loader
                .loading
                .last()
                .map(|p| module_stem(p).to_string())
                .unwrap_or_else(|| module_stem(path).to_string());
            return Err(Diagnostic::runtime(
                RuntimeErrorKind::ImportCycle,
                format!("Import cycle detected for module `{}`", reporter),
                Span::new(path, 0, 0, 1),
            ));
        }

        self.loader.loading.push(path.to_string());
        let result = self.compile_module_inner(path);
        self.loader.loading.pop();
        result
    }

    fn compile_module_inner(&mut self, path: &str) -> Result<(), Diagnostic> {
        let Some(resolved) = self.loader.resolve_source(path) else {
            return Err(Diagnostic::runtime(
                RuntimeErrorKind::ModuleNotFound,
                format!("module '{}' not found", path),
                Span::new(path, 0, 0, 1),
            ));
        };

        let (source, disk_path, mtime, from_embedded, display) = match resolved {
            ResolvedSource::Disk {
                source,
                disk_path,
                mtime,
            } => {
                let display = disk_path.to_string_lossy().into_owned();
                (source, Some(disk_path), mtime, false, display)
            }
            ResolvedSource::Embedded(source) => (
                source.to_string(),
                None,
                0,
                true,
                format!("<stdlib:{}>", path),
            ),
        };

        // A fresh cache image skips parsing and compilation entirely.
        if disk_path.is_some() {
            if let Some(unit) = self.try_load_cache(path, mtime) {
                for import in unit.imports.clone() {
                    self.compile_module(&import)?;
                }
                if unit.base_global as usize == self.session.globals.len()
                    && unit.base_function as usize == self.session.functions.len()
                {
                    tracing::debug!(path, "loaded module from bytecode cache");
                    let chunk_id = self.chunks.len() as u16;
                    self.session.apply_unit(&unit, chunk_id);
                    self.register_module(path, &unit, chunk_id, disk_path, mtime, from_embedded);
                    self.chunks.push(unit.chunk);
                    self.chunk_files.push(display);
                    return Ok(());
                }
                tracing::debug!(path, "cache image does not match session watermarks");
            }
        }

        let program = parse(&source, &display).map_err(|mut diagnostics| {
            diagnostics.truncate(1);
            diagnostics.pop().expect("parse failed with no diagnostics")
        })?;

        for import in use_paths(&program) {
            self.compile_module(&import)?;
        }
        let imports = self.loader.import_map();

        let chunk_id = self.chunks.len() as u16;
        let stem = module_stem(path).to_string();
        let opts = CompileOptions {
            file: &display,
            module_name: Some(&stem),
            chunk_id,
            repl: false,
        };
        let unit = compile(&program, &opts, &mut self.session, &imports).map_err(
            |mut diagnostics| {
                diagnostics.truncate(1);
                diagnostics
                    .pop()
                    .expect("compile failed with no diagnostics")
            },
        )?;

        if disk_path.is_some() {
            self.write_cache(path, &unit, mtime);
        }
        self.register_module(path, &unit, chunk_id, disk_path, mtime, from_embedded);
        self.chunks.push(unit.chunk);
        self.chunk_files.push(display);
        Ok(())
    }

    fn register_module(
        &mut self,
        path: &str,
        unit: &ModuleUnit,
        chunk_id: u16,
        disk_path: Option<PathBuf>,
        mtime: u64,
        from_embedded: bool,
    ) {
        let module = Module {
            name: module_stem(path).to_string(),
            path: path.to_string(),
            chunk_id,
            executed: false,
            disk_path,
            mtime,
            from_embedded,
            exports_globals: unit
                .exported_globals()
                .map(|(name, slot)| (name.to_string(), slot))
                .collect(),
            exports_functions: unit
                .exported_functions()
                .map(|(name, index)| (name.to_string(), index))
                .collect(),
        };
        let index = self.loader.registry.len();
        self.loader.registry.push(module);
        self.loader.by_path.insert(path.to_string(), index);
    }

    fn try_load_cache(&self, path: &str, mtime: u64) -> Option<ModuleUnit> {
        let cache_file = self.loader.cache_file(path)?;
        let bytes = fs::read(&cache_file).ok()?;
        ModuleUnit::from_cache_bytes(&bytes, mtime)
    }

    fn write_cache(&self, path: &str, unit: &ModuleUnit, mtime: u64) {
        let Some(cache_file) = self.loader.cache_file(path) else {
            return;
        };
        let Ok(bytes) = unit.to_cache_bytes(mtime) else {
            return;
        };
        if let Some(parent) = cache_file.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match fs::write(&cache_file, bytes) {
            Ok(()) => tracing::debug!(path, cache = %cache_file.display(), "wrote bytecode cache"),
            Err(error) => tracing::debug!(path, %error, "could not write bytecode cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_stem_strips_directories_and_extension() {
        assert_eq!(module_stem("std/math.orus"), "math");
        assert_eq!(module_stem("B.orus"), "B");
        assert_eq!(module_stem("plain"), "plain");
    }
}
