//! Compiles Lua sources into reusable bytecode units.
//!
//! Sources are compiled once at startup (or on extension reload) and the
//! resulting bytecode is loaded into every interpreter built for that path,
//! so no interpreter ever parses source text.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlua::Lua;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::registry::CompiledUnitRegistry;
use crate::{CastroError, Result};

/// A compiled script, ready to be loaded into an interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledUnit {
    /// Normalised virtual path (`pages/index.lua`).
    pub path: String,
    /// File the unit was compiled from.
    pub source_path: PathBuf,
    /// Dumped Lua function.
    pub bytecode: Vec<u8>,
    /// Hex SHA-256 of the source text.
    pub digest: String,
}

impl CompiledUnit {
    /// Short digest prefix for log lines.
    pub fn short_digest(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}

/// Normalise a virtual path: forward slashes, lowercase, no leading `./` or `/`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/").to_lowercase();
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized.trim_start_matches('/').to_string()
}

/// Compiler for Lua script trees.
///
/// Holds a scratch Lua state used only for parsing. The state never runs any
/// code.
pub struct ProtoCompiler {
    lua: Lua,
}

impl ProtoCompiler {
    pub fn new() -> Self {
        Self { lua: Lua::new() }
    }

    /// Compile every `*.lua` file under `root`, mounted under the name of the
    /// directory itself (`<root>/index.lua` becomes `pages/index.lua` for a
    /// root named `pages`).
    pub fn compile_all(&self, root: &Path) -> Result<CompiledUnitRegistry> {
        let mount = root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                CastroError::Validation(format!("cannot mount script root {}", root.display()))
            })?;
        self.compile_tree(root, &mount)
    }

    /// Compile every `*.lua` file under `root`, mounted under `mount`.
    ///
    /// The walk is sorted by file name. The first failure aborts the whole
    /// tree and nothing from it is returned.
    pub fn compile_tree(&self, root: &Path, mount: &str) -> Result<CompiledUnitRegistry> {
        let mut files = Vec::new();
        scan_directory(root, &mut files)?;

        let mut registry = CompiledUnitRegistry::new();
        for file in files {
            let relative = file.strip_prefix(root).unwrap_or(&file);
            let virtual_path = format!("{}/{}", mount, relative.to_string_lossy());
            let unit = self.compile_one(&file, &virtual_path)?;
            debug!("Compiled {} ({})", unit.path, unit.short_digest());
            registry.insert(Arc::new(unit));
        }

        info!(
            "Compiled {} scripts from {} as {}/",
            registry.len(),
            root.display(),
            mount
        );
        Ok(registry)
    }

    /// Compile a single source file under the given virtual path.
    pub fn compile_one(&self, source_path: &Path, virtual_path: &str) -> Result<CompiledUnit> {
        let source = fs::read_to_string(source_path)?;
        let path = normalize_path(virtual_path);

        let function = self
            .lua
            .load(source.as_str())
            .set_name(format!("@{path}"))
            .into_function()
            .map_err(|e| CastroError::Compile {
                path: source_path.display().to_string(),
                message: e.to_string(),
            })?;

        Ok(CompiledUnit {
            path,
            source_path: source_path.to_path_buf(),
            bytecode: function.dump(false),
            digest: format!("{:x}", Sha256::digest(source.as_bytes())),
        })
    }
}

impl Default for ProtoCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Collect `.lua` files under `dir`, recursing into subdirectories, sorted by
/// file name at every level.
pub(crate) fn scan_directory(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            scan_directory(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "lua") {
            files.push(path);
        }
    }

    Ok(())
}
