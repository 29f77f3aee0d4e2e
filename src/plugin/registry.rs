//! Owns every known plugin definition, loaded or not, and drives
//! load/reload/unload through a [`PluginCompiler`].
//!
//! Grounded on `original_source/Libraries/Plugin/Plugin.h`'s
//! `PluginRegistry`. The original stores libraries in caller-supplied
//! `Span` storage (no heap allocation); this crate uses a plain `Vec`,
//! the natural Rust encoding of the same "registry owns a flat array of
//! slots" shape (§3's "opaque-object storage" REDESIGN FLAG already
//! resolved this way for `Request`).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::CrateError;

use super::compiler::PluginCompiler;
use super::library::PluginDynamicLibrary;
use super::scanner::PluginDefinition;
use super::sysroot::PluginSysroot;

/// Whether [`PluginRegistry::load_plugin`] should load a not-yet-loaded
/// plugin or force a hot reload of an already-loaded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Load,
    Reload,
}

/// Registry of known plugins, each compiled to its own dynamic library.
pub struct PluginRegistry {
    libraries: Vec<PluginDynamicLibrary>,
    intermediates_dir: PathBuf,
}

impl PluginRegistry {
    /// Creates an empty registry that builds plugins under
    /// `intermediates_dir`.
    pub fn new(intermediates_dir: impl Into<PathBuf>) -> PluginRegistry {
        PluginRegistry {
            libraries: Vec::new(),
            intermediates_dir: intermediates_dir.into(),
        }
    }

    /// Replaces the registry's known definitions wholesale. Already-loaded
    /// plugins matching a new definition's identifier keep their loaded
    /// state; plugins with no surviving definition are unloaded and
    /// dropped.
    pub fn replace_definitions(&mut self, definitions: Vec<PluginDefinition>) -> Result<(), CrateError> {
        let mut next = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if let Some(pos) = self.libraries.iter().position(|lib| lib.definition.identifier == definition.identifier) {
                let mut existing = self.libraries.remove(pos);
                existing.definition = definition;
                next.push(existing);
            } else {
                next.push(PluginDynamicLibrary::new(definition));
            }
        }
        self.libraries = next;
        Ok(())
    }

    /// Loads (or, with `LoadMode::Reload`, hot-reloads) the plugin
    /// identified by `identifier`.
    pub fn load_plugin(
        &mut self,
        identifier: &str,
        compiler: &PluginCompiler,
        sysroot: &PluginSysroot,
        executable_path: &Path,
        load_mode: LoadMode,
    ) -> Result<(), CrateError> {
        let Some(library) = self.libraries.iter_mut().find(|lib| lib.definition.identifier == identifier) else {
            return Err(CrateError::InvalidState("no plugin registered with this identifier"));
        };

        if load_mode == LoadMode::Reload {
            library.unload()?;
        } else if library.is_loaded() {
            return Ok(());
        }

        library.load(compiler, sysroot, executable_path, &self.intermediates_dir)
    }

    /// Unloads the plugin identified by `identifier`, if loaded.
    pub fn unload_plugin(&mut self, identifier: &str) -> Result<(), CrateError> {
        let Some(library) = self.libraries.iter_mut().find(|lib| lib.definition.identifier == identifier) else {
            return Err(CrateError::InvalidState("no plugin registered with this identifier"));
        };
        library.unload()
    }

    /// Removes the compiled object/library build products for `identifier`.
    pub fn remove_all_build_products(&mut self, identifier: &str) -> Result<(), CrateError> {
        let Some(library) = self.libraries.iter().find(|lib| lib.definition.identifier == identifier) else {
            return Err(CrateError::InvalidState("no plugin registered with this identifier"));
        };
        let lib_path = library.definition.dynamic_library_path(&self.intermediates_dir);
        let _ = std::fs::remove_file(&lib_path);
        for file in &library.definition.files {
            if let Some(stem) = file.absolute_path.file_stem().and_then(|s| s.to_str()) {
                let ext = if cfg!(target_os = "windows") { "obj" } else { "o" };
                let _ = std::fs::remove_file(self.intermediates_dir.join(format!("{stem}.{ext}")));
            }
        }
        Ok(())
    }

    pub fn find_plugin(&self, identifier: &str) -> Option<&PluginDynamicLibrary> {
        self.libraries.iter().find(|lib| lib.definition.identifier == identifier)
    }

    pub fn number_of_entries(&self) -> usize {
        self.libraries.len()
    }

    pub fn identifier_at(&self, index: usize) -> &str {
        &self.libraries[index].definition.identifier
    }

    pub fn plugin_at(&self, index: usize) -> &PluginDynamicLibrary {
        &self.libraries[index]
    }

    /// Calls `on_plugin` with the identifier of every registered plugin
    /// whose source set contains a file ending in `relative_path` and
    /// whose last reload happened more than `tolerance` ago — the set that
    /// should be recompiled in response to that file changing.
    pub fn plugins_to_reload_because_of(&self, relative_path: &Path, tolerance: Duration, mut on_plugin: impl FnMut(&str)) {
        let now = SystemTime::now();
        for library in &self.libraries {
            let matches = library
                .definition
                .files
                .iter()
                .any(|file| file.absolute_path.ends_with(relative_path));
            if !matches {
                continue;
            }
            let age = now.duration_since(library.last_load_time).unwrap_or(Duration::ZERO);
            if age >= tolerance {
                on_plugin(&library.definition.identifier);
            }
        }
    }

    /// Unloads every plugin, in reverse registration order so dependents
    /// release their dependency's symbols first.
    pub fn close(&mut self) -> Result<(), CrateError> {
        for library in self.libraries.iter_mut().rev() {
            library.unload()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::scanner::PluginFile;

    fn sample_definition(identifier: &str) -> PluginDefinition {
        PluginDefinition {
            identifier: identifier.to_string(),
            name: identifier.to_string(),
            version: "1".to_string(),
            description: String::new(),
            category: String::new(),
            directory: PathBuf::from("/plugins").join(identifier),
            dependencies: Vec::new(),
            build: Vec::new(),
            files: vec![PluginFile { absolute_path: PathBuf::from("/plugins").join(identifier).join("main.cpp") }],
            main_file_index: 0,
        }
    }

    #[test]
    fn replace_definitions_preserves_loaded_state_across_rescans() {
        let mut registry = PluginRegistry::new("/tmp/intermediates");
        registry.replace_definitions(vec![sample_definition("alpha")]).unwrap();
        assert_eq!(registry.number_of_entries(), 1);

        // A later rescan that finds the same identifier again reuses the
        // same `PluginDynamicLibrary` slot (and its loaded state) instead
        // of starting over.
        registry.replace_definitions(vec![sample_definition("alpha")]).unwrap();
        assert_eq!(registry.number_of_entries(), 1);
        assert!(!registry.find_plugin("alpha").unwrap().is_loaded());
    }

    #[test]
    fn load_plugin_rejects_unknown_identifier() {
        let mut registry = PluginRegistry::new("/tmp/intermediates");
        let compiler = PluginCompiler {
            kind: super::super::compiler::CompilerKind::Gnu,
            compiler_path: PathBuf::from("cc"),
            linker_path: PathBuf::from("cc"),
            include_paths: Vec::new(),
        };
        let err = registry
            .load_plugin("missing", &compiler, &PluginSysroot::default(), Path::new("/bin/exe"), LoadMode::Load)
            .unwrap_err();
        assert!(matches!(err, CrateError::InvalidState(_)));
    }
}
