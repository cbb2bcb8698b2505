//! Dynamic plugin loading using libloading

use super::abi::{
    CreateFilterFn, GetFilterDescriptorsFn, CREATE_FILTER_SYMBOL, GET_FILTER_DESCRIPTORS_SYMBOL,
};
use super::module::PluginModule;
use devflow_core::{DevflowError, DevflowResult};
use libloading::Library;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Finds and opens plugin libraries
#[derive(Debug, Default)]
pub struct PluginLoader;

impl PluginLoader {
    pub fn new() -> Self {
        Self
    }

    /// Whether `path` has the platform's shared library extension
    pub fn is_library(path: &Path) -> bool {
        path.extension() == Some(OsStr::new(std::env::consts::DLL_EXTENSION))
    }

    /// Shared libraries directly inside `dir`, sorted by file name
    pub fn scan(&self, dir: &Path) -> DevflowResult<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir).map_err(|e| DevflowError::Plugin {
            path: dir.display().to_string(),
            reason: format!("cannot read directory: {}", e),
        })?;
        let mut libraries: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Self::is_library(path))
            .collect();
        libraries.sort();
        Ok(libraries)
    }

    /// Load one library
    ///
    /// The library is kept only if it exports at least one of the devflow
    /// entry points; otherwise it is unloaded again.
    ///
    /// # Safety
    ///
    /// Loading executes the library's initialisers, and its exported entry
    /// points are trusted to follow the plugin ABI.
    pub unsafe fn load_from_path(&self, path: &Path) -> DevflowResult<PluginModule> {
        let shown = path.display().to_string();
        // SAFETY: caller trusts the library
        let library = unsafe { Library::new(path) }.map_err(|e| DevflowError::Plugin {
            path: shown.clone(),
            reason: e.to_string(),
        })?;

        // SAFETY: symbol types match the ABI declarations
        let get_descriptors = unsafe { library.get::<GetFilterDescriptorsFn>(GET_FILTER_DESCRIPTORS_SYMBOL) }
            .ok()
            .map(|symbol| *symbol);
        let create = unsafe { library.get::<CreateFilterFn>(CREATE_FILTER_SYMBOL) }
            .ok()
            .map(|symbol| *symbol);
        debug!(
            path = %shown,
            descriptors = get_descriptors.is_some(),
            create = create.is_some(),
            "plugin entry points resolved"
        );

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| shown.clone());
        // SAFETY: the entry points come from `library`, which the module keeps alive
        unsafe { PluginModule::from_entry_points(&name, Some(Arc::new(library)), get_descriptors, create) }
            .map_err(|e| match e {
                DevflowError::Plugin { reason, .. } => DevflowError::Plugin {
                    path: shown,
                    reason,
                },
                other => other,
            })
    }

    /// Load every library in `dir`, one result per candidate file
    ///
    /// # Safety
    ///
    /// Same as [`PluginLoader::load_from_path`], for every library in `dir`.
    pub unsafe fn load_directory(&self, dir: &Path) -> DevflowResult<Vec<DevflowResult<PluginModule>>> {
        let libraries = self.scan(dir)?;
        Ok(libraries
            .iter()
            // SAFETY: forwarded from the caller
            .map(|path| unsafe { self.load_from_path(path) })
            .collect())
    }
}
