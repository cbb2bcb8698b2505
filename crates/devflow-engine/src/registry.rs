//! Registry of filter modules
//!
//! A module is anything that can publish filter descriptors and build filter
//! instances by type id: the built-in filter set, or a plugin library loaded
//! at startup. Filter creation asks each module in registration order and
//! stops at the first one that recognises the type.

use crate::filter::{Filter, FilterDescriptor};
use crate::plugin::PluginLoader;
use devflow_core::{DevflowError, DevflowResult};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a module did not produce a filter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// The module does not provide this filter type; ask the next one
    #[error("filter type not implemented by this module")]
    NotImplemented,

    /// The module provides the type but creation failed
    #[error("{0}")]
    Failed(String),

    /// A plugin returned an unexpected status code
    #[error("module returned status {0}")]
    Status(i32),
}

/// Source of filter types
pub trait FilterModule: Send + Sync {
    fn name(&self) -> &str;

    /// Every filter type this module can create
    fn descriptors(&self) -> Vec<FilterDescriptor>;

    /// Create a fresh filter instance
    fn create_filter(&self, filter_id: &Uuid) -> Result<Box<dyn Filter>, ModuleError>;
}

/// Ordered collection of filter modules
#[derive(Default)]
pub struct FilterRegistry {
    modules: RwLock<Vec<Arc<dyn FilterModule>>>,
}

impl FilterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in filter set
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(crate::filters::BuiltinModule));
        registry
    }

    /// Append a module; earlier modules win ties
    pub fn register(&self, module: Arc<dyn FilterModule>) {
        debug!(module = module.name(), "filter module registered");
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(module);
    }

    /// Load every plugin library found in `dir`
    ///
    /// Libraries that fail to load, or that resolve none of the entry points,
    /// are skipped with a warning. Returns how many modules were added.
    ///
    /// # Safety
    ///
    /// Loading a library runs its initialisers, and its entry points are
    /// trusted to follow the plugin ABI. Only point this at trusted
    /// directories.
    pub unsafe fn load_directory(&self, dir: impl AsRef<Path>) -> DevflowResult<usize> {
        let dir = dir.as_ref();
        let loader = PluginLoader::new();
        // SAFETY: forwarded from the caller
        let results = unsafe { loader.load_directory(dir)? };

        let mut loaded = 0;
        for result in results {
            match result {
                Ok(module) => {
                    info!(
                        module = module.name(),
                        filters = module.descriptors().len(),
                        "plugin loaded"
                    );
                    self.register(Arc::new(module));
                    loaded += 1;
                }
                Err(error) => warn!(%error, "plugin skipped"),
            }
        }
        Ok(loaded)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules()
            .iter()
            .map(|module| module.name().to_string())
            .collect()
    }

    /// Descriptors of every module, in registration order
    pub fn descriptors(&self) -> Vec<FilterDescriptor> {
        self.modules()
            .iter()
            .flat_map(|module| module.descriptors())
            .collect()
    }

    pub fn descriptor(&self, filter_id: &Uuid) -> Option<FilterDescriptor> {
        self.descriptors().into_iter().find(|d| d.id == *filter_id)
    }

    /// Case-insensitive lookup by descriptor name
    pub fn find_by_name(&self, name: &str) -> Option<FilterDescriptor> {
        self.descriptors()
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Create the filter for link `link`, first module to recognise it wins
    ///
    /// A module that recognises the type but fails ends the search; its
    /// error is returned rather than trying further modules.
    pub fn resolve(
        &self,
        link: usize,
        filter_id: &Uuid,
    ) -> DevflowResult<(FilterDescriptor, Box<dyn Filter>)> {
        for module in self.modules().iter() {
            match module.create_filter(filter_id) {
                Ok(filter) => {
                    let descriptor = module
                        .descriptors()
                        .into_iter()
                        .find(|d| d.id == *filter_id)
                        .unwrap_or_else(|| FilterDescriptor::new(*filter_id, &filter_id.to_string()));
                    debug!(link, module = module.name(), filter = %descriptor.name, "filter created");
                    return Ok((descriptor, filter));
                }
                Err(ModuleError::NotImplemented) => continue,
                Err(error) => {
                    return Err(DevflowError::FilterCreation {
                        module: module.name().to_string(),
                        filter_id: *filter_id,
                        reason: error.to_string(),
                    })
                }
            }
        }
        Err(DevflowError::UnknownFilter {
            link,
            filter_id: *filter_id,
        })
    }

    fn modules(&self) -> Vec<Arc<dyn FilterModule>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOutput;
    use devflow_core::DeviceEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHARED: Uuid = Uuid::from_u128(0x51);

    struct Nop;

    impl Filter for Nop {
        fn execute(&mut self, event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
            output.send(event)
        }
    }

    enum Behaviour {
        Unknown,
        Broken,
        Works,
    }

    struct FakeModule {
        name: &'static str,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    impl FilterModule for FakeModule {
        fn name(&self) -> &str {
            self.name
        }

        fn descriptors(&self) -> Vec<FilterDescriptor> {
            match self.behaviour {
                Behaviour::Unknown => Vec::new(),
                _ => vec![FilterDescriptor::new(SHARED, self.name)],
            }
        }

        fn create_filter(&self, filter_id: &Uuid) -> Result<Box<dyn Filter>, ModuleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *filter_id != SHARED {
                return Err(ModuleError::NotImplemented);
            }
            match self.behaviour {
                Behaviour::Unknown => Err(ModuleError::NotImplemented),
                Behaviour::Broken => Err(ModuleError::Failed("calibration table missing".into())),
                Behaviour::Works => Ok(Box::new(Nop)),
            }
        }
    }

    fn module(name: &'static str, behaviour: Behaviour) -> (Arc<dyn FilterModule>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let module = Arc::new(FakeModule {
            name,
            behaviour,
            calls: calls.clone(),
        });
        (module, calls)
    }

    #[test]
    fn test_first_recognising_module_wins() {
        let registry = FilterRegistry::new();
        let (a, a_calls) = module("a", Behaviour::Unknown);
        let (b, _) = module("b", Behaviour::Works);
        let (c, c_calls) = module("c", Behaviour::Works);
        registry.register(a);
        registry.register(b);
        registry.register(c);

        let (descriptor, _filter) = registry.resolve(0, &SHARED).unwrap();
        assert_eq!(descriptor.name, "b");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_module_failure_is_not_masked() {
        let registry = FilterRegistry::new();
        let (broken, _) = module("broken", Behaviour::Broken);
        let (works, works_calls) = module("works", Behaviour::Works);
        registry.register(broken);
        registry.register(works);

        match registry.resolve(2, &SHARED) {
            Err(DevflowError::FilterCreation { module, reason, .. }) => {
                assert_eq!(module, "broken");
                assert!(reason.contains("calibration"));
            }
            other => panic!("unexpected: {:?}", other.map(|(d, _)| d)),
        }
        assert_eq!(works_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_filter_names_the_link() {
        let registry = FilterRegistry::new();
        let (a, _) = module("a", Behaviour::Works);
        registry.register(a);

        let missing = Uuid::from_u128(0xdead);
        match registry.resolve(4, &missing) {
            Err(DevflowError::UnknownFilter { link, filter_id }) => {
                assert_eq!(link, 4);
                assert_eq!(filter_id, missing);
            }
            other => panic!("unexpected: {:?}", other.map(|(d, _)| d)),
        }
    }

    #[test]
    fn test_builtin_lookup_by_name() {
        let registry = FilterRegistry::with_builtin();
        assert!(registry.find_by_name("Identity").is_some());
        assert!(registry.find_by_name("decoupler").is_some());
        assert!(registry.find_by_name("no such filter").is_none());
        assert_eq!(registry.module_names(), vec!["builtin".to_string()]);
    }
}
