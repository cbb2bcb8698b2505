//! Filter module backed by plugin entry points

use super::abi::{
    event_parts_from_raw, CreateFilterFn, GetFilterDescriptorsFn, RawDeviceEvent, RawEventView,
    RawFilter, RawFilterDescriptor, RawGuid, DESCRIPTOR_FLAG_FEEDBACK_RECEIVER,
    DESCRIPTOR_FLAG_SYNCHRONOUS, STATUS_FAILED, STATUS_INVALID_ARGUMENT, STATUS_NOT_IMPLEMENTED,
    STATUS_OK,
};
use crate::filter::{Filter, FilterDescriptor, FilterOutput, Scheduling, Services};
use crate::registry::{FilterModule, ModuleError};
use devflow_core::{ConfigError, DeviceEvent, DevflowError, DevflowResult, FilterLink};
use libloading::Library;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

const CONFIG_ERROR_BUFFER: usize = 4096;

/// Filters provided by one plugin library
pub struct PluginModule {
    name: String,
    /// Kept alive for as long as any entry point or filter may be called
    library: Option<Arc<Library>>,
    descriptors: Vec<FilterDescriptor>,
    create: Option<CreateFilterFn>,
}

impl PluginModule {
    /// Build a module from resolved entry points
    ///
    /// `library` is `None` for entry points linked into the process itself.
    ///
    /// # Safety
    ///
    /// The entry points must follow the plugin ABI and remain callable for
    /// as long as `library` (or the process, when `None`) stays loaded.
    pub unsafe fn from_entry_points(
        name: &str,
        library: Option<Arc<Library>>,
        get_descriptors: Option<GetFilterDescriptorsFn>,
        create: Option<CreateFilterFn>,
    ) -> DevflowResult<Self> {
        if get_descriptors.is_none() && create.is_none() {
            return Err(DevflowError::Plugin {
                path: name.to_string(),
                reason: "no devflow entry point resolved".to_string(),
            });
        }
        let descriptors = match get_descriptors {
            // SAFETY: forwarded from the caller
            Some(get) => unsafe { read_descriptors(name, get)? },
            None => Vec::new(),
        };
        Ok(Self {
            name: name.to_string(),
            library,
            descriptors,
            create,
        })
    }
}

unsafe fn read_descriptors(
    module: &str,
    get: GetFilterDescriptorsFn,
) -> DevflowResult<Vec<FilterDescriptor>> {
    let mut begin: *const RawFilterDescriptor = std::ptr::null();
    let mut end: *const RawFilterDescriptor = std::ptr::null();
    // SAFETY: the entry point follows the ABI
    let status = unsafe { get(&mut begin, &mut end) };
    if status != STATUS_OK {
        return Err(DevflowError::Plugin {
            path: module.to_string(),
            reason: format!("descriptor query returned status {}", status),
        });
    }
    if begin.is_null() || end.is_null() || end < begin {
        return Ok(Vec::new());
    }

    // SAFETY: [begin, end) is a descriptor range owned by the library
    let count = unsafe { end.offset_from(begin) } as usize;
    let raw = unsafe { std::slice::from_raw_parts(begin, count) };
    Ok(raw
        .iter()
        .map(|descriptor| {
            let name = if descriptor.name.is_null() {
                Uuid::from(descriptor.id).to_string()
            } else {
                // SAFETY: the ABI requires a NUL-terminated name
                unsafe { CStr::from_ptr(descriptor.name) }
                    .to_string_lossy()
                    .into_owned()
            };
            FilterDescriptor {
                id: Uuid::from(descriptor.id),
                name,
                scheduling: if descriptor.flags & DESCRIPTOR_FLAG_SYNCHRONOUS != 0 {
                    Scheduling::Synchronous
                } else {
                    Scheduling::Asynchronous
                },
                feedback_receiver: descriptor.flags & DESCRIPTOR_FLAG_FEEDBACK_RECEIVER != 0,
            }
        })
        .collect())
}

impl FilterModule for PluginModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptors(&self) -> Vec<FilterDescriptor> {
        self.descriptors.clone()
    }

    fn create_filter(&self, filter_id: &Uuid) -> Result<Box<dyn Filter>, ModuleError> {
        let create = self.create.ok_or(ModuleError::NotImplemented)?;
        let id = RawGuid::from(*filter_id);
        let mut raw = RawFilter::empty();

        // SAFETY: entry point validated at load, library kept alive by self
        let status = unsafe { create(&id, &mut raw) };
        match status {
            STATUS_OK => {}
            STATUS_NOT_IMPLEMENTED => return Err(ModuleError::NotImplemented),
            code => return Err(ModuleError::Status(code)),
        }
        if raw.vtable.is_null() {
            return Err(ModuleError::Failed("plugin returned a filter without vtable".into()));
        }
        Ok(Box::new(PluginFilter {
            raw,
            _library: self.library.clone(),
        }))
    }
}

/// Filter instance living inside a plugin
pub struct PluginFilter {
    raw: RawFilter,
    _library: Option<Arc<Library>>,
}

// SAFETY: the ABI requires instances to be movable between threads; the
// engine never calls one instance from two threads at once.
unsafe impl Send for PluginFilter {}

impl Filter for PluginFilter {
    fn configure(&mut self, link: &FilterLink, _services: &Services) -> Result<(), Vec<ConfigError>> {
        let json = serde_json::to_string(link)
            .map_err(|e| vec![ConfigError::general(format!("cannot encode link: {}", e))])?;
        let json = CString::new(json)
            .map_err(|e| vec![ConfigError::general(format!("cannot encode link: {}", e))])?;
        let mut errors = vec![0u8; CONFIG_ERROR_BUFFER];

        // SAFETY: vtable checked non-null at creation; buffers outlive the call
        let status = unsafe {
            ((*self.raw.vtable).configure)(
                self.raw.instance,
                json.as_ptr(),
                errors.as_mut_ptr().cast::<c_char>(),
                errors.len(),
            )
        };
        if status == STATUS_OK {
            return Ok(());
        }

        let text = CStr::from_bytes_until_nul(&errors)
            .map(|text| text.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut problems: Vec<ConfigError> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ConfigError::general)
            .collect();
        if problems.is_empty() {
            problems.push(ConfigError::general(format!(
                "plugin rejected configuration with status {}",
                status
            )));
        }
        Err(problems)
    }

    fn execute(&mut self, event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
        let mut context = EmitContext {
            output,
            failure: None,
        };
        let view = RawEventView::new(&event);

        // SAFETY: the view borrows `event` for the duration of the call and
        // the context outlives it
        let status = unsafe {
            ((*self.raw.vtable).execute)(
                self.raw.instance,
                view.as_ptr(),
                emit_trampoline,
                (&mut context as *mut EmitContext<'_, '_>).cast::<c_void>(),
            )
        };
        drop(view);
        drop(event);

        if let Some(failure) = context.failure {
            return Err(failure);
        }
        if status != STATUS_OK {
            return Err(DevflowError::filter_failed(format!(
                "plugin execute returned status {}",
                status
            )));
        }
        Ok(())
    }
}

impl Drop for PluginFilter {
    fn drop(&mut self) {
        // SAFETY: vtable checked at creation; the instance is never used again
        unsafe { ((*self.raw.vtable).destroy)(self.raw.instance) };
    }
}

struct EmitContext<'a, 'b> {
    output: &'a FilterOutput<'b>,
    failure: Option<DevflowError>,
}

unsafe extern "C" fn emit_trampoline(context: *mut c_void, event: *const RawDeviceEvent) -> i32 {
    if context.is_null() || event.is_null() {
        return STATUS_INVALID_ARGUMENT;
    }
    // SAFETY: `context` is the EmitContext passed to execute, still on its stack
    let context = unsafe { &mut *context.cast::<EmitContext<'_, '_>>() };
    // SAFETY: the plugin hands a valid event for the duration of the call
    let raw = unsafe { &*event };

    let output = context.output;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: payload pointers are valid per the ABI
        let parts = unsafe { event_parts_from_raw(raw) }?;
        let event = output.events().from_parts(parts)?;
        output.send(event)
    }));

    match result {
        Ok(Ok(())) => STATUS_OK,
        Ok(Err(error)) => {
            context.failure.get_or_insert(error);
            STATUS_FAILED
        }
        Err(_) => {
            context
                .failure
                .get_or_insert_with(|| DevflowError::filter_failed("panic while emitting"));
            STATUS_FAILED
        }
    }
}
