//! C ABI shared with filter plugin libraries
//!
//! A plugin library exports up to two symbols:
//!
//! - `devflow_get_filter_descriptors(begin, end)` fills a `[begin, end)`
//!   range of [`RawFilterDescriptor`]s that stays valid while the library is
//!   loaded
//! - `devflow_create_filter(id, out)` creates a filter instance, returning
//!   [`STATUS_NOT_IMPLEMENTED`] for types it does not provide
//!
//! Every call returns a status code: [`STATUS_OK`], [`STATUS_NOT_IMPLEMENTED`]
//! or a negative failure code. Link parameters cross the boundary as JSON
//! text. Events cross as [`RawDeviceEvent`] views borrowed for one call.

use devflow_core::{
    DeviceEvent, DeviceTime, DevflowError, DevflowResult, EventKind, EventParts, Payload,
    SegmentId, SignalId,
};
use std::ffi::{c_char, c_void};
use std::marker::PhantomData;
use uuid::Uuid;

pub const STATUS_OK: i32 = 0;
pub const STATUS_NOT_IMPLEMENTED: i32 = 1;
pub const STATUS_FAILED: i32 = -1;
pub const STATUS_INVALID_ARGUMENT: i32 = -2;

/// Filter runs inline on the caller's thread
pub const DESCRIPTOR_FLAG_SYNCHRONOUS: u32 = 1;
/// Filter registers as a feedback receiver
pub const DESCRIPTOR_FLAG_FEEDBACK_RECEIVER: u32 = 1 << 1;

pub const GET_FILTER_DESCRIPTORS_SYMBOL: &[u8] = b"devflow_get_filter_descriptors\0";
pub const CREATE_FILTER_SYMBOL: &[u8] = b"devflow_create_filter\0";

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawGuid {
    pub bytes: [u8; 16],
}

impl From<Uuid> for RawGuid {
    fn from(value: Uuid) -> Self {
        Self {
            bytes: *value.as_bytes(),
        }
    }
}

impl From<RawGuid> for Uuid {
    fn from(value: RawGuid) -> Self {
        Uuid::from_bytes(value.bytes)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawFilterDescriptor {
    pub id: RawGuid,
    /// NUL-terminated UTF-8
    pub name: *const c_char,
    pub flags: u32,
}

/// Borrowed event layout
///
/// `level` is meaningful for level kinds, `parameters` for parameter kinds
/// and `text` (UTF-8, not NUL-terminated) for text kinds.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDeviceEvent {
    pub kind: u32,
    /// Zero asks the engine for a fresh clock
    pub logical_clock: u64,
    pub device_time: f64,
    pub segment_id: u64,
    pub signal_id: RawGuid,
    pub level: f64,
    pub parameters: *const f64,
    pub parameters_len: usize,
    pub text: *const u8,
    pub text_len: usize,
}

/// Callback a plugin uses to forward an event downstream
pub type EmitFn = unsafe extern "C" fn(context: *mut c_void, event: *const RawDeviceEvent) -> i32;

#[repr(C)]
pub struct RawFilterVTable {
    /// Writes a NUL-terminated, newline separated error list into `errors`
    /// when the configuration is rejected
    pub configure: unsafe extern "C" fn(
        instance: *mut c_void,
        link_json: *const c_char,
        errors: *mut c_char,
        errors_len: usize,
    ) -> i32,
    pub execute: unsafe extern "C" fn(
        instance: *mut c_void,
        event: *const RawDeviceEvent,
        emit: EmitFn,
        emit_context: *mut c_void,
    ) -> i32,
    pub destroy: unsafe extern "C" fn(instance: *mut c_void),
}

#[repr(C)]
pub struct RawFilter {
    pub instance: *mut c_void,
    pub vtable: *const RawFilterVTable,
}

impl RawFilter {
    pub fn empty() -> Self {
        Self {
            instance: std::ptr::null_mut(),
            vtable: std::ptr::null(),
        }
    }
}

pub type GetFilterDescriptorsFn = unsafe extern "C" fn(
    begin: *mut *const RawFilterDescriptor,
    end: *mut *const RawFilterDescriptor,
) -> i32;

pub type CreateFilterFn =
    unsafe extern "C" fn(filter_id: *const RawGuid, filter: *mut RawFilter) -> i32;

/// Raw view of an event, valid while the event is borrowed
pub struct RawEventView<'a> {
    raw: RawDeviceEvent,
    _event: PhantomData<&'a DeviceEvent>,
}

impl<'a> RawEventView<'a> {
    pub fn new(event: &'a DeviceEvent) -> Self {
        let (parameters, parameters_len) = match event.parameters() {
            Some(values) => (values.as_ptr(), values.len()),
            None => (std::ptr::null(), 0),
        };
        let (text, text_len) = match event.text() {
            Some(text) => (text.as_ptr(), text.len()),
            None => (std::ptr::null(), 0),
        };
        Self {
            raw: RawDeviceEvent {
                kind: event.kind().code(),
                logical_clock: event.logical_clock(),
                device_time: event.device_time.as_days(),
                segment_id: event.segment_id.0,
                signal_id: RawGuid::from(event.signal_id.0),
                level: event.level().unwrap_or(0.0),
                parameters,
                parameters_len,
                text,
                text_len,
            },
            _event: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *const RawDeviceEvent {
        &self.raw
    }
}

/// Copy a raw event into owned parts
///
/// # Safety
///
/// `parameters` and `text` must point to `parameters_len` doubles and
/// `text_len` bytes respectively, or be null with a zero length.
pub unsafe fn event_parts_from_raw(raw: &RawDeviceEvent) -> DevflowResult<EventParts> {
    let kind = EventKind::from_code(raw.kind).ok_or_else(|| DevflowError::InvalidSource {
        reason: format!("unknown event kind code {}", raw.kind),
    })?;

    let payload = match kind.default_payload() {
        Payload::Level(_) => Payload::Level(raw.level),
        Payload::Parameters(_) => {
            // SAFETY: forwarded from the caller
            Payload::Parameters(unsafe { raw_slice(raw.parameters, raw.parameters_len)? }.to_vec())
        }
        Payload::Text(_) => {
            // SAFETY: forwarded from the caller
            let bytes = unsafe { raw_slice(raw.text, raw.text_len)? };
            let text = std::str::from_utf8(bytes).map_err(|e| DevflowError::InvalidSource {
                reason: format!("event text is not UTF-8: {}", e),
            })?;
            Payload::Text(text.to_string())
        }
        Payload::None => Payload::None,
    };

    Ok(EventParts {
        kind: raw.kind,
        logical_clock: raw.logical_clock,
        device_time: DeviceTime::from_days(raw.device_time),
        segment_id: SegmentId(raw.segment_id),
        signal_id: SignalId(Uuid::from(raw.signal_id)),
        payload,
    })
}

unsafe fn raw_slice<'a, T>(data: *const T, len: usize) -> DevflowResult<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    if data.is_null() {
        return Err(DevflowError::InvalidSource {
            reason: "null payload with non-zero length".to_string(),
        });
    }
    // SAFETY: non-null, length promised by the caller
    Ok(unsafe { std::slice::from_raw_parts(data, len) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::EventFactory;

    #[test]
    fn test_view_and_back() {
        let events = EventFactory::new();
        let event = events.parameters(SignalId::from_u128(7), SegmentId(3), vec![1.0, 2.5, -4.0]);
        let clock = event.logical_clock();

        let view = RawEventView::new(&event);
        // SAFETY: the view borrows `event`, which is still alive
        let parts = unsafe { event_parts_from_raw(&*view.as_ptr()) }.unwrap();
        assert_eq!(parts.logical_clock, clock);
        assert_eq!(parts.payload, Payload::Parameters(vec![1.0, 2.5, -4.0]));

        let rebuilt = events.from_parts(parts).unwrap();
        assert_eq!(rebuilt, event);
    }

    #[test]
    fn test_text_must_be_utf8() {
        let bytes = [0xffu8, 0xfe];
        let raw = RawDeviceEvent {
            kind: EventKind::Warning.code(),
            logical_clock: 0,
            device_time: 1.0,
            segment_id: 0,
            signal_id: RawGuid::from(Uuid::nil()),
            level: 0.0,
            parameters: std::ptr::null(),
            parameters_len: 0,
            text: bytes.as_ptr(),
            text_len: bytes.len(),
        };
        // SAFETY: text points into `bytes`
        let result = unsafe { event_parts_from_raw(&raw) };
        assert!(matches!(result, Err(DevflowError::InvalidSource { .. })));
    }

    #[test]
    fn test_guid_layout() {
        let id = Uuid::from_u128(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        assert_eq!(Uuid::from(RawGuid::from(id)), id);
        assert_eq!(std::mem::size_of::<RawGuid>(), 16);
    }
}
