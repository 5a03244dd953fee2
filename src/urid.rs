use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::sync::Mutex;

use lv2_raw::{
    LV2_ATOM__INT, LV2_ATOM__SEQUENCE, LV2_MIDI__MIDIEVENT, LV2_URID__MAP, LV2_URID__UNMAP,
    LV2Feature, LV2Urid, LV2UridMap, LV2UridMapHandle,
};

pub const LV2_ATOM__EVENT_TRANSFER: &str = "http://lv2plug.in/ns/ext/atom#eventTransfer";
pub const LV2_BUF_SIZE__MAX_BLOCK_LENGTH: &str =
    "http://lv2plug.in/ns/ext/buf-size#maxBlockLength";

// Unmap half of the urid extension; lv2_raw only ships the map half.
#[repr(C)]
pub struct LV2UridUnmap {
    pub handle: LV2UridMapHandle,
    pub unmap: extern "C" fn(handle: LV2UridMapHandle, urid: LV2Urid) -> *const c_char,
}

/// Dense URI interning table. An identifier is the URI's position in
/// `entries` plus one, so ids start at 1, follow assignment order, and
/// unmapping is an index lookup. Entries are never removed, which keeps
/// every binding immutable for the host's lifetime.
#[derive(Default)]
struct UriTable {
    ids: HashMap<String, LV2Urid>,
    entries: Vec<CString>,
}

impl UriTable {
    fn intern(&mut self, uri: &str) -> LV2Urid {
        if let Some(id) = self.ids.get(uri) {
            return *id;
        }
        let Ok(entry) = CString::new(uri) else {
            return 0;
        };
        self.entries.push(entry);
        let id = self.entries.len() as LV2Urid;
        self.ids.insert(uri.to_string(), id);
        id
    }

    // CString data has a stable heap address, so the pointer survives
    // later growth of `entries`.
    fn uri_ptr(&self, urid: LV2Urid) -> *const c_char {
        (urid as usize)
            .checked_sub(1)
            .and_then(|index| self.entries.get(index))
            .map(|entry| entry.as_ptr())
            .unwrap_or(std::ptr::null())
    }
}

// Everything the urid extension hands to foreign code lives in this one
// block: both C interface structs, the URI strings naming the features,
// and the table itself. The callbacks receive a pointer to the block as
// their opaque handle and reach the table through it.
struct RegistryInner {
    map_iface: LV2UridMap,
    unmap_iface: LV2UridUnmap,
    map_uri: CString,
    unmap_uri: CString,
    table: Mutex<UriTable>,
}

/// Append-only URI↔integer registry exposed to the plugin and its UI as
/// the `urid:map`/`urid:unmap` features.
///
/// The map callback may be invoked from the audio thread; lookups of
/// already-interned URIs take the table mutex only briefly and do not
/// allocate.
pub struct UridRegistry {
    inner: Box<RegistryInner>,
}

unsafe impl Send for UridRegistry {}

fn trim_nul(uri: &[u8]) -> &[u8] {
    match uri.split_last() {
        Some((0, rest)) => rest,
        _ => uri,
    }
}

impl UridRegistry {
    pub fn new() -> Result<Self, String> {
        let map_uri = CString::new(trim_nul(LV2_URID__MAP))
            .map_err(|e| format!("Invalid urid:map feature URI: {e}"))?;
        let unmap_uri = CString::new(trim_nul(LV2_URID__UNMAP))
            .map_err(|e| format!("Invalid urid:unmap feature URI: {e}"))?;
        let mut inner = Box::new(RegistryInner {
            map_iface: LV2UridMap {
                handle: std::ptr::null_mut(),
                map: urid_map_callback,
            },
            unmap_iface: LV2UridUnmap {
                handle: std::ptr::null_mut(),
                unmap: urid_unmap_callback,
            },
            map_uri,
            unmap_uri,
            table: Mutex::new(UriTable::default()),
        });
        let handle = (&mut *inner as *mut RegistryInner).cast::<c_void>();
        inner.map_iface.handle = handle;
        inner.unmap_iface.handle = handle;
        Ok(Self { inner })
    }

    /// Feature records are minted on demand; the pointers they carry
    /// stay valid for as long as the registry lives.
    pub fn map_feature(&self) -> LV2Feature {
        LV2Feature {
            uri: self.inner.map_uri.as_ptr(),
            data: (&self.inner.map_iface as *const LV2UridMap)
                .cast_mut()
                .cast::<c_void>(),
        }
    }

    pub fn unmap_feature(&self) -> LV2Feature {
        LV2Feature {
            uri: self.inner.unmap_uri.as_ptr(),
            data: (&self.inner.unmap_iface as *const LV2UridUnmap)
                .cast_mut()
                .cast::<c_void>(),
        }
    }

    /// Raw pointer to the map struct, for C APIs that take
    /// `LV2_URID_Map*` directly rather than a feature.
    pub fn map_ptr(&self) -> *const LV2UridMap {
        &self.inner.map_iface
    }

    pub fn map(&self, uri: &[u8]) -> LV2Urid {
        let Ok(uri) = std::str::from_utf8(trim_nul(uri)) else {
            return 0;
        };
        match self.inner.table.lock() {
            Ok(mut table) => table.intern(uri),
            Err(_) => 0,
        }
    }

    pub fn unmap(&self, urid: LV2Urid) -> Option<String> {
        let table = self.inner.table.lock().ok()?;
        (urid as usize)
            .checked_sub(1)
            .and_then(|index| table.entries.get(index))
            .and_then(|entry| entry.to_str().ok().map(str::to_string))
    }
}

fn registry_from_handle<'a>(handle: *mut c_void) -> Option<&'a RegistryInner> {
    if handle.is_null() {
        return None;
    }
    Some(unsafe { &*(handle as *const RegistryInner) })
}

extern "C" fn urid_map_callback(handle: LV2UridMapHandle, uri: *const c_char) -> LV2Urid {
    let Some(registry) = registry_from_handle(handle) else {
        return 0;
    };
    if uri.is_null() {
        return 0;
    }
    let Ok(uri) = unsafe { CStr::from_ptr(uri) }.to_str() else {
        return 0;
    };
    match registry.table.lock() {
        Ok(mut table) => table.intern(uri),
        Err(_) => 0,
    }
}

extern "C" fn urid_unmap_callback(handle: LV2UridMapHandle, urid: LV2Urid) -> *const c_char {
    let Some(registry) = registry_from_handle(handle) else {
        return std::ptr::null();
    };
    match registry.table.lock() {
        Ok(table) => table.uri_ptr(urid),
        Err(_) => std::ptr::null(),
    }
}

/// Identifiers the host itself compares against on every audio cycle.
#[derive(Debug, Clone, Copy)]
pub struct Urids {
    pub atom_sequence: LV2Urid,
    pub atom_int: LV2Urid,
    pub atom_event_transfer: LV2Urid,
    pub midi_event: LV2Urid,
    pub buf_max_block_length: LV2Urid,
}

impl Urids {
    pub fn new(urid: &UridRegistry) -> Self {
        Self {
            atom_sequence: urid.map(LV2_ATOM__SEQUENCE),
            atom_int: urid.map(LV2_ATOM__INT),
            atom_event_transfer: urid.map(LV2_ATOM__EVENT_TRANSFER.as_bytes()),
            midi_event: urid.map(LV2_MIDI__MIDIEVENT),
            buf_max_block_length: urid.map(LV2_BUF_SIZE__MAX_BLOCK_LENGTH.as_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_assignment_order() {
        let urid = UridRegistry::new().unwrap();
        assert_eq!(urid.map(b"urn:test:a"), 1);
        assert_eq!(urid.map(b"urn:test:b"), 2);
        assert_eq!(urid.map(b"urn:test:a"), 1);
        assert_eq!(urid.map(b"urn:test:c"), 3);
    }

    #[test]
    fn unmap_roundtrip() {
        let urid = UridRegistry::new().unwrap();
        let id = urid.map(b"urn:test:roundtrip");
        assert_eq!(urid.unmap(id).as_deref(), Some("urn:test:roundtrip"));
        assert_eq!(urid.unmap(id + 1), None);
        assert_eq!(urid.unmap(0), None);
    }

    #[test]
    fn trailing_nul_is_ignored() {
        let urid = UridRegistry::new().unwrap();
        assert_eq!(urid.map(b"urn:test:x\0"), urid.map(b"urn:test:x"));
    }

    #[test]
    fn callbacks_recover_registry_from_handle() {
        let urid = UridRegistry::new().unwrap();
        let handle = urid.inner.map_iface.handle;
        let uri = CString::new("urn:test:cb").unwrap();
        let id = urid_map_callback(handle, uri.as_ptr());
        assert_ne!(id, 0);
        assert_eq!(id, urid.map(b"urn:test:cb"));
        let back = urid_unmap_callback(handle, id);
        assert!(!back.is_null());
        assert_eq!(
            unsafe { CStr::from_ptr(back) }.to_str().unwrap(),
            "urn:test:cb"
        );
        assert!(urid_unmap_callback(handle, 9999).is_null());
        assert!(urid_map_callback(std::ptr::null_mut(), uri.as_ptr()) == 0);
    }

    #[test]
    fn unmap_pointers_survive_table_growth() {
        let urid = UridRegistry::new().unwrap();
        let handle = urid.inner.map_iface.handle;
        let first = CString::new("urn:test:first").unwrap();
        let id = urid_map_callback(handle, first.as_ptr());
        let ptr = urid_unmap_callback(handle, id);
        for n in 0..256 {
            urid.map(format!("urn:test:filler:{n}").as_bytes());
        }
        assert_eq!(
            unsafe { CStr::from_ptr(ptr) }.to_str().unwrap(),
            "urn:test:first"
        );
    }
}
