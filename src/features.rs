use std::ffi::{CStr, CString, c_char, c_void};

use lilv::plugin::Plugin;
use lv2_raw::LV2Feature;

use crate::urid::{UridRegistry, Urids};
use crate::worker::HostWorker;

pub const LV2_OPTIONS__OPTIONS: &str = "http://lv2plug.in/ns/ext/options#options";
pub const LV2_BUF_SIZE__BOUNDED_BLOCK_LENGTH: &str =
    "http://lv2plug.in/ns/ext/buf-size#boundedBlockLength";
const LV2_STATE__MAP_PATH: &str = "http://lv2plug.in/ns/ext/state#mapPath";
const LV2_STATE__MAKE_PATH: &str = "http://lv2plug.in/ns/ext/state#makePath";
const LV2_STATE__FREE_PATH: &str = "http://lv2plug.in/ns/ext/state#freePath";

const LV2_OPTIONS_INSTANCE: u32 = 0;

#[repr(C)]
#[derive(Clone, Copy)]
struct LV2OptionsOption {
    context: u32,
    subject: u32,
    key: u32,
    size: u32,
    type_: u32,
    value: *const c_void,
}

/// The feature table handed to `lilv_plugin_instantiate`: urid map and
/// unmap, the options array (maxBlockLength), boundedBlockLength, and
/// the worker schedule. The boxes keep every pointer the table hands out
/// alive for the instance lifetime.
pub struct FeatureSet {
    _feature_uris: Vec<CString>,
    features: Vec<LV2Feature>,
    _options: Box<[LV2OptionsOption; 2]>,
    _max_block: Box<u32>,
}

unsafe impl Send for FeatureSet {}

impl FeatureSet {
    pub fn new(
        urid: &UridRegistry,
        urids: &Urids,
        worker: &HostWorker,
        max_block_length: u32,
    ) -> Result<Self, String> {
        let max_block = Box::new(max_block_length);
        let options = Box::new([
            LV2OptionsOption {
                context: LV2_OPTIONS_INSTANCE,
                subject: 0,
                key: urids.buf_max_block_length,
                size: std::mem::size_of::<u32>() as u32,
                type_: urids.atom_int,
                value: (&*max_block as *const u32).cast::<c_void>(),
            },
            LV2OptionsOption {
                context: LV2_OPTIONS_INSTANCE,
                subject: 0,
                key: 0,
                size: 0,
                type_: 0,
                value: std::ptr::null(),
            },
        ]);

        let mut feature_uris = Vec::new();
        let mut features = Vec::new();
        let mut push = |uri: &str, data: *mut c_void| -> Result<(), String> {
            let c_uri =
                CString::new(uri).map_err(|e| format!("Invalid feature URI '{uri}': {e}"))?;
            features.push(LV2Feature {
                uri: c_uri.as_ptr(),
                data,
            });
            feature_uris.push(c_uri);
            Ok(())
        };

        let map_feature = urid.map_feature();
        let unmap_feature = urid.unmap_feature();
        push(
            unsafe { CStr::from_ptr(map_feature.uri) }
                .to_str()
                .map_err(|e| format!("Invalid urid:map URI: {e}"))?,
            map_feature.data,
        )?;
        push(
            unsafe { CStr::from_ptr(unmap_feature.uri) }
                .to_str()
                .map_err(|e| format!("Invalid urid:unmap URI: {e}"))?,
            unmap_feature.data,
        )?;
        push(
            LV2_OPTIONS__OPTIONS,
            (options.as_ptr() as *const LV2OptionsOption)
                .cast_mut()
                .cast::<c_void>(),
        )?;
        push(LV2_BUF_SIZE__BOUNDED_BLOCK_LENGTH, std::ptr::null_mut())?;
        push(
            unsafe { CStr::from_ptr(worker.feature.uri) }
                .to_str()
                .map_err(|e| format!("Invalid worker schedule URI: {e}"))?,
            worker.feature.data,
        )?;

        Ok(Self {
            _feature_uris: feature_uris,
            features,
            _options: options,
            _max_block: max_block,
        })
    }

    pub fn refs(&self) -> Vec<&LV2Feature> {
        self.features.iter().collect()
    }

    pub fn supports(&self, uri: &str) -> bool {
        self.features.iter().any(|feature| {
            unsafe { CStr::from_ptr(feature.uri) }
                .to_str()
                .map(|feature_uri| feature_uri == uri)
                .unwrap_or(false)
        })
    }
}

/// Refuses instantiation when the plugin requires a feature the host
/// does not provide.
pub fn check_required_features(plugin: &Plugin, set: &FeatureSet) -> Result<(), String> {
    for node in plugin.required_features().iter() {
        let Some(uri) = node
            .as_uri()
            .map(str::to_string)
            .or_else(|| node.as_str().map(str::to_string))
        else {
            continue;
        };
        if !set.supports(&uri) {
            return Err(format!("Required feature {uri} is not supported"));
        }
    }
    Ok(())
}

#[repr(C)]
struct Lv2StateMapPath {
    handle: *mut c_void,
    abstract_path: Option<extern "C" fn(*mut c_void, *const c_char) -> *mut c_char>,
    absolute_path: Option<extern "C" fn(*mut c_void, *const c_char) -> *mut c_char>,
}

#[repr(C)]
struct Lv2StateMakePath {
    handle: *mut c_void,
    path: Option<extern "C" fn(*mut c_void, *const c_char) -> *mut c_char>,
}

#[repr(C)]
struct Lv2StateFreePath {
    handle: *mut c_void,
    free_path: Option<extern "C" fn(*mut c_void, *mut c_char)>,
}

/// `state:mapPath`/`state:makePath`/`state:freePath` with identity
/// behaviour: paths are duplicated verbatim, no translation or copying
/// of referenced files takes place.
pub struct StatePathFeatures {
    _map_uri: CString,
    _make_uri: CString,
    _free_uri: CString,
    _map: Box<Lv2StateMapPath>,
    _make: Box<Lv2StateMakePath>,
    _free: Box<Lv2StateFreePath>,
    map_feature: LV2Feature,
    make_feature: LV2Feature,
    free_feature: LV2Feature,
}

unsafe impl Send for StatePathFeatures {}

impl StatePathFeatures {
    pub fn new() -> Result<Self, String> {
        let map = Box::new(Lv2StateMapPath {
            handle: std::ptr::null_mut(),
            abstract_path: Some(duplicate_path_callback),
            absolute_path: Some(duplicate_path_callback),
        });
        let make = Box::new(Lv2StateMakePath {
            handle: std::ptr::null_mut(),
            path: Some(duplicate_path_callback),
        });
        let free = Box::new(Lv2StateFreePath {
            handle: std::ptr::null_mut(),
            free_path: Some(free_path_callback),
        });

        let map_uri = CString::new(LV2_STATE__MAP_PATH)
            .map_err(|e| format!("Invalid state mapPath URI: {e}"))?;
        let make_uri = CString::new(LV2_STATE__MAKE_PATH)
            .map_err(|e| format!("Invalid state makePath URI: {e}"))?;
        let free_uri = CString::new(LV2_STATE__FREE_PATH)
            .map_err(|e| format!("Invalid state freePath URI: {e}"))?;

        let map_feature = LV2Feature {
            uri: map_uri.as_ptr(),
            data: (&*map as *const Lv2StateMapPath)
                .cast_mut()
                .cast::<c_void>(),
        };
        let make_feature = LV2Feature {
            uri: make_uri.as_ptr(),
            data: (&*make as *const Lv2StateMakePath)
                .cast_mut()
                .cast::<c_void>(),
        };
        let free_feature = LV2Feature {
            uri: free_uri.as_ptr(),
            data: (&*free as *const Lv2StateFreePath)
                .cast_mut()
                .cast::<c_void>(),
        };

        Ok(Self {
            _map_uri: map_uri,
            _make_uri: make_uri,
            _free_uri: free_uri,
            _map: map,
            _make: make,
            _free: free,
            map_feature,
            make_feature,
            free_feature,
        })
    }

    pub fn features(&self) -> [&LV2Feature; 3] {
        [&self.map_feature, &self.make_feature, &self.free_feature]
    }
}

extern "C" fn duplicate_path_callback(_handle: *mut c_void, path: *const c_char) -> *mut c_char {
    if path.is_null() {
        return std::ptr::null_mut();
    }
    unsafe { CStr::from_ptr(path) }.to_owned().into_raw()
}

extern "C" fn free_path_callback(_handle: *mut c_void, path: *mut c_char) {
    if path.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_callbacks_duplicate_and_free() {
        let original = CString::new("/some/preset/sample.wav").unwrap();
        let dup = duplicate_path_callback(std::ptr::null_mut(), original.as_ptr());
        assert!(!dup.is_null());
        assert_eq!(unsafe { CStr::from_ptr(dup) }, original.as_c_str());
        free_path_callback(std::ptr::null_mut(), dup);
        assert!(duplicate_path_callback(std::ptr::null_mut(), std::ptr::null()).is_null());
    }
}
