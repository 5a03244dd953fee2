use std::ffi::{CStr, CString, c_char, c_int, c_uint, c_void};

use lv2_raw::{LV2Feature, LV2UridMap};

use crate::features::StatePathFeatures;
use crate::port::{LV2_ATOM__ATOM_PORT, Port};
use crate::urid::UridRegistry;

const LV2_PRESETS__PRESET: &str = "http://lv2plug.in/ns/ext/presets#Preset";
const RDFS__LABEL: &str = "http://www.w3.org/2000/01/rdf-schema#label";
const LV2_RESIZE_PORT__MINIMUM_SIZE: &str =
    "http://lv2plug.in/ns/ext/resize-port#minimumSize";

type SetPortValueFunc = Option<
    extern "C" fn(
        port_symbol: *const c_char,
        user_data: *mut c_void,
        value: *const c_void,
        size: u32,
        type_: u32,
    ),
>;

// The preset/state corner of lilv is not covered by the safe wrapper, so
// this module talks to the C library directly, on its own world.
#[link(name = "lilv-0")]
unsafe extern "C" {
    fn lilv_world_new() -> *mut c_void;
    fn lilv_world_free(world: *mut c_void);
    fn lilv_world_load_all(world: *mut c_void);
    fn lilv_world_load_resource(world: *mut c_void, resource: *const c_void) -> c_int;
    fn lilv_world_get(
        world: *mut c_void,
        subject: *const c_void,
        predicate: *const c_void,
        object: *const c_void,
    ) -> *mut c_void;
    fn lilv_world_get_all_plugins(world: *mut c_void) -> *const c_void;
    fn lilv_new_uri(world: *mut c_void, uri: *const c_char) -> *mut c_void;
    fn lilv_node_free(node: *mut c_void);
    fn lilv_node_as_uri(node: *const c_void) -> *const c_char;
    fn lilv_node_as_string(node: *const c_void) -> *const c_char;
    fn lilv_node_is_string(node: *const c_void) -> bool;
    fn lilv_node_as_int(node: *const c_void) -> c_int;
    fn lilv_plugins_get_by_uri(plugins: *const c_void, uri: *const c_void) -> *const c_void;
    fn lilv_plugin_get_related(plugin: *const c_void, type_: *const c_void) -> *mut c_void;
    fn lilv_plugin_get_num_ports(plugin: *const c_void) -> u32;
    fn lilv_plugin_get_port_by_index(plugin: *const c_void, index: u32) -> *const c_void;
    fn lilv_port_is_a(plugin: *const c_void, port: *const c_void, class: *const c_void) -> bool;
    fn lilv_port_get_value(
        plugin: *const c_void,
        port: *const c_void,
        predicate: *const c_void,
    ) -> *mut c_void;
    fn lilv_nodes_free(nodes: *mut c_void);
    fn lilv_nodes_size(nodes: *const c_void) -> c_uint;
    fn lilv_nodes_begin(nodes: *const c_void) -> *mut c_void;
    fn lilv_nodes_get(nodes: *const c_void, iter: *mut c_void) -> *const c_void;
    fn lilv_nodes_next(nodes: *const c_void, iter: *mut c_void) -> *mut c_void;
    fn lilv_nodes_is_end(nodes: *const c_void, iter: *mut c_void) -> bool;
    fn lilv_nodes_get_first(nodes: *const c_void) -> *const c_void;
    fn lilv_state_new_from_world(
        world: *mut c_void,
        map: *const LV2UridMap,
        node: *const c_void,
    ) -> *mut c_void;
    fn lilv_state_new_from_file(
        world: *mut c_void,
        map: *const LV2UridMap,
        subject: *const c_void,
        path: *const c_char,
    ) -> *mut c_void;
    fn lilv_state_restore(
        state: *mut c_void,
        instance: *mut c_void,
        set_port_value: SetPortValueFunc,
        user_data: *mut c_void,
        flags: u32,
        features: *const *const LV2Feature,
    );
    fn lilv_state_free(state: *mut c_void);
    fn lilv_file_uri_parse(uri: *const c_char, hostname: *mut *mut c_char) -> *mut c_char;
    fn lilv_free(ptr: *mut c_void);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetInfo {
    pub uri: String,
    pub label: String,
}

struct PortValueSink {
    ports: *const Port,
    len: usize,
}

/// State-restore callback: copies float values into control ports
/// matched by symbol. Non-float values are ignored.
extern "C" fn set_port_value_callback(
    port_symbol: *const c_char,
    user_data: *mut c_void,
    value: *const c_void,
    size: u32,
    _type: u32,
) {
    if port_symbol.is_null() || user_data.is_null() || value.is_null() {
        return;
    }
    if size as usize != std::mem::size_of::<f32>() {
        return;
    }
    let sink = unsafe { &*(user_data as *const PortValueSink) };
    let ports = unsafe { std::slice::from_raw_parts(sink.ports, sink.len) };
    let Some(symbol) = unsafe { CStr::from_ptr(port_symbol) }.to_str().ok() else {
        return;
    };
    if let Some(port) = ports
        .iter()
        .find(|port| port.is_control() && port.symbol == symbol)
    {
        port.control.set(unsafe { *(value as *const f32) });
    }
}

/// Catalogue world for preset enumeration and state loading. Separate
/// from the DSP world; only the main thread touches it.
pub struct PresetCatalog {
    world: *mut c_void,
}

impl PresetCatalog {
    pub fn new() -> Result<Self, String> {
        let world = unsafe { lilv_world_new() };
        if world.is_null() {
            return Err("Failed to create preset world".to_string());
        }
        unsafe { lilv_world_load_all(world) };
        Ok(Self { world })
    }

    fn plugin(&self, plugin_uri: &str) -> Option<*const c_void> {
        let uri_c = CString::new(plugin_uri).ok()?;
        unsafe {
            let uri_node = lilv_new_uri(self.world, uri_c.as_ptr());
            if uri_node.is_null() {
                return None;
            }
            let plugin =
                lilv_plugins_get_by_uri(lilv_world_get_all_plugins(self.world), uri_node);
            lilv_node_free(uri_node);
            (!plugin.is_null()).then_some(plugin)
        }
    }

    /// Largest `resize-port#minimumSize` declared by any atom port of
    /// the plugin, 0 when none declares one.
    pub fn minimum_atom_size(&self, plugin_uri: &str) -> u32 {
        let Some(plugin) = self.plugin(plugin_uri) else {
            return 0;
        };
        let Ok(atom_uri) = CString::new(LV2_ATOM__ATOM_PORT) else {
            return 0;
        };
        let Ok(min_size_uri) = CString::new(LV2_RESIZE_PORT__MINIMUM_SIZE) else {
            return 0;
        };
        let mut required = 0u32;
        unsafe {
            let atom_class = lilv_new_uri(self.world, atom_uri.as_ptr());
            let min_size = lilv_new_uri(self.world, min_size_uri.as_ptr());
            let count = lilv_plugin_get_num_ports(plugin);
            for index in 0..count {
                let port = lilv_plugin_get_port_by_index(plugin, index);
                if port.is_null() || !lilv_port_is_a(plugin, port, atom_class) {
                    continue;
                }
                let sizes = lilv_port_get_value(plugin, port, min_size);
                if sizes.is_null() {
                    continue;
                }
                if lilv_nodes_size(sizes) > 0 {
                    let node = lilv_nodes_get_first(sizes);
                    if !node.is_null() {
                        required = required.max(lilv_node_as_int(node).max(0) as u32);
                    }
                }
                lilv_nodes_free(sizes);
            }
            lilv_node_free(min_size);
            lilv_node_free(atom_class);
        }
        required
    }

    /// Presets catalogued for the plugin, sorted by label.
    pub fn presets(&self, plugin_uri: &str) -> Vec<PresetInfo> {
        let mut result = Vec::new();
        let Some(plugin) = self.plugin(plugin_uri) else {
            return result;
        };
        let Ok(preset_uri) = CString::new(LV2_PRESETS__PRESET) else {
            return result;
        };
        let Ok(label_uri) = CString::new(RDFS__LABEL) else {
            return result;
        };
        unsafe {
            let preset_class = lilv_new_uri(self.world, preset_uri.as_ptr());
            let label_pred = lilv_new_uri(self.world, label_uri.as_ptr());
            let presets = lilv_plugin_get_related(plugin, preset_class);
            if !presets.is_null() {
                let mut iter = lilv_nodes_begin(presets);
                while !lilv_nodes_is_end(presets, iter) {
                    let preset = lilv_nodes_get(presets, iter);
                    iter = lilv_nodes_next(presets, iter);
                    if preset.is_null() {
                        continue;
                    }
                    let _ = lilv_world_load_resource(self.world, preset);
                    let Some(uri) = cstr_to_string(lilv_node_as_uri(preset)) else {
                        continue;
                    };
                    let label_node =
                        lilv_world_get(self.world, preset, label_pred, std::ptr::null());
                    let label = if !label_node.is_null() && lilv_node_is_string(label_node) {
                        cstr_to_string(lilv_node_as_string(label_node))
                            .unwrap_or_else(|| "(no label)".to_string())
                    } else {
                        "(no label)".to_string()
                    };
                    if !label_node.is_null() {
                        lilv_node_free(label_node);
                    }
                    result.push(PresetInfo { uri, label });
                }
                lilv_nodes_free(presets);
            }
            lilv_node_free(label_pred);
            lilv_node_free(preset_class);
        }
        result.sort_by(|left, right| left.label.cmp(&right.label));
        result
    }

    /// Loads the preset state — from the world, or from a file when the
    /// URI points outside the catalogue — and restores float port values
    /// into matching control ports.
    pub fn apply(
        &self,
        preset_uri: &str,
        urid: &UridRegistry,
        state_paths: &StatePathFeatures,
        worker_feature: &LV2Feature,
        ports: &[Port],
    ) -> Result<(), String> {
        let preset_c =
            CString::new(preset_uri).map_err(|e| format!("Invalid preset URI: {e}"))?;
        unsafe {
            let preset_node = lilv_new_uri(self.world, preset_c.as_ptr());
            if preset_node.is_null() {
                return Err(format!("Invalid preset URI: {preset_uri}"));
            }
            let mut state = lilv_state_new_from_world(self.world, urid.map_ptr(), preset_node);
            if state.is_null() {
                let path = lilv_file_uri_parse(preset_c.as_ptr(), std::ptr::null_mut());
                if !path.is_null() {
                    state = lilv_state_new_from_file(
                        self.world,
                        urid.map_ptr(),
                        std::ptr::null(),
                        path,
                    );
                    lilv_free(path.cast::<c_void>());
                }
            }
            if state.is_null() {
                lilv_node_free(preset_node);
                return Err(format!("Failed to load preset: {preset_uri}"));
            }

            let map_feature = urid.map_feature();
            let unmap_feature = urid.unmap_feature();
            let state_features = state_paths.features();
            let features: [*const LV2Feature; 7] = [
                &map_feature,
                &unmap_feature,
                state_features[0],
                state_features[1],
                state_features[2],
                worker_feature,
                std::ptr::null(),
            ];
            let sink = PortValueSink {
                ports: ports.as_ptr(),
                len: ports.len(),
            };
            lilv_state_restore(
                state,
                std::ptr::null_mut(),
                Some(set_port_value_callback),
                (&sink as *const PortValueSink).cast_mut().cast::<c_void>(),
                0,
                features.as_ptr(),
            );
            lilv_state_free(state);
            lilv_node_free(preset_node);
        }
        Ok(())
    }
}

impl Drop for PresetCatalog {
    fn drop(&mut self) {
        if !self.world.is_null() {
            unsafe { lilv_world_free(self.world) };
            self.world = std::ptr::null_mut();
        }
    }
}

fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .ok()
        .map(str::to_string)
}
