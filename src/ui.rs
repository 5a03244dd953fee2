use std::ffi::{CStr, CString, c_char, c_ulong, c_void};
use std::sync::Arc;

use lilv::{World, plugin::Plugin};
use lv2_raw::LV2Feature;
use tracing::warn;

use crate::port::Port;
use crate::urid::UridRegistry;
use crate::x11::{self, HostWindow};

pub const LV2_UI__X11UI: &str = "http://lv2plug.in/ns/extensions/ui#X11UI";
const LV2_UI__PARENT: &str = "http://lv2plug.in/ns/extensions/ui#parent";
const LV2_UI__RESIZE: &str = "http://lv2plug.in/ns/extensions/ui#resize";
const LV2_UI__PORT_MAP: &str = "http://lv2plug.in/ns/extensions/ui#portMap";
const LV2_UI__IDLE_INTERFACE: &str = "http://lv2plug.in/ns/extensions/ui#idleInterface";

const INVALID_PORT_INDEX: u32 = u32::MAX;

type Lv2UiWriteFunction =
    Option<extern "C" fn(*mut c_void, u32, u32, u32, *const c_void)>;

#[repr(C)]
struct Lv2UiDescriptor {
    uri: *const c_char,
    instantiate: Option<
        unsafe extern "C" fn(
            descriptor: *const Lv2UiDescriptor,
            plugin_uri: *const c_char,
            bundle_path: *const c_char,
            write_function: Lv2UiWriteFunction,
            controller: *mut c_void,
            widget: *mut *mut c_void,
            features: *const *const LV2Feature,
        ) -> *mut c_void,
    >,
    cleanup: Option<unsafe extern "C" fn(handle: *mut c_void)>,
    port_event: Option<
        unsafe extern "C" fn(
            handle: *mut c_void,
            port_index: u32,
            buffer_size: u32,
            format: u32,
            buffer: *const c_void,
        ),
    >,
    extension_data: Option<unsafe extern "C" fn(uri: *const c_char) -> *const c_void>,
}

#[repr(C)]
struct Lv2UiResize {
    handle: *mut c_void,
    ui_resize: Option<extern "C" fn(*mut c_void, i32, i32) -> i32>,
}

#[repr(C)]
struct Lv2UiPortMap {
    handle: *mut c_void,
    port_index: Option<extern "C" fn(*mut c_void, *const c_char) -> u32>,
}

#[repr(C)]
struct Lv2UiIdleInterface {
    idle: Option<extern "C" fn(*mut c_void) -> i32>,
}

/// Controller handed to the plugin UI. The write callback and the
/// port-index/resize features recover it from their opaque handles.
struct UiController {
    ports: Arc<Vec<Port>>,
    display: *mut c_void,
    window: c_ulong,
}

unsafe impl Send for UiController {}

/// UI writes come back here on the main thread. Control-sized writes go
/// straight to the port's control cell; atom writes land in the one-shot
/// UI→DSP cell the audio callback consumes next cycle.
extern "C" fn ui_write_callback(
    controller: *mut c_void,
    port_index: u32,
    buffer_size: u32,
    format: u32,
    buffer: *const c_void,
) {
    if controller.is_null() || buffer.is_null() {
        return;
    }
    let controller = unsafe { &*(controller as *const UiController) };
    let Some(port) = controller.ports.get(port_index as usize) else {
        return;
    };

    if port.is_control() && buffer_size as usize == std::mem::size_of::<f32>() {
        port.control.set(unsafe { *(buffer as *const f32) });
        return;
    }

    if let Some(state) = port.atom.as_ref() {
        let data =
            unsafe { std::slice::from_raw_parts(buffer.cast::<u8>(), buffer_size as usize) };
        state.ui_to_dsp.publish(format, data);
    }
}

extern "C" fn ui_port_index_callback(handle: *mut c_void, uri: *const c_char) -> u32 {
    if handle.is_null() || uri.is_null() {
        return INVALID_PORT_INDEX;
    }
    let controller = unsafe { &*(handle as *const UiController) };
    let Some(uri) = unsafe { CStr::from_ptr(uri) }.to_str().ok() else {
        return INVALID_PORT_INDEX;
    };
    controller
        .ports
        .iter()
        .find(|port| port.uri == uri)
        .map(|port| port.index as u32)
        .unwrap_or(INVALID_PORT_INDEX)
}

extern "C" fn ui_resize_callback(handle: *mut c_void, width: i32, height: i32) -> i32 {
    if handle.is_null() {
        return 1;
    }
    let controller = unsafe { &*(handle as *const UiController) };
    if x11::resize_window(controller.display, controller.window, width, height) {
        0
    } else {
        1
    }
}

/// The loaded plugin UI: its shared object, the selected descriptor,
/// and the live handle. Dropping cleans the UI up before the library is
/// unloaded.
pub struct UiSession {
    descriptor: *const Lv2UiDescriptor,
    handle: *mut c_void,
    widget: *mut c_void,
    idle: *const Lv2UiIdleInterface,
    _controller: Box<UiController>,
    _resize: Box<Lv2UiResize>,
    _port_map: Box<Lv2UiPortMap>,
    _feature_uris: Vec<CString>,
    _lib: libloading::Library,
}

impl UiSession {
    /// Selects the plugin's X11 UI, loads its shared object, and
    /// instantiates it into the host window.
    pub fn instantiate(
        world: &World,
        plugin: &Plugin,
        plugin_uri: &str,
        urid: &UridRegistry,
        ports: Arc<Vec<Port>>,
        window: &HostWindow,
    ) -> Result<Self, String> {
        let x11_class = world.new_uri(LV2_UI__X11UI);
        let uis = plugin
            .uis()
            .ok_or_else(|| format!("Plugin has no UI: {plugin_uri}"))?;

        let mut selected = None;
        for ui in uis.iter() {
            if !ui.is_a(&x11_class) {
                continue;
            }
            let ui_uri = ui
                .uri()
                .as_uri()
                .ok_or_else(|| "UI URI is invalid".to_string())?
                .to_string();
            let bundle_uri = ui
                .bundle_uri()
                .ok_or_else(|| "UI bundle URI missing".to_string())?;
            let binary_uri = ui
                .binary_uri()
                .ok_or_else(|| "UI binary URI missing".to_string())?;
            let (_, bundle_path) = bundle_uri
                .path()
                .ok_or_else(|| "Failed to resolve UI bundle path".to_string())?;
            let (_, binary_path) = binary_uri
                .path()
                .ok_or_else(|| "Failed to resolve UI binary path".to_string())?;
            selected = Some((ui_uri, bundle_path, binary_path));
        }
        let (ui_uri, bundle_path, binary_path) =
            selected.ok_or_else(|| format!("No X11 UI available for {plugin_uri}"))?;

        let lib = unsafe { libloading::Library::new(&binary_path) }
            .map_err(|e| format!("Failed to load UI module '{binary_path}': {e}"))?;
        let entry: libloading::Symbol<unsafe extern "C" fn(u32) -> *const Lv2UiDescriptor> =
            unsafe { lib.get(b"lv2ui_descriptor") }
                .map_err(|e| format!("UI module has no lv2ui_descriptor entry point: {e}"))?;

        let mut descriptor = std::ptr::null();
        let mut index = 0;
        loop {
            let candidate = unsafe { entry(index) };
            if candidate.is_null() {
                break;
            }
            let candidate_uri = unsafe { CStr::from_ptr((*candidate).uri) };
            if candidate_uri.to_str().map(|u| u == ui_uri).unwrap_or(false) {
                descriptor = candidate;
                break;
            }
            index += 1;
        }
        if descriptor.is_null() {
            return Err(format!("UI descriptor {ui_uri} not found in {binary_path}"));
        }

        let controller = Box::new(UiController {
            ports,
            display: window.display(),
            window: window.window_id(),
        });
        let controller_ptr =
            (&*controller as *const UiController).cast_mut().cast::<c_void>();

        let mut resize = Box::new(Lv2UiResize {
            handle: controller_ptr,
            ui_resize: Some(ui_resize_callback),
        });
        let mut port_map = Box::new(Lv2UiPortMap {
            handle: controller_ptr,
            port_index: Some(ui_port_index_callback),
        });

        let parent_uri = CString::new(LV2_UI__PARENT).map_err(|e| e.to_string())?;
        let resize_uri = CString::new(LV2_UI__RESIZE).map_err(|e| e.to_string())?;
        let port_map_uri = CString::new(LV2_UI__PORT_MAP).map_err(|e| e.to_string())?;

        let parent_feature = LV2Feature {
            uri: parent_uri.as_ptr(),
            data: window.window_id() as *mut c_void,
        };
        let resize_feature = LV2Feature {
            uri: resize_uri.as_ptr(),
            data: (&mut *resize as *mut Lv2UiResize).cast::<c_void>(),
        };
        let port_map_feature = LV2Feature {
            uri: port_map_uri.as_ptr(),
            data: (&mut *port_map as *mut Lv2UiPortMap).cast::<c_void>(),
        };

        let map_feature = urid.map_feature();
        let unmap_feature = urid.unmap_feature();
        let feature_ptrs: [*const LV2Feature; 6] = [
            &parent_feature,
            &resize_feature,
            &port_map_feature,
            &map_feature,
            &unmap_feature,
            std::ptr::null(),
        ];

        let instantiate = unsafe { (*descriptor).instantiate }
            .ok_or_else(|| format!("UI {ui_uri} has no instantiate function"))?;
        let plugin_uri_c = CString::new(plugin_uri).map_err(|e| e.to_string())?;
        let bundle_path_c = CString::new(bundle_path).map_err(|e| e.to_string())?;
        let mut widget: *mut c_void = std::ptr::null_mut();
        let handle = unsafe {
            instantiate(
                descriptor,
                plugin_uri_c.as_ptr(),
                bundle_path_c.as_ptr(),
                Some(ui_write_callback),
                controller_ptr,
                &mut widget,
                feature_ptrs.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(format!("Failed to instantiate UI {ui_uri}"));
        }

        let idle_uri = CString::new(LV2_UI__IDLE_INTERFACE).map_err(|e| e.to_string())?;
        let idle = unsafe { (*descriptor).extension_data }
            .map(|extension_data| unsafe {
                extension_data(idle_uri.as_ptr()).cast::<Lv2UiIdleInterface>()
            })
            .unwrap_or(std::ptr::null());

        Ok(Self {
            descriptor,
            handle,
            widget,
            idle,
            _controller: controller,
            _resize: resize,
            _port_map: port_map,
            _feature_uris: vec![parent_uri, resize_uri, port_map_uri, idle_uri],
            _lib: lib,
        })
    }

    /// X11 window id of the widget the UI created.
    pub fn widget_window(&self) -> c_ulong {
        self.widget as c_ulong
    }

    pub fn port_event_float(&self, port_index: u32, value: f32) {
        self.port_event_raw(port_index, 0, unsafe {
            std::slice::from_raw_parts(
                (&value as *const f32).cast::<u8>(),
                std::mem::size_of::<f32>(),
            )
        });
    }

    pub fn port_event_raw(&self, port_index: u32, format: u32, data: &[u8]) {
        if self.handle.is_null() {
            return;
        }
        if let Some(port_event) = unsafe { (*self.descriptor).port_event } {
            unsafe {
                port_event(
                    self.handle,
                    port_index,
                    data.len() as u32,
                    format,
                    data.as_ptr().cast::<c_void>(),
                );
            }
        }
    }

    /// Drives the UI's idle extension, if it exports one.
    pub fn idle(&self) {
        if self.idle.is_null() || self.handle.is_null() {
            return;
        }
        if let Some(idle) = unsafe { (*self.idle).idle } {
            let _ = idle(self.handle);
        }
    }

    fn cleanup(&mut self) {
        if self.handle.is_null() {
            return;
        }
        if let Some(cleanup) = unsafe { (*self.descriptor).cleanup } {
            unsafe { cleanup(self.handle) };
        } else {
            warn!("UI descriptor has no cleanup hook");
        }
        self.handle = std::ptr::null_mut();
    }
}

impl Drop for UiSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}
