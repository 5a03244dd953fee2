use std::ffi::{CString, c_char, c_int, c_long, c_uint, c_ulong, c_void};
use std::sync::OnceLock;

const CLIENT_MESSAGE: c_int = 33;
const XA_ATOM: c_ulong = 4;
const XA_WINDOW: c_ulong = 33;
const PROP_MODE_REPLACE: c_int = 0;
const XDND_VERSION: c_ulong = 5;

pub const INITIAL_WIDTH: c_uint = 640;
pub const INITIAL_HEIGHT: c_uint = 480;

static X11_THREADS_INIT: OnceLock<bool> = OnceLock::new();

#[repr(C)]
#[derive(Copy, Clone)]
union XEvent {
    type_: c_int,
    xclient: XClientMessageEvent,
    pad: [c_long; 24],
}

#[repr(C)]
#[derive(Copy, Clone)]
struct XClientMessageData {
    longs: [c_long; 5],
}

#[repr(C)]
#[derive(Copy, Clone)]
struct XClientMessageEvent {
    type_: c_int,
    serial: c_ulong,
    send_event: c_int,
    display: *mut c_void,
    window: c_ulong,
    message_type: c_ulong,
    format: c_int,
    data: XClientMessageData,
}

#[link(name = "X11")]
unsafe extern "C" {
    fn XInitThreads() -> c_int;
    fn XOpenDisplay(display_name: *const c_char) -> *mut c_void;
    fn XCloseDisplay(display: *mut c_void) -> c_int;
    fn XDefaultScreen(display: *mut c_void) -> c_int;
    fn XRootWindow(display: *mut c_void, screen_number: c_int) -> c_ulong;
    fn XCreateSimpleWindow(
        display: *mut c_void,
        parent: c_ulong,
        x: c_int,
        y: c_int,
        width: c_uint,
        height: c_uint,
        border_width: c_uint,
        border: c_ulong,
        background: c_ulong,
    ) -> c_ulong;
    fn XStoreName(display: *mut c_void, window: c_ulong, window_name: *const c_char) -> c_int;
    fn XInternAtom(
        display: *mut c_void,
        atom_name: *const c_char,
        only_if_exists: c_int,
    ) -> c_ulong;
    fn XSetWMProtocols(
        display: *mut c_void,
        window: c_ulong,
        protocols: *mut c_ulong,
        count: c_int,
    ) -> c_int;
    fn XChangeProperty(
        display: *mut c_void,
        window: c_ulong,
        property: c_ulong,
        type_: c_ulong,
        format: c_int,
        mode: c_int,
        data: *const u8,
        nelements: c_int,
    ) -> c_int;
    fn XMapRaised(display: *mut c_void, window: c_ulong) -> c_int;
    fn XResizeWindow(display: *mut c_void, window: c_ulong, width: c_uint, height: c_uint)
    -> c_int;
    fn XDestroyWindow(display: *mut c_void, window: c_ulong) -> c_int;
    fn XQueryTree(
        display: *mut c_void,
        window: c_ulong,
        root_return: *mut c_ulong,
        parent_return: *mut c_ulong,
        children_return: *mut *mut c_ulong,
        nchildren_return: *mut c_uint,
    ) -> c_int;
    fn XFree(data: *mut c_void) -> c_int;
    fn XPending(display: *mut c_void) -> c_int;
    fn XNextEvent(display: *mut c_void, event_return: *mut XEvent) -> c_int;
    fn XFlush(display: *mut c_void) -> c_int;
    fn XSync(display: *mut c_void, discard: c_int) -> c_int;
    fn XLockDisplay(display: *mut c_void);
    fn XUnlockDisplay(display: *mut c_void);
}

pub fn ensure_x11_threads() -> bool {
    *X11_THREADS_INIT.get_or_init(|| unsafe { XInitThreads() != 0 })
}

/// Top-level X11 window embedding the plugin UI. Lives on the main
/// thread; the resize hook is the only entry point foreign code calls,
/// and it serializes through the display lock.
pub struct HostWindow {
    display: *mut c_void,
    window: c_ulong,
    wm_delete: c_ulong,
    wm_protocols: c_ulong,
}

impl HostWindow {
    pub fn open() -> Result<Self, String> {
        ensure_x11_threads();
        let display = unsafe { XOpenDisplay(std::ptr::null()) };
        if display.is_null() {
            return Err("Failed to open X display".to_string());
        }
        let screen = unsafe { XDefaultScreen(display) };
        let root = unsafe { XRootWindow(display, screen) };
        let window = unsafe {
            XCreateSimpleWindow(
                display,
                root,
                100,
                100,
                INITIAL_WIDTH,
                INITIAL_HEIGHT,
                0,
                0,
                0,
            )
        };
        if window == 0 {
            unsafe {
                let _ = XCloseDisplay(display);
            }
            return Err("Failed to create X11 window".to_string());
        }
        unsafe {
            let _ = XMapRaised(display, window);
        }

        // Advertise drag-and-drop so drops reach the embedded UI.
        if let Some(xdnd_aware) = intern_atom(display, "XdndAware") {
            let version: c_ulong = XDND_VERSION;
            unsafe {
                let _ = XChangeProperty(
                    display,
                    window,
                    xdnd_aware,
                    XA_ATOM,
                    32,
                    PROP_MODE_REPLACE,
                    (&version as *const c_ulong).cast::<u8>(),
                    1,
                );
            }
        }

        let wm_delete = intern_atom(display, "WM_DELETE_WINDOW").unwrap_or(0);
        let wm_protocols = intern_atom(display, "WM_PROTOCOLS").unwrap_or(0);
        if wm_delete != 0 {
            let mut protocols = [wm_delete];
            unsafe {
                let _ = XSetWMProtocols(display, window, protocols.as_mut_ptr(), 1);
            }
        }
        unsafe {
            let _ = XFlush(display);
        }

        Ok(Self {
            display,
            window,
            wm_delete,
            wm_protocols,
        })
    }

    pub fn window_id(&self) -> c_ulong {
        self.window
    }

    pub fn display(&self) -> *mut c_void {
        self.display
    }

    pub fn set_title(&self, title: &str) {
        let Ok(title) = CString::new(title) else {
            return;
        };
        unsafe {
            let _ = XStoreName(self.display, self.window, title.as_ptr());
            let _ = XFlush(self.display);
        }
    }

    /// Drains pending X events. Returns true when the window manager
    /// asked to close the window.
    pub fn pump_close_requested(&self) -> bool {
        if self.display.is_null() {
            return false;
        }
        let mut close = false;
        unsafe {
            while XPending(self.display) > 0 {
                let mut event = XEvent { pad: [0; 24] };
                let _ = XNextEvent(self.display, &mut event);
                if event.type_ != CLIENT_MESSAGE {
                    continue;
                }
                let message = event.xclient;
                if self.wm_delete != 0
                    && message.message_type == self.wm_protocols
                    && message.data.longs[0] as c_ulong == self.wm_delete
                {
                    close = true;
                }
            }
        }
        close
    }

    pub fn resize(&self, width: i32, height: i32) -> bool {
        resize_window(self.display, self.window, width, height)
    }

    /// Points XdndProxy on the plugin widget and each of its ancestors
    /// at the widget, so drop events route to it.
    pub fn set_xdnd_proxy(&self, plugin_window: c_ulong) {
        if self.display.is_null() || plugin_window == 0 {
            return;
        }
        let Some(xdnd_proxy) = intern_atom(self.display, "XdndProxy") else {
            return;
        };
        let mut current = plugin_window;
        while current != 0 {
            unsafe {
                let _ = XChangeProperty(
                    self.display,
                    current,
                    xdnd_proxy,
                    XA_WINDOW,
                    32,
                    PROP_MODE_REPLACE,
                    (&plugin_window as *const c_ulong).cast::<u8>(),
                    1,
                );
            }
            let mut root: c_ulong = 0;
            let mut parent: c_ulong = 0;
            let mut children: *mut c_ulong = std::ptr::null_mut();
            let mut nchildren: c_uint = 0;
            let ok = unsafe {
                XQueryTree(
                    self.display,
                    current,
                    &mut root,
                    &mut parent,
                    &mut children,
                    &mut nchildren,
                )
            };
            if ok == 0 {
                break;
            }
            if !children.is_null() {
                unsafe {
                    let _ = XFree(children.cast::<c_void>());
                }
            }
            if parent == root || parent == 0 {
                break;
            }
            current = parent;
        }
        unsafe {
            let _ = XFlush(self.display);
        }
    }

    /// Idempotent teardown; also run by Drop.
    pub fn close(&mut self) {
        if self.display.is_null() {
            return;
        }
        unsafe {
            if self.window != 0 {
                let _ = XDestroyWindow(self.display, self.window);
                self.window = 0;
            }
            let _ = XSync(self.display, 0);
            let _ = XCloseDisplay(self.display);
        }
        self.display = std::ptr::null_mut();
    }
}

impl Drop for HostWindow {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resize hook shared with the UI's resize feature. Takes the display
/// lock; the UI may call this re-entrantly from within its own event
/// handling.
pub fn resize_window(display: *mut c_void, window: c_ulong, width: i32, height: i32) -> bool {
    if display.is_null() || window == 0 || width <= 0 || height <= 0 {
        return false;
    }
    unsafe {
        XLockDisplay(display);
        let _ = XResizeWindow(display, window, width as c_uint, height as c_uint);
        let _ = XFlush(display);
        XUnlockDisplay(display);
    }
    true
}

fn intern_atom(display: *mut c_void, name: &str) -> Option<c_ulong> {
    let name = CString::new(name).ok()?;
    let atom = unsafe { XInternAtom(display, name.as_ptr(), 0) };
    (atom != 0).then_some(atom)
}
