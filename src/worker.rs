use std::cell::UnsafeCell;
use std::ffi::{CString, c_void};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lv2_raw::LV2Feature;

use crate::ring::RingBuffer;

pub const LV2_WORKER__SCHEDULE: &str = "http://lv2plug.in/ns/ext/worker#schedule";
pub const LV2_WORKER__INTERFACE: &str = "http://lv2plug.in/ns/ext/worker#interface";

pub const WORKER_RING_BYTES: usize = 8192;

type Lv2WorkerStatus = u32;
const LV2_WORKER_SUCCESS: Lv2WorkerStatus = 0;
const LV2_WORKER_ERR_UNKNOWN: Lv2WorkerStatus = 1;
const LV2_WORKER_ERR_NO_SPACE: Lv2WorkerStatus = 2;

#[repr(C)]
pub struct Lv2WorkerSchedule {
    pub handle: *mut c_void,
    pub schedule_work:
        Option<unsafe extern "C" fn(handle: *mut c_void, size: u32, data: *const c_void) -> u32>,
}

pub type Lv2WorkerRespondFunc =
    Option<unsafe extern "C" fn(handle: *mut c_void, size: u32, data: *const c_void) -> u32>;

#[repr(C)]
pub struct Lv2WorkerInterface {
    pub work: Option<
        unsafe extern "C" fn(
            handle: *mut c_void,
            respond: Lv2WorkerRespondFunc,
            respond_handle: *mut c_void,
            size: u32,
            data: *const c_void,
        ) -> u32,
    >,
    pub work_response:
        Option<unsafe extern "C" fn(handle: *mut c_void, size: u32, data: *const c_void) -> u32>,
    pub end_run: Option<unsafe extern "C" fn(handle: *mut c_void)>,
}

#[derive(Clone, Copy)]
struct WorkerBinding {
    iface: *const Lv2WorkerInterface,
    handle: *mut c_void,
}

/// Shared state between the audio thread (producer of requests, reader
/// of responses), the worker thread, and the schedule callback handed to
/// the plugin. Frames on both rings are `[size: u32][payload]`.
pub struct WorkerState {
    requests: RingBuffer,
    responses: RingBuffer,
    running: AtomicBool,
    // Written only while the worker thread does not exist: set before
    // the spawn, cleared after the join.
    binding: UnsafeCell<Option<WorkerBinding>>,
}

unsafe impl Send for WorkerState {}
unsafe impl Sync for WorkerState {}

impl WorkerState {
    fn new() -> Self {
        Self {
            requests: RingBuffer::new(WORKER_RING_BYTES),
            responses: RingBuffer::new(WORKER_RING_BYTES),
            running: AtomicBool::new(false),
            binding: UnsafeCell::new(None),
        }
    }

    fn binding(&self) -> Option<WorkerBinding> {
        unsafe { *self.binding.get() }
    }

    fn set_binding(&self, binding: Option<WorkerBinding>) {
        unsafe { *self.binding.get() = binding }
    }

    /// Audio thread. Frames a request into the request ring; refuses the
    /// whole frame when space is short so the plugin can retry.
    pub fn schedule(&self, data: &[u8]) -> bool {
        let size = data.len() as u32;
        if self.requests.write_space() < std::mem::size_of::<u32>() + data.len() {
            return false;
        }
        self.requests.write(&size.to_ne_bytes());
        if !data.is_empty() {
            self.requests.write(data);
        }
        true
    }

    /// Worker thread, via the respond callback the plugin receives.
    pub fn respond(&self, data: &[u8]) -> bool {
        let size = data.len() as u32;
        if self.responses.write_space() < std::mem::size_of::<u32>() + data.len() {
            return false;
        }
        self.responses.write(&size.to_ne_bytes());
        if !data.is_empty() {
            self.responses.write(data);
        }
        true
    }

    pub fn has_responses(&self) -> bool {
        self.responses.read_space() >= std::mem::size_of::<u32>()
    }

    /// Audio thread, end of cycle. Pops every complete response frame and
    /// hands it to the plugin's `work_response`, preserving production
    /// order. `scratch` is pre-allocated to the ring capacity, so this
    /// path never allocates.
    pub fn deliver_responses(&self, scratch: &mut [u8]) {
        let Some(binding) = self.binding() else {
            return;
        };
        let iface = unsafe { &*binding.iface };
        loop {
            let mut size_buf = [0u8; 4];
            if !self.responses.peek(&mut size_buf) {
                break;
            }
            let size = u32::from_ne_bytes(size_buf) as usize;
            if self.responses.read_space() < std::mem::size_of::<u32>() + size {
                break;
            }
            self.responses.read(&mut size_buf);
            if size > scratch.len() {
                // Cannot happen with a scratch sized to the ring, but a
                // truncated drain beats corrupting the frame stream.
                break;
            }
            let payload = &mut scratch[..size];
            self.responses.read(payload);
            if let Some(work_response) = iface.work_response {
                unsafe {
                    work_response(binding.handle, size as u32, payload.as_ptr().cast::<c_void>());
                }
            }
        }
    }

    /// Audio thread, after responses are delivered.
    pub fn end_run(&self) {
        let Some(binding) = self.binding() else {
            return;
        };
        if let Some(end_run) = unsafe { &*binding.iface }.end_run {
            unsafe { end_run(binding.handle) };
        }
    }
}

unsafe extern "C" fn schedule_work_callback(
    handle: *mut c_void,
    size: u32,
    data: *const c_void,
) -> Lv2WorkerStatus {
    if handle.is_null() || (size > 0 && data.is_null()) {
        return LV2_WORKER_ERR_UNKNOWN;
    }
    let state = unsafe { &*(handle as *const WorkerState) };
    let payload = if size == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data.cast::<u8>(), size as usize) }
    };
    if state.schedule(payload) {
        LV2_WORKER_SUCCESS
    } else {
        LV2_WORKER_ERR_NO_SPACE
    }
}

unsafe extern "C" fn respond_callback(
    handle: *mut c_void,
    size: u32,
    data: *const c_void,
) -> Lv2WorkerStatus {
    if handle.is_null() || (size > 0 && data.is_null()) {
        return LV2_WORKER_ERR_UNKNOWN;
    }
    let state = unsafe { &*(handle as *const WorkerState) };
    let payload = if size == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data.cast::<u8>(), size as usize) }
    };
    if state.respond(payload) {
        LV2_WORKER_SUCCESS
    } else {
        LV2_WORKER_ERR_NO_SPACE
    }
}

fn worker_thread(state: Arc<WorkerState>) {
    let mut payload = Vec::new();
    while state.running.load(Ordering::Acquire) {
        if state.requests.read_space() < std::mem::size_of::<u32>() {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        let mut size_buf = [0u8; 4];
        if !state.requests.peek(&mut size_buf) {
            continue;
        }
        let size = u32::from_ne_bytes(size_buf) as usize;
        if state.requests.read_space() < std::mem::size_of::<u32>() + size {
            // Producer is mid-frame; the rest arrives momentarily.
            continue;
        }
        state.requests.read(&mut size_buf);
        payload.resize(size, 0);
        state.requests.read(&mut payload);

        let Some(binding) = state.binding() else {
            continue;
        };
        let Some(work) = (unsafe { &*binding.iface }).work else {
            continue;
        };
        unsafe {
            work(
                binding.handle,
                Some(respond_callback),
                Arc::as_ptr(&state) as *mut c_void,
                size as u32,
                payload.as_ptr().cast::<c_void>(),
            );
        }
    }
}

/// Owns the schedule feature offered at instantiation and, when the
/// plugin exposes a worker interface, the background thread servicing
/// its requests.
pub struct HostWorker {
    state: Arc<WorkerState>,
    _schedule_uri: CString,
    _schedule: Box<Lv2WorkerSchedule>,
    pub feature: LV2Feature,
    thread: Option<JoinHandle<()>>,
}

unsafe impl Send for HostWorker {}

impl HostWorker {
    pub fn new() -> Result<Self, String> {
        let state = Arc::new(WorkerState::new());
        let schedule = Box::new(Lv2WorkerSchedule {
            handle: Arc::as_ptr(&state) as *mut c_void,
            schedule_work: Some(schedule_work_callback),
        });
        let schedule_uri = CString::new(LV2_WORKER__SCHEDULE)
            .map_err(|e| format!("Invalid worker schedule URI: {e}"))?;
        let feature = LV2Feature {
            uri: schedule_uri.as_ptr(),
            data: (&*schedule as *const Lv2WorkerSchedule)
                .cast_mut()
                .cast::<c_void>(),
        };
        Ok(Self {
            state,
            _schedule_uri: schedule_uri,
            _schedule: schedule,
            feature,
            thread: None,
        })
    }

    pub fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Binds the plugin's worker interface and starts the thread. Called
    /// once after instantiation, before the audio callback runs.
    pub fn start(&mut self, iface: *const Lv2WorkerInterface, dsp_handle: *mut c_void) {
        if self.thread.is_some() || iface.is_null() {
            return;
        }
        self.state.set_binding(Some(WorkerBinding {
            iface,
            handle: dsp_handle,
        }));
        self.state.running.store(true, Ordering::Release);
        let state = self.state.clone();
        self.thread = Some(thread::spawn(move || worker_thread(state)));
    }

    /// Clears the running flag and joins. In-flight work completes; no
    /// further requests are serviced.
    pub fn stop(&mut self) {
        if !self.state.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.state.set_binding(None);
    }
}

impl Drop for HostWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_frames_requests() {
        let state = WorkerState::new();
        assert!(state.schedule(b"ABCDEFGH"));
        assert_eq!(state.requests.read_space(), 4 + 8);
        let mut size_buf = [0u8; 4];
        assert!(state.requests.read(&mut size_buf));
        assert_eq!(u32::from_ne_bytes(size_buf), 8);
        let mut payload = [0u8; 8];
        assert!(state.requests.read(&mut payload));
        assert_eq!(&payload, b"ABCDEFGH");
    }

    #[test]
    fn schedule_refuses_when_full() {
        let state = WorkerState::new();
        let big = vec![0u8; WORKER_RING_BYTES];
        assert!(!state.schedule(&big));
        assert_eq!(state.requests.read_space(), 0);
    }

    #[test]
    fn responses_preserve_order() {
        let state = WorkerState::new();
        assert!(state.respond(b"one"));
        assert!(state.respond(b"twotwo"));
        let mut size_buf = [0u8; 4];
        state.responses.read(&mut size_buf);
        let mut first = vec![0u8; u32::from_ne_bytes(size_buf) as usize];
        state.responses.read(&mut first);
        assert_eq!(first, b"one");
        state.responses.read(&mut size_buf);
        let mut second = vec![0u8; u32::from_ne_bytes(size_buf) as usize];
        state.responses.read(&mut second);
        assert_eq!(second, b"twotwo");
    }
}
