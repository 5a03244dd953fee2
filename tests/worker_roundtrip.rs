use std::ffi::c_void;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lumahost::worker::{HostWorker, Lv2WorkerInterface};

#[derive(Default)]
struct StubDsp {
    received: Mutex<Vec<Vec<u8>>>,
    delivered: Mutex<Vec<Vec<u8>>>,
    end_runs: Mutex<u32>,
}

unsafe extern "C" fn stub_work(
    handle: *mut c_void,
    respond: Option<unsafe extern "C" fn(*mut c_void, u32, *const c_void) -> u32>,
    respond_handle: *mut c_void,
    size: u32,
    data: *const c_void,
) -> u32 {
    let dsp = unsafe { &*(handle as *const StubDsp) };
    let payload = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), size as usize) };
    dsp.received.lock().unwrap().push(payload.to_vec());
    if let Some(respond) = respond {
        unsafe {
            respond(respond_handle, 4, b"ZZZZ".as_ptr().cast::<c_void>());
        }
    }
    0
}

unsafe extern "C" fn stub_work_response(handle: *mut c_void, size: u32, data: *const c_void) -> u32 {
    let dsp = unsafe { &*(handle as *const StubDsp) };
    let payload = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), size as usize) };
    dsp.delivered.lock().unwrap().push(payload.to_vec());
    0
}

unsafe extern "C" fn stub_end_run(handle: *mut c_void) {
    let dsp = unsafe { &*(handle as *const StubDsp) };
    *dsp.end_runs.lock().unwrap() += 1;
}

static STUB_IFACE: Lv2WorkerInterface = Lv2WorkerInterface {
    work: Some(stub_work),
    work_response: Some(stub_work_response),
    end_run: Some(stub_end_run),
};

fn wait_for_responses(worker: &HostWorker) -> bool {
    let state = worker.state();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if state.has_responses() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn schedule_work_respond_deliver_roundtrip() {
    let dsp = Box::new(StubDsp::default());
    let mut worker = HostWorker::new().expect("worker feature");
    worker.start(&STUB_IFACE, (&*dsp as *const StubDsp as *mut StubDsp).cast::<c_void>());
    assert!(worker.is_running());

    let state = worker.state();
    assert!(state.schedule(b"ABCDEFGH"));
    assert!(wait_for_responses(&worker), "worker never responded");

    // Delivery happens on the caller's thread, standing in for the
    // audio thread at the end of a cycle.
    let mut scratch = vec![0u8; 8192];
    state.deliver_responses(&mut scratch);
    state.end_run();

    assert_eq!(dsp.received.lock().unwrap().as_slice(), &[b"ABCDEFGH".to_vec()]);
    assert_eq!(dsp.delivered.lock().unwrap().as_slice(), &[b"ZZZZ".to_vec()]);
    assert_eq!(*dsp.end_runs.lock().unwrap(), 1);

    worker.stop();
    assert!(!worker.is_running());
}

#[test]
fn responses_deliver_in_production_order() {
    let dsp = Box::new(StubDsp::default());
    let mut worker = HostWorker::new().expect("worker feature");
    worker.start(&STUB_IFACE, (&*dsp as *const StubDsp as *mut StubDsp).cast::<c_void>());

    let state = worker.state();
    assert!(state.schedule(b"first"));
    assert!(state.schedule(b"second"));
    assert!(state.schedule(b"third"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while dsp.received.lock().unwrap().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(
        dsp.received.lock().unwrap().as_slice(),
        &[b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );

    let mut scratch = vec![0u8; 8192];
    state.deliver_responses(&mut scratch);
    assert_eq!(dsp.delivered.lock().unwrap().len(), 3);

    worker.stop();
}

#[test]
fn stop_is_idempotent_and_rejects_nothing_in_flight() {
    let mut worker = HostWorker::new().expect("worker feature");
    // Never started: stop is a no-op.
    worker.stop();
    let dsp = Box::new(StubDsp::default());
    worker.start(&STUB_IFACE, (&*dsp as *const StubDsp as *mut StubDsp).cast::<c_void>());
    worker.stop();
    worker.stop();
    assert!(!worker.is_running());
}
