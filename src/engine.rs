use std::sync::Arc;
use std::sync::atomic::Ordering;

use jack::{
    AudioIn, AudioOut, Client, Control, MidiIn, MidiOut, Port as JackPort, ProcessHandler,
    ProcessScope, RawMidi,
};
use lilv::instance::ActiveInstance;
use lv2_raw::{LV2Atom, LV2AtomEvent};

use crate::atom;
use crate::host::HostFlags;
use crate::port::Port;
use crate::urid::Urids;
use crate::worker::{WORKER_RING_BYTES, WorkerState};

/// The JACK process handler: the only code that runs on the audio
/// thread. It may not allocate, block, or take locks; everything it
/// touches is either owned, a pre-allocated scratch region, or one of
/// the lock-free cells shared with the UI and worker threads.
pub struct AudioEngine {
    flags: Arc<HostFlags>,
    ports: Arc<Vec<Port>>,
    audio_in: Vec<(usize, JackPort<AudioIn>)>,
    audio_out: Vec<(usize, JackPort<AudioOut>)>,
    midi_in: Vec<(usize, JackPort<MidiIn>)>,
    midi_out: Vec<(usize, JackPort<MidiOut>)>,
    instance: ActiveInstance,
    worker: Option<Arc<WorkerState>>,
    urids: Urids,
    has_control_output: bool,
    event_scratch: Vec<u8>,
    response_scratch: Vec<u8>,
}

unsafe impl Send for AudioEngine {}

impl AudioEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: Arc<HostFlags>,
        ports: Arc<Vec<Port>>,
        audio_in: Vec<(usize, JackPort<AudioIn>)>,
        audio_out: Vec<(usize, JackPort<AudioOut>)>,
        midi_in: Vec<(usize, JackPort<MidiIn>)>,
        midi_out: Vec<(usize, JackPort<MidiOut>)>,
        instance: ActiveInstance,
        worker: Option<Arc<WorkerState>>,
        urids: Urids,
        atom_capacity: usize,
    ) -> Self {
        let has_control_output = ports
            .iter()
            .any(|port| port.is_control() && !port.is_input);
        Self {
            flags,
            ports,
            audio_in,
            audio_out,
            midi_in,
            midi_out,
            instance,
            worker,
            urids,
            has_control_output,
            event_scratch: vec![0u8; std::mem::size_of::<LV2AtomEvent>() + atom_capacity],
            response_scratch: vec![0u8; WORKER_RING_BYTES],
        }
    }

    /// Recovers and deactivates the DSP instance after the JACK client
    /// has been taken down.
    pub fn deactivate_instance(self) {
        unsafe {
            let _ = self.instance.deactivate();
        }
    }
}

impl ProcessHandler for AudioEngine {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let AudioEngine {
            flags,
            ports,
            audio_in,
            audio_out,
            midi_in,
            midi_out,
            instance,
            worker,
            urids,
            has_control_output,
            event_scratch,
            response_scratch,
        } = self;

        if flags.shutdown.load(Ordering::Acquire) {
            return Control::Continue;
        }
        let nframes = ps.n_frames();

        // Bind plugin audio ports to this cycle's JACK buffers.
        for (index, port) in audio_in.iter() {
            let ptr = port.as_slice(ps).as_ptr().cast_mut();
            unsafe {
                instance.instance_mut().connect_port_mut(*index, ptr);
            }
        }
        for (index, port) in audio_out.iter_mut() {
            let ptr = port.as_mut_slice(ps).as_mut_ptr();
            unsafe {
                instance.instance_mut().connect_port_mut(*index, ptr);
            }
        }

        // Frame atom buffers for the plugin: outputs advertise free
        // space, inputs start as empty sequences.
        for port in ports.iter() {
            let Some(state) = port.atom.as_ref() else {
                continue;
            };
            let buf = state.buffer();
            if port.is_input {
                atom::clear_input_sequence(buf, urids.atom_sequence);
            } else {
                atom::prepare_output_sequence(buf);
            }
        }

        // Marshal JACK MIDI into the input sequences.
        for (index, jack_port) in midi_in.iter() {
            let Some(state) = ports.get(*index).and_then(|p| p.atom.as_ref()) else {
                continue;
            };
            let buf = state.buffer();
            for raw in jack_port.iter(ps) {
                if raw.bytes.is_empty() {
                    continue;
                }
                if !atom::append_event(
                    buf,
                    event_scratch,
                    raw.time as i64,
                    urids.midi_event,
                    raw.bytes,
                ) {
                    break;
                }
            }
        }

        // At most one pending UI→DSP message per input atom port.
        for port in ports.iter() {
            if !port.is_input {
                continue;
            }
            let Some(state) = port.atom.as_ref() else {
                continue;
            };
            let buf = state.buffer();
            state.ui_to_dsp.consume(|atom_type, body| {
                atom::append_event(buf, event_scratch, 0, atom_type, body);
            });
        }

        unsafe {
            instance.run(nframes as usize);
        }

        // Responses the worker produced are delivered on this thread so
        // the plugin sees work_response in its audio context.
        if let Some(worker) = worker.as_ref() {
            worker.deliver_responses(response_scratch);
            worker.end_run();
        }

        if *has_control_output {
            flags.ui_dirty.store(true, Ordering::Release);
        }

        // Ship plugin-written output events to the UI ring and forward
        // MIDI to JACK. Ring overflow drops the event; UI delivery is
        // best-effort.
        for port in ports.iter() {
            if port.is_input {
                continue;
            }
            let Some(state) = port.atom.as_ref() else {
                continue;
            };
            let buf = state.buffer();
            let mut writer = midi_out
                .iter_mut()
                .find(|(index, _)| *index == port.index)
                .map(|(_, jack_port)| jack_port.writer(ps));
            atom::for_each_output_event(buf, |event, body| {
                let total = std::mem::size_of::<LV2Atom>() + body.len();
                let bytes = unsafe {
                    std::slice::from_raw_parts((&event.body as *const LV2Atom).cast::<u8>(), total)
                };
                let _ = state.dsp_to_ui.write(bytes);
                if event.body.mytype == urids.midi_event
                    && let Some(writer) = writer.as_mut()
                {
                    let _ = writer.write(&RawMidi {
                        time: event.time_in_frames.max(0) as u32,
                        bytes: body,
                    });
                }
            });
            atom::prepare_output_sequence(buf);
        }

        // Leave input sequences empty for the next cycle.
        for port in ports.iter() {
            if !port.is_input {
                continue;
            }
            if let Some(state) = port.atom.as_ref() {
                atom::finish_input_sequence(state.buffer());
            }
        }

        Control::Continue
    }
}
