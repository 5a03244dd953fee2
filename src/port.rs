use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lilv::{World, plugin::Plugin};

use crate::atom::{self, AtomBuffer};
use crate::ring::RingBuffer;
use crate::urid::Urids;

pub const LV2_CORE__AUDIO_PORT: &str = "http://lv2plug.in/ns/lv2core#AudioPort";
pub const LV2_CORE__CONTROL_PORT: &str = "http://lv2plug.in/ns/lv2core#ControlPort";
pub const LV2_CORE__INPUT_PORT: &str = "http://lv2plug.in/ns/lv2core#InputPort";
pub const LV2_ATOM__ATOM_PORT: &str = "http://lv2plug.in/ns/ext/atom#AtomPort";
pub const LV2_MIDI__MIDI_EVENT: &str = "http://lv2plug.in/ns/ext/midi#MidiEvent";

/// Default atom buffer size; grown when a port declares
/// `resize-port#minimumSize`.
pub const DEFAULT_ATOM_CAPACITY: usize = 8192;
/// DSP→UI ring per atom output port. UI delivery is best-effort, so the
/// ring just needs room for a few cycles worth of events.
pub const DSP_TO_UI_RING_BYTES: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Audio,
    Control,
    Atom { midi: bool },
    /// A port type outside the host's model (CV and friends). The port
    /// is left untouched: no JACK endpoint, no buffer, never connected.
    Inert,
}

/// Single float cell behind a control port. The DSP reads it through
/// the pointer handed to `connect_port`; the UI thread and preset
/// restore store into it. Plain f32 stores are atomic on supported
/// targets, which is what makes the unsynchronized handoff tolerable
/// for these coarse values.
pub struct ControlCell(UnsafeCell<f32>);

unsafe impl Send for ControlCell {}
unsafe impl Sync for ControlCell {}

impl ControlCell {
    fn new(value: f32) -> Self {
        Self(UnsafeCell::new(value))
    }

    pub fn get(&self) -> f32 {
        unsafe { *self.0.get() }
    }

    pub fn set(&self, value: f32) {
        unsafe { *self.0.get() = value }
    }

    /// Pointer the plugin instance is connected to.
    pub fn as_ptr(&self) -> *mut f32 {
        self.0.get()
    }
}

/// One-shot UI→DSP message cell. The UI publishes at most one pending
/// atom; a newer publish overwrites an unconsumed one (last-write-wins).
pub struct UiToDspCell {
    bytes: UnsafeCell<Vec<u8>>,
    atom_type: AtomicU32,
    pending: AtomicBool,
}

unsafe impl Send for UiToDspCell {}
unsafe impl Sync for UiToDspCell {}

impl UiToDspCell {
    fn new() -> Self {
        Self {
            bytes: UnsafeCell::new(Vec::new()),
            atom_type: AtomicU32::new(0),
            pending: AtomicBool::new(false),
        }
    }

    /// UI thread. Stores the message and raises the pending flag last so
    /// the audio thread never observes a half-written cell.
    pub fn publish(&self, atom_type: u32, data: &[u8]) {
        let bytes = unsafe { &mut *self.bytes.get() };
        bytes.clear();
        bytes.extend_from_slice(data);
        self.atom_type.store(atom_type, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Audio thread. Claims the pending message, if any, and hands type
    /// and payload to `f`. The payload is not copied; `f` must finish
    /// with it before returning.
    pub fn consume(&self, f: impl FnOnce(u32, &[u8])) -> bool {
        if !self.pending.swap(false, Ordering::Acquire) {
            return false;
        }
        let bytes = unsafe { &*self.bytes.get() };
        f(self.atom_type.load(Ordering::Relaxed), bytes.as_slice());
        true
    }
}

/// Runtime state of an atom port: the plugin-visible sequence buffer,
/// the DSP→UI ring, and the UI→DSP one-shot cell (input ports only).
pub struct AtomPortState {
    buffer: UnsafeCell<AtomBuffer>,
    pub dsp_to_ui: RingBuffer,
    pub ui_to_dsp: UiToDspCell,
}

unsafe impl Send for AtomPortState {}
unsafe impl Sync for AtomPortState {}

impl AtomPortState {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: UnsafeCell::new(AtomBuffer::new(capacity)),
            dsp_to_ui: RingBuffer::new(DSP_TO_UI_RING_BYTES),
            ui_to_dsp: UiToDspCell::new(),
        }
    }

    /// The sequence region. Exclusive access holds by discipline, not
    /// by a lock: only init (before the callback exists) and the audio
    /// callback itself reach for this.
    #[allow(clippy::mut_from_ref)]
    pub fn buffer(&self) -> &mut AtomBuffer {
        unsafe { &mut *self.buffer.get() }
    }
}

/// Immutable-after-init port descriptor plus its mutable runtime cells.
pub struct Port {
    pub index: usize,
    pub kind: PortKind,
    pub is_input: bool,
    pub symbol: String,
    pub uri: String,
    pub control: ControlCell,
    pub default: f32,
    pub atom: Option<AtomPortState>,
}

impl Port {
    pub fn is_audio(&self) -> bool {
        self.kind == PortKind::Audio
    }

    pub fn is_control(&self) -> bool {
        self.kind == PortKind::Control
    }

    pub fn is_atom(&self) -> bool {
        matches!(self.kind, PortKind::Atom { .. })
    }

    pub fn is_midi(&self) -> bool {
        matches!(self.kind, PortKind::Atom { midi: true })
    }
}

/// Builds the port list from the plugin's declared ports. Atom buffers
/// are sized to `atom_capacity` and pre-framed so the instance can be
/// connected before the first cycle. Ports outside the audio/control/
/// atom model come back inert rather than failing the whole plugin.
pub fn scan_ports(
    world: &World,
    plugin: &Plugin,
    atom_capacity: usize,
    urids: &Urids,
) -> Result<Vec<Port>, String> {
    let audio_class = world.new_uri(LV2_CORE__AUDIO_PORT);
    let control_class = world.new_uri(LV2_CORE__CONTROL_PORT);
    let input_class = world.new_uri(LV2_CORE__INPUT_PORT);
    let atom_class = world.new_uri(LV2_ATOM__ATOM_PORT);
    let midi_event = world.new_uri(LV2_MIDI__MIDI_EVENT);

    let plugin_uri = plugin
        .uri()
        .as_uri()
        .map(str::to_string)
        .ok_or_else(|| "Plugin URI is not a URI node".to_string())?;

    let mut ports = Vec::with_capacity(plugin.ports_count());
    for lp in plugin.iter_ports() {
        let index = lp.index();
        let is_audio = lp.is_a(&audio_class);
        let is_control = lp.is_a(&control_class);
        let is_atom = lp.is_a(&atom_class);
        let is_input = lp.is_a(&input_class);
        let is_midi = is_atom && lp.supports_event(&midi_event);

        let kind = if is_audio {
            PortKind::Audio
        } else if is_control {
            PortKind::Control
        } else if is_atom {
            PortKind::Atom { midi: is_midi }
        } else {
            PortKind::Inert
        };

        let symbol = lp
            .symbol()
            .and_then(|node| node.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("port_{index}"));
        let uri = format!("{plugin_uri}#{symbol}");

        let default = if is_control && is_input {
            lp.range()
                .default
                .and_then(|node| node.as_float())
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let atom = if is_atom {
            let state = AtomPortState::new(atom_capacity);
            let buf = state.buffer();
            if is_input {
                atom::clear_input_sequence(buf, urids.atom_sequence);
            } else {
                atom::prepare_output_sequence(buf);
            }
            Some(state)
        } else {
            None
        };

        ports.push(Port {
            index,
            kind,
            is_input,
            symbol,
            uri,
            control: ControlCell::new(default),
            default,
            atom,
        });
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_cell_stores_and_exposes_pointer() {
        let cell = ControlCell::new(0.25);
        assert_eq!(cell.get(), 0.25);
        cell.set(0.5);
        assert_eq!(cell.get(), 0.5);
        unsafe { *cell.as_ptr() = 0.75 };
        assert_eq!(cell.get(), 0.75);
    }

    #[test]
    fn cell_publish_then_consume() {
        let cell = UiToDspCell::new();
        cell.publish(9, &[1, 2, 3, 4]);
        let mut seen = None;
        assert!(cell.consume(|t, b| seen = Some((t, b.to_vec()))));
        assert_eq!(seen, Some((9, vec![1, 2, 3, 4])));
        assert!(!cell.consume(|_, _| panic!("cell should be empty")));
    }

    #[test]
    fn cell_last_write_wins() {
        let cell = UiToDspCell::new();
        cell.publish(1, &[1]);
        cell.publish(2, &[2, 2]);
        let mut seen = None;
        assert!(cell.consume(|t, b| seen = Some((t, b.to_vec()))));
        assert_eq!(seen, Some((2, vec![2, 2])));
    }
}
