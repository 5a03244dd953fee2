use lv2_raw::{
    LV2Atom, LV2AtomEvent, LV2AtomSequence, LV2AtomSequenceBody, LV2Urid,
    lv2_atom_sequence_append_event, lv2_atom_sequence_begin, lv2_atom_sequence_is_end,
    lv2_atom_sequence_next,
};

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Block([u8; 64]);

/// Contiguous 64-byte-aligned region shared with the plugin as an LV2
/// atom port buffer. The region is always framed as an atom sequence;
/// event bodies inside it keep the 8-byte padding the lv2 helpers apply.
pub struct AtomBuffer {
    blocks: Box<[Block]>,
    capacity: usize,
}

impl AtomBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(std::mem::size_of::<LV2AtomSequence>());
        let blocks = vec![Block([0; 64]); capacity.div_ceil(64)].into_boxed_slice();
        Self { blocks, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.blocks.as_mut_ptr().cast::<u8>()
    }

    fn sequence_mut(&mut self) -> *mut LV2AtomSequence {
        self.as_mut_ptr().cast::<LV2AtomSequence>()
    }

    /// Sequence body capacity advertised to the lv2 append helper.
    pub fn body_capacity(&self) -> u32 {
        (self.capacity - std::mem::size_of::<LV2Atom>()) as u32
    }
}

/// Frames the buffer as an empty input sequence ready for events.
pub fn clear_input_sequence(buf: &mut AtomBuffer, sequence_urid: LV2Urid) {
    let seq = buf.sequence_mut();
    unsafe {
        (*seq).atom.mytype = sequence_urid;
        (*seq).atom.size = std::mem::size_of::<LV2AtomSequenceBody>() as u32;
        (*seq).body.unit = 0;
        (*seq).body.pad = 0;
    }
}

/// Marks an input sequence consumed so the next cycle starts empty.
pub fn finish_input_sequence(buf: &mut AtomBuffer) {
    let seq = buf.sequence_mut();
    unsafe {
        (*seq).atom.size = 0;
    }
}

/// Advertises the whole region as writable to the plugin. The type is
/// left 0 until the plugin claims the buffer by writing a sequence.
pub fn prepare_output_sequence(buf: &mut AtomBuffer) {
    let capacity = buf.body_capacity();
    let seq = buf.sequence_mut();
    unsafe {
        (*seq).atom.mytype = 0;
        (*seq).atom.size = capacity;
    }
}

/// Appends one event to an input sequence. `scratch` is a pre-allocated
/// region at least `size_of::<LV2AtomEvent>() + body.len()` bytes large,
/// so the audio thread never allocates here. Returns false when the
/// sequence is out of space.
pub fn append_event(
    buf: &mut AtomBuffer,
    scratch: &mut [u8],
    frame: i64,
    event_type: LV2Urid,
    body: &[u8],
) -> bool {
    let needed = std::mem::size_of::<LV2AtomEvent>() + body.len();
    if scratch.len() < needed {
        return false;
    }
    let capacity = buf.body_capacity();
    let seq = buf.sequence_mut();
    let event = scratch.as_mut_ptr().cast::<LV2AtomEvent>();
    unsafe {
        (*event).time_in_frames = frame;
        (*event).body.mytype = event_type;
        (*event).body.size = body.len() as u32;
        let data = scratch
            .as_mut_ptr()
            .add(std::mem::size_of::<LV2AtomEvent>());
        std::ptr::copy_nonoverlapping(body.as_ptr(), data, body.len());
        !lv2_atom_sequence_append_event(seq, capacity, event).is_null()
    }
}

/// Walks the events a plugin wrote into an output sequence. Stops at the
/// first zero-sized event and yields nothing when the plugin never set
/// the container type. The callback receives the event header and body.
pub fn for_each_output_event(buf: &mut AtomBuffer, mut f: impl FnMut(&LV2AtomEvent, &[u8])) {
    let seq = buf.sequence_mut();
    unsafe {
        if (*seq).atom.mytype == 0 {
            return;
        }
        let body = &(*seq).body as *const LV2AtomSequenceBody;
        let size = (*seq).atom.size;
        let mut it = lv2_atom_sequence_begin(body);
        while !lv2_atom_sequence_is_end(body, size, it) {
            let event = &*it;
            if event.body.size == 0 {
                break;
            }
            let data = (it as *const u8).add(std::mem::size_of::<LV2AtomEvent>());
            let data = std::slice::from_raw_parts(data, event.body.size as usize);
            f(event, data);
            it = lv2_atom_sequence_next(it);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEQ: LV2Urid = 7;

    fn scratch() -> Vec<u8> {
        vec![0u8; 512]
    }

    #[test]
    fn buffer_is_64_byte_aligned() {
        let mut buf = AtomBuffer::new(100);
        assert_eq!(buf.as_mut_ptr() as usize % 64, 0);
        assert!(buf.capacity() >= 100);
    }

    #[test]
    fn cleared_input_sequence_is_empty() {
        let mut buf = AtomBuffer::new(256);
        clear_input_sequence(&mut buf, SEQ);
        let seq = buf.sequence_mut();
        unsafe {
            assert_eq!((*seq).atom.mytype, SEQ);
            assert_eq!(
                (*seq).atom.size as usize,
                std::mem::size_of::<LV2AtomSequenceBody>()
            );
            assert_eq!((*seq).body.unit, 0);
        }
    }

    #[test]
    fn output_sequence_advertises_free_space() {
        let mut buf = AtomBuffer::new(1024);
        prepare_output_sequence(&mut buf);
        let seq = buf.sequence_mut();
        unsafe {
            assert_eq!((*seq).atom.mytype, 0);
            assert_eq!(
                (*seq).atom.size as usize,
                buf.capacity() - std::mem::size_of::<LV2Atom>()
            );
        }
    }

    #[test]
    fn appended_events_roundtrip() {
        let mut buf = AtomBuffer::new(1024);
        let mut sc = scratch();
        clear_input_sequence(&mut buf, SEQ);
        assert!(append_event(&mut buf, &mut sc, 0, 42, &[0x90, 0x3C, 0x7F]));
        assert!(append_event(&mut buf, &mut sc, 16, 42, &[0x80, 0x3C, 0x00]));

        let mut seen = Vec::new();
        for_each_output_event(&mut buf, |ev, body| {
            seen.push((ev.time_in_frames, ev.body.mytype, body.to_vec()));
        });
        assert_eq!(
            seen,
            vec![
                (0, 42, vec![0x90, 0x3C, 0x7F]),
                (16, 42, vec![0x80, 0x3C, 0x00]),
            ]
        );
    }

    #[test]
    fn append_fails_when_sequence_is_full() {
        let mut buf = AtomBuffer::new(64);
        let mut sc = scratch();
        clear_input_sequence(&mut buf, SEQ);
        let mut appended = 0;
        while append_event(&mut buf, &mut sc, 0, 42, &[0u8; 16]) {
            appended += 1;
            assert!(appended < 64);
        }
        assert!(appended >= 1);
    }

    #[test]
    fn unclaimed_output_yields_nothing() {
        let mut buf = AtomBuffer::new(256);
        prepare_output_sequence(&mut buf);
        let mut count = 0;
        for_each_output_event(&mut buf, |_, _| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn finished_input_reads_empty() {
        let mut buf = AtomBuffer::new(256);
        let mut sc = scratch();
        clear_input_sequence(&mut buf, SEQ);
        assert!(append_event(&mut buf, &mut sc, 0, 42, &[1, 2, 3]));
        finish_input_sequence(&mut buf);
        let mut count = 0;
        for_each_output_event(&mut buf, |_, _| count += 1);
        assert_eq!(count, 0);
    }
}
