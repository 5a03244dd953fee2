//! lumahost — a minimal JACK host for a single LV2 plugin with an X11 GUI.
//!
//! The host bridges three worlds: the JACK process callback on the audio
//! thread, the dynamically loaded plugin DSP instance, and the plugin's
//! X11 UI running on the main thread. Everything crossing the audio-thread
//! boundary goes through lock-free structures: control cells, one-shot
//! UI→DSP cells, and single-producer/single-reader ring buffers.

pub mod atom;
pub mod engine;
pub mod features;
pub mod host;
pub mod port;
pub mod preset;
pub mod ring;
pub mod ui;
pub mod urid;
pub mod worker;
pub mod x11;
