use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use jack::{AsyncClient, AudioIn, AudioOut, Client, ClientOptions, MidiIn, MidiOut, Port as JackPort};
use lilv::World;
use tracing::{error, info};

use crate::engine::AudioEngine;
use crate::features::{FeatureSet, StatePathFeatures, check_required_features};
use crate::port::{self, DEFAULT_ATOM_CAPACITY, Port, PortKind};
use crate::preset::{PresetCatalog, PresetInfo};
use crate::ui::UiSession;
use crate::urid::{UridRegistry, Urids};
use crate::worker::{HostWorker, LV2_WORKER__INTERFACE, Lv2WorkerInterface};
use crate::x11::HostWindow;

/// Cadence of the cooperative UI loop.
pub const UI_TICK: Duration = Duration::from_millis(60);

/// Cross-thread signalling between the audio callback, the UI loop and
/// shutdown. All coarse, all best-effort.
#[derive(Default)]
pub struct HostFlags {
    pub ui_dirty: AtomicBool,
    pub ui_needs_initial_update: AtomicBool,
    pub ui_needs_control_update: AtomicBool,
    pub run: AtomicBool,
    pub shutdown: AtomicBool,
}

#[derive(Default)]
pub struct Notifications;

impl jack::NotificationHandler for Notifications {}

/// The host: one plugin, one JACK client, one X11 window. Owned by main;
/// sub-objects are assembled in a fixed order by `new` and torn down by
/// `close`, which is idempotent and also runs on drop.
pub struct Host {
    plugin_uri: String,
    plugin_name: String,
    preset_label: Option<String>,
    world: World,
    urid: UridRegistry,
    urids: Urids,
    state_paths: StatePathFeatures,
    catalog: PresetCatalog,
    _features: FeatureSet,
    worker: HostWorker,
    ports: Arc<Vec<Port>>,
    flags: Arc<HostFlags>,
    client: Option<Client>,
    engine: Option<AudioEngine>,
    active: Option<AsyncClient<Notifications, AudioEngine>>,
    window: Option<HostWindow>,
    ui: Option<UiSession>,
}

impl Host {
    pub fn new(plugin_uri: &str) -> Result<Self, String> {
        let world = World::new();
        world.load_all();

        let uri_node = world.new_uri(plugin_uri);
        let plugin = world
            .plugins()
            .plugin(&uri_node)
            .ok_or_else(|| format!("Plugin not found for URI: {plugin_uri}"))?;
        let plugin_name = plugin
            .name()
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| plugin_uri.to_string());

        let catalog = PresetCatalog::new()?;
        let atom_capacity =
            DEFAULT_ATOM_CAPACITY.max(catalog.minimum_atom_size(plugin_uri) as usize);

        let urid = UridRegistry::new()?;
        let urids = Urids::new(&urid);
        let state_paths = StatePathFeatures::new()?;
        let mut worker = HostWorker::new()?;

        let (client, _status) = Client::new(&plugin_name, ClientOptions::NO_START_SERVER)
            .map_err(|e| format!("Failed to open JACK client '{plugin_name}': {e}"))?;
        let sample_rate = client.sample_rate() as f64;
        let block_length = client.buffer_size() as u32;

        let ports = port::scan_ports(&world, &plugin, atom_capacity, &urids)?;
        let mut audio_in: Vec<(usize, JackPort<AudioIn>)> = Vec::new();
        let mut audio_out: Vec<(usize, JackPort<AudioOut>)> = Vec::new();
        let mut midi_in: Vec<(usize, JackPort<MidiIn>)> = Vec::new();
        let mut midi_out: Vec<(usize, JackPort<MidiOut>)> = Vec::new();
        for p in &ports {
            match p.kind {
                PortKind::Audio if p.is_input => {
                    let jack_port = client
                        .register_port(&p.symbol, AudioIn::default())
                        .map_err(|e| format!("Failed to register audio input '{}': {e}", p.symbol))?;
                    audio_in.push((p.index, jack_port));
                }
                PortKind::Audio => {
                    let jack_port = client
                        .register_port(&p.symbol, AudioOut::default())
                        .map_err(|e| format!("Failed to register audio output '{}': {e}", p.symbol))?;
                    audio_out.push((p.index, jack_port));
                }
                PortKind::Atom { midi: true } if p.is_input => {
                    let jack_port = client
                        .register_port(&p.symbol, MidiIn::default())
                        .map_err(|e| format!("Failed to register MIDI input '{}': {e}", p.symbol))?;
                    midi_in.push((p.index, jack_port));
                }
                PortKind::Atom { midi: true } => {
                    let jack_port = client
                        .register_port(&p.symbol, MidiOut::default())
                        .map_err(|e| format!("Failed to register MIDI output '{}': {e}", p.symbol))?;
                    midi_out.push((p.index, jack_port));
                }
                _ => {}
            }
        }
        let ports = Arc::new(ports);

        let features = FeatureSet::new(&urid, &urids, &worker, block_length)?;
        check_required_features(&plugin, &features)?;

        let instance = unsafe { plugin.instantiate(sample_rate, features.refs()) }
            .ok_or_else(|| format!("Failed to instantiate plugin: {plugin_uri}"))?;
        let mut active = unsafe { instance.activate() };

        let worker_iface = unsafe {
            active
                .instance()
                .extension_data::<Lv2WorkerInterface>(LV2_WORKER__INTERFACE)
        };
        if let Some(iface) = worker_iface {
            let handle = active.instance().handle() as *mut c_void;
            worker.start(iface.as_ptr(), handle);
            info!("Worker thread started for {plugin_name}");
        }

        // Control and atom buffers live at stable addresses inside the
        // shared port vector; audio ports are rebound every cycle.
        for p in ports.iter() {
            match p.kind {
                PortKind::Control => unsafe {
                    active
                        .instance_mut()
                        .connect_port_mut(p.index, p.control.as_ptr());
                },
                PortKind::Atom { .. } => {
                    if let Some(state) = p.atom.as_ref() {
                        unsafe {
                            active
                                .instance_mut()
                                .connect_port_mut(p.index, state.buffer().as_mut_ptr());
                        }
                    }
                }
                PortKind::Audio | PortKind::Inert => {}
            }
        }

        let flags = Arc::new(HostFlags::default());
        let worker_state = worker.is_running().then(|| worker.state());
        let engine = AudioEngine::new(
            flags.clone(),
            ports.clone(),
            audio_in,
            audio_out,
            midi_in,
            midi_out,
            active,
            worker_state,
            urids,
            atom_capacity,
        );

        info!("Hosting {plugin_name} at {sample_rate} Hz, block {block_length}");
        Ok(Self {
            plugin_uri: plugin_uri.to_string(),
            plugin_name,
            preset_label: None,
            world,
            urid,
            urids,
            state_paths,
            catalog,
            _features: features,
            worker,
            ports,
            flags,
            client: Some(client),
            engine: Some(engine),
            active: None,
            window: None,
            ui: None,
        })
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn presets(&self) -> Vec<PresetInfo> {
        self.catalog.presets(&self.plugin_uri)
    }

    /// Restores a preset's port values. On failure the host keeps its
    /// defaults and re-schedules the initial-value broadcast.
    pub fn apply_preset(&mut self, preset_uri: &str, label: &str) {
        match self.catalog.apply(
            preset_uri,
            &self.urid,
            &self.state_paths,
            &self.worker.feature,
            &self.ports,
        ) {
            Ok(()) => {
                info!("Applied preset '{label}'");
                self.preset_label = Some(label.to_string());
                self.flags
                    .ui_needs_control_update
                    .store(true, Ordering::Release);
                self.flags
                    .ui_needs_initial_update
                    .store(false, Ordering::Release);
            }
            Err(e) => {
                error!("Preset '{label}' failed: {e}");
                self.flags
                    .ui_needs_initial_update
                    .store(true, Ordering::Release);
            }
        }
    }

    /// Opens the host window, instantiates the plugin's X11 UI into it,
    /// and starts the JACK callback.
    pub fn init_ui(&mut self) -> Result<(), String> {
        let window = HostWindow::open()?;

        let uri_node = self.world.new_uri(&self.plugin_uri);
        let plugin = self
            .world
            .plugins()
            .plugin(&uri_node)
            .ok_or_else(|| format!("Plugin not found for URI: {}", self.plugin_uri))?;
        let ui = UiSession::instantiate(
            &self.world,
            &plugin,
            &self.plugin_uri,
            &self.urid,
            self.ports.clone(),
            &window,
        )?;

        let title = match &self.preset_label {
            Some(label) => format!("{} - {label}", self.plugin_name),
            None => self.plugin_name.clone(),
        };
        window.set_title(&title);
        window.set_xdnd_proxy(ui.widget_window());
        if self.preset_label.is_none() {
            self.flags
                .ui_needs_initial_update
                .store(true, Ordering::Release);
        }
        self.window = Some(window);
        self.ui = Some(ui);

        let client = self
            .client
            .take()
            .ok_or_else(|| "JACK client already consumed".to_string())?;
        let engine = self
            .engine
            .take()
            .ok_or_else(|| "Audio engine already consumed".to_string())?;
        self.active = Some(
            client
                .activate_async(Notifications, engine)
                .map_err(|e| format!("Failed to activate JACK client: {e}"))?,
        );
        Ok(())
    }

    /// Cooperative UI loop on the main thread: pump X11, broadcast
    /// control values, drain the DSP→UI rings, drive the UI idle hook.
    pub fn run_ui_loop(&mut self) {
        self.flags.run.store(true, Ordering::Release);
        let mut event_buf: Vec<u8> = Vec::new();

        while self.flags.run.load(Ordering::Acquire) {
            thread::sleep(UI_TICK);

            let close_requested = self
                .window
                .as_ref()
                .map(|window| window.pump_close_requested())
                .unwrap_or(false);
            if close_requested {
                info!("Window closed, shutting down");
                self.flags.shutdown.store(true, Ordering::Release);
                self.flags.run.store(false, Ordering::Release);
                self.close();
                return;
            }

            let Some(ui) = self.ui.as_ref() else {
                continue;
            };

            if self.flags.ui_dirty.swap(false, Ordering::AcqRel) {
                for p in self.ports.iter() {
                    if p.is_control() && !p.is_input {
                        ui.port_event_float(p.index as u32, p.control.get());
                    }
                }
            }
            if self.flags.ui_needs_initial_update.swap(false, Ordering::AcqRel) {
                for p in self.ports.iter() {
                    if p.is_control() && p.is_input {
                        p.control.set(p.default);
                        ui.port_event_float(p.index as u32, p.default);
                    }
                }
            }
            if self.flags.ui_needs_control_update.swap(false, Ordering::AcqRel) {
                for p in self.ports.iter() {
                    if p.is_control() && p.is_input {
                        ui.port_event_float(p.index as u32, p.control.get());
                    }
                }
            }

            for p in self.ports.iter() {
                if p.is_input {
                    continue;
                }
                let Some(state) = p.atom.as_ref() else {
                    continue;
                };
                let mut header = [0u8; 8];
                while state.dsp_to_ui.peek(&mut header) {
                    let size =
                        u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
                    let total = header.len() + size;
                    if state.dsp_to_ui.read_space() < total {
                        break;
                    }
                    event_buf.resize(total, 0);
                    if !state.dsp_to_ui.read(&mut event_buf) {
                        break;
                    }
                    ui.port_event_raw(p.index as u32, self.urids.atom_event_transfer, &event_buf);
                }
            }

            ui.idle();
        }
    }

    /// Idempotent teardown: silence the audio callback, recover and
    /// deactivate the DSP instance, stop the worker, destroy UI and
    /// window. Safe to call from the UI loop and from Drop.
    pub fn close(&mut self) {
        self.flags.shutdown.store(true, Ordering::Release);
        self.flags.run.store(false, Ordering::Release);

        if let Some(active) = self.active.take() {
            match active.deactivate() {
                Ok((client, _notifications, engine)) => {
                    engine.deactivate_instance();
                    drop(client);
                }
                Err(e) => error!("Failed to deactivate JACK client: {e}"),
            }
        }
        if let Some(engine) = self.engine.take() {
            engine.deactivate_instance();
        }
        self.worker.stop();
        self.ui = None;
        self.window = None;
        self.client = None;
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.close();
    }
}
