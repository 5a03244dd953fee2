use std::process::exit;

use tracing::{error, warn};
use tracing_subscriber::{
    fmt::{Layer as FmtLayer, writer::MakeWriterExt},
    prelude::*,
};

use lumahost::host::Host;
use lumahost::x11;

fn main() {
    let stdout_layer =
        FmtLayer::new().with_writer(std::io::stdout.with_max_level(tracing::Level::INFO));
    tracing_subscriber::registry().with(stdout_layer).init();

    exit(run());
}

fn run() -> i32 {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "lumahost".to_string());
    let Some(plugin_uri) = args.next() else {
        println!("Minimal LV2 X11 host");
        println!("Usage:");
        println!("  {program} <plugin-uri> [preset-index]");
        return 0;
    };
    let preset_index: Option<usize> = args.next().and_then(|arg| arg.parse().ok());

    if !x11::ensure_x11_threads() {
        warn!("XInitThreads() failed");
    }

    let mut host = match Host::new(&plugin_uri) {
        Ok(host) => host,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    let presets = host.presets();
    if !presets.is_empty() {
        println!("Found presets:");
        for (index, preset) in presets.iter().enumerate() {
            println!("  [{index}] {}", preset.label);
        }
        if let Some(choice) = preset_index
            && let Some(preset) = presets.get(choice)
        {
            println!("Loading preset: {}", preset.label);
            host.apply_preset(&preset.uri, &preset.label);
        }
    }

    if let Err(e) = host.init_ui() {
        error!("{e}");
        return 1;
    }

    host.run_ui_loop();
    0
}
