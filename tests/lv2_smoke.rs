use lilv::World;

use lumahost::port::{DEFAULT_ATOM_CAPACITY, PortKind, scan_ports};
use lumahost::preset::PresetCatalog;
use lumahost::urid::{UridRegistry, Urids};

#[test]
fn scan_ports_of_any_installed_plugin() {
    let world = World::new();
    world.load_all();
    let Some(plugin) = world.plugins().iter().find(|p| p.verify()) else {
        eprintln!("No LV2 plugin found; skipping");
        return;
    };

    let urid = UridRegistry::new().expect("urid registry");
    let urids = Urids::new(&urid);
    let ports =
        scan_ports(&world, &plugin, DEFAULT_ATOM_CAPACITY, &urids).expect("port scan");
    assert_eq!(ports.len(), plugin.ports_count());
    for (position, port) in ports.iter().enumerate() {
        assert_eq!(port.index, position);
        assert!(!port.symbol.is_empty());
        assert_eq!(port.atom.is_some(), port.is_atom());
        // Port types outside the audio/control/atom model stay inert:
        // present in the list, bound to nothing.
        if port.kind == PortKind::Inert {
            assert!(port.atom.is_none());
        }
    }
}

#[test]
fn preset_catalog_queries_do_not_crash() {
    let world = World::new();
    world.load_all();
    let Some(plugin) = world.plugins().iter().find(|p| p.verify()) else {
        eprintln!("No LV2 plugin found; skipping");
        return;
    };
    let Some(uri) = plugin.uri().as_uri().map(str::to_string) else {
        eprintln!("Plugin URI invalid; skipping");
        return;
    };

    let catalog = PresetCatalog::new().expect("preset world");
    let presets = catalog.presets(&uri);
    for preset in &presets {
        assert!(!preset.uri.is_empty());
        assert!(!preset.label.is_empty());
    }
    let _ = catalog.minimum_atom_size(&uri);
    assert_eq!(catalog.minimum_atom_size("urn:lumahost:no-such-plugin"), 0);
}
