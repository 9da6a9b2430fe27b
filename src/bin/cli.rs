//! renderpipe CLI: device listing, playback and offline rendering.
//!
//! Usage:
//!   rp-cli devices
//!   rp-cli play path/to/file.wav [--device DEV] [--config settings.yaml]
//!   rp-cli play path/to/file.wav --wav output.wav
//!   rp-cli beep [--device DEV] [--config settings.yaml]

use rp_master::{load_settings, Controller, EngineSettings};
use std::io::Write;
use std::time::Duration;
use std::{env, fs};

const USAGE: &str = "Usage: rp-cli <devices | play <file.wav> [--wav out.wav] | beep> [--device DEV] [--config FILE]";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or_else(|| {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    });
    let settings = settings_from_args(&args);

    match command {
        "devices" => list_devices(settings),
        "play" => {
            let path = args.get(2).filter(|a| !a.starts_with("--")).unwrap_or_else(|| {
                eprintln!("{}", USAGE);
                std::process::exit(1);
            });
            let data = fs::read(path).unwrap_or_else(|e| {
                eprintln!("Failed to read {}: {}", path, e);
                std::process::exit(1);
            });
            match flag(&args, "--wav") {
                Some(out) => render_to_wav(&settings, &data, out),
                None => play_audio(settings, &data),
            }
        }
        "beep" => beep(settings),
        other => {
            eprintln!("Unknown command {}\n{}", other, USAGE);
            std::process::exit(1);
        }
    }
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn settings_from_args(args: &[String]) -> EngineSettings {
    let mut settings = match flag(args, "--config") {
        Some(path) => load_settings(path).unwrap_or_else(|e| {
            eprintln!("Failed to load {}: {}", path, e);
            std::process::exit(1);
        }),
        None => EngineSettings::default(),
    };
    if let Some(device) = flag(args, "--device") {
        settings.device = device.to_string();
    }
    settings
}

fn list_devices(settings: EngineSettings) {
    let ctrl = Controller::new(settings);
    for (driver, info) in ctrl.devices() {
        println!("{}", info.device_string(driver));
        println!("    {}", info);
    }
}

fn play_audio(settings: EngineSettings, data: &[u8]) {
    let mut ctrl = Controller::new(settings);
    ctrl.play_wav(data).unwrap_or_else(|e| {
        eprintln!("Failed to play: {}", e);
        std::process::exit(1);
    });
    if let Some(device) = ctrl.engine().device() {
        println!("Output: {}", device);
    }
    println!("Playing...");

    while ctrl.is_playing() {
        if let Some(pos) = ctrl.position() {
            print!("\rPosition: {:6.2}s", pos);
            let _ = std::io::stdout().flush();
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    println!("\rDone.              ");
}

fn render_to_wav(settings: &EngineSettings, data: &[u8], path: &str) {
    println!("Rendering to {}...", path);
    let wav = Controller::render_to_wav(settings, data).unwrap_or_else(|e| {
        eprintln!("Failed to render: {}", e);
        std::process::exit(1);
    });
    println!("Rendered {} bytes", wav.len());

    fs::write(path, &wav).unwrap_or_else(|e| {
        eprintln!("Failed to write {}: {}", path, e);
        std::process::exit(1);
    });

    println!("Done.");
}

fn beep(settings: EngineSettings) {
    let ctrl = Controller::new(settings);
    let sound = ctrl.beep(880.0, 250).unwrap_or_else(|e| {
        eprintln!("Failed to beep: {}", e);
        std::process::exit(1);
    });
    while ctrl.engine().is_sound_playing(&sound) {
        std::thread::sleep(Duration::from_millis(10));
    }
    ctrl.engine().drain();
}
