//! List attached devices and the streams they offer.
//!
//! Usage: XVCAPTURE_BACKEND=xr50 cargo run --example enumerate

use std::time::Duration;
use xvcapture::CaptureConfig;

fn main() {
    env_logger::init();

    let config = CaptureConfig::from_env();
    let source = match xvcapture::open_source(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let devices = source.discover(Duration::from_secs(2));
    println!("Found {} device(s):", devices.len());
    for (i, (id, device)) in devices.iter().enumerate() {
        let kinds: Vec<String> = device
            .capabilities()
            .kinds()
            .map(|k| k.to_string())
            .collect();
        println!("  [{}] {}  streams=[{}]", i, id, kinds.join(", "));
    }
    if devices.is_empty() {
        std::process::exit(1);
    }
}
