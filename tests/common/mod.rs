//! Shared helpers for integration tests.

#![allow(dead_code)]

use tem_emulator::config::Settings;
use tem_emulator::emulator::Emulator;

/// Loopback settings with a small detector so frames render quickly.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default().with_ephemeral_ports();
    settings.camera.width = 32;
    settings.camera.height = 32;
    settings.network.shutdown_grace_ms = 1_000;
    settings
}

pub async fn start() -> Emulator {
    Emulator::start(test_settings())
        .await
        .expect("emulator should start")
}
