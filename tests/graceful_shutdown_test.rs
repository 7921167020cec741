//! Tests for graceful shutdown with timeout behavior.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tem_emulator::client::{CameraClient, TemClient};
use tem_emulator::emulator::Emulator;
use tem_emulator::error::AppResult;
use tem_emulator::render::{AcquisitionParams, Image, PixelBuffer};
use tem_emulator::state::MicroscopeState;

#[tokio::test]
async fn test_shutdown_closes_idle_sessions() {
    let emulator = common::start().await;
    let mut tem = TemClient::connect(emulator.tem_addr()).await.unwrap();
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();
    tem.get_state().await.unwrap();

    let start = Instant::now();
    emulator.shutdown().await.unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(900),
        "idle sessions should not hold shutdown for the grace period: {:?}",
        start.elapsed()
    );

    assert!(tem.connection().recv_frame().await.unwrap().is_none());
    assert!(camera.connection().recv_frame().await.unwrap().is_none());
}

#[tokio::test]
async fn test_in_flight_acquisition_completes() {
    let mut settings = common::test_settings();
    settings.camera.simulate_exposure = true;
    settings.network.shutdown_grace_ms = 5_000;
    let emulator = Emulator::start(settings).await.unwrap();
    let camera_addr = emulator.camera_addr();

    let acquisition = tokio::spawn(async move {
        let mut camera = CameraClient::connect(camera_addr).await.unwrap();
        camera
            .acquire(AcquisitionParams {
                exposure_s: 0.5,
                ..AcquisitionParams::default()
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    emulator.shutdown().await.unwrap();

    let frame = acquisition.await.unwrap().unwrap();
    assert_eq!(frame.header.exposure_s, 0.5);
}

#[tokio::test]
async fn test_stuck_session_is_aborted_after_grace() {
    let slow = |_: &MicroscopeState, _: &AcquisitionParams| -> AppResult<Image> {
        std::thread::sleep(Duration::from_secs(2));
        Ok(Image {
            width: 1,
            height: 1,
            pixels: PixelBuffer::U16(vec![0]),
        })
    };
    let mut settings = common::test_settings();
    settings.network.shutdown_grace_ms = 200;
    let emulator = Emulator::start_with_renderer(settings, Arc::new(slow))
        .await
        .unwrap();

    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();
    let acquisition =
        tokio::spawn(async move { camera.acquire(AcquisitionParams::default()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    emulator.shutdown().await.unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(1_500),
        "shutdown should stop waiting after the grace period: {:?}",
        start.elapsed()
    );
    assert!(acquisition.await.unwrap().is_err());
}

#[tokio::test]
async fn test_no_connections_after_shutdown() {
    let emulator = common::start().await;
    let tem_addr = emulator.tem_addr();
    emulator.shutdown().await.unwrap();

    assert!(TemClient::connect(tem_addr).await.is_err());
}
