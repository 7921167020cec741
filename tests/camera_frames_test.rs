//! Camera service over loopback TCP.

mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tem_emulator::client::{CameraClient, TemClient};
use tem_emulator::command::{BeamUpdate, StageUpdate};
use tem_emulator::emulator::Emulator;
use tem_emulator::error::{AppResult, EmulatorError, ErrorKind};
use tem_emulator::protocol::Response;
use tem_emulator::render::{
    AcquisitionMode, AcquisitionParams, Image, PixelBuffer, PixelFormat,
};
use tem_emulator::state::{MicroscopeState, OpticsMode};

fn params() -> AcquisitionParams {
    AcquisitionParams {
        exposure_s: 0.5,
        ..AcquisitionParams::default()
    }
}

#[tokio::test]
async fn test_frame_header_matches_payload() {
    let emulator = common::start().await;
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();

    for dtype in PixelFormat::ALL {
        let frame = camera
            .acquire(AcquisitionParams {
                dtype,
                binning: 2,
                ..params()
            })
            .await
            .unwrap();
        assert_eq!((frame.header.width, frame.header.height), (16, 16));
        assert_eq!(frame.header.dtype, dtype);
        assert_eq!(frame.header.payload_bytes, 16 * 16 * dtype.bytes_per_pixel());
        assert_eq!(frame.image.pixels.format(), dtype);
        assert_eq!(frame.image.pixels.len(), 16 * 16);
    }
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_identical_state_gives_identical_frames() {
    let emulator = common::start().await;
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();
    let mut tem = TemClient::connect(emulator.tem_addr()).await.unwrap();

    let a = camera.acquire(params()).await.unwrap();
    let b = camera.acquire(params()).await.unwrap();
    assert_eq!(a.image, b.image);

    tem.set_stage_position(StageUpdate {
        x_nm: Some(700.0),
        ..StageUpdate::default()
    })
    .await
    .unwrap();
    let c = camera.acquire(params()).await.unwrap();
    assert_eq!(c.header.state.generation, 1);
    assert_ne!(a.image, c.image);
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_blanked_and_dark_frames_sit_at_dark_level() {
    let emulator = common::start().await;
    let dark_level = f64::from(common::test_settings().camera.dark_level);
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();
    let mut tem = TemClient::connect(emulator.tem_addr()).await.unwrap();

    let lit = camera.acquire(params()).await.unwrap();
    assert!(lit.image.pixels.mean() > dark_level + 100.0);

    let dark = camera
        .acquire(AcquisitionParams {
            mode: AcquisitionMode::Dark,
            ..params()
        })
        .await
        .unwrap();
    assert!((dark.image.pixels.mean() - dark_level).abs() < 10.0);

    tem.set_beam_parameter(BeamUpdate {
        blanked: Some(true),
        ..BeamUpdate::default()
    })
    .await
    .unwrap();
    let blanked = camera.acquire(params()).await.unwrap();
    assert!(blanked.header.state.beam.blanked);
    assert!((blanked.image.pixels.mean() - dark_level).abs() < 10.0);
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_diffraction_mode_renders() {
    let emulator = common::start().await;
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();
    let mut tem = TemClient::connect(emulator.tem_addr()).await.unwrap();

    tem.set_mode(OpticsMode::Diffraction, Some(3)).await.unwrap();
    let frame = camera.acquire(params()).await.unwrap();
    assert_eq!(frame.header.state.optics.mode, OpticsMode::Diffraction);
    assert_eq!(frame.header.state.optics.magnification_index, 3);
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_movie_streams_header_payload_pairs() {
    let emulator = common::start().await;
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();

    let frames = camera.acquire_movie(params(), 4).await.unwrap();
    assert_eq!(frames.len(), 4);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.header.frame_index as usize, i);
    }

    // The session is still in step after the last payload.
    let info = camera.get_info().await.unwrap();
    assert_eq!((info.width, info.height), (32, 32));
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_movie_frames_arrive_as_they_are_exposed() {
    let mut settings = common::test_settings();
    settings.camera.simulate_exposure = true;
    let emulator = Emulator::start(settings).await.unwrap();
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();

    let start = Instant::now();
    camera
        .connection()
        .send_request("acquire_movie", json!({"n_frames": 5, "exposure_s": 0.3}))
        .await
        .unwrap();
    let first = camera.connection().recv_response().await.unwrap();
    let first_at = start.elapsed();
    assert!(matches!(first, Response::Ok { .. }));
    assert!(
        first_at < Duration::from_millis(1_000),
        "first header should not wait for the whole movie: {first_at:?}"
    );

    // Payload of frame 0, then four more pairs.
    assert!(camera.connection().recv_frame().await.unwrap().is_some());
    for _ in 1..5 {
        let header = camera.connection().recv_response().await.unwrap();
        assert!(matches!(header, Response::Ok { .. }));
        assert!(camera.connection().recv_frame().await.unwrap().is_some());
    }
    assert!(start.elapsed() >= Duration::from_millis(1_500));
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exposure_longer_than_client_timeout_succeeds() {
    let mut settings = common::test_settings();
    settings.camera.simulate_exposure = true;
    let emulator = Emulator::start(settings).await.unwrap();
    let mut camera = CameraClient::connect(emulator.camera_addr())
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(200));

    let frame = camera.acquire(params()).await.unwrap();
    assert_eq!(frame.header.exposure_s, 0.5);

    let frames = camera.acquire_movie(params(), 3).await.unwrap();
    assert_eq!(frames.len(), 3);
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_state_change_during_movie_shows_in_later_frames() {
    let mut settings = common::test_settings();
    settings.camera.simulate_exposure = true;
    let emulator = Emulator::start(settings).await.unwrap();
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();
    let mut tem = TemClient::connect(emulator.tem_addr()).await.unwrap();

    let movie = tokio::spawn(async move {
        let exposure = AcquisitionParams {
            exposure_s: 0.2,
            ..AcquisitionParams::default()
        };
        camera.acquire_movie(exposure, 4).await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    tem.set_stage_position(StageUpdate {
        x_nm: Some(750.0),
        ..StageUpdate::default()
    })
    .await
    .unwrap();

    let frames = movie.await.unwrap().unwrap();
    let generations: Vec<u64> = frames.iter().map(|f| f.header.state.generation).collect();
    assert!(generations.windows(2).all(|w| w[0] <= w[1]), "{generations:?}");
    assert_eq!(generations.first(), Some(&0));
    assert_eq!(generations.last(), Some(&1));
    assert_eq!(frames[3].header.state.stage.x_nm, 750.0);
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_acquisition_reports_error_and_keeps_session() {
    let emulator = common::start().await;
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();

    let response = camera
        .connection()
        .call("acquire", json!({"binning": 3}))
        .await
        .unwrap();
    assert!(matches!(
        response,
        Response::Error {
            kind: ErrorKind::RenderFailure,
            ..
        }
    ));

    let response = camera
        .connection()
        .call("acquire", json!({"gain": 2}))
        .await
        .unwrap();
    assert!(matches!(
        response,
        Response::Error {
            kind: ErrorKind::InvalidParameter,
            ..
        }
    ));

    let response = camera.connection().call("snap", Value::Null).await.unwrap();
    assert!(matches!(
        response,
        Response::Error {
            kind: ErrorKind::UnknownCommand,
            ..
        }
    ));

    assert!(camera.acquire(params()).await.is_ok());
    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_renderer_is_reported_per_request() {
    let failing = |state: &MicroscopeState, _: &AcquisitionParams| -> AppResult<Image> {
        if state.stage.x_nm > 0.0 {
            return Err(EmulatorError::RenderFailure("specimen out of view".into()));
        }
        Ok(Image {
            width: 2,
            height: 2,
            pixels: PixelBuffer::U16(vec![1, 2, 3, 4]),
        })
    };
    let emulator = Emulator::start_with_renderer(common::test_settings(), Arc::new(failing))
        .await
        .unwrap();
    let mut camera = CameraClient::connect(emulator.camera_addr()).await.unwrap();
    let mut tem = TemClient::connect(emulator.tem_addr()).await.unwrap();

    let frame = camera.acquire(params()).await.unwrap();
    assert_eq!(frame.image.pixels, PixelBuffer::U16(vec![1, 2, 3, 4]));

    tem.set_stage_position(StageUpdate {
        x_nm: Some(1.0),
        ..StageUpdate::default()
    })
    .await
    .unwrap();
    let err = camera.acquire(params()).await.unwrap_err();
    assert!(matches!(
        err,
        EmulatorError::Remote {
            kind: ErrorKind::RenderFailure,
            ..
        }
    ));

    // TEM service is unaffected by camera failures.
    assert_eq!(tem.get_state().await.unwrap().generation, 1);
    emulator.shutdown().await.unwrap();
}
