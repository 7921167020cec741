//! Process-level wiring: one state store, two services, one shutdown signal.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Settings;
use crate::error::{AppResult, EmulatorError};
use crate::render::{Renderer, SyntheticRenderer};
use crate::server::{self, CameraService, ServiceHandle, SessionConfig, TemService};
use crate::state::StateStore;

/// A running emulator.
///
/// Dropping it closes the shutdown channel. Both accept loops stop and their
/// sessions close after any request in flight, in the background. Use
/// [`Emulator::shutdown`] to wait for that and to see whether it went cleanly.
#[derive(Debug)]
pub struct Emulator {
    store: Arc<StateStore>,
    tem: ServiceHandle,
    camera: ServiceHandle,
    shutdown_tx: watch::Sender<bool>,
}

impl Emulator {
    /// Start both services with the built-in synthetic renderer.
    pub async fn start(settings: Settings) -> AppResult<Self> {
        let calibration = Arc::new(settings.calibration.clone());
        let renderer = SyntheticRenderer::new(settings.camera.sensor(), calibration);
        Self::start_with_renderer(settings, Arc::new(renderer)).await
    }

    /// Start both services with a caller-supplied renderer.
    ///
    /// Both listeners are bound before either service accepts, so a port conflict
    /// leaves nothing running.
    pub async fn start_with_renderer(
        settings: Settings,
        renderer: Arc<dyn Renderer>,
    ) -> AppResult<Self> {
        settings.validate()?;
        let store = Arc::new(StateStore::new(
            settings.microscope.clone(),
            Arc::new(settings.calibration.clone()),
        )?);

        let tem_listener = server::bind("tem", &settings.tem.addr()).await?;
        let camera_listener = server::bind("camera", &settings.camera.addr()).await?;

        let session = SessionConfig {
            limits: settings.network.frame_limits(),
            shutdown_grace: settings.network.shutdown_grace(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tem = server::spawn_service(
            Arc::new(TemService::new(Arc::clone(&store))),
            tem_listener,
            session,
            shutdown_rx.clone(),
        )?;
        let camera = server::spawn_service(
            Arc::new(CameraService::new(
                Arc::clone(&store),
                renderer,
                settings.camera.sensor(),
                settings.camera.simulate_exposure,
            )),
            camera_listener,
            session,
            shutdown_rx,
        )?;

        info!(
            name = %settings.application.name,
            tem = %tem.local_addr(),
            camera = %camera.local_addr(),
            "Emulator started"
        );
        Ok(Self {
            store,
            tem,
            camera,
            shutdown_tx,
        })
    }

    /// Address of the TEM control service.
    pub fn tem_addr(&self) -> SocketAddr {
        self.tem.local_addr()
    }

    /// Address of the camera service.
    pub fn camera_addr(&self) -> SocketAddr {
        self.camera.local_addr()
    }

    /// The shared state store.
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Stop accepting, let sessions finish their current request, then stop.
    pub async fn shutdown(self) -> AppResult<()> {
        info!("Shutting down emulator");
        // Receivers live in the service tasks; a send error means they already exited.
        let _ = self.shutdown_tx.send(true);

        let mut errors = Vec::new();
        for handle in [self.tem, self.camera] {
            let name = handle.name();
            if let Err(e) = handle.join().await {
                error!(service = name, error = %e, "Service did not stop cleanly");
                errors.push(e);
            }
        }

        if errors.is_empty() {
            info!(generation = self.store.generation(), "Emulator stopped");
            Ok(())
        } else {
            Err(EmulatorError::ShutdownFailed(errors))
        }
    }

    /// Serve until `signal` resolves, then shut down.
    pub async fn run_until<F>(self, signal: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }
}
