//! Emulated transmission electron microscope for testing control software.
//!
//! Two TCP services share one microscope state:
//!
//! * the **TEM service** ([`server::TemService`]) is the only writer. It applies stage,
//!   lens, beam and mode commands and answers state queries;
//! * the **camera service** ([`server::CameraService`]) renders synthetic frames from a
//!   snapshot of that state, so images follow whatever the TEM client last set.
//!
//! State lives in a [`state::StateStore`] that publishes immutable snapshots. Commands
//! are validated in [`command`], frames are produced by a [`render::Renderer`], and both
//! services speak the length-prefixed JSON protocol in [`protocol`].
//!
//! ```no_run
//! # async fn demo() -> tem_emulator::error::AppResult<()> {
//! use tem_emulator::config::Settings;
//! use tem_emulator::emulator::Emulator;
//!
//! let emulator = Emulator::start(Settings::default().with_ephemeral_ports()).await?;
//! println!("TEM on {}, camera on {}", emulator.tem_addr(), emulator.camera_addr());
//! emulator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod emulator;
pub mod error;
pub mod limits;
pub mod logging;
pub mod protocol;
pub mod render;
pub mod server;
pub mod state;
