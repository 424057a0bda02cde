//! Bridge exposing native "now playing" metadata to a listener channel.
//!
//! A [`NowPlayingGate`] sits between a host [`EventChannel`] and a
//! [`NativeBridge`]: the native receiver is started when the first listener
//! attaches and stopped when the last one leaves. Status pushes from the
//! receiver are cached in a [`MetadataSnapshot`] and broadcast on the channel.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pmonowplaying::{Config, NativeBridge, NowPlayingGate, StatusChannel};
//!
//! # async fn demo(bridge: Arc<dyn NativeBridge>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_config(None)?.gate_config();
//! let channel = Arc::new(StatusChannel::new(&config.channel));
//! let gate = NowPlayingGate::new(config, bridge, channel.clone())?;
//!
//! let mut listener = channel.subscribe(); // démarre le receiver natif
//! if let Some(status) = listener.recv().await {
//!     println!("{status} / cached artist: {:?}", gate.artist());
//! }
//! drop(listener); // dernier abonné : stop
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod channel;
pub mod config;
pub mod errors;
pub mod gate;
mod locks;
pub mod logging;
pub mod snapshot;

pub use bridge::{BridgeAction, NativeBridge, StatusFeed};
pub use channel::{CountHook, EventChannel, StatusChannel, Subscription};
pub use config::Config;
pub use errors::NowPlayingError;
pub use gate::{GateConfig, GateState, GateStats, NowPlayingGate};
pub use logging::init_logging;
pub use snapshot::{MetadataSnapshot, status_object};
