//! # MQTT 3.1.1 broker
//!
//! An embeddable MQTT 3.1.1 broker core: packet codec, session
//! storage, subscription routing, retained messages, will handling
//! and offline queueing behind a pluggable [`broker::Backend`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mqtt311::broker::{BrokerConfig, Engine, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> mqtt311::Result<()> {
//!     let config = BrokerConfig::default();
//!     let backend = Arc::new(MemoryBackend::new(config.clone()));
//!     let (engine, listener) =
//!         Engine::bind("0.0.0.0:1883".parse().unwrap(), config, backend).await?;
//!
//!     engine.serve(listener).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod broker;

pub use broker::{Backend, BrokerConfig, Engine, MemoryBackend};
pub use mqtt311_protocol::{self as protocol, Message, MqttError, QoS, Result, Subscription};
