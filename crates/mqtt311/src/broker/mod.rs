//! MQTT 3.1.1 broker core.
//!
//! The pieces compose bottom-up: durable [`session::Session`] state,
//! the per-connection [`tracker::Tracker`] for QoS 1/2 exchanges,
//! the shared [`backend::Backend`] substrate, the per-connection
//! [`client::ClientHandler`] engine, and the [`server::Engine`]
//! accept loop.

pub mod backend;
pub mod client;
pub mod config;
pub mod server;
pub mod session;
pub mod tracker;
pub mod transport;

pub use backend::{Ack, Backend, ConnectionId, MemoryBackend, SessionHandle, Setup};
pub use client::ClientHandler;
pub use config::BrokerConfig;
pub use server::Engine;
pub use session::{Direction, MemorySession, Session};
pub use tracker::{InboundPhase, OutboundPhase, Tracker};
