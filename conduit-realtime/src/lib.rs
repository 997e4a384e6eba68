//! Realtime duplex audio sessions. A session owns one underlying
//! websocket; its send and receive halves are independently consumable,
//! and disposal closes the transport with a normal-closure frame on every
//! exit path.

pub mod config;
pub mod events;
pub mod openai;
pub mod session;
pub mod ultravox;

pub use config::{RealtimeConfig, TurnDetection};
pub use events::{ClientFrame, RealtimeResponse};
pub use session::{
    RealtimeSession, SessionRegistry, SessionState, SessionStats, StatsRecorder,
};
