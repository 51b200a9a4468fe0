//! A UI-side client asks a privileged host process for on-device model work
//! (availability, download, session lifecycle, streaming prompts) over one
//! long-lived duplex channel. The host owns the single model session.

pub mod client;
pub mod config;
pub mod error;
pub mod prompt;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod stream;
pub mod transport;

pub use client::{ChannelClient, ClientOptions, ResponseStream};
pub use error::BridgeError;
pub use prompt::{AppContext, ControlInfo};
pub use server::ChannelServer;
