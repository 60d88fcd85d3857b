pub mod artifact;
pub mod classify;
pub mod config;
pub mod console_log;
pub mod error;
pub mod line_stream;
pub mod lock_cleanup;
pub mod resources;
pub mod retry;
pub mod roster;
pub mod server;
pub mod sink;
pub mod snapshot;
pub mod tunnel;

pub use config::WardenConfig;
pub use error::SupervisorError;
pub use roster::RosterReconciler;
pub use server::{LaunchSpec, ProcessSupervisor};
pub use sink::{ChannelSink, FanoutSink, SharedSink, Sink};
pub use tunnel::TunnelSupervisor;
