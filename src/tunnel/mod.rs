//! Public exposure of the callback endpoint.
//!
//! Either a fixed `public_url` from the settings (static mode) or a tunnel
//! process supervised by [`Supervisor`]. Both publish a [`TunnelSession`]
//! through the same watch channel, which the renewal loop and the status
//! endpoint read.

pub mod launcher;
pub mod session;
pub mod supervisor;

use thiserror::Error;

pub use launcher::{ChildProcess, NgrokLauncher, TunnelLauncher, TunnelProcess};
pub use session::TunnelSession;
pub use supervisor::Supervisor;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to spawn tunnel process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tunnel setup failed: {0}")]
    Setup(String),

    #[error("no public URL discovered after {attempts} attempts")]
    Discovery { attempts: u32 },
}
