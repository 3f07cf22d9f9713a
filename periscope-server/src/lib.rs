//! Remote control server for Periscope
//!
//! Lets an operator pull a profile out of a live process over a socket:
//!
//! ```text
//! curl --unix-socket /tmp/periscope/profileserver-$PID.sock \
//!     'http://localhost/profile?duration=10.0&mode=cpu'
//! ```
//!
//! The server speaks a minimal, deliberately non-compliant slice of HTTP:
//! one request line in, one response out, connection closed. It listens on
//! a Unix domain socket by default, or on a loopback TCP port; either way
//! it leaves a pid-tagged discovery record under the runtime directory so
//! external tooling can find the endpoint without parsing logs.

pub mod application;
pub mod config;
mod request;
pub mod server;
pub mod transport;

pub use application::ProfileApplication;
pub use config::ServerConfig;
pub use server::ProfileServer;
pub use transport::{ClientConnection, TransportKind};
