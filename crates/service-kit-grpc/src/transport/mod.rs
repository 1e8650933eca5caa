//! Connection handling beneath the server: HTTP/2 serving with keepalive
//! pings, connection age and idle limits, and client ping policing.

mod conn;
pub(crate) mod frame;
mod io;
mod policy;

pub(crate) use conn::{serve_connection, ConnectionSettings};
