//! Address formatting for client wiring.

use std::net::Ipv6Addr;

/// Formats `host:port`, bracketing IPv6 literals.
pub fn format(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
