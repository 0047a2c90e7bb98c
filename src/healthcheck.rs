//! `--healthcheck` mode for container probes: the service counts as healthy
//! when something already holds its port on loopback.

use std::net::TcpListener;

pub const HEALTHY: i32 = 0;
pub const UNHEALTHY: i32 = 1;

pub fn port_in_use(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// Process exit code for `--healthcheck`.
pub fn exit_code(port: u16) -> i32 {
    if port_in_use(port) {
        HEALTHY
    } else {
        UNHEALTHY
    }
}
