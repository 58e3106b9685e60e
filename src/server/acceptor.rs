//! Connection acceptor thread.
//!
//! Polls the nonblocking listener, configures each accepted socket with the
//! client timeouts, and registers it in the roster. On shutdown it closes
//! every client socket and then the listener.

use super::{ServerState, ACCEPT_POLL_INTERVAL, CLIENT_SOCKET_TIMEOUT};
use log::{error, warn};
use std::net::TcpListener;

pub(crate) fn run(state: &ServerState, listener: TcpListener) {
    state.connection.set_running(true);

    while state.connection.is_requested() {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(err) = stream
                    .set_read_timeout(Some(CLIENT_SOCKET_TIMEOUT))
                    .and_then(|_| stream.set_write_timeout(Some(CLIENT_SOCKET_TIMEOUT)))
                {
                    warn!("failed to configure socket timeouts for {addr}: {err}");
                    continue;
                }
                if let Err(err) = stream.set_nodelay(true) {
                    warn!("failed to disable Nagle for {addr}: {err}");
                }
                state.registry.add(stream, state.clock.system_time());
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                error!("error accepting client connection: {err}");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    // Client sockets first, then the server socket.
    state.registry.close_all();
    drop(listener);
    state.connection.set_running(false);
}
