use crate::protocol::{AdbError, Command, Message};
use parking_lot::Mutex;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Open a TCP connection to adbd, trying every resolved address in turn.
pub fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, AdbError> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(AdbError::ConnectionFailed(format!(
            "{}:{} did not resolve",
            host, port
        )));
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(socket) => {
                log::debug!("Connected TCP socket to {}", addr);
                return Ok(socket);
            }
            Err(e) => {
                log::debug!("TCP connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(AdbError::ConnectionFailed(match last_error {
        Some(e) => format!("{}:{}: {}", host, port, e),
        None => format!("{}:{}: unreachable", host, port),
    }))
}

/// Owns the socket of one ADB session: a buffered read half for the receive
/// loop and a lock-guarded write half shared by every sender.
pub struct TcpTransport {
    socket: TcpStream,
    writer: Mutex<TcpStream>,
}

impl TcpTransport {
    /// Wrap a connected socket. Nagle is disabled since every frame is
    /// flushed on its own.
    pub fn new(socket: TcpStream) -> Result<Self, AdbError> {
        socket.set_nodelay(true)?;
        let writer = socket.try_clone()?;
        Ok(Self {
            socket,
            writer: Mutex::new(writer),
        })
    }

    /// A fresh buffered reader over the same socket
    pub fn reader(&self) -> Result<BufReader<TcpStream>, AdbError> {
        Ok(BufReader::new(self.socket.try_clone()?))
    }

    /// Send one encoded frame. Frames from different threads never interleave.
    pub fn send(&self, command: Command, arg0: u32, arg1: u32, payload: &[u8]) -> Result<(), AdbError> {
        let message = Message::new(command, arg0, arg1, payload);
        log::trace!("-> {}", message);
        let bytes = message.to_bytes();

        let mut writer = self.writer.lock();
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Shut down both directions; a blocked reader sees end-of-input.
    pub fn shutdown(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            log::debug!("Socket shutdown: {}", e);
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }
}
