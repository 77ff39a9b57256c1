//! Synchronous TCP transport for the remote-serial protocol.
//!
//! Wraps the listening socket, the packet decoder, and the ACK/NAK
//! discipline. The accepted connection runs in non-blocking mode with short
//! polls; acknowledgement waits are bounded by a five-second deadline so a
//! stuck peer cannot wedge a response exchange for good.

use crate::gdb::command::{self, Command};
use crate::gdb::packet::{PacketDecoder, PacketEncoder, PacketError};
use crate::gdb::response::Response;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error;

const MAX_RETRY_COUNT: usize = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    /// Unexpected internal failure; the session should end.
    #[error("internal failure")]
    InternalFail,
    /// The connection broke; the socket has been closed.
    #[error("connection fault")]
    ConnectionFault,
    /// The peer kept violating the protocol after all retries.
    #[error("protocol violation")]
    ProtocolFail,
    /// A transient framing problem, worth a NAK and another attempt.
    #[error("retryable protocol error")]
    ProtocolRetry,
    /// The packet arrived intact but is not a known command.
    #[error("unknown command")]
    DecodeFail,
}

/// The stub's side of one debugger connection.
pub struct NetworkHandler {
    listener: TcpListener,
    socket: Option<TcpStream>,
    decoder: PacketDecoder,
}

impl NetworkHandler {
    /// Starts listening on `port`. Accepting happens lazily on the first
    /// send or receive.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Ok(Self {
            listener,
            socket: None,
            decoder: PacketDecoder::new(),
        })
    }

    /// The port the handler listens on.
    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Drops the connection. The next send or receive accepts a new one.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        self.decoder = PacketDecoder::new();
    }

    fn ensure_socket(&mut self) -> Result<(), NetworkError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let (socket, peer) = self.listener.accept().map_err(|_| {
            log::warn!("failed to accept a debugger connection");
            NetworkError::ConnectionFault
        })?;
        log::info!("debugger connected from {peer}");
        socket.set_nodelay(true).ok();
        socket
            .set_nonblocking(true)
            .map_err(|_| NetworkError::ConnectionFault)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), NetworkError> {
        let mut written = 0;
        while written < bytes.len() {
            let result = match self.socket.as_mut() {
                Some(socket) => socket.write(&bytes[written..]),
                None => return Err(NetworkError::ConnectionFault),
            };
            match result {
                Ok(0) => {
                    self.close();
                    return Err(NetworkError::ConnectionFault);
                }
                Ok(count) => written += count,
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(_) => {
                    self.close();
                    return Err(NetworkError::ConnectionFault);
                }
            }
        }
        Ok(())
    }

    /// Pulls connection bytes into the decoder until it yields a result or
    /// the deadline (if any) passes.
    fn fetch_packet(&mut self, deadline: Option<Instant>) -> Result<String, NetworkError> {
        while !self.decoder.new_packet_available() {
            match self.read_some()? {
                true => continue,
                false => {
                    if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                        return Err(NetworkError::ProtocolRetry);
                    }
                    std::thread::yield_now();
                }
            }
        }

        self.decoder.pop_packet().map_err(|error| match error {
            PacketError::BadChecksum | PacketError::BadPacket => NetworkError::ProtocolRetry,
            PacketError::BufferOverflow => NetworkError::ProtocolFail,
            _ => NetworkError::InternalFail,
        })
    }

    /// Reads whatever is available right now. `Ok(true)` if any bytes came
    /// in, `Ok(false)` if the read would block.
    fn read_some(&mut self) -> Result<bool, NetworkError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(NetworkError::ConnectionFault);
        };
        let mut buffer = [0u8; 1024];
        match socket.read(&mut buffer) {
            Ok(0) => {
                self.close();
                Err(NetworkError::ConnectionFault)
            }
            Ok(count) => {
                self.decoder.push(&buffer[..count]);
                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(error) if error.kind() == ErrorKind::Interrupted => Ok(false),
            Err(_) => {
                self.close();
                Err(NetworkError::ConnectionFault)
            }
        }
    }

    /// Sends `response` and waits for the peer's acknowledgement, retrying
    /// on NAK up to five times.
    pub fn send(&mut self, response: &Response) -> Result<(), NetworkError> {
        let data = PacketEncoder::encode(&response.to_wire());
        self.ensure_socket()?;

        for _ in 0..MAX_RETRY_COUNT {
            self.write_bytes(data.as_bytes())?;

            // The acknowledgement must arrive within the request timeout;
            // when it does not, the whole packet is transmitted again.
            let packet = match self.fetch_packet(Some(Instant::now() + REQUEST_TIMEOUT)) {
                Ok(packet) => packet,
                Err(NetworkError::ProtocolRetry) => continue,
                Err(error) => return Err(error),
            };

            match command::parse(&packet) {
                Some(Command::Ack { ok: true }) => return Ok(()),
                // NAK: transmit again.
                Some(Command::Ack { ok: false }) => continue,
                _ => return Err(NetworkError::ProtocolFail),
            }
        }

        Err(NetworkError::ProtocolFail)
    }

    /// Waits for the next command, acknowledging good packets and NAK-ing
    /// retryable framing errors up to five times.
    pub fn receive(&mut self) -> Result<Command, NetworkError> {
        self.ensure_socket()?;

        for _ in 0..MAX_RETRY_COUNT {
            // Waiting for the debugger's next request is open-ended; only a
            // framing error earns a NAK and another attempt.
            let packet = match self.fetch_packet(None) {
                Ok(packet) => packet,
                Err(NetworkError::ProtocolRetry) => {
                    self.write_bytes(b"-")?;
                    continue;
                }
                Err(error) => return Err(error),
            };

            self.write_bytes(b"+")?;
            return command::parse(&packet).ok_or(NetworkError::DecodeFail);
        }

        Err(NetworkError::ProtocolFail)
    }

    /// Non-waiting variant of [`receive`](Self::receive) used while the
    /// worker runs: drains available bytes and returns `Ok(None)` when no
    /// complete, parseable command is pending.
    pub fn try_receive(&mut self) -> Result<Option<Command>, NetworkError> {
        if self.socket.is_none() {
            return Ok(None);
        }

        while !self.decoder.new_packet_available() {
            if !self.read_some()? {
                return Ok(None);
            }
        }

        match self.decoder.pop_packet() {
            Ok(packet) => {
                self.write_bytes(b"+")?;
                Ok(command::parse(&packet))
            }
            Err(_) => {
                self.write_bytes(b"-")?;
                Ok(None)
            }
        }
    }
}
