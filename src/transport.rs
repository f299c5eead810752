//! Socket transport for the real-time interface

use crate::buffer::RawBuffer;
use crate::{Result, URError};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

/// Byte transport the control loop runs over
pub trait Transport: Send {
    /// Open the connection, giving up after `timeout`
    fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Append whatever bytes are available into the buffer's spare tail.
    ///
    /// Fails with `ReceiveTimeout` if nothing arrived within the read
    /// timeout, and with `Socket` on reset, EOF or I/O failure.
    fn read_available(&mut self, buffer: &mut RawBuffer) -> Result<usize>;

    /// Append bytes that are already waiting, without blocking.
    ///
    /// Returns `Ok(0)` when nothing is pending or the buffer has no room.
    fn read_pending(&mut self, buffer: &mut RawBuffer) -> Result<usize>;

    /// Write one command line; the newline is appended here
    fn send(&mut self, line: &str) -> Result<()>;

    fn disconnect(&mut self);
}

/// `TcpStream` transport with bounded connect, read and write times
pub struct TcpTransport {
    stream: Option<TcpStream>,
    read_timeout: Duration,
}

impl TcpTransport {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            stream: None,
            read_timeout,
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> Result<()> {
        self.disconnect();

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| URError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.read_timeout))?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read_available(&mut self, buffer: &mut RawBuffer) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| URError::Connection("Not connected".to_string()))?;

        let spare = buffer.spare_mut();
        if spare.is_empty() {
            return Ok(0);
        }

        match stream.read(spare) {
            Ok(0) => Err(closed_by_peer()),
            Ok(count) => {
                buffer.advance(count);
                Ok(count)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(URError::ReceiveTimeout(self.read_timeout))
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(URError::Socket(e)),
        }
    }

    fn read_pending(&mut self, buffer: &mut RawBuffer) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| URError::Connection("Not connected".to_string()))?;

        let spare = buffer.spare_mut();
        if spare.is_empty() {
            return Ok(0);
        }

        stream.set_nonblocking(true).map_err(URError::Socket)?;
        let result = stream.read(spare);
        stream.set_nonblocking(false).map_err(URError::Socket)?;

        match result {
            Ok(0) => Err(closed_by_peer()),
            Ok(count) => {
                buffer.advance(count);
                Ok(count)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(URError::Socket(e)),
        }
    }

    fn send(&mut self, line: &str) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| URError::Connection("Not connected".to_string()))?;

        let line = format!("{}\n", line);
        stream.write_all(line.as_bytes()).map_err(URError::Socket)?;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn closed_by_peer() -> URError {
    URError::Socket(std::io::Error::new(
        ErrorKind::UnexpectedEof,
        "connection closed by controller",
    ))
}

/// In-memory peer for driving the control loop in tests
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct MockState {
        pub incoming: VecDeque<Vec<u8>>,
        pub sent: Vec<String>,
        pub connected: bool,
        pub connect_attempts: u32,
        pub refuse_connect: bool,
        pub fail_next_read: bool,
        pub fail_next_send: bool,
    }

    impl MockState {
        /// Move the next queued chunk, or as much of it as fits, into `buffer`
        fn take_incoming(&mut self, buffer: &mut RawBuffer) -> usize {
            let Some(chunk) = self.incoming.pop_front() else {
                return 0;
            };
            let taken = buffer.extend_from_slice(&chunk);
            if taken < chunk.len() {
                self.incoming.push_front(chunk[taken..].to_vec());
            }
            taken
        }
    }

    /// Cloneable so a test keeps a view of the state the driver owns
    #[derive(Debug, Clone, Default)]
    pub struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_incoming(&self, bytes: Vec<u8>) {
            self.state.lock().unwrap().incoming.push_back(bytes);
        }

        pub fn sent(&self) -> Vec<String> {
            self.state.lock().unwrap().sent.clone()
        }

        pub fn connect_attempts(&self) -> u32 {
            self.state.lock().unwrap().connect_attempts
        }

        pub fn fail_next_read(&self) {
            self.state.lock().unwrap().fail_next_read = true;
        }

        pub fn fail_next_send(&self) {
            self.state.lock().unwrap().fail_next_send = true;
        }

        pub fn refuse_connect(&self, refuse: bool) {
            self.state.lock().unwrap().refuse_connect = refuse;
        }
    }

    impl Transport for MockTransport {
        fn connect(&mut self, addr: SocketAddr, _timeout: Duration) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.connect_attempts += 1;
            if state.refuse_connect {
                return Err(URError::Connection(format!("{} refused", addr)));
            }
            state.connected = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.state.lock().unwrap().connected
        }

        fn read_available(&mut self, buffer: &mut RawBuffer) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(URError::Connection("Not connected".to_string()));
            }
            if state.fail_next_read {
                state.fail_next_read = false;
                state.connected = false;
                return Err(URError::Socket(std::io::Error::new(ErrorKind::ConnectionReset, "reset by peer")));
            }
            if state.incoming.is_empty() {
                return Err(URError::ReceiveTimeout(Duration::from_millis(8)));
            }
            Ok(state.take_incoming(buffer))
        }

        fn read_pending(&mut self, buffer: &mut RawBuffer) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(URError::Connection("Not connected".to_string()));
            }
            Ok(state.take_incoming(buffer))
        }

        fn send(&mut self, line: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_send {
                state.fail_next_send = false;
                state.connected = false;
                return Err(URError::Socket(std::io::Error::new(ErrorKind::BrokenPipe, "broken pipe")));
            }
            state.sent.push(line.to_string());
            Ok(())
        }

        fn disconnect(&mut self) {
            self.state.lock().unwrap().connected = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::new(Duration::from_millis(200));
        transport.connect(local(port), Duration::from_millis(500)).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        transport.send("stopj(2.000000)").unwrap();
        let mut received = [0u8; 16];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"stopj(2.000000)\n");

        peer.write_all(&[7u8; 10]).unwrap();
        let mut buffer = RawBuffer::new();
        let count = transport.read_available(&mut buffer).unwrap();
        assert!(count > 0);
        assert_eq!(buffer.as_slice()[0], 7);
    }

    #[test]
    fn test_silence_is_receive_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::new(Duration::from_millis(20));
        transport.connect(local(port), Duration::from_millis(500)).unwrap();
        let _peer = listener.accept().unwrap();

        let mut buffer = RawBuffer::new();
        assert!(matches!(
            transport.read_available(&mut buffer),
            Err(URError::ReceiveTimeout(_))
        ));
    }

    #[test]
    fn test_pending_read_never_waits() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // A long read timeout that a pending read must not sit through
        let mut transport = TcpTransport::new(Duration::from_secs(5));
        transport.connect(local(port), Duration::from_millis(500)).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut buffer = RawBuffer::new();
        let started = std::time::Instant::now();
        assert_eq!(transport.read_pending(&mut buffer).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));

        peer.write_all(&[9u8; 32]).unwrap();
        peer.flush().unwrap();
        let mut total = 0;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while total < 32 && std::time::Instant::now() < deadline {
            total += transport.read_pending(&mut buffer).unwrap();
        }
        assert_eq!(total, 32);
        assert_eq!(buffer.as_slice()[31], 9);
    }

    #[test]
    fn test_peer_close_is_socket_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::new(Duration::from_millis(200));
        transport.connect(local(port), Duration::from_millis(500)).unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        let mut buffer = RawBuffer::new();
        assert!(matches!(transport.read_available(&mut buffer), Err(URError::Socket(_))));
    }
}
