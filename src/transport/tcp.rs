use super::{FrameWriter, Transport, TransportError, DEFAULT_WRITE_TIMEOUT};
use crate::controller::ControllerFrame;
use std::net::TcpStream;
use std::time::Duration;
use tracing::{error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Adapter reachable over TCP.
pub struct TcpTransport {
    target: String,
    stream: Option<TcpStream>,
    writer: FrameWriter,
    write_timeout: Duration,
}

impl TcpTransport {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            stream: None,
            writer: FrameWriter::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// A peer that stops reading fails the send after `timeout`.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    fn connect_error(&self, reason: impl ToString) -> TransportError {
        TransportError::ConnectError {
            target: self.target.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        use std::net::ToSocketAddrs;

        info!("Connecting to {}", self.target);
        let addr = self
            .target
            .to_socket_addrs()
            .map_err(|e| self.connect_error(e))?
            .next()
            .ok_or_else(|| self.connect_error("address did not resolve"))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
            error!("Failed to connect to {}: {}", self.target, e);
            self.connect_error(e)
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not disable Nagle on {}: {}", self.target, e);
        }
        stream
            .set_write_timeout(Some(self.write_timeout))
            .map_err(|e| self.connect_error(e))?;

        self.stream = Some(stream);
        self.writer.reset();
        Ok(())
    }

    fn send(&mut self, frame: &ControllerFrame, force: bool) -> Result<bool, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        self.writer.write_to(stream, frame, force)
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerKind;
    use crate::transport::{encode, FRAME_LEN};
    use std::io::{ErrorKind, Read};
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn frames_arrive_on_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut transport = TcpTransport::new(addr.to_string());
        transport.connect().unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut frame = ControllerFrame::neutral(ControllerKind::X360Pad, 127);
        assert!(transport.send(&frame, false).unwrap());
        assert!(!transport.send(&frame, false).unwrap());
        frame.set_button(2, true);
        assert!(transport.send(&frame, false).unwrap());

        let mut received = [0u8; 2 * FRAME_LEN];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received[FRAME_LEN..], &encode(&frame));
    }

    #[test]
    fn refused_connection_is_a_connect_error() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let mut transport = TcpTransport::new(addr.to_string());
        assert!(matches!(
            transport.connect(),
            Err(TransportError::ConnectError { .. })
        ));
    }

    #[test]
    fn peer_that_stops_reading_fails_the_send() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut transport =
            TcpTransport::new(addr.to_string()).with_write_timeout(Duration::from_millis(20));
        transport.connect().unwrap();
        // Accepted but never read from
        let (_peer, _) = listener.accept().unwrap();

        let frame = ControllerFrame::neutral(ControllerKind::X360Pad, 127);
        let started = Instant::now();
        let err = loop {
            match transport.send(&frame, true) {
                Ok(_) => assert!(started.elapsed() < Duration::from_secs(30), "send never failed"),
                Err(e) => break e,
            }
        };

        match err {
            TransportError::SendError(e) => {
                assert!(matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut), "{:?}", e)
            }
            other => panic!("expected a send error, got {:?}", other),
        }
    }
}
