use super::{FrameWriter, Transport, TransportError, DEFAULT_WRITE_TIMEOUT};
use crate::controller::ControllerFrame;
use serialport::SerialPort;
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_BAUD_RATE: u32 = 500_000;

/// Adapter on a serial line.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    writer: FrameWriter,
    write_timeout: Duration,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
            writer: FrameWriter::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        info!("Opening serial port {} at {} baud", self.path, self.baud_rate);
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.write_timeout)
            .open()
            .map_err(|e| {
                error!("Failed to open {}: {}", self.path, e);
                TransportError::ConnectError {
                    target: self.path.clone(),
                    reason: e.to_string(),
                }
            })?;

        self.port = Some(port);
        self.writer.reset();
        Ok(())
    }

    fn send(&mut self, frame: &ControllerFrame, force: bool) -> Result<bool, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        self.writer.write_to(port.as_mut(), frame, force)
    }

    fn describe(&self) -> String {
        format!("serial {} @ {}", self.path, self.baud_rate)
    }
}
