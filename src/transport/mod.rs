//! Output side of the bridge: delivers [`ControllerFrame`]s to the adapter.
//!
//! Frames go out as a fixed 23 byte record:
//!
//! ```text
//! 0xA5 | kind | axis count | 8 × u16 LE axes | u32 LE buttons
//! ```

use crate::controller::{ControllerFrame, AXIS_COUNT};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, Write};
use std::time::Duration;
use tracing::{debug, trace};

pub mod serial;
pub mod tcp;

pub use serial::SerialTransport;
pub use tcp::TcpTransport;

pub const FRAME_MAGIC: u8 = 0xA5;
pub const FRAME_LEN: usize = 3 + 2 * AXIS_COUNT + 4;

/// Upper bound for a single blocking write, so a stalled adapter surfaces as
/// a send error instead of freezing the loop.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(50);

/// Write timeout for a loop running every `period`.
pub fn write_timeout_for(period: Duration) -> Duration {
    period.clamp(Duration::from_millis(1), DEFAULT_WRITE_TIMEOUT)
}

// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {target}: {reason}")]
    ConnectError { target: String, reason: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Failed to send frame: {0}")]
    SendError(#[from] std::io::Error),
}

/// What the loop does when a per-iteration send fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SendFailurePolicy {
    /// Log (throttled) and keep running.
    #[default]
    Continue,
    /// Stop the loop with the error.
    Abort,
}

/// Transport collaborator.
pub trait Transport {
    /// Opens the link. Called once before the loop starts.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Sends `frame`. Without `force` an unchanged frame is skipped.
    /// Returns whether anything was written.
    fn send(&mut self, frame: &ControllerFrame, force: bool) -> Result<bool, TransportError>;

    fn describe(&self) -> String;
}

/// Encodes `frame` into its wire record.
pub fn encode(frame: &ControllerFrame) -> [u8; FRAME_LEN] {
    let mut out = [0u8; FRAME_LEN];
    out[0] = FRAME_MAGIC;
    out[1] = frame.kind.wire_id();
    out[2] = AXIS_COUNT as u8;

    for (index, value) in frame.axes.iter().enumerate() {
        let value = u16::try_from(*value).unwrap_or(u16::MAX);
        let offset = 3 + 2 * index;
        out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    let offset = 3 + 2 * AXIS_COUNT;
    out[offset..].copy_from_slice(&frame.buttons.to_le_bytes());
    out
}

/// Change tracking shared by the stream transports.
///
/// Records are never interleaved: when a write fails partway through, the
/// unsent bytes are kept and go out before anything else.
#[derive(Debug, Default)]
pub struct FrameWriter {
    last_sent: Option<ControllerFrame>,
    partial: Option<Partial>,
}

#[derive(Debug)]
struct Partial {
    frame: ControllerFrame,
    bytes: [u8; FRAME_LEN],
    written: usize,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_to<W: Write + ?Sized>(
        &mut self,
        writer: &mut W,
        frame: &ControllerFrame,
        force: bool,
    ) -> Result<bool, TransportError> {
        let mut wrote = false;
        if let Some(mut partial) = self.partial.take() {
            debug!(
                "Finishing record cut after {} of {} bytes",
                partial.written, FRAME_LEN
            );
            let result = write_record(writer, &partial.bytes, &mut partial.written);
            if let Err(e) = result {
                self.partial = Some(partial);
                return Err(e.into());
            }
            self.last_sent = Some(partial.frame);
            wrote = true;
        }

        if !force && self.last_sent.as_ref() == Some(frame) {
            trace!("Frame unchanged, skipping send");
            if wrote {
                writer.flush()?;
            }
            return Ok(wrote);
        }

        let bytes = encode(frame);
        let mut written = 0;
        if let Err(e) = write_record(writer, &bytes, &mut written) {
            if written > 0 {
                self.partial = Some(Partial {
                    frame: *frame,
                    bytes,
                    written,
                });
            }
            return Err(e.into());
        }
        writer.flush()?;
        self.last_sent = Some(*frame);
        Ok(true)
    }

    /// Whether a record was cut short and still has bytes to go.
    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Forgets the link state so the next send starts a fresh record.
    pub fn reset(&mut self) {
        self.last_sent = None;
        self.partial = None;
    }
}

// Like `write_all`, but reports how far it got
fn write_record<W: Write + ?Sized>(writer: &mut W, bytes: &[u8], written: &mut usize) -> io::Result<()> {
    while *written < bytes.len() {
        match writer.write(&bytes[*written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => *written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
