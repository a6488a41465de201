//! The seam between the attack engine and the radio.
//!
//! Everything below this trait (modulation, bit timing, field control) lives
//! in the host device. The engine only ever needs "send these bits, give me
//! whatever comes back within the frame-wait window".

use crate::errors::Result;
use crate::iso14443a::Frame;

/// Frame-wait time for regular Mifare Classic exchanges, in 13.56 MHz
/// carrier cycles.
pub const FWT_DEFAULT_FC: u32 = 60_000;
/// Frame-wait time for the activation sequence (REQA/WUPA, anticollision),
/// which answers almost immediately or not at all.
pub const FWT_ACTIVATION_FC: u32 = 1_620;

/// Half-duplex frame exchange with a bounded wait.
///
/// Implementations transmit the frame exactly as given, parity bits
/// included, and must return [`crate::Error::Timeout`] once `fwt_fc` carrier
/// cycles elapse without a tag response. No retries: retry policy belongs to
/// the protocol layer.
///
/// The three frame flavors share this one entry point. A standard frame is
/// built with [`Frame::standard`]/[`Frame::with_crc`] (conventional parity),
/// an attack frame with [`Frame::with_parity`] (caller-controlled parity),
/// and encrypted traffic is produced by the poller, which owns the cipher
/// state and hands the transport ready-made ciphertext frames.
pub trait FrameTransport {
    fn exchange(&mut self, tx: &Frame, fwt_fc: u32) -> Result<Frame>;
}
