//! Session driver for ScientISST Sense data acquisition.
//!
//! [`Sense`] owns the transport and the live acquisition configuration,
//! encodes every command as a minimal little-endian byte string, and drives
//! the acquisition read loop, including byte-level resynchronisation after a
//! CRC failure.
//!
//! # Timing and synchronization
//!
//! The board samples on its own crystal; no timestamps are sent. Bluetooth
//! adds variable latency and delivers data in bursts, so reconstruct sample
//! times on the host as `start_time + index / sample_rate` and use the 4-bit
//! sequence counter to detect dropped frames.

use std::io::{Read, Write};
use std::time::Instant;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::bluetooth;
use crate::errors::{Result, SenseError};
use crate::frame::{self, ApiMode, Channel, Frame};
use crate::transport::{DisconnectHandler, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of every firmware version banner.
const VERSION_HEADER: &[u8] = b"ScientISST";

// Command words. Multi-byte commands carry their argument in the upper
// bytes and go on the wire little-endian, low byte first.
const CMD_STOP: u64 = 0x00;
const CMD_START_LIVE: u64 = 0x01;
const CMD_START_SIM: u64 = 0x02;
const CMD_SET_API: u64 = 0x03; // high nibble of the low byte = API code
const CMD_VERSION: u64 = 0x07;
const CMD_SET_RATE: u64 = 0x43;
const CMD_DAC: u64 = 0xA3;
const CMD_TRIGGER: u64 = 0xB3;

/// Accepted MAC literal forms: colon-separated, dash-separated, bare hex.
/// The one constant shared across sessions.
static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$|^(?:[0-9A-Fa-f]{2}-){5}[0-9A-Fa-f]{2}$|^[0-9A-Fa-f]{12}$",
    )
    .unwrap()
});

// ============================================================================
// Batch metadata
// ============================================================================

/// Result of reading a batch of frames, with stream-quality statistics.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    /// The frames that were decoded, in strict device order.
    pub frames: Vec<Frame>,
    /// Microseconds since acquisition start when the batch read began.
    pub timestamp_us: u64,
    /// Bytes discarded by CRC resynchronisation during this batch.
    pub resync_shifts: usize,
    /// Frames the sequence counter says were dropped before arrival.
    pub sequence_gaps: usize,
}

// ============================================================================
// Session
// ============================================================================

/// A session with one ScientISST Sense board.
///
/// Constructed around a device address, connected over RFCOMM (or any duplex
/// byte pipe via [`connect_with`](Sense::connect_with)), then driven through
/// `version`/`start`/`read`/`stop`. Reconnecting after
/// [`disconnect`](Sense::disconnect) is supported; a running acquisition
/// must be stopped before it can be reconfigured.
pub struct Sense {
    address: String,
    transport: Option<Transport>,
    api_mode: ApiMode,
    active_channels: Vec<Channel>,
    sample_rate: u32,
    packet_size: usize,
    start_time: Option<Instant>,
    last_seq: Option<u8>,
}

impl Sense {
    /// Create a session for the board at `address`.
    ///
    /// The address must be a MAC literal in colon, dash, or bare-hex form;
    /// nothing is opened yet.
    pub fn new(address: &str) -> Result<Self> {
        if !MAC_RE.is_match(address) {
            return Err(SenseError::InvalidAddress(address.to_string()));
        }
        Ok(Sense {
            address: address.to_string(),
            transport: None,
            api_mode: ApiMode::default(),
            active_channels: Vec::new(),
            sample_rate: 0,
            packet_size: 0,
            start_time: None,
            last_seq: None,
        })
    }

    /// Addresses of bonded devices advertising themselves as Sense boards.
    #[cfg(feature = "bluez")]
    pub fn find() -> Result<Vec<String>> {
        bluetooth::find()
    }

    /// Open the RFCOMM transport to the board and start the receive pump.
    ///
    /// The board must already be paired and trusted (e.g. via
    /// `bluetoothctl`). `on_disconnect` fires once if the remote end closes
    /// the pipe. A no-op when already connected.
    pub fn connect(&mut self, on_disconnect: Option<DisconnectHandler>) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let (reader, writer) = bluetooth::open_rfcomm(&self.address)?;
        self.connect_with(reader, writer, on_disconnect)
    }

    /// Drive the session over a pre-bound serial device node instead of a
    /// fresh RFCOMM socket (e.g. `/dev/rfcomm0` after `rfcomm bind`).
    pub fn connect_serial(
        &mut self,
        path: &str,
        on_disconnect: Option<DisconnectHandler>,
    ) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let (reader, writer) = bluetooth::open_serial(path)?;
        self.connect_with(reader, writer, on_disconnect)
    }

    /// Attach an arbitrary duplex byte pipe as the transport.
    ///
    /// This is the seam the RFCOMM and serial paths go through, and what a
    /// test harness plugs a scripted pipe into.
    pub fn connect_with(
        &mut self,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        on_disconnect: Option<DisconnectHandler>,
    ) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        self.transport = Some(Transport::new(reader, writer, on_disconnect));
        debug!("connected: address={}", self.address);
        Ok(())
    }

    /// Tear the session down, stopping a running acquisition first.
    /// Idempotent.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.is_acquiring() {
            if let Err(e) = self.stop() {
                warn!("stop before disconnect failed: {e}");
            }
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            debug!("disconnected: address={}", self.address);
        }
        self.active_channels.clear();
        self.sample_rate = 0;
        self.packet_size = 0;
        self.start_time = None;
        self.last_seq = None;
        Ok(())
    }

    /// Query the firmware version banner.
    ///
    /// The reply is parsed as a stream: leading junk is skipped until the
    /// fixed `ScientISST` prefix matches, then everything but newlines is
    /// collected until the NUL terminator.
    pub fn version(&mut self) -> Result<String> {
        self.send(CMD_VERSION)?;

        let mut banner: Vec<u8> = Vec::with_capacity(32);
        loop {
            let byte = self.recv_byte()?;
            if banner.len() >= VERSION_HEADER.len() {
                if byte == 0x00 {
                    break;
                }
                if byte != b'\n' {
                    banner.push(byte);
                }
            } else if byte == VERSION_HEADER[banner.len()] {
                banner.push(byte);
            } else {
                // Mid-prefix mismatch: restart the match, counting the
                // current byte if it opens a new prefix.
                banner.clear();
                if byte == VERSION_HEADER[0] {
                    banner.push(byte);
                }
            }
        }

        let version = String::from_utf8_lossy(&banner).into_owned();
        debug!("device version: {version}");
        Ok(version)
    }

    /// Start an acquisition.
    ///
    /// `channels` are 1-based IDs in the order they should be recorded; an
    /// empty list enables all eight. `api` must be [`ApiMode::Scientisst`]
    /// (or [`ApiMode::Json`], which the device accepts but this driver
    /// cannot decode). The device must be idle.
    pub fn start(
        &mut self,
        sample_rate: u32,
        channels: &[u8],
        simulated: bool,
        api: ApiMode,
    ) -> Result<()> {
        if self.is_acquiring() {
            return Err(SenseError::NotIdle);
        }
        if api == ApiMode::Bitalino {
            return Err(SenseError::InvalidParameter(
                "acquisition requires the SCIENTISST or JSON API".into(),
            ));
        }

        let active: Vec<Channel> = if channels.is_empty() {
            Channel::ALL.to_vec()
        } else {
            channels
                .iter()
                .map(|&id| Channel::from_id(id))
                .collect::<Result<_>>()?
        };
        let mut mask = 0u8;
        for ch in &active {
            let bit = 1u8 << (ch.id() - 1);
            if mask & bit != 0 {
                return Err(SenseError::InvalidParameter(format!(
                    "duplicate channel {}",
                    ch.id()
                )));
            }
            mask |= bit;
        }

        self.set_api_mode(api)?;
        self.send(CMD_SET_RATE | (sample_rate as u64) << 8)?;
        self.transport_ref()?.clear();

        let start_cmd = if simulated { CMD_START_SIM } else { CMD_START_LIVE };
        self.send(start_cmd | (mask as u64) << 8)?;

        self.packet_size = frame::packet_size(self.api_mode, &active)?;
        self.sample_rate = sample_rate;
        self.active_channels = active;
        self.start_time = Some(Instant::now());
        self.last_seq = None;

        debug!(
            "started acquisition: rate={}Hz, channels={:?}, packet_size={}",
            sample_rate, self.active_channels, self.packet_size
        );
        Ok(())
    }

    /// Stop the running acquisition and return to idle.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_acquiring() {
            return Err(SenseError::NotInAcquisition);
        }
        self.send(CMD_STOP)?;
        self.transport_ref()?.clear();
        self.active_channels.clear();
        self.sample_rate = 0;
        self.packet_size = 0;
        self.start_time = None;
        self.last_seq = None;
        debug!("acquisition stopped");
        Ok(())
    }

    /// Read up to `n` frames from the acquisition stream.
    ///
    /// A late-stream timeout yields a short list, never a partial frame.
    pub fn read(&mut self, n: usize) -> Result<Vec<Frame>> {
        self.read_batch(n).map(|batch| batch.frames)
    }

    /// Read up to `n` frames along with timing and stream-quality metadata.
    ///
    /// A CRC mismatch is not an error: the window is shifted one byte at a
    /// time over the incoming stream until a packet verifies again, and the
    /// discarded bytes are counted in
    /// [`resync_shifts`](FrameBatch::resync_shifts). The only error out of
    /// an established acquisition is [`SenseError::Unknown`], raised when
    /// the stream died before a single frame of this batch was decodable.
    pub fn read_batch(&mut self, n: usize) -> Result<FrameBatch> {
        if !self.is_acquiring() {
            return Err(SenseError::NotInAcquisition);
        }
        let timestamp_us = self.elapsed_us().unwrap_or(0);
        let mut frames = Vec::with_capacity(n);
        let mut resync_shifts = 0usize;
        let mut sequence_gaps = 0usize;
        let mut last_seq = self.last_seq;

        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| SenseError::ContactingDevice("not connected".into()))?;

        'frames: for _ in 0..n {
            if transport.await_bytes(self.packet_size).is_err() {
                break;
            }
            let mut window = transport.consume(self.packet_size);
            while !frame::check_crc4(&window) {
                resync_shifts += 1;
                window.remove(0);
                if transport.await_bytes(1).is_err() {
                    break 'frames;
                }
                window.push(transport.consume(1)[0]);
            }

            let decoded = frame::decode_frame(self.api_mode, &window, &self.active_channels)?;
            if let Some(prev) = last_seq {
                let expected = (prev + 1) & 0x0F;
                if decoded.seq != expected {
                    let gap = (decoded.seq as i16 - expected as i16).rem_euclid(16) as usize;
                    // Large jumps are more likely resync artifacts than
                    // real drops.
                    if gap < 8 {
                        sequence_gaps += gap;
                    }
                }
            }
            last_seq = Some(decoded.seq);
            frames.push(decoded);
        }

        if n > 0 && frames.is_empty() && !transport.is_open() && transport.pending() == 0 {
            return Err(SenseError::Unknown);
        }

        if resync_shifts > 0 {
            warn!("resynchronised past {resync_shifts} byte(s) of corrupt stream");
        }
        if sequence_gaps > 0 {
            warn!("sequence gaps in batch: ~{sequence_gaps} dropped frame(s)");
        }

        self.last_seq = last_seq;
        Ok(FrameBatch {
            frames,
            timestamp_us,
            resync_shifts,
            sequence_gaps,
        })
    }

    /// Set the two digital outputs. `outputs` must hold exactly two values,
    /// each interpreted as a truthy/falsy level for O1 and O2.
    pub fn trigger(&mut self, outputs: &[u8]) -> Result<()> {
        if outputs.len() != 2 {
            return Err(SenseError::InvalidParameter(format!(
                "expected 2 digital outputs, got {}",
                outputs.len()
            )));
        }
        let mut cmd = CMD_TRIGGER;
        if outputs[0] != 0 {
            cmd |= 0x04;
        }
        if outputs[1] != 0 {
            cmd |= 0x08;
        }
        self.send(cmd)
    }

    /// Set the DAC output level (0..=255 PWM).
    pub fn dac(&mut self, level: u32) -> Result<()> {
        if level > 255 {
            return Err(SenseError::InvalidParameter(format!(
                "DAC level {level} outside 0..=255"
            )));
        }
        self.send(CMD_DAC | (level as u64) << 8)
    }

    /// Set the low-battery LED threshold (0..=63). Idle only.
    pub fn battery(&mut self, value: u32) -> Result<()> {
        if self.is_acquiring() {
            return Err(SenseError::NotIdle);
        }
        if value > 63 {
            return Err(SenseError::InvalidParameter(format!(
                "battery threshold {value} outside 0..=63"
            )));
        }
        self.send((value as u64) << 2)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// The validated device address this session was built for.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a transport is attached and its receive pump alive.
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().map_or(false, Transport::is_open)
    }

    /// Whether an acquisition is running (a non-empty active channel set).
    pub fn is_acquiring(&self) -> bool {
        !self.active_channels.is_empty()
    }

    /// Channels of the running acquisition, in caller order.
    pub fn active_channels(&self) -> &[Channel] {
        &self.active_channels
    }

    /// Sample rate of the running acquisition, in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// On-wire packet size of the running acquisition, in bytes.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Microseconds since the acquisition started.
    pub fn elapsed_us(&self) -> Option<u64> {
        self.start_time.map(|t| t.elapsed().as_micros() as u64)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Switch the device's command dialect and remember it for decoding.
    fn set_api_mode(&mut self, api: ApiMode) -> Result<()> {
        self.send((api.code() as u64) << 4 | CMD_SET_API)?;
        self.api_mode = api;
        Ok(())
    }

    /// Encode `command` as the minimal little-endian byte string and flush
    /// it to the device.
    fn send(&mut self, command: u64) -> Result<()> {
        let bytes = uint_to_le_bytes(command);
        debug!("send command: {bytes:02X?}");
        self.transport_mut()?.write(&bytes)
    }

    /// Pull one reply byte out of the receive queue.
    fn recv_byte(&mut self) -> Result<u8> {
        let transport = self.transport_ref()?;
        transport.await_bytes(1)?;
        Ok(transport.consume(1)[0])
    }

    fn transport_ref(&self) -> Result<&Transport> {
        self.transport
            .as_ref()
            .ok_or_else(|| SenseError::ContactingDevice("not connected".into()))
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| SenseError::ContactingDevice("not connected".into()))
    }
}

impl Drop for Sense {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Minimal little-endian encoding of an unsigned integer; zero is a single
/// `0x00` byte.
fn uint_to_le_bytes(mut value: u64) -> Vec<u8> {
    let mut bytes = vec![(value & 0xFF) as u8];
    value >>= 8;
    while value != 0 {
        bytes.push((value & 0xFF) as u8);
        value >>= 8;
    }
    bytes
}
