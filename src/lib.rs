//! Host-side driver for the ScientISST Sense biosignal acquisition board.
//!
//! The board is driven over a serial-style byte pipe (in practice a
//! Bluetooth RFCOMM link) through a small command protocol, and streams
//! bit-packed sample frames back: 12-bit internal channels, 24-bit external
//! channels, four digital lines and a 4-bit sequence counter, guarded by a
//! CRC-4 with byte-level resynchronisation after corruption.
//!
//! # Example
//! ```no_run
//! use scientisst_sense::{ApiMode, Sense};
//!
//! # fn main() -> scientisst_sense::Result<()> {
//! let mut sense = Sense::new("AA:BB:CC:DD:EE:FF")?;
//! sense.connect(None)?;
//! println!("Firmware: {}", sense.version()?);
//!
//! sense.start(1000, &[1, 2], false, ApiMode::Scientisst)?;
//! let frames = sense.read(100)?;
//! println!("AI1 of first frame: {:?}", frames[0].analog[0]);
//! sense.stop()?;
//! sense.disconnect()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Timing
//!
//! The board does not timestamp samples; reconstruct timing on the host from
//! the acquisition start instant and the sample rate, and watch the sequence
//! counter (and [`FrameBatch::sequence_gaps`]) for dropped frames.

mod bluetooth;
mod errors;
mod frame;
pub mod logging;
mod sense;
mod transport;

pub use bluetooth::{open_rfcomm, open_serial};
pub use errors::{Result, SenseError};
pub use frame::{check_crc4, decode_frame, packet_size, ApiMode, Channel, Frame};
pub use sense::{FrameBatch, Sense};
pub use transport::{DisconnectHandler, Transport};
