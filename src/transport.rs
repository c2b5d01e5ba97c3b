//! Byte-pipe adapter between the session and the physical link.
//!
//! The Sense streams continuously during an acquisition, so the receive side
//! cannot be a simple blocking read: an ingest thread pumps every incoming
//! byte into an unbounded queue, and the session side awaits byte counts
//! against a deadline. The link itself is opaque here; anything that splits
//! into a `Read` half and a `Write` half (RFCOMM socket, serial port,
//! scripted test pipe) plugs in.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::errors::{Result, SenseError};

/// Width of one cooperative polling slice of the receive queue.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Deadline for a write to drain or for awaited bytes to arrive.
pub(crate) const IO_DEADLINE: Duration = Duration::from_secs(3);

/// Invoked once, from the ingest thread, when the remote end closes the pipe.
pub type DisconnectHandler = Box<dyn FnMut() + Send + 'static>;

struct RxShared {
    queue: Mutex<VecDeque<u8>>,
    open: AtomicBool,
}

/// Duplex byte channel with an internal receive pump.
///
/// Writes block until flushed; reads are served from the pump's queue via
/// [`await_bytes`](Transport::await_bytes)/[`consume`](Transport::consume).
/// Once the pump observes EOF or a fatal read error the transport is marked
/// closed and waiting calls fail fast instead of hanging out the deadline.
pub struct Transport {
    writer: Box<dyn Write + Send>,
    shared: Arc<RxShared>,
    deadline: Duration,
}

impl Transport {
    /// Wrap the two halves of a link and start the receive pump.
    ///
    /// The reader half must wake from blocking reads periodically (a socket
    /// or serial receive timeout is enough), otherwise the pump cannot
    /// notice a local [`close`](Transport::close).
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        on_disconnect: Option<DisconnectHandler>,
    ) -> Self {
        let shared = Arc::new(RxShared {
            queue: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
        });
        let pump_shared = Arc::clone(&shared);
        thread::spawn(move || pump(reader, pump_shared, on_disconnect));
        Transport {
            writer,
            shared,
            deadline: IO_DEADLINE,
        }
    }

    /// Send `bytes` and block until the link reports them flushed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(SenseError::ContactingDevice("transport closed".into()));
        }
        self.writer
            .write_all(bytes)
            .and_then(|_| self.writer.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                    SenseError::ContactingDevice(format!("write queue not drained: {e}"))
                }
                _ => SenseError::ContactingDevice(format!("write failed: {e}")),
            })
    }

    /// Number of bytes currently buffered by the pump.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Block in polling slices until at least `n` bytes are buffered.
    ///
    /// Fails with `ContactingDevice` when the deadline expires, or
    /// immediately once the pump is dead and the queue cannot grow anymore.
    pub fn await_bytes(&self, n: usize) -> Result<()> {
        let mut polls_left = (self.deadline.as_millis() / POLL_INTERVAL.as_millis()).max(1);
        loop {
            if self.pending() >= n {
                return Ok(());
            }
            if !self.is_open() {
                // The pump may have queued its final bytes right before dying.
                if self.pending() >= n {
                    return Ok(());
                }
                return Err(SenseError::ContactingDevice(format!(
                    "link closed while waiting for {n} byte(s)"
                )));
            }
            if polls_left == 0 {
                return Err(SenseError::ContactingDevice(format!(
                    "{n} byte(s) not received within {:?}",
                    self.deadline
                )));
            }
            polls_left -= 1;
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Remove and return up to `n` bytes from the front of the queue.
    pub fn consume(&self, n: usize) -> Vec<u8> {
        let mut queue = self.shared.queue.lock().unwrap();
        let n = n.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Drop everything currently buffered.
    pub fn clear(&self) {
        self.shared.queue.lock().unwrap().clear();
    }

    /// Whether the receive pump is still running.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Shut the transport down. Idempotent; the pump exits on its next wake
    /// and the disconnect handler does not fire for a local close.
    pub fn close(&mut self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            debug!("transport closed");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = deadline;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn pump(
    mut reader: Box<dyn Read + Send>,
    shared: Arc<RxShared>,
    mut on_disconnect: Option<DisconnectHandler>,
) {
    let mut buf = [0u8; 1024];
    loop {
        if !shared.open.load(Ordering::Acquire) {
            // Local close: exit quietly, no disconnect callback.
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!("rx pump: remote end closed the pipe");
                break;
            }
            Ok(n) => {
                shared.queue.lock().unwrap().extend(&buf[..n]);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!("rx pump terminated: {e}");
                break;
            }
        }
    }
    if shared.open.swap(false, Ordering::AcqRel) {
        if let Some(handler) = on_disconnect.as_mut() {
            handler();
        }
    }
}
