//! Physical links to the Sense board.
//!
//! The session treats the link as an opaque duplex byte pipe; this module
//! produces the concrete pipes. [`open_rfcomm`] opens a raw RFCOMM socket to
//! an already-paired board (pair and trust it ahead of time, e.g. via
//! `bluetoothctl`), and [`open_serial`] opens a pre-bound `/dev/rfcomm*`
//! node instead. With the `bluez` feature, [`find`] enumerates bonded Sense
//! boards through BlueZ.

use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use log::{debug, info};

use crate::errors::{Result, SenseError};

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_RFCOMM: libc::c_int = 3;

/// RFCOMM channel the Sense listens on.
const RFCOMM_CHANNEL: u8 = 1;

/// Serial baud rate of the board's RFCOMM bridge.
const BAUD_RATE: u32 = 115200;

/// Socket-level read/write timeout. Bounds every blocking link operation
/// and therefore how quickly the receive pump notices a local close.
const LINK_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Substring (lowercased) identifying Sense boards among bonded devices.
#[cfg(feature = "bluez")]
const DEVICE_NAME_HINT: &str = "scientisst";

/// `sockaddr_rc` from `<bluetooth/rfcomm.h>`. The kernel wants the device
/// address bytes reversed relative to the printed MAC form.
#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

/// Open an RFCOMM link to the already-paired board at `mac` and split it
/// into the reader and writer halves the transport pump wants.
pub fn open_rfcomm(mac: &str) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
    let addr = sockaddr_of(mac)?;
    debug!("opening RFCOMM socket: mac={mac}, channel={RFCOMM_CHANNEL}");

    let fd = rfcomm_socket()?;
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<SockAddrRc>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SenseError::DeviceNotFound(format!(
            "rfcomm connect to {mac}: {}",
            io::Error::last_os_error()
        )));
    }
    for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
        set_socket_timeout(&fd, opt, LINK_IO_TIMEOUT)?;
    }

    let writer = File::from(fd);
    let reader = writer.try_clone().map_err(SenseError::Io)?;
    info!("RFCOMM connection established: mac={mac}");
    Ok((Box::new(reader), Box::new(writer)))
}

/// Open a pre-bound RFCOMM device node (e.g. `/dev/rfcomm0`, bound with
/// `rfcomm bind`) as link halves for [`crate::Transport`].
pub fn open_serial(path: &str) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
    let port = serialport::new(path, BAUD_RATE)
        .timeout(LINK_IO_TIMEOUT)
        .open()
        .map_err(|e| SenseError::DeviceNotFound(format!("failed to open {path}: {e}")))?;
    let reader = port
        .try_clone()
        .map_err(|e| SenseError::DeviceNotFound(format!("failed to clone {path}: {e}")))?;
    Ok((Box::new(reader), Box::new(port)))
}

/// Enumerate bonded devices whose name marks them as Sense boards.
///
/// Returns the MAC addresses of every paired device whose advertised name
/// contains `scientisst` (case-insensitive).
#[cfg(feature = "bluez")]
pub fn find() -> Result<Vec<String>> {
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| SenseError::DeviceNotFound(format!("tokio runtime init failed: {e}")))?;
    rt.block_on(async {
        let session = bluer::Session::new().await.map_err(bt_err)?;
        let adapter = session.default_adapter().await.map_err(bt_err)?;
        let mut found = Vec::new();
        for addr in adapter.device_addresses().await.map_err(bt_err)? {
            let device = adapter.device(addr).map_err(bt_err)?;
            if !device.is_paired().await.unwrap_or(false) {
                continue;
            }
            if let Ok(Some(name)) = device.name().await {
                if name.to_lowercase().contains(DEVICE_NAME_HINT) {
                    debug!("bonded sense board: mac={}, name={}", addr, name);
                    found.push(addr.to_string());
                }
            }
        }
        Ok(found)
    })
}

#[cfg(feature = "bluez")]
fn bt_err(e: bluer::Error) -> SenseError {
    SenseError::DeviceNotFound(e.to_string())
}

/// Create a blocking, cloexec RFCOMM socket. The returned fd closes itself
/// on every early-return path.
fn rfcomm_socket() -> Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            BTPROTO_RFCOMM,
        )
    };
    if fd < 0 {
        return Err(SenseError::DeviceNotFound(format!(
            "rfcomm socket: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_socket_timeout(fd: &OwnedFd, opt: libc::c_int, timeout: Duration) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &tv as *const _ as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SenseError::DeviceNotFound(format!(
            "setsockopt: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Build the connect address from any of the three accepted MAC literal
/// forms, reading byte pairs back-to-front to produce `bdaddr_t` order.
fn sockaddr_of(mac: &str) -> Result<SockAddrRc> {
    let hex: String = mac.chars().filter(|c| !matches!(c, ':' | '-')).collect();
    if hex.len() != 12 || !hex.is_ascii() {
        return Err(SenseError::InvalidAddress(mac.to_string()));
    }

    let mut bdaddr = [0u8; 6];
    for (i, slot) in bdaddr.iter_mut().enumerate() {
        let pair = &hex[10 - 2 * i..12 - 2 * i];
        *slot = u8::from_str_radix(pair, 16)
            .map_err(|_| SenseError::InvalidAddress(mac.to_string()))?;
    }

    Ok(SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: bdaddr,
        rc_channel: RFCOMM_CHANNEL,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_reverses_all_three_mac_forms() {
        for mac in ["AA:BB:CC:DD:EE:FF", "AA-BB-CC-DD-EE-FF", "AABBCCDDEEFF"] {
            let addr = sockaddr_of(mac).unwrap();
            assert_eq!(addr.rc_bdaddr, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA], "{mac}");
            assert_eq!(addr.rc_channel, RFCOMM_CHANNEL, "{mac}");
        }
    }

    #[test]
    fn sockaddr_rejects_garbage() {
        // The last entry is 12 bytes but not 12 ASCII hex digits.
        for mac in ["", "not a mac", "AA:BB:CC:DD:EE", "AABBCCDDEEFF00", "GG:BB:CC:DD:EE:FF", "€123456789"] {
            assert!(
                matches!(sockaddr_of(mac), Err(SenseError::InvalidAddress(_))),
                "{mac}"
            );
        }
    }
}
