// The fabric exposes a page-aligned register window through a UIO device:
// word 0 is the interrupt status word, words 8..12 the floppy track window,
// word 12 the serial data/status register, +0x4000 the ACSI command/status
// register and +0x4800 the two 512-byte DMA ping-pong buffers.
// The same layout over an anonymous allocation backs the tests.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

use tracing::error;

use crate::error::HostError;

/// Bytes mapped from the fabric. Covers everything up to the end of the
/// DMA buffers, rounded to a page multiple.
const MAP_SIZE: usize = 0x5000;

const REG_STATUS: usize = 0;
const REG_CONTROL: usize = 1;
const REG_TRACK_WINDOW: usize = 8;
const REG_SERIAL: usize = 12;
const REG_ACSI: usize = 0x4000 / 4;
const IOBUF_BYTES: usize = 0x4800;

/// Size of the floppy track window in bytes.
pub const TRACK_WINDOW_BYTES: usize = 16;
/// Size of one DMA ping-pong buffer in bytes.
pub const DMA_BUF_BYTES: usize = 512;

/* control word bits */
const CTRL_RESET: u32 = 1;

/* serial status bits */
const SERIAL_TXD_FULL: u32 = 0x200;

enum Backing {
    Mapped,
    Owned(Box<[u32]>),
}

/// The mapped register window. All accesses are volatile: the other side of
/// the window is hardware, not memory.
///
/// Shared between the pump thread and the GEMDOS worker; the tunnel protocol
/// guarantees only one of them is the active actor at any time.
pub struct Fabric {
    base: *mut u32,
    backing: Backing,
}

unsafe impl Send for Fabric {}
unsafe impl Sync for Fabric {}

/// The interrupt side of the UIO device. Owned by the pump thread alone.
pub struct IrqLine {
    file: File,
}

impl Fabric {
    /// Map the register window of a UIO device, returning the window and
    /// its interrupt line.
    pub fn open<P: AsRef<Path>>(dev: P) -> Result<(Fabric, IrqLine), HostError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev.as_ref())
            .map_err(HostError::FabricMap)?;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                MAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(HostError::FabricMap(std::io::Error::last_os_error()));
        }
        let fabric = Fabric { base: base as *mut u32, backing: Backing::Mapped };
        Ok((fabric, IrqLine { file }))
    }

    /// Build the same window over an anonymous allocation, for tests and
    /// for running without hardware.
    pub fn in_memory() -> Fabric {
        let mut storage = vec![0u32; MAP_SIZE / 4].into_boxed_slice();
        let base = storage.as_mut_ptr();
        Fabric { base, backing: Backing::Owned(storage) }
    }

    fn read_reg(&self, word: usize) -> u32 {
        debug_assert!(word < MAP_SIZE / 4);
        unsafe { ptr::read_volatile(self.base.add(word)) }
    }

    fn write_reg(&self, word: usize, value: u32) {
        debug_assert!(word < MAP_SIZE / 4);
        unsafe { ptr::write_volatile(self.base.add(word), value) }
    }

    /// The interrupt status word, read once per wake.
    pub fn status(&self) -> u32 {
        self.read_reg(REG_STATUS)
    }

    pub fn set_reset(&self, asserted: bool) {
        let ctrl = self.read_reg(REG_CONTROL);
        let ctrl = if asserted { ctrl | CTRL_RESET } else { ctrl & !CTRL_RESET };
        self.write_reg(REG_CONTROL, ctrl);
    }

    pub fn acsi_read(&self) -> u32 {
        self.read_reg(REG_ACSI)
    }

    pub fn acsi_write(&self, value: u32) {
        self.write_reg(REG_ACSI, value)
    }

    /// Read the serial data/status register; `Some(byte)` when the guest has
    /// a byte pending for the host.
    pub fn serial_take(&self) -> Option<u8> {
        let st = self.read_reg(REG_SERIAL);
        if st & SERIAL_TXD_FULL != 0 {
            Some(st as u8)
        } else {
            None
        }
    }

    pub fn serial_send(&self, byte: u8) {
        self.write_reg(REG_SERIAL, byte as u32)
    }

    fn byte_ptr(&self, offset: usize) -> *mut u8 {
        unsafe { (self.base as *mut u8).add(offset) }
    }

    /// Copy into one of the DMA ping-pong buffers. `offset` is a byte offset
    /// from the start of the buffer area.
    pub fn iobuf_write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= 2 * DMA_BUF_BYTES);
        let p = self.byte_ptr(IOBUF_BYTES + offset);
        for (i, &b) in data.iter().enumerate() {
            unsafe { ptr::write_volatile(p.add(i), b) }
        }
    }

    /// Copy out of the DMA ping-pong buffers.
    pub fn iobuf_read(&self, offset: usize, data: &mut [u8]) {
        debug_assert!(offset + data.len() <= 2 * DMA_BUF_BYTES);
        let p = self.byte_ptr(IOBUF_BYTES + offset);
        for (i, b) in data.iter_mut().enumerate() {
            *b = unsafe { ptr::read_volatile(p.add(i)) }
        }
    }

    /// Stage bytes into the floppy track window.
    pub fn track_window_write(&self, data: &[u8]) {
        debug_assert!(data.len() <= TRACK_WINDOW_BYTES);
        let p = self.byte_ptr(REG_TRACK_WINDOW * 4);
        for (i, &b) in data.iter().enumerate() {
            unsafe { ptr::write_volatile(p.add(i), b) }
        }
    }

    /// Harvest bytes the guest wrote through the floppy track window.
    pub fn track_window_read(&self, data: &mut [u8]) {
        debug_assert!(data.len() <= TRACK_WINDOW_BYTES);
        let p = self.byte_ptr(REG_TRACK_WINDOW * 4);
        for (i, b) in data.iter_mut().enumerate() {
            *b = unsafe { ptr::read_volatile(p.add(i)) }
        }
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        if let Backing::Mapped = self.backing {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, MAP_SIZE);
            }
        }
    }
}

impl IrqLine {
    /// Block until the fabric raises an interrupt, for at most `timeout_ms`.
    /// Returns whether an interrupt was harvested.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<bool, HostError> {
        let mut pfd = libc::pollfd { fd: self.file.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let status = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if status == -1 {
            return Err(HostError::Interrupt(std::io::Error::last_os_error()));
        }
        if status == 0 {
            return Ok(false);
        }
        let mut count = [0u8; 4];
        if self.file.read(&mut count).map_err(HostError::Interrupt)? == 0 {
            error!("unexpected end of file on the interrupt line");
            return Err(HostError::Interrupt(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        Ok(true)
    }

    /// Unmask the interrupt so the next fabric event wakes us again.
    pub fn rearm(&mut self) -> Result<(), HostError> {
        let unmask = 1u32.to_ne_bytes();
        self.file.write_all(&unmask).map_err(HostError::Interrupt)
    }
}
