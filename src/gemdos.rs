// GEMDOS drive implementation.
//
// General protocol: on any GEMDOS call, the guest-resident stub sends a
// tunnel command (opcode 0x11) with OP_GEMDOS and the GEMDOS opcode, and
// DMA-writes a 16-byte snapshot of the call stack.
// - if the host decides to fall back to the original ROM code, it ends the
//   command with STATUS_OK.
// - if the host handles the call, it ends with STATUS_ERROR and the stub
//   switches to action mode: it issues OP_ACTION commands in DMA read mode,
//   the host answers each with an action block, and data an action produced
//   comes back through an OP_RESULT command with a DMA write. This repeats
//   until the host sends ACTION_FALLBACK or ACTION_RETURN.
//
// The worker below runs in its own thread, fed by the pump through a
// bounded channel; every wait is bounded so a wedged guest cannot hang the
// host side.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::acsi::{AcsiTarget, STATUS_ERROR, STATUS_OK};
use crate::config::SharedConfig;
use crate::dospath::{
    dos_to_unix, match_dos_pattern, resolve_path, unix_to_dos, valid_83, FileAttr, FileScan,
    PathClass, ScanTable,
};
use crate::error::{
    tos_error_code, HostError, EACCDN, EFILNF, EIHNDL, EINTRN, ENMFIL, ENSAME, EPTHNF,
};

/* tunnel operation codes in ACSI commands */
pub const OP_GEMDOS: u8 = 1; /* new GEMDOS call */
pub const OP_ACTION: u8 = 2; /* get next action to perform */
pub const OP_RESULT: u8 = 3; /* send result */

/* action codes from host to guest */
const ACTION_FALLBACK: u16 = 0; /* fall back to the ROM code */
const ACTION_RETURN: u16 = 1; /* return from GEMDOS */
const ACTION_RDMEM: u16 = 2; /* read from memory */
const ACTION_WRMEM: u16 = 3; /* write to memory */
const ACTION_WRMEM0: u16 = 4; /* write to memory then return 0 */
const ACTION_GEMDOS: u16 = 5; /* GEMDOS call on our behalf */
const ACTION_MODSTACK: u16 = 6; /* modify calling stack and fall back */

/// DMA buffer size in sectors for bulk transfers through the tunnel.
pub const DMABUFSZ: usize = 5;
/// Payload bytes per WRMEM action block (8 bytes of header).
const BLKSZ: usize = 512 * DMABUFSZ - 8;

/// Guest handles at or above this value are host-owned.
const HANDLE_BASE: u16 = 0x7a00;

const ACTION_TIMEOUT: Duration = Duration::from_millis(500);

/// Events the pump hands the worker: one per stub-issued tunnel command.
pub enum StubEvent {
    /// OP_GEMDOS with its opcode and the captured stack snapshot.
    Call { opcode: u16, frame: [u8; 16] },
    /// OP_ACTION: the stub is ready for the next action block.
    ActionRequested,
    /// OP_RESULT: data produced by the previous action.
    Result(Vec<u8>),
}

/// A file handle as seen at the dispatcher: either one the guest's own OS
/// manages, or one of ours. The numeric split only exists at the wire.
#[derive(Debug, Clone, Copy)]
enum Handle {
    Guest(u16),
    Host(u16),
}

impl Handle {
    fn from_wire(wire: u16) -> Handle {
        if wire >= HANDLE_BASE {
            Handle::Host(wire - HANDLE_BASE)
        } else {
            Handle::Guest(wire)
        }
    }

    fn to_wire(key: u16) -> u16 {
        HANDLE_BASE + key
    }
}

/// Open host files serving Fopen/Fcreate handles. Keys are small so every
/// wire handle maps to a live descriptor until the matching Fclose.
struct FileTable {
    files: HashMap<u16, File>,
}

impl FileTable {
    fn new() -> FileTable {
        FileTable { files: HashMap::new() }
    }

    fn insert(&mut self, file: File) -> Option<u16> {
        let key = (0..=u16::MAX - HANDLE_BASE).find(|k| !self.files.contains_key(k))?;
        self.files.insert(key, file);
        Some(key)
    }

    fn get_mut(&mut self, key: u16) -> Option<&mut File> {
        self.files.get_mut(&key)
    }

    fn remove(&mut self, key: u16) -> Option<File> {
        self.files.remove(&key)
    }
}

/// The 44-byte Disk Transfer Area. The reserved region carries our tag and
/// the scan table key across Fsfirst/Fsnext.
struct Dta {
    bytes: [u8; 44],
}

const DTA_TAG: &[u8; 4] = b"STBR";

impl Dta {
    fn new() -> Dta {
        Dta { bytes: [0; 44] }
    }

    fn set_scan_key(&mut self, key: u32) {
        self.bytes[0..4].copy_from_slice(DTA_TAG);
        self.bytes[4..8].copy_from_slice(&key.to_be_bytes());
        self.bytes[12..16].copy_from_slice(DTA_TAG);
    }

    fn scan_key(&self) -> Option<u32> {
        if &self.bytes[0..4] != DTA_TAG || &self.bytes[12..16] != DTA_TAG {
            return None;
        }
        Some(u32::from_be_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]]))
    }

    fn clear_reserved(&mut self) {
        for b in &mut self.bytes[..16] {
            *b = 0;
        }
    }

    fn set_attrib(&mut self, attrib: u8) {
        self.bytes[21] = attrib;
    }

    fn set_time(&mut self, time: u16, date: u16) {
        self.bytes[22..24].copy_from_slice(&time.to_be_bytes());
        self.bytes[24..26].copy_from_slice(&date.to_be_bytes());
    }

    fn set_length(&mut self, length: u32) {
        self.bytes[26..30].copy_from_slice(&length.to_be_bytes());
    }

    fn set_name(&mut self, name: &str) {
        for b in &mut self.bytes[30..44] {
            *b = 0;
        }
        for (i, b) in name.bytes().take(13).enumerate() {
            self.bytes[30 + i] = b.to_ascii_uppercase();
        }
    }
}

fn frame_u16(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

fn frame_u32(frame: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
}

fn frame_i32(frame: &[u8], at: usize) -> i32 {
    frame_u32(frame, at) as i32
}

pub struct GemdosWorker {
    transport: Arc<Mutex<AcsiTarget>>,
    events: Receiver<StubEvent>,
    config: SharedConfig,
    running: Arc<AtomicBool>,
    dta: Dta,
    addr_dta: u32,
    /// Reserved block address in guest memory, learned at driver init.
    resblk: u32,
    current_drv: u32,
    gemdos_drv: u32,
    current_path: PathBuf,
    files: FileTable,
    scans: ScanTable,
}

impl GemdosWorker {
    pub fn new(
        transport: Arc<Mutex<AcsiTarget>>,
        events: Receiver<StubEvent>,
        config: SharedConfig,
        running: Arc<AtomicBool>,
    ) -> GemdosWorker {
        GemdosWorker {
            transport,
            events,
            config,
            running,
            dta: Dta::new(),
            addr_dta: 0,
            resblk: 0,
            current_drv: 0,
            gemdos_drv: 2,
            current_path: PathBuf::new(),
            files: FileTable::new(),
            scans: ScanTable::new(),
        }
    }

    /// Worker main loop: one GEMDOS call at a time, strictly alternating
    /// with the guest. A timed-out call is abandoned and the loop resumes.
    pub fn run(mut self) {
        while self.running.load(Ordering::Relaxed) {
            match self.events.recv_timeout(Duration::from_millis(200)) {
                Ok(StubEvent::Call { opcode, frame }) => {
                    if let Err(e) = self.handle_call(opcode, &frame) {
                        warn!(opcode = format_args!("{:#x}", opcode), "GEMDOS call aborted: {}", e);
                    }
                }
                Ok(_) => {
                    // stale action/result left over from an aborted call
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /* ---- protocol primitives ---- */

    fn no_action_required(&self) {
        self.transport.lock().unwrap().set_status(STATUS_OK);
    }

    fn action_required(&self) {
        self.transport.lock().unwrap().set_status(STATUS_ERROR);
    }

    fn wait_action(&self, from: &'static str) -> Result<(), HostError> {
        match self.events.recv_timeout(ACTION_TIMEOUT) {
            Ok(StubEvent::ActionRequested) => Ok(()),
            Ok(_) => {
                warn!(from, "unexpected event while waiting for an action request");
                Err(HostError::ProtocolTimeout(from))
            }
            Err(RecvTimeoutError::Timeout) => Err(HostError::ProtocolTimeout(from)),
            Err(RecvTimeoutError::Disconnected) => Err(HostError::WorkerGone),
        }
    }

    fn wait_result(&self, from: &'static str) -> Result<Vec<u8>, HostError> {
        match self.events.recv_timeout(ACTION_TIMEOUT) {
            Ok(StubEvent::Result(data)) => {
                self.transport.lock().unwrap().set_status(STATUS_OK);
                Ok(data)
            }
            Ok(_) => {
                warn!(from, "unexpected event while waiting for a result");
                Err(HostError::ProtocolTimeout(from))
            }
            Err(RecvTimeoutError::Timeout) => Err(HostError::ProtocolTimeout(from)),
            Err(RecvTimeoutError::Disconnected) => Err(HostError::WorkerGone),
        }
    }

    fn send_action(&self, block: &[u8]) {
        self.transport.lock().unwrap().send_reply(block);
    }

    /// Have the guest read `nbytes` at `addr` and hand them back; `nbytes`
    /// of 0 reads a null-terminated string.
    fn read_memory(&mut self, addr: u32, nbytes: u16) -> Result<Vec<u8>, HostError> {
        self.wait_action("read_memory")?;
        let mut action = [0u8; 16];
        action[0..2].copy_from_slice(&ACTION_RDMEM.to_be_bytes());
        action[2..6].copy_from_slice(&addr.to_be_bytes());
        action[6..8].copy_from_slice(&nbytes.to_be_bytes());
        self.send_action(&action);
        self.wait_result("read_memory")
    }

    fn write_memory_generic(&mut self, buf: &[u8], addr: u32, ret0: bool) -> Result<(), HostError> {
        self.wait_action("write_memory")?;
        let code = if ret0 { ACTION_WRMEM0 } else { ACTION_WRMEM };
        let mut action = vec![0u8; (8 + buf.len() + 15) & !15];
        action[0..2].copy_from_slice(&code.to_be_bytes());
        action[2..6].copy_from_slice(&addr.to_be_bytes());
        action[6..8].copy_from_slice(&(buf.len() as u16).to_be_bytes());
        action[8..8 + buf.len()].copy_from_slice(buf);
        self.send_action(&action);
        Ok(())
    }

    fn write_memory(&mut self, buf: &[u8], addr: u32) -> Result<(), HostError> {
        self.write_memory_generic(buf, addr, false)
    }

    /// As `write_memory`, but the action also completes the GEMDOS call
    /// returning 0.
    fn write_memory0(&mut self, buf: &[u8], addr: u32) -> Result<(), HostError> {
        self.write_memory_generic(buf, addr, true)
    }

    fn read_string(&mut self, addr: u32) -> Result<String, HostError> {
        let data = self.read_memory(addr, 0)?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    fn read_long(&mut self, addr: u32) -> Result<u32, HostError> {
        let data = self.read_memory(addr, 4)?;
        if data.len() < 4 {
            return Err(HostError::ProtocolTimeout("read_long"));
        }
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    fn write_long(&mut self, addr: u32, val: u32) -> Result<(), HostError> {
        self.write_memory(&val.to_be_bytes(), addr)
    }

    /// Print a line on the guest console via Cconws, the text placed in the
    /// driver's reserved block.
    fn print_string(&mut self, text: &str) -> Result<i32, HostError> {
        self.wait_action("print_string")?;
        let mut action = vec![0u8; 10 + text.len() + 3];
        action[0..2].copy_from_slice(&ACTION_GEMDOS.to_be_bytes());
        action[2..4].copy_from_slice(&6u16.to_be_bytes());
        action[4..6].copy_from_slice(&9u16.to_be_bytes()); // Cconws
        action[6..10].copy_from_slice(&(self.resblk + 10).to_be_bytes());
        action[10..10 + text.len()].copy_from_slice(text.as_bytes());
        action[10 + text.len()..].copy_from_slice(b"\r\n\0");
        self.send_action(&action);
        let data = self.wait_result("print_string")?;
        if data.len() < 4 {
            return Ok(-1);
        }
        Ok(i32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Finish the action loop, falling back to the ROM code.
    fn fallback(&mut self) -> Result<(), HostError> {
        self.wait_action("fallback")?;
        let mut action = [0u8; 16];
        action[0..2].copy_from_slice(&ACTION_FALLBACK.to_be_bytes());
        self.send_action(&action);
        Ok(())
    }

    /// Finish the action loop, completing the GEMDOS call with `val`.
    fn ret(&mut self, val: i32) -> Result<(), HostError> {
        self.wait_action("return")?;
        let mut action = [0u8; 16];
        action[0..2].copy_from_slice(&ACTION_RETURN.to_be_bytes());
        action[2..6].copy_from_slice(&val.to_be_bytes());
        self.send_action(&action);
        Ok(())
    }

    /* ---- call plumbing ---- */

    fn root(&self) -> Option<PathBuf> {
        self.config.read().unwrap().gemdos.clone()
    }

    fn timezone(&self) -> i32 {
        self.config.read().unwrap().timezone
    }

    fn resolve(&self, dos_path: &str) -> PathClass {
        let root = match self.root() {
            Some(root) => root,
            None => return PathClass::NotManaged,
        };
        resolve_path(&root, &self.current_path, self.current_drv, self.gemdos_drv, dos_path)
    }

    fn handle_call(&mut self, opcode: u16, frame: &[u8; 16]) -> Result<(), HostError> {
        match opcode {
            0x0e => {
                // Dsetdrv
                self.current_drv = frame_u16(frame, 2) as u32;
                debug!(drive = self.current_drv, "Dsetdrv");
                self.no_action_required();
                Ok(())
            }
            0x19 => {
                // Dgetdrv
                debug!("Dgetdrv");
                self.no_action_required();
                Ok(())
            }
            0x1a => self.fsetdta(frame_u32(frame, 2)),
            0x36 => self.dfree(frame_u32(frame, 2), frame_u16(frame, 6) as u32),
            0x39 => self.dcreate(frame_u32(frame, 2)),
            0x3a => self.ddelete(frame_u32(frame, 2)),
            0x3b => self.dsetpath(frame_u32(frame, 2)),
            0x3c => self.fcreate(frame_u32(frame, 2), frame_u16(frame, 6)),
            0x3d => self.fopen(frame_u32(frame, 2), frame_u16(frame, 6)),
            0x3e => self.fclose(frame_u16(frame, 2)),
            0x3f => self.fread(frame_u16(frame, 2), frame_u32(frame, 4), frame_u32(frame, 8)),
            0x40 => self.fwrite(frame_u16(frame, 2), frame_u32(frame, 4), frame_u32(frame, 8)),
            0x41 => self.fdelete(frame_u32(frame, 2)),
            0x42 => self.fseek(frame_i32(frame, 2), frame_u16(frame, 6), frame_u16(frame, 8)),
            0x43 => self.fattrib(frame_u32(frame, 2), frame_u16(frame, 6), frame_u16(frame, 8)),
            0x47 => self.dgetpath(frame_u32(frame, 2), frame_u16(frame, 6) as u32),
            0x4b => self.pexec(
                frame_u16(frame, 2),
                frame_u32(frame, 4),
                frame_u32(frame, 8),
                frame_i32(frame, 12),
            ),
            0x4e => self.fsfirst(frame_u32(frame, 2), frame_u16(frame, 6)),
            0x4f => self.fsnext(),
            0x56 => self.frename(frame_u32(frame, 4), frame_u32(frame, 8)),
            0x57 => self.fdatime(frame_u32(frame, 2), frame_u16(frame, 6), frame_u16(frame, 8)),
            crate::stub::DRIVER_INIT_OPCODE => {
                self.drive_init(frame_u32(frame, 0), frame_u32(frame, 4))
            }
            _ => {
                debug!(opcode = format_args!("{:#x}", opcode), "unhandled GEMDOS opcode");
                self.no_action_required();
                Ok(())
            }
        }
    }

    /* ---- directory calls ---- */

    fn dsetpath(&mut self, ppath: u32) -> Result<(), HostError> {
        self.action_required();
        let path = self.read_string(ppath)?;
        debug!(path = path.as_str(), "Dsetpath");
        if self.current_drv != self.gemdos_drv {
            return self.fallback();
        }
        match self.resolve(&path) {
            PathClass::NotManaged => self.fallback(),
            PathClass::Invalid => self.ret(EPTHNF),
            PathClass::File(_) | PathClass::Missing(_) => self.ret(EFILNF),
            PathClass::Dir(host) => {
                self.current_path = host;
                self.ret(0)
            }
        }
    }

    fn dgetpath(&mut self, ppath: u32, drive: u32) -> Result<(), HostError> {
        debug!(drive, "Dgetpath");
        if (drive == 0 && self.current_drv != self.gemdos_drv)
            || (drive > 0 && drive - 1 != self.gemdos_drv)
        {
            self.no_action_required();
            return Ok(());
        }
        self.action_required();
        let root = self.root().unwrap_or_default();
        let rel = self.current_path.strip_prefix(&root).unwrap_or(&self.current_path);
        let mut dos = String::from("\\");
        for (i, comp) in rel.components().enumerate() {
            if i > 0 {
                dos.push('\\');
            }
            dos.push_str(&comp.as_os_str().to_string_lossy().to_uppercase());
        }
        let mut bytes = dos.into_bytes();
        bytes.push(0);
        self.write_memory(&bytes, ppath)?;
        self.ret(0)
    }

    fn dfree(&mut self, diskinfo_addr: u32, drive: u32) -> Result<(), HostError> {
        debug!(drive, "Dfree");
        if (drive == 0 && self.current_drv != self.gemdos_drv)
            || (drive > 0 && drive - 1 != self.gemdos_drv)
        {
            self.no_action_required();
            return Ok(());
        }
        self.action_required();
        let root = match self.root() {
            Some(root) => root,
            None => return self.ret(EINTRN),
        };
        let cpath = match std::ffi::CString::new(root.as_os_str().to_string_lossy().as_bytes()) {
            Ok(c) => c,
            Err(_) => return self.ret(EINTRN),
        };
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) } != 0 {
            return self.ret(EINTRN);
        }
        // limit free space to a positive, signed 32 bit byte count
        let max = 0x7fffffffu64 / vfs.f_bsize.max(1) as u64;
        let free = (vfs.f_bfree as u64).min(max) as u32;
        let mut diskinfo = [0u8; 16];
        diskinfo[0..4].copy_from_slice(&free.to_be_bytes());
        diskinfo[4..8].copy_from_slice(&(vfs.f_blocks as u32).to_be_bytes());
        diskinfo[8..12].copy_from_slice(&512u32.to_be_bytes());
        diskinfo[12..16].copy_from_slice(&((vfs.f_bsize as u32) / 512).to_be_bytes());
        self.write_memory(&diskinfo, diskinfo_addr)?;
        self.ret(0)
    }

    fn dcreate(&mut self, pname: u32) -> Result<(), HostError> {
        self.action_required();
        let path = self.read_string(pname)?;
        debug!(path = path.as_str(), "Dcreate");
        match self.resolve(&path) {
            PathClass::NotManaged => self.fallback(),
            PathClass::Invalid => self.ret(EPTHNF),
            PathClass::Dir(_) | PathClass::File(_) => self.ret(EACCDN),
            PathClass::Missing(host) => match fs::create_dir(&host) {
                Ok(()) => self.ret(0),
                Err(e) => self.ret(tos_error_code(&e)),
            },
        }
    }

    fn ddelete(&mut self, pname: u32) -> Result<(), HostError> {
        self.action_required();
        let path = self.read_string(pname)?;
        debug!(path = path.as_str(), "Ddelete");
        match self.resolve(&path) {
            PathClass::NotManaged => self.fallback(),
            PathClass::Invalid => self.ret(EPTHNF),
            PathClass::File(_) => self.ret(EACCDN),
            PathClass::Missing(_) => self.ret(EPTHNF),
            PathClass::Dir(host) => match fs::remove_dir(&host) {
                Ok(()) => self.ret(0),
                Err(e) => self.ret(tos_error_code(&e)),
            },
        }
    }

    /* ---- file calls ---- */

    fn fopen(&mut self, pname: u32, mode: u16) -> Result<(), HostError> {
        self.action_required();
        let path = self.read_string(pname)?;
        debug!(path = path.as_str(), mode, "Fopen");
        let host = match self.resolve(&path) {
            PathClass::NotManaged => return self.fallback(),
            PathClass::Invalid => return self.ret(EPTHNF),
            PathClass::Dir(_) | PathClass::Missing(_) => return self.ret(EFILNF),
            PathClass::File(host) => host,
        };
        if mode & 7 > 2 {
            return self.ret(EACCDN);
        }
        let mut opts = OpenOptions::new();
        match mode & 7 {
            0 => opts.read(true),
            1 => opts.write(true),
            _ => opts.read(true).write(true),
        };
        match opts.open(&host) {
            Ok(file) => match self.files.insert(file) {
                Some(key) => self.ret(Handle::to_wire(key) as i32),
                None => self.ret(EINTRN),
            },
            Err(_) => self.ret(EFILNF),
        }
    }

    fn fcreate(&mut self, pname: u32, attr: u16) -> Result<(), HostError> {
        self.action_required();
        let path = self.read_string(pname)?;
        debug!(path = path.as_str(), attr, "Fcreate");
        let host = match self.resolve(&path) {
            PathClass::NotManaged => return self.fallback(),
            PathClass::Invalid => return self.ret(EPTHNF),
            PathClass::Dir(_) => return self.ret(EACCDN),
            PathClass::File(host) | PathClass::Missing(host) => host,
        };
        match OpenOptions::new().write(true).create(true).truncate(true).open(&host) {
            Ok(file) => match self.files.insert(file) {
                Some(key) => self.ret(Handle::to_wire(key) as i32),
                None => self.ret(EINTRN),
            },
            Err(_) => self.ret(EACCDN),
        }
    }

    fn fclose(&mut self, wire: u16) -> Result<(), HostError> {
        debug!(handle = wire, "Fclose");
        let key = match Handle::from_wire(wire) {
            Handle::Guest(_) => {
                self.no_action_required();
                return Ok(());
            }
            Handle::Host(key) => key,
        };
        self.action_required();
        match self.files.remove(key) {
            Some(file) => {
                drop(file);
                self.ret(0)
            }
            None => self.ret(EIHNDL),
        }
    }

    fn fread(&mut self, wire: u16, length: u32, addr: u32) -> Result<(), HostError> {
        debug!(handle = wire, length, "Fread");
        let key = match Handle::from_wire(wire) {
            Handle::Guest(_) => {
                self.no_action_required();
                return Ok(());
            }
            Handle::Host(key) => key,
        };
        self.action_required();
        let mut remaining = length as usize;
        let mut addr = addr;
        let mut nread = 0i32;
        let mut block = vec![0u8; 8 + BLKSZ];
        while remaining > 0 {
            let n = remaining.min(BLKSZ);
            let rdb = match self.files.get_mut(key) {
                Some(file) => match file.read(&mut block[8..8 + n]) {
                    Ok(rdb) => rdb,
                    Err(e) => return self.ret(tos_error_code(&e)),
                },
                None => return self.ret(EIHNDL),
            };
            if rdb == 0 {
                // end of file
                break;
            }
            self.wait_action("Fread")?;
            block[0..2].copy_from_slice(&ACTION_WRMEM.to_be_bytes());
            block[2..6].copy_from_slice(&addr.to_be_bytes());
            block[6..8].copy_from_slice(&(rdb as u16).to_be_bytes());
            let padded = (8 + rdb + 15) & !15;
            self.send_action(&block[..padded]);
            nread += rdb as i32;
            addr += rdb as u32;
            remaining -= rdb;
        }
        self.ret(nread)
    }

    fn fwrite(&mut self, wire: u16, length: u32, addr: u32) -> Result<(), HostError> {
        debug!(handle = wire, length, "Fwrite");
        let key = match Handle::from_wire(wire) {
            Handle::Guest(_) => {
                // not a locally managed file
                self.no_action_required();
                return Ok(());
            }
            Handle::Host(key) => key,
        };
        self.action_required();
        let mut remaining = length as usize;
        let mut addr = addr;
        let mut nwritten = 0i32;
        while remaining > 0 {
            let n = remaining.min(512 * DMABUFSZ);
            let data = self.read_memory(addr, n as u16)?;
            let wrb = match self.files.get_mut(key) {
                Some(file) => match file.write(&data[..n.min(data.len())]) {
                    Ok(wrb) => wrb,
                    Err(e) => return self.ret(tos_error_code(&e)),
                },
                None => return self.ret(EIHNDL),
            };
            nwritten += wrb as i32;
            addr += wrb as u32;
            remaining -= wrb;
        }
        self.ret(nwritten)
    }

    fn fseek(&mut self, offset: i32, wire: u16, mode: u16) -> Result<(), HostError> {
        debug!(handle = wire, offset, mode, "Fseek");
        let key = match Handle::from_wire(wire) {
            Handle::Guest(_) => {
                self.no_action_required();
                return Ok(());
            }
            Handle::Host(key) => key,
        };
        self.action_required();
        let whence = match mode {
            0 => SeekFrom::Start(offset.max(0) as u64),
            1 => SeekFrom::Current(offset as i64),
            2 => SeekFrom::End(offset as i64),
            _ => return self.ret(EACCDN),
        };
        match self.files.get_mut(key) {
            Some(file) => match file.seek(whence) {
                Ok(pos) => self.ret(pos as i32),
                Err(e) => self.ret(tos_error_code(&e)),
            },
            None => self.ret(EIHNDL),
        }
    }

    fn fdelete(&mut self, pname: u32) -> Result<(), HostError> {
        self.action_required();
        let path = self.read_string(pname)?;
        debug!(path = path.as_str(), "Fdelete");
        match self.resolve(&path) {
            PathClass::NotManaged => self.fallback(),
            PathClass::Invalid | PathClass::Missing(_) => self.ret(EPTHNF),
            PathClass::Dir(_) => self.ret(EACCDN),
            PathClass::File(host) => match fs::remove_file(&host) {
                Ok(()) => self.ret(0),
                Err(e) => self.ret(tos_error_code(&e)),
            },
        }
    }

    fn frename(&mut self, poldname: u32, pnewname: u32) -> Result<(), HostError> {
        self.action_required();
        let oldname = self.read_string(poldname)?;
        let newname = self.read_string(pnewname)?;
        debug!(from = oldname.as_str(), to = newname.as_str(), "Frename");
        let old_host = match self.resolve(&oldname) {
            PathClass::NotManaged => return self.fallback(),
            PathClass::Invalid | PathClass::Missing(_) => return self.ret(EPTHNF),
            PathClass::Dir(host) | PathClass::File(host) => host,
        };
        let new_host = match self.resolve(&newname) {
            PathClass::NotManaged => return self.ret(ENSAME),
            PathClass::Invalid => return self.ret(EPTHNF),
            PathClass::Dir(_) | PathClass::File(_) => return self.ret(EACCDN),
            PathClass::Missing(host) => host,
        };
        match fs::rename(&old_host, &new_host) {
            Ok(()) => self.ret(0),
            Err(e) => self.ret(tos_error_code(&e)),
        }
    }

    fn fattrib(&mut self, pname: u32, wflag: u16, attrib: u16) -> Result<(), HostError> {
        self.action_required();
        let path = self.read_string(pname)?;
        debug!(path = path.as_str(), wflag, attrib, "Fattrib");
        self.fallback()
    }

    fn fdatime(&mut self, timeptr: u32, wire: u16, wflag: u16) -> Result<(), HostError> {
        debug!(handle = wire, wflag, "Fdatime");
        let key = match Handle::from_wire(wire) {
            Handle::Guest(_) => {
                self.no_action_required();
                return Ok(());
            }
            Handle::Host(key) => key,
        };
        self.action_required();
        let tz = self.timezone();
        if wflag == 0 {
            let mtime = match self.files.get_mut(key) {
                Some(file) => match file.metadata() {
                    Ok(md) => md
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0),
                    Err(e) => return self.ret(tos_error_code(&e)),
                },
                None => return self.ret(EIHNDL),
            };
            let (time, date) = unix_to_dos(mtime, tz);
            let mut buf = [0u8; 4];
            buf[0..2].copy_from_slice(&time.to_be_bytes());
            buf[2..4].copy_from_slice(&date.to_be_bytes());
            self.write_memory(&buf, timeptr)?;
            self.ret(0)
        } else {
            let buf = self.read_memory(timeptr, 4)?;
            if buf.len() < 4 {
                return self.ret(EINTRN);
            }
            let time = u16::from_be_bytes([buf[0], buf[1]]);
            let date = u16::from_be_bytes([buf[2], buf[3]]);
            let secs = dos_to_unix(time, date, tz);
            if let Some(file) = self.files.get_mut(key) {
                let times = [libc::timespec { tv_sec: secs, tv_nsec: 0 }; 2];
                unsafe { libc::futimens(file.as_raw_fd(), times.as_ptr()) };
            }
            self.ret(0)
        }
    }

    /* ---- directory scans ---- */

    fn fsetdta(&mut self, addr: u32) -> Result<(), HostError> {
        debug!(addr = format_args!("{:#x}", addr), "Fsetdta");
        if self.addr_dta == addr {
            self.no_action_required();
            return Ok(());
        }
        self.action_required();
        let data = self.read_memory(addr, 44)?;
        let n = data.len().min(44);
        self.dta.bytes[..n].copy_from_slice(&data[..n]);
        self.addr_dta = addr;
        self.fallback()
    }

    fn fsfirst(&mut self, pname: u32, attr: u16) -> Result<(), HostError> {
        self.action_required();
        let spec = self.read_string(pname)?;
        debug!(spec = spec.as_str(), attr, "Fsfirst");

        // separate the pattern from the path
        let (path, pattern) = match spec.rfind('\\') {
            None => (String::new(), spec.clone()),
            Some(pos) => {
                let pattern = spec[pos + 1..].to_string();
                // a spec of the form "C:\*.*" keeps its backslash
                let path_end = if pos == 2 { pos + 1 } else { pos };
                (spec[..path_end].to_string(), pattern)
            }
        };

        let host = match self.resolve(&path) {
            PathClass::NotManaged => return self.fallback(),
            PathClass::Invalid | PathClass::File(_) | PathClass::Missing(_) => {
                return self.ret(EFILNF)
            }
            PathClass::Dir(host) => host,
        };

        // release any scan the previous Fsfirst left in this DTA
        if let Some(old) = self.dta.scan_key() {
            self.scans.remove(old);
        }

        let iter = match fs::read_dir(&host) {
            Ok(iter) => iter,
            Err(_) => return self.fallback(),
        };
        let key = self.scans.insert(FileScan {
            path: host,
            pattern,
            attr: FileAttr::from_bits_truncate(attr),
            first: true,
            iter,
        });
        self.dta.set_scan_key(key);
        let head: [u8; 16] = self.dta.bytes[..16].try_into().unwrap();
        self.write_memory(&head, self.addr_dta)?;

        self.next_file()
    }

    fn fsnext(&mut self) -> Result<(), HostError> {
        debug!("Fsnext");
        self.action_required();
        self.next_file()
    }

    /// Advance the scan identified by the DTA to the next matching entry,
    /// or report exhaustion and release it.
    fn next_file(&mut self) -> Result<(), HostError> {
        let key = match self.dta.scan_key() {
            Some(key) => key,
            None => return self.fallback(),
        };

        struct Hit {
            name: String,
            path: PathBuf,
            is_dir: bool,
        }

        let (hit, was_first) = loop {
            let scan = match self.scans.get_mut(key) {
                Some(scan) => scan,
                None => return self.fallback(),
            };
            match scan.iter.next() {
                None => break (None, scan.first),
                Some(Err(_)) => break (None, scan.first),
                Some(Ok(entry)) => {
                    let name = match entry.file_name().into_string() {
                        Ok(name) => name,
                        Err(_) => continue,
                    };
                    if !match_dos_pattern(&scan.pattern, &name) {
                        continue;
                    }
                    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                    let wanted = is_file || (is_dir && scan.attr.contains(FileAttr::DIR));
                    if !wanted || !valid_83(&name) {
                        continue;
                    }
                    scan.first = false;
                    break (Some(Hit { name, path: entry.path(), is_dir }), false);
                }
            }
        };

        let hit = match hit {
            Some(hit) => hit,
            None => {
                self.scans.remove(key);
                self.dta.clear_reserved();
                let head: [u8; 16] = self.dta.bytes[..16].try_into().unwrap();
                self.write_memory(&head, self.addr_dta)?;
                return self.ret(if was_first { EFILNF } else { ENMFIL });
            }
        };

        let md = fs::metadata(&hit.path).ok();
        let size = md.as_ref().map(|m| m.len() as u32).unwrap_or(0);
        let mtime = md
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let (time, date) = unix_to_dos(mtime, self.timezone());

        self.dta.set_name(&hit.name);
        self.dta.set_length(size);
        self.dta.set_time(time, date);
        self.dta.set_attrib(if hit.is_dir { 0x10 } else { 0 });

        let tail: [u8; 24] = self.dta.bytes[20..44].try_into().unwrap();
        self.write_memory0(&tail, self.addr_dta + 20)
    }

    /* ---- program loading ---- */

    fn pexec(&mut self, mode: u16, pname: u32, pcmdline: u32, penv: i32) -> Result<(), HostError> {
        match mode {
            0 | 3 => self.pexec_load(mode, pname, pcmdline, penv),
            5 | 7 => {
                self.action_required();
                let cmdline = self.read_string(pcmdline)?;
                debug!(mode, cmdline = cmdline.as_str(), "Pexec");
                self.fallback()
            }
            _ => {
                debug!(mode, "Pexec");
                if mode == 4 || mode == 6 {
                    // default DTA of the process about to run
                    self.addr_dta = pcmdline + 0x80;
                }
                self.action_required();
                self.fallback()
            }
        }
    }

    fn pexec_load(&mut self, mode: u16, pname: u32, pcmdline: u32, penv: i32) -> Result<(), HostError> {
        self.action_required();
        let path = self.read_string(pname)?;
        let cmdline = self.read_string(pcmdline)?;
        debug!(mode, path = path.as_str(), cmdline = cmdline.as_str(), "Pexec");
        let host = match self.resolve(&path) {
            PathClass::NotManaged => return self.fallback(),
            PathClass::Invalid => return self.ret(EPTHNF),
            PathClass::Dir(_) | PathClass::Missing(_) => return self.ret(EFILNF),
            PathClass::File(host) => host,
        };

        // have the guest build a basepage for us (Pexec mode 5)
        self.wait_action("Pexec basepage")?;
        let mut action = [0u8; 20];
        action[0..2].copy_from_slice(&ACTION_GEMDOS.to_be_bytes());
        action[2..4].copy_from_slice(&16u16.to_be_bytes());
        action[4..6].copy_from_slice(&0x4bu16.to_be_bytes()); // Pexec
        action[6..8].copy_from_slice(&5u16.to_be_bytes()); // mode 5: create basepage
        action[12..16].copy_from_slice(&pcmdline.to_be_bytes());
        action[16..20].copy_from_slice(&(penv as u32).to_be_bytes());
        self.send_action(&action);
        let reply = self.wait_result("Pexec basepage")?;
        if reply.len() < 4 {
            return self.ret(EINTRN);
        }
        let basepage = u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);

        // build the process image: basepage copy + program file
        let mut file = match File::open(&host) {
            Ok(file) => file,
            Err(e) => return self.ret(tos_error_code(&e)),
        };
        let size = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
        if size < 28 {
            return self.ret(EINTRN);
        }
        let mut header = [0u8; 28];
        if let Err(e) = file.read_exact(&mut header) {
            return self.ret(tos_error_code(&e));
        }
        let mut progbuf = vec![0u8; 256 + size - 28];
        if let Err(e) = file.read_exact(&mut progbuf[256..]) {
            return self.ret(tos_error_code(&e));
        }
        let bp = self.read_memory(basepage, 256)?;
        progbuf[..bp.len().min(256)].copy_from_slice(&bp[..bp.len().min(256)]);

        let sz_text = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let sz_data = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let sz_bss = u32::from_be_bytes([header[10], header[11], header[12], header[13]]) as usize;
        let sz_sym = u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;
        // the sections must fit in any conceivable guest memory
        if sz_text + sz_data + sz_bss > 0xe0_0000 {
            return self.ret(EINTRN);
        }
        let text_base = basepage + 256;

        // record the section layout in the basepage copy
        let mut ptr = text_base;
        progbuf[8..12].copy_from_slice(&ptr.to_be_bytes());
        progbuf[12..16].copy_from_slice(&(sz_text as u32).to_be_bytes());
        ptr += sz_text as u32;
        progbuf[16..20].copy_from_slice(&ptr.to_be_bytes());
        progbuf[20..24].copy_from_slice(&(sz_data as u32).to_be_bytes());
        ptr += sz_data as u32;
        progbuf[24..28].copy_from_slice(&ptr.to_be_bytes());
        progbuf[28..32].copy_from_slice(&(sz_bss as u32).to_be_bytes());

        let relocatable = u16::from_be_bytes([header[26], header[27]]) == 0;
        if relocatable {
            relocate(&mut progbuf, 256 + sz_text + sz_data + sz_sym, text_base);
        }

        // clear the BSS and drop symbols/relocation data
        let length = 256 + sz_text + sz_data + sz_bss;
        progbuf.resize(length, 0);
        for b in &mut progbuf[256 + sz_text + sz_data..] {
            *b = 0;
        }

        // stream the prepared image into guest memory
        let mut addr = basepage;
        let mut src = 0usize;
        let mut block = vec![0u8; 8 + BLKSZ];
        while src < progbuf.len() {
            let n = (progbuf.len() - src).min(BLKSZ);
            self.wait_action("Pexec image")?;
            block[0..2].copy_from_slice(&ACTION_WRMEM.to_be_bytes());
            block[2..6].copy_from_slice(&addr.to_be_bytes());
            block[6..8].copy_from_slice(&(n as u16).to_be_bytes());
            block[8..8 + n].copy_from_slice(&progbuf[src..src + n]);
            self.send_action(&block[..8 + n]);
            src += n;
            addr += n as u32;
        }

        if mode == 3 {
            return self.ret(basepage as i32);
        }

        // mode 0: run it. Default DTA, then rewrite the guest's stack into a
        // Pexec mode 4 (basepage-go) call and fall back.
        self.addr_dta = basepage + 0x80;
        self.wait_action("Pexec go")?;
        let mut action = [0u8; 20];
        action[0..2].copy_from_slice(&ACTION_MODSTACK.to_be_bytes());
        action[2..4].copy_from_slice(&16u16.to_be_bytes());
        action[4..6].copy_from_slice(&0x4bu16.to_be_bytes());
        action[6..8].copy_from_slice(&4u16.to_be_bytes());
        action[12..16].copy_from_slice(&basepage.to_be_bytes());
        self.send_action(&action);
        Ok(())
    }

    /* ---- driver initialisation ---- */

    /// Called by the stub once its boot code is resident: claim a free
    /// drive bit and announce ourselves.
    fn drive_init(&mut self, begin_adr: u32, resblk_adr: u32) -> Result<(), HostError> {
        self.resblk = resblk_adr;
        self.action_required();
        let drvbits = self.read_long(0x4c2)?;
        debug!(
            begin = format_args!("{:#x}", begin_adr),
            resblk = format_args!("{:#x}", resblk_adr),
            drvbits,
            "driver init"
        );
        let mut drive = 2u32;
        while drvbits & (1 << drive) != 0 {
            drive += 1;
        }
        self.gemdos_drv = drive;
        self.write_long(0x4c2, drvbits | 1 << drive)?;
        let letter = (b'A' + drive as u8) as char;
        self.print_string(&format!("GEMDOS drive installed as drive {}:", letter))?;
        if drive == 2 {
            // if the drive is C:, make it the current drive
            self.current_drv = 2;
        }
        if let Some(root) = self.root() {
            self.current_path = root;
        }
        self.fallback()
    }
}

/// Walk the compact relocation list of a program image: a leading 32-bit
/// offset, then byte displacements where the value 1 means "skip 254
/// without applying" and zero terminates.
fn relocate(progbuf: &mut [u8], rdat_start: usize, base: u32) {
    let read_u32 =
        |b: &[u8], at: usize| u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]);
    if rdat_start + 4 > progbuf.len() {
        return;
    }
    let mut rdat = rdat_start;
    let first = read_u32(progbuf, rdat) as usize;
    rdat += 4;
    if first == 0 {
        return;
    }
    let mut dest = 256 + first;
    loop {
        if dest + 4 > progbuf.len() {
            return;
        }
        let val = read_u32(progbuf, dest).wrapping_add(base);
        progbuf[dest..dest + 4].copy_from_slice(&val.to_be_bytes());
        loop {
            let offset = match progbuf.get(rdat) {
                Some(&b) => b as usize,
                None => return,
            };
            rdat += 1;
            if offset == 0 {
                return;
            }
            dest += if offset == 1 { 254 } else { offset };
            if offset != 1 {
                break;
            }
        }
    }
}
