// ACSI target: command framing, the SCSI-like block-device dispatcher for
// up to eight image-backed slots, and the DMA ping-pong engine shared with
// the GEMDOS tunnel. Everything here runs on the pump thread; the GEMDOS
// worker reaches in through the same mutex to issue its replies.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::fabric::{Fabric, DMA_BUF_BYTES};
use crate::gemdos::{StubEvent, OP_ACTION, OP_GEMDOS, OP_RESULT};
use crate::stub;

/* ACSI status codes */
pub const STATUS_OK: u32 = 0;
pub const STATUS_ERROR: u32 = 2;

// sense format: 0xAAQQSS  AA: additional sense code, QQ: qualifier, SS: sense key
pub const ERROR_OK: u32 = 0x000000;
pub const ERROR_NOSECTOR: u32 = 0x010004;
pub const ERROR_WRITEERR: u32 = 0x030002;
pub const ERROR_OPCODE: u32 = 0x200005;
pub const ERROR_INVADDR: u32 = 0x21000d;
pub const ERROR_INVARG: u32 = 0x240005;
pub const ERROR_INVLUN: u32 = 0x250005;

/* command opcodes */
const CMD_TEST_UNIT_READY: u8 = 0x00;
const CMD_REQUEST_SENSE: u8 = 0x03;
const CMD_READ: u8 = 0x08;
const CMD_WRITE: u8 = 0x0a;
const CMD_TUNNEL: u8 = 0x11;
const CMD_INQUIRY: u8 = 0x12;
const CMD_MODE_SENSE: u8 = 0x1a;
const CMD_READ_CAPACITY: u8 = 0x25;
/// ICD extension escape in the low five bits of the first command byte.
const CMD_EXTENSION: u8 = 0x1f;

const SECTOR_BYTES: usize = 512;
/// A DMA chunk is at most 32 sixteen-byte blocks, i.e. one sector.
const MAX_CHUNK_BLOCKS: usize = 32;

/// GEMDOS tunnel opcodes that carry a 16-byte stack snapshot.
const TUNNELED_WITH_FRAME: [u16; 20] = [
    0x0e, 0x1a, 0x36, 0x39, 0x3a, 0x3b, 0x3c, 0x3d, 0x3e, 0x3f, 0x40, 0x41, 0x42, 0x43, 0x47,
    0x4b, 0x4e, 0x56, 0x57, 0xffff,
];
/// GEMDOS tunnel opcodes with no data block.
const TUNNELED_BARE: [u16; 2] = [0x19, 0x4f];

/// One image-backed block device.
pub struct BlockImage {
    file: std::fs::File,
    sectors: u32,
}

impl BlockImage {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<BlockImage> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let sectors = (file.metadata()?.len() / SECTOR_BYTES as u64) as u32;
        Ok(BlockImage { file, sectors })
    }

    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    fn read_sector(&self, lba: u32, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.read_exact_at(buf, lba as u64 * SECTOR_BYTES as u64)
    }

    fn write_sector(&self, lba: u32, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(buf, lba as u64 * SECTOR_BYTES as u64)
    }
}

struct Slot {
    img: Option<BlockImage>,
    lba: u32,
    sense: u32,
    report_lba: bool,
}

impl Slot {
    fn clear_sense(&mut self) {
        self.sense = ERROR_OK;
        self.report_lba = false;
    }
}

#[derive(PartialEq)]
enum DmaMode {
    Idle,
    Read,
    Write,
}

/// What feeds or drains the ping-pong buffers while a transfer runs.
enum Transfer {
    None,
    /// Block-device read: sectors streamed from the slot image.
    FileRead { next_lba: u32 },
    /// Block-device write: sectors flushed to the slot image.
    FileWrite,
    /// In-memory reply (sense data, inquiry, boot image, GEMDOS actions).
    Reply { data: Vec<u8>, offset: usize },
    /// Guest-to-host capture for the GEMDOS tunnel.
    Capture { data: Vec<u8>, expected: usize, kind: CaptureKind },
}

enum CaptureKind {
    Call { opcode: u16 },
    Result,
}

pub struct AcsiTarget {
    fabric: Arc<Fabric>,
    config: SharedConfig,
    events: SyncSender<StubEvent>,
    slots: [Slot; 8],
    gemdos_id: Option<usize>,
    dev_id: usize,
    cmd: [u8; 10],
    cmd_size: usize,
    cmd_idx: usize,
    cmd_ext: bool,
    dma: DmaMode,
    buf_id: usize,
    rem_blocks: usize,
    transfer: Transfer,
}

/// Derive the command length from its header byte.
fn command_size(head: u8) -> usize {
    if head >= 0xa0 {
        12
    } else if head >= 0x80 {
        16
    } else if head >= 0x20 {
        10
    } else {
        6
    }
}

impl AcsiTarget {
    pub fn new(fabric: Arc<Fabric>, config: SharedConfig, events: SyncSender<StubEvent>) -> AcsiTarget {
        let mut target = AcsiTarget {
            fabric,
            config,
            events,
            slots: Default::default(),
            gemdos_id: None,
            dev_id: 0,
            cmd: [0; 10],
            cmd_size: 0,
            cmd_idx: 0,
            cmd_ext: false,
            dma: DmaMode::Idle,
            buf_id: 0,
            rem_blocks: 0,
            transfer: Transfer::None,
        };
        let paths = {
            let cfg = target.config.read().unwrap();
            cfg.acsi.clone()
        };
        for (i, path) in paths.iter().enumerate() {
            if let Some(path) = path {
                target.open_image(i, path);
            }
        }
        target.update_gemdos_id();
        target
    }

    fn open_image(&mut self, id: usize, path: &Path) {
        match BlockImage::open(path) {
            Ok(img) => self.slots[id].img = Some(img),
            Err(e) => warn!("could not open HDD image file `{}`: {}", path.display(), e),
        }
        self.slots[id].clear_sense();
    }

    /// The logical drive is the first slot without a backing image.
    fn update_gemdos_id(&mut self) {
        self.gemdos_id = self.slots.iter().position(|s| s.img.is_none());
    }

    pub fn gemdos_id(&self) -> Option<usize> {
        self.gemdos_id
    }

    /// Replace or eject the image of one slot.
    pub fn change_image(&mut self, id: usize, path: Option<&Path>) {
        self.slots[id].img = None;
        if let Some(path) = path {
            self.open_image(id, path);
        }
        self.update_gemdos_id();
    }

    pub fn set_status(&mut self, status: u32) {
        self.fabric.acsi_write(status);
    }

    fn set_error(&mut self, err: u32, report_lba: bool) {
        self.slots[self.dev_id].sense = err;
        self.slots[self.dev_id].report_lba = report_lba;
        self.set_status(STATUS_ERROR);
    }

    /// Initiate a DMA read transfer handing `data` to the guest.
    pub fn send_reply(&mut self, data: &[u8]) {
        self.dma = DmaMode::Read;
        self.buf_id = 0;
        self.rem_blocks = (data.len() + 15) / 16;
        let first = data.len().min(SECTOR_BYTES);
        self.fabric.iobuf_write(0, &data[..first]);
        self.transfer = Transfer::Reply { data: data.to_vec(), offset: SECTOR_BYTES };
        self.read_next();
    }

    /// Initiate a DMA write transfer capturing `n_bytes` from the guest.
    fn wait_data(&mut self, n_bytes: usize, transfer: Transfer) {
        if n_bytes == 0 {
            // nothing to transfer: complete the command right away
            match transfer {
                Transfer::Capture { kind: CaptureKind::Call { opcode }, .. } => {
                    self.emit(StubEvent::Call { opcode, frame: [0; 16] })
                }
                Transfer::Capture { kind: CaptureKind::Result, .. } => {
                    self.emit(StubEvent::Result(Vec::new()))
                }
                _ => self.set_status(STATUS_OK),
            }
            return;
        }
        self.dma = DmaMode::Write;
        self.buf_id = 0;
        self.rem_blocks = (n_bytes + 15) / 16;
        self.transfer = transfer;
        let nbs = self.rem_blocks.min(MAX_CHUNK_BLOCKS);
        self.fabric.acsi_write(0x200 | ((nbs - 1) << 3) as u32 | self.buf_id as u32);
    }

    /// Advance a running DMA read: finish the command, or issue the next
    /// chunk and refill the buffer the fabric just released.
    fn read_next(&mut self) {
        if self.rem_blocks == 0 {
            self.set_status(STATUS_OK);
            self.dma = DmaMode::Idle;
            self.transfer = Transfer::None;
            return;
        }
        if let Transfer::FileRead { .. } = self.transfer {
            self.slots[self.dev_id].lba += 1;
        }
        let nbs = self.rem_blocks.min(MAX_CHUNK_BLOCKS);
        self.fabric.acsi_write(0x100 | ((nbs - 1) << 3) as u32 | self.buf_id as u32);
        self.rem_blocks -= nbs;
        if self.rem_blocks > 0 {
            self.buf_id ^= 1;
            let offset = self.buf_id * DMA_BUF_BYTES;
            let nbytes = self.rem_blocks.min(MAX_CHUNK_BLOCKS) * 16;
            match &mut self.transfer {
                Transfer::Reply { data, offset: src } => {
                    let mut chunk = vec![0u8; nbytes];
                    if *src < data.len() {
                        let n = nbytes.min(data.len() - *src);
                        chunk[..n].copy_from_slice(&data[*src..*src + n]);
                    }
                    *src += SECTOR_BYTES;
                    self.fabric.iobuf_write(offset, &chunk);
                }
                Transfer::FileRead { next_lba } => {
                    let mut sector = [0u8; SECTOR_BYTES];
                    let lba = *next_lba;
                    *next_lba += 1;
                    if let Some(img) = self.slots[self.dev_id].img.as_ref() {
                        if let Err(e) = img.read_sector(lba, &mut sector) {
                            warn!(lba, "sector read failed: {}", e);
                        }
                    }
                    self.fabric.iobuf_write(offset, &sector);
                }
                _ => {}
            }
        }
    }

    /// Advance a running DMA write: drain the buffer the fabric just filled
    /// and request the next chunk.
    fn write_next(&mut self) {
        let nbs = self.rem_blocks.min(MAX_CHUNK_BLOCKS);
        self.rem_blocks -= nbs;
        if self.rem_blocks > 0 {
            let next = self.rem_blocks.min(MAX_CHUNK_BLOCKS);
            self.fabric
                .acsi_write(0x200 | ((next - 1) << 3) as u32 | (1 - self.buf_id) as u32);
        }
        let offset = self.buf_id * DMA_BUF_BYTES;
        let mut transfer = std::mem::replace(&mut self.transfer, Transfer::None);
        match &mut transfer {
            Transfer::Capture { data, expected, kind } => {
                let mut chunk = vec![0u8; nbs * 16];
                self.fabric.iobuf_read(offset, &mut chunk);
                data.extend_from_slice(&chunk);
                if self.rem_blocks == 0 {
                    self.dma = DmaMode::Idle;
                    data.truncate(*expected);
                    let data = std::mem::take(data);
                    match kind {
                        CaptureKind::Call { opcode } => {
                            let mut frame = [0u8; 16];
                            let n = data.len().min(16);
                            frame[..n].copy_from_slice(&data[..n]);
                            self.emit(StubEvent::Call { opcode: *opcode, frame });
                        }
                        CaptureKind::Result => self.emit(StubEvent::Result(data)),
                    }
                } else {
                    self.transfer = transfer;
                }
            }
            Transfer::FileWrite => {
                let mut sector = [0u8; SECTOR_BYTES];
                self.fabric.iobuf_read(offset, &mut sector);
                let lba = self.slots[self.dev_id].lba;
                if let Some(img) = self.slots[self.dev_id].img.as_ref() {
                    if let Err(e) = img.write_sector(lba, &sector) {
                        warn!(lba, "sector write failed: {}", e);
                    }
                }
                self.slots[self.dev_id].lba += 1;
                if self.rem_blocks == 0 {
                    self.set_status(STATUS_OK);
                    self.dma = DmaMode::Idle;
                } else {
                    self.transfer = transfer;
                }
            }
            _ => {}
        }
        self.buf_id ^= 1;
    }

    fn emit(&self, event: StubEvent) {
        if self.events.try_send(event).is_err() {
            warn!("GEMDOS worker not ready, event dropped");
        }
    }

    /// Service one block-device data-request interrupt: either advance a
    /// running DMA transfer or consume the next command byte.
    pub fn interrupt(&mut self) {
        match self.dma {
            DmaMode::Read => return self.read_next(),
            DmaMode::Write => return self.write_next(),
            DmaMode::Idle => {}
        }

        // not a DMA interrupt: command byte reception
        let reg = self.fabric.acsi_read();
        let d = (reg & 0xff) as u8;
        let a1 = reg >> 8 & 1 != 0;

        if self.cmd_idx == 0 && !self.cmd_ext && a1 {
            // bytes are safely ignored as long as they do not start a new command
            return;
        }
        if (self.cmd_idx > 0 || self.cmd_ext) && !a1 {
            warn!(index = self.cmd_idx, "ACSI framing error: command start in mid-command");
            self.cmd_idx = 0;
            self.cmd_ext = false;
            self.set_status(STATUS_ERROR);
            return;
        }

        if self.cmd_idx == 0 {
            let mut cmd = d;
            if !self.cmd_ext {
                self.dev_id = (d >> 5) as usize;
                // ignore the command if no image is set up for the device id
                let gemdos_active = self.gemdos_id == Some(self.dev_id)
                    && self.config.read().unwrap().gemdos.is_some();
                if self.slots[self.dev_id].img.is_none() && !gemdos_active {
                    return;
                }
                cmd = d & 0x1f;
                if cmd == CMD_EXTENSION {
                    // ICD command extension: next byte is the real opcode
                    self.cmd_ext = true;
                    self.set_status(STATUS_OK);
                    return;
                }
            }
            let accepted: &[u8] = if self.gemdos_id == Some(self.dev_id) {
                &[CMD_TEST_UNIT_READY, CMD_REQUEST_SENSE, CMD_READ, CMD_TUNNEL, CMD_INQUIRY]
            } else {
                &[
                    CMD_TEST_UNIT_READY,
                    CMD_REQUEST_SENSE,
                    CMD_READ,
                    CMD_WRITE,
                    CMD_INQUIRY,
                    CMD_MODE_SENSE,
                    CMD_READ_CAPACITY,
                ]
            };
            if !accepted.contains(&cmd) {
                self.set_error(ERROR_OPCODE, false);
                return;
            }
            self.cmd_size = command_size(cmd);
            self.cmd[self.cmd_idx] = cmd;
            self.cmd_idx += 1;
        } else {
            self.cmd[self.cmd_idx] = d;
            self.cmd_idx += 1;
        }

        if self.cmd_idx == self.cmd_size {
            self.cmd_idx = 0;
            self.cmd_ext = false;
            if self.gemdos_id == Some(self.dev_id) {
                self.gemdos_command();
            } else {
                self.block_command();
            }
        } else {
            // acknowledge and wait for the next command byte
            self.set_status(STATUS_OK);
        }
    }

    fn block_command(&mut self) {
        match self.cmd[0] {
            CMD_TEST_UNIT_READY => self.set_status(STATUS_OK),
            CMD_REQUEST_SENSE => self.request_sense(),
            CMD_READ => self.block_read(),
            CMD_WRITE => self.block_write(),
            CMD_INQUIRY => self.inquiry(false),
            CMD_MODE_SENSE => self.mode_sense(),
            CMD_READ_CAPACITY => self.read_capacity(),
            _ => self.set_status(STATUS_OK),
        }
    }

    /// Two reporting forms keyed on the requested length: a packed 4-byte
    /// form, or the regular 18-byte SCSI sense.
    fn request_sense(&mut self) {
        let length = (self.cmd[4] as usize).max(4);
        let mut data = vec![0u8; length.max(18)];
        let slot = &self.slots[self.dev_id];
        if length <= 4 {
            data[0] = (slot.sense >> 16) as u8;
            if slot.report_lba {
                data[0] |= 0x80;
                data[1] = (slot.lba >> 16) as u8;
                data[2] = (slot.lba >> 8) as u8;
                data[3] = slot.lba as u8;
            }
        } else {
            data[0] = 0x70;
            if slot.report_lba {
                data[0] |= 0x80;
                data[3] = (slot.lba >> 24) as u8;
                data[4] = (slot.lba >> 16) as u8;
                data[5] = (slot.lba >> 8) as u8;
                data[6] = slot.lba as u8;
            }
            data[2] = (slot.sense & 0x0f) as u8;
            data[7] = 10; // additional sense length
            data[12] = (slot.sense >> 16) as u8;
            data[13] = (slot.sense >> 8) as u8;
        }
        data.truncate(length);
        self.send_reply(&data);
        self.slots[self.dev_id].clear_sense();
    }

    fn block_read(&mut self) {
        let lba = u32::from_be_bytes([0, self.cmd[1], self.cmd[2], self.cmd[3]]);
        let count = self.cmd[4] as u32;
        let sectors = self.slots[self.dev_id].img.as_ref().map(|i| i.sectors()).unwrap_or(0);
        self.slots[self.dev_id].lba = lba;
        self.rem_blocks = count as usize * MAX_CHUNK_BLOCKS;
        if lba >= sectors {
            self.set_error(ERROR_INVADDR, true);
            return;
        }
        if lba + count > sectors {
            self.slots[self.dev_id].lba = sectors;
            self.set_error(ERROR_INVADDR, true);
            return;
        }
        self.dma = DmaMode::Read;
        self.buf_id = 0;
        let mut sector = [0u8; SECTOR_BYTES];
        if let Some(img) = self.slots[self.dev_id].img.as_ref() {
            if let Err(e) = img.read_sector(lba, &mut sector) {
                warn!(lba, "sector read failed: {}", e);
            }
        }
        self.fabric.iobuf_write(0, &sector);
        self.transfer = Transfer::FileRead { next_lba: lba + 1 };
        self.read_next();
    }

    fn block_write(&mut self) {
        let sector = u32::from_be_bytes([0, self.cmd[1], self.cmd[2], self.cmd[3]]);
        let count = self.cmd[4] as u32;
        let sectors = self.slots[self.dev_id].img.as_ref().map(|i| i.sectors()).unwrap_or(0);
        self.slots[self.dev_id].lba = sector;
        if sector >= sectors {
            self.set_error(ERROR_INVADDR, true);
            return;
        }
        if sector + count > sectors {
            self.slots[self.dev_id].lba = sectors;
            self.set_error(ERROR_INVADDR, true);
            return;
        }
        self.wait_data(count as usize * SECTOR_BYTES, Transfer::FileWrite);
    }

    fn inquiry(&mut self, logical_drive: bool) {
        let mut data = [0u8; 48];
        data[..8].copy_from_slice(if logical_drive {
            &[0x0a, 0x00, 0x01, 0x00, 0x1f, 0x00, 0x00, 0x00]
        } else {
            &[0x00, 0x00, 0x01, 0x00, 0x1f, 0x00, 0x00, 0x00]
        });
        data[8..16].copy_from_slice(b"stbridge");
        data[16..32]
            .copy_from_slice(if logical_drive { b"GEMDOS Drive    " } else { b"Emulated Disk   " });
        data[32..36].copy_from_slice(b"0100");
        let alloc = ((self.cmd[3] as usize) << 8 | self.cmd[4] as usize).min(48);
        let data = data[..alloc].to_vec();
        self.send_reply(&data);
    }

    /// Mode page 0: block count and block size.
    fn mode_sense_0(&self, out: &mut [u8]) {
        let blocks = self
            .slots[self.dev_id]
            .img
            .as_ref()
            .map(|i| i.sectors())
            .unwrap_or(0)
            .min(0xffffff);
        for b in out[..16].iter_mut() {
            *b = 0;
        }
        out[1] = 14; // remaining bytes
        out[3] = 8;
        out[5] = (blocks >> 16) as u8;
        out[6] = (blocks >> 8) as u8;
        out[7] = blocks as u8;
        out[10] = 2; // sector size 512, middle byte
    }

    /// Mode page 4: rigid drive geometry, factoring the block count into
    /// heads <= 255 and cylinders.
    fn mode_sense_4(&self, out: &mut [u8]) {
        let blocks = self.slots[self.dev_id].img.as_ref().map(|i| i.sectors()).unwrap_or(0);
        let mut heads = 255u32;
        let mut cylinders = 0u32;
        while heads >= 1 {
            cylinders = blocks / heads;
            if cylinders > 0xffffff || blocks % heads == 0 {
                break;
            }
            heads -= 1;
        }
        for b in out[..24].iter_mut() {
            *b = 0;
        }
        out[0] = 4; // page code
        out[1] = 22; // page length
        out[2] = (cylinders >> 16) as u8;
        out[3] = (cylinders >> 8) as u8;
        out[4] = cylinders as u8;
        out[5] = heads as u8;
    }

    fn mode_sense(&mut self) {
        let mut data = [0u8; 48];
        match self.cmd[2] {
            0 => {
                self.mode_sense_0(&mut data);
                let data = data[..16].to_vec();
                self.send_reply(&data);
            }
            4 => {
                self.mode_sense_4(&mut data);
                let data = data[..24].to_vec();
                self.send_reply(&data);
            }
            0x3f => {
                data[0] = 43;
                self.mode_sense_4(&mut data[4..]);
                self.mode_sense_0(&mut data[28..]);
                let data = data[..44].to_vec();
                self.send_reply(&data);
            }
            _ => self.set_error(ERROR_INVARG, false),
        }
    }

    fn read_capacity(&mut self) {
        let lba = self.slots[self.dev_id]
            .img
            .as_ref()
            .map(|i| i.sectors())
            .unwrap_or(0)
            .saturating_sub(1);
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&lba.to_be_bytes());
        data[6] = 2; // block size = 512 bytes
        let data = data.to_vec();
        self.send_reply(&data);
    }

    /// Commands addressed to the logical drive.
    fn gemdos_command(&mut self) {
        match self.cmd[0] {
            CMD_TEST_UNIT_READY => self.set_status(STATUS_OK),
            CMD_REQUEST_SENSE => {
                let length = self.cmd[4] as usize;
                let mut data = vec![0u8; length.max(18)];
                let slot = &self.slots[self.dev_id];
                data[0] = 0x70;
                data[2] = (slot.sense & 0x0f) as u8;
                data[7] = 10;
                data[12] = (slot.sense >> 16) as u8;
                data[13] = (slot.sense >> 8) as u8;
                data.truncate(length);
                self.send_reply(&data);
                self.slots[self.dev_id].clear_sense();
            }
            CMD_READ => {
                // the logical drive serves the embedded boot image
                let lba = u32::from_be_bytes([0, self.cmd[1], self.cmd[2], self.cmd[3]]);
                let count = self.cmd[4] as u32;
                if lba + count > stub::BOOT_SECTORS {
                    self.set_error(ERROR_INVADDR, false);
                } else {
                    let from = lba as usize * SECTOR_BYTES;
                    let to = (lba + count) as usize * SECTOR_BYTES;
                    let data = stub::BOOT_IMAGE[from..to].to_vec();
                    self.send_reply(&data);
                }
            }
            CMD_TUNNEL => self.tunnel_command(),
            CMD_INQUIRY => self.inquiry(true),
            _ => self.set_status(STATUS_OK),
        }
    }

    fn tunnel_command(&mut self) {
        let op = self.cmd[1];
        match op {
            OP_GEMDOS => {
                let opcode = u16::from_be_bytes([self.cmd[2], self.cmd[3]]);
                if TUNNELED_BARE.contains(&opcode) {
                    self.emit(StubEvent::Call { opcode, frame: [0; 16] });
                } else if TUNNELED_WITH_FRAME.contains(&opcode) {
                    self.wait_data(
                        16,
                        Transfer::Capture {
                            data: Vec::new(),
                            expected: 16,
                            kind: CaptureKind::Call { opcode },
                        },
                    );
                } else {
                    // Super, Ptermres, Malloc, Mfree, Mshrink... stay with the ROM
                    debug!(opcode = format_args!("{:#x}", opcode), "GEMDOS call not redirected");
                    self.set_status(STATUS_OK);
                }
            }
            OP_ACTION => self.emit(StubEvent::ActionRequested),
            OP_RESULT => {
                let length = u16::from_be_bytes([self.cmd[2], self.cmd[3]]) as usize;
                self.wait_data(
                    length,
                    Transfer::Capture {
                        data: Vec::new(),
                        expected: length,
                        kind: CaptureKind::Result,
                    },
                );
            }
            _ => self.set_error(ERROR_INVARG, false),
        }
    }
}

impl Default for Slot {
    fn default() -> Slot {
        Slot { img: None, lba: 0, sense: ERROR_OK, report_lba: false }
    }
}
