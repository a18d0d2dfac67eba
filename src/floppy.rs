// Floppy drive emulation. The fabric cycles through the simulated magnetic
// track on its own; the host's job is to keep the 16-byte track window
// staged ahead of the read position and to commit written-back windows into
// the raw image, two positions behind the current one to match the fabric's
// pipeline depth.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::fabric::Fabric;
use crate::flopimg::{FlopImg, MAXTRACK, TRACK_BYTES};

/// Highest value of the 9-bit window position: 6250 bytes / 16 per window.
const LAST_WINDOW_POS: u32 = (TRACK_BYTES / 16) as u32;

/// Decoded floppy status word.
#[derive(Debug, Clone, Copy)]
pub struct FloppyStatus {
    pub reading: bool,
    pub writing: bool,
    pub pos: u32,
    pub track: u32,
    pub side: u32,
    pub drive: usize,
}

impl FloppyStatus {
    pub fn decode(word: u32) -> FloppyStatus {
        FloppyStatus {
            reading: word >> 31 != 0,
            writing: word >> 30 & 1 != 0,
            pos: word >> 21 & 0x1ff,
            track: word >> 14 & 0x7f,
            side: word >> 13 & 1,
            drive: (word >> 12 & 1) as usize,
        }
    }
}

struct DriveSlot {
    img: Option<FlopImg>,
    path: Option<PathBuf>,
}

/// The two floppy drives and their loaded images. Locked by both the
/// interrupt handler and the hot-swap caller; critical sections are the
/// 16-byte staging copies.
pub struct FloppyEngine {
    drives: Mutex<[DriveSlot; 2]>,
}

impl FloppyEngine {
    pub fn new() -> Arc<FloppyEngine> {
        Arc::new(FloppyEngine {
            drives: Mutex::new([
                DriveSlot { img: None, path: None },
                DriveSlot { img: None, path: None },
            ]),
        })
    }

    /// Change or eject the floppy disk in a drive. Passing `None` ejects.
    /// Loading the path that is already loaded does nothing.
    pub fn change_floppy(&self, drive: usize, path: Option<&Path>, write_protect: bool) {
        let mut drives = self.drives.lock().unwrap();
        let slot = &mut drives[drive];
        if slot.path.as_deref() == path {
            // same file, do nothing
            return;
        }
        // old image syncs to disk on drop
        slot.img = None;
        slot.path = None;
        if let Some(path) = path {
            match FlopImg::open(path, write_protect, 3, 1) {
                Ok(img) => {
                    slot.img = Some(img);
                    slot.path = Some(path.to_path_buf());
                }
                Err(e) => warn!("error opening floppy image file `{}`: {}", path.display(), e),
            }
        }
    }

    /// Flush dirty images back to their files. Called periodically and on
    /// shutdown.
    pub fn sync_all(&self) {
        let mut drives = self.drives.lock().unwrap();
        for slot in drives.iter_mut() {
            if let Some(img) = slot.img.as_mut() {
                if let Err(e) = img.sync() {
                    warn!("floppy writeback failed: {}", e);
                }
            }
        }
    }

}

#[derive(Clone, Copy, Default)]
struct WindowRef {
    drive: usize,
    track: usize,
    side: usize,
    pos: usize,
    count: usize,
}

/// Interrupt-side state of the floppy handler. Owned by the pump thread;
/// mirrors the fabric's own two-deep read pipeline with a three-deep FIFO
/// so a write commit lands on the window that was visible two positions
/// ago.
pub struct FloppyHandler {
    engine: Arc<FloppyEngine>,
    fifo: [WindowRef; 3],
    oldaddr: u32,
    oldin: u32,
}

impl FloppyHandler {
    pub fn new(engine: Arc<FloppyEngine>) -> FloppyHandler {
        FloppyHandler { engine, fifo: [WindowRef::default(); 3], oldaddr: 2000, oldin: 0 }
    }

    pub fn interrupt(&mut self, fabric: &Fabric, word: u32) {
        let st = FloppyStatus::decode(word);

        if st.pos == self.oldaddr {
            return;
        }
        let newaddr = if self.oldaddr == LAST_WINDOW_POS { 0 } else { self.oldaddr + 1 };
        if self.oldaddr <= LAST_WINDOW_POS && st.pos != newaddr {
            warn!(
                expected = newaddr,
                got = st.pos,
                oldin = format_args!("{:08x}", self.oldin),
                input = format_args!("{:08x}", word),
                "missed floppy interrupt"
            );
        }
        self.oldin = word;
        self.oldaddr = st.pos;

        if st.track as usize >= MAXTRACK {
            warn!(track = st.track, "floppy track out of range");
            return;
        }

        // critical section so the image is not swapped out during access
        let engine = Arc::clone(&self.engine);
        let mut drives = engine.drives.lock().unwrap();

        if !st.reading {
            return;
        }
        self.fifo[2] = self.fifo[1];
        self.fifo[1] = self.fifo[0];

        let mut pos = (st.pos as usize) * 16 + 16;
        if pos >= TRACK_BYTES {
            pos = 0;
        }
        let count = if pos < TRACK_BYTES - 10 { 16 } else { 10 };
        if let Some(img) = drives[st.drive].img.as_mut() {
            let trk = img.track_mut(st.track as usize, st.side as usize);
            fabric.track_window_write(&trk[pos..pos + count]);
            self.fifo[0] = WindowRef {
                drive: st.drive,
                track: st.track as usize,
                side: st.side as usize,
                pos,
                count,
            };
        } else {
            self.fifo[0] = WindowRef::default();
        }

        if st.writing {
            let wr = self.fifo[2];
            if wr.count > 0 {
                if let Some(img) = drives[wr.drive].img.as_mut() {
                    let mut window = [0u8; 16];
                    fabric.track_window_read(&mut window[..wr.count]);
                    let trk = img.track_mut(wr.track, wr.side);
                    trk[wr.pos..wr.pos + wr.count].copy_from_slice(&window[..wr.count]);
                    img.mark_dirty();
                    debug!(
                        drive = wr.drive,
                        track = wr.track,
                        side = wr.side,
                        pos = wr.pos,
                        "floppy write committed"
                    );
                }
            }
        }
    }
}
