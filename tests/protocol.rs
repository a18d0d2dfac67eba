// End-to-end exercise of the GEMDOS action-loop protocol: the test plays
// the fabric and the guest-resident stub, the crate provides the transport
// and the worker thread.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempdir::TempDir;

use stbridge::acsi::{AcsiTarget, STATUS_ERROR, STATUS_OK};
use stbridge::config::Config;
use stbridge::fabric::Fabric;
use stbridge::gemdos::GemdosWorker;

const MEM_SIZE: usize = 0x10000;
const POLL: Duration = Duration::from_millis(1);
const DEADLINE: Duration = Duration::from_secs(3);

/* action codes, as the stub sees them */
const ACTION_FALLBACK: u16 = 0;
const ACTION_RETURN: u16 = 1;
const ACTION_RDMEM: u16 = 2;
const ACTION_WRMEM: u16 = 3;
const ACTION_WRMEM0: u16 = 4;
const ACTION_GEMDOS: u16 = 5;
const ACTION_MODSTACK: u16 = 6;

#[derive(Debug, PartialEq)]
enum CallEnd {
    Return(i32),
    Fallback,
    /// The call completed through a WRMEM0 action (returns 0).
    Wrmem0,
}

struct Guest {
    fabric: Arc<Fabric>,
    acsi: Arc<Mutex<AcsiTarget>>,
    mem: Vec<u8>,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    #[allow(dead_code)]
    dir: TempDir,
}

impl Guest {
    fn new() -> Guest {
        let dir = TempDir::new("protocol").unwrap();
        let mut config = Config::default();
        config.gemdos = Some(dir.path().to_path_buf());

        let fabric = Arc::new(Fabric::in_memory());
        let (tx, rx) = sync_channel(4);
        let config = config.shared();
        let acsi = Arc::new(Mutex::new(AcsiTarget::new(
            Arc::clone(&fabric),
            Arc::clone(&config),
            tx,
        )));
        let running = Arc::new(AtomicBool::new(true));
        let worker = GemdosWorker::new(
            Arc::clone(&acsi),
            rx,
            Arc::clone(&config),
            Arc::clone(&running),
        );
        let worker = thread::spawn(move || worker.run());

        Guest {
            fabric,
            acsi,
            mem: vec![0u8; MEM_SIZE],
            running,
            worker: Some(worker),
            dir,
        }
    }

    fn root(&self) -> std::path::PathBuf {
        self.dir.path().to_path_buf()
    }

    fn put_string(&mut self, addr: usize, s: &str) {
        self.mem[addr..addr + s.len()].copy_from_slice(s.as_bytes());
        self.mem[addr + s.len()] = 0;
    }

    fn cmd6(&self, bytes: [u8; 6]) {
        for (i, &b) in bytes.iter().enumerate() {
            let a1 = if i == 0 { 0 } else { 1 << 8 };
            self.fabric.acsi_write(b as u32 | a1);
            self.acsi.lock().unwrap().interrupt();
        }
    }

    fn poll_reg<F: Fn(u32) -> bool>(&self, what: &str, pred: F) -> u32 {
        let start = Instant::now();
        loop {
            let reg = self.fabric.acsi_read();
            if pred(reg) {
                return reg;
            }
            if start.elapsed() > DEADLINE {
                panic!("timed out waiting for {} (reg={:#x})", what, reg);
            }
            thread::sleep(POLL);
        }
    }

    /// Feed a guest-to-host DMA transfer. Consecutive chunk requests flip
    /// the buffer id, so an unchanged register means the transfer is done.
    fn feed(&self, data: &[u8]) {
        let mut pos = 0;
        let mut last_request = u32::MAX;
        loop {
            let reg = self.fabric.acsi_read();
            if reg & 0x200 != 0 && reg != last_request {
                last_request = reg;
                let nbs = (reg >> 3 & 0x1f) as usize + 1;
                let buf = (reg & 1) as usize;
                let mut chunk = vec![0u8; nbs * 16];
                let n = chunk.len().min(data.len().saturating_sub(pos));
                chunk[..n].copy_from_slice(&data[pos..pos + n]);
                pos += n;
                self.fabric.iobuf_write(buf * 512, &chunk);
                self.acsi.lock().unwrap().interrupt();
            } else {
                return;
            }
        }
    }

    /// Harvest a host-to-guest DMA transfer (an action block).
    fn harvest(&self) -> Vec<u8> {
        self.poll_reg("a DMA read request", |reg| reg & 0x100 != 0);
        let mut out = Vec::new();
        let mut last_request = u32::MAX;
        loop {
            let reg = self.fabric.acsi_read();
            if reg & 0x100 != 0 && reg != last_request {
                last_request = reg;
                let nbs = (reg >> 3 & 0x1f) as usize + 1;
                let buf = (reg & 1) as usize;
                let mut chunk = vec![0u8; nbs * 16];
                self.fabric.iobuf_read(buf * 512, &mut chunk);
                out.extend(chunk);
                self.acsi.lock().unwrap().interrupt();
            } else if reg == STATUS_OK {
                return out;
            } else {
                panic!("unexpected register value {:#x} while harvesting", reg);
            }
        }
    }

    /// Send data back through an OP_RESULT command and wait for the host to
    /// acknowledge the command.
    fn send_result(&self, data: &[u8]) {
        let len = data.len() as u16;
        self.cmd6([0x11, 3, (len >> 8) as u8, len as u8, 0, 0]);
        self.feed(data);
        self.poll_reg("result acknowledgement", |reg| reg == STATUS_OK);
    }

    fn read_guest_string(&self, addr: usize) -> Vec<u8> {
        let end = self.mem[addr..].iter().position(|&b| b == 0).unwrap() + addr + 1;
        self.mem[addr..end].to_vec()
    }

    /// Run the stub's action-mode loop until the call terminates.
    fn action_loop(&mut self) -> CallEnd {
        loop {
            self.cmd6([0x11, 2, 0, 0, 0, 0]); // OP_ACTION
            let action = self.harvest();
            let code = u16::from_be_bytes([action[0], action[1]]);
            match code {
                ACTION_FALLBACK => return CallEnd::Fallback,
                ACTION_RETURN => {
                    return CallEnd::Return(i32::from_be_bytes([
                        action[2], action[3], action[4], action[5],
                    ]))
                }
                ACTION_RDMEM => {
                    let addr = u32::from_be_bytes([action[2], action[3], action[4], action[5]])
                        as usize;
                    let n = u16::from_be_bytes([action[6], action[7]]) as usize;
                    let data = if n == 0 {
                        self.read_guest_string(addr)
                    } else {
                        self.mem[addr..addr + n].to_vec()
                    };
                    self.send_result(&data);
                }
                ACTION_WRMEM | ACTION_WRMEM0 => {
                    let addr = u32::from_be_bytes([action[2], action[3], action[4], action[5]])
                        as usize;
                    let n = u16::from_be_bytes([action[6], action[7]]) as usize;
                    self.mem[addr..addr + n].copy_from_slice(&action[8..8 + n]);
                    if code == ACTION_WRMEM0 {
                        return CallEnd::Wrmem0;
                    }
                }
                ACTION_GEMDOS => {
                    let opcode = u16::from_be_bytes([action[4], action[5]]);
                    match opcode {
                        9 => {
                            // Cconws: pretend we printed it
                            self.send_result(&0i32.to_be_bytes());
                        }
                        0x4b => {
                            // Pexec mode 5: hand out a basepage
                            self.send_result(&0x8000u32.to_be_bytes());
                        }
                        other => panic!("stub asked to run GEMDOS {:#x}", other),
                    }
                }
                ACTION_MODSTACK => return CallEnd::Fallback,
                other => panic!("unknown action {:#x}", other),
            }
        }
    }

    /// Issue one GEMDOS call through the tunnel. Returns `None` when the
    /// host lets the ROM handle it.
    fn gemdos_call(&mut self, opcode: u16, frame: Option<[u8; 16]>) -> Option<CallEnd> {
        self.cmd6([0x11, 1, (opcode >> 8) as u8, opcode as u8, 0, 0]);
        let status = if let Some(frame) = frame {
            self.feed(&frame);
            // the register still holds the stale chunk request until the
            // worker decides
            self.poll_reg("the fallback/handle decision", |reg| {
                reg == STATUS_OK || reg == STATUS_ERROR
            })
        } else {
            // the per-byte acknowledgements left STATUS_OK in the register,
            // so only the switch to action mode is observable here; every
            // bare call this test drives does enter action mode
            self.poll_reg("action mode", |reg| reg == STATUS_ERROR)
        };
        if status == STATUS_OK {
            return None;
        }
        Some(self.action_loop())
    }

    fn dta_name(&self, dta_addr: usize) -> String {
        let raw = &self.mem[dta_addr + 30..dta_addr + 44];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn frame_fopen(pname: u32, mode: u16) -> [u8; 16] {
    let mut frame = [0u8; 16];
    frame[2..6].copy_from_slice(&pname.to_be_bytes());
    frame[6..8].copy_from_slice(&mode.to_be_bytes());
    frame
}

#[test]
fn fopen_fread_fseek_fclose() {
    let mut guest = Guest::new();
    let content: Vec<u8> = (0..6000u32).map(|i| (i * 13 + 5) as u8).collect();
    fs::write(guest.root().join("foo.prg"), &content).unwrap();
    guest.put_string(0x1000, "C:\\FOO.PRG");

    // Fopen against a case-variant host name yields a host-owned handle
    let end = guest.gemdos_call(0x3d, Some(frame_fopen(0x1000, 0))).unwrap();
    let handle = match end {
        CallEnd::Return(v) => v,
        other => panic!("unexpected call end {:?}", other),
    };
    assert_eq!(handle, 0x7a00);

    // Fread streams the file into guest memory in WRMEM blocks
    let mut frame = [0u8; 16];
    frame[2..4].copy_from_slice(&(handle as u16).to_be_bytes());
    frame[4..8].copy_from_slice(&(content.len() as u32).to_be_bytes());
    frame[8..12].copy_from_slice(&0x2000u32.to_be_bytes());
    let end = guest.gemdos_call(0x3f, Some(frame)).unwrap();
    assert_eq!(end, CallEnd::Return(content.len() as i32));
    assert_eq!(&guest.mem[0x2000..0x2000 + content.len()], &content[..]);

    // Fseek back to a known offset
    let mut frame = [0u8; 16];
    frame[2..6].copy_from_slice(&100i32.to_be_bytes());
    frame[6..8].copy_from_slice(&(handle as u16).to_be_bytes());
    frame[8..10].copy_from_slice(&0u16.to_be_bytes());
    let end = guest.gemdos_call(0x42, Some(frame)).unwrap();
    assert_eq!(end, CallEnd::Return(100));

    // Fclose releases the handle; a second close is an invalid handle
    let mut frame = [0u8; 16];
    frame[2..4].copy_from_slice(&(handle as u16).to_be_bytes());
    let end = guest.gemdos_call(0x3e, Some(frame)).unwrap();
    assert_eq!(end, CallEnd::Return(0));
    let end = guest.gemdos_call(0x3e, Some(frame)).unwrap();
    assert_eq!(end, CallEnd::Return(-37));
}

#[test]
fn guest_owned_handles_stay_with_the_rom() {
    let mut guest = Guest::new();
    // Fclose on handle 1 (guest-owned) completes without redirection
    let mut frame = [0u8; 16];
    frame[2..4].copy_from_slice(&1u16.to_be_bytes());
    assert_eq!(guest.gemdos_call(0x3e, Some(frame)), None);

    // so does Fwrite: the guest does not fall back to the ROM for its own
    // handles either
    let mut frame = [0u8; 16];
    frame[2..4].copy_from_slice(&1u16.to_be_bytes());
    frame[4..8].copy_from_slice(&16u32.to_be_bytes());
    frame[8..12].copy_from_slice(&0x2000u32.to_be_bytes());
    assert_eq!(guest.gemdos_call(0x40, Some(frame)), None);
}

#[test]
fn fwrite_creates_and_fills_a_file() {
    let mut guest = Guest::new();
    guest.put_string(0x1000, "C:\\OUT.DAT");
    let payload: Vec<u8> = (0..3000u32).map(|i| (i * 31) as u8).collect();
    guest.mem[0x4000..0x4000 + payload.len()].copy_from_slice(&payload);

    let end = guest.gemdos_call(0x3c, Some(frame_fopen(0x1000, 0))).unwrap();
    let handle = match end {
        CallEnd::Return(v) => v,
        other => panic!("unexpected call end {:?}", other),
    };
    assert!(handle >= 0x7a00);

    let mut frame = [0u8; 16];
    frame[2..4].copy_from_slice(&(handle as u16).to_be_bytes());
    frame[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    frame[8..12].copy_from_slice(&0x4000u32.to_be_bytes());
    let end = guest.gemdos_call(0x40, Some(frame)).unwrap();
    assert_eq!(end, CallEnd::Return(payload.len() as i32));

    let mut frame = [0u8; 16];
    frame[2..4].copy_from_slice(&(handle as u16).to_be_bytes());
    assert_eq!(guest.gemdos_call(0x3e, Some(frame)).unwrap(), CallEnd::Return(0));

    assert_eq!(fs::read(guest.root().join("out.dat")).unwrap(), payload);
}

#[test]
fn directory_scan_enumerates_each_entry_once() {
    let mut guest = Guest::new();
    fs::create_dir(guest.root().join("SUBDIR")).unwrap();
    fs::write(guest.root().join("one.txt"), b"1").unwrap();
    fs::write(guest.root().join("two.doc"), b"2").unwrap();
    guest.put_string(0x1000, "C:\\*.*");

    let mut frame = [0u8; 16];
    frame[2..6].copy_from_slice(&0x1000u32.to_be_bytes());
    frame[6..8].copy_from_slice(&0x10u16.to_be_bytes()); // FA_DIR
    let end = guest.gemdos_call(0x4e, Some(frame)).unwrap();
    assert_eq!(end, CallEnd::Wrmem0);

    let mut names = vec![guest.dta_name(0)];
    loop {
        match guest.gemdos_call(0x4f, None).unwrap() {
            CallEnd::Wrmem0 => names.push(guest.dta_name(0)),
            CallEnd::Return(code) => {
                assert_eq!(code, -49); // ENMFIL after the last entry
                break;
            }
            other => panic!("unexpected call end {:?}", other),
        }
    }
    names.sort();
    assert_eq!(names, vec!["ONE.TXT", "SUBDIR", "TWO.DOC"]);

    // the exhausted scan is gone: the next Fsnext falls back to the ROM
    assert_eq!(guest.gemdos_call(0x4f, None).unwrap(), CallEnd::Fallback);
}

#[test]
fn pexec_mode_3_loads_and_relocates() {
    let mut guest = Guest::new();
    // a tiny program: 8 bytes of text with one longword to relocate,
    // 4 bytes of data, 6 bytes of BSS, no symbols
    let mut prg = Vec::new();
    prg.extend_from_slice(&0x601au16.to_be_bytes());
    prg.extend_from_slice(&8u32.to_be_bytes()); // text
    prg.extend_from_slice(&4u32.to_be_bytes()); // data
    prg.extend_from_slice(&6u32.to_be_bytes()); // bss
    prg.extend_from_slice(&0u32.to_be_bytes()); // symbols
    prg.extend_from_slice(&[0u8; 8]); // reserved + flags
    prg.extend_from_slice(&0u16.to_be_bytes()); // relocation present
    prg.extend_from_slice(&[0x20, 0x3c, 0x00, 0x00, 0x00, 0x10, 0x4e, 0x75]); // text
    prg.extend_from_slice(&[1, 2, 3, 4]); // data
    prg.extend_from_slice(&2u32.to_be_bytes()); // first relocation at text+2
    prg.push(0); // end of relocation list
    fs::write(guest.root().join("test.prg"), &prg).unwrap();

    guest.put_string(0x1000, "C:\\TEST.PRG");
    guest.put_string(0x1100, "");
    let mut frame = [0u8; 16];
    frame[2..4].copy_from_slice(&3u16.to_be_bytes()); // mode 3: load, don't go
    frame[4..8].copy_from_slice(&0x1000u32.to_be_bytes());
    frame[8..12].copy_from_slice(&0x1100u32.to_be_bytes());
    let end = guest.gemdos_call(0x4b, Some(frame)).unwrap();
    assert_eq!(end, CallEnd::Return(0x8000));

    let base = 0x8000usize;
    let text = base + 256;
    // section layout recorded in the basepage
    assert_eq!(&guest.mem[base + 8..base + 12], &(text as u32).to_be_bytes());
    assert_eq!(&guest.mem[base + 12..base + 16], &8u32.to_be_bytes());
    // the longword at text+2 was relocated by the text base
    let relocated = u32::from_be_bytes([
        guest.mem[text + 2],
        guest.mem[text + 3],
        guest.mem[text + 4],
        guest.mem[text + 5],
    ]);
    assert_eq!(relocated, 0x10 + text as u32);
    // data follows the text, BSS is cleared
    assert_eq!(&guest.mem[text + 8..text + 12], &[1, 2, 3, 4]);
    assert_eq!(&guest.mem[text + 12..text + 18], &[0u8; 6]);
}

#[test]
fn driver_init_claims_a_free_drive_bit() {
    let mut guest = Guest::new();
    fs::write(guest.root().join("late.txt"), b"x").unwrap();
    // drives A, B and C are taken
    guest.mem[0x4c2..0x4c6].copy_from_slice(&0x7u32.to_be_bytes());

    let mut frame = [0u8; 16];
    frame[0..4].copy_from_slice(&0x20000u32.to_be_bytes()); // driver start
    frame[4..8].copy_from_slice(&0x3000u32.to_be_bytes()); // reserved block
    let end = guest.gemdos_call(0xffff, Some(frame)).unwrap();
    assert_eq!(end, CallEnd::Fallback);
    // drive D: was claimed
    assert_eq!(&guest.mem[0x4c2..0x4c6], &0xfu32.to_be_bytes());

    // and the redirector now answers to D:
    guest.put_string(0x1000, "D:\\LATE.TXT");
    let end = guest.gemdos_call(0x3d, Some(frame_fopen(0x1000, 0))).unwrap();
    match end {
        CallEnd::Return(v) => assert!(v >= 0x7a00),
        other => panic!("unexpected call end {:?}", other),
    }
}

#[test]
fn a_wedged_guest_times_out_and_the_worker_recovers() {
    let mut guest = Guest::new();
    fs::write(guest.root().join("ok.txt"), b"fine").unwrap();
    guest.put_string(0x1000, "C:\\OK.TXT");

    // enter action mode, then never issue OP_ACTION
    guest.cmd6([0x11, 1, 0x00, 0x3d, 0, 0]);
    guest.feed(&frame_fopen(0x1000, 0));
    guest.poll_reg("action mode", |reg| reg == STATUS_ERROR);
    thread::sleep(Duration::from_millis(700));

    // the worker abandoned the call and serves the next one normally
    let end = guest.gemdos_call(0x3d, Some(frame_fopen(0x1000, 0))).unwrap();
    match end {
        CallEnd::Return(v) => assert!(v >= 0x7a00),
        other => panic!("unexpected call end {:?}", other),
    }
}
