// The interrupt pump: a single supervisor thread that blocks on the fabric
// interrupt line, reads the status word and fans out to the handlers. All
// handlers run to completion on this thread; a missed wake loses a DMA
// window and stalls the guest, hence the real-time priority.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::{error, info, warn};

use crate::acsi::AcsiTarget;
use crate::fabric::{Fabric, IrqLine};
use crate::floppy::FloppyHandler;

bitflags! {
    /// Wake condition bits of the fabric status word. Bits 3..=11 are
    /// reserved and must read zero.
    #[derive(Debug, Clone, Copy)]
    pub struct WakeFlags: u32 {
        const FLOPPY = 1 << 0;
        const ACSI_DRQ = 1 << 1;
        const SERIAL = 1 << 2;
    }
}

const RESERVED_BITS: u32 = 0xff8;

/// Bounded poll interval on the interrupt line.
const POLL_MS: i32 = 5;

pub struct Pump {
    pub fabric: Arc<Fabric>,
    pub irq: IrqLine,
    pub acsi: Arc<Mutex<AcsiTarget>>,
    pub floppy: FloppyHandler,
    /// Drain target for guest serial bytes; the bridge itself is out of
    /// scope, the pump only keeps the register serviced.
    pub serial_tap: Option<Sender<u8>>,
    pub running: Arc<AtomicBool>,
}

/// Raise this thread to SCHED_FIFO so the fabric never waits on us.
fn set_realtime_priority() {
    let param = libc::sched_param { sched_priority: 1 };
    let rv = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rv != 0 {
        warn!("could not switch the pump thread to real-time scheduling");
    }
}

impl Pump {
    /// Run until the termination flag is raised. Each wake re-arms the
    /// interrupt mask and services every pending flag before blocking again.
    pub fn run(mut self) {
        set_realtime_priority();

        if let Err(e) = self.irq.rearm() {
            error!("could not arm the fabric interrupt: {}", e);
            return;
        }
        info!("interrupt pump running");

        while self.running.load(Ordering::Relaxed) {
            match self.irq.wait(POLL_MS) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    error!("fabric interrupt wait failed: {}", e);
                    break;
                }
            }
            if let Err(e) = self.irq.rearm() {
                error!("could not re-arm the fabric interrupt: {}", e);
                break;
            }

            let word = self.fabric.status();
            if word & RESERVED_BITS != 0 {
                warn!(word = format_args!("{:08x}", word), "status word read error");
            }
            let flags = WakeFlags::from_bits_truncate(word);

            if flags.contains(WakeFlags::FLOPPY) {
                self.floppy.interrupt(&self.fabric, word);
            }
            if flags.contains(WakeFlags::ACSI_DRQ) {
                self.acsi.lock().unwrap().interrupt();
            }
            if flags.contains(WakeFlags::SERIAL) {
                if let Some(byte) = self.fabric.serial_take() {
                    if let Some(tap) = &self.serial_tap {
                        let _ = tap.send(byte);
                    }
                }
            }
        }
        info!("interrupt pump stopped");
    }
}
