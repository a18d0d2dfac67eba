use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::info;

pub mod acsi;
pub mod config;
pub mod dospath;
pub mod error;
pub mod fabric;
pub mod flopimg;
pub mod floppy;
pub mod gemdos;
pub mod pump;
pub mod stub;

use acsi::AcsiTarget;
use config::{Config, SharedConfig};
use fabric::{Fabric, IrqLine};
use floppy::{FloppyEngine, FloppyHandler};
use gemdos::GemdosWorker;
use pump::Pump;

/// Interval of the periodic floppy writeback thread.
const WRITEBACK_PERIOD: Duration = Duration::from_secs(2);

/// The host side of the machine: the interrupt pump, the ACSI target with
/// its GEMDOS worker, and the floppy engine, wired to one fabric window.
pub struct Host {
    config: SharedConfig,
    fabric: Arc<Fabric>,
    acsi: Arc<Mutex<AcsiTarget>>,
    floppy: Arc<FloppyEngine>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Host {
    /// Bring up all handlers and start their threads.
    pub fn init(
        config: Config,
        fabric: Fabric,
        irq: IrqLine,
        serial_tap: Option<Sender<u8>>,
    ) -> Host {
        let config = config.shared();
        let fabric = Arc::new(fabric);
        let running = Arc::new(AtomicBool::new(true));

        let (events_tx, events_rx) = sync_channel(4);
        let acsi = Arc::new(Mutex::new(AcsiTarget::new(
            Arc::clone(&fabric),
            Arc::clone(&config),
            events_tx,
        )));

        let floppy = FloppyEngine::new();
        {
            let cfg = config.read().unwrap();
            for drive in 0..2 {
                if cfg.floppy_path(drive).is_some() {
                    floppy.change_floppy(
                        drive,
                        cfg.floppy_path(drive).map(|p| p.as_path()),
                        cfg.floppy_write_protect(drive),
                    );
                }
            }
        }

        let mut threads = Vec::new();

        let worker = GemdosWorker::new(
            Arc::clone(&acsi),
            events_rx,
            Arc::clone(&config),
            Arc::clone(&running),
        );
        threads.push(thread::spawn(move || worker.run()));

        let pump = Pump {
            fabric: Arc::clone(&fabric),
            irq,
            acsi: Arc::clone(&acsi),
            floppy: FloppyHandler::new(Arc::clone(&floppy)),
            serial_tap,
            running: Arc::clone(&running),
        };
        threads.push(thread::spawn(move || pump.run()));

        let sync_engine = Arc::clone(&floppy);
        let sync_running = Arc::clone(&running);
        threads.push(thread::spawn(move || {
            while sync_running.load(Ordering::Relaxed) {
                thread::sleep(WRITEBACK_PERIOD);
                sync_engine.sync_all();
            }
        }));

        Host { config, fabric, acsi, floppy, running, threads }
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Replace or eject the image of one ACSI slot.
    pub fn change_image(&self, slot: usize, path: Option<&Path>) {
        self.config.write().unwrap().acsi[slot] = path.map(|p| p.to_path_buf());
        self.acsi.lock().unwrap().change_image(slot, path);
    }

    /// Change or eject a floppy disk.
    pub fn change_floppy(&self, drive: usize, path: Option<&Path>) {
        let write_protect = {
            let mut cfg = self.config.write().unwrap();
            match drive {
                0 => cfg.floppy_a = path.map(|p| p.to_path_buf()),
                _ => cfg.floppy_b = path.map(|p| p.to_path_buf()),
            }
            cfg.floppy_write_protect(drive)
        };
        self.floppy.change_floppy(drive, path, write_protect);
    }

    /// Pulse the fabric reset line and reload the block device images.
    pub fn cold_reset(&self) {
        info!("cold reset");
        self.fabric.set_reset(true);
        let paths = self.config.read().unwrap().acsi.clone();
        {
            let mut acsi = self.acsi.lock().unwrap();
            for (slot, path) in paths.iter().enumerate() {
                acsi.change_image(slot, path.as_deref());
            }
        }
        thread::sleep(Duration::from_millis(10));
        self.fabric.set_reset(false);
    }

    /// Pulse the fabric reset line, leaving all host state in place.
    pub fn warm_reset(&self) {
        info!("warm reset");
        self.fabric.set_reset(true);
        thread::sleep(Duration::from_millis(10));
        self.fabric.set_reset(false);
    }

    /// Signal all threads to stop. In-flight commands complete first; the
    /// pump drops out of its poll after the current wake.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn stopping(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
    }

    /// Stop all threads and flush pending floppy writebacks.
    pub fn exit(mut self) {
        self.request_stop();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.floppy.sync_all();
        info!("host stopped");
    }
}
