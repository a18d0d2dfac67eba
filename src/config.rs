use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Guest memory size setting, as understood by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSize {
    M256K,
    M512K,
    M1M,
    M2M,
    M2_5M,
    M4M,
    M8M,
    M14M,
}

/// Runtime configuration shared between the UI side and the handlers.
///
/// Handlers never cache values across commands: the image paths and the
/// monitor/memory options may be rewritten at any time by the UI thread,
/// so every command re-reads through the lock.
#[derive(Debug, Clone)]
pub struct Config {
    // main
    pub mono: bool,
    pub extended_video_modes: bool,
    pub turbo: bool,
    pub mem_size: MemSize,
    pub wakestate: u8,
    pub rom_file: Option<PathBuf>,
    /// UTC offset in hours, -12..=12.
    pub timezone: i32,
    pub keymap_id: u8,

    // floppy
    pub floppy_a: Option<PathBuf>,
    pub floppy_a_enable: bool,
    pub floppy_a_write_protect: bool,
    pub floppy_b: Option<PathBuf>,
    pub floppy_b_enable: bool,
    pub floppy_b_write_protect: bool,

    // hard disk
    pub acsi: [Option<PathBuf>; 8],
    /// Host directory served as the GEMDOS drive.
    pub gemdos: Option<PathBuf>,
}

pub type SharedConfig = Arc<RwLock<Config>>;

impl Default for Config {
    fn default() -> Config {
        Config {
            mono: false,
            extended_video_modes: false,
            turbo: false,
            mem_size: MemSize::M1M,
            wakestate: 2,
            rom_file: None,
            timezone: 0,
            keymap_id: 3,
            floppy_a: None,
            floppy_a_enable: true,
            floppy_a_write_protect: false,
            floppy_b: None,
            floppy_b_enable: false,
            floppy_b_write_protect: false,
            acsi: Default::default(),
            gemdos: None,
        }
    }
}

impl Config {
    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn floppy_path(&self, drive: usize) -> Option<&PathBuf> {
        match drive {
            0 => self.floppy_a.as_ref(),
            _ => self.floppy_b.as_ref(),
        }
    }

    pub fn floppy_write_protect(&self, drive: usize) -> bool {
        match drive {
            0 => self.floppy_a_write_protect,
            _ => self.floppy_b_write_protect,
        }
    }
}
