use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use stbridge::config::Config;
use stbridge::fabric::Fabric;
use stbridge::Host;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn main() {
    tracing_subscriber::fmt::init();

    // stbridged [uio-device] [floppy-a-image]
    let mut args = env::args().skip(1);
    let uio = args.next().unwrap_or_else(|| "/dev/uio0".to_string());

    let mut config = Config::default();
    if let Some(floppy_a) = args.next() {
        config.floppy_a = Some(floppy_a.into());
    }

    let (fabric, irq) = match Fabric::open(&uio) {
        Ok(pair) => pair,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let handler: extern "C" fn(libc::c_int) = on_signal;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let host = Host::init(config, fabric, irq, None);
    info!("host running on {}", uio);

    while !STOP.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    host.exit();
}
