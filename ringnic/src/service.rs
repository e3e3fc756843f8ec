//! The per-device service thread: reset worker plus the transmit watchdog
//! and slow-fill timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::error::Error;
use crate::nic::NicInner;

pub(crate) struct ServiceHandle {
    shutdown_flag: Arc<AtomicBool>,
    kick: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl ServiceHandle {
    pub(crate) fn shutdown(self) {
        self.shutdown_flag.store(true, Ordering::Release);
        let _ = self.kick.try_send(());
        if self.handle.join().is_err() {
            warn!("service thread panicked");
        }
    }
}

/// Start the service thread. `kick` is signalled whenever a reset is
/// requested; timers run every `tick`.
pub(crate) fn spawn(
    nic: Weak<NicInner>,
    kicked: Receiver<()>,
    kick: Sender<()>,
    tick: Duration,
) -> Result<ServiceHandle, Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown_flag);
    let handle = thread::Builder::new()
        .name("ringnic-service".to_string())
        .spawn(move || run(nic, kicked, tick, flag))
        .map_err(Error::Io)?;
    Ok(ServiceHandle {
        shutdown_flag,
        kick,
        handle,
    })
}

fn run(nic: Weak<NicInner>, kicked: Receiver<()>, tick: Duration, shutdown_flag: Arc<AtomicBool>) {
    let mut next_tick = Instant::now() + tick;
    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match kicked.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shutdown_flag.load(Ordering::Acquire) {
            break;
        }
        let Some(nic) = nic.upgrade() else {
            break;
        };
        let done = nic.process_resets();
        if !done.is_empty() {
            debug!("service: executed resets {done:?}");
        }
        let now = Instant::now();
        if now >= next_tick {
            nic.run_timers(now);
            next_tick = now + tick;
        }
    }
}
