//! Per-channel poller threads.
//!
//! One thread per channel waits for its interrupt, then polls until a pass
//! finishes under budget (which re-arms the event queue) and goes back to
//! waiting.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::interrupt::IrqHandler;
use crate::nic::NicInner;

/// Running pollers of one device.
pub(crate) struct Pollers {
    shutdown_flag: Arc<AtomicBool>,
    irq: IrqHandler,
    wakers: Vec<Sender<()>>,
    handles: Vec<thread::JoinHandle<Result<(), Error>>>,
}

impl Pollers {
    /// Signal every poller to exit and wait for them.
    pub(crate) fn shutdown(self) {
        self.shutdown_flag.store(true, Ordering::Release);
        for (channel, waker) in self.wakers.iter().enumerate() {
            self.irq.set_waker(channel, None);
            // Wake pollers blocked waiting for an interrupt.
            let _ = waker.try_send(());
        }
        for h in self.handles {
            match h.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("poller exited with error: {e}"),
                Err(_) => warn!("poller panicked"),
            }
        }
    }
}

pub(crate) fn spawn_pollers(
    nic: Weak<NicInner>,
    irq: &IrqHandler,
    n_channels: usize,
    config: &Config,
) -> Result<Pollers, Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let mut pollers = Pollers {
        shutdown_flag: Arc::clone(&shutdown_flag),
        irq: irq.clone(),
        wakers: Vec::with_capacity(n_channels),
        handles: Vec::with_capacity(n_channels),
    };

    for channel in 0..n_channels {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let nic = nic.clone();
        let poll_irq = irq.clone();
        let shutdown_flag = Arc::clone(&shutdown_flag);
        let budget = config.napi_budget;
        let pin = config.worker.pin_to_core.then_some(config.worker.core_offset + channel);

        irq.set_waker(channel, Some(tx.clone()));
        // First pass picks up events raised before the waker was registered.
        let _ = tx.try_send(());
        pollers.wakers.push(tx);
        let spawned = thread::Builder::new()
            .name(format!("ringnic-poll-{channel}"))
            .spawn(move || {
                if let Some(core) = pin {
                    pin_to_core(core)?;
                }
                crate::counter::set_thread_shard(channel);
                run_poller(channel, budget, nic, poll_irq, rx, shutdown_flag);
                Ok(())
            });
        match spawned {
            Ok(handle) => pollers.handles.push(handle),
            Err(e) => {
                pollers.shutdown();
                return Err(Error::Io(e));
            }
        }
    }
    debug!("started {n_channels} pollers");
    Ok(pollers)
}

fn run_poller(
    channel: usize,
    budget: usize,
    nic: Weak<NicInner>,
    irq: IrqHandler,
    wake: Receiver<()>,
    shutdown_flag: Arc<AtomicBool>,
) {
    while !shutdown_flag.load(Ordering::Acquire) {
        if wake.recv().is_err() || shutdown_flag.load(Ordering::Acquire) {
            break;
        }
        let Some(nic) = nic.upgrade() else {
            break;
        };
        irq.take_pending(channel);
        loop {
            match nic.poll(channel, budget) {
                Ok(spent) if spent >= budget && !shutdown_flag.load(Ordering::Acquire) => continue,
                Ok(_) => break,
                Err(e) => {
                    warn!("ch{channel}: poll failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}
