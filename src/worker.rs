//! Running boundary-scan jobs off the caller's thread.
//!
//! A `ScanSession` owns the runtime.  Only one job may use it at a time; a second caller gets
//! `Error::Busy` instead of waiting.  Long netlist scans run on their own thread and stream
//! `ScanEvent`s over a bounded channel.  Events are offered with `try_send`, so a slow consumer
//! loses progress records rather than stalling the scan.  Progress never takes the last free slot,
//! which keeps room for the `Finished` or `Failed` event that ends every stream.
use std::string::ToString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::boundary::BoundaryScan;
use crate::cable::{Cable, CableError};
use crate::error::Error;
use crate::netscan::{self, CancelToken, ScanConfig, ScanContext, ScanOutcome, ScanProgress, ScanStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanEvent {
    Progress(ScanProgress),
    Finished(ScanStatus),
    Failed(std::string::String),
}

// Clears the active flag when the job ends, however it ends.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ScanSession<T> {
    runtime: Arc<Mutex<BoundaryScan<T>>>,
    active: Arc<AtomicBool>,
}

impl<T> Clone for ScanSession<T> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            active: Arc::clone(&self.active),
        }
    }
}

fn lock<T>(runtime: &Mutex<BoundaryScan<T>>) -> MutexGuard<'_, BoundaryScan<T>> {
    // a panicked job leaves the images consistent; the next flush rewrites the hardware
    runtime.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T, U> ScanSession<T>
    where T: core::ops::DerefMut<Target=U> + Send + 'static,
          U: Cable + ?Sized
{
    pub fn new(runtime: BoundaryScan<T>) -> Self {
        Self {
            runtime: Arc::new(Mutex::new(runtime)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a job currently holds the session.
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<ActiveGuard, Error> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(ActiveGuard(Arc::clone(&self.active)))
    }

    /// Run `f` on the caller's thread with exclusive use of the runtime.
    pub fn with_runtime<R>(&self, f: impl FnOnce(&mut BoundaryScan<T>) -> Result<R, Error>) -> Result<R, Error> {
        let _guard = self.acquire()?;
        let mut runtime = lock(&self.runtime);
        f(&mut runtime)
    }

    /// Run `f` on a dedicated thread with exclusive use of the runtime.
    pub fn spawn<R, F>(&self, f: F) -> Result<JoinHandle<Result<R, Error>>, Error>
        where R: Send + 'static,
              F: FnOnce(&mut BoundaryScan<T>) -> Result<R, Error> + Send + 'static
    {
        let guard = self.acquire()?;
        let runtime = Arc::clone(&self.runtime);
        Ok(thread::spawn(move || {
            let _guard = guard;
            let mut runtime = lock(&runtime);
            f(&mut runtime)
        }))
    }

    /// Check `config`, then scan for the netlist on a dedicated thread.
    pub fn start_netlist_scan(&self, config: ScanConfig) -> Result<ScanHandle, Error> {
        config.validate()?;
        let (tx, rx) = bounded(config.progress_capacity);
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let thread = self.spawn(move |runtime| {
            let events = tx.clone();
            let progress = move |p: ScanProgress| offer_progress(&events, p);
            let mut ctx = ScanContext::with_cancel(progress, token);
            let result = netscan::discover_netlist(&mut ctx, runtime, &config);
            match &result {
                Ok(outcome) => offer(&tx, ScanEvent::Finished(outcome.status)),
                Err(e) => offer(&tx, ScanEvent::Failed(e.to_string())),
            }
            result
        })?;
        debug!("netlist scan started");
        Ok(ScanHandle {
            events: rx,
            cancel,
            thread,
        })
    }

    /// Take the runtime back.  Fails with `Busy` while a job or another session clone holds it.
    pub fn into_runtime(self) -> Result<BoundaryScan<T>, Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        match Arc::try_unwrap(self.runtime) {
            Ok(m) => Ok(m.into_inner().unwrap_or_else(|e| e.into_inner())),
            Err(_) => Err(Error::Busy),
        }
    }
}

fn offer(tx: &Sender<ScanEvent>, event: ScanEvent) {
    if tx.try_send(event).is_err() {
        warn!("scan event dropped");
    }
}

fn offer_progress(tx: &Sender<ScanEvent>, progress: ScanProgress) {
    if tx.capacity().is_some_and(|cap| tx.len() + 1 >= cap) {
        debug!(index = progress.index, "progress record dropped");
        return;
    }
    offer(tx, ScanEvent::Progress(progress));
}

/// A netlist scan running on its own thread.
pub struct ScanHandle {
    events: Receiver<ScanEvent>,
    cancel: CancelToken,
    thread: JoinHandle<Result<ScanOutcome, Error>>,
}

impl ScanHandle {
    pub fn events(&self) -> &Receiver<ScanEvent> {
        &self.events
    }

    /// Ask the scan to stop after the current driver.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the scan.  A panic on the worker thread is reported as a transport error.
    pub fn join(self) -> Result<ScanOutcome, Error> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(CableError::Io("scan worker panicked".to_string()).into()),
        }
    }
}
