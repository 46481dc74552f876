//! Inter-task plumbing: bounded FIFO queue helpers and the shared
//! flags/signal that are the only shared mutable state between components.
//!
//! Each logical queue named in SPEC_FULL.md §2 is a plain
//! `tokio::sync::mpsc` channel of capacity [`QUEUE_MAX_SIZE`]; the sending
//! half and receiving half are handed to the two tasks they connect when
//! `main` wires the system together. No component reaches into another's
//! internal fields — they only exchange values through these channels and
//! observe the flags below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

/// Capacity of every bounded queue in the system.
pub const QUEUE_MAX_SIZE: usize = 32;
/// Poll timeout used by every task's receive loop.
pub const QUEUE_TIMEOUT_MS: u64 = 100;
/// Watchdog: force process exit if tasks haven't joined within this long of
/// `kill_threads` being raised.
pub const T_QUIT_SECS: u64 = 60;

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;

pub fn bounded<T>() -> (Sender<T>, Receiver<T>) {
    mpsc::channel(QUEUE_MAX_SIZE)
}

/// An observable boolean flag with `wait`/`signal` semantics, standing in
/// for `threading.Event` in the original. Cloning shares the same flag.
#[derive(Clone)]
pub struct Flag {
    state: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Flag {
    pub fn new(initial: bool) -> Self {
        Self {
            state: Arc::new(AtomicBool::new(initial)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.state.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.state.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolve once the flag becomes set (or immediately if already set).
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

/// Process-wide signals: `modem_online` gates the file-channel connection,
/// `kill_threads` tells every task to exit its loop, `kill_request` is
/// raised by `KILL` or a fatal error to trigger the shutdown sequence.
#[derive(Clone)]
pub struct Signals {
    pub modem_online: Flag,
    pub kill_threads: Flag,
    pub kill_request: Flag,
}

impl Signals {
    pub fn new(file_transfer_enabled: bool) -> Self {
        Self {
            modem_online: Flag::new(file_transfer_enabled),
            kill_threads: Flag::new(false),
            kill_request: Flag::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flag_wait_resolves_after_set() {
        let flag = Flag::new(false);
        let waiter = flag.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        flag.set();
        handle.await.unwrap();
    }

    #[test]
    fn flag_wait_returns_immediately_if_already_set() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let flag = Flag::new(true);
            flag.wait().await;
        });
    }
}
