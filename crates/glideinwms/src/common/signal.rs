use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::sync::Notify;

use crate::common::error::GwmsError;

/// Interruption requested by a signal (or by the parent disappearing).
#[derive(Clone, Default)]
pub struct Interruption {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Interruption {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> crate::Result<()> {
        if self.is_interrupted() {
            Err(GwmsError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `future` unless an interruption arrives first.
    pub async fn guard<F: Future>(&self, future: F) -> crate::Result<F::Output> {
        self.check()?;
        tokio::select! {
            result = future => Ok(result),
            _ = self.wait() => Err(GwmsError::Interrupted),
        }
    }
}

/// Turns SIGTERM, SIGINT and SIGQUIT into an [`Interruption`].
pub struct SignalThread {
    signal_thread: Option<std::thread::JoinHandle<()>>,
    signal_handle: signal_hook::iterator::Handle,
}

impl SignalThread {
    pub fn new(interruption: Interruption) -> crate::Result<Self> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT])?;
        let signal_handle = signals.handle();
        let signal_thread = std::thread::spawn(move || {
            for signal in &mut signals {
                log::debug!("Received signal {signal}");
                interruption.interrupt();
            }
        });
        Ok(Self {
            signal_handle,
            signal_thread: Some(signal_thread),
        })
    }
}

impl Drop for SignalThread {
    fn drop(&mut self) {
        self.signal_handle.close();
        if let Some(thread) = self.signal_thread.take() {
            if thread.join().is_err() {
                log::error!("Signal thread crashed");
            }
        }
    }
}
