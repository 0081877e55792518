use super::{ContextId, Job, OwnerContext};
use crate::error::bug_on;
use crate::util::{lock, panic_message};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Owner context backed by a dedicated OS thread draining a FIFO channel
pub struct Dispatcher {
    id: ContextId,
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn a new dispatcher thread with the given name
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Arc<Self>> {
        let name = name.into();
        let id = ContextId::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            CURRENT_CONTEXT.with(|current| current.set(Some(id)));
            debug!(context = %id, "Dispatcher '{}' started", thread_name);

            while let Some(job) = rx.blocking_recv() {
                // Panicking jobs are logged and skipped.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!(
                        context = %id,
                        "Job posted to '{}' panicked: {}",
                        thread_name,
                        panic_message(payload.as_ref())
                    );
                }
            }

            debug!(context = %id, "Dispatcher '{}' stopped", thread_name);
        })?;

        info!(context = %id, "Spawned dispatcher '{}'", name);
        Ok(Arc::new(Self {
            id,
            name,
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(handle)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the dispatcher still accepts jobs
    pub fn is_running(&self) -> bool {
        lock(&self.tx).as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Wait until every job posted before this call has run.
    ///
    /// Returns `false` if the dispatcher is shut down.
    pub async fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if !self.post(Box::new(move || {
            let _ = done_tx.send(());
        })) {
            return false;
        }
        done_rx.await.is_ok()
    }

    /// Blocking variant of [`flush`](Self::flush) for synchronous callers.
    ///
    /// Must not be called from the dispatcher thread itself or from inside an
    /// async runtime.
    pub fn flush_blocking(&self) -> bool {
        bug_on!(
            !self.is_current(),
            "flush_blocking called on dispatcher '{}' itself",
            self.name
        );
        let (done_tx, done_rx) = oneshot::channel();
        if !self.post(Box::new(move || {
            let _ = done_tx.send(());
        })) {
            return false;
        }
        done_rx.blocking_recv().is_ok()
    }

    /// Stop accepting jobs, drain the queue and join the thread.
    ///
    /// When called from the dispatcher thread the join is skipped.
    pub fn shutdown(&self) {
        let tx = lock(&self.tx).take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        if self.is_current() {
            return;
        }
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                warn!(context = %self.id, "Dispatcher '{}' thread panicked", self.name);
            }
        }
        info!(context = %self.id, "Dispatcher '{}' shut down", self.name);
    }
}

impl OwnerContext for Dispatcher {
    fn id(&self) -> ContextId {
        self.id
    }

    fn is_current(&self) -> bool {
        CURRENT_CONTEXT.with(|current| current.get() == Some(self.id))
    }

    fn post(&self, job: Job) -> bool {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
