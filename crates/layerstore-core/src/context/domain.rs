//! Confinement domains
//!
//! A domain is a named worker thread that runs submitted jobs one at a time,
//! in submission order. Every working context owns one, and all of the
//! context's state is touched only from jobs running on it.
//!
//! The thread exits once the last handle to the domain is dropped and its
//! queue has drained.

use std::sync::mpsc;
use std::thread::{self, ThreadId};

use tracing::trace;

use crate::error::ContextError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a serial worker thread
pub(crate) struct Domain {
    name: String,
    sender: mpsc::Sender<Job>,
    thread: ThreadId,
}

impl Domain {
    /// Start a new domain thread called `name`
    pub(crate) fn spawn(name: impl Into<String>) -> Result<Self, ContextError> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver {
                    job();
                }
                trace!("Domain '{}' drained and stopped", thread_name);
            })
            .map_err(|source| ContextError::DomainSpawn {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            sender,
            thread: handle.thread().id(),
        })
    }

    /// Whether the calling thread is this domain's thread
    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queue `job` and return immediately
    pub(crate) fn dispatch<F>(&self, job: F) -> Result<(), ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(job))
            .map_err(|_| ContextError::DomainClosed(self.name.clone()))
    }

    /// Run `job` on the domain and block until it returns
    ///
    /// Runs inline when already on the domain, so nested calls from a job
    /// don't deadlock on their own queue.
    pub(crate) fn dispatch_and_wait<F, R>(&self, job: F) -> Result<R, ContextError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.dispatch(move || {
            // Ignore send error: the waiter only goes away if it panicked
            let _ = reply_tx.send(job());
        })?;
        reply_rx
            .recv()
            .map_err(|_| ContextError::DomainClosed(self.name.clone()))
    }
}
