//! Save propagation
//!
//! Tier 1 flushes main into private on main's domain while the caller waits.
//! Tier 2 flushes private into the store on private's domain and does not
//! hold the caller up. Each tier reports its own outcome.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use super::{PersistenceStack, StackState};
use crate::context::WorkingContext;
use crate::error::{ContextError, SaveError, Tier};

/// Outcome of one tier-2 flush, once it has run
enum StoreFlush {
    Pending(oneshot::Receiver<Result<(), SaveError>>),
    Settled(Result<(), SaveError>),
}

/// Results of a [`PersistenceStack::flush`]
///
/// The main-tier result is known when `flush` returns; the store result
/// arrives once private's domain has run the commit.
pub struct SaveReceipt {
    main: Result<(), SaveError>,
    store: StoreFlush,
}

impl SaveReceipt {
    /// Outcome of saving main into private
    pub fn main_result(&self) -> Result<(), &SaveError> {
        self.main.as_ref().map(|_| ())
    }

    /// Wait for the commit to the store
    pub async fn store_result(self) -> Result<(), SaveError> {
        match self.store {
            StoreFlush::Settled(result) => result,
            StoreFlush::Pending(rx) => rx.await.unwrap_or_else(|_| Err(domain_closed())),
        }
    }

    /// Blocking variant of [`store_result`](Self::store_result)
    ///
    /// Must not be called from within an async runtime.
    pub fn wait_store_blocking(self) -> Result<(), SaveError> {
        match self.store {
            StoreFlush::Settled(result) => result,
            StoreFlush::Pending(rx) => rx.blocking_recv().unwrap_or_else(|_| Err(domain_closed())),
        }
    }
}

fn domain_closed() -> SaveError {
    SaveError::new(
        Tier::Private,
        ContextError::DomainClosed("private".to_string()),
    )
}

/// Save `ctx` into its upstream if it has anything pending
fn save_if_changed(ctx: &WorkingContext) -> Result<(), ContextError> {
    if ctx.has_changes() {
        ctx.save()
    } else {
        Ok(())
    }
}

/// Fail a tier up front unless the stack is ready
fn ensure_ready(state: &StackState, tier: Tier) -> Result<(), SaveError> {
    if state.is_ready() {
        Ok(())
    } else {
        Err(SaveError::new(
            tier,
            ContextError::NotReady {
                state: state.name(),
            },
        ))
    }
}

impl PersistenceStack {
    /// Persist pending changes: main into private, then private into the store
    ///
    /// Returns once main has been flushed. `on_error` is called for each tier
    /// that fails: at most once for main (before this returns) and at most
    /// once for private (later, from private's domain). A main-tier error is
    /// always reported before the private tier is queued. Failed changes stay
    /// pending in the context that held them.
    pub fn save_changes<F>(&self, on_error: F)
    where
        F: Fn(SaveError) + Send + Sync + 'static,
    {
        let on_error = Arc::new(on_error);
        let state = self.state();

        if let Err(e) = self.save_main(&state) {
            on_error(e);
        }

        let report = Arc::clone(&on_error);
        let queued = self.queue_store(&state, move |result| {
            if let Err(e) = result {
                report(e);
            }
        });
        if let Err(e) = queued {
            on_error(e);
        }
    }

    /// Like [`save_changes`](Self::save_changes), but hands back both results
    pub fn flush(&self) -> SaveReceipt {
        let state = self.state();
        let main = self.save_main(&state);

        let (tx, rx) = oneshot::channel();
        let queued = self.queue_store(&state, move |result| {
            // Receiver dropped means nobody wants the result
            let _ = tx.send(result);
        });

        let store = match queued {
            Ok(()) => StoreFlush::Pending(rx),
            Err(e) => StoreFlush::Settled(Err(e)),
        };
        SaveReceipt { main, store }
    }

    /// Tier 1: save main into private on main's domain and wait
    fn save_main(&self, state: &StackState) -> Result<(), SaveError> {
        ensure_ready(state, Tier::Main)?;
        self.main
            .perform_and_wait(save_if_changed)
            .and_then(|result| result)
            .map_err(|e| SaveError::new(Tier::Main, e))
    }

    /// Tier 2: queue the commit of private into the store
    ///
    /// `complete` receives the commit's outcome on private's domain. An error
    /// here means the job was never queued and `complete` will not run.
    fn queue_store<C>(&self, state: &StackState, complete: C) -> Result<(), SaveError>
    where
        C: FnOnce(Result<(), SaveError>) + Send + 'static,
    {
        ensure_ready(state, Tier::Private)?;
        self.private
            .perform(move |ctx| {
                let result = save_if_changed(ctx).map_err(|e| SaveError::new(Tier::Private, e));
                if result.is_ok() {
                    debug!("Private context flushed to store");
                }
                complete(result);
            })
            .map_err(|e| SaveError::new(Tier::Private, e))
    }
}
