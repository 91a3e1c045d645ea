//! One-shot initialization worker
//!
//! Opens the store off the caller's thread, binds it to the private context,
//! seeds fresh stores through the main context, then settles the stack state
//! and posts exactly one notification.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::state::{advance, StackState};
use super::Seeder;
use crate::config::Config;
use crate::context::WorkingContext;
use crate::error::InitError;
use crate::model::ModelSource;
use crate::notification::{Notification, NotificationCenter};
use crate::storage::StoreOpener;

const WORKER_NAME: &str = "layerstore-init";

pub(crate) struct Sequencer {
    pub stack: Uuid,
    pub identifier: String,
    pub config: Config,
    pub models: Arc<dyn ModelSource>,
    pub seeder: Option<Arc<dyn Seeder>>,
    pub notifications: NotificationCenter,
    pub private: WorkingContext,
    pub main: WorkingContext,
    pub state: watch::Sender<StackState>,
}

impl Sequencer {
    /// Move to `Opening` and start the worker thread
    pub(crate) fn start(self) -> io::Result<JoinHandle<()>> {
        advance(&self.state, StackState::Opening);
        thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        match self.initialize() {
            Ok(preexisting) => {
                advance(&self.state, StackState::Ready { preexisting });
                info!(
                    "Stack for '{}' is ready (preexisting={})",
                    self.identifier, preexisting
                );
                self.notifications.post(Notification::Initialized {
                    stack: self.stack,
                    model: self.identifier.clone(),
                    preexisting,
                });
            }
            Err(e) => {
                error!("Stack for '{}' failed to initialize: {}", self.identifier, e);
                let error = Arc::new(e);
                advance(&self.state, StackState::Failed(Arc::clone(&error)));
                self.notifications.post(Notification::InitializationFailed {
                    stack: self.stack,
                    model: self.identifier.clone(),
                    error,
                });
            }
        }
    }

    /// Returns whether the store already existed
    fn initialize(&self) -> Result<bool, InitError> {
        let opened = StoreOpener::new(&self.config, self.models.as_ref()).open(&self.identifier)?;
        let preexisting = opened.preexisting;
        self.private.bind_store(opened.store)?;

        if !preexisting {
            advance(&self.state, StackState::Seeding);
            if let Some(seeder) = &self.seeder {
                debug!("Seeding fresh store for '{}'", self.identifier);
                let seeder = Arc::clone(seeder);
                self.main
                    .perform_and_wait(move |ctx| seeder.seed_data_store(ctx))?;
            }
        }

        Ok(preexisting)
    }
}
