//! Persistence stack
//!
//! A stack owns two contexts: the private root, which holds the store and
//! lives on a background domain, and main, its only child, used for ordinary
//! reads and writes. Callers get scoped children of main for isolated units
//! of work.
//!
//! Construction returns immediately. The store is opened on a worker thread;
//! observe progress with [`PersistenceStack::state`], await it with
//! [`PersistenceStack::wait_until_settled`], or subscribe to the
//! [`NotificationCenter`] passed in through [`StackOptions`].

mod propagator;
mod sequencer;
mod state;

pub use propagator::SaveReceipt;
pub use state::StackState;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{Confinement, WorkingContext};
use crate::error::{ContextError, InitError};
use crate::model::{ModelDirectory, ModelSource};
use crate::notification::NotificationCenter;
use sequencer::Sequencer;

/// Fills a freshly created store with initial data
///
/// Called once, on main's domain, only when the store file did not exist
/// before. Changes made here land in main and are persisted by the next save.
pub trait Seeder: Send + Sync {
    fn seed_data_store(&self, main: &WorkingContext);
}

impl<F> Seeder for F
where
    F: Fn(&WorkingContext) + Send + Sync,
{
    fn seed_data_store(&self, main: &WorkingContext) {
        self(main)
    }
}

/// Everything a stack needs besides its model identifier
pub struct StackOptions {
    pub config: Config,
    pub models: Arc<dyn ModelSource>,
    pub seeder: Option<Arc<dyn Seeder>>,
    pub notifications: NotificationCenter,
}

impl StackOptions {
    /// Options reading models from `config.model_dir`, with no seeder
    pub fn new(config: Config) -> Self {
        let models = Arc::new(ModelDirectory::new(config.model_dir.clone()));
        Self {
            config,
            models,
            seeder: None,
            notifications: NotificationCenter::new(),
        }
    }

    pub fn models(mut self, models: impl ModelSource + 'static) -> Self {
        self.models = Arc::new(models);
        self
    }

    pub fn seeder(mut self, seeder: impl Seeder + 'static) -> Self {
        self.seeder = Some(Arc::new(seeder));
        self
    }

    pub fn notifications(mut self, center: NotificationCenter) -> Self {
        self.notifications = center;
        self
    }
}

/// A private root context, its main child, and the store behind them
pub struct PersistenceStack {
    id: Uuid,
    identifier: String,
    store_path: PathBuf,
    private: WorkingContext,
    main: WorkingContext,
    state: watch::Receiver<StackState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    scoped: AtomicUsize,
}

impl PersistenceStack {
    /// Build a stack for `identifier` using the default configuration
    ///
    /// Models are read from the configured model directory. Pass `None` when
    /// fresh stores need no initial data.
    pub fn new(identifier: &str, seeder: Option<Arc<dyn Seeder>>) -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(identifier, config, seeder)
    }

    fn from_config(
        identifier: &str,
        config: Config,
        seeder: Option<Arc<dyn Seeder>>,
    ) -> Result<Self> {
        let mut options = StackOptions::new(config);
        options.seeder = seeder;
        Self::with_options(identifier, options)
    }

    /// Build a stack and start initializing it in the background
    pub fn with_options(identifier: &str, options: StackOptions) -> Result<Self> {
        let id = Uuid::new_v4();
        let store_path = options.config.store_path(identifier);

        let private = WorkingContext::root("layerstore-private")
            .context("Failed to create private context")?;
        let main = WorkingContext::child("layerstore-main", Confinement::MainQueue, &private)
            .context("Failed to create main context")?;

        let (state_tx, state_rx) = watch::channel(StackState::Uninitialized);
        let sequencer = Sequencer {
            stack: id,
            identifier: identifier.to_string(),
            config: options.config,
            models: options.models,
            seeder: options.seeder,
            notifications: options.notifications,
            private: private.clone(),
            main: main.clone(),
            state: state_tx,
        };

        info!("Starting persistence stack for '{}' at {:?}", identifier, store_path);
        let worker = sequencer
            .start()
            .context("Failed to start initialization worker")?;

        Ok(Self {
            id,
            identifier: identifier.to_string(),
            store_path,
            private,
            main,
            state: state_rx,
            worker: Mutex::new(Some(worker)),
            scoped: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model_identifier(&self) -> &str {
        &self.identifier
    }

    /// Where the backing file lives (or will live)
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Current lifecycle state
    pub fn state(&self) -> StackState {
        self.state.borrow().clone()
    }

    /// Receiver that sees every state change
    pub fn subscribe_state(&self) -> watch::Receiver<StackState> {
        self.state.clone()
    }

    /// Wait until the stack is ready or has failed
    ///
    /// Returns whether the store already existed.
    pub async fn wait_until_settled(&self) -> Result<bool, Arc<InitError>> {
        let mut rx = self.state.clone();
        let settled = rx
            .wait_for(StackState::is_terminal)
            .await
            .map(|state| state.clone());

        match settled {
            Ok(state) => settle(state),
            // Worker went away without settling
            Err(_) => Err(Arc::new(InitError::Aborted)),
        }
    }

    /// Block the calling thread until initialization has finished
    ///
    /// Must not be called from within an async runtime's worker thread.
    pub fn wait_blocking(&self) -> Result<bool, Arc<InitError>> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                warn!("Initialization worker for '{}' panicked", self.identifier);
            }
        }
        drop(worker);

        settle(self.state())
    }

    /// The stack's single foreground context
    pub fn main_context(&self) -> &WorkingContext {
        &self.main
    }

    /// A new context parented to main, on its own background domain
    ///
    /// The stack does not keep the returned context; its changes reach main
    /// when it is saved.
    pub fn new_scoped_child_context(&self) -> Result<WorkingContext, ContextError> {
        let n = self.scoped.fetch_add(1, Ordering::Relaxed);
        WorkingContext::child(
            format!("layerstore-scoped-{}", n),
            Confinement::PrivateQueue,
            &self.main,
        )
    }
}

fn settle(state: StackState) -> Result<bool, Arc<InitError>> {
    match state {
        StackState::Ready { preexisting } => Ok(preexisting),
        StackState::Failed(e) => Err(e),
        _ => Err(Arc::new(InitError::Aborted)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSettings;
    use crate::error::{SaveError, Tier};
    use crate::model::{EntityDef, Model, StaticModels};
    use crate::notification::Notification;
    use crate::storage::StorageError;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    fn catalog_models() -> StaticModels {
        StaticModels::new().with(
            Model::new("catalog", 1)
                .with_entity(EntityDef::new("Book"))
                .with_entity(EntityDef::new("Author")),
        )
    }

    fn options(temp_dir: &TempDir) -> StackOptions {
        let mut config = Config::with_data_dir(temp_dir.path());
        config.store = StoreSettings {
            busy_timeout_ms: 0,
            ..StoreSettings::default()
        };
        StackOptions::new(config).models(catalog_models())
    }

    fn stored_books(temp_dir: &TempDir) -> i64 {
        let conn = rusqlite::Connection::open(temp_dir.path().join("catalog.sqlite")).unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM records WHERE entity = 'Book'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_store_is_seeded_before_ready() {
        let temp_dir = TempDir::new().unwrap();
        let center = NotificationCenter::new();
        let mut notifications = center.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));

        let seeded = Arc::clone(&calls);
        let options = options(&temp_dir)
            .notifications(center)
            .seeder(move |main: &WorkingContext| {
                seeded.fetch_add(1, Ordering::SeqCst);
                main.insert("Book", "dune", &json!({"title": "Dune"}))
                    .unwrap();
            });

        let stack = PersistenceStack::with_options("catalog", options).unwrap();

        let notification = notifications.recv().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            notification,
            Notification::Initialized { preexisting: false, ref model, .. } if model == "catalog"
        ));
        assert_eq!(notification.stack(), stack.id());
        assert!(!stack.wait_until_settled().await.unwrap());

        // Seeded data lives in main until saved
        let main = stack.main_context();
        assert_eq!(
            main.get("Book", "dune").unwrap(),
            Some(json!({"title": "Dune"}))
        );
        assert!(main.has_changes());
        assert_eq!(stored_books(&temp_dir), 0);

        let receipt = stack.flush();
        assert!(receipt.main_result().is_ok());
        receipt.store_result().await.unwrap();

        assert!(!main.has_changes());
        assert_eq!(stored_books(&temp_dir), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_existing_store_is_not_seeded() {
        let temp_dir = TempDir::new().unwrap();
        {
            let first = PersistenceStack::with_options("catalog", options(&temp_dir)).unwrap();
            assert!(!first.wait_until_settled().await.unwrap());
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let seeded = Arc::clone(&calls);
        let options = options(&temp_dir).seeder(move |_: &WorkingContext| {
            seeded.fetch_add(1, Ordering::SeqCst);
        });

        let stack = PersistenceStack::with_options("catalog", options).unwrap();

        assert!(stack.wait_until_settled().await.unwrap());
        assert!(matches!(
            stack.state(),
            StackState::Ready { preexisting: true }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_model_fails_without_seeding() {
        let temp_dir = TempDir::new().unwrap();
        let center = NotificationCenter::new();
        let mut notifications = center.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));

        let seeded = Arc::clone(&calls);
        let options = options(&temp_dir)
            .models(StaticModels::new())
            .notifications(center)
            .seeder(move |_: &WorkingContext| {
                seeded.fetch_add(1, Ordering::SeqCst);
            });

        let stack = PersistenceStack::with_options("catalog", options).unwrap();

        match notifications.recv().await.unwrap() {
            Notification::InitializationFailed { error, .. } => {
                assert!(matches!(*error, InitError::ModelNotFound { .. }));
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(matches!(notifications.try_recv(), Err(TryRecvError::Empty)));

        let err = stack.wait_until_settled().await.unwrap_err();
        assert!(matches!(*err, InitError::ModelNotFound { .. }));
        assert!(stack.state().is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_blocking_settles() {
        let temp_dir = TempDir::new().unwrap();
        let stack = PersistenceStack::with_options("catalog", options(&temp_dir)).unwrap();

        assert!(!stack.wait_blocking().unwrap());
        // A second wait reads the settled state
        assert!(!stack.wait_blocking().unwrap());
        assert!(stack.store_path().ends_with("catalog.sqlite"));
        assert!(stack.store_path().exists());
    }

    #[test]
    fn test_save_with_nothing_pending_reports_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let stack = PersistenceStack::with_options("catalog", options(&temp_dir)).unwrap();
        stack.wait_blocking().unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&errors);
        stack.save_changes(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        // Private's domain is FIFO, so this flush runs after the save above
        stack.flush().wait_store_blocking().unwrap();
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_main_error_is_reported_before_private_error() {
        let temp_dir = TempDir::new().unwrap();
        let stack = PersistenceStack::with_options("catalog", options(&temp_dir)).unwrap();
        stack.wait_blocking().unwrap();
        let main = stack.main_context();

        // Hold the database so private's commit fails
        let lock = rusqlite::Connection::open(stack.store_path()).unwrap();
        lock.execute_batch("BEGIN EXCLUSIVE").unwrap();

        main.insert("Book", "1", &json!({"title": "Dune"})).unwrap();
        let receipt = stack.flush();
        assert!(receipt.main_result().is_ok());
        let err = receipt.wait_store_blocking().unwrap_err();
        assert_eq!(err.tier, Tier::Private);

        // Undeclared entity fails validation on the way into private
        main.insert("Movie", "1", &json!({"title": "Alien"})).unwrap();

        // A slow main-tier handler must still finish before the private tier reports
        let main_reported = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(SaveError, bool)>();
        let tx = Mutex::new(tx);
        let flag = Arc::clone(&main_reported);
        stack.save_changes(move |e| {
            if e.tier == Tier::Main {
                std::thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::SeqCst);
            }
            let seen_main = flag.load(Ordering::SeqCst);
            let _ = tx.lock().unwrap().send((e, seen_main));
        });

        let (first, _) = rx.try_recv().unwrap();
        assert_eq!(first.tier, Tier::Main);
        assert!(matches!(first.source, ContextError::UnknownEntity { .. }));

        let (second, main_was_reported) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second.tier, Tier::Private);
        assert!(main_was_reported);
        assert!(main.has_changes());

        // Releasing the lock lets the retained change through
        lock.execute_batch("COMMIT").unwrap();
        main.rollback().unwrap();
        stack.flush().wait_store_blocking().unwrap();
        assert_eq!(stored_books(&temp_dir), 1);
    }

    #[test]
    fn test_scoped_children_are_parented_to_main() {
        let temp_dir = TempDir::new().unwrap();
        let stack = PersistenceStack::with_options("catalog", options(&temp_dir)).unwrap();
        stack.wait_blocking().unwrap();

        let a = stack.new_scoped_child_context().unwrap();
        let b = stack.new_scoped_child_context().unwrap();

        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(stack.main_context()));
        assert_eq!(b.parent(), Some(stack.main_context()));
        assert_eq!(a.confinement(), Confinement::PrivateQueue);
        assert_eq!(stack.main_context().confinement(), Confinement::MainQueue);

        a.insert("Author", "herbert", &json!({"name": "Frank Herbert"}))
            .unwrap();
        assert!(stack.main_context().get("Author", "herbert").unwrap().is_none());

        a.save().unwrap();
        assert!(stack.main_context().get("Author", "herbert").unwrap().is_some());
        assert!(b.get("Author", "herbert").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_on_failed_stack_reports_not_ready() {
        let temp_dir = TempDir::new().unwrap();
        let options = options(&temp_dir).models(StaticModels::new());
        let stack = PersistenceStack::with_options("catalog", options).unwrap();
        assert!(stack.wait_until_settled().await.is_err());

        let receipt = stack.flush();
        let main_err = receipt.main_result().unwrap_err();
        assert_eq!(main_err.tier, Tier::Main);
        assert!(matches!(
            main_err.source,
            ContextError::NotReady { state: "failed" }
        ));

        let store_err = receipt.store_result().await.unwrap_err();
        assert_eq!(store_err.tier, Tier::Private);

        assert!(matches!(
            stack.main_context().get("Book", "1"),
            Err(ContextError::StoreNotBound)
        ));
    }

    #[tokio::test]
    async fn test_unreadable_store_fails_with_store_open() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("catalog.sqlite"),
            "not a sqlite database ".repeat(64),
        )
        .unwrap();

        let center = NotificationCenter::new();
        let mut notifications = center.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));
        let seeded = Arc::clone(&calls);
        let options = options(&temp_dir)
            .notifications(center)
            .seeder(move |_: &WorkingContext| {
                seeded.fetch_add(1, Ordering::SeqCst);
            });

        let stack = PersistenceStack::with_options("catalog", options).unwrap();

        match notifications.recv().await.unwrap() {
            Notification::InitializationFailed { error, model, .. } => {
                assert_eq!(model, "catalog");
                assert!(matches!(
                    *error,
                    InitError::StoreOpen {
                        source: StorageError::Database(_),
                        ..
                    }
                ));
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(matches!(notifications.try_recv(), Err(TryRecvError::Empty)));

        assert!(stack.state().is_failed());
        assert!(stack.wait_until_settled().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stack_without_seeder_reads_model_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::with_data_dir(temp_dir.path());
        config.store.busy_timeout_ms = 0;
        std::fs::create_dir_all(&config.model_dir).unwrap();
        std::fs::write(
            config.model_path("catalog"),
            "name = \"catalog\"\n\n[[entities]]\nname = \"Book\"\n",
        )
        .unwrap();

        let stack = PersistenceStack::from_config("catalog", config, None).unwrap();

        assert!(!stack.wait_blocking().unwrap());
        assert_eq!(stack.model_identifier(), "catalog");
        assert!(!stack.main_context().has_changes());
        assert_eq!(stack.main_context().count("Book").unwrap(), 0);
    }
}
