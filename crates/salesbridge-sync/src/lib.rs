//! Scheduling-to-CRM reconciliation engine.

pub mod booking;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod matcher;
pub mod notes;
pub mod notify;
pub mod scheduler;
pub mod stages;
pub mod store;

pub use booking::{book_crm_appointment, BookingOutcome, BookingState, BookingWorkflow};
pub use config::{BridgeConfig, CrmSettings, NotifyConfig, SyncWindows};
pub use diff::{reconcile, ApplyReport, SlotDiff};
pub use engine::{
    ClientFactory, FixedClients, GuestPush, HttpClients, LocationReport, PassSteps, Reconciler,
    RunSummary,
};
pub use error::{SyncError, SyncErrorKind, SyncResult};
pub use ledger::{LedgerEntry, LedgerKind, NoteLedger};
pub use matcher::Identity;
pub use notify::{notifier_from_config, CollectingNotifier, LogNotifier, Notifier, TelegramNotifier};
pub use scheduler::{build_scheduler, maybe_build_scheduler};
pub use stages::{StageEvent, Transition};
pub use store::{LocationFilter, MemoryStore, PgStore, Store, StoreTokenSink};

pub const CRATE_NAME: &str = "salesbridge-sync";
