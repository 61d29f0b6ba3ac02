//! Event ledger kept in a CRM note per contact.
//!
//! Each ledger note starts with a marker line followed by one `<label>: <link>` line per
//! event. A link present in the note means the event was already processed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use salesbridge_clients::CrmApi;
use salesbridge_core::Note;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerKind {
    Bookings,
    Collections,
}

impl LedgerKind {
    pub fn marker(self) -> &'static str {
        match self {
            LedgerKind::Bookings => "Bookings for this contact",
            LedgerKind::Collections => "Collections for this contact",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub label: String,
    pub link: String,
}

impl LedgerEntry {
    pub fn booking(date: DateTime<Utc>, link: &str) -> Self {
        Self {
            label: date.format("%m/%d/%Y").to_string(),
            link: link.to_string(),
        }
    }

    pub fn collection(amount: f64, link: &str) -> Self {
        Self {
            label: format!("{amount:.2}"),
            link: link.to_string(),
        }
    }

    pub fn line(&self) -> String {
        format!("{}: {}", self.label, self.link)
    }
}

/// Links recorded in a ledger body, in order. The marker line carries none.
pub fn recorded_links(body: &str) -> impl Iterator<Item = &str> {
    body.lines()
        .filter_map(|line| line.trim().split_once(": "))
        .map(|(_, link)| link.trim())
}

pub fn body_records(body: &str, link: &str) -> bool {
    recorded_links(body).any(|recorded| recorded == link)
}

fn ledger_note(notes: &[Note], kind: LedgerKind) -> Option<&Note> {
    notes
        .iter()
        .find(|note| note.body.trim_start().starts_with(kind.marker()))
}

/// Serializes ledger writes per contact within this process.
#[derive(Debug, Default)]
pub struct NoteLedger {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn contact_lock(&self, contact_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(contact_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn has_event(
        &self,
        crm: &dyn CrmApi,
        contact_id: &str,
        kind: LedgerKind,
        link: &str,
    ) -> SyncResult<bool> {
        let notes = crm.notes(contact_id).await?;
        Ok(ledger_note(&notes, kind).is_some_and(|note| body_records(&note.body, link)))
    }

    /// Record `entry` unless its link is already present.
    ///
    /// Returns `true` when the event had been recorded before (nothing written).
    pub async fn append_event(
        &self,
        crm: &dyn CrmApi,
        contact_id: &str,
        kind: LedgerKind,
        entry: &LedgerEntry,
    ) -> SyncResult<bool> {
        let lock = self.contact_lock(contact_id).await;
        let _guard = lock.lock().await;

        let notes = crm.notes(contact_id).await?;
        match ledger_note(&notes, kind) {
            Some(note) if body_records(&note.body, &entry.link) => {
                debug!(contact_id, link = %entry.link, "ledger already holds event");
                Ok(true)
            }
            Some(note) => {
                let mut updated = note.clone();
                updated.body = format!("{}\n{}", note.body.trim_end(), entry.line());
                crm.update_note(&updated).await?;
                Ok(false)
            }
            None => {
                let body = format!("{}:\n{}", kind.marker(), entry.line());
                crm.create_note(contact_id, &body).await?;
                Ok(false)
            }
        }
    }

    pub async fn register_booking(
        &self,
        crm: &dyn CrmApi,
        contact_id: &str,
        link: &str,
        date: DateTime<Utc>,
    ) -> SyncResult<bool> {
        self.append_event(
            crm,
            contact_id,
            LedgerKind::Bookings,
            &LedgerEntry::booking(date, link),
        )
        .await
    }

    pub async fn register_collection(
        &self,
        crm: &dyn CrmApi,
        contact_id: &str,
        link: &str,
        amount: f64,
    ) -> SyncResult<bool> {
        self.append_event(
            crm,
            contact_id,
            LedgerKind::Collections,
            &LedgerEntry::collection(amount, link),
        )
        .await
    }
}
