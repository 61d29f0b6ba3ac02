//! Calendar mirror diffing: desired busy intervals against the locally stored block slots.

use std::collections::{HashMap, HashSet};

use salesbridge_clients::CrmApi;
use salesbridge_core::{Appointment, AppointmentStatus, BlockOut, BlockSlot, Calendar, Location};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotDiff {
    pub to_create: Vec<BlockSlot>,
    /// Desired slots carrying the mirrored row's event id.
    pub to_update: Vec<BlockSlot>,
    pub to_delete: Vec<BlockSlot>,
}

impl SlotDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Set difference keyed by external id.
///
/// Only start and end decide whether a known slot needs an update. When the mirror holds
/// several rows for one external id the first is kept and the rest are deleted.
pub fn reconcile(mirrored: &[BlockSlot], desired: &[BlockSlot]) -> SlotDiff {
    let mut diff = SlotDiff::default();

    let mut kept: HashMap<&str, &BlockSlot> = HashMap::new();
    for slot in mirrored {
        if kept.contains_key(slot.external_id.as_str()) {
            diff.to_delete.push(slot.clone());
        } else {
            kept.insert(slot.external_id.as_str(), slot);
        }
    }

    let mut wanted: HashSet<&str> = HashSet::new();
    for slot in desired {
        if !wanted.insert(slot.external_id.as_str()) {
            continue;
        }
        match kept.get(slot.external_id.as_str()) {
            None => diff.to_create.push(slot.clone()),
            Some(existing) if !existing.same_interval(slot) => {
                let mut changed = slot.clone();
                changed.id = existing.id.clone();
                diff.to_update.push(changed);
            }
            Some(_) => {}
        }
    }

    for slot in mirrored {
        let is_kept = kept
            .get(slot.external_id.as_str())
            .is_some_and(|k| std::ptr::eq(*k, slot));
        if is_kept && !wanted.contains(slot.external_id.as_str()) {
            diff.to_delete.push(slot.clone());
        }
    }

    diff
}

/// Appointments that occupy real time on a calendar.
pub fn is_mirrorable(appointment: &Appointment) -> bool {
    !appointment.is_merged() && appointment.status != AppointmentStatus::Canceled
}

pub fn appointment_slot(
    location: &Location,
    calendar: &Calendar,
    appointment: &Appointment,
) -> BlockSlot {
    let guest = format!(
        "{} {}",
        appointment.guest.first_name.trim(),
        appointment.guest.last_name.trim()
    );
    let title = match guest.trim() {
        "" => "Appointment".to_string(),
        name => name.to_string(),
    };
    BlockSlot {
        id: None,
        location_id: location.id.clone(),
        calendar_id: calendar.calendar_id.clone(),
        external_id: appointment.id.clone(),
        start: appointment.start_time_utc,
        end: appointment.end_time_utc,
        title,
        notes: format!(
            "Appointment: {}",
            location.appointment_link(&appointment.invoice_id)
        ),
    }
}

pub fn block_out_slot(location: &Location, calendar: &Calendar, block_out: &BlockOut) -> BlockSlot {
    BlockSlot {
        id: None,
        location_id: location.id.clone(),
        calendar_id: calendar.calendar_id.clone(),
        external_id: block_out.id.clone(),
        start: block_out.start_time,
        end: block_out.end_time,
        title: block_out.title().to_string(),
        notes: block_out.notes.clone(),
    }
}

/// Desired slots for one staff calendar: their mirrorable appointments plus block-outs.
pub fn desired_slots(
    location: &Location,
    calendar: &Calendar,
    appointments: &[Appointment],
    block_outs: &[BlockOut],
) -> Vec<BlockSlot> {
    appointments
        .iter()
        .filter(|a| a.therapist.id == calendar.staff_id && is_mirrorable(a))
        .map(|a| appointment_slot(location, calendar, a))
        .chain(block_outs.iter().map(|b| block_out_slot(location, calendar, b)))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl ApplyReport {
    pub fn absorb(&mut self, other: ApplyReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

async fn create_slot(crm: &dyn CrmApi, store: &dyn Store, mut slot: BlockSlot) -> SyncResult<()> {
    let event_id = crm.create_block_slot(&slot).await?;
    slot.id = Some(event_id.clone());
    if let Err(err) = store.insert_block_slot(&slot).await {
        if let Err(cleanup) = crm.delete_event(&event_id).await {
            warn!(event_id = %event_id, error = %cleanup, "could not remove unrecorded CRM event");
        }
        return Err(err);
    }
    Ok(())
}

async fn update_slot(crm: &dyn CrmApi, store: &dyn Store, slot: BlockSlot) -> SyncResult<()> {
    let event_id = slot
        .id
        .clone()
        .ok_or_else(|| SyncError::MissingEventId(slot.external_id.clone()))?;
    crm.update_block_slot(&event_id, &slot).await?;
    store.update_block_slot(&slot).await
}

async fn delete_slot(crm: &dyn CrmApi, store: &dyn Store, slot: BlockSlot) -> SyncResult<()> {
    let event_id = slot
        .id
        .clone()
        .ok_or_else(|| SyncError::MissingEventId(slot.external_id.clone()))?;
    match crm.delete_event(&event_id).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {
            debug!(event_id = %event_id, "CRM event already gone");
        }
        Err(err) => return Err(err.into()),
    }
    store.delete_block_slot(&event_id).await
}

/// Apply creates, then updates, then deletes. A failed item is logged and skipped.
pub async fn apply(crm: &dyn CrmApi, store: &dyn Store, diff: SlotDiff) -> ApplyReport {
    let mut report = ApplyReport::default();

    for slot in diff.to_create {
        let external_id = slot.external_id.clone();
        match create_slot(crm, store, slot).await {
            Ok(()) => report.created += 1,
            Err(err) => {
                warn!(
                    external_id = %external_id,
                    error = %err,
                    "block slot create failed; continuing"
                );
                report.failed += 1;
            }
        }
    }
    for slot in diff.to_update {
        let external_id = slot.external_id.clone();
        match update_slot(crm, store, slot).await {
            Ok(()) => report.updated += 1,
            Err(err) => {
                warn!(
                    external_id = %external_id,
                    error = %err,
                    "block slot update failed; continuing"
                );
                report.failed += 1;
            }
        }
    }
    for slot in diff.to_delete {
        let external_id = slot.external_id.clone();
        match delete_slot(crm, store, slot).await {
            Ok(()) => report.deleted += 1,
            Err(err) => {
                warn!(
                    external_id = %external_id,
                    error = %err,
                    "block slot delete failed; continuing"
                );
                report.failed += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use salesbridge_clients::fake::FakeCrm;
    use salesbridge_core::{AppointmentGuest, BlockOutType, DisplayPhone, Therapist};

    use super::*;
    use crate::store::tests::location;
    use crate::store::MemoryStore;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).unwrap()
    }

    fn slot(id: Option<&str>, external: &str, start: u32, end: u32) -> BlockSlot {
        BlockSlot {
            id: id.map(str::to_string),
            location_id: "loc-1".into(),
            calendar_id: "cal-1".into(),
            external_id: external.into(),
            start: at(start),
            end: at(end),
            title: "busy".into(),
            notes: String::new(),
        }
    }

    fn calendar() -> Calendar {
        Calendar {
            location_id: "loc-1".into(),
            staff_id: "t-1".into(),
            staff_name: "Kim Lee".into(),
            calendar_id: "cal-1".into(),
        }
    }

    fn appointment(id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Appointment {
        Appointment {
            id: id.into(),
            invoice_id: format!("inv-{id}"),
            guest: AppointmentGuest {
                id: "g-1".into(),
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                email: "jane@example.com".into(),
                mobile: DisplayPhone::default(),
            },
            start_time: start,
            end_time: end,
            start_time_utc: start,
            end_time_utc: end,
            status: AppointmentStatus::Booked,
            therapist: Therapist {
                id: "t-1".into(),
                first_name: "Kim".into(),
                last_name: "Lee".into(),
                display_name: String::new(),
            },
        }
    }

    fn apply_to_mirror(mirror: &mut Vec<BlockSlot>, diff: &SlotDiff) {
        let mut next = 100;
        for created in &diff.to_create {
            let mut created = created.clone();
            next += 1;
            created.id = Some(format!("evt-{next}"));
            mirror.push(created);
        }
        for updated in &diff.to_update {
            if let Some(row) = mirror.iter_mut().find(|row| row.id == updated.id) {
                *row = updated.clone();
            }
        }
        for deleted in &diff.to_delete {
            mirror.retain(|row| row.id != deleted.id);
        }
    }

    #[test]
    fn buckets_are_disjoint_and_cover_both_sides() {
        let mirrored = vec![
            slot(Some("e-1"), "same", 9, 10),
            slot(Some("e-2"), "moved", 11, 12),
            slot(Some("e-3"), "gone", 13, 14),
        ];
        let desired = vec![
            slot(None, "same", 9, 10),
            slot(None, "moved", 11, 13),
            slot(None, "new", 15, 16),
        ];

        let diff = reconcile(&mirrored, &desired);
        let ids = |slots: &[BlockSlot]| {
            slots
                .iter()
                .map(|s| s.external_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&diff.to_create), ["new"]);
        assert_eq!(ids(&diff.to_update), ["moved"]);
        assert_eq!(diff.to_update[0].id.as_deref(), Some("e-2"));
        assert_eq!(diff.to_update[0].end, at(13));
        assert_eq!(ids(&diff.to_delete), ["gone"]);
    }

    #[test]
    fn reconcile_reaches_a_fixed_point() {
        let mut mirror = vec![
            slot(Some("e-1"), "a", 9, 10),
            slot(Some("e-2"), "b", 10, 11),
            slot(Some("e-3"), "b", 10, 11),
            slot(Some("e-4"), "c", 12, 13),
        ];
        let desired = vec![slot(None, "a", 9, 11), slot(None, "b", 10, 11), slot(None, "d", 8, 9)];

        let diff = reconcile(&mirror, &desired);
        assert_eq!(diff.to_delete.len(), 2);
        apply_to_mirror(&mut mirror, &diff);

        assert!(reconcile(&mirror, &desired).is_empty());
        assert_eq!(mirror.len(), 3);
    }

    #[test]
    fn title_changes_alone_do_not_trigger_updates() {
        let mirrored = vec![slot(Some("e-1"), "a", 9, 10)];
        let mut renamed = slot(None, "a", 9, 10);
        renamed.title = "renamed".into();
        assert!(reconcile(&mirrored, &[renamed]).is_empty());
    }

    #[test]
    fn merged_and_canceled_appointments_are_not_mirrored() {
        let location = location("loc-1", "c-1");
        let merged = appointment("a-merged", at(9), at(9));
        let mut canceled = appointment("a-canceled", at(10), at(11));
        canceled.status = AppointmentStatus::Canceled;
        let valid = appointment("a-valid", at(12), at(13));
        let mut other_staff = appointment("a-other", at(12), at(13));
        other_staff.therapist.id = "t-2".into();

        let desired = desired_slots(
            &location,
            &calendar(),
            &[merged, canceled, valid, other_staff],
            &[],
        );
        let diff = reconcile(&[], &desired);
        assert_eq!(diff.to_create.len(), 1);
        assert_eq!(diff.to_create[0].external_id, "a-valid");
        assert_eq!(diff.to_create[0].title, "Jane Doe");
        assert!(diff.to_create[0]
            .notes
            .ends_with("/Appointment/DlgAppointment1.aspx?invoiceid=inv-a-valid"));
    }

    #[test]
    fn block_out_title_falls_back_to_type_name() {
        let location = location("loc-1", "c-1");
        let block_out = BlockOut {
            id: "bo-1".into(),
            start_time: at(14),
            end_time: at(15),
            employee: Therapist::default(),
            notes: "  ".into(),
            kind: BlockOutType {
                name: "Lunch".into(),
            },
        };
        let desired = desired_slots(&location, &calendar(), &[], &[block_out]);
        assert_eq!(desired[0].title, "Lunch");
        assert_eq!(desired[0].external_id, "bo-1");
    }

    #[tokio::test]
    async fn apply_continues_past_failed_items() {
        let crm = FakeCrm::new("loc-1");
        let store = MemoryStore::new();
        store
            .insert_block_slot(&slot(Some("e-old"), "old", 8, 9))
            .await
            .expect("seed");

        crm.fail_next("create_block_slot", 400, 1);
        let diff = SlotDiff {
            to_create: vec![slot(None, "first", 9, 10), slot(None, "second", 10, 11)],
            to_update: Vec::new(),
            to_delete: vec![slot(Some("e-old"), "old", 8, 9)],
        };

        let report = apply(&crm, &store, diff).await;
        assert_eq!(
            report,
            ApplyReport {
                created: 1,
                updated: 0,
                deleted: 1,
                failed: 1,
            }
        );
        let mirror = store.all_block_slots().await;
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror[0].external_id, "second");
        assert_eq!(mirror[0].id.as_deref(), Some("evt-1"));
        assert_eq!(crm.events().len(), 1);
    }

    #[tokio::test]
    async fn apply_then_reconcile_is_empty() {
        let crm = FakeCrm::new("loc-1");
        let store = MemoryStore::new();
        let location = location("loc-1", "c-1");
        let appts = vec![
            appointment("a-1", at(9), at(10)),
            appointment("a-2", at(11), at(11) + Duration::minutes(30)),
        ];
        let desired = desired_slots(&location, &calendar(), &appts, &[]);

        let first = reconcile(&store.block_slots("cal-1").await.expect("list"), &desired);
        let report = apply(&crm, &store, first).await;
        assert_eq!(report.created, 2);

        let second = reconcile(&store.block_slots("cal-1").await.expect("list"), &desired);
        assert!(second.is_empty());
    }
}
