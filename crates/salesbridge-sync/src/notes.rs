//! Daily contact notes: a link to the guest page and a scheduling-system status line.

use salesbridge_clients::{CrmApi, SchedulingApi};
use salesbridge_core::{Location, Note, Opportunity};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::matcher::{find_guests, find_or_create_guest, guest_from_opportunity, Identity};

pub const GUEST_LINK_PREFIX: &str =
    "Please follow this link to view existing guest or create a new one in Zenoti";
const LEGACY_GUEST_LINK_PREFIX: &str = "Please follow this link to create a guest in Zenoti";
pub const STATUS_PREFIX: &str = "Zenoti update:";

fn is_link_note(note: &Note) -> bool {
    note.body.contains(GUEST_LINK_PREFIX) || note.body.contains(LEGACY_GUEST_LINK_PREFIX)
}

fn is_status_note(note: &Note) -> bool {
    note.body.contains(STATUS_PREFIX)
}

pub fn guest_link(public_url: &str, contact_id: &str, location_id: &str) -> String {
    format!(
        "{}/contact/{contact_id}/{location_id}",
        public_url.trim_end_matches('/')
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteRefresh {
    pub link_written: bool,
    pub status: String,
}

async fn ensure_guest(
    scheduling: &dyn SchedulingApi,
    location: &Location,
    opportunity: &Opportunity,
) -> SyncResult<()> {
    let draft = guest_from_opportunity(opportunity, &location.zenoti.center_id)?;
    find_or_create_guest(scheduling, &draft).await?;
    Ok(())
}

async fn touch_guest(scheduling: &dyn SchedulingApi, opportunity: &Opportunity) -> SyncResult<()> {
    let identity = Identity::new(
        opportunity.contact.email.as_deref().unwrap_or_default(),
        opportunity.contact.phone.as_deref().unwrap_or_default(),
    );
    let guest = find_guests(scheduling, &identity)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::GuestNotFound(opportunity.contact.id.clone()))?;
    scheduling.touch_guest(&guest.id).await?;
    Ok(())
}

/// Rewrite the status note and, when missing or `force` is set, the guest-link note.
///
/// The status note is replaced on every run regardless of `force`.
pub async fn refresh_contact_notes(
    crm: &dyn CrmApi,
    scheduling: &dyn SchedulingApi,
    location: &Location,
    opportunity: &Opportunity,
    public_url: &str,
    force: bool,
) -> SyncResult<NoteRefresh> {
    let contact_id = opportunity.contact.id.as_str();
    let notes = crm.notes(contact_id).await?;

    let mut keep_link = false;
    for note in &notes {
        if is_link_note(note) {
            if force {
                if let Err(err) = crm.delete_note(note).await {
                    warn!(note_id = %note.id, error = %err, "could not delete guest-link note");
                }
            } else {
                keep_link = true;
            }
        }
        if is_status_note(note) {
            if let Err(err) = crm.delete_note(note).await {
                warn!(note_id = %note.id, error = %err, "could not delete status note");
            }
        }
    }

    let mut refresh = NoteRefresh::default();
    if !keep_link {
        let body = format!(
            "{GUEST_LINK_PREFIX}: {}",
            guest_link(public_url, contact_id, &location.id)
        );
        crm.create_note(contact_id, &body).await?;
        refresh.link_written = true;
    }

    let mut status = STATUS_PREFIX.to_string();
    if location.sync_contacts {
        if let Err(err) = ensure_guest(scheduling, location, opportunity).await {
            debug!(opportunity_id = %opportunity.id, error = %err, "guest not ensured");
            status.push_str(&format!(" {err}"));
        }
    }
    match touch_guest(scheduling, opportunity).await {
        Ok(()) => status.push_str(" Guest updated"),
        Err(err) => status.push_str(&format!(" {err}")),
    }
    crm.create_note(contact_id, &status).await?;
    refresh.status = status;

    Ok(refresh)
}

#[cfg(test)]
mod tests {
    use salesbridge_clients::fake::{FakeCrm, FakeScheduling};
    use salesbridge_core::{Guest, OpportunityContact, PersonalInfo, PhoneInfo};

    use super::*;
    use crate::store::tests::location;

    fn opportunity() -> Opportunity {
        Opportunity {
            id: "o-1".into(),
            name: "Jane Doe".into(),
            pipeline_id: "pipe-1".into(),
            contact: OpportunityContact {
                id: "c-1".into(),
                name: Some("Jane Doe".into()),
                email: Some("jane@example.com".into()),
                phone: Some("5550102000".into()),
            },
            ..Opportunity::default()
        }
    }

    fn existing_guest() -> Guest {
        Guest {
            id: "g-9".into(),
            personal_info: PersonalInfo {
                email: "jane@example.com".into(),
                mobile_phone: PhoneInfo {
                    country_code: 225,
                    number: "5550102000".into(),
                },
                ..PersonalInfo::default()
            },
            ..Guest::default()
        }
    }

    #[tokio::test]
    async fn writes_link_and_status_for_a_fresh_contact() {
        let crm = FakeCrm::new("loc-1");
        let scheduling = FakeScheduling::new("center-1");
        scheduling.seed_guest(existing_guest());

        let refresh = refresh_contact_notes(
            &crm,
            &scheduling,
            &location("loc-1", "center-1"),
            &opportunity(),
            "https://bridge.example.com/",
            false,
        )
        .await
        .expect("refresh");

        assert!(refresh.link_written);
        assert_eq!(refresh.status, "Zenoti update: Guest updated");
        let bodies: Vec<_> = crm.notes_for("c-1").into_iter().map(|n| n.body).collect();
        assert!(bodies.contains(&format!(
            "{GUEST_LINK_PREFIX}: https://bridge.example.com/contact/c-1/loc-1"
        )));
        assert_eq!(scheduling.touched_guests(), ["g-9"]);
        assert_eq!(scheduling.calls("create_guest"), 0);
    }

    #[tokio::test]
    async fn existing_link_is_kept_unless_forced_but_status_is_always_replaced() {
        let crm = FakeCrm::new("loc-1");
        let scheduling = FakeScheduling::new("center-1");
        scheduling.seed_guest(existing_guest());
        crm.seed_note("c-1", "Please follow this link to create a guest in Zenoti: old");
        crm.seed_note("c-1", "Zenoti update: stale");
        let location = location("loc-1", "center-1");

        let refresh =
            refresh_contact_notes(&crm, &scheduling, &location, &opportunity(), "https://b", false)
                .await
                .expect("refresh");
        assert!(!refresh.link_written);
        let bodies: Vec<_> = crm.notes_for("c-1").into_iter().map(|n| n.body).collect();
        assert_eq!(bodies.len(), 2);
        assert!(!bodies.iter().any(|b| b.contains("stale")));

        let forced =
            refresh_contact_notes(&crm, &scheduling, &location, &opportunity(), "https://b", true)
                .await
                .expect("forced");
        assert!(forced.link_written);
        let bodies: Vec<_> = crm.notes_for("c-1").into_iter().map(|n| n.body).collect();
        assert_eq!(bodies.len(), 2);
        assert!(bodies.iter().all(|b| !b.ends_with(": old")));
    }

    #[tokio::test]
    async fn missing_guest_is_created_then_touched() {
        let crm = FakeCrm::new("loc-1");
        let scheduling = FakeScheduling::new("center-1");

        let refresh = refresh_contact_notes(
            &crm,
            &scheduling,
            &location("loc-1", "center-1"),
            &opportunity(),
            "https://b",
            false,
        )
        .await
        .expect("refresh");
        assert_eq!(scheduling.guests().len(), 1);
        assert_eq!(refresh.status, "Zenoti update: Guest updated");
    }

    #[tokio::test]
    async fn errors_end_up_in_the_status_note() {
        let crm = FakeCrm::new("loc-1");
        let scheduling = FakeScheduling::new("center-1");
        let mut location = location("loc-1", "center-1");
        location.sync_contacts = false;

        let refresh =
            refresh_contact_notes(&crm, &scheduling, &location, &opportunity(), "https://b", false)
                .await
                .expect("refresh");
        assert!(refresh.status.starts_with("Zenoti update: "));
        assert!(refresh.status.contains("no scheduling guest for contact c-1"));
        assert_eq!(scheduling.calls("create_guest"), 0);
    }
}
