//! Resolves scheduling-system people to CRM contacts and opportunities, and back.

use std::collections::HashSet;

use salesbridge_clients::{all_opportunities, CrmApi, GuestQuery, OpportunityFilter, SchedulingApi};
use salesbridge_core::{
    non_empty, normalize_phone, phones_match, AppointmentGuest, Contact, DndChannel, DndSettings,
    DndStatus, Guest, Opportunity, PersonalInfo, PhoneInfo,
};
use salesbridge_http::ApiError;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

pub const PUSHED_CONTACT_TAG: &str = "sales-bridge";
pub const PUSHED_CONTACT_SOURCE: &str = "Zenoti";

/// Lookup keys for one person. The phone is stored normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Identity {
    pub fn new(email: &str, phone: &str) -> Self {
        Self {
            email: non_empty(email).map(str::to_string),
            phone: non_empty(phone)
                .map(normalize_phone)
                .filter(|phone| !phone.is_empty()),
        }
    }

    pub fn from_guest(guest: &Guest) -> Self {
        Self::new(
            &guest.personal_info.email,
            &guest.personal_info.mobile_phone.number,
        )
    }

    pub fn from_appointment_guest(guest: &AppointmentGuest) -> Self {
        Self::new(&guest.email, &guest.mobile.display_number)
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }

    fn ensure_present(&self) -> SyncResult<()> {
        if self.is_empty() {
            Err(SyncError::InsufficientIdentity)
        } else {
            Ok(())
        }
    }

    /// Both keys present and both equal to the contact's.
    pub fn strictly_matches(&self, contact: &Contact) -> bool {
        let (Some(email), Some(phone)) = (&self.email, &self.phone) else {
            return false;
        };
        let email_hit = contact
            .email
            .as_deref()
            .is_some_and(|own| own.trim().eq_ignore_ascii_case(email));
        let phone_hit = contact
            .phone
            .as_deref()
            .is_some_and(|own| phones_match(own, phone));
        email_hit && phone_hit
    }
}

fn push_unique(into: &mut Vec<Contact>, seen: &mut HashSet<String>, found: Vec<Contact>) {
    for contact in found {
        if seen.insert(contact.id.clone()) {
            into.push(contact);
        }
    }
}

/// Email first; the phone is only consulted when the email finds nobody.
pub async fn find_contacts(crm: &dyn CrmApi, identity: &Identity) -> SyncResult<Vec<Contact>> {
    identity.ensure_present()?;
    let mut contacts = Vec::new();
    let mut seen = HashSet::new();

    if let Some(email) = &identity.email {
        push_unique(&mut contacts, &mut seen, crm.find_contacts(email).await?);
    }
    if contacts.is_empty() {
        if let Some(phone) = &identity.phone {
            push_unique(&mut contacts, &mut seen, crm.find_contacts(phone).await?);
        }
    }
    Ok(contacts)
}

/// Opportunities in `pipeline_id` belonging to any contact that matches `identity`.
pub async fn match_opportunities(
    crm: &dyn CrmApi,
    pipeline_id: &str,
    identity: &Identity,
) -> SyncResult<Vec<Opportunity>> {
    let contacts = find_contacts(crm, identity).await?;
    let mut opportunities = Vec::new();
    let mut seen = HashSet::new();
    for contact in &contacts {
        let filter = OpportunityFilter::pipeline(pipeline_id).with_contact(&contact.id);
        for opportunity in all_opportunities(crm, &filter).await? {
            if seen.insert(opportunity.id.clone()) {
                opportunities.push(opportunity);
            }
        }
    }
    debug!(
        contacts = contacts.len(),
        opportunities = opportunities.len(),
        "matched identity"
    );
    Ok(opportunities)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Created(Contact),
    AlreadyPresent(String),
}

/// Create a CRM contact for `guest` unless one matches on both email and phone.
pub async fn push_guest(crm: &dyn CrmApi, guest: &Guest) -> SyncResult<PushOutcome> {
    let identity = Identity::from_guest(guest);
    let (Some(email), Some(phone)) = (&identity.email, &identity.phone) else {
        return Err(SyncError::InsufficientIdentity);
    };

    let mut candidates = Vec::new();
    let mut seen = HashSet::new();
    push_unique(&mut candidates, &mut seen, crm.find_contacts(email).await?);
    push_unique(&mut candidates, &mut seen, crm.find_contacts(phone).await?);

    if let Some(existing) = candidates.iter().find(|c| identity.strictly_matches(c)) {
        debug!(contact_id = %existing.id, "guest already present in CRM");
        return Ok(PushOutcome::AlreadyPresent(existing.id.clone()));
    }

    let contact = Contact {
        location_id: crm.location_id().to_string(),
        first_name: non_empty(&guest.personal_info.first_name).map(str::to_string),
        last_name: non_empty(&guest.personal_info.last_name).map(str::to_string),
        email: Some(email.clone()),
        phone: Some(guest.personal_info.mobile_phone.number.trim().to_string()),
        tags: vec![PUSHED_CONTACT_TAG.to_string()],
        source: Some(PUSHED_CONTACT_SOURCE.to_string()),
        ..Contact::default()
    };
    let created = crm.create_contact(&contact).await?;
    info!(contact_id = %created.id, guest_id = %guest.id, "pushed guest to CRM");
    Ok(PushOutcome::Created(created))
}

fn dnd_for(receives_marketing: bool) -> DndChannel {
    DndChannel {
        status: if receives_marketing {
            DndStatus::Inactive
        } else {
            DndStatus::Active
        },
    }
}

/// Copy the guest's marketing preferences onto the first matching contact's DND settings.
///
/// Returns `None` when no contact matches.
pub async fn push_guest_update(crm: &dyn CrmApi, guest: &Guest) -> SyncResult<Option<Contact>> {
    let identity = Identity::from_guest(guest);
    let contacts = find_contacts(crm, &identity).await?;
    let Some(mut contact) = contacts.into_iter().next() else {
        return Ok(None);
    };
    contact.dnd_settings = Some(DndSettings {
        email: dnd_for(guest.preferences.receive_marketing_email),
        sms: dnd_for(guest.preferences.receive_marketing_sms),
    });
    Ok(Some(crm.update_contact(&contact).await?))
}

fn empty_on_not_found(result: Result<Vec<Guest>, ApiError>) -> Result<Vec<Guest>, ApiError> {
    match result {
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        other => other,
    }
}

/// Guests matching `identity`, email first then phone.
pub async fn find_guests(
    scheduling: &dyn SchedulingApi,
    identity: &Identity,
) -> SyncResult<Vec<Guest>> {
    identity.ensure_present()?;
    if let Some(email) = &identity.email {
        let found =
            empty_on_not_found(scheduling.search_guests(&GuestQuery::Email(email.clone())).await)?;
        if !found.is_empty() {
            return Ok(found);
        }
    }
    if let Some(phone) = &identity.phone {
        let found =
            empty_on_not_found(scheduling.search_guests(&GuestQuery::Phone(phone.clone())).await)?;
        return Ok(found);
    }
    Ok(Vec::new())
}

/// First guest matching `draft`'s email or phone, or `draft` created in the scheduling system.
pub async fn find_or_create_guest(
    scheduling: &dyn SchedulingApi,
    draft: &Guest,
) -> SyncResult<Guest> {
    let identity = Identity::from_guest(draft);
    if let Some(existing) = find_guests(scheduling, &identity).await?.into_iter().next() {
        return Ok(existing);
    }
    let created = scheduling.create_guest(draft).await?;
    info!(guest_id = %created.id, "created guest in scheduling system");
    Ok(created)
}

/// Guest draft for an opportunity's contact. Names fall back to splitting the opportunity
/// name; email, phone and both names are required.
pub fn guest_from_opportunity(opportunity: &Opportunity, center_id: &str) -> SyncResult<Guest> {
    let contact = &opportunity.contact;
    let email = contact.email.as_deref().and_then(non_empty).unwrap_or_default();
    let phone = contact.phone.as_deref().and_then(non_empty).unwrap_or_default();
    if email.is_empty() || phone.is_empty() {
        return Err(SyncError::InsufficientIdentity);
    }

    let display = contact
        .name
        .as_deref()
        .and_then(non_empty)
        .unwrap_or(opportunity.name.as_str());
    let mut words = display.split_whitespace();
    let first_name = words.next().unwrap_or_default().to_string();
    let last_name = words.next().unwrap_or_default().to_string();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(SyncError::IncompleteGuest(format!(
            "opportunity {} has no first and last name",
            opportunity.id
        )));
    }

    Ok(Guest {
        center_id: center_id.to_string(),
        personal_info: PersonalInfo {
            first_name,
            last_name,
            email: email.to_string(),
            mobile_phone: PhoneInfo {
                country_code: 0,
                number: phone.to_string(),
            },
            gender: 1,
        },
        ..Guest::default()
    })
}

#[cfg(test)]
mod tests {
    use salesbridge_clients::fake::{FakeCrm, FakeScheduling};
    use salesbridge_core::{GuestPreferences, OpportunityContact};

    use super::*;

    fn contact(id: &str, email: &str, phone: &str) -> Contact {
        Contact {
            id: id.to_string(),
            email: Some(email.to_string()),
            phone: Some(phone.to_string()),
            ..Contact::default()
        }
    }

    fn guest(email: &str, phone: &str) -> Guest {
        Guest {
            id: "g-1".into(),
            personal_info: PersonalInfo {
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                email: email.into(),
                mobile_phone: PhoneInfo {
                    country_code: 225,
                    number: phone.into(),
                },
                gender: 2,
            },
            ..Guest::default()
        }
    }

    fn opportunity(id: &str, contact_id: &str) -> Opportunity {
        Opportunity {
            id: id.into(),
            pipeline_id: "pipe-1".into(),
            contact: OpportunityContact {
                id: contact_id.into(),
                ..OpportunityContact::default()
            },
            ..Opportunity::default()
        }
    }

    #[test]
    fn identity_normalizes_the_phone() {
        let identity = Identity::new(" jane@example.com ", "+1 555 010 2000");
        assert_eq!(identity.email.as_deref(), Some("jane@example.com"));
        assert_eq!(identity.phone.as_deref(), Some("5550102000"));
        assert!(Identity::new("", "  ").is_empty());
    }

    #[tokio::test]
    async fn no_email_and_no_phone_is_insufficient() {
        let crm = FakeCrm::new("loc-1");
        let err = match_opportunities(&crm, "pipe-1", &Identity::new("", ""))
            .await
            .expect_err("no identity");
        assert!(matches!(err, SyncError::InsufficientIdentity));
        assert_eq!(crm.calls("find_contacts"), 0);
    }

    #[tokio::test]
    async fn email_hit_skips_the_phone_query() {
        let crm = FakeCrm::new("loc-1");
        crm.seed_contact(contact("c-1", "jane@example.com", "5550000000"));
        crm.seed_contact(contact("c-2", "other@example.com", "5550102000"));
        crm.seed_opportunity(opportunity("o-1", "c-1"));
        crm.seed_opportunity(opportunity("o-2", "c-2"));

        let found = match_opportunities(
            &crm,
            "pipe-1",
            &Identity::new("jane@example.com", "+15550102000"),
        )
        .await
        .expect("match");
        assert_eq!(found.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), ["o-1"]);
        assert_eq!(crm.calls("find_contacts"), 1);
    }

    #[tokio::test]
    async fn phone_is_used_when_email_finds_nobody() {
        let crm = FakeCrm::new("loc-1");
        crm.seed_contact(contact("c-2", "other@example.com", "+1 555 010 2000"));
        crm.seed_opportunity(opportunity("o-2", "c-2"));

        let found = match_opportunities(
            &crm,
            "pipe-1",
            &Identity::new("jane@example.com", "5550102000"),
        )
        .await
        .expect("match");
        assert_eq!(found.len(), 1);
        assert_eq!(crm.calls("find_contacts"), 2);
    }

    #[tokio::test]
    async fn email_only_match_finds_for_update_but_does_not_suppress_push() {
        let crm = FakeCrm::new("loc-1");
        crm.seed_contact(contact("c-1", "jane@example.com", "5559999999"));
        crm.seed_opportunity(opportunity("o-1", "c-1"));
        let jane = guest("jane@example.com", "5550102000");

        let found = match_opportunities(&crm, "pipe-1", &Identity::from_guest(&jane))
            .await
            .expect("match");
        assert_eq!(found.len(), 1);

        let created = match push_guest(&crm, &jane).await.expect("push") {
            PushOutcome::Created(created) => created,
            other => panic!("expected a new contact, got {other:?}"),
        };
        assert_eq!(created.tags, [PUSHED_CONTACT_TAG]);
        assert_eq!(created.source.as_deref(), Some(PUSHED_CONTACT_SOURCE));
        assert_eq!(crm.contacts().len(), 2);
    }

    #[tokio::test]
    async fn strict_match_suppresses_push() {
        let crm = FakeCrm::new("loc-1");
        crm.seed_contact(contact("c-1", "Jane@Example.com", "+1 555 010 2000"));

        let outcome = push_guest(&crm, &guest("jane@example.com", "5550102000"))
            .await
            .expect("push");
        assert_eq!(outcome, PushOutcome::AlreadyPresent("c-1".into()));
        assert_eq!(crm.calls("create_contact"), 0);
    }

    #[tokio::test]
    async fn push_requires_both_email_and_phone() {
        let crm = FakeCrm::new("loc-1");
        let err = push_guest(&crm, &guest("jane@example.com", ""))
            .await
            .expect_err("missing phone");
        assert!(matches!(err, SyncError::InsufficientIdentity));
    }

    #[tokio::test]
    async fn guest_update_copies_marketing_preferences_to_dnd() {
        let crm = FakeCrm::new("loc-1");
        crm.seed_contact(contact("c-1", "jane@example.com", "5550102000"));
        let mut jane = guest("jane@example.com", "5550102000");
        jane.preferences = GuestPreferences {
            receive_marketing_email: true,
            receive_marketing_sms: false,
        };

        let updated = push_guest_update(&crm, &jane)
            .await
            .expect("update")
            .expect("matched");
        let dnd = updated.dnd_settings.expect("dnd");
        assert_eq!(dnd.email.status, DndStatus::Inactive);
        assert_eq!(dnd.sms.status, DndStatus::Active);

        let nobody = guest("ghost@example.com", "5550000001");
        assert_eq!(push_guest_update(&crm, &nobody).await.expect("update"), None);
    }

    #[tokio::test]
    async fn find_or_create_guest_reuses_existing_guest() {
        let scheduling = FakeScheduling::new("center-1");
        let mut existing = guest("jane@example.com", "5550102000");
        existing.id = "g-42".into();
        scheduling.seed_guest(existing);

        let found = find_or_create_guest(&scheduling, &guest("", "+1 555 010 2000"))
            .await
            .expect("guest");
        assert_eq!(found.id, "g-42");
        assert_eq!(scheduling.calls("create_guest"), 0);

        let created = find_or_create_guest(&scheduling, &guest("new@example.com", "5551112222"))
            .await
            .expect("guest");
        assert_eq!(created.id, "guest-1");
    }

    #[tokio::test]
    async fn not_found_search_counts_as_empty() {
        let scheduling = FakeScheduling::new("center-1");
        scheduling.fail_next("search_guests", 404, 1);
        let found = find_guests(&scheduling, &Identity::new("jane@example.com", ""))
            .await
            .expect("empty");
        assert!(found.is_empty());
    }

    #[test]
    fn guest_draft_splits_the_opportunity_name() {
        let mut opp = opportunity("o-1", "c-1");
        opp.name = "Jane Doe".into();
        opp.contact.email = Some("jane@example.com".into());
        opp.contact.phone = Some("5550102000".into());

        let draft = guest_from_opportunity(&opp, "center-1").expect("draft");
        assert_eq!(draft.personal_info.first_name, "Jane");
        assert_eq!(draft.personal_info.last_name, "Doe");
        assert_eq!(draft.center_id, "center-1");

        opp.name = "Jane".into();
        assert!(matches!(
            guest_from_opportunity(&opp, "center-1"),
            Err(SyncError::IncompleteGuest(_))
        ));
        opp.contact.phone = None;
        assert!(matches!(
            guest_from_opportunity(&opp, "center-1"),
            Err(SyncError::InsufficientIdentity)
        ));
    }
}
