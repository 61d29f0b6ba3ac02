//! In-memory collaborators for engine tests.
//!
//! Both fakes count calls per operation and can be told to fail the next N calls of an
//! operation with a given HTTP status.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salesbridge_core::{
    normalize_phone, phones_match, Appointment, BlockOut, BlockSlot, Collection, Contact,
    CrmTokens, Guest, Note, Opportunity, OpportunityUpdate, PageCursor,
};
use salesbridge_http::{ApiError, Page};

use crate::{BookingRequest, CrmApi, GuestQuery, OpportunityFilter, Reservation, SchedulingApi};

#[derive(Debug, Default)]
struct CallLog {
    counts: HashMap<String, usize>,
    failures: HashMap<String, Vec<u16>>,
}

impl CallLog {
    fn record(&mut self, op: &str) -> Result<(), ApiError> {
        *self.counts.entry(op.to_string()).or_default() += 1;
        if let Some(pending) = self.failures.get_mut(op) {
            if let Some(status) = pending.pop() {
                return Err(ApiError::Http {
                    method: "FAKE".to_string(),
                    endpoint: op.to_string(),
                    status,
                    body: format!("injected failure for {op}"),
                });
            }
        }
        Ok(())
    }

    fn count(&self, op: &str) -> usize {
        self.counts.get(op).copied().unwrap_or(0)
    }

    fn fail(&mut self, op: &str, status: u16, times: usize) {
        self.failures
            .entry(op.to_string())
            .or_default()
            .extend(std::iter::repeat(status).take(times));
    }
}

fn not_found(op: &str, what: &str) -> ApiError {
    ApiError::Http {
        method: "FAKE".to_string(),
        endpoint: op.to_string(),
        status: 404,
        body: format!("{what} not found"),
    }
}

#[derive(Debug, Default)]
struct CrmState {
    log: CallLog,
    contacts: Vec<Contact>,
    opportunities: Vec<Opportunity>,
    updates: Vec<(String, OpportunityUpdate)>,
    notes: Vec<Note>,
    calendars: HashMap<String, String>,
    events: HashMap<String, BlockSlot>,
    tokens_rotated: usize,
    next_id: usize,
}

impl CrmState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

#[derive(Debug)]
pub struct FakeCrm {
    location_id: String,
    page_size: usize,
    state: Mutex<CrmState>,
}

impl FakeCrm {
    pub fn new(location_id: &str) -> Self {
        Self {
            location_id: location_id.to_string(),
            page_size: 100,
            state: Mutex::new(CrmState::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, CrmState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn seed_contact(&self, contact: Contact) {
        self.state().contacts.push(contact);
    }

    pub fn seed_opportunity(&self, opportunity: Opportunity) {
        self.state().opportunities.push(opportunity);
    }

    pub fn seed_note(&self, contact_id: &str, body: &str) -> Note {
        let mut state = self.state();
        let note = Note {
            id: state.next_id("note"),
            contact_id: contact_id.to_string(),
            body: body.to_string(),
        };
        state.notes.push(note.clone());
        note
    }

    /// Fail the next `times` calls of `op` (the trait method name) with `status`.
    pub fn fail_next(&self, op: &str, status: u16, times: usize) {
        self.state().log.fail(op, status, times);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().log.count(op)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.state().contacts.clone()
    }

    pub fn opportunity(&self, id: &str) -> Option<Opportunity> {
        self.state()
            .opportunities
            .iter()
            .find(|opportunity| opportunity.id == id)
            .cloned()
    }

    pub fn opportunity_updates(&self) -> Vec<(String, OpportunityUpdate)> {
        self.state().updates.clone()
    }

    pub fn notes_for(&self, contact_id: &str) -> Vec<Note> {
        self.state()
            .notes
            .iter()
            .filter(|note| note.contact_id == contact_id)
            .cloned()
            .collect()
    }

    pub fn calendar_names(&self) -> HashMap<String, String> {
        self.state().calendars.clone()
    }

    pub fn events(&self) -> HashMap<String, BlockSlot> {
        self.state().events.clone()
    }

    pub fn tokens_rotated(&self) -> usize {
        self.state().tokens_rotated
    }
}

#[async_trait]
impl CrmApi for FakeCrm {
    fn location_id(&self) -> &str {
        &self.location_id
    }

    async fn find_contacts(&self, query: &str) -> Result<Vec<Contact>, ApiError> {
        let mut state = self.state();
        state.log.record("find_contacts")?;
        let query_lower = query.trim().to_ascii_lowercase();
        Ok(state
            .contacts
            .iter()
            .filter(|contact| {
                let email_hit = contact
                    .email
                    .as_deref()
                    .is_some_and(|email| email.to_ascii_lowercase() == query_lower);
                let phone_hit = contact
                    .phone
                    .as_deref()
                    .is_some_and(|phone| phones_match(phone, query));
                email_hit || phone_hit
            })
            .cloned()
            .collect())
    }

    async fn create_contact(&self, contact: &Contact) -> Result<Contact, ApiError> {
        let mut state = self.state();
        state.log.record("create_contact")?;
        let mut created = contact.clone();
        created.id = state.next_id("contact");
        created.location_id = self.location_id.clone();
        state.contacts.push(created.clone());
        Ok(created)
    }

    async fn update_contact(&self, contact: &Contact) -> Result<Contact, ApiError> {
        let mut state = self.state();
        state.log.record("update_contact")?;
        let existing = state
            .contacts
            .iter_mut()
            .find(|existing| existing.id == contact.id)
            .ok_or_else(|| not_found("update_contact", "contact"))?;
        *existing = contact.clone();
        Ok(contact.clone())
    }

    async fn search_opportunities(
        &self,
        filter: &OpportunityFilter,
        cursor: Option<&PageCursor>,
    ) -> Result<Page<Opportunity, PageCursor>, ApiError> {
        let mut state = self.state();
        state.log.record("search_opportunities")?;
        let matching: Vec<Opportunity> = state
            .opportunities
            .iter()
            .filter(|o| filter.pipeline_id.as_ref().map_or(true, |id| &o.pipeline_id == id))
            .filter(|o| filter.stage_id.as_ref().map_or(true, |id| &o.pipeline_stage_id == id))
            .filter(|o| filter.contact_id.as_ref().map_or(true, |id| &o.contact.id == id))
            .cloned()
            .collect();

        let offset = cursor.map_or(0, |cursor| cursor.start_after.max(0) as usize);
        let end = (offset + self.page_size).min(matching.len());
        let items = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next = (end < matching.len()).then(|| PageCursor {
            start_after: end as i64,
            start_after_id: items.last().map(|o| o.id.clone()).unwrap_or_default(),
        });
        Ok(Page { items, next })
    }

    async fn update_opportunity(
        &self,
        opportunity_id: &str,
        update: &OpportunityUpdate,
    ) -> Result<Opportunity, ApiError> {
        let mut state = self.state();
        state.log.record("update_opportunity")?;
        state
            .updates
            .push((opportunity_id.to_string(), update.clone()));
        let stored = state
            .opportunities
            .iter_mut()
            .find(|o| o.id == opportunity_id)
            .ok_or_else(|| not_found("update_opportunity", "opportunity"))?;
        stored.pipeline_id = update.pipeline_id.clone();
        stored.name = update.name.clone();
        stored.pipeline_stage_id = update.pipeline_stage_id.clone();
        stored.status = update.status.clone();
        stored.monetary_value = update.monetary_value;
        stored.assigned_to = update.assigned_to.clone();
        Ok(stored.clone())
    }

    async fn notes(&self, contact_id: &str) -> Result<Vec<Note>, ApiError> {
        let mut state = self.state();
        state.log.record("notes")?;
        Ok(state
            .notes
            .iter()
            .filter(|note| note.contact_id == contact_id)
            .cloned()
            .collect())
    }

    async fn create_note(&self, contact_id: &str, body: &str) -> Result<Note, ApiError> {
        let mut state = self.state();
        state.log.record("create_note")?;
        let note = Note {
            id: state.next_id("note"),
            contact_id: contact_id.to_string(),
            body: body.to_string(),
        };
        state.notes.push(note.clone());
        Ok(note)
    }

    async fn update_note(&self, note: &Note) -> Result<Note, ApiError> {
        let mut state = self.state();
        state.log.record("update_note")?;
        let stored = state
            .notes
            .iter_mut()
            .find(|stored| stored.id == note.id)
            .ok_or_else(|| not_found("update_note", "note"))?;
        stored.body = note.body.clone();
        Ok(stored.clone())
    }

    async fn delete_note(&self, note: &Note) -> Result<(), ApiError> {
        let mut state = self.state();
        state.log.record("delete_note")?;
        state.notes.retain(|stored| stored.id != note.id);
        Ok(())
    }

    async fn create_calendar(&self, name: &str) -> Result<String, ApiError> {
        let mut state = self.state();
        state.log.record("create_calendar")?;
        let id = state.next_id("cal");
        state.calendars.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn delete_calendar(&self, calendar_id: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        state.log.record("delete_calendar")?;
        state.calendars.remove(calendar_id);
        Ok(())
    }

    async fn create_block_slot(&self, slot: &BlockSlot) -> Result<String, ApiError> {
        let mut state = self.state();
        state.log.record("create_block_slot")?;
        let id = state.next_id("evt");
        let mut stored = slot.clone();
        stored.id = Some(id.clone());
        state.events.insert(id.clone(), stored);
        Ok(id)
    }

    async fn update_block_slot(&self, event_id: &str, slot: &BlockSlot) -> Result<(), ApiError> {
        let mut state = self.state();
        state.log.record("update_block_slot")?;
        let stored = state
            .events
            .get_mut(event_id)
            .ok_or_else(|| not_found("update_block_slot", "event"))?;
        *stored = slot.clone();
        stored.id = Some(event_id.to_string());
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        state.log.record("delete_event")?;
        state.events.remove(event_id);
        Ok(())
    }

    async fn refresh_tokens(&self) -> Result<CrmTokens, ApiError> {
        let mut state = self.state();
        state.log.record("refresh_tokens")?;
        state.tokens_rotated += 1;
        Ok(CrmTokens {
            location_id: self.location_id.clone(),
            access_token: format!("access-{}", state.tokens_rotated),
            refresh_token: format!("refresh-{}", state.tokens_rotated),
        })
    }
}

#[derive(Debug, Default)]
struct SchedulingState {
    log: CallLog,
    appointments: Vec<Appointment>,
    collections: Vec<Collection>,
    block_outs: HashMap<String, Vec<BlockOut>>,
    guests: Vec<Guest>,
    bookings: Vec<BookingRequest>,
    touched: Vec<String>,
    next_id: usize,
}

#[derive(Debug)]
pub struct FakeScheduling {
    center_id: String,
    whole_days: bool,
    state: Mutex<SchedulingState>,
}

impl FakeScheduling {
    pub fn new(center_id: &str) -> Self {
        Self {
            center_id: center_id.to_string(),
            whole_days: false,
            state: Mutex::new(SchedulingState::default()),
        }
    }

    /// Answer range queries with every record on the first through the last day, the way
    /// the real API treats its date-only parameters.
    pub fn with_whole_days(mut self) -> Self {
        self.whole_days = true;
        self
    }

    fn in_range(&self, at: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if self.whole_days {
            let day = at.date_naive();
            day >= start.date_naive() && day <= end.date_naive()
        } else {
            at >= start && at < end
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn seed_appointment(&self, appointment: Appointment) {
        self.state().appointments.push(appointment);
    }

    pub fn seed_collection(&self, collection: Collection) {
        self.state().collections.push(collection);
    }

    pub fn seed_block_out(&self, employee_id: &str, block_out: BlockOut) {
        self.state()
            .block_outs
            .entry(employee_id.to_string())
            .or_default()
            .push(block_out);
    }

    pub fn seed_guest(&self, guest: Guest) {
        self.state().guests.push(guest);
    }

    pub fn fail_next(&self, op: &str, status: u16, times: usize) {
        self.state().log.fail(op, status, times);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().log.count(op)
    }

    pub fn guests(&self) -> Vec<Guest> {
        self.state().guests.clone()
    }

    pub fn bookings(&self) -> Vec<BookingRequest> {
        self.state().bookings.clone()
    }

    pub fn touched_guests(&self) -> Vec<String> {
        self.state().touched.clone()
    }
}

#[async_trait]
impl SchedulingApi for FakeScheduling {
    fn center_id(&self) -> &str {
        &self.center_id
    }

    async fn appointments(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, ApiError> {
        let mut state = self.state();
        state.log.record("appointments")?;
        Ok(state
            .appointments
            .iter()
            .filter(|a| self.in_range(a.start_time_utc, start, end))
            .cloned()
            .collect())
    }

    async fn collections(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Collection>, ApiError> {
        let mut state = self.state();
        state.log.record("collections")?;
        Ok(state
            .collections
            .iter()
            .filter(|c| c.created_date.map_or(true, |at| self.in_range(at, start, end)))
            .cloned()
            .collect())
    }

    async fn block_outs(
        &self,
        employee_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BlockOut>, ApiError> {
        let mut state = self.state();
        state.log.record("block_outs")?;
        Ok(state
            .block_outs
            .get(employee_id)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| self.in_range(b.start_time, start, end))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn guest(&self, guest_id: &str) -> Result<Guest, ApiError> {
        let mut state = self.state();
        state.log.record("guest")?;
        state
            .guests
            .iter()
            .find(|guest| guest.id == guest_id)
            .cloned()
            .ok_or_else(|| not_found("guest", "guest"))
    }

    async fn search_guests(&self, query: &GuestQuery) -> Result<Vec<Guest>, ApiError> {
        let mut state = self.state();
        state.log.record("search_guests")?;
        Ok(state
            .guests
            .iter()
            .filter(|guest| match query {
                GuestQuery::Email(email) => guest
                    .email()
                    .is_some_and(|own| own.eq_ignore_ascii_case(email)),
                GuestQuery::Phone(phone) => guest
                    .phone()
                    .is_some_and(|own| phones_match(own, phone)),
            })
            .cloned()
            .collect())
    }

    async fn create_guest(&self, guest: &Guest) -> Result<Guest, ApiError> {
        let mut state = self.state();
        state.log.record("create_guest")?;
        let mut created = guest.clone();
        state.next_id += 1;
        created.id = format!("guest-{}", state.next_id);
        created.center_id = self.center_id.clone();
        created.personal_info.mobile_phone.number =
            normalize_phone(&created.personal_info.mobile_phone.number);
        state.guests.push(created.clone());
        Ok(created)
    }

    async fn touch_guest(&self, guest_id: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        state.log.record("touch_guest")?;
        if !state.guests.iter().any(|guest| guest.id == guest_id) {
            return Err(not_found("touch_guest", "guest"));
        }
        state.touched.push(guest_id.to_string());
        Ok(())
    }

    async fn create_booking(&self, request: &BookingRequest) -> Result<String, ApiError> {
        let mut state = self.state();
        state.log.record("create_booking")?;
        state.bookings.push(request.clone());
        Ok(format!("booking-{}", state.bookings.len()))
    }

    async fn reserve_slot(
        &self,
        booking_id: &str,
        slot: DateTime<Utc>,
    ) -> Result<Reservation, ApiError> {
        let mut state = self.state();
        state.log.record("reserve_slot")?;
        Ok(Reservation {
            reservation_id: format!("res-{booking_id}"),
            expiry_time: Some(slot + chrono::Duration::minutes(10)),
            invoice_id: None,
        })
    }

    async fn confirm_booking(&self, booking_id: &str) -> Result<Reservation, ApiError> {
        let mut state = self.state();
        state.log.record("confirm_booking")?;
        Ok(Reservation {
            reservation_id: format!("res-{booking_id}"),
            expiry_time: None,
            invoice_id: Some(format!("inv-{booking_id}")),
        })
    }
}
