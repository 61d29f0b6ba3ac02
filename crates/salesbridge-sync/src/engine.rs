//! The reconciliation pass and the webhook entry points.
//!
//! A pass walks every location in turn: rotate the CRM token pair, then push bookings and
//! sales into opportunity stages, then mirror staff calendars. A location that fails is
//! reported and alerted, and the pass moves on to the next one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use salesbridge_clients::{
    all_opportunities, CrmApi, CrmClient, CrmConfig, OpportunityFilter, SchedulingApi,
    ZenotiClient, ZenotiConfig,
};
use salesbridge_core::{
    Appointment, AppointmentGroupEvent, AppointmentStatus, Calendar, Collection,
    CrmAppointmentEvent, Guest, InvoiceEvent, Location, Opportunity, Therapist,
};
use serde::Serialize;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::booking::{book_crm_appointment, BookingOutcome};
use crate::config::BridgeConfig;
use crate::diff::{apply, desired_slots, is_mirrorable, reconcile, ApplyReport};
use crate::error::{SyncError, SyncResult};
use crate::ledger::NoteLedger;
use crate::matcher::{match_opportunities, push_guest, push_guest_update, Identity, PushOutcome};
use crate::notes::refresh_contact_notes;
use crate::notify::Notifier;
use crate::stages::{apply_transition, StageEvent};
use crate::store::{LocationFilter, Store, StoreTokenSink};

/// Builds the collaborator clients for one location.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn scheduling(&self, location: &Location) -> SyncResult<Arc<dyn SchedulingApi>>;

    async fn crm(&self, location: &Location) -> SyncResult<Arc<dyn CrmApi>>;
}

/// HTTP clients built from config and the stored token pair. Each call reads the tokens
/// afresh, so a client never outlives a rotation done by another one.
pub struct HttpClients {
    config: BridgeConfig,
    store: Arc<dyn Store>,
}

impl HttpClients {
    pub fn new(config: BridgeConfig, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }
}

#[async_trait]
impl ClientFactory for HttpClients {
    async fn scheduling(&self, location: &Location) -> SyncResult<Arc<dyn SchedulingApi>> {
        let mut config = ZenotiConfig::new(
            &self.config.zenoti_base_url,
            &location.zenoti.api_key,
            &location.zenoti.center_id,
        );
        config.timeout = self.config.http_timeout();
        config.backoff = self.config.backoff();
        Ok(Arc::new(ZenotiClient::new(config)?))
    }

    async fn crm(&self, location: &Location) -> SyncResult<Arc<dyn CrmApi>> {
        if !self.config.crm_configured() {
            return Err(SyncError::Config("CRM client id/secret not set".to_string()));
        }
        let tokens = self
            .store
            .crm_tokens(&location.id)
            .await?
            .ok_or_else(|| {
                SyncError::Config(format!("no CRM tokens for location {}", location.id))
            })?;
        let settings = &self.config.crm;
        let mut config = CrmConfig::new(
            &settings.base_url,
            &settings.token_url,
            &settings.client_id,
            &settings.client_secret,
        );
        config.timeout = self.config.http_timeout();
        config.backoff = self.config.backoff();
        let sink = Arc::new(StoreTokenSink::new(self.store.clone()));
        Ok(Arc::new(CrmClient::new(config, tokens, sink)?))
    }
}

/// Hands out the same pair of clients for every location.
pub struct FixedClients {
    scheduling: Arc<dyn SchedulingApi>,
    crm: Arc<dyn CrmApi>,
}

impl FixedClients {
    pub fn new(scheduling: Arc<dyn SchedulingApi>, crm: Arc<dyn CrmApi>) -> Self {
        Self { scheduling, crm }
    }
}

#[async_trait]
impl ClientFactory for FixedClients {
    async fn scheduling(&self, _location: &Location) -> SyncResult<Arc<dyn SchedulingApi>> {
        Ok(self.scheduling.clone())
    }

    async fn crm(&self, _location: &Location) -> SyncResult<Arc<dyn CrmApi>> {
        Ok(self.crm.clone())
    }
}

/// Which parts of a pass to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSteps {
    pub stages: bool,
    pub calendars: bool,
}

impl PassSteps {
    pub const ALL: PassSteps = PassSteps {
        stages: true,
        calendars: true,
    };
    pub const STAGES: PassSteps = PassSteps {
        stages: true,
        calendars: false,
    };
    pub const CALENDARS: PassSteps = PassSteps {
        stages: false,
        calendars: true,
    };

    /// Locations a pass with these steps has anything to do for.
    fn location_filter(self) -> LocationFilter {
        match (self.stages, self.calendars) {
            (true, false) => LocationFilter::ContactSync,
            (false, true) => LocationFilter::CalendarSync,
            _ => LocationFilter::All,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LocationReport {
    pub location_id: String,
    pub bookings_moved: usize,
    pub sales_registered: usize,
    pub slots: ApplyReport,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub locations: Vec<LocationReport>,
    /// Locations skipped because their CRM tokens could not be refreshed.
    pub skipped: Vec<String>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.locations.iter().filter(|l| l.error.is_some()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuestPush {
    Created(String),
    AlreadyPresent(String),
    Updated(String),
    NoMatch,
}

pub struct Reconciler {
    config: BridgeConfig,
    store: Arc<dyn Store>,
    clients: Arc<dyn ClientFactory>,
    ledger: NoteLedger,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(
        config: BridgeConfig,
        store: Arc<dyn Store>,
        clients: Arc<dyn ClientFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            clients,
            ledger: NoteLedger::new(),
            notifier,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn alert(&self, topic: &str, err: &SyncError) {
        self.notifier.notify(topic, &err.to_string());
    }

    fn appointment_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let windows = self.config.windows;
        (
            now + Duration::days(windows.appointments_from_days),
            now + Duration::days(windows.appointments_to_days),
        )
    }

    pub async fn run_once(&self) -> SyncResult<RunSummary> {
        self.run_pass(PassSteps::ALL).await
    }

    pub async fn run_pass(&self, steps: PassSteps) -> SyncResult<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let locations = self.store.locations(steps.location_filter()).await?;
        info!(%run_id, locations = locations.len(), "starting pass");

        let mut reports = Vec::new();
        let mut skipped = Vec::new();
        for location in &locations {
            let span = info_span!("location", location_id = %location.id);
            let crm = match self.refresh_tokens(location).instrument(span.clone()).await {
                Ok(crm) => crm,
                Err(err) => {
                    warn!(
                        location_id = %location.id,
                        error = %err,
                        "token refresh failed; skipping location"
                    );
                    self.alert(&format!("token refresh for {}", location.name), &err);
                    skipped.push(location.id.clone());
                    continue;
                }
            };

            let mut report = LocationReport {
                location_id: location.id.clone(),
                ..LocationReport::default()
            };
            if let Err(err) = self
                .reconcile_location(location, crm.as_ref(), steps, &mut report)
                .instrument(span)
                .await
            {
                warn!(location_id = %location.id, error = %err, "location pass failed");
                self.alert(&format!("sync for {}", location.name), &err);
                report.error = Some(err.to_string());
            }
            reports.push(report);
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            locations: reports,
            skipped,
        };
        info!(
            %run_id,
            failed = summary.failed(),
            skipped = summary.skipped.len(),
            "pass finished"
        );
        Ok(summary)
    }

    async fn refresh_tokens(&self, location: &Location) -> SyncResult<Arc<dyn CrmApi>> {
        let crm = self.clients.crm(location).await?;
        crm.refresh_tokens().await?;
        debug!("CRM tokens rotated");
        Ok(crm)
    }

    async fn reconcile_location(
        &self,
        location: &Location,
        crm: &dyn CrmApi,
        steps: PassSteps,
        report: &mut LocationReport,
    ) -> SyncResult<()> {
        let scheduling = self.clients.scheduling(location).await?;
        let scheduling = scheduling.as_ref();
        let mut first_error = None;

        if steps.stages && location.sync_contacts {
            match self.sync_bookings(location, scheduling, crm).await {
                Ok(moved) => report.bookings_moved = moved,
                Err(err) => step_failed(&mut first_error, "bookings", err),
            }
            match self.sync_sales(location, scheduling, crm).await {
                Ok(registered) => report.sales_registered = registered,
                Err(err) => step_failed(&mut first_error, "sales", err),
            }
        }
        if steps.calendars && location.sync_calendars {
            match self.sync_calendars(location, scheduling, crm).await {
                Ok(slots) => report.slots = slots,
                Err(err) => step_failed(&mut first_error, "calendars", err),
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if steps.stages && steps.calendars {
            self.store.mark_reconciled(&location.id, Utc::now()).await?;
        }
        Ok(())
    }

    /// Move opportunities for appointments in the polling window. Returns how many
    /// appointments were newly registered.
    pub async fn sync_bookings(
        &self,
        location: &Location,
        scheduling: &dyn SchedulingApi,
        crm: &dyn CrmApi,
    ) -> SyncResult<usize> {
        let (start, end) = self.appointment_window(Utc::now());
        let appointments = scheduling.appointments(start, end).await?;
        let mut moved = 0;
        for appointment in &appointments {
            if appointment.status == AppointmentStatus::Canceled {
                continue;
            }
            match self.record_booking(location, crm, appointment).await {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        appointment_id = %appointment.id,
                        error = %err,
                        "booking not recorded; continuing"
                    );
                }
            }
        }
        info!(appointments = appointments.len(), moved, "bookings synced");
        Ok(moved)
    }

    async fn first_opportunity(
        &self,
        location: &Location,
        crm: &dyn CrmApi,
        identity: &Identity,
    ) -> SyncResult<Option<Opportunity>> {
        Ok(match_opportunities(crm, &location.pipeline_id, identity)
            .await?
            .into_iter()
            .next())
    }

    async fn record_booking(
        &self,
        location: &Location,
        crm: &dyn CrmApi,
        appointment: &Appointment,
    ) -> SyncResult<bool> {
        let identity = Identity::from_appointment_guest(&appointment.guest);
        let Some(opportunity) = self.first_opportunity(location, crm, &identity).await? else {
            return Ok(false);
        };
        let link = location.appointment_link(&appointment.invoice_id);
        let already = self
            .ledger
            .register_booking(crm, &opportunity.contact.id, &link, appointment.start_time)
            .await?;
        if already {
            return Ok(false);
        }
        apply_transition(
            crm,
            &location.stages,
            &opportunity,
            StageEvent::booking(appointment.status),
        )
        .await?;
        Ok(true)
    }

    /// Process collections from the watermark to now, one chunk at a time. The watermark
    /// advances after each chunk; a fetch or persistence error stops the loop there.
    pub async fn sync_sales(
        &self,
        location: &Location,
        scheduling: &dyn SchedulingApi,
        crm: &dyn CrmApi,
    ) -> SyncResult<usize> {
        let windows = self.config.windows;
        let now = Utc::now();
        let mut cursor = location
            .sales_sync_date
            .unwrap_or_else(|| now - Duration::days(windows.initial_sales_lookback_days));
        let mut span = Duration::days(1);
        let mut registered = 0;

        while cursor < now {
            let chunk_end = (cursor + span).min(now);
            let collections = scheduling.collections(cursor, chunk_end).await?;
            debug!(from = %cursor, to = %chunk_end, collections = collections.len(), "sales chunk");
            for mut collection in collections {
                match scheduling.guest(&collection.guest_id).await {
                    Ok(guest) => collection.guest = Some(guest),
                    Err(err) => {
                        warn!(
                            invoice_id = %collection.invoice_id,
                            error = %err,
                            "guest lookup failed; skipping collection"
                        );
                        continue;
                    }
                }
                collection.total_collection = collection.items_total();
                match self.record_sale(location, crm, &collection).await {
                    Ok(true) => registered += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(
                            invoice_id = %collection.invoice_id,
                            error = %err,
                            "sale not recorded; continuing"
                        );
                    }
                }
            }
            self.store.advance_sales_watermark(&location.id, chunk_end).await?;
            cursor = chunk_end;
            span = Duration::days(windows.sales_chunk_days.max(1));
        }
        info!(registered, "sales synced");
        Ok(registered)
    }

    async fn record_sale(
        &self,
        location: &Location,
        crm: &dyn CrmApi,
        collection: &Collection,
    ) -> SyncResult<bool> {
        let guest = collection
            .guest
            .as_ref()
            .ok_or(SyncError::InsufficientIdentity)?;
        let identity = Identity::from_guest(guest);
        let Some(opportunity) = self.first_opportunity(location, crm, &identity).await? else {
            debug!(invoice_id = %collection.invoice_id, "no opportunity for sale");
            return Ok(false);
        };
        let link = location.appointment_link(&collection.invoice_id);
        let amount = collection.total_collection;
        let newly_registered = !self
            .ledger
            .register_collection(crm, &opportunity.contact.id, &link, amount)
            .await?;
        apply_transition(
            crm,
            &location.stages,
            &opportunity,
            StageEvent::Sale {
                amount,
                newly_registered,
            },
        )
        .await?;
        Ok(newly_registered)
    }

    /// Mirror every staff calendar of the location for the polling window.
    ///
    /// The scheduling API answers with whole days, so fetched records and the local mirror
    /// are both cut to `[start, end)` before diffing.
    pub async fn sync_calendars(
        &self,
        location: &Location,
        scheduling: &dyn SchedulingApi,
        crm: &dyn CrmApi,
    ) -> SyncResult<ApplyReport> {
        let (start, end) = self.appointment_window(Utc::now());
        let in_window = |at: DateTime<Utc>| at >= start && at < end;
        let mut appointments = scheduling.appointments(start, end).await?;
        appointments.retain(|a| in_window(a.start_time_utc));
        let mut calendars = self.store.calendars(&location.id).await?;

        for appointment in appointments.iter().filter(|a| is_mirrorable(a)) {
            let staff = &appointment.therapist;
            if staff.id.is_empty() || calendars.iter().any(|c| c.staff_id == staff.id) {
                continue;
            }
            match self.create_calendar(location, crm, staff).await {
                Ok(calendar) => calendars.push(calendar),
                Err(err) => {
                    warn!(staff_id = %staff.id, error = %err, "calendar not created; continuing");
                }
            }
        }

        let mut report = ApplyReport::default();
        for calendar in &calendars {
            let mut block_outs = match scheduling.block_outs(&calendar.staff_id, start, end).await {
                Ok(block_outs) => block_outs,
                Err(err) => {
                    warn!(
                        calendar_id = %calendar.calendar_id,
                        error = %err,
                        "block-outs unavailable; calendar left as is"
                    );
                    report.failed += 1;
                    continue;
                }
            };
            block_outs.retain(|b| in_window(b.start_time));
            let desired = desired_slots(location, calendar, &appointments, &block_outs);
            let mut mirrored = self.store.block_slots(&calendar.calendar_id).await?;
            mirrored.retain(|slot| in_window(slot.start));
            let diff = reconcile(&mirrored, &desired);
            if diff.is_empty() {
                continue;
            }
            report.absorb(apply(crm, self.store.as_ref(), diff).await);
        }
        info!(
            calendars = calendars.len(),
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            failed = report.failed,
            "calendars synced"
        );
        Ok(report)
    }

    async fn create_calendar(
        &self,
        location: &Location,
        crm: &dyn CrmApi,
        staff: &Therapist,
    ) -> SyncResult<Calendar> {
        let name = format!("Zenoti ({})", staff.short_name());
        let calendar_id = crm.create_calendar(&name).await?;
        let calendar = Calendar {
            location_id: location.id.clone(),
            staff_id: staff.id.clone(),
            staff_name: staff.full_name(),
            calendar_id: calendar_id.clone(),
        };
        if let Err(err) = self.store.insert_calendar(&calendar).await {
            if let Err(cleanup) = crm.delete_calendar(&calendar_id).await {
                warn!(
                    calendar_id = %calendar_id,
                    error = %cleanup,
                    "could not remove unrecorded calendar"
                );
            }
            return Err(err);
        }
        info!(calendar_id = %calendar_id, staff_id = %staff.id, "created staff calendar");
        Ok(calendar)
    }

    /// Rewrite guest-link and status notes for every opportunity of every contact-sync
    /// location. Returns the number of opportunities refreshed.
    pub async fn refresh_notes(&self, force: bool) -> SyncResult<usize> {
        let locations = self.store.locations(LocationFilter::ContactSync).await?;
        let mut refreshed = 0;
        for location in &locations {
            let span = info_span!("notes", location_id = %location.id);
            match self.refresh_location_notes(location, force).instrument(span).await {
                Ok(count) => refreshed += count,
                Err(err) => {
                    warn!(location_id = %location.id, error = %err, "note refresh failed");
                    self.alert(&format!("note refresh for {}", location.name), &err);
                }
            }
        }
        Ok(refreshed)
    }

    async fn refresh_location_notes(&self, location: &Location, force: bool) -> SyncResult<usize> {
        let crm = self.clients.crm(location).await?;
        let scheduling = self.clients.scheduling(location).await?;
        let opportunities =
            all_opportunities(crm.as_ref(), &OpportunityFilter::pipeline(&location.pipeline_id))
                .await?;
        let mut refreshed = 0;
        for opportunity in opportunities.iter().filter(|o| !o.contact.id.is_empty()) {
            match refresh_contact_notes(
                crm.as_ref(),
                scheduling.as_ref(),
                location,
                opportunity,
                &self.config.public_url,
                force,
            )
            .await
            {
                Ok(_) => refreshed += 1,
                Err(err) => {
                    warn!(
                        opportunity_id = %opportunity.id,
                        error = %err,
                        "notes not refreshed; continuing"
                    );
                }
            }
        }
        info!(refreshed, "contact notes refreshed");
        Ok(refreshed)
    }

    async fn location_for_center(&self, center_id: &str) -> SyncResult<Location> {
        self.store
            .location_by_center(center_id)
            .await?
            .ok_or_else(|| SyncError::UnknownLocation(center_id.to_string()))
    }

    fn alert_on_error<T>(&self, topic: &str, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(err) = &result {
            self.alert(topic, err);
        }
        result
    }

    /// A paid invoice. Returns whether it was newly registered.
    #[instrument(skip_all, fields(invoice_id = %event.id, center_id = %event.center_id))]
    pub async fn handle_invoice(&self, event: InvoiceEvent) -> SyncResult<bool> {
        let result = self.invoice(event).await;
        self.alert_on_error("invoice webhook", result)
    }

    async fn invoice(&self, event: InvoiceEvent) -> SyncResult<bool> {
        let location = self.location_for_center(&event.center_id).await?;
        let crm = self.clients.crm(&location).await?;
        self.record_sale(&location, crm.as_ref(), &event.into_collection())
            .await
    }

    /// Appointments booked under one invoice. The opportunity moves only when at least one
    /// appointment was newly registered.
    #[instrument(skip_all, fields(invoice_id = %event.invoice_id, center_id = %event.center_id))]
    pub async fn handle_appointment_group(&self, event: AppointmentGroupEvent) -> SyncResult<bool> {
        let result = self.appointment_group(&event).await;
        self.alert_on_error("appointment-group webhook", result)
    }

    async fn appointment_group(&self, event: &AppointmentGroupEvent) -> SyncResult<bool> {
        let location = self.location_for_center(&event.center_id).await?;
        let scheduling = self.clients.scheduling(&location).await?;
        let crm = self.clients.crm(&location).await?;

        let guest = scheduling.guest(&event.guest.id).await?;
        let identity = Identity::from_guest(&guest);
        let Some(opportunity) = self
            .first_opportunity(&location, crm.as_ref(), &identity)
            .await?
        else {
            return Ok(false);
        };

        let link = location.appointment_link(&event.invoice_id);
        let mut newly_registered = false;
        for appointment in &event.appointments {
            let already = self
                .ledger
                .register_booking(
                    crm.as_ref(),
                    &opportunity.contact.id,
                    &link,
                    appointment.start_time,
                )
                .await?;
            newly_registered |= !already;
        }
        if !newly_registered {
            return Ok(false);
        }
        let status = event
            .appointments
            .first()
            .map(|a| a.status)
            .unwrap_or_default();
        apply_transition(
            crm.as_ref(),
            &location.stages,
            &opportunity,
            StageEvent::booking(status),
        )
        .await?;
        Ok(true)
    }

    /// A booking made on a CRM staff calendar, replayed into the scheduling system.
    #[instrument(
        skip_all,
        fields(location_id = %event.location.id, contact_id = %event.contact_id)
    )]
    pub async fn handle_crm_appointment(
        &self,
        event: CrmAppointmentEvent,
    ) -> SyncResult<BookingOutcome> {
        let result = self.crm_appointment(&event).await;
        self.alert_on_error("CRM booking webhook", result)
    }

    async fn crm_appointment(&self, event: &CrmAppointmentEvent) -> SyncResult<BookingOutcome> {
        let location = self
            .store
            .location(&event.location.id)
            .await?
            .ok_or_else(|| SyncError::UnknownLocation(event.location.id.clone()))?;
        let scheduling = self.clients.scheduling(&location).await?;
        book_crm_appointment(self.store.as_ref(), scheduling.as_ref(), &location, event).await
    }

    /// A guest created or edited in the scheduling system.
    #[instrument(skip_all, fields(guest_id = %guest.id, center_id = %guest.center_id))]
    pub async fn handle_guest(&self, guest: Guest, updated: bool) -> SyncResult<GuestPush> {
        let location = self.location_for_center(&guest.center_id).await?;
        let crm = self.clients.crm(&location).await?;
        if updated {
            return Ok(match push_guest_update(crm.as_ref(), &guest).await? {
                Some(contact) => GuestPush::Updated(contact.id),
                None => GuestPush::NoMatch,
            });
        }
        Ok(match push_guest(crm.as_ref(), &guest).await? {
            PushOutcome::Created(contact) => GuestPush::Created(contact.id),
            PushOutcome::AlreadyPresent(id) => GuestPush::AlreadyPresent(id),
        })
    }
}

fn step_failed(first_error: &mut Option<SyncError>, step: &str, err: SyncError) {
    warn!(step, error = %err, "step failed; continuing with the next one");
    first_error.get_or_insert(err);
}
