//! Books a CRM calendar appointment in the scheduling system.
//!
//! Booking takes three remote calls: create, reserve the slot, confirm. A failure after
//! `Created` or `Reserved` leaves an unconfirmed booking behind; the scheduling system lets
//! unconfirmed reservations lapse at their expiry time, so no cancel call is issued. The
//! error carries the state reached and the booking id so an operator can follow up.

use salesbridge_clients::{BookingRequest, Reservation, SchedulingApi};
use salesbridge_core::{CrmAppointmentEvent, Guest, Location, PersonalInfo, PhoneInfo};
use salesbridge_http::ApiError;
use tracing::{info, instrument};

use crate::error::{SyncError, SyncResult};
use crate::matcher::find_or_create_guest;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingState {
    Requested,
    Created,
    Reserved,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    pub booking_id: String,
    pub guest_id: String,
    pub reservation: Reservation,
}

pub struct BookingWorkflow<'a> {
    scheduling: &'a dyn SchedulingApi,
    state: BookingState,
    booking_id: Option<String>,
}

impl<'a> BookingWorkflow<'a> {
    pub fn new(scheduling: &'a dyn SchedulingApi) -> Self {
        Self {
            scheduling,
            state: BookingState::Requested,
            booking_id: None,
        }
    }

    pub fn state(&self) -> BookingState {
        self.state
    }

    fn fail(&self, source: ApiError) -> SyncError {
        SyncError::Booking {
            state: self.state,
            booking_id: self.booking_id.clone(),
            source,
        }
    }

    pub async fn run(&mut self, request: &BookingRequest) -> SyncResult<Reservation> {
        let booking_id = self
            .scheduling
            .create_booking(request)
            .await
            .map_err(|err| self.fail(err))?;
        self.booking_id = Some(booking_id.clone());
        self.state = BookingState::Created;

        self.scheduling
            .reserve_slot(&booking_id, request.start)
            .await
            .map_err(|err| self.fail(err))?;
        self.state = BookingState::Reserved;

        let confirmed = self
            .scheduling
            .confirm_booking(&booking_id)
            .await
            .map_err(|err| self.fail(err))?;
        self.state = BookingState::Confirmed;
        Ok(confirmed)
    }
}

fn guest_draft(event: &CrmAppointmentEvent, center_id: &str) -> Guest {
    Guest {
        center_id: center_id.to_string(),
        personal_info: PersonalInfo {
            first_name: event.first_name.trim().to_string(),
            last_name: event.last_name.trim().to_string(),
            email: event.email.trim().to_string(),
            mobile_phone: PhoneInfo {
                country_code: 0,
                number: event.phone.trim().to_string(),
            },
            gender: 0,
        },
        ..Guest::default()
    }
}

/// Mirror an appointment booked on a CRM staff calendar into the scheduling system.
#[instrument(skip_all, fields(location_id = %location.id, calendar_id = %event.calendar.id))]
pub async fn book_crm_appointment(
    store: &dyn Store,
    scheduling: &dyn SchedulingApi,
    location: &Location,
    event: &CrmAppointmentEvent,
) -> SyncResult<BookingOutcome> {
    let calendar = store
        .calendar_by_id(&location.id, &event.calendar.id)
        .await?
        .ok_or_else(|| SyncError::UnknownCalendar(event.calendar.id.clone()))?;

    let guest = find_or_create_guest(scheduling, &guest_draft(event, &location.zenoti.center_id))
        .await?;

    let request = BookingRequest {
        start: event.calendar.start_time,
        guest_id: guest.id.clone(),
        service_id: location.zenoti.service_id.clone(),
        therapist_id: calendar.staff_id.clone(),
    };
    let mut workflow = BookingWorkflow::new(scheduling);
    let reservation = workflow.run(&request).await?;
    let booking_id = workflow.booking_id.unwrap_or_default();
    info!(booking_id = %booking_id, guest_id = %guest.id, "booking confirmed");

    Ok(BookingOutcome {
        booking_id,
        guest_id: guest.id,
        reservation,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use salesbridge_clients::fake::FakeScheduling;
    use salesbridge_core::{Calendar, CrmCalendarRef, CrmLocationRef};

    use super::*;
    use crate::store::tests::location;
    use crate::store::MemoryStore;

    fn request() -> BookingRequest {
        BookingRequest {
            start: Utc.with_ymd_and_hms(2026, 4, 2, 14, 0, 0).unwrap(),
            guest_id: "g-1".into(),
            service_id: "svc-1".into(),
            therapist_id: "t-1".into(),
        }
    }

    fn event(calendar_id: &str) -> CrmAppointmentEvent {
        CrmAppointmentEvent {
            contact_id: "c-1".into(),
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            email: "jane@example.com".into(),
            phone: "+1 555 010 2000".into(),
            location: CrmLocationRef { id: "loc-1".into() },
            calendar: CrmCalendarRef {
                id: calendar_id.into(),
                selected_time_zone: "America/New_York".into(),
                start_time: Utc.with_ymd_and_hms(2026, 4, 2, 14, 0, 0).unwrap(),
            },
        }
    }

    #[tokio::test]
    async fn workflow_walks_all_three_states() {
        let scheduling = FakeScheduling::new("center-1");
        let mut workflow = BookingWorkflow::new(&scheduling);
        let reservation = workflow.run(&request()).await.expect("booked");

        assert_eq!(workflow.state(), BookingState::Confirmed);
        assert_eq!(reservation.invoice_id.as_deref(), Some("inv-booking-1"));
        assert_eq!(scheduling.calls("reserve_slot"), 1);
        assert_eq!(scheduling.calls("confirm_booking"), 1);
    }

    #[tokio::test]
    async fn failure_after_reserve_reports_state_and_booking_id() {
        let scheduling = FakeScheduling::new("center-1");
        scheduling.fail_next("confirm_booking", 400, 1);

        let mut workflow = BookingWorkflow::new(&scheduling);
        let err = workflow.run(&request()).await.expect_err("confirm fails");
        match err {
            SyncError::Booking {
                state, booking_id, ..
            } => {
                assert_eq!(state, BookingState::Reserved);
                assert_eq!(booking_id.as_deref(), Some("booking-1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_on_create_has_no_booking_id() {
        let scheduling = FakeScheduling::new("center-1");
        scheduling.fail_next("create_booking", 502, 1);

        let mut workflow = BookingWorkflow::new(&scheduling);
        let err = workflow.run(&request()).await.expect_err("create fails");
        assert!(matches!(
            err,
            SyncError::Booking {
                state: BookingState::Requested,
                booking_id: None,
                ..
            }
        ));
        assert_eq!(scheduling.calls("reserve_slot"), 0);
    }

    #[tokio::test]
    async fn crm_appointment_books_mapped_staff_with_new_guest() {
        let store = MemoryStore::new();
        let location = location("loc-1", "center-1");
        store
            .insert_calendar(&Calendar {
                location_id: "loc-1".into(),
                staff_id: "t-7".into(),
                staff_name: "Kim Lee".into(),
                calendar_id: "cal-7".into(),
            })
            .await
            .expect("calendar");
        let scheduling = FakeScheduling::new("center-1");

        let outcome = book_crm_appointment(&store, &scheduling, &location, &event("cal-7"))
            .await
            .expect("booked");
        assert_eq!(outcome.guest_id, "guest-1");

        let bookings = scheduling.bookings();
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].therapist_id, "t-7");
        assert_eq!(bookings[0].service_id, "svc-1");
        assert_eq!(scheduling.guests()[0].personal_info.mobile_phone.number, "5550102000");
    }

    #[tokio::test]
    async fn unmapped_calendar_is_rejected_before_any_call() {
        let store = MemoryStore::new();
        let scheduling = FakeScheduling::new("center-1");
        let err = book_crm_appointment(
            &store,
            &scheduling,
            &location("loc-1", "center-1"),
            &event("cal-unknown"),
        )
        .await
        .expect_err("unmapped");
        assert!(matches!(err, SyncError::UnknownCalendar(_)));
        assert_eq!(scheduling.calls("search_guests"), 0);
    }
}
