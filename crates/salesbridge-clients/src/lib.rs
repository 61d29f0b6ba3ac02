//! Collaborator contracts for the scheduling system and the CRM, with HTTP implementations.

mod crm;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
mod zenoti;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use salesbridge_core::{
    Appointment, BlockOut, BlockSlot, Collection, Contact, CrmTokens, Guest, Note, Opportunity,
    OpportunityUpdate, PageCursor,
};
use salesbridge_http::{fetch_pages, ApiError, Page};

pub use crm::{CrmAuth, CrmClient, CrmConfig, TokenSink, CRM_API_VERSION};
pub use zenoti::{ZenotiClient, ZenotiConfig};

pub const CRATE_NAME: &str = "salesbridge-clients";

/// Widest date span the scheduling system accepts per appointments query.
pub const APPOINTMENT_WINDOW_DAYS: i64 = 10;
/// Widest date span the collections report accepts per query.
pub const COLLECTION_WINDOW_DAYS: i64 = 6;
pub const BLOCK_OUT_WINDOW_DAYS: i64 = 10;
/// Page size for CRM opportunity searches.
pub const OPPORTUNITY_PAGE_LIMIT: u32 = 100;

pub fn appointment_window() -> Duration {
    Duration::days(APPOINTMENT_WINDOW_DAYS)
}

pub fn collection_window() -> Duration {
    Duration::days(COLLECTION_WINDOW_DAYS)
}

pub fn block_out_window() -> Duration {
    Duration::days(BLOCK_OUT_WINDOW_DAYS)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestQuery {
    Email(String),
    Phone(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub start: DateTime<Utc>,
    pub guest_id: String,
    pub service_id: String,
    pub therapist_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reservation {
    pub reservation_id: String,
    pub expiry_time: Option<DateTime<Utc>>,
    pub invoice_id: Option<String>,
}

/// Read/write surface of the scheduling/point-of-sale system for one center.
#[async_trait]
pub trait SchedulingApi: Send + Sync {
    fn center_id(&self) -> &str;

    /// Appointments in `[start, end)`, fetched in provider-sized windows.
    async fn appointments(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, ApiError>;

    async fn collections(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Collection>, ApiError>;

    async fn block_outs(
        &self,
        employee_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BlockOut>, ApiError>;

    async fn guest(&self, guest_id: &str) -> Result<Guest, ApiError>;

    async fn search_guests(&self, query: &GuestQuery) -> Result<Vec<Guest>, ApiError>;

    async fn create_guest(&self, guest: &Guest) -> Result<Guest, ApiError>;

    /// Re-save a guest unchanged so the scheduling system refreshes derived fields.
    async fn touch_guest(&self, guest_id: &str) -> Result<(), ApiError>;

    /// Returns the new booking id.
    async fn create_booking(&self, request: &BookingRequest) -> Result<String, ApiError>;

    async fn reserve_slot(
        &self,
        booking_id: &str,
        slot: DateTime<Utc>,
    ) -> Result<Reservation, ApiError>;

    async fn confirm_booking(&self, booking_id: &str) -> Result<Reservation, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpportunityFilter {
    pub pipeline_id: Option<String>,
    pub stage_id: Option<String>,
    pub contact_id: Option<String>,
}

impl OpportunityFilter {
    pub fn pipeline(pipeline_id: &str) -> Self {
        Self {
            pipeline_id: Some(pipeline_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_contact(mut self, contact_id: &str) -> Self {
        self.contact_id = Some(contact_id.to_string());
        self
    }

    pub fn with_stage(mut self, stage_id: &str) -> Self {
        self.stage_id = Some(stage_id.to_string());
        self
    }
}

/// CRM sub-account surface for one location.
#[async_trait]
pub trait CrmApi: Send + Sync {
    fn location_id(&self) -> &str;

    /// Free-text contact search (email or phone).
    async fn find_contacts(&self, query: &str) -> Result<Vec<Contact>, ApiError>;

    async fn create_contact(&self, contact: &Contact) -> Result<Contact, ApiError>;

    async fn update_contact(&self, contact: &Contact) -> Result<Contact, ApiError>;

    /// One page of an opportunity search. `cursor` is `None` for the first page.
    async fn search_opportunities(
        &self,
        filter: &OpportunityFilter,
        cursor: Option<&PageCursor>,
    ) -> Result<Page<Opportunity, PageCursor>, ApiError>;

    async fn update_opportunity(
        &self,
        opportunity_id: &str,
        update: &OpportunityUpdate,
    ) -> Result<Opportunity, ApiError>;

    async fn notes(&self, contact_id: &str) -> Result<Vec<Note>, ApiError>;

    async fn create_note(&self, contact_id: &str, body: &str) -> Result<Note, ApiError>;

    async fn update_note(&self, note: &Note) -> Result<Note, ApiError>;

    async fn delete_note(&self, note: &Note) -> Result<(), ApiError>;

    /// Returns the new calendar id.
    async fn create_calendar(&self, name: &str) -> Result<String, ApiError>;

    async fn delete_calendar(&self, calendar_id: &str) -> Result<(), ApiError>;

    /// Returns the new event id.
    async fn create_block_slot(&self, slot: &BlockSlot) -> Result<String, ApiError>;

    async fn update_block_slot(&self, event_id: &str, slot: &BlockSlot) -> Result<(), ApiError>;

    async fn delete_event(&self, event_id: &str) -> Result<(), ApiError>;

    /// Exchange the stored refresh token for a new pair and persist it.
    async fn refresh_tokens(&self) -> Result<CrmTokens, ApiError>;
}

/// Every opportunity matching `filter`, following the CRM's continuation cursor.
pub async fn all_opportunities(
    crm: &dyn CrmApi,
    filter: &OpportunityFilter,
) -> Result<Vec<Opportunity>, ApiError> {
    fetch_pages(|cursor: Option<PageCursor>| async move {
        crm.search_opportunities(filter, cursor.as_ref()).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::fake::FakeCrm;
    use super::*;

    #[tokio::test]
    async fn all_opportunities_walks_every_page() {
        let crm = FakeCrm::new("loc-1").with_page_size(2);
        for n in 0..5 {
            crm.seed_opportunity(Opportunity {
                id: format!("o-{n}"),
                pipeline_id: "p-1".into(),
                ..Opportunity::default()
            });
        }

        let all = all_opportunities(&crm, &OpportunityFilter::pipeline("p-1"))
            .await
            .expect("pages");
        let ids: Vec<_> = all.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["o-0", "o-1", "o-2", "o-3", "o-4"]);
        assert_eq!(crm.calls("search_opportunities"), 3);
    }
}
