use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salesbridge_core::{
    format_external_date, format_external_time, normalize_phone, Appointment, BlockOut,
    Collection, Guest,
};
use salesbridge_http::{
    fetch_range, ApiError, ApiKeyAuth, ApiRequest, BackoffPolicy, ClientConfig,
    RateLimitedClient,
};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::{
    appointment_window, block_out_window, collection_window, BookingRequest, GuestQuery,
    Reservation, SchedulingApi,
};

#[derive(Debug, Clone)]
pub struct ZenotiConfig {
    pub base_url: String,
    pub api_key: String,
    pub center_id: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Country code stamped on guests created through the API.
    pub phone_country_code: i32,
}

impl ZenotiConfig {
    pub fn new(base_url: &str, api_key: &str, center_id: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            center_id: center_id.to_string(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
            phone_country_code: 225,
        }
    }
}

#[derive(Debug)]
pub struct ZenotiClient {
    api: RateLimitedClient,
    center_id: String,
    phone_country_code: i32,
}

/// Errors reported inside a 200 response body.
#[derive(Debug, Default, Deserialize)]
struct InlineError {
    #[serde(default, alias = "StatusCode")]
    status_code: i64,
    #[serde(default, alias = "Message")]
    message: String,
}

impl InlineError {
    fn into_result(self, method: &str, endpoint: &str) -> Result<(), ApiError> {
        if self.status_code == 0 {
            return Ok(());
        }
        Err(ApiError::Http {
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            status: u16::try_from(self.status_code).unwrap_or(400),
            body: self.message,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CollectionsReport {
    #[serde(default)]
    collections_report: Vec<Collection>,
}

#[derive(Debug, Deserialize)]
struct BlockOutList {
    #[serde(default)]
    block_out_times: Vec<BlockOut>,
}

#[derive(Debug, Deserialize)]
struct GuestList {
    #[serde(default)]
    guests: Vec<Guest>,
}

#[derive(Debug, Deserialize)]
struct BookingResponse {
    #[serde(default, alias = "Id")]
    id: String,
    #[serde(default, alias = "Error")]
    error: Option<InlineError>,
}

#[derive(Debug, Default, Deserialize)]
struct ReservationInvoice {
    #[serde(default)]
    invoice_id: String,
}

#[derive(Debug, Deserialize)]
struct ReservationResponse {
    #[serde(default)]
    reservation_id: String,
    #[serde(default, with = "salesbridge_core::external_time::option")]
    expiry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    invoice: Option<ReservationInvoice>,
    #[serde(default, alias = "Error")]
    error: Option<InlineError>,
}

impl ReservationResponse {
    fn into_reservation(self, endpoint: &str) -> Result<Reservation, ApiError> {
        if let Some(error) = self.error {
            error.into_result("POST", endpoint)?;
        }
        Ok(Reservation {
            reservation_id: self.reservation_id,
            expiry_time: self.expiry_time,
            invoice_id: self
                .invoice
                .map(|invoice| invoice.invoice_id)
                .filter(|id| !id.is_empty()),
        })
    }
}

fn dedupe_by<T>(items: Vec<T>, key: impl Fn(&T) -> String) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect()
}

impl ZenotiClient {
    pub fn new(config: ZenotiConfig) -> Result<Self, ApiError> {
        let mut client_config = ClientConfig::new(config.base_url);
        client_config.timeout = config.timeout;
        client_config.backoff = config.backoff;
        client_config
            .default_headers
            .push(("accept".to_string(), "application/json".to_string()));
        let auth = Arc::new(ApiKeyAuth::new("apikey", &config.api_key));

        Ok(Self {
            api: RateLimitedClient::new(client_config, auth)?,
            center_id: config.center_id,
            phone_country_code: config.phone_country_code,
        })
    }

    async fn appointments_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, ApiError> {
        let request = ApiRequest::get("/appointments")
            .query("center_id", self.center_id.clone())
            .query("start_date", format_external_date(&start))
            .query("end_date", format_external_date(&end));
        self.api.call_json(&request).await
    }

    async fn collections_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Collection>, ApiError> {
        let request = ApiRequest::get(format!("/Centers/{}/collections_report", self.center_id))
            .query("start_date", format_external_date(&start))
            .query("end_date", format_external_date(&end));
        let report: CollectionsReport = self.api.call_json(&request).await?;
        Ok(report.collections_report)
    }

    async fn block_outs_window(
        &self,
        employee_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BlockOut>, ApiError> {
        let request = ApiRequest::get(format!("/employees/{employee_id}/blockouttimes"))
            .query("center_id", self.center_id.clone())
            .query("start_date", format_external_date(&start))
            .query("end_date", format_external_date(&end));
        let list: BlockOutList = self.api.call_json(&request).await?;
        Ok(list.block_out_times)
    }
}

#[async_trait]
impl SchedulingApi for ZenotiClient {
    fn center_id(&self) -> &str {
        &self.center_id
    }

    // Date filters are whole days and inclusive, so adjacent windows can return the
    // same record twice.
    #[instrument(skip(self), fields(center_id = %self.center_id))]
    async fn appointments(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, ApiError> {
        let all = fetch_range(start, end, appointment_window(), |window| {
            self.appointments_window(window.start, window.end)
        })
        .await?;
        Ok(dedupe_by(all, |appointment| appointment.id.clone()))
    }

    #[instrument(skip(self), fields(center_id = %self.center_id))]
    async fn collections(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Collection>, ApiError> {
        let all = fetch_range(start, end, collection_window(), |window| {
            self.collections_window(window.start, window.end)
        })
        .await?;
        Ok(dedupe_by(all, |collection| collection.invoice_id.clone()))
    }

    async fn block_outs(
        &self,
        employee_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BlockOut>, ApiError> {
        let all = fetch_range(start, end, block_out_window(), |window| {
            self.block_outs_window(employee_id, window.start, window.end)
        })
        .await?;
        Ok(dedupe_by(all, |block| block.id.clone()))
    }

    async fn guest(&self, guest_id: &str) -> Result<Guest, ApiError> {
        self.api
            .call_json(&ApiRequest::get(format!("/guests/{guest_id}")))
            .await
    }

    async fn search_guests(&self, query: &GuestQuery) -> Result<Vec<Guest>, ApiError> {
        let request = ApiRequest::get("/guests/search");
        let request = match query {
            GuestQuery::Email(email) => request.query("email", email.clone()),
            GuestQuery::Phone(phone) => request.query("phone", normalize_phone(phone)),
        };
        match self.api.call_json::<GuestList>(&request).await {
            Ok(list) => Ok(list.guests),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn create_guest(&self, guest: &Guest) -> Result<Guest, ApiError> {
        let mut guest = guest.clone();
        guest.center_id = self.center_id.clone();
        guest.personal_info.mobile_phone.number =
            normalize_phone(&guest.personal_info.mobile_phone.number);
        guest.personal_info.mobile_phone.country_code = self.phone_country_code;

        let request = ApiRequest::post("/guests/").json(&guest)?;
        self.api.call_json(&request).await
    }

    async fn touch_guest(&self, guest_id: &str) -> Result<(), ApiError> {
        let endpoint = format!("/guests/{guest_id}");
        let current: serde_json::Value = self.api.call_json(&ApiRequest::get(&endpoint)).await?;
        let request = ApiRequest::put(&endpoint).json(&current)?;
        self.api.call(&request).await?;
        Ok(())
    }

    async fn create_booking(&self, booking: &BookingRequest) -> Result<String, ApiError> {
        let endpoint = "/bookings";
        let body = json!({
            "center_id": self.center_id,
            "date": format_external_date(&booking.start),
            "is_only_catalog_employees": false,
            "guests": [{
                "id": booking.guest_id,
                "items": [{
                    "item": {"Id": booking.service_id},
                    "room": {"id": ""},
                    "therapist": {"Id": booking.therapist_id},
                }],
            }],
        });
        let request = ApiRequest::post(endpoint)
            .query("is_double_booking_enabled", "true")
            .json(&body)?;
        let response: BookingResponse = self.api.call_json(&request).await?;
        if let Some(error) = response.error {
            error.into_result("POST", endpoint)?;
        }
        if response.id.is_empty() {
            return Err(ApiError::InvalidRequest(
                "booking created without an id".to_string(),
            ));
        }
        Ok(response.id)
    }

    async fn reserve_slot(
        &self,
        booking_id: &str,
        slot: DateTime<Utc>,
    ) -> Result<Reservation, ApiError> {
        let endpoint = format!("/bookings/{booking_id}/slots/reserve");
        let request =
            ApiRequest::post(&endpoint).json(&json!({"slot_time": format_external_time(&slot)}))?;
        let response: ReservationResponse = self.api.call_json(&request).await?;
        response.into_reservation(&endpoint)
    }

    async fn confirm_booking(&self, booking_id: &str) -> Result<Reservation, ApiError> {
        let endpoint = format!("/bookings/{booking_id}/slots/confirm");
        let response: ReservationResponse =
            self.api.call_json(&ApiRequest::post(&endpoint)).await?;
        response.into_reservation(&endpoint)
    }
}
