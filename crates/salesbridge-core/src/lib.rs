//! Core domain model shared by the SalesBridge crates.
//!
//! Two external systems meet here: the scheduling/point-of-sale system (appointments,
//! block-outs, collections, guests) and the CRM (contacts, opportunities, notes,
//! calendars). Local records (`Location`, `Calendar`, `BlockSlot`) tie the two together.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "salesbridge-core";

// ---------------------------------------------------------------------------
// Locations and pipeline stages
// ---------------------------------------------------------------------------

/// Abstract pipeline stage, resolved from a location's configured stage ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    New,
    Booked,
    Sold,
    NoShow,
    Member,
    Other,
}

impl Stage {
    /// Booking and no-show events never move an opportunity out of these.
    pub fn is_sink(self) -> bool {
        matches!(self, Stage::Sold | Stage::Member)
    }
}

/// CRM pipeline stage identifiers configured for one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StageIds {
    pub new: String,
    pub booked: String,
    pub sold: String,
    pub no_show: String,
    pub member: String,
}

impl StageIds {
    pub fn classify(&self, stage_id: &str) -> Stage {
        let candidates = [
            (&self.sold, Stage::Sold),
            (&self.member, Stage::Member),
            (&self.booked, Stage::Booked),
            (&self.no_show, Stage::NoShow),
            (&self.new, Stage::New),
        ];
        candidates
            .into_iter()
            .find(|(id, _)| !id.is_empty() && id.as_str() == stage_id)
            .map(|(_, stage)| stage)
            .unwrap_or(Stage::Other)
    }

    pub fn id_for(&self, stage: Stage) -> Option<&str> {
        let id = match stage {
            Stage::New => &self.new,
            Stage::Booked => &self.booked,
            Stage::Sold => &self.sold,
            Stage::NoShow => &self.no_show,
            Stage::Member => &self.member,
            Stage::Other => return None,
        };
        (!id.is_empty()).then_some(id.as_str())
    }
}

/// Scheduling-system credentials and portal address for one center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ZenotiAccount {
    pub api_key: String,
    pub center_id: String,
    pub portal_url: String,
    /// Service booked for appointments created from the CRM calendar.
    pub service_id: String,
}

/// A tenant site: one scheduling center paired with one CRM sub-account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub pipeline_id: String,
    pub stages: StageIds,
    pub zenoti: ZenotiAccount,
    pub sync_calendars: bool,
    pub sync_contacts: bool,
    pub sales_sync_date: Option<DateTime<Utc>>,
    pub last_reconcile_date: Option<DateTime<Utc>>,
}

impl Location {
    /// Link to the invoice/appointment dialog in the scheduling portal.
    ///
    /// This is the identity written into the event ledger, so its shape must stay stable.
    pub fn appointment_link(&self, invoice_id: &str) -> String {
        format!(
            "{}/Appointment/DlgAppointment1.aspx?invoiceid={}",
            self.zenoti.portal_url.trim_end_matches('/'),
            invoice_id
        )
    }
}

/// OAuth token pair for a location's CRM sub-account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmTokens {
    pub location_id: String,
    pub access_token: String,
    pub refresh_token: String,
}

// ---------------------------------------------------------------------------
// Calendar mirror
// ---------------------------------------------------------------------------

/// 1:1 mapping from an external staff member to a CRM calendar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Calendar {
    pub location_id: String,
    pub staff_id: String,
    pub staff_name: String,
    pub calendar_id: String,
}

/// Local mirror of one busy interval on a CRM calendar.
///
/// `id` is the CRM event id and doubles as the mirror's primary key; it is `None`
/// until the slot has been created remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSlot {
    pub id: Option<String>,
    pub location_id: String,
    pub calendar_id: String,
    pub external_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub notes: String,
}

impl BlockSlot {
    pub fn same_interval(&self, other: &BlockSlot) -> bool {
        self.start == other.start && self.end == other.end
    }
}

// ---------------------------------------------------------------------------
// CRM records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DndStatus {
    Active,
    #[default]
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DndChannel {
    pub status: DndStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DndSettings {
    #[serde(rename = "Email", default)]
    pub email: DndChannel,
    #[serde(rename = "SMS", default)]
    pub sms: DndChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub location_id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dnd_settings: Option<DndSettings>,
}

/// Contact summary embedded in an opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OpportunityContact {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub pipeline_stage_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub monetary_value: f64,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub contact: OpportunityContact,
}

impl Opportunity {
    /// The writable projection sent back on every stage/value update.
    pub fn to_update(&self) -> OpportunityUpdate {
        OpportunityUpdate {
            pipeline_id: self.pipeline_id.clone(),
            name: self.name.clone(),
            pipeline_stage_id: self.pipeline_stage_id.clone(),
            status: self.status.clone(),
            monetary_value: self.monetary_value,
            assigned_to: self.assigned_to.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityUpdate {
    pub pipeline_id: String,
    pub name: String,
    pub pipeline_stage_id: String,
    pub status: String,
    pub monetary_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub contact_id: String,
    #[serde(default)]
    pub body: String,
}

/// Continuation pair returned by the CRM's offset-style search endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageCursor {
    #[serde(default)]
    pub start_after: i64,
    #[serde(default)]
    pub start_after_id: String,
}

impl PageCursor {
    pub fn is_exhausted(&self) -> bool {
        self.start_after == 0 && self.start_after_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Scheduling/POS records
// ---------------------------------------------------------------------------

/// Appointment status codes as reported by the scheduling system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum AppointmentStatus {
    NoShow,
    Canceled,
    Booked,
    Closed,
    CheckedIn,
    Confirmed,
    Other(i32),
}

impl From<i32> for AppointmentStatus {
    fn from(code: i32) -> Self {
        match code {
            -2 => Self::NoShow,
            -1 => Self::Canceled,
            0 => Self::Booked,
            1 => Self::Closed,
            2 => Self::CheckedIn,
            4 => Self::Confirmed,
            other => Self::Other(other),
        }
    }
}

impl From<AppointmentStatus> for i32 {
    fn from(status: AppointmentStatus) -> Self {
        match status {
            AppointmentStatus::NoShow => -2,
            AppointmentStatus::Canceled => -1,
            AppointmentStatus::Booked => 0,
            AppointmentStatus::Closed => 1,
            AppointmentStatus::CheckedIn => 2,
            AppointmentStatus::Confirmed => 4,
            AppointmentStatus::Other(code) => code,
        }
    }
}

impl Default for AppointmentStatus {
    fn default() -> Self {
        Self::Booked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Therapist {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub display_name: String,
}

impl Therapist {
    /// "First L." as used in calendar names.
    pub fn short_name(&self) -> String {
        match self.last_name.chars().next() {
            Some(initial) => format!("{} {}.", self.first_name, initial),
            None => self.first_name.clone(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DisplayPhone {
    #[serde(default)]
    pub display_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AppointmentGuest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub mobile: DisplayPhone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    #[serde(rename = "appointment_id")]
    pub id: String,
    #[serde(default)]
    pub invoice_id: String,
    #[serde(default)]
    pub guest: AppointmentGuest,
    #[serde(with = "external_time")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "external_time")]
    pub end_time: DateTime<Utc>,
    #[serde(with = "external_time")]
    pub start_time_utc: DateTime<Utc>,
    #[serde(with = "external_time")]
    pub end_time_utc: DateTime<Utc>,
    #[serde(default)]
    pub status: AppointmentStatus,
    #[serde(default)]
    pub therapist: Therapist,
}

impl Appointment {
    /// Zero-length appointments are artifacts of merged bookings.
    pub fn is_merged(&self) -> bool {
        self.start_time_utc == self.end_time_utc
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockOutType {
    #[serde(default)]
    pub name: String,
}

/// Explicit staff unavailability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockOut {
    #[serde(rename = "block_out_time_id")]
    pub id: String,
    #[serde(with = "external_time")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "external_time")]
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub employee: Therapist,
    #[serde(default)]
    pub notes: String,
    #[serde(rename = "block_out_time_type", default)]
    pub kind: BlockOutType,
}

impl BlockOut {
    pub fn title(&self) -> &str {
        if self.notes.trim().is_empty() {
            &self.kind.name
        } else {
            &self.notes
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CollectionItem {
    #[serde(default)]
    pub final_sale_price: f64,
}

/// One invoice's collected amount from the collections report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub invoice_id: String,
    #[serde(default)]
    pub total_collection: f64,
    #[serde(default)]
    pub guest_id: String,
    #[serde(default, with = "external_time::option")]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<CollectionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<Guest>,
}

impl Collection {
    pub fn items_total(&self) -> f64 {
        self.items.iter().map(|item| item.final_sale_price).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhoneInfo {
    #[serde(default)]
    pub country_code: i32,
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PersonalInfo {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub mobile_phone: PhoneInfo,
    #[serde(default)]
    pub gender: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AddressInfo {
    #[serde(default)]
    pub address_1: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub zip_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GuestPreferences {
    #[serde(default)]
    pub receive_marketing_email: bool,
    #[serde(default)]
    pub receive_marketing_sms: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Guest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub center_id: String,
    #[serde(default)]
    pub personal_info: PersonalInfo,
    #[serde(default)]
    pub address_info: AddressInfo,
    #[serde(default)]
    pub preferences: GuestPreferences,
}

impl Guest {
    pub fn email(&self) -> Option<&str> {
        non_empty(&self.personal_info.email)
    }

    pub fn phone(&self) -> Option<&str> {
        non_empty(&self.personal_info.mobile_phone.number)
    }
}

// ---------------------------------------------------------------------------
// Webhook payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InvoiceTotal {
    #[serde(default)]
    pub sum_total: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WebhookGuest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub mobile_phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceEvent {
    pub id: String,
    #[serde(default)]
    pub center_id: String,
    #[serde(default)]
    pub total_price: InvoiceTotal,
    #[serde(default)]
    pub guest: WebhookGuest,
}

impl InvoiceEvent {
    /// Collapse the webhook payload into the collection shape polled from reports.
    pub fn into_collection(self) -> Collection {
        let guest = Guest {
            id: self.guest.id.clone(),
            center_id: self.center_id.clone(),
            personal_info: PersonalInfo {
                first_name: self.guest.first_name,
                last_name: self.guest.last_name,
                email: self.guest.email,
                mobile_phone: PhoneInfo {
                    country_code: 0,
                    number: self.guest.mobile_phone,
                },
                gender: 0,
            },
            ..Guest::default()
        };
        Collection {
            invoice_id: self.id,
            total_collection: self.total_price.sum_total,
            guest_id: guest.id.clone(),
            created_date: None,
            items: Vec::new(),
            guest: Some(guest),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAppointment {
    pub appointment_id: String,
    #[serde(with = "external_time")]
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GroupGuest {
    #[serde(default)]
    pub id: String,
}

/// All appointments booked under one invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentGroupEvent {
    #[serde(default)]
    pub appointment_group_id: String,
    pub invoice_id: String,
    pub center_id: String,
    #[serde(default)]
    pub guest: GroupGuest,
    #[serde(default)]
    pub appointments: Vec<GroupAppointment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CrmLocationRef {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmCalendarRef {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "selectedTimezone", alias = "selected_time_zone")]
    pub selected_time_zone: String,
    #[serde(alias = "startTime", with = "external_time")]
    pub start_time: DateTime<Utc>,
}

/// Appointment booked on a CRM calendar, to be mirrored as a scheduling-system booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmAppointmentEvent {
    #[serde(default, alias = "contactId")]
    pub contact_id: String,
    #[serde(default, alias = "firstName")]
    pub first_name: String,
    #[serde(default, alias = "lastName")]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub location: CrmLocationRef,
    pub calendar: CrmCalendarRef,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Normalize a phone number for lookup and comparison.
///
/// Removes all whitespace, a leading `+1` country code and any remaining leading `+`.
/// The result never contains whitespace or a leading `+`, so the function is idempotent.
pub fn normalize_phone(phone: &str) -> String {
    let compact: String = phone.chars().filter(|c| !c.is_whitespace()).collect();
    let without_country = compact.strip_prefix("+1").unwrap_or(&compact);
    without_country.trim_start_matches('+').to_string()
}

pub fn phones_match(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_phone(a), normalize_phone(b));
    !a.is_empty() && a == b
}

pub const EXTERNAL_DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
pub const EXTERNAL_DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse either of the scheduling system's two time formats (date-with-time or date-only).
///
/// Values carry no offset and are interpreted as UTC.
pub fn parse_external_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(parsed.and_utc());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, EXTERNAL_DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn format_external_time(value: &DateTime<Utc>) -> String {
    value.format(EXTERNAL_DATE_TIME_FORMAT).to_string()
}

pub fn format_external_date(value: &DateTime<Utc>) -> String {
    value.format(EXTERNAL_DATE_FORMAT).to_string()
}

/// Serde adapter for scheduling-system timestamps.
pub mod external_time {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_external_time(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_external_time(&raw)
            .ok_or_else(|| D::Error::custom(format!("unrecognized time format: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(raw) if raw.trim().is_empty() => Ok(None),
                Some(raw) => super::super::parse_external_time(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("unrecognized time format: {raw}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stage_ids() -> StageIds {
        StageIds {
            new: "s-new".into(),
            booked: "s-booked".into(),
            sold: "s-sold".into(),
            no_show: "s-noshow".into(),
            member: "s-member".into(),
        }
    }

    #[test]
    fn phone_normalization_strips_prefix_plus_and_whitespace() {
        assert_eq!(normalize_phone("+1 555 123 4567"), "5551234567");
        assert_eq!(normalize_phone("+44 20 7946 0958"), "442079460958");
        assert_eq!(normalize_phone(" 555\t123 "), "555123");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn phone_normalization_is_idempotent() {
        let inputs = [
            "+1 555 123 4567",
            "++1555",
            "+1+1555",
            "+ +1 1",
            "  +  ",
            "1 (555) 010-9999",
            "+15551234567",
            "abc +1 def",
        ];
        for input in inputs {
            let once = normalize_phone(input);
            assert_eq!(normalize_phone(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn phones_match_ignores_formatting_but_not_empty() {
        assert!(phones_match("+1 555 123 4567", "5551234567"));
        assert!(!phones_match("", ""));
        assert!(!phones_match("5551234567", "5551234568"));
    }

    #[test]
    fn external_times_accept_both_formats() {
        assert_eq!(
            parse_external_time("2024-03-05T14:30:00"),
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap())
        );
        assert_eq!(
            parse_external_time("2024-03-05"),
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_external_time("05/03/2024"), None);
    }

    #[test]
    fn appointment_deserializes_from_scheduling_payload() {
        let raw = r#"{
            "appointment_id": "a-1",
            "invoice_id": "inv-1",
            "guest": {"id": "g-1", "first_name": "Ana", "last_name": "Diaz",
                      "email": "ana@example.com", "mobile": {"display_number": "+1 555 0100"}},
            "start_time": "2024-03-05T09:00:00",
            "end_time": "2024-03-05T10:00:00",
            "start_time_utc": "2024-03-05T14:00:00",
            "end_time_utc": "2024-03-05",
            "status": -2,
            "therapist": {"id": "t-1", "first_name": "Kim", "last_name": "Lee"}
        }"#;
        let appt: Appointment = serde_json::from_str(raw).expect("appointment");
        assert_eq!(appt.status, AppointmentStatus::NoShow);
        assert_eq!(appt.end_time_utc, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());
        assert_eq!(appt.therapist.short_name(), "Kim L.");
    }

    #[test]
    fn unknown_status_codes_round_trip() {
        let status: AppointmentStatus = serde_json::from_str("10").expect("status");
        assert_eq!(status, AppointmentStatus::Other(10));
        assert_eq!(serde_json::to_string(&status).expect("json"), "10");
    }

    #[test]
    fn stage_classification_uses_configured_ids() {
        let ids = stage_ids();
        assert_eq!(ids.classify("s-sold"), Stage::Sold);
        assert_eq!(ids.classify("s-noshow"), Stage::NoShow);
        assert_eq!(ids.classify("elsewhere"), Stage::Other);
        assert_eq!(StageIds::default().classify(""), Stage::Other);
        assert_eq!(ids.id_for(Stage::Booked), Some("s-booked"));
        assert_eq!(ids.id_for(Stage::Other), None);
    }

    #[test]
    fn block_out_title_falls_back_to_type_name() {
        let mut block = BlockOut {
            id: "b-1".into(),
            start_time: Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
            employee: Therapist::default(),
            notes: "  ".into(),
            kind: BlockOutType { name: "Lunch".into() },
        };
        assert_eq!(block.title(), "Lunch");
        block.notes = "Dentist".into();
        assert_eq!(block.title(), "Dentist");
    }

    #[test]
    fn appointment_link_is_stable() {
        let location = Location {
            id: "loc-1".into(),
            name: "Downtown".into(),
            pipeline_id: "p-1".into(),
            stages: stage_ids(),
            zenoti: ZenotiAccount {
                api_key: "k".into(),
                center_id: "c".into(),
                portal_url: "https://acme.zenoti.com/".into(),
                service_id: "svc".into(),
            },
            sync_calendars: true,
            sync_contacts: true,
            sales_sync_date: None,
            last_reconcile_date: None,
        };
        assert_eq!(
            location.appointment_link("inv-9"),
            "https://acme.zenoti.com/Appointment/DlgAppointment1.aspx?invoiceid=inv-9"
        );
    }

    #[test]
    fn crm_appointment_payload_accepts_camel_case_keys() {
        let raw = r#"{"contactId": "c-1", "first_name": "Ana", "email": "a@x.io",
            "phone": "+1 555", "location": {"id": "loc-1"},
            "calendar": {"id": "cal-1", "selectedTimezone": "America/Chicago",
                         "startTime": "2024-04-01T15:00:00"}}"#;
        let event: CrmAppointmentEvent = serde_json::from_str(raw).expect("event");
        assert_eq!(event.contact_id, "c-1");
        assert_eq!(event.location.id, "loc-1");
        assert_eq!(
            event.calendar.start_time,
            Utc.with_ymd_and_hms(2024, 4, 1, 15, 0, 0).unwrap()
        );
    }

    #[test]
    fn invoice_event_becomes_collection() {
        let raw = r#"{"id": "inv-7", "center_id": "c-1",
            "total_price": {"sum_total": 120.5},
            "guest": {"id": "g-7", "first_name": "Bo", "last_name": "Ng",
                      "email": "bo@example.com", "mobile_phone": "5550199"}}"#;
        let event: InvoiceEvent = serde_json::from_str(raw).expect("event");
        let collection = event.into_collection();
        assert_eq!(collection.invoice_id, "inv-7");
        assert_eq!(collection.total_collection, 120.5);
        let guest = collection.guest.expect("guest");
        assert_eq!(guest.email(), Some("bo@example.com"));
        assert_eq!(guest.phone(), Some("5550199"));
    }
}
