use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use salesbridge_core::{
    BlockSlot, Contact, CrmTokens, DndSettings, Note, Opportunity, OpportunityUpdate, PageCursor,
};
use salesbridge_http::{
    body_signals_expired_token, ApiError, ApiRequest, Authenticator, BackoffPolicy, ClientConfig,
    Page, RateLimitedClient,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::{CrmApi, OpportunityFilter, OPPORTUNITY_PAGE_LIMIT};

pub const CRM_API_VERSION: &str = "2021-04-15";

/// Persists rotated token pairs.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn save_tokens(&self, tokens: &CrmTokens) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl CrmConfig {
    pub fn new(base_url: &str, token_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OAuth2 refresh-token rotation for one CRM sub-account.
pub struct CrmAuth {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    tokens: RwLock<CrmTokens>,
    sink: Arc<dyn TokenSink>,
}

impl CrmAuth {
    pub fn new(
        config: &CrmConfig,
        tokens: CrmTokens,
        sink: Arc<dyn TokenSink>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            tokens: RwLock::new(tokens),
            sink,
        })
    }

    pub async fn tokens(&self) -> CrmTokens {
        self.tokens.read().await.clone()
    }

    fn refresh_error(&self, reason: impl Into<String>) -> ApiError {
        ApiError::AuthRefresh {
            endpoint: self.token_url.clone(),
            reason: reason.into(),
        }
    }

    /// Exchange the current refresh token, store the new pair in memory and persist it.
    pub async fn rotate(&self) -> Result<CrmTokens, ApiError> {
        let mut tokens = self.tokens.write().await;
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", tokens.refresh_token.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|err| self.refresh_error(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.refresh_error(err.to_string()))?;
        if !status.is_success() {
            return Err(self.refresh_error(format!("{status}: {body}")));
        }
        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|err| self.refresh_error(err.to_string()))?;

        tokens.access_token = parsed.access_token;
        if let Some(refresh_token) = parsed.refresh_token.filter(|t| !t.is_empty()) {
            tokens.refresh_token = refresh_token;
        }
        self.sink
            .save_tokens(&tokens)
            .await
            .map_err(|err| self.refresh_error(format!("saving tokens: {err:#}")))?;
        info!(location_id = %tokens.location_id, "crm tokens rotated");
        Ok(tokens.clone())
    }
}

#[async_trait]
impl Authenticator for CrmAuth {
    async fn authorization(&self) -> Option<String> {
        Some(format!("Bearer {}", self.tokens.read().await.access_token))
    }

    fn is_auth_expired(&self, status: StatusCode, body: &str) -> bool {
        status == StatusCode::UNAUTHORIZED && body_signals_expired_token(body)
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        self.rotate().await.map(|_| ())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContactPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    location_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dnd_settings: Option<&'a DndSettings>,
}

impl<'a> ContactPayload<'a> {
    fn from_contact(contact: &'a Contact, location_id: Option<&'a str>) -> Self {
        Self {
            location_id,
            first_name: contact.first_name.as_deref(),
            last_name: contact.last_name.as_deref(),
            email: contact.email.as_deref(),
            phone: contact.phone.as_deref(),
            tags: &contact.tags,
            source: contact.source.as_deref(),
            dnd_settings: contact.dnd_settings.as_ref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BlockSlotPayload<'a> {
    location_id: &'a str,
    calendar_id: &'a str,
    start_time: String,
    end_time: String,
    title: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    calendar_notes: &'a str,
}

impl<'a> BlockSlotPayload<'a> {
    fn from_slot(slot: &'a BlockSlot) -> Self {
        Self {
            location_id: &slot.location_id,
            calendar_id: &slot.calendar_id,
            start_time: slot.start.to_rfc3339(),
            end_time: slot.end.to_rfc3339(),
            title: &slot.title,
            calendar_notes: &slot.notes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContactList {
    #[serde(default)]
    contacts: Vec<Contact>,
}

#[derive(Debug, Deserialize)]
struct ContactEnvelope {
    contact: Contact,
}

#[derive(Debug, Deserialize)]
struct OpportunityList {
    #[serde(default)]
    opportunities: Vec<Opportunity>,
    #[serde(default)]
    meta: PageCursor,
}

#[derive(Debug, Deserialize)]
struct OpportunityEnvelope {
    opportunity: Opportunity,
}

#[derive(Debug, Deserialize)]
struct NoteList {
    #[serde(default)]
    notes: Vec<Note>,
}

#[derive(Debug, Deserialize)]
struct NoteEnvelope {
    note: Note,
}

#[derive(Debug, Deserialize)]
struct CalendarRecord {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CalendarEnvelope {
    calendar: CalendarRecord,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    id: String,
}

/// CRM client bound to one location's OAuth credentials.
pub struct CrmClient {
    api: RateLimitedClient,
    auth: Arc<CrmAuth>,
    location_id: String,
}

impl std::fmt::Debug for CrmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmClient")
            .field("location_id", &self.location_id)
            .field("api", &self.api)
            .finish_non_exhaustive()
    }
}

impl CrmClient {
    pub fn new(
        config: CrmConfig,
        tokens: CrmTokens,
        sink: Arc<dyn TokenSink>,
    ) -> Result<Self, ApiError> {
        let location_id = tokens.location_id.clone();
        let auth = Arc::new(CrmAuth::new(&config, tokens, sink)?);

        let mut client_config = ClientConfig::new(config.base_url);
        client_config.timeout = config.timeout;
        client_config.backoff = config.backoff;
        client_config.default_headers = vec![
            ("version".to_string(), CRM_API_VERSION.to_string()),
            ("accept".to_string(), "application/json".to_string()),
        ];
        let api = RateLimitedClient::new(client_config, auth.clone())?;

        Ok(Self {
            api,
            auth,
            location_id,
        })
    }

    pub async fn tokens(&self) -> CrmTokens {
        self.auth.tokens().await
    }
}

#[async_trait]
impl CrmApi for CrmClient {
    fn location_id(&self) -> &str {
        &self.location_id
    }

    async fn find_contacts(&self, query: &str) -> Result<Vec<Contact>, ApiError> {
        let request = ApiRequest::get("/contacts/")
            .query("locationId", self.location_id.clone())
            .query("query", query);
        let list: ContactList = self.api.call_json(&request).await?;
        Ok(list.contacts)
    }

    async fn create_contact(&self, contact: &Contact) -> Result<Contact, ApiError> {
        let payload = ContactPayload::from_contact(contact, Some(&self.location_id));
        let request = ApiRequest::post("/contacts/").json(&payload)?;
        let envelope: ContactEnvelope = self.api.call_json(&request).await?;
        Ok(envelope.contact)
    }

    async fn update_contact(&self, contact: &Contact) -> Result<Contact, ApiError> {
        if contact.id.is_empty() {
            return Err(ApiError::InvalidRequest(
                "cannot update a contact without an id".to_string(),
            ));
        }
        let payload = ContactPayload::from_contact(contact, None);
        let request = ApiRequest::put(format!("/contacts/{}", contact.id)).json(&payload)?;
        let envelope: ContactEnvelope = self.api.call_json(&request).await?;
        Ok(envelope.contact)
    }

    #[instrument(skip(self), fields(location_id = %self.location_id))]
    async fn search_opportunities(
        &self,
        filter: &OpportunityFilter,
        cursor: Option<&PageCursor>,
    ) -> Result<Page<Opportunity, PageCursor>, ApiError> {
        let mut request = ApiRequest::get("/opportunities/search")
            .query("location_id", self.location_id.clone())
            .query("limit", OPPORTUNITY_PAGE_LIMIT.to_string());
        if let Some(pipeline_id) = &filter.pipeline_id {
            request = request.query("pipeline_id", pipeline_id.clone());
        }
        if let Some(stage_id) = &filter.stage_id {
            request = request.query("pipeline_stage_id", stage_id.clone());
        }
        if let Some(contact_id) = &filter.contact_id {
            request = request.query("contact_id", contact_id.clone());
        }
        if let Some(cursor) = cursor.filter(|cursor| !cursor.is_exhausted()) {
            request = request
                .query("startAfter", cursor.start_after.to_string())
                .query("startAfterId", cursor.start_after_id.clone());
        }

        let list: OpportunityList = self.api.call_json(&request).await?;
        let next = (list.meta.start_after != 0).then_some(list.meta);
        Ok(Page {
            items: list.opportunities,
            next,
        })
    }

    async fn update_opportunity(
        &self,
        opportunity_id: &str,
        update: &OpportunityUpdate,
    ) -> Result<Opportunity, ApiError> {
        let request = ApiRequest::put(format!("/opportunities/{opportunity_id}")).json(update)?;
        let envelope: OpportunityEnvelope = self.api.call_json(&request).await?;
        Ok(envelope.opportunity)
    }

    async fn notes(&self, contact_id: &str) -> Result<Vec<Note>, ApiError> {
        let list: NoteList = self
            .api
            .call_json(&ApiRequest::get(format!("/contacts/{contact_id}/notes")))
            .await?;
        Ok(list.notes)
    }

    async fn create_note(&self, contact_id: &str, body: &str) -> Result<Note, ApiError> {
        let request =
            ApiRequest::post(format!("/contacts/{contact_id}/notes")).json(&json!({"body": body}))?;
        let envelope: NoteEnvelope = self.api.call_json(&request).await?;
        Ok(envelope.note)
    }

    async fn update_note(&self, note: &Note) -> Result<Note, ApiError> {
        let request = ApiRequest::put(format!("/contacts/{}/notes/{}", note.contact_id, note.id))
            .json(&json!({"body": note.body}))?;
        let envelope: NoteEnvelope = self.api.call_json(&request).await?;
        Ok(envelope.note)
    }

    async fn delete_note(&self, note: &Note) -> Result<(), ApiError> {
        self.api
            .call(&ApiRequest::delete(format!(
                "/contacts/{}/notes/{}",
                note.contact_id, note.id
            )))
            .await?;
        Ok(())
    }

    async fn create_calendar(&self, name: &str) -> Result<String, ApiError> {
        let body = json!({
            "name": name,
            "locationId": self.location_id,
            "notifications": [],
            "teamMembers": [],
            "openHours": [],
        });
        let request = ApiRequest::post("/calendars/").json(&body)?;
        let envelope: CalendarEnvelope = self.api.call_json(&request).await?;
        Ok(envelope.calendar.id)
    }

    async fn delete_calendar(&self, calendar_id: &str) -> Result<(), ApiError> {
        self.api
            .call(&ApiRequest::delete(format!("/calendars/{calendar_id}")))
            .await?;
        Ok(())
    }

    async fn create_block_slot(&self, slot: &BlockSlot) -> Result<String, ApiError> {
        let request = ApiRequest::post("/calendars/events/block-slots")
            .json(&BlockSlotPayload::from_slot(slot))?;
        let event: EventRecord = self.api.call_json(&request).await?;
        Ok(event.id)
    }

    async fn update_block_slot(&self, event_id: &str, slot: &BlockSlot) -> Result<(), ApiError> {
        let request = ApiRequest::put(format!("/calendars/events/block-slots/{event_id}"))
            .json(&BlockSlotPayload::from_slot(slot))?;
        self.api.call(&request).await?;
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), ApiError> {
        self.api
            .call(&ApiRequest::delete(format!("/calendars/events/{event_id}")))
            .await?;
        Ok(())
    }

    async fn refresh_tokens(&self) -> Result<CrmTokens, ApiError> {
        self.auth.rotate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingSink {
        saved: Mutex<Vec<CrmTokens>>,
    }

    #[async_trait]
    impl TokenSink for RecordingSink {
        async fn save_tokens(&self, tokens: &CrmTokens) -> anyhow::Result<()> {
            self.saved.lock().expect("lock").push(tokens.clone());
            Ok(())
        }
    }

    fn client(server: &MockServer, sink: Arc<RecordingSink>) -> CrmClient {
        let mut config = CrmConfig::new(
            &server.uri(),
            &format!("{}/oauth/token", server.uri()),
            "client",
            "secret",
        );
        config.backoff = BackoffPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            cool_down_padding: Duration::ZERO,
        };
        let tokens = CrmTokens {
            location_id: "loc-1".into(),
            access_token: "old-access".into(),
            refresh_token: "old-refresh".into(),
        };
        CrmClient::new(config, tokens, sink).expect("client")
    }

    #[tokio::test]
    async fn expired_token_rotates_and_persists_before_replay() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/c-1/notes"))
            .and(header("authorization", "Bearer old-access"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"message":"The access token has expired"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/contacts/c-1/notes"))
            .and(header("authorization", "Bearer new-access"))
            .and(header("version", CRM_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "notes": [{"id": "n-1", "body": "hello", "contactId": "c-1"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sink = Arc::new(RecordingSink::default());
        let crm = client(&server, sink.clone());
        let notes = crm.notes("c-1").await.expect("notes");
        assert_eq!(notes[0].body, "hello");

        let saved = sink.saved.lock().expect("lock");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].access_token, "new-access");
        assert_eq!(saved[0].refresh_token, "new-refresh");
        assert_eq!(crm.tokens().await.access_token, "new-access");
    }

    #[tokio::test]
    async fn rejected_refresh_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid JWT"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let sink = Arc::new(RecordingSink::default());
        let crm = client(&server, sink.clone());
        let err = crm.find_contacts("a@b.io").await.expect_err("auth");
        assert!(matches!(err, ApiError::AuthRefresh { .. }));
        assert!(sink.saved.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn opportunity_search_carries_cursor_pair() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/opportunities/search"))
            .and(query_param("pipeline_id", "p-1"))
            .and(query_param("startAfter", "1700000000000"))
            .and(query_param("startAfterId", "o-100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "opportunities": [{"id": "o-101", "pipelineStageId": "s-new"}],
                "meta": {"startAfter": 0, "startAfterId": "", "total": 101}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let crm = client(&server, Arc::new(RecordingSink::default()));
        let cursor = PageCursor {
            start_after: 1_700_000_000_000,
            start_after_id: "o-100".into(),
        };
        let page = crm
            .search_opportunities(&OpportunityFilter::pipeline("p-1"), Some(&cursor))
            .await
            .expect("page");
        assert_eq!(page.items.len(), 1);
        assert!(page.next.is_none());
    }
}
