//! Persistence collaborator: locations, CRM tokens and the calendar/block-slot mirror.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salesbridge_clients::TokenSink;
use salesbridge_core::{BlockSlot, Calendar, CrmTokens, Location, StageIds, ZenotiAccount};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationFilter {
    All,
    CalendarSync,
    ContactSync,
}

impl LocationFilter {
    fn accepts(self, location: &Location) -> bool {
        match self {
            LocationFilter::All => true,
            LocationFilter::CalendarSync => location.sync_calendars,
            LocationFilter::ContactSync => location.sync_contacts,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn locations(&self, filter: LocationFilter) -> SyncResult<Vec<Location>>;

    async fn location(&self, id: &str) -> SyncResult<Option<Location>>;

    /// Contact-syncing location bound to a scheduling center.
    async fn location_by_center(&self, center_id: &str) -> SyncResult<Option<Location>>;

    async fn save_location(&self, location: &Location) -> SyncResult<()>;

    /// Move the sales watermark forward. Never moves it backwards.
    async fn advance_sales_watermark(
        &self,
        location_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()>;

    async fn mark_reconciled(&self, location_id: &str, at: DateTime<Utc>) -> SyncResult<()>;

    async fn crm_tokens(&self, location_id: &str) -> SyncResult<Option<CrmTokens>>;

    async fn save_crm_tokens(&self, tokens: &CrmTokens) -> SyncResult<()>;

    async fn calendars(&self, location_id: &str) -> SyncResult<Vec<Calendar>>;

    async fn calendar_by_id(
        &self,
        location_id: &str,
        calendar_id: &str,
    ) -> SyncResult<Option<Calendar>>;

    async fn insert_calendar(&self, calendar: &Calendar) -> SyncResult<()>;

    async fn block_slots(&self, calendar_id: &str) -> SyncResult<Vec<BlockSlot>>;

    /// The slot must already carry its CRM event id.
    async fn insert_block_slot(&self, slot: &BlockSlot) -> SyncResult<()>;

    async fn update_block_slot(&self, slot: &BlockSlot) -> SyncResult<()>;

    async fn delete_block_slot(&self, id: &str) -> SyncResult<()>;
}

fn event_id(slot: &BlockSlot) -> SyncResult<&str> {
    slot.id
        .as_deref()
        .ok_or_else(|| SyncError::MissingEventId(slot.external_id.clone()))
}

/// Persists rotated CRM tokens the moment the client refreshes them.
pub struct StoreTokenSink {
    store: Arc<dyn Store>,
}

impl StoreTokenSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenSink for StoreTokenSink {
    async fn save_tokens(&self, tokens: &CrmTokens) -> anyhow::Result<()> {
        self.store.save_crm_tokens(tokens).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

const LOCATION_COLUMNS: &str = r#"
    id, name, pipeline_id,
    stage_new, stage_booked, stage_sold, stage_no_show, stage_member,
    zenoti_api_key, zenoti_center_id, zenoti_portal_url, zenoti_service_id,
    sync_calendars, sync_contacts, sales_sync_date, last_reconcile_date
"#;

fn location_from_row(row: &PgRow) -> Result<Location, sqlx::Error> {
    Ok(Location {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        pipeline_id: row.try_get("pipeline_id")?,
        stages: StageIds {
            new: row.try_get("stage_new")?,
            booked: row.try_get("stage_booked")?,
            sold: row.try_get("stage_sold")?,
            no_show: row.try_get("stage_no_show")?,
            member: row.try_get("stage_member")?,
        },
        zenoti: ZenotiAccount {
            api_key: row.try_get("zenoti_api_key")?,
            center_id: row.try_get("zenoti_center_id")?,
            portal_url: row.try_get("zenoti_portal_url")?,
            service_id: row.try_get("zenoti_service_id")?,
        },
        sync_calendars: row.try_get("sync_calendars")?,
        sync_contacts: row.try_get("sync_contacts")?,
        sales_sync_date: row.try_get("sales_sync_date")?,
        last_reconcile_date: row.try_get("last_reconcile_date")?,
    })
}

fn calendar_from_row(row: &PgRow) -> Result<Calendar, sqlx::Error> {
    Ok(Calendar {
        location_id: row.try_get("location_id")?,
        staff_id: row.try_get("staff_id")?,
        staff_name: row.try_get("staff_name")?,
        calendar_id: row.try_get("calendar_id")?,
    })
}

fn block_slot_from_row(row: &PgRow) -> Result<BlockSlot, sqlx::Error> {
    Ok(BlockSlot {
        id: Some(row.try_get("id")?),
        location_id: row.try_get("location_id")?,
        calendar_id: row.try_get("calendar_id")?,
        external_id: row.try_get("external_id")?,
        start: row.try_get("start_time")?,
        end: row.try_get("end_time")?,
        title: row.try_get("title")?,
        notes: row.try_get("notes")?,
    })
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> SyncResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn locations(&self, filter: LocationFilter) -> SyncResult<Vec<Location>> {
        let condition = match filter {
            LocationFilter::All => "TRUE",
            LocationFilter::CalendarSync => "sync_calendars",
            LocationFilter::ContactSync => "sync_contacts",
        };
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE {condition} ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(location_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn location(&self, id: &str) -> SyncResult<Option<Location>> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(location_from_row).transpose()?)
    }

    async fn location_by_center(&self, center_id: &str) -> SyncResult<Option<Location>> {
        let sql = format!(
            "SELECT {LOCATION_COLUMNS} FROM locations \
             WHERE zenoti_center_id = $1 AND sync_contacts ORDER BY id LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(center_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(location_from_row).transpose()?)
    }

    async fn save_location(&self, location: &Location) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO locations (
                id, name, pipeline_id,
                stage_new, stage_booked, stage_sold, stage_no_show, stage_member,
                zenoti_api_key, zenoti_center_id, zenoti_portal_url, zenoti_service_id,
                sync_calendars, sync_contacts, sales_sync_date, last_reconcile_date
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                pipeline_id = EXCLUDED.pipeline_id,
                stage_new = EXCLUDED.stage_new,
                stage_booked = EXCLUDED.stage_booked,
                stage_sold = EXCLUDED.stage_sold,
                stage_no_show = EXCLUDED.stage_no_show,
                stage_member = EXCLUDED.stage_member,
                zenoti_api_key = EXCLUDED.zenoti_api_key,
                zenoti_center_id = EXCLUDED.zenoti_center_id,
                zenoti_portal_url = EXCLUDED.zenoti_portal_url,
                zenoti_service_id = EXCLUDED.zenoti_service_id,
                sync_calendars = EXCLUDED.sync_calendars,
                sync_contacts = EXCLUDED.sync_contacts,
                sales_sync_date = EXCLUDED.sales_sync_date,
                last_reconcile_date = EXCLUDED.last_reconcile_date
            "#,
        )
        .bind(&location.id)
        .bind(&location.name)
        .bind(&location.pipeline_id)
        .bind(&location.stages.new)
        .bind(&location.stages.booked)
        .bind(&location.stages.sold)
        .bind(&location.stages.no_show)
        .bind(&location.stages.member)
        .bind(&location.zenoti.api_key)
        .bind(&location.zenoti.center_id)
        .bind(&location.zenoti.portal_url)
        .bind(&location.zenoti.service_id)
        .bind(location.sync_calendars)
        .bind(location.sync_contacts)
        .bind(location.sales_sync_date)
        .bind(location.last_reconcile_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance_sales_watermark(
        &self,
        location_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE locations
               SET sales_sync_date = GREATEST(COALESCE(sales_sync_date, $2), $2)
             WHERE id = $1
            "#,
        )
        .bind(location_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_reconciled(&self, location_id: &str, at: DateTime<Utc>) -> SyncResult<()> {
        sqlx::query("UPDATE locations SET last_reconcile_date = $2 WHERE id = $1")
            .bind(location_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn crm_tokens(&self, location_id: &str) -> SyncResult<Option<CrmTokens>> {
        let row = sqlx::query(
            "SELECT location_id, access_token, refresh_token \
             FROM crm_tokens WHERE location_id = $1",
        )
        .bind(location_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CrmTokens {
            location_id: row.try_get("location_id")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
        }))
    }

    async fn save_crm_tokens(&self, tokens: &CrmTokens) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO crm_tokens (location_id, access_token, refresh_token, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (location_id) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                updated_at = NOW()
            "#,
        )
        .bind(&tokens.location_id)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn calendars(&self, location_id: &str) -> SyncResult<Vec<Calendar>> {
        let rows = sqlx::query(
            r#"
            SELECT location_id, staff_id, staff_name, calendar_id
              FROM calendars
             WHERE location_id = $1
             ORDER BY staff_id
            "#,
        )
        .bind(location_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(calendar_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn calendar_by_id(
        &self,
        location_id: &str,
        calendar_id: &str,
    ) -> SyncResult<Option<Calendar>> {
        let row = sqlx::query(
            r#"
            SELECT location_id, staff_id, staff_name, calendar_id
              FROM calendars
             WHERE location_id = $1 AND calendar_id = $2
            "#,
        )
        .bind(location_id)
        .bind(calendar_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(calendar_from_row).transpose()?)
    }

    async fn insert_calendar(&self, calendar: &Calendar) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO calendars (location_id, staff_id, staff_name, calendar_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&calendar.location_id)
        .bind(&calendar.staff_id)
        .bind(&calendar.staff_name)
        .bind(&calendar.calendar_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn block_slots(&self, calendar_id: &str) -> SyncResult<Vec<BlockSlot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, location_id, calendar_id, external_id, start_time, end_time, title, notes
              FROM block_slots
             WHERE calendar_id = $1
             ORDER BY start_time, id
            "#,
        )
        .bind(calendar_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(block_slot_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn insert_block_slot(&self, slot: &BlockSlot) -> SyncResult<()> {
        let id = event_id(slot)?;
        sqlx::query(
            r#"
            INSERT INTO block_slots
                (id, location_id, calendar_id, external_id, start_time, end_time, title, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(&slot.location_id)
        .bind(&slot.calendar_id)
        .bind(&slot.external_id)
        .bind(slot.start)
        .bind(slot.end)
        .bind(&slot.title)
        .bind(&slot.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_block_slot(&self, slot: &BlockSlot) -> SyncResult<()> {
        let id = event_id(slot)?;
        sqlx::query(
            r#"
            UPDATE block_slots
               SET start_time = $2, end_time = $3, title = $4, notes = $5
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(slot.start)
        .bind(slot.end)
        .bind(&slot.title)
        .bind(&slot.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_block_slot(&self, id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM block_slots WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    locations: BTreeMap<String, Location>,
    tokens: BTreeMap<String, CrmTokens>,
    calendars: Vec<Calendar>,
    slots: Vec<BlockSlot>,
}

/// Map-backed store for tests and dry runs.
///
/// Unlike Postgres it does not enforce block-slot uniqueness, so duplicate mirror rows
/// can be seeded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_block_slots(&self) -> Vec<BlockSlot> {
        self.state.read().await.slots.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn locations(&self, filter: LocationFilter) -> SyncResult<Vec<Location>> {
        let state = self.state.read().await;
        Ok(state
            .locations
            .values()
            .filter(|location| filter.accepts(location))
            .cloned()
            .collect())
    }

    async fn location(&self, id: &str) -> SyncResult<Option<Location>> {
        Ok(self.state.read().await.locations.get(id).cloned())
    }

    async fn location_by_center(&self, center_id: &str) -> SyncResult<Option<Location>> {
        let state = self.state.read().await;
        Ok(state
            .locations
            .values()
            .find(|l| l.sync_contacts && l.zenoti.center_id == center_id)
            .cloned())
    }

    async fn save_location(&self, location: &Location) -> SyncResult<()> {
        self.state
            .write()
            .await
            .locations
            .insert(location.id.clone(), location.clone());
        Ok(())
    }

    async fn advance_sales_watermark(
        &self,
        location_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut state = self.state.write().await;
        let location = state
            .locations
            .get_mut(location_id)
            .ok_or_else(|| SyncError::UnknownLocation(location_id.to_string()))?;
        location.sales_sync_date = Some(location.sales_sync_date.map_or(at, |prev| prev.max(at)));
        Ok(())
    }

    async fn mark_reconciled(&self, location_id: &str, at: DateTime<Utc>) -> SyncResult<()> {
        let mut state = self.state.write().await;
        let location = state
            .locations
            .get_mut(location_id)
            .ok_or_else(|| SyncError::UnknownLocation(location_id.to_string()))?;
        location.last_reconcile_date = Some(at);
        Ok(())
    }

    async fn crm_tokens(&self, location_id: &str) -> SyncResult<Option<CrmTokens>> {
        Ok(self.state.read().await.tokens.get(location_id).cloned())
    }

    async fn save_crm_tokens(&self, tokens: &CrmTokens) -> SyncResult<()> {
        self.state
            .write()
            .await
            .tokens
            .insert(tokens.location_id.clone(), tokens.clone());
        Ok(())
    }

    async fn calendars(&self, location_id: &str) -> SyncResult<Vec<Calendar>> {
        let state = self.state.read().await;
        Ok(state
            .calendars
            .iter()
            .filter(|c| c.location_id == location_id)
            .cloned()
            .collect())
    }

    async fn calendar_by_id(
        &self,
        location_id: &str,
        calendar_id: &str,
    ) -> SyncResult<Option<Calendar>> {
        let state = self.state.read().await;
        Ok(state
            .calendars
            .iter()
            .find(|c| c.location_id == location_id && c.calendar_id == calendar_id)
            .cloned())
    }

    async fn insert_calendar(&self, calendar: &Calendar) -> SyncResult<()> {
        let mut state = self.state.write().await;
        let taken = state
            .calendars
            .iter()
            .any(|c| c.location_id == calendar.location_id && c.staff_id == calendar.staff_id);
        if taken {
            return Err(SyncError::Config(format!(
                "calendar for staff {} already mapped",
                calendar.staff_id
            )));
        }
        state.calendars.push(calendar.clone());
        Ok(())
    }

    async fn block_slots(&self, calendar_id: &str) -> SyncResult<Vec<BlockSlot>> {
        let state = self.state.read().await;
        Ok(state
            .slots
            .iter()
            .filter(|s| s.calendar_id == calendar_id)
            .cloned()
            .collect())
    }

    async fn insert_block_slot(&self, slot: &BlockSlot) -> SyncResult<()> {
        event_id(slot)?;
        self.state.write().await.slots.push(slot.clone());
        Ok(())
    }

    async fn update_block_slot(&self, slot: &BlockSlot) -> SyncResult<()> {
        let id = event_id(slot)?;
        let mut state = self.state.write().await;
        if let Some(stored) = state.slots.iter_mut().find(|s| s.id.as_deref() == Some(id)) {
            *stored = slot.clone();
        }
        Ok(())
    }

    async fn delete_block_slot(&self, id: &str) -> SyncResult<()> {
        self.state
            .write()
            .await
            .slots
            .retain(|s| s.id.as_deref() != Some(id));
        Ok(())
    }
}
