use chrono::{Duration, Utc};
use rusqlite::params;

use super::*;

const CATALOG_COLUMNS: &str = "id, provider, model_id, display_name, input_price_per_mtok, \
     output_price_per_mtok, tier, enabled, pricing_is_placeholder, sort_order";

/// Usage-event insert payload (the id and timestamp are store-assigned).
#[derive(Debug, Clone)]
pub struct UsageEventInput {
    pub feature: String,
    pub provider: String,
    pub model_id: String,
    pub model_source: String,
    pub status: String,
    pub latency_ms: i64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub estimated_cost_usd: Option<f64>,
    pub cache_status: Option<String>,
    pub request_fingerprint: Option<String>,
}

impl Store {
    // =====================================================================
    // Model catalog (global rows, not owner-scoped)
    // =====================================================================

    pub fn get_catalog_model(&self, id: &str) -> Result<Option<DbCatalogModel>, StoreError> {
        let sql = format!("SELECT {CATALOG_COLUMNS} FROM llm_model_catalog WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::map_catalog_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn find_catalog_model(
        &self,
        provider: &str,
        model_id: &str,
    ) -> Result<Option<DbCatalogModel>, StoreError> {
        let sql = format!(
            "SELECT {CATALOG_COLUMNS} FROM llm_model_catalog WHERE provider = ?1 AND model_id = ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![provider, model_id], Self::map_catalog_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_catalog_models(
        &self,
        enabled_only: bool,
    ) -> Result<Vec<DbCatalogModel>, StoreError> {
        let sql = if enabled_only {
            format!(
                "SELECT {CATALOG_COLUMNS} FROM llm_model_catalog
                 WHERE enabled = 1 ORDER BY sort_order ASC"
            )
        } else {
            format!("SELECT {CATALOG_COLUMNS} FROM llm_model_catalog ORDER BY sort_order ASC")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_catalog_row)?;

        let mut models = Vec::new();
        for row in rows {
            models.push(row?);
        }
        Ok(models)
    }

    fn map_catalog_row(row: &rusqlite::Row) -> rusqlite::Result<DbCatalogModel> {
        Ok(DbCatalogModel {
            id: row.get(0)?,
            provider: row.get(1)?,
            model_id: row.get(2)?,
            display_name: row.get(3)?,
            input_price_per_mtok: row.get(4)?,
            output_price_per_mtok: row.get(5)?,
            tier: row.get(6)?,
            enabled: row.get(7)?,
            pricing_is_placeholder: row.get(8)?,
            sort_order: row.get(9)?,
        })
    }

    // =====================================================================
    // Per-feature model preferences
    // =====================================================================

    pub fn get_model_preference(
        &self,
        owner_id: &str,
        feature: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT catalog_id FROM llm_user_prefs WHERE owner_id = ?1 AND feature = ?2",
        )?;
        let mut rows = stmt.query_map(params![owner_id, feature], |row| {
            row.get::<_, Option<String>>(0)
        })?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Ok(None),
        }
    }

    /// Upsert a preference. `None` clears the override.
    pub fn set_model_preference(
        &self,
        owner_id: &str,
        feature: &str,
        catalog_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO llm_user_prefs (owner_id, feature, catalog_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_id, feature) DO UPDATE SET
                 catalog_id = excluded.catalog_id,
                 updated_at = excluded.updated_at",
            params![owner_id, feature, catalog_id, now_iso()],
        )?;
        Ok(())
    }

    pub fn list_model_preferences(
        &self,
        owner_id: &str,
    ) -> Result<Vec<(String, Option<String>)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT feature, catalog_id FROM llm_user_prefs WHERE owner_id = ?1 ORDER BY feature",
        )?;
        let rows = stmt.query_map(params![owner_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut prefs = Vec::new();
        for row in rows {
            prefs.push(row?);
        }
        Ok(prefs)
    }

    // =====================================================================
    // Usage events (append-only telemetry)
    // =====================================================================

    pub fn insert_usage_event(
        &self,
        owner_id: &str,
        event: &UsageEventInput,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO llm_usage_events (owner_id, feature, provider, model_id, model_source,
                 status, latency_ms, input_tokens, output_tokens, estimated_cost_usd,
                 cache_status, request_fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                owner_id,
                event.feature,
                event.provider,
                event.model_id,
                event.model_source,
                event.status,
                event.latency_ms,
                event.input_tokens,
                event.output_tokens,
                event.estimated_cost_usd,
                event.cache_status,
                event.request_fingerprint,
                now_iso(),
            ],
        )?;
        Ok(())
    }

    pub fn list_usage_events(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> Result<Vec<DbUsageEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, feature, provider, model_id, model_source, status, latency_ms,
                    input_tokens, output_tokens, estimated_cost_usd, cache_status,
                    request_fingerprint, created_at
             FROM llm_usage_events
             WHERE owner_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![owner_id, limit], |row| {
            Ok(DbUsageEvent {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                feature: row.get(2)?,
                provider: row.get(3)?,
                model_id: row.get(4)?,
                model_source: row.get(5)?,
                status: row.get(6)?,
                latency_ms: row.get(7)?,
                input_tokens: row.get(8)?,
                output_tokens: row.get(9)?,
                estimated_cost_usd: row.get(10)?,
                cache_status: row.get(11)?,
                request_fingerprint: row.get(12)?,
                created_at: row.get(13)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Retention prune across all owners. Called at most once per 24h per
    /// process; failures are logged upstream, never surfaced.
    pub fn prune_usage_events(&self, horizon_days: i64) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - Duration::days(horizon_days))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let n = self.conn.execute(
            "DELETE FROM llm_usage_events WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn usage(status: &str) -> UsageEventInput {
        UsageEventInput {
            feature: "briefing_narrative".to_string(),
            provider: "anthropic".to_string(),
            model_id: "claude-3-5-haiku-latest".to_string(),
            model_source: "default".to_string(),
            status: status.to_string(),
            latency_ms: 120,
            input_tokens: Some(800),
            output_tokens: Some(60),
            estimated_cost_usd: Some(0.0011),
            cache_status: Some("miss".to_string()),
            request_fingerprint: Some("fp".to_string()),
        }
    }

    #[test]
    fn catalog_seed_is_queryable() {
        let store = store();
        let models = store.list_catalog_models(true).unwrap();
        assert!(models.len() >= 4);
        assert!(models.windows(2).all(|w| w[0].sort_order <= w[1].sort_order));

        let haiku = store
            .find_catalog_model("anthropic", "claude-3-5-haiku-latest")
            .unwrap()
            .unwrap();
        assert!(haiku.pricing_is_placeholder);
    }

    #[test]
    fn preference_upsert_and_clear() {
        let store = store();
        store
            .set_model_preference("o1", "briefing_narrative", Some("cat-openai-4o-mini"))
            .unwrap();
        assert_eq!(
            store
                .get_model_preference("o1", "briefing_narrative")
                .unwrap()
                .as_deref(),
            Some("cat-openai-4o-mini")
        );

        store
            .set_model_preference("o1", "briefing_narrative", None)
            .unwrap();
        assert_eq!(
            store.get_model_preference("o1", "briefing_narrative").unwrap(),
            None
        );
    }

    #[test]
    fn usage_events_append_and_prune() {
        let store = store();
        store.insert_usage_event("o1", &usage("success")).unwrap();
        store.insert_usage_event("o1", &usage("cache_hit")).unwrap();

        let events = store.list_usage_events("o1", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, "cache_hit", "newest first");

        // Fresh events survive the horizon.
        assert_eq!(store.prune_usage_events(30).unwrap(), 0);
        store
            .conn_ref()
            .execute(
                "UPDATE llm_usage_events SET created_at = '2020-01-01T00:00:00Z'",
                [],
            )
            .unwrap();
        assert_eq!(store.prune_usage_events(30).unwrap(), 2);
    }
}
