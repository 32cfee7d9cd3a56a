use rusqlite::params;
use uuid::Uuid;

use crate::types::PlanStatus;

use super::*;

const PLAN_COLUMNS: &str = "id, owner_id, plan_date, source, inputs_snapshot, plan_json, \
     reasons_json, status, applied_at, created_at";

impl Store {
    // =====================================================================
    // Plans (append-only; latest by created_at is authoritative)
    // =====================================================================

    pub fn insert_plan(
        &self,
        owner_id: &str,
        plan_date: &str,
        source: &str,
        inputs_snapshot: &str,
        plan_json: &str,
        reasons_json: &str,
    ) -> Result<DbPlan, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO plans (id, owner_id, plan_date, source, inputs_snapshot, plan_json,
                                reasons_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'proposed', ?8)",
            params![
                id,
                owner_id,
                plan_date,
                source,
                inputs_snapshot,
                plan_json,
                reasons_json,
                now
            ],
        )?;
        Ok(DbPlan {
            id,
            owner_id: owner_id.to_string(),
            plan_date: plan_date.to_string(),
            source: source.to_string(),
            inputs_snapshot: inputs_snapshot.to_string(),
            plan_json: plan_json.to_string(),
            reasons_json: reasons_json.to_string(),
            status: PlanStatus::Proposed,
            applied_at: None,
            created_at: now,
        })
    }

    /// Latest plan for `(owner, plan_date)`.
    pub fn latest_plan(
        &self,
        owner_id: &str,
        plan_date: &str,
    ) -> Result<Option<DbPlan>, StoreError> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM plans
             WHERE owner_id = ?1 AND plan_date = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![owner_id, plan_date], Self::map_plan_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Flip a plan to applied. Idempotent: re-applying keeps the original
    /// applied_at.
    pub fn mark_plan_applied(&self, owner_id: &str, id: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE plans
             SET status = 'applied', applied_at = COALESCE(applied_at, ?1)
             WHERE owner_id = ?2 AND id = ?3",
            params![now_iso(), owner_id, id],
        )?;
        Ok(n > 0)
    }

    fn map_plan_row(row: &rusqlite::Row) -> rusqlite::Result<DbPlan> {
        let status: String = row.get(7)?;
        Ok(DbPlan {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            plan_date: row.get(2)?,
            source: row.get(3)?,
            inputs_snapshot: row.get(4)?,
            plan_json: row.get(5)?,
            reasons_json: row.get(6)?,
            status: PlanStatus::parse(&status).unwrap_or(PlanStatus::Proposed),
            applied_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}
