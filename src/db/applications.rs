use std::collections::HashMap;

use rusqlite::params;
use uuid::Uuid;

use crate::types::{Phase, Rag};

use super::*;

const APP_COLUMNS: &str = "id, owner_id, name, phase, rag, priority_weight, portfolio_rank, \
     stakeholders, keywords, status_summary, next_milestone, target_date, created_at, updated_at";

/// Whitelisted application PATCH fields.
#[derive(Debug, Clone, Default)]
pub struct ApplicationPatch {
    pub name: Option<String>,
    pub phase: Option<Phase>,
    pub rag: Option<Rag>,
    pub priority_weight: Option<f64>,
    pub stakeholders: Option<Vec<String>>,
    pub keywords: Option<Vec<String>>,
    pub status_summary: Option<Option<String>>,
    pub next_milestone: Option<Option<String>>,
    pub target_date: Option<Option<String>>,
}

impl Store {
    // =====================================================================
    // Applications
    // =====================================================================

    pub fn create_application(
        &self,
        owner_id: &str,
        name: &str,
        phase: Phase,
        rag: Rag,
        stakeholders: &[String],
        keywords: &[String],
    ) -> Result<DbApplication, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO implementations (id, owner_id, name, phase, rag, priority_weight,
                 stakeholders, keywords, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 5, ?6, ?7, ?8, ?8)",
            params![
                id,
                owner_id,
                name,
                phase.as_str(),
                rag.as_str(),
                serde_json::to_string(stakeholders).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(keywords).unwrap_or_else(|_| "[]".into()),
                now,
            ],
        )?;
        self.get_application(owner_id, &id)?
            .ok_or_else(|| StoreError::Conflict("application vanished after insert".into()))
    }

    pub fn get_application(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<Option<DbApplication>, StoreError> {
        let sql =
            format!("SELECT {APP_COLUMNS} FROM implementations WHERE owner_id = ?1 AND id = ?2");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![owner_id, id], Self::map_application_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All applications for an owner, ranked ones first.
    pub fn list_applications(&self, owner_id: &str) -> Result<Vec<DbApplication>, StoreError> {
        let sql = format!(
            "SELECT {APP_COLUMNS} FROM implementations
             WHERE owner_id = ?1
             ORDER BY portfolio_rank IS NULL, portfolio_rank ASC, name ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id], Self::map_application_row)?;

        let mut apps = Vec::new();
        for row in rows {
            apps.push(row?);
        }
        Ok(apps)
    }

    pub fn apply_application_patch(
        &self,
        owner_id: &str,
        id: &str,
        patch: &ApplicationPatch,
    ) -> Result<Option<DbApplication>, StoreError> {
        if self.get_application(owner_id, id)?.is_none() {
            return Ok(None);
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        let mut push = |sets: &mut Vec<String>,
                        values: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
                        column: &str,
                        value: Box<dyn rusqlite::types::ToSql>| {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        };

        if let Some(ref name) = patch.name {
            push(&mut sets, &mut values, "name", Box::new(name.clone()));
        }
        if let Some(phase) = patch.phase {
            push(
                &mut sets,
                &mut values,
                "phase",
                Box::new(phase.as_str().to_string()),
            );
        }
        if let Some(rag) = patch.rag {
            push(&mut sets, &mut values, "rag", Box::new(rag.as_str().to_string()));
        }
        if let Some(priority_weight) = patch.priority_weight {
            push(
                &mut sets,
                &mut values,
                "priority_weight",
                Box::new(priority_weight.clamp(0.0, 10.0)),
            );
        }
        if let Some(ref stakeholders) = patch.stakeholders {
            push(
                &mut sets,
                &mut values,
                "stakeholders",
                Box::new(serde_json::to_string(stakeholders).unwrap_or_else(|_| "[]".into())),
            );
        }
        if let Some(ref keywords) = patch.keywords {
            push(
                &mut sets,
                &mut values,
                "keywords",
                Box::new(serde_json::to_string(keywords).unwrap_or_else(|_| "[]".into())),
            );
        }
        if let Some(ref status_summary) = patch.status_summary {
            push(
                &mut sets,
                &mut values,
                "status_summary",
                Box::new(status_summary.clone()),
            );
        }
        if let Some(ref next_milestone) = patch.next_milestone {
            push(
                &mut sets,
                &mut values,
                "next_milestone",
                Box::new(next_milestone.clone()),
            );
        }
        if let Some(ref target_date) = patch.target_date {
            push(
                &mut sets,
                &mut values,
                "target_date",
                Box::new(target_date.clone()),
            );
        }

        if !sets.is_empty() {
            values.push(Box::new(now_iso()));
            sets.push(format!("updated_at = ?{}", values.len()));

            values.push(Box::new(owner_id.to_string()));
            let owner_idx = values.len();
            values.push(Box::new(id.to_string()));
            let id_idx = values.len();

            let sql = format!(
                "UPDATE implementations SET {} WHERE owner_id = ?{} AND id = ?{}",
                sets.join(", "),
                owner_idx,
                id_idx
            );
            self.conn.execute(
                &sql,
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            )?;
        }

        self.get_application(owner_id, id)
    }

    /// Atomic portfolio reorder. `ordered_ids` has been validated as a
    /// permutation of the owner's applications.
    ///
    /// Ranks are cleared first so the unique `(owner, rank)` index never
    /// sees a duplicate mid-flight; both phases commit together.
    pub fn reorder_applications(
        &self,
        owner_id: &str,
        ordered_ids: &[String],
    ) -> Result<Vec<DbApplication>, StoreError> {
        let n = ordered_ids.len();
        self.with_transaction(|store| {
            store.conn.execute(
                "UPDATE implementations SET portfolio_rank = NULL WHERE owner_id = ?1",
                params![owner_id],
            )?;

            for (index, id) in ordered_ids.iter().enumerate() {
                let weight = portfolio_weight(index, n);
                store.conn.execute(
                    "UPDATE implementations
                     SET portfolio_rank = ?1, priority_weight = ?2, updated_at = ?3
                     WHERE owner_id = ?4 AND id = ?5",
                    params![(index + 1) as i64, weight, now_iso(), owner_id, id],
                )?;
            }
            Ok(())
        })?;

        self.list_applications(owner_id)
    }

    /// `implementation_id → priority_weight` for the planner. Missing rows
    /// default to 5 at the call site.
    pub fn application_weight_map(
        &self,
        owner_id: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, priority_weight FROM implementations WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (id, weight) = row?;
            map.insert(id, weight);
        }
        Ok(map)
    }

    fn map_application_row(row: &rusqlite::Row) -> rusqlite::Result<DbApplication> {
        let phase: String = row.get(3)?;
        let rag: String = row.get(4)?;
        let stakeholders: Option<String> = row.get(7)?;
        let keywords: Option<String> = row.get(8)?;
        Ok(DbApplication {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            phase: Phase::parse(&phase).unwrap_or(Phase::Intake),
            rag: Rag::parse(&rag).unwrap_or(Rag::Green),
            priority_weight: row.get(5)?,
            portfolio_rank: row.get(6)?,
            stakeholders: decode_string_list(stakeholders),
            keywords: decode_string_list(keywords),
            status_summary: row.get(9)?,
            next_milestone: row.get(10)?,
            target_date: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    // =====================================================================
    // Status updates
    // =====================================================================

    pub fn add_status_update(
        &self,
        owner_id: &str,
        implementation_id: &str,
        snippet: &str,
    ) -> Result<DbStatusUpdate, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO status_updates (id, owner_id, implementation_id, snippet, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, owner_id, implementation_id, snippet, now],
        )?;
        Ok(DbStatusUpdate {
            id,
            owner_id: owner_id.to_string(),
            implementation_id: implementation_id.to_string(),
            snippet: snippet.to_string(),
            created_at: now,
        })
    }

    pub fn list_status_updates(
        &self,
        owner_id: &str,
        implementation_id: &str,
        limit: u32,
    ) -> Result<Vec<DbStatusUpdate>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, implementation_id, snippet, created_at
             FROM status_updates
             WHERE owner_id = ?1 AND implementation_id = ?2
             ORDER BY created_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![owner_id, implementation_id, limit], |row| {
            Ok(DbStatusUpdate {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                implementation_id: row.get(2)?,
                snippet: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut updates = Vec::new();
        for row in rows {
            updates.push(row?);
        }
        Ok(updates)
    }
}

/// Rank-derived weight: evenly spread over [0, 10], top rank heaviest.
/// A portfolio of one keeps full weight.
fn portfolio_weight(index: usize, n: usize) -> f64 {
    if n <= 1 {
        return 10.0;
    }
    let raw = 10.0 - 10.0 * index as f64 / (n as f64 - 1.0);
    raw.round().clamp(0.0, 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn app(store: &Store, owner: &str, name: &str) -> DbApplication {
        store
            .create_application(owner, name, Phase::Build, Rag::Green, &[], &[])
            .unwrap()
    }

    #[test]
    fn reorder_assigns_ranks_and_spread_weights() {
        let store = store();
        let p = app(&store, "o1", "P");
        let q = app(&store, "o1", "Q");
        let r = app(&store, "o1", "R");
        let s = app(&store, "o1", "S");

        let ordered = vec![s.id.clone(), p.id.clone(), r.id.clone(), q.id.clone()];
        let after = store.reorder_applications("o1", &ordered).unwrap();

        let by_id: std::collections::HashMap<&str, &DbApplication> =
            after.iter().map(|a| (a.id.as_str(), a)).collect();

        assert_eq!(by_id[s.id.as_str()].portfolio_rank, Some(1));
        assert_eq!(by_id[p.id.as_str()].portfolio_rank, Some(2));
        assert_eq!(by_id[r.id.as_str()].portfolio_rank, Some(3));
        assert_eq!(by_id[q.id.as_str()].portfolio_rank, Some(4));

        // clamp(round(10 - 10i/3)) for i = 0..3
        assert_eq!(by_id[s.id.as_str()].priority_weight, 10.0);
        assert_eq!(by_id[p.id.as_str()].priority_weight, 7.0);
        assert_eq!(by_id[r.id.as_str()].priority_weight, 3.0);
        assert_eq!(by_id[q.id.as_str()].priority_weight, 0.0);
    }

    #[test]
    fn reorder_twice_is_safe_under_unique_rank_index() {
        let store = store();
        let a = app(&store, "o1", "A");
        let b = app(&store, "o1", "B");

        store
            .reorder_applications("o1", &[a.id.clone(), b.id.clone()])
            .unwrap();
        // Reversing forces rank collisions unless ranks clear first.
        let after = store
            .reorder_applications("o1", &[b.id.clone(), a.id.clone()])
            .unwrap();
        assert_eq!(after[0].id, b.id);
        assert_eq!(after[0].portfolio_rank, Some(1));
    }

    #[test]
    fn single_application_portfolio_keeps_full_weight() {
        let store = store();
        let only = app(&store, "o1", "Only");
        let after = store.reorder_applications("o1", &[only.id]).unwrap();
        assert_eq!(after[0].priority_weight, 10.0);
        assert_eq!(after[0].portfolio_rank, Some(1));
    }

    #[test]
    fn weight_map_reflects_reorder() {
        let store = store();
        let a = app(&store, "o1", "A");
        let b = app(&store, "o1", "B");
        store
            .reorder_applications("o1", &[a.id.clone(), b.id.clone()])
            .unwrap();

        let map = store.application_weight_map("o1").unwrap();
        assert_eq!(map[&a.id], 10.0);
        assert_eq!(map[&b.id], 0.0);
    }

    #[test]
    fn patch_updates_status_fields() {
        let store = store();
        let a = app(&store, "o1", "Workday");
        let patched = store
            .apply_application_patch(
                "o1",
                &a.id,
                &ApplicationPatch {
                    phase: Some(Phase::GoLive),
                    rag: Some(Rag::Yellow),
                    status_summary: Some(Some("UAT exit pending".to_string())),
                    next_milestone: Some(Some("Cutover rehearsal".to_string())),
                    ..ApplicationPatch::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(patched.phase, Phase::GoLive);
        assert_eq!(patched.rag, Rag::Yellow);
        assert_eq!(patched.status_summary.as_deref(), Some("UAT exit pending"));
    }

    #[test]
    fn status_updates_append_and_list_newest_first() {
        let store = store();
        let a = app(&store, "o1", "Workday");
        store.add_status_update("o1", &a.id, "first").unwrap();
        store.add_status_update("o1", &a.id, "second").unwrap();

        let updates = store.list_status_updates("o1", &a.id, 10).unwrap();
        assert_eq!(updates.len(), 2);
        // Same-second inserts tie on created_at; both snippets present.
        let snippets: Vec<&str> = updates.iter().map(|u| u.snippet.as_str()).collect();
        assert!(snippets.contains(&"first"));
        assert!(snippets.contains(&"second"));
    }
}
