use rusqlite::params;
use uuid::Uuid;

use crate::types::{EstimateSource, TaskStatus, TaskType};

use super::*;

const TASK_COLUMNS: &str = "id, owner_id, title, description, implementation_id, project_id, \
     status, task_type, priority_score, estimated_minutes, estimate_source, due_at, \
     needs_review, blocker, waiting_on, follow_up_at, stakeholder_mentions, source_type, \
     source_url, inbox_item_id, pinned_excerpt, created_at, updated_at";

/// Fields for task creation. Everything optional except the title; defaults
/// mirror the schema defaults.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub implementation_id: Option<String>,
    pub project_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub priority_score: Option<f64>,
    pub estimated_minutes: Option<u32>,
    pub estimate_source: Option<EstimateSource>,
    pub due_at: Option<String>,
    pub needs_review: bool,
    pub blocker: bool,
    pub waiting_on: Option<String>,
    pub follow_up_at: Option<String>,
    pub stakeholder_mentions: Vec<String>,
    pub source_type: Option<String>,
    pub source_url: Option<String>,
    pub inbox_item_id: Option<String>,
    pub pinned_excerpt: Option<String>,
}

/// List filters for `GET /tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub needs_review: Option<bool>,
    pub implementation_id: Option<String>,
    /// Due within this many hours from now.
    pub due_soon_hours: Option<i64>,
    pub include_done: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Whitelisted PATCH fields. Inner `Option` distinguishes "set to null"
/// from "leave alone" for nullable columns.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub implementation_id: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub priority_score: Option<f64>,
    pub estimated_minutes: Option<u32>,
    pub estimate_source: Option<EstimateSource>,
    pub due_at: Option<Option<String>>,
    pub needs_review: Option<bool>,
    pub blocker: Option<bool>,
    pub waiting_on: Option<Option<String>>,
    pub follow_up_at: Option<Option<String>>,
    pub pinned_excerpt: Option<Option<String>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.implementation_id.is_none()
            && self.status.is_none()
            && self.task_type.is_none()
            && self.priority_score.is_none()
            && self.estimated_minutes.is_none()
            && self.estimate_source.is_none()
            && self.due_at.is_none()
            && self.needs_review.is_none()
            && self.blocker.is_none()
            && self.waiting_on.is_none()
            && self.follow_up_at.is_none()
            && self.pinned_excerpt.is_none()
    }
}

impl Store {
    // =====================================================================
    // Tasks
    // =====================================================================

    pub fn create_task(&self, owner_id: &str, new: &NewTask) -> Result<DbTask, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        let mentions = serde_json::to_string(&new.stakeholder_mentions)
            .unwrap_or_else(|_| "[]".to_string());

        self.conn.execute(
            "INSERT INTO tasks (id, owner_id, title, description, implementation_id, project_id,
                 status, task_type, priority_score, estimated_minutes, estimate_source, due_at,
                 needs_review, blocker, waiting_on, follow_up_at, stakeholder_mentions,
                 source_type, source_url, inbox_item_id, pinned_excerpt, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?22)",
            params![
                id,
                owner_id,
                new.title,
                new.description,
                new.implementation_id,
                new.project_id,
                new.status.unwrap_or(TaskStatus::Backlog).as_str(),
                new.task_type.unwrap_or(TaskType::Task).as_str(),
                new.priority_score.unwrap_or(50.0),
                new.estimated_minutes.unwrap_or(30),
                new.estimate_source.unwrap_or(EstimateSource::Default).as_str(),
                new.due_at,
                new.needs_review,
                new.blocker,
                new.waiting_on,
                new.follow_up_at,
                mentions,
                new.source_type,
                new.source_url,
                new.inbox_item_id,
                new.pinned_excerpt,
                now,
            ],
        )?;

        self.get_task(owner_id, &id)?
            .ok_or_else(|| StoreError::Conflict("task vanished after insert".into()))
    }

    pub fn get_task(&self, owner_id: &str, id: &str) -> Result<Option<DbTask>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1 AND id = ?2");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![owner_id, id], Self::map_task_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_tasks(
        &self,
        owner_id: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<DbTask>, StoreError> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1");
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(owner_id.to_string())];

        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = ?{}", values.len() + 1));
            values.push(Box::new(status.as_str().to_string()));
        } else if !filter.include_done {
            sql.push_str(" AND status != 'done'");
        }

        if let Some(needs_review) = filter.needs_review {
            sql.push_str(&format!(" AND needs_review = ?{}", values.len() + 1));
            values.push(Box::new(needs_review));
        }

        if let Some(ref implementation_id) = filter.implementation_id {
            sql.push_str(&format!(" AND implementation_id = ?{}", values.len() + 1));
            values.push(Box::new(implementation_id.clone()));
        }

        if let Some(hours) = filter.due_soon_hours {
            let horizon = (chrono::Utc::now() + chrono::Duration::hours(hours))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            sql.push_str(&format!(
                " AND due_at IS NOT NULL AND due_at <= ?{}",
                values.len() + 1
            ));
            values.push(Box::new(horizon));
        }

        sql.push_str(" ORDER BY priority_score DESC, due_at ASC, title ASC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(200).min(1000)));
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            Self::map_task_row,
        )?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// All non-terminal tasks, capped. The planner's working set.
    pub fn open_tasks(&self, owner_id: &str, cap: u32) -> Result<Vec<DbTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE owner_id = ?1 AND status != 'done'
             ORDER BY priority_score DESC, due_at ASC, title ASC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id, cap], Self::map_task_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Tasks completed within `[start, end)` (briefing progress partition).
    pub fn done_tasks_updated_between(
        &self,
        owner_id: &str,
        start_iso: &str,
        end_iso: &str,
    ) -> Result<Vec<DbTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE owner_id = ?1 AND status = 'done'
               AND updated_at >= ?2 AND updated_at < ?3
             ORDER BY updated_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id, start_iso, end_iso], Self::map_task_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Apply a whitelisted patch. Returns the fresh row, or None when the
    /// task does not exist for this owner.
    pub fn apply_task_patch(
        &self,
        owner_id: &str,
        id: &str,
        patch: &TaskPatch,
    ) -> Result<Option<DbTask>, StoreError> {
        if self.get_task(owner_id, id)?.is_none() {
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

        if let Some(ref title) = patch.title {
            push(&mut sets, &mut values, "title", Box::new(title.clone()));
        }
        if let Some(ref description) = patch.description {
            push(&mut sets, &mut values, "description", Box::new(description.clone()));
        }
        if let Some(ref implementation_id) = patch.implementation_id {
            push(
                &mut sets,
                &mut values,
                "implementation_id",
                Box::new(implementation_id.clone()),
            );
        }
        if let Some(status) = patch.status {
            push(
                &mut sets,
                &mut values,
                "status",
                Box::new(status.as_str().to_string()),
            );
        }
        if let Some(task_type) = patch.task_type {
            push(
                &mut sets,
                &mut values,
                "task_type",
                Box::new(task_type.as_str().to_string()),
            );
        }
        if let Some(priority_score) = patch.priority_score {
            push(
                &mut sets,
                &mut values,
                "priority_score",
                Box::new(priority_score),
            );
        }
        if let Some(estimated_minutes) = patch.estimated_minutes {
            push(
                &mut sets,
                &mut values,
                "estimated_minutes",
                Box::new(estimated_minutes),
            );
        }
        if let Some(estimate_source) = patch.estimate_source {
            push(
                &mut sets,
                &mut values,
                "estimate_source",
                Box::new(estimate_source.as_str().to_string()),
            );
        }
        if let Some(ref due_at) = patch.due_at {
            push(&mut sets, &mut values, "due_at", Box::new(due_at.clone()));
        }
        if let Some(needs_review) = patch.needs_review {
            push(&mut sets, &mut values, "needs_review", Box::new(needs_review));
        }
        if let Some(blocker) = patch.blocker {
            push(&mut sets, &mut values, "blocker", Box::new(blocker));
        }
        if let Some(ref waiting_on) = patch.waiting_on {
            push(&mut sets, &mut values, "waiting_on", Box::new(waiting_on.clone()));
        }
        if let Some(ref follow_up_at) = patch.follow_up_at {
            push(
                &mut sets,
                &mut values,
                "follow_up_at",
                Box::new(follow_up_at.clone()),
            );
        }
        if let Some(ref pinned_excerpt) = patch.pinned_excerpt {
            push(
                &mut sets,
                &mut values,
                "pinned_excerpt",
                Box::new(pinned_excerpt.clone()),
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
                "UPDATE tasks SET {} WHERE owner_id = ?{} AND id = ?{}",
                sets.join(", "),
                owner_idx,
                id_idx
            );
            self.conn.execute(
                &sql,
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            )?;
        }

        self.get_task(owner_id, id)
    }

    /// Overwrite the stored priority score without touching updated_at
    /// semantics beyond the write itself.
    pub fn set_task_priority(
        &self,
        owner_id: &str,
        id: &str,
        priority_score: f64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE tasks SET priority_score = ?1, updated_at = ?2
             WHERE owner_id = ?3 AND id = ?4",
            params![priority_score, now_iso(), owner_id, id],
        )?;
        Ok(())
    }

    pub fn delete_task(&self, owner_id: &str, id: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM tasks WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, id],
        )?;
        Ok(n > 0)
    }

    fn map_task_row(row: &rusqlite::Row) -> rusqlite::Result<DbTask> {
        let status: String = row.get(6)?;
        let task_type: String = row.get(7)?;
        let estimate_source: String = row.get(10)?;
        let mentions: Option<String> = row.get(16)?;
        Ok(DbTask {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            implementation_id: row.get(4)?,
            project_id: row.get(5)?,
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Backlog),
            task_type: TaskType::parse(&task_type).unwrap_or(TaskType::Task),
            priority_score: row.get(8)?,
            estimated_minutes: row.get::<_, i64>(9)?.clamp(1, 480) as u32,
            estimate_source: EstimateSource::parse(&estimate_source)
                .unwrap_or(EstimateSource::Default),
            due_at: row.get(11)?,
            needs_review: row.get(12)?,
            blocker: row.get(13)?,
            waiting_on: row.get(14)?,
            follow_up_at: row.get(15)?,
            stakeholder_mentions: decode_string_list(mentions),
            source_type: row.get(17)?,
            source_url: row.get(18)?,
            inbox_item_id: row.get(19)?,
            pinned_excerpt: row.get(20)?,
            created_at: row.get(21)?,
            updated_at: row.get(22)?,
        })
    }

    // =====================================================================
    // Checklist items
    // =====================================================================

    pub fn add_checklist_item(
        &self,
        owner_id: &str,
        task_id: &str,
        label: &str,
        sort_order: i64,
    ) -> Result<DbChecklistItem, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO checklist_items (id, owner_id, task_id, label, done, sort_order,
                                          created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
            params![id, owner_id, task_id, label, sort_order, now],
        )?;
        Ok(DbChecklistItem {
            id,
            owner_id: owner_id.to_string(),
            task_id: task_id.to_string(),
            label: label.to_string(),
            done: false,
            sort_order,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn list_checklist(
        &self,
        owner_id: &str,
        task_id: &str,
    ) -> Result<Vec<DbChecklistItem>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, task_id, label, done, sort_order, created_at, updated_at
             FROM checklist_items
             WHERE owner_id = ?1 AND task_id = ?2
             ORDER BY sort_order ASC, created_at ASC",
        )?;
        let rows = stmt.query_map(params![owner_id, task_id], |row| {
            Ok(DbChecklistItem {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                task_id: row.get(2)?,
                label: row.get(3)?,
                done: row.get(4)?,
                sort_order: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    pub fn update_checklist_item(
        &self,
        owner_id: &str,
        task_id: &str,
        item_id: &str,
        label: Option<&str>,
        done: Option<bool>,
    ) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE checklist_items
             SET label = COALESCE(?1, label),
                 done = COALESCE(?2, done),
                 updated_at = ?3
             WHERE owner_id = ?4 AND task_id = ?5 AND id = ?6",
            params![label, done, now_iso(), owner_id, task_id, item_id],
        )?;
        Ok(n > 0)
    }

    pub fn delete_checklist_item(
        &self,
        owner_id: &str,
        task_id: &str,
        item_id: &str,
    ) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM checklist_items WHERE owner_id = ?1 AND task_id = ?2 AND id = ?3",
            params![owner_id, task_id, item_id],
        )?;
        Ok(n > 0)
    }

    // =====================================================================
    // Dependencies
    // =====================================================================

    /// Insert a task→task dependency. The caller has already validated that
    /// both tasks exist for this owner and that this is not a self-dep.
    /// Duplicates surface as `Conflict` (unique index); cycles are rejected
    /// here with a graph walk.
    pub fn add_task_dependency(
        &self,
        owner_id: &str,
        task_id: &str,
        depends_on_task_id: &str,
    ) -> Result<DbDependency, StoreError> {
        if self.would_create_cycle(owner_id, task_id, depends_on_task_id)? {
            return Err(StoreError::Conflict(
                "Cannot create circular dependency".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO task_dependencies (id, owner_id, task_id, depends_on_task_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, owner_id, task_id, depends_on_task_id, now],
        )?;
        Ok(DbDependency {
            id,
            owner_id: owner_id.to_string(),
            task_id: task_id.to_string(),
            depends_on_task_id: Some(depends_on_task_id.to_string()),
            depends_on_commitment_id: None,
            created_at: now,
        })
    }

    pub fn add_commitment_dependency(
        &self,
        owner_id: &str,
        task_id: &str,
        depends_on_commitment_id: &str,
    ) -> Result<DbDependency, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO task_dependencies
                 (id, owner_id, task_id, depends_on_commitment_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, owner_id, task_id, depends_on_commitment_id, now],
        )?;
        Ok(DbDependency {
            id,
            owner_id: owner_id.to_string(),
            task_id: task_id.to_string(),
            depends_on_task_id: None,
            depends_on_commitment_id: Some(depends_on_commitment_id.to_string()),
            created_at: now,
        })
    }

    /// Walk the task-dependency graph from `target`: if `task_id` is
    /// reachable, the new edge `task_id → target` would close a loop.
    fn would_create_cycle(
        &self,
        owner_id: &str,
        task_id: &str,
        target: &str,
    ) -> Result<bool, StoreError> {
        let mut frontier = vec![target.to_string()];
        let mut seen = std::collections::HashSet::new();

        while let Some(current) = frontier.pop() {
            if current == task_id {
                return Ok(true);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            let mut stmt = self.conn.prepare(
                "SELECT depends_on_task_id FROM task_dependencies
                 WHERE owner_id = ?1 AND task_id = ?2 AND depends_on_task_id IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![owner_id, current], |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                frontier.push(row?);
            }
        }
        Ok(false)
    }

    pub fn list_dependencies(
        &self,
        owner_id: &str,
        task_id: &str,
    ) -> Result<Vec<DbDependency>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, task_id, depends_on_task_id, depends_on_commitment_id, created_at
             FROM task_dependencies
             WHERE owner_id = ?1 AND task_id = ?2
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![owner_id, task_id], |row| {
            Ok(DbDependency {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                task_id: row.get(2)?,
                depends_on_task_id: row.get(3)?,
                depends_on_commitment_id: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut deps = Vec::new();
        for row in rows {
            deps.push(row?);
        }
        Ok(deps)
    }

    pub fn delete_dependency(
        &self,
        owner_id: &str,
        task_id: &str,
        dep_id: &str,
    ) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM task_dependencies WHERE owner_id = ?1 AND task_id = ?2 AND id = ?3",
            params![owner_id, task_id, dep_id],
        )?;
        Ok(n > 0)
    }

    /// A dependency is unresolved while its target task is not Done, or its
    /// target commitment is still open.
    pub fn has_unresolved_dependencies(
        &self,
        owner_id: &str,
        task_id: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM task_dependencies d
             LEFT JOIN tasks t ON t.id = d.depends_on_task_id AND t.owner_id = d.owner_id
             LEFT JOIN commitments c ON c.id = d.depends_on_commitment_id AND c.owner_id = d.owner_id
             WHERE d.owner_id = ?1 AND d.task_id = ?2
               AND ((d.depends_on_task_id IS NOT NULL AND COALESCE(t.status, '') != 'done')
                 OR (d.depends_on_commitment_id IS NOT NULL AND COALESCE(c.status, 'open') != 'closed'))",
            params![owner_id, task_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // =====================================================================
    // Commitments
    // =====================================================================

    pub fn create_commitment(
        &self,
        owner_id: &str,
        stakeholder: &str,
        direction: &str,
        description: Option<&str>,
        due_at: Option<&str>,
    ) -> Result<DbCommitment, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO commitments (id, owner_id, stakeholder, direction, description, status,
                                      due_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?7)",
            params![id, owner_id, stakeholder, direction, description, due_at, now],
        )?;
        Ok(DbCommitment {
            id,
            owner_id: owner_id.to_string(),
            stakeholder: stakeholder.to_string(),
            direction: direction.to_string(),
            description: description.map(ToString::to_string),
            status: "open".to_string(),
            due_at: due_at.map(ToString::to_string),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_commitment(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<Option<DbCommitment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, stakeholder, direction, description, status, due_at,
                    created_at, updated_at
             FROM commitments WHERE owner_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query_map(params![owner_id, id], |row| {
            Ok(DbCommitment {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                stakeholder: row.get(2)?,
                direction: row.get(3)?,
                description: row.get(4)?,
                status: row.get(5)?,
                due_at: row.get(6)?,
                created_at: row.get(7)?,
                updated_at: row.get(8)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Idempotent status flip.
    pub fn set_commitment_status(
        &self,
        owner_id: &str,
        id: &str,
        status: &str,
    ) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE commitments SET status = ?1, updated_at = ?2
             WHERE owner_id = ?3 AND id = ?4",
            params![status, now_iso(), owner_id, id],
        )?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn quick_task(store: &Store, owner: &str, title: &str) -> DbTask {
        store
            .create_task(
                owner,
                &NewTask {
                    title: title.to_string(),
                    ..NewTask::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = store();
        let new = NewTask {
            title: "Review payroll mapping".to_string(),
            status: Some(TaskStatus::Planned),
            task_type: Some(TaskType::Ticket),
            priority_score: Some(70.0),
            estimated_minutes: Some(45),
            stakeholder_mentions: vec!["Nancy".to_string()],
            ..NewTask::default()
        };
        let created = store.create_task("o1", &new).unwrap();
        assert_eq!(created.status, TaskStatus::Planned);
        assert_eq!(created.task_type, TaskType::Ticket);
        assert_eq!(created.stakeholder_mentions, vec!["Nancy"]);

        let fetched = store.get_task("o1", &created.id).unwrap().unwrap();
        assert_eq!(fetched.title, "Review payroll mapping");
    }

    #[test]
    fn owner_scoping_hides_foreign_tasks() {
        let store = store();
        let task = quick_task(&store, "o1", "Mine");
        assert!(store.get_task("o2", &task.id).unwrap().is_none());
        assert!(!store.delete_task("o2", &task.id).unwrap());
        assert!(store.get_task("o1", &task.id).unwrap().is_some());
    }

    #[test]
    fn list_filters_exclude_done_by_default() {
        let store = store();
        let task = quick_task(&store, "o1", "Open one");
        let done = quick_task(&store, "o1", "Done one");
        store
            .apply_task_patch(
                "o1",
                &done.id,
                &TaskPatch {
                    status: Some(TaskStatus::Done),
                    ..TaskPatch::default()
                },
            )
            .unwrap();

        let open = store.list_tasks("o1", &TaskFilter::default()).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, task.id);

        let all = store
            .list_tasks(
                "o1",
                &TaskFilter {
                    include_done: true,
                    ..TaskFilter::default()
                },
            )
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn patch_sets_and_clears_nullable_fields() {
        let store = store();
        let task = quick_task(&store, "o1", "Patchable");

        let patched = store
            .apply_task_patch(
                "o1",
                &task.id,
                &TaskPatch {
                    due_at: Some(Some("2026-03-05T17:00:00Z".to_string())),
                    waiting_on: Some(Some("Legal".to_string())),
                    ..TaskPatch::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(patched.due_at.as_deref(), Some("2026-03-05T17:00:00Z"));

        let cleared = store
            .apply_task_patch(
                "o1",
                &task.id,
                &TaskPatch {
                    due_at: Some(None),
                    ..TaskPatch::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(cleared.due_at, None);
        assert_eq!(cleared.waiting_on.as_deref(), Some("Legal"));
    }

    #[test]
    fn checklist_preserves_sort_order() {
        let store = store();
        let task = quick_task(&store, "o1", "With checklist");
        store
            .add_checklist_item("o1", &task.id, "third", 2)
            .unwrap();
        store
            .add_checklist_item("o1", &task.id, "first", 0)
            .unwrap();
        store
            .add_checklist_item("o1", &task.id, "second", 1)
            .unwrap();

        let items = store.list_checklist("o1", &task.id).unwrap();
        let labels: Vec<&str> = items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["first", "second", "third"]);
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let store = store();
        let t1 = quick_task(&store, "o1", "T1");
        let t2 = quick_task(&store, "o1", "T2");
        let t3 = quick_task(&store, "o1", "T3");

        store.add_task_dependency("o1", &t1.id, &t2.id).unwrap();
        store.add_task_dependency("o1", &t2.id, &t3.id).unwrap();

        // Transitive cycle: t3 → t1 closes the loop.
        let err = store.add_task_dependency("o1", &t3.id, &t1.id).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref m) if m.contains("circular")));

        // And nothing was inserted.
        assert!(store.list_dependencies("o1", &t3.id).unwrap().is_empty());
    }

    #[test]
    fn duplicate_dependency_conflicts() {
        let store = store();
        let t1 = quick_task(&store, "o1", "T1");
        let t2 = quick_task(&store, "o1", "T2");

        store.add_task_dependency("o1", &t1.id, &t2.id).unwrap();
        let err = store.add_task_dependency("o1", &t1.id, &t2.id).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn unresolved_dependency_tracks_target_status() {
        let store = store();
        let t1 = quick_task(&store, "o1", "T1");
        let t2 = quick_task(&store, "o1", "T2");
        store.add_task_dependency("o1", &t1.id, &t2.id).unwrap();

        assert!(store.has_unresolved_dependencies("o1", &t1.id).unwrap());

        store
            .apply_task_patch(
                "o1",
                &t2.id,
                &TaskPatch {
                    status: Some(TaskStatus::Done),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert!(!store.has_unresolved_dependencies("o1", &t1.id).unwrap());
    }

    #[test]
    fn commitment_dependency_resolves_on_close() {
        let store = store();
        let t1 = quick_task(&store, "o1", "T1");
        let commitment = store
            .create_commitment("o1", "Nancy", "theirs", Some("Send mapping file"), None)
            .unwrap();
        store
            .add_commitment_dependency("o1", &t1.id, &commitment.id)
            .unwrap();

        assert!(store.has_unresolved_dependencies("o1", &t1.id).unwrap());
        store
            .set_commitment_status("o1", &commitment.id, "closed")
            .unwrap();
        assert!(!store.has_unresolved_dependencies("o1", &t1.id).unwrap());
    }
}
