use rusqlite::params;
use uuid::Uuid;

use crate::types::{DirectiveStrength, FocusScope};

use super::*;

const DIRECTIVE_COLUMNS: &str = "id, owner_id, directive_text, scope_type, scope_id, scope_value, \
     strength, is_active, starts_at, ends_at, created_at, updated_at";

/// Creation input; validation (scope target shape, window ordering) happens
/// in the surface layer.
#[derive(Debug, Clone)]
pub struct NewDirective {
    pub directive_text: String,
    pub scope_type: FocusScope,
    pub scope_id: Option<String>,
    pub scope_value: Option<String>,
    pub strength: DirectiveStrength,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DirectivePatch {
    pub directive_text: Option<String>,
    pub strength: Option<DirectiveStrength>,
    pub is_active: Option<bool>,
    pub starts_at: Option<Option<String>>,
    pub ends_at: Option<Option<String>>,
}

impl Store {
    // =====================================================================
    // Focus directives
    // =====================================================================

    /// Create and activate a directive. Any other active directive for the
    /// owner is deactivated in the same transaction, receiving
    /// `ends_at = now` if it had none. At most one directive is ever
    /// active per owner.
    pub fn create_directive(
        &self,
        owner_id: &str,
        new: &NewDirective,
    ) -> Result<DbFocusDirective, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();

        self.with_transaction(|store| {
            store.deactivate_all_directives_inner(owner_id, &now)?;
            store.conn.execute(
                "INSERT INTO focus_directives (id, owner_id, directive_text, scope_type, scope_id,
                     scope_value, strength, is_active, starts_at, ends_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?10)",
                params![
                    id,
                    owner_id,
                    new.directive_text,
                    new.scope_type.as_str(),
                    new.scope_id,
                    new.scope_value,
                    new.strength.as_str(),
                    new.starts_at,
                    new.ends_at,
                    now,
                ],
            )?;
            Ok(())
        })?;

        self.get_directive(owner_id, &id)?
            .ok_or_else(|| StoreError::Conflict("directive vanished after insert".into()))
    }

    pub fn get_directive(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<Option<DbFocusDirective>, StoreError> {
        let sql = format!(
            "SELECT {DIRECTIVE_COLUMNS} FROM focus_directives WHERE owner_id = ?1 AND id = ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![owner_id, id], Self::map_directive_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// The single active directive, if any.
    pub fn active_directive(
        &self,
        owner_id: &str,
    ) -> Result<Option<DbFocusDirective>, StoreError> {
        let sql = format!(
            "SELECT {DIRECTIVE_COLUMNS} FROM focus_directives
             WHERE owner_id = ?1 AND is_active = 1
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![owner_id], Self::map_directive_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_directives(
        &self,
        owner_id: &str,
        include_history: bool,
    ) -> Result<Vec<DbFocusDirective>, StoreError> {
        let sql = if include_history {
            format!(
                "SELECT {DIRECTIVE_COLUMNS} FROM focus_directives
                 WHERE owner_id = ?1 ORDER BY created_at DESC"
            )
        } else {
            format!(
                "SELECT {DIRECTIVE_COLUMNS} FROM focus_directives
                 WHERE owner_id = ?1 AND is_active = 1 ORDER BY created_at DESC"
            )
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id], Self::map_directive_row)?;

        let mut directives = Vec::new();
        for row in rows {
            directives.push(row?);
        }
        Ok(directives)
    }

    /// Patch a directive. Activating one deactivates every other; a
    /// deactivation stamps `ends_at = now` when unset.
    pub fn patch_directive(
        &self,
        owner_id: &str,
        id: &str,
        patch: &DirectivePatch,
    ) -> Result<Option<DbFocusDirective>, StoreError> {
        if self.get_directive(owner_id, id)?.is_none() {
            return Ok(None);
        }
        let now = now_iso();

        self.with_transaction(|store| {
            if patch.is_active == Some(true) {
                store.deactivate_all_directives_inner(owner_id, &now)?;
                store.conn.execute(
                    "UPDATE focus_directives SET is_active = 1, updated_at = ?1
                     WHERE owner_id = ?2 AND id = ?3",
                    params![now, owner_id, id],
                )?;
            } else if patch.is_active == Some(false) {
                store.conn.execute(
                    "UPDATE focus_directives
                     SET is_active = 0,
                         ends_at = COALESCE(ends_at, ?1),
                         updated_at = ?1
                     WHERE owner_id = ?2 AND id = ?3",
                    params![now, owner_id, id],
                )?;
            }

            if let Some(ref text) = patch.directive_text {
                store.conn.execute(
                    "UPDATE focus_directives SET directive_text = ?1, updated_at = ?2
                     WHERE owner_id = ?3 AND id = ?4",
                    params![text, now, owner_id, id],
                )?;
            }
            if let Some(strength) = patch.strength {
                store.conn.execute(
                    "UPDATE focus_directives SET strength = ?1, updated_at = ?2
                     WHERE owner_id = ?3 AND id = ?4",
                    params![strength.as_str(), now, owner_id, id],
                )?;
            }
            if let Some(ref starts_at) = patch.starts_at {
                store.conn.execute(
                    "UPDATE focus_directives SET starts_at = ?1, updated_at = ?2
                     WHERE owner_id = ?3 AND id = ?4",
                    params![starts_at, now, owner_id, id],
                )?;
            }
            if let Some(ref ends_at) = patch.ends_at {
                store.conn.execute(
                    "UPDATE focus_directives SET ends_at = ?1, updated_at = ?2
                     WHERE owner_id = ?3 AND id = ?4",
                    params![ends_at, now, owner_id, id],
                )?;
            }
            Ok(())
        })?;

        self.get_directive(owner_id, id)
    }

    /// Deactivate every active directive. Idempotent; returns how many
    /// flipped.
    pub fn clear_directives(&self, owner_id: &str) -> Result<usize, StoreError> {
        let now = now_iso();
        self.deactivate_all_directives_inner(owner_id, &now)
    }

    fn deactivate_all_directives_inner(
        &self,
        owner_id: &str,
        now: &str,
    ) -> Result<usize, StoreError> {
        let n = self.conn.execute(
            "UPDATE focus_directives
             SET is_active = 0,
                 ends_at = COALESCE(ends_at, ?1),
                 updated_at = ?1
             WHERE owner_id = ?2 AND is_active = 1",
            params![now, owner_id],
        )?;
        Ok(n)
    }

    fn map_directive_row(row: &rusqlite::Row) -> rusqlite::Result<DbFocusDirective> {
        let scope_type: String = row.get(3)?;
        let strength: String = row.get(6)?;
        Ok(DbFocusDirective {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            directive_text: row.get(2)?,
            scope_type: FocusScope::parse(&scope_type).unwrap_or(FocusScope::Query),
            scope_id: row.get(4)?,
            scope_value: row.get(5)?,
            strength: DirectiveStrength::parse(&strength).unwrap_or(DirectiveStrength::Nudge),
            is_active: row.get(7)?,
            starts_at: row.get(8)?,
            ends_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn directive(text: &str) -> NewDirective {
        NewDirective {
            directive_text: text.to_string(),
            scope_type: FocusScope::Stakeholder,
            scope_id: None,
            scope_value: Some("nancy".to_string()),
            strength: DirectiveStrength::Strong,
            starts_at: None,
            ends_at: None,
        }
    }

    #[test]
    fn activating_a_new_directive_deactivates_the_old() {
        let store = store();
        let first = store.create_directive("o1", &directive("first")).unwrap();
        let second = store.create_directive("o1", &directive("second")).unwrap();

        let active = store.active_directive("o1").unwrap().unwrap();
        assert_eq!(active.id, second.id);

        let old = store.get_directive("o1", &first.id).unwrap().unwrap();
        assert!(!old.is_active);
        assert!(old.ends_at.is_some(), "deactivation stamps ends_at");
    }

    #[test]
    fn at_most_one_active_per_owner() {
        let store = store();
        for i in 0..4 {
            store
                .create_directive("o1", &directive(&format!("d{i}")))
                .unwrap();
        }
        let active = store.list_directives("o1", false).unwrap();
        assert_eq!(active.len(), 1);

        let all = store.list_directives("o1", true).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn clear_is_idempotent() {
        let store = store();
        store.create_directive("o1", &directive("only")).unwrap();
        assert_eq!(store.clear_directives("o1").unwrap(), 1);
        assert_eq!(store.clear_directives("o1").unwrap(), 0);
        assert!(store.active_directive("o1").unwrap().is_none());
    }

    #[test]
    fn patch_reactivation_flips_exclusively() {
        let store = store();
        let first = store.create_directive("o1", &directive("first")).unwrap();
        let second = store.create_directive("o1", &directive("second")).unwrap();

        store
            .patch_directive(
                "o1",
                &first.id,
                &DirectivePatch {
                    is_active: Some(true),
                    ..DirectivePatch::default()
                },
            )
            .unwrap();

        assert_eq!(store.active_directive("o1").unwrap().unwrap().id, first.id);
        let second_now = store.get_directive("o1", &second.id).unwrap().unwrap();
        assert!(!second_now.is_active);
    }

    #[test]
    fn owners_do_not_interfere() {
        let store = store();
        store.create_directive("o1", &directive("mine")).unwrap();
        store.create_directive("o2", &directive("theirs")).unwrap();

        assert!(store.active_directive("o1").unwrap().is_some());
        assert!(store.active_directive("o2").unwrap().is_some());
    }
}
