//! Versioned migration manifest
//!
//! The local schema is described by an ordered list of named migrations. The
//! name of the last applied migration is enough to decide what to do next:
//! nothing, apply the tail of the list, or start over when the recorded name
//! is no longer known.

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

/// A single schema migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub sql: String,
}

/// What the materializer has to do for a given local state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationPlan {
    UpToDate,
    /// Apply these migrations in order
    Apply(Vec<Migration>),
    /// Local state is unknown to the manifest: drop everything, then apply these
    Reset(Vec<Migration>),
}

impl MigrationPlan {
    pub fn migrations(&self) -> &[Migration] {
        match self {
            MigrationPlan::UpToDate => &[],
            MigrationPlan::Apply(m) | MigrationPlan::Reset(m) => m,
        }
    }
}

/// Ordered list of migrations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    migrations: Vec<Migration>,
}

impl Manifest {
    pub fn new(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        for (i, m) in migrations.iter().enumerate() {
            if m.name.is_empty() {
                return Err(MigrationError::InvalidManifest(format!(
                    "migration #{} has no name",
                    i
                )));
            }
            if migrations[..i].iter().any(|earlier| earlier.name == m.name) {
                return Err(MigrationError::InvalidManifest(format!(
                    "duplicate migration '{}'",
                    m.name
                )));
            }
        }
        Ok(Self { migrations })
    }

    /// The schema shipped with this crate
    pub fn embedded() -> Self {
        let migrations = EMBEDDED
            .iter()
            .map(|(name, description, checksum, sql)| Migration {
                name: name.to_string(),
                description: description.to_string(),
                checksum: checksum.to_string(),
                sql: sql.to_string(),
            })
            .collect();
        Self { migrations }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn latest(&self) -> Option<&str> {
        self.migrations.last().map(|m| m.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.name == name)
    }

    /// Decide what to apply given the last migration recorded locally
    pub fn plan(&self, last_applied: Option<&str>) -> MigrationPlan {
        let Some(last) = last_applied else {
            return if self.migrations.is_empty() {
                MigrationPlan::UpToDate
            } else {
                MigrationPlan::Apply(self.migrations.clone())
            };
        };

        match self.migrations.iter().position(|m| m.name == last) {
            None => MigrationPlan::Reset(self.migrations.clone()),
            Some(idx) => {
                let pending = self.migrations[idx + 1..].to_vec();
                if pending.is_empty() {
                    MigrationPlan::UpToDate
                } else {
                    MigrationPlan::Apply(pending)
                }
            }
        }
    }
}

/// Where the authoritative manifest comes from
pub trait MigrationSource: Send + Sync {
    fn manifest(&self) -> BoxFuture<'_, Result<Manifest, MigrationError>>;
}

impl MigrationSource for Manifest {
    fn manifest(&self) -> BoxFuture<'_, Result<Manifest, MigrationError>> {
        let manifest = self.clone();
        async move { Ok(manifest) }.boxed()
    }
}

// ==================== Embedded schema ====================

const EMBEDDED: &[(&str, &str, &str, &str)] = &[
    (
        "0001_initial_schema",
        "Initial schema: users, companies, members, groups, invites",
        "sha256:initial_v1",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT,
            avatar_url TEXT,
            preferences JSONB DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_login_at TEXT,
            is_active BOOLEAN DEFAULT TRUE
        );

        CREATE TABLE IF NOT EXISTS companies (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            owner_id TEXT NOT NULL,
            plan TEXT NOT NULL DEFAULT 'basic',
            settings JSONB DEFAULT '{"timezone":"UTC","dateFormat":"YYYY-MM-DD","defaultLanguage":"en","theme":{}}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS company_members (
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            joined_at TEXT NOT NULL,
            invited_by TEXT,
            UNIQUE(company_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS user_groups (
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_group_members (
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            added_by TEXT NOT NULL,
            added_at TEXT NOT NULL,
            UNIQUE(group_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS invite_links (
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            created_by TEXT NOT NULL,
            email TEXT,
            token TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            expires_at TEXT,
            created_at TEXT NOT NULL,
            used_at TEXT,
            used_by TEXT,
            is_active BOOLEAN DEFAULT TRUE
        );

        CREATE INDEX IF NOT EXISTS idx_company_members_company ON company_members(company_id);
        CREATE INDEX IF NOT EXISTS idx_invite_links_company ON invite_links(company_id);
        "#,
    ),
    (
        "0002_spaces_and_items",
        "Unified spaces schema",
        "sha256:spaces_v1",
        r#"
        CREATE TABLE IF NOT EXISTS spaces (
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            icon TEXT,
            color TEXT,
            settings JSONB DEFAULT '{}',
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS space_members (
            id TEXT PRIMARY KEY,
            space_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            joined_at TEXT NOT NULL,
            invited_by TEXT,
            UNIQUE(space_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS space_items (
            id TEXT PRIMARY KEY,
            space_id TEXT NOT NULL,
            parent_id TEXT REFERENCES space_items(id) ON DELETE SET NULL,
            type TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            icon TEXT,
            color TEXT,
            order_index INTEGER DEFAULT 0,
            config JSONB DEFAULT '{}',
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS space_item_permissions (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            permission TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(item_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_spaces_company ON spaces(company_id);
        CREATE INDEX IF NOT EXISTS idx_space_members_space ON space_members(space_id);
        CREATE INDEX IF NOT EXISTS idx_space_items_tree ON space_items(space_id, parent_id, order_index);
        "#,
    ),
    (
        "0003_space_item_rows",
        "Rows of table items with dynamic columns",
        "sha256:item_rows_v1",
        r#"
        CREATE TABLE IF NOT EXISTS space_item_rows (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            data JSONB DEFAULT '{}',
            order_index INTEGER DEFAULT 0,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_space_item_rows_item ON space_item_rows(item_id, order_index);
        "#,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(name: &str) -> Migration {
        Migration {
            name: name.to_string(),
            description: String::new(),
            checksum: String::new(),
            sql: format!("CREATE TABLE t_{} (id TEXT);", name),
        }
    }

    fn manifest(names: &[&str]) -> Manifest {
        Manifest::new(names.iter().map(|n| migration(n)).collect()).unwrap()
    }

    fn names(plan: &MigrationPlan) -> Vec<&str> {
        plan.migrations().iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn test_plan_fresh_store_applies_everything() {
        let plan = manifest(&["a", "b", "c"]).plan(None);
        assert!(matches!(plan, MigrationPlan::Apply(_)));
        assert_eq!(names(&plan), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_plan_applies_only_the_tail() {
        let plan = manifest(&["a", "b", "c"]).plan(Some("a"));
        assert_eq!(names(&plan), vec!["b", "c"]);

        let plan = manifest(&["a", "b", "c"]).plan(Some("c"));
        assert_eq!(plan, MigrationPlan::UpToDate);
    }

    #[test]
    fn test_plan_unknown_migration_resets() {
        let plan = manifest(&["a", "b"]).plan(Some("zzz"));
        assert!(matches!(plan, MigrationPlan::Reset(_)));
        assert_eq!(names(&plan), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_manifest_is_up_to_date() {
        assert_eq!(Manifest::default().plan(None), MigrationPlan::UpToDate);
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = Manifest::new(vec![migration("a"), migration("a")]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_embedded_manifest_order() {
        let manifest = Manifest::embedded();
        let names: Vec<_> = manifest.migrations().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "0001_initial_schema",
                "0002_spaces_and_items",
                "0003_space_item_rows"
            ]
        );
        assert_eq!(manifest.latest(), Some("0003_space_item_rows"));
        assert!(manifest.get("0002_spaces_and_items").unwrap().sql.contains("space_items"));
    }

    #[tokio::test]
    async fn test_manifest_is_its_own_source() {
        let manifest = manifest(&["a"]);
        let fetched = MigrationSource::manifest(&manifest).await.unwrap();
        assert_eq!(fetched, manifest);
    }
}
