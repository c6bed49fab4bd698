//! Query-on-demand over the local store
//!
//! Reads never reach the network: every accessor runs SQL against the
//! replicated tables and decodes the rows into the typed models.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::models::{
    Company, CompanyMember, CompanyRole, InviteLink, Resource, Space, SpaceItem, SpaceItemRow, SpaceMember, SpaceRole,
    User,
};
use crate::store::{LiveQuery, LocalStore, Row, StoreError, StoreResult};

/// A space item with its descendants
#[derive(Debug, Clone, Serialize)]
pub struct ItemNode {
    #[serde(flatten)]
    pub item: SpaceItem,
    /// Depth below the root (root items are 0)
    pub level: usize,
    pub children: Vec<ItemNode>,
}

/// Read accessors scoped to the signed-in user
#[derive(Debug, Clone)]
pub struct Queries {
    store: LocalStore,
    user_id: String,
}

impl Queries {
    pub fn new(store: LocalStore, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    // ==================== Raw access ====================

    pub async fn query(&self, sql: &str, params: Vec<Value>) -> StoreResult<Vec<Row>> {
        self.store.query(sql, params).await
    }

    pub async fn query_one(&self, sql: &str, params: Vec<Value>) -> StoreResult<Option<Row>> {
        self.store.query_one(sql, params).await
    }

    /// Run a query and decode each row into `T`
    pub async fn query_as<T: DeserializeOwned>(&self, sql: &str, params: Vec<Value>) -> StoreResult<Vec<T>> {
        self.store
            .query(sql, params)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(StoreError::from))
            .collect()
    }

    pub async fn live_query(&self, sql: &str, params: Vec<Value>) -> StoreResult<LiveQuery> {
        self.store.live_query(sql, params).await
    }

    async fn one<T: Resource>(&self, sql: &str, params: Vec<Value>) -> StoreResult<Option<T>> {
        match self.store.query_one(sql, params).await? {
            Some(row) => Ok(Some(T::from_row(&row)?)),
            None => Ok(None),
        }
    }

    // ==================== Users and companies ====================

    pub async fn current_user(&self) -> StoreResult<Option<User>> {
        self.one("SELECT * FROM users WHERE id = ?1", vec![Value::from(self.user_id.as_str())])
            .await
    }

    /// Companies visible locally, excluding soft-deleted ones
    pub async fn companies(&self) -> StoreResult<Vec<Company>> {
        self.query_as("SELECT * FROM companies WHERE deleted_at IS NULL ORDER BY name", Vec::new())
            .await
    }

    pub async fn company(&self, id: &str) -> StoreResult<Option<Company>> {
        self.one("SELECT * FROM companies WHERE id = ?1", vec![Value::from(id)])
            .await
    }

    /// Members of a company, most recent first
    pub async fn company_members(&self, company_id: &str) -> StoreResult<Vec<CompanyMember>> {
        self.query_as(
            "SELECT * FROM company_members WHERE company_id = ?1 ORDER BY joined_at DESC",
            vec![Value::from(company_id)],
        )
        .await
    }

    /// The current user's role in a company, if a member
    pub async fn member_role(&self, company_id: &str) -> StoreResult<Option<CompanyRole>> {
        let row = self
            .query_one(
                "SELECT role FROM company_members WHERE company_id = ?1 AND user_id = ?2",
                vec![Value::from(company_id), Value::from(self.user_id.as_str())],
            )
            .await?;
        role_of(row)
    }

    /// Invite links of a company, newest first
    pub async fn invites(&self, company_id: &str, active_only: bool) -> StoreResult<Vec<InviteLink>> {
        let mut sql = String::from("SELECT * FROM invite_links WHERE company_id = ?1");
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY created_at DESC");
        self.query_as(&sql, vec![Value::from(company_id)]).await
    }

    // ==================== Spaces ====================

    pub async fn spaces_for_companies(&self, company_ids: &[String]) -> StoreResult<Vec<Space>> {
        if company_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=company_ids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT * FROM spaces WHERE company_id IN ({}) AND deleted_at IS NULL ORDER BY name",
            placeholders
        );
        let params = company_ids.iter().map(|id| Value::from(id.as_str())).collect();
        self.query_as(&sql, params).await
    }

    pub async fn space_members(&self, space_id: &str) -> StoreResult<Vec<SpaceMember>> {
        self.query_as(
            "SELECT * FROM space_members WHERE space_id = ?1 ORDER BY joined_at",
            vec![Value::from(space_id)],
        )
        .await
    }

    /// The current user's role in a space, if a member
    pub async fn space_role(&self, space_id: &str) -> StoreResult<Option<SpaceRole>> {
        let row = self
            .query_one(
                "SELECT role FROM space_members WHERE space_id = ?1 AND user_id = ?2",
                vec![Value::from(space_id), Value::from(self.user_id.as_str())],
            )
            .await?;
        role_of(row)
    }

    // ==================== Space items ====================

    /// Every live item of a space, roots first, then by position
    pub async fn space_items(&self, space_id: &str) -> StoreResult<Vec<SpaceItem>> {
        self.query_as(
            "SELECT * FROM space_items WHERE space_id = ?1 AND deleted_at IS NULL \
             ORDER BY parent_id NULLS FIRST, order_index, name",
            vec![Value::from(space_id)],
        )
        .await
    }

    pub async fn root_items(&self, space_id: &str) -> StoreResult<Vec<SpaceItem>> {
        self.query_as(
            "SELECT * FROM space_items WHERE space_id = ?1 AND parent_id IS NULL AND deleted_at IS NULL \
             ORDER BY order_index, name",
            vec![Value::from(space_id)],
        )
        .await
    }

    pub async fn item_children(&self, parent_id: &str) -> StoreResult<Vec<SpaceItem>> {
        self.query_as(
            "SELECT * FROM space_items WHERE parent_id = ?1 AND deleted_at IS NULL ORDER BY order_index, name",
            vec![Value::from(parent_id)],
        )
        .await
    }

    /// The items of a space as a forest
    ///
    /// Items whose parent is not present locally are shown at the root.
    pub async fn item_tree(&self, space_id: &str) -> StoreResult<Vec<ItemNode>> {
        let items = self.space_items(space_id).await?;
        Ok(build_tree(items))
    }

    pub async fn item_rows(&self, item_id: &str) -> StoreResult<Vec<SpaceItemRow>> {
        self.query_as(
            "SELECT * FROM space_item_rows WHERE item_id = ?1 AND deleted_at IS NULL ORDER BY order_index, created_at",
            vec![Value::from(item_id)],
        )
        .await
    }
}

fn role_of<R: DeserializeOwned>(row: Option<Row>) -> StoreResult<Option<R>> {
    match row.and_then(|mut r| r.remove("role")) {
        Some(role @ Value::String(_)) => Ok(Some(serde_json::from_value(role)?)),
        _ => Ok(None),
    }
}

/// Nest items under their parents; `items` must already be in sibling order
fn build_tree(items: Vec<SpaceItem>) -> Vec<ItemNode> {
    let known: std::collections::HashSet<String> = items.iter().map(|i| i.id.clone()).collect();
    let mut children: std::collections::HashMap<Option<String>, Vec<SpaceItem>> = Default::default();
    for item in items {
        let parent = item.parent_id.clone().filter(|p| known.contains(p));
        children.entry(parent).or_default().push(item);
    }

    fn attach(
        parent: Option<String>,
        level: usize,
        children: &mut std::collections::HashMap<Option<String>, Vec<SpaceItem>>,
    ) -> Vec<ItemNode> {
        let Some(items) = children.remove(&parent) else {
            return Vec::new();
        };
        items
            .into_iter()
            .map(|item| {
                let nested = attach(Some(item.id.clone()), level + 1, children);
                ItemNode {
                    item,
                    level,
                    children: nested,
                }
            })
            .collect()
    }

    attach(None, 0, &mut children)
}
