//! Data models for replicated resources
//!
//! One typed struct per replicated table. Columns mirror the server schema
//! verbatim; timestamps stay in the text form the server sends them in and
//! are parsed on demand with [`timestamp::parse`]. Genuinely dynamic data
//! (the cells of a table item's rows) stays a JSON value.

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Row;

// ==================== Resource ====================

/// A replicated table that can be written through the upstream API
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Local table name
    const TABLE: &'static str;

    /// Human-readable name used in errors and logs
    const NAME: &'static str;

    /// Self-referencing parent column, if items form a tree
    const PARENT_COLUMN: Option<&'static str> = None;

    /// Ordering key among siblings
    const ORDER_COLUMN: Option<&'static str> = None;

    /// Column that groups items reordered together
    const SCOPE_COLUMN: Option<&'static str> = None;

    /// Columns the server fills in; never part of a create's fingerprint
    const GENERATED_COLUMNS: &'static [&'static str] = &["id", "created_at", "updated_at", "created_by"];

    fn id(&self) -> &str;

    /// Endpoint that creates a row like this one
    fn collection_path(row: &Row) -> String;

    /// Endpoint that updates or deletes this row
    fn member_path(row: &Row) -> String;

    /// Endpoint that accepts reorders for this row's scope
    fn reorder_path(_row: &Row) -> Option<String> {
        None
    }

    fn to_row(&self) -> Result<Row, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(row) => Ok(row),
            other => Err(serde_json::Error::custom(format!(
                "{} did not serialize to an object: {}",
                Self::NAME,
                other
            ))),
        }
    }

    fn from_row(row: &Row) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(row.clone()))
    }
}

fn text<'a>(row: &'a Row, column: &str) -> &'a str {
    row.get(column).and_then(Value::as_str).unwrap_or_default()
}

fn now() -> String {
    timestamp::format(Utc::now())
}

// ==================== Roles and kinds ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompanyRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceRole {
    Admin,
    Editor,
    Viewer,
}

impl SpaceRole {
    pub fn can_edit(&self) -> bool {
        !matches!(self, SpaceRole::Viewer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceItemType {
    Folder,
    Table,
    View,
    Dashboard,
}

// ==================== Users and companies ====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub preferences: Value,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_login_at: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Resource for User {
    const TABLE: &'static str = "users";
    const NAME: &'static str = "user";

    fn id(&self) -> &str {
        &self.id
    }

    fn collection_path(_row: &Row) -> String {
        "/api/users".to_string()
    }

    /// Users only ever edit their own profile
    fn member_path(_row: &Row) -> String {
        "/api/users/me".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub owner_id: String,
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default)]
    pub settings: Value,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl Company {
    pub fn new(name: impl Into<String>, slug: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: String::new(),
            name: name.into(),
            slug: slug.into(),
            owner_id: owner_id.into(),
            plan: default_plan(),
            settings: Value::Null,
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl Resource for Company {
    const TABLE: &'static str = "companies";
    const NAME: &'static str = "company";
    const GENERATED_COLUMNS: &'static [&'static str] =
        &["id", "owner_id", "plan", "settings", "created_at", "updated_at"];

    fn id(&self) -> &str {
        &self.id
    }

    fn collection_path(_row: &Row) -> String {
        "/api/companies".to_string()
    }

    fn member_path(row: &Row) -> String {
        format!("/api/companies/{}", text(row, "id"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanyMember {
    pub id: String,
    pub company_id: String,
    pub user_id: String,
    pub role: CompanyRole,
    pub joined_at: String,
    #[serde(default)]
    pub invited_by: Option<String>,
}

impl Resource for CompanyMember {
    const TABLE: &'static str = "company_members";
    const NAME: &'static str = "company member";
    const GENERATED_COLUMNS: &'static [&'static str] = &["id", "joined_at", "invited_by"];

    fn id(&self) -> &str {
        &self.id
    }

    fn collection_path(row: &Row) -> String {
        format!("/api/companies/{}/members", text(row, "company_id"))
    }

    /// Members are addressed by user id within their company
    fn member_path(row: &Row) -> String {
        format!(
            "/api/companies/{}/members/{}",
            text(row, "company_id"),
            text(row, "user_id")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InviteLink {
    pub id: String,
    pub company_id: String,
    pub created_by: String,
    #[serde(default)]
    pub email: Option<String>,
    pub token: String,
    pub role: CompanyRole,
    #[serde(default)]
    pub expires_at: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub used_at: Option<String>,
    #[serde(default)]
    pub used_by: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl InviteLink {
    /// Active, unused and not past its expiry at `now`
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.used_at.is_none()
            && self
                .expires_at
                .as_deref()
                .and_then(timestamp::parse)
                .map_or(true, |expires| expires > now)
    }
}

impl Resource for InviteLink {
    const TABLE: &'static str = "invite_links";
    const NAME: &'static str = "invite";
    const GENERATED_COLUMNS: &'static [&'static str] =
        &["id", "token", "created_by", "created_at", "is_active", "expires_at"];

    fn id(&self) -> &str {
        &self.id
    }

    fn collection_path(row: &Row) -> String {
        format!("/api/companies/{}/invites", text(row, "company_id"))
    }

    fn member_path(row: &Row) -> String {
        format!(
            "/api/companies/{}/invites/{}",
            text(row, "company_id"),
            text(row, "token")
        )
    }
}

// ==================== Spaces ====================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Space {
    pub id: String,
    pub company_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub settings: Value,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl Space {
    pub fn new(company_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: String::new(),
            company_id: company_id.into(),
            name: name.into(),
            description: None,
            icon: None,
            color: None,
            settings: Value::Null,
            created_by: String::new(),
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl Resource for Space {
    const TABLE: &'static str = "spaces";
    const NAME: &'static str = "space";

    fn id(&self) -> &str {
        &self.id
    }

    fn collection_path(_row: &Row) -> String {
        "/api/spaces".to_string()
    }

    fn member_path(row: &Row) -> String {
        format!("/api/spaces/{}", text(row, "id"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceMember {
    pub id: String,
    pub space_id: String,
    pub user_id: String,
    pub role: SpaceRole,
    pub joined_at: String,
    #[serde(default)]
    pub invited_by: Option<String>,
}

impl Resource for SpaceMember {
    const TABLE: &'static str = "space_members";
    const NAME: &'static str = "space member";
    const GENERATED_COLUMNS: &'static [&'static str] = &["id", "joined_at", "invited_by"];

    fn id(&self) -> &str {
        &self.id
    }

    fn collection_path(row: &Row) -> String {
        format!("/api/spaces/{}/members", text(row, "space_id"))
    }

    fn member_path(row: &Row) -> String {
        format!("/api/space-members/{}", text(row, "id"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceItem {
    pub id: String,
    pub space_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub item_type: SpaceItemType,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub order_index: i64,
    #[serde(default)]
    pub config: Value,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl SpaceItem {
    pub fn new(space_id: impl Into<String>, item_type: SpaceItemType, name: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: String::new(),
            space_id: space_id.into(),
            parent_id: None,
            item_type,
            name: name.into(),
            description: None,
            icon: None,
            color: None,
            order_index: 0,
            config: Value::Null,
            created_by: String::new(),
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == SpaceItemType::Folder
    }
}

impl Resource for SpaceItem {
    const TABLE: &'static str = "space_items";
    const NAME: &'static str = "space item";
    const PARENT_COLUMN: Option<&'static str> = Some("parent_id");
    const ORDER_COLUMN: Option<&'static str> = Some("order_index");
    const SCOPE_COLUMN: Option<&'static str> = Some("space_id");
    const GENERATED_COLUMNS: &'static [&'static str] =
        &["id", "order_index", "created_by", "created_at", "updated_at"];

    fn id(&self) -> &str {
        &self.id
    }

    fn collection_path(row: &Row) -> String {
        format!("/api/spaces/{}/items", text(row, "space_id"))
    }

    fn member_path(row: &Row) -> String {
        format!("/api/space-items/{}", text(row, "id"))
    }

    fn reorder_path(row: &Row) -> Option<String> {
        Some(format!("/api/spaces/{}/items/reorder", text(row, "space_id")))
    }
}

/// A row of a table item; its cells are user-defined columns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceItemRow {
    pub id: String,
    pub item_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub order_index: i64,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl SpaceItemRow {
    pub fn new(item_id: impl Into<String>, data: Value) -> Self {
        let now = now();
        Self {
            id: String::new(),
            item_id: item_id.into(),
            data,
            order_index: 0,
            created_by: String::new(),
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Value of one dynamic column
    pub fn cell(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }
}

impl Resource for SpaceItemRow {
    const TABLE: &'static str = "space_item_rows";
    const NAME: &'static str = "item row";
    const ORDER_COLUMN: Option<&'static str> = Some("order_index");
    const SCOPE_COLUMN: Option<&'static str> = Some("item_id");
    const GENERATED_COLUMNS: &'static [&'static str] =
        &["id", "order_index", "created_by", "created_at", "updated_at"];

    fn id(&self) -> &str {
        &self.id
    }

    fn collection_path(row: &Row) -> String {
        format!("/api/space-items/{}/rows", text(row, "item_id"))
    }

    fn member_path(row: &Row) -> String {
        format!("/api/space-items/{}/rows/{}", text(row, "item_id"), text(row, "id"))
    }
}

fn default_true() -> bool {
    true
}

fn default_plan() -> String {
    "basic".to_string()
}

// ==================== Timestamps ====================

/// Lenient timestamp handling for server-sent text
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};

    /// Parse RFC 3339 or the Postgres text form (`2024-01-02 03:04:05.678+00`)
    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }
        DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn format(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(timestamp::parse("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(timestamp::parse("2024-01-02 03:04:05+00"), Some(expected));
        assert_eq!(timestamp::parse("2024-01-02 05:04:05+02:00"), Some(expected));
        assert!(timestamp::parse("yesterday").is_none());

        let formatted = timestamp::format(expected);
        assert_eq!(formatted, "2024-01-02T03:04:05.000Z");
        assert_eq!(timestamp::parse(&formatted), Some(expected));
    }

    #[test]
    fn test_space_item_row_mapping() {
        let row = json!({
            "id": "i1",
            "space_id": "s1",
            "parent_id": null,
            "type": "folder",
            "name": "Docs",
            "order_index": 3,
            "config": {},
            "created_by": "u1",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "deleted_at": null
        });
        let item = SpaceItem::from_row(row.as_object().unwrap()).unwrap();
        assert!(item.is_folder());
        assert_eq!(item.order_index, 3);

        let back = item.to_row().unwrap();
        assert_eq!(back["type"], json!("folder"));
        assert_eq!(SpaceItem::member_path(&back), "/api/space-items/i1");
        assert_eq!(SpaceItem::collection_path(&back), "/api/spaces/s1/items");
        assert_eq!(
            SpaceItem::reorder_path(&back).as_deref(),
            Some("/api/spaces/s1/items/reorder")
        );
    }

    #[test]
    fn test_paths_use_scope_columns() {
        let member = json!({"company_id": "c1", "user_id": "u9", "id": "m1"});
        let member = member.as_object().unwrap();
        assert_eq!(CompanyMember::collection_path(member), "/api/companies/c1/members");
        assert_eq!(CompanyMember::member_path(member), "/api/companies/c1/members/u9");
        assert!(Company::reorder_path(member).is_none());

        let cells = json!({"item_id": "t1", "id": "r1"});
        assert_eq!(
            SpaceItemRow::member_path(cells.as_object().unwrap()),
            "/api/space-items/t1/rows/r1"
        );
    }

    #[test]
    fn test_invite_usability() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut invite = InviteLink {
            id: "inv".to_string(),
            company_id: "c1".to_string(),
            created_by: "u1".to_string(),
            email: None,
            token: "tok".to_string(),
            role: CompanyRole::Member,
            expires_at: Some("2024-07-01T00:00:00Z".to_string()),
            created_at: "2024-05-01T00:00:00Z".to_string(),
            used_at: None,
            used_by: None,
            is_active: true,
        };
        assert!(invite.is_usable(now));

        invite.expires_at = Some("2024-05-31T00:00:00Z".to_string());
        assert!(!invite.is_usable(now));

        invite.expires_at = None;
        invite.used_at = Some("2024-05-02T00:00:00Z".to_string());
        assert!(!invite.is_usable(now));
    }

    #[test]
    fn test_roles_and_dynamic_cells() {
        assert!(SpaceRole::Editor.can_edit());
        assert!(!SpaceRole::Viewer.can_edit());
        assert_eq!(serde_json::to_value(CompanyRole::Owner).unwrap(), json!("owner"));

        let row = SpaceItemRow::new("t1", json!({"status": "done", "points": 3}));
        assert_eq!(row.cell("points"), Some(&json!(3)));
        assert!(row.cell("missing").is_none());
    }
}
