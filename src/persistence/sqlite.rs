//! SQLite-backed relational store
//!
//! sqlx implementation of [`RelationalStore`] with WAL mode and a schema
//! created on first boot. Multi-row commands run inside one transaction;
//! prerequisite rows (the backing entity row, verb and scheme type rows,
//! pattern-backed resource rows) are created in the same transaction as the
//! rows that reference them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;

use crate::graph::{Permission, PermissionScheme, PrincipalKind, PrincipalRef, Resource, Verb};
use crate::persistence::rows::{
    ArchiveLogRow, AuditLogRow, PrincipalRow, RowOp, StoreSnapshot, StoredPermission,
};
use crate::persistence::store::{RelationalStore, StoreError, StoreResult};

/// Resource type tag for rows that only back a permission's URI pattern
const PATTERN_RESOURCE_TYPE: &str = "uri_pattern";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        entity_id INTEGER NOT NULL REFERENCES entities(id),
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS groups (
        id INTEGER PRIMARY KEY,
        entity_id INTEGER NOT NULL REFERENCES entities(id),
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS roles (
        id INTEGER PRIMARY KEY,
        entity_id INTEGER NOT NULL REFERENCES entities(id),
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS user_groups (
        user_id INTEGER NOT NULL,
        group_id INTEGER NOT NULL,
        UNIQUE(user_id, group_id)
    )",
    "CREATE TABLE IF NOT EXISTS user_roles (
        user_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        UNIQUE(user_id, role_id)
    )",
    "CREATE TABLE IF NOT EXISTS group_roles (
        group_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        UNIQUE(group_id, role_id)
    )",
    "CREATE TABLE IF NOT EXISTS group_hierarchies (
        parent_group_id INTEGER NOT NULL,
        child_group_id INTEGER NOT NULL,
        UNIQUE(parent_group_id, child_group_id)
    )",
    "CREATE TABLE IF NOT EXISTS resources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        resource_type TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        parent_resource_id INTEGER,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS verb_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        verb_name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS scheme_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scheme_name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS permission_schemes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id INTEGER NOT NULL REFERENCES entities(id),
        scheme_type_id INTEGER NOT NULL REFERENCES scheme_types(id),
        uri_access_id INTEGER,
        grant_flag INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS uri_accesses (
        id INTEGER PRIMARY KEY,
        resource_id INTEGER NOT NULL REFERENCES resources(id),
        verb_type_id INTEGER NOT NULL REFERENCES verb_types(id),
        permission_scheme_id INTEGER NOT NULL REFERENCES permission_schemes(id),
        grant_flag INTEGER NOT NULL,
        deny_flag INTEGER NOT NULL,
        conditions TEXT NOT NULL DEFAULT '[]',
        granted_at TEXT NOT NULL,
        UNIQUE(resource_id, verb_type_id, permission_scheme_id)
    )",
    "CREATE TABLE IF NOT EXISTS audit_logs (
        id INTEGER PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        change_type TEXT NOT NULL,
        changed_by TEXT NOT NULL,
        change_date TEXT NOT NULL,
        change_details TEXT NOT NULL,
        content_hash TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS data_archive_log (
        archive_id INTEGER PRIMARY KEY AUTOINCREMENT,
        archive_type TEXT NOT NULL,
        archive_date TEXT NOT NULL,
        records_archived INTEGER NOT NULL,
        archive_size INTEGER NOT NULL,
        archive_path TEXT NOT NULL,
        status TEXT NOT NULL,
        created_by TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    )",
];

/// sqlx SQLite store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a SQLite database, creating the file when missing
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        Ok(Self { pool })
    }

    fn principal_table(kind: PrincipalKind) -> &'static str {
        match kind {
            PrincipalKind::User => "users",
            PrincipalKind::Group => "groups",
            PrincipalKind::Role => "roles",
        }
    }

    async fn upsert_principal(
        conn: &mut SqliteConnection,
        kind: PrincipalKind,
        id: i64,
        name: &str,
    ) -> StoreResult<()> {
        let table = Self::principal_table(kind);
        let existing = sqlx::query(&format!("SELECT id FROM {table} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        if existing.is_some() {
            sqlx::query(&format!("UPDATE {table} SET name = ? WHERE id = ?"))
                .bind(name)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            return Ok(());
        }
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO entities (entity_type, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        let entity_id = result.last_insert_rowid();
        sqlx::query(&format!(
            "INSERT INTO {table} (id, entity_id, name) VALUES (?, ?, ?)"
        ))
        .bind(id)
        .bind(entity_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn entity_id_of(
        conn: &mut SqliteConnection,
        target: PrincipalRef,
    ) -> StoreResult<i64> {
        let table = Self::principal_table(target.kind);
        let row = sqlx::query(&format!("SELECT entity_id FROM {table} WHERE id = ?"))
            .bind(target.id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{target} has no stored row")))?;
        Ok(row.get::<i64, _>("entity_id"))
    }

    async fn delete_principal(
        conn: &mut SqliteConnection,
        kind: PrincipalKind,
        id: i64,
    ) -> StoreResult<()> {
        let target = PrincipalRef { kind, id };
        let Ok(entity_id) = Self::entity_id_of(conn, target).await else {
            return Ok(()); // already absent; deletes are idempotent
        };
        // Cascade owned permission rows first, then join rows, then the
        // entity and principal rows.
        sqlx::query(
            "DELETE FROM uri_accesses WHERE permission_scheme_id IN \
             (SELECT id FROM permission_schemes WHERE entity_id = ?)",
        )
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
        sqlx::query("DELETE FROM permission_schemes WHERE entity_id = ?")
            .bind(entity_id)
            .execute(&mut *conn)
            .await?;
        match kind {
            PrincipalKind::User => {
                sqlx::query("DELETE FROM user_groups WHERE user_id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("DELETE FROM user_roles WHERE user_id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
            }
            PrincipalKind::Group => {
                sqlx::query("DELETE FROM user_groups WHERE group_id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("DELETE FROM group_roles WHERE group_id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(
                    "DELETE FROM group_hierarchies WHERE parent_group_id = ? OR child_group_id = ?",
                )
                .bind(id)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            }
            PrincipalKind::Role => {
                sqlx::query("DELETE FROM user_roles WHERE role_id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("DELETE FROM group_roles WHERE role_id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        let table = Self::principal_table(kind);
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(entity_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn insert_pair(
        conn: &mut SqliteConnection,
        table: &str,
        columns: (&str, &str),
        pair: (i64, i64),
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {table} ({}, {}) VALUES (?, ?)",
            columns.0, columns.1
        ))
        .bind(pair.0)
        .bind(pair.1)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn delete_pair(
        conn: &mut SqliteConnection,
        table: &str,
        columns: (&str, &str),
        pair: (i64, i64),
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE {} = ? AND {} = ?",
            columns.0, columns.1
        ))
        .bind(pair.0)
        .bind(pair.1)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn ensure_verb(conn: &mut SqliteConnection, verb: Verb) -> StoreResult<i64> {
        sqlx::query("INSERT OR IGNORE INTO verb_types (verb_name) VALUES (?)")
            .bind(verb.as_str())
            .execute(&mut *conn)
            .await?;
        let row = sqlx::query("SELECT id FROM verb_types WHERE verb_name = ?")
            .bind(verb.as_str())
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.get::<i64, _>("id"))
    }

    async fn ensure_scheme(conn: &mut SqliteConnection, scheme: &str) -> StoreResult<i64> {
        sqlx::query("INSERT OR IGNORE INTO scheme_types (scheme_name) VALUES (?)")
            .bind(scheme)
            .execute(&mut *conn)
            .await?;
        let row = sqlx::query("SELECT id FROM scheme_types WHERE scheme_name = ?")
            .bind(scheme)
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Resolve the resource row backing a permission, creating an inactive
    /// pattern-backed row when the permission is not pinned to a resource
    async fn resource_for_permission(
        conn: &mut SqliteConnection,
        permission: &Permission,
    ) -> StoreResult<i64> {
        if let Some(resource_id) = permission.resource_id {
            let row = sqlx::query("SELECT id FROM resources WHERE id = ?")
                .bind(resource_id)
                .fetch_optional(&mut *conn)
                .await?;
            return row
                .map(|r| r.get::<i64, _>("id"))
                .ok_or_else(|| StoreError::NotFound(format!("resource {resource_id}")));
        }
        let existing = sqlx::query(
            "SELECT id FROM resources WHERE uri = ? AND resource_type = ? LIMIT 1",
        )
        .bind(&permission.uri)
        .bind(PATTERN_RESOURCE_TYPE)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = existing {
            return Ok(row.get::<i64, _>("id"));
        }
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO resources \
             (uri, description, resource_type, version, is_active, created_at, updated_at) \
             VALUES (?, '', ?, 0, 0, ?, ?)",
        )
        .bind(&permission.uri)
        .bind(PATTERN_RESOURCE_TYPE)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn scheme_row_for(
        conn: &mut SqliteConnection,
        entity_id: i64,
        scheme_type_id: i64,
    ) -> StoreResult<i64> {
        let existing = sqlx::query(
            "SELECT id FROM permission_schemes WHERE entity_id = ? AND scheme_type_id = ?",
        )
        .bind(entity_id)
        .bind(scheme_type_id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = existing {
            return Ok(row.get::<i64, _>("id"));
        }
        let result = sqlx::query(
            "INSERT INTO permission_schemes (entity_id, scheme_type_id, grant_flag) VALUES (?, ?, 1)",
        )
        .bind(entity_id)
        .bind(scheme_type_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn upsert_permission(
        conn: &mut SqliteConnection,
        owner: PrincipalRef,
        permission: &Permission,
    ) -> StoreResult<()> {
        let entity_id = Self::entity_id_of(conn, owner).await?;
        let resource_id = Self::resource_for_permission(conn, permission).await?;
        let verb_type_id = Self::ensure_verb(conn, permission.verb).await?;
        let scheme_type_id = Self::ensure_scheme(conn, permission.scheme.name()).await?;
        let scheme_id = Self::scheme_row_for(conn, entity_id, scheme_type_id).await?;
        let conditions = serde_json::to_string(&permission.conditions)?;

        // OR REPLACE covers both conflict paths: a re-grant keeps its row id
        // (primary-key hit) and also matches the (resource, verb, scheme)
        // unique index; both identify the same logical row.
        sqlx::query(
            "INSERT OR REPLACE INTO uri_accesses \
             (id, resource_id, verb_type_id, permission_scheme_id, grant_flag, deny_flag, conditions, granted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(permission.id)
        .bind(resource_id)
        .bind(verb_type_id)
        .bind(scheme_id)
        .bind(permission.grant)
        .bind(permission.deny)
        .bind(conditions)
        .bind(permission.granted_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn delete_permission(
        conn: &mut SqliteConnection,
        owner: PrincipalRef,
        uri: &str,
        verb: Verb,
    ) -> StoreResult<()> {
        let Ok(entity_id) = Self::entity_id_of(conn, owner).await else {
            return Ok(());
        };
        sqlx::query(
            "DELETE FROM uri_accesses WHERE \
             permission_scheme_id IN (SELECT id FROM permission_schemes WHERE entity_id = ?) \
             AND verb_type_id IN (SELECT id FROM verb_types WHERE verb_name = ?) \
             AND resource_id IN (SELECT id FROM resources WHERE uri = ?)",
        )
        .bind(entity_id)
        .bind(verb.as_str())
        .bind(uri)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn upsert_resource(
        conn: &mut SqliteConnection,
        resource: &Resource,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO resources \
             (id, uri, description, resource_type, version, parent_resource_id, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             uri = excluded.uri, description = excluded.description, \
             resource_type = excluded.resource_type, version = excluded.version, \
             parent_resource_id = excluded.parent_resource_id, \
             is_active = excluded.is_active, updated_at = excluded.updated_at",
        )
        .bind(resource.id)
        .bind(&resource.uri)
        .bind(&resource.description)
        .bind(&resource.resource_type)
        .bind(resource.version)
        .bind(resource.parent_resource_id)
        .bind(resource.is_active)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn apply_op(conn: &mut SqliteConnection, op: &RowOp) -> StoreResult<()> {
        match op {
            RowOp::UpsertUser { id, name } => {
                Self::upsert_principal(conn, PrincipalKind::User, *id, name).await
            }
            RowOp::UpsertGroup { id, name } => {
                Self::upsert_principal(conn, PrincipalKind::Group, *id, name).await
            }
            RowOp::UpsertRole { id, name } => {
                Self::upsert_principal(conn, PrincipalKind::Role, *id, name).await
            }
            RowOp::DeleteUser { id } => {
                Self::delete_principal(conn, PrincipalKind::User, *id).await
            }
            RowOp::DeleteGroup { id } => {
                Self::delete_principal(conn, PrincipalKind::Group, *id).await
            }
            RowOp::DeleteRole { id } => {
                Self::delete_principal(conn, PrincipalKind::Role, *id).await
            }
            RowOp::InsertUserGroup { user_id, group_id } => {
                Self::insert_pair(conn, "user_groups", ("user_id", "group_id"), (*user_id, *group_id))
                    .await
            }
            RowOp::DeleteUserGroup { user_id, group_id } => {
                Self::delete_pair(conn, "user_groups", ("user_id", "group_id"), (*user_id, *group_id))
                    .await
            }
            RowOp::InsertUserRole { user_id, role_id } => {
                Self::insert_pair(conn, "user_roles", ("user_id", "role_id"), (*user_id, *role_id))
                    .await
            }
            RowOp::DeleteUserRole { user_id, role_id } => {
                Self::delete_pair(conn, "user_roles", ("user_id", "role_id"), (*user_id, *role_id))
                    .await
            }
            RowOp::InsertGroupRole { group_id, role_id } => {
                Self::insert_pair(conn, "group_roles", ("group_id", "role_id"), (*group_id, *role_id))
                    .await
            }
            RowOp::DeleteGroupRole { group_id, role_id } => {
                Self::delete_pair(conn, "group_roles", ("group_id", "role_id"), (*group_id, *role_id))
                    .await
            }
            RowOp::InsertGroupHierarchy {
                parent_group_id,
                child_group_id,
            } => {
                Self::insert_pair(
                    conn,
                    "group_hierarchies",
                    ("parent_group_id", "child_group_id"),
                    (*parent_group_id, *child_group_id),
                )
                .await
            }
            RowOp::DeleteGroupHierarchy {
                parent_group_id,
                child_group_id,
            } => {
                Self::delete_pair(
                    conn,
                    "group_hierarchies",
                    ("parent_group_id", "child_group_id"),
                    (*parent_group_id, *child_group_id),
                )
                .await
            }
            RowOp::EnsureVerbType { verb } => Self::ensure_verb(conn, *verb).await.map(|_| ()),
            RowOp::EnsureSchemeType { scheme } => {
                Self::ensure_scheme(conn, scheme).await.map(|_| ())
            }
            RowOp::UpsertPermission { owner, permission } => {
                Self::upsert_permission(conn, *owner, permission).await
            }
            RowOp::DeletePermission { owner, uri, verb } => {
                Self::delete_permission(conn, *owner, uri, *verb).await
            }
            RowOp::UpsertResource { resource } => Self::upsert_resource(conn, resource).await,
            RowOp::DeactivateResource { id } => {
                sqlx::query("UPDATE resources SET is_active = 0, updated_at = ? WHERE id = ?")
                    .bind(Utc::now())
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
        }
    }

    async fn load_principals(
        &self,
        table: &str,
    ) -> StoreResult<Vec<PrincipalRow>> {
        let rows = sqlx::query(&format!("SELECT id, entity_id, name FROM {table} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| PrincipalRow {
                id: row.get("id"),
                entity_id: row.get("entity_id"),
                name: row.get("name"),
            })
            .collect())
    }

    async fn load_pairs(&self, table: &str, columns: (&str, &str)) -> StoreResult<Vec<(i64, i64)>> {
        let rows = sqlx::query(&format!(
            "SELECT {}, {} FROM {table}",
            columns.0, columns.1
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(columns.0), row.get(columns.1)))
            .collect())
    }

    async fn load_permissions(
        &self,
        owners_by_entity: &HashMap<i64, PrincipalRef>,
    ) -> StoreResult<Vec<StoredPermission>> {
        let rows = sqlx::query(
            "SELECT ua.id, ua.grant_flag, ua.deny_flag, ua.conditions, ua.granted_at, \
                    r.uri, r.id AS resource_id, r.resource_type, \
                    v.verb_name, st.scheme_name, ps.entity_id \
             FROM uri_accesses ua \
             JOIN verb_types v ON v.id = ua.verb_type_id \
             JOIN permission_schemes ps ON ps.id = ua.permission_scheme_id \
             JOIN scheme_types st ON st.id = ps.scheme_type_id \
             JOIN resources r ON r.id = ua.resource_id \
             ORDER BY ua.id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut permissions = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_id: i64 = row.get("entity_id");
            let Some(owner) = owners_by_entity.get(&entity_id).copied() else {
                return Err(StoreError::NotFound(format!(
                    "entity {entity_id} has a permission but no principal row"
                )));
            };
            let verb_name: String = row.get("verb_name");
            let verb = verb_name
                .parse::<Verb>()
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let scheme_name: String = row.get("scheme_name");
            let scheme = if scheme_name == PermissionScheme::ApiUriAuthorization.name() {
                PermissionScheme::ApiUriAuthorization
            } else {
                PermissionScheme::Custom(scheme_name)
            };
            let conditions: String = row.get("conditions");
            let resource_type: String = row.get("resource_type");
            let resource_id: i64 = row.get("resource_id");
            permissions.push(StoredPermission {
                owner,
                permission: Permission {
                    id: row.get("id"),
                    principal_id: owner.id,
                    uri: row.get("uri"),
                    verb,
                    grant: row.get("grant_flag"),
                    deny: row.get("deny_flag"),
                    scheme,
                    resource_id: (resource_type != PATTERN_RESOURCE_TYPE).then_some(resource_id),
                    conditions: serde_json::from_str(&conditions)?,
                    granted_at: row.get("granted_at"),
                },
            });
        }
        Ok(permissions)
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn init(&self) -> StoreResult<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn apply(&self, ops: &[RowOp]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            Self::apply_op(&mut *tx, op).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn group_has_ancestor(&self, group_id: i64, candidate: i64) -> StoreResult<bool> {
        let row = sqlx::query(
            "WITH RECURSIVE ancestors(id) AS ( \
                 SELECT parent_group_id FROM group_hierarchies WHERE child_group_id = ? \
                 UNION \
                 SELECT gh.parent_group_id FROM group_hierarchies gh \
                 JOIN ancestors a ON gh.child_group_id = a.id \
             ) SELECT 1 AS hit FROM ancestors WHERE id = ? LIMIT 1",
        )
        .bind(group_id)
        .bind(candidate)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn load_snapshot(&self) -> StoreResult<StoreSnapshot> {
        let users = self.load_principals("users").await?;
        let groups = self.load_principals("groups").await?;
        let roles = self.load_principals("roles").await?;

        let mut owners_by_entity = HashMap::new();
        for row in &users {
            owners_by_entity.insert(row.entity_id, PrincipalRef::user(row.id));
        }
        for row in &groups {
            owners_by_entity.insert(row.entity_id, PrincipalRef::group(row.id));
        }
        for row in &roles {
            owners_by_entity.insert(row.entity_id, PrincipalRef::role(row.id));
        }

        let permissions = self.load_permissions(&owners_by_entity).await?;

        let resource_rows = sqlx::query(
            "SELECT id, uri, description, resource_type, version, parent_resource_id, \
                    is_active, created_at, updated_at \
             FROM resources WHERE resource_type != ? ORDER BY id",
        )
        .bind(PATTERN_RESOURCE_TYPE)
        .fetch_all(&self.pool)
        .await?;
        let resources = resource_rows
            .into_iter()
            .map(|row| Resource {
                id: row.get("id"),
                uri: row.get("uri"),
                description: row.get("description"),
                resource_type: row.get("resource_type"),
                version: row.get("version"),
                parent_resource_id: row.get("parent_resource_id"),
                is_active: row.get("is_active"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect();

        Ok(StoreSnapshot {
            users,
            groups,
            roles,
            user_groups: self.load_pairs("user_groups", ("user_id", "group_id")).await?,
            user_roles: self.load_pairs("user_roles", ("user_id", "role_id")).await?,
            group_roles: self.load_pairs("group_roles", ("group_id", "role_id")).await?,
            group_hierarchies: self
                .load_pairs("group_hierarchies", ("parent_group_id", "child_group_id"))
                .await?,
            permissions,
            resources,
        })
    }

    async fn append_audit(&self, row: &AuditLogRow) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO audit_logs \
             (id, entity_type, entity_id, change_type, changed_by, change_date, change_details, content_hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.id)
        .bind(&row.entity_type)
        .bind(row.entity_id)
        .bind(&row.change_type)
        .bind(&row.changed_by)
        .bind(row.change_date)
        .bind(&row.change_details)
        .bind(&row.content_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_after(&self, after_id: i64, limit: u32) -> StoreResult<Vec<AuditLogRow>> {
        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, change_type, changed_by, change_date, \
                    change_details, content_hash \
             FROM audit_logs WHERE id > ? ORDER BY id LIMIT ?",
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(audit_row_from).collect())
    }

    async fn max_audit_id(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS max_id FROM audit_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("max_id"))
    }

    async fn audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<AuditLogRow>> {
        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, change_type, changed_by, change_date, \
                    change_details, content_hash \
             FROM audit_logs WHERE change_date < ? ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(audit_row_from).collect())
    }

    async fn delete_audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE change_date < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_archive(&self, row: &ArchiveLogRow) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO data_archive_log \
             (archive_type, archive_date, records_archived, archive_size, archive_path, status, created_by, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.archive_type)
        .bind(row.archive_date)
        .bind(row.records_archived)
        .bind(row.archive_size)
        .bind(&row.archive_path)
        .bind(&row.status)
        .bind(&row.created_by)
        .bind(&row.metadata)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn audit_row_from(row: sqlx::sqlite::SqliteRow) -> AuditLogRow {
    AuditLogRow {
        id: row.get("id"),
        entity_type: row.get("entity_type"),
        entity_id: row.get("entity_id"),
        change_type: row.get("change_type"),
        changed_by: row.get("changed_by"),
        change_date: row.get("change_date"),
        change_details: row.get("change_details"),
        content_hash: row.get("content_hash"),
    }
}
