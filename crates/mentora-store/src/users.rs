use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use mentora_schema::{
    Achievement, PointKind, PointTransaction, ProviderType, User, UserAchievement, UserCredential,
};

use crate::db::Database;

/// Parse the TEXT timestamps SQLite's `datetime('now')` default writes,
/// tolerating RFC 3339 values written by application code.
pub(crate) fn parse_sqlite_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        total_points: row.get(2)?,
        login_count: row.get(3)?,
        is_admin: row.get::<_, i64>(4)? != 0,
        created_at: parse_sqlite_datetime(&row.get::<_, String>(5)?),
    })
}

const USER_COLUMNS: &str = "id, username, total_points, login_count, is_admin, created_at";

#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, username: &str) -> Result<User> {
        let username = username.to_owned();
        self.db
            .call(move |conn| {
                conn.execute("INSERT INTO users(username) VALUES (?1)", params![username])?;
                let id = conn.last_insert_rowid();
                get_user(conn, id)?.ok_or_else(|| anyhow!("user {id} vanished after insert"))
            })
            .await
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<User>> {
        self.db.call(move |conn| get_user(conn, user_id)).await
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let username = username.to_owned();
        self.db
            .call(move |conn| {
                let user = conn
                    .query_row(
                        &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                        params![username],
                        row_to_user,
                    )
                    .optional()?;
                Ok(user)
            })
            .await
    }

    /// Bump the login counter. Daily check-in points are staged by the
    /// caller's transaction hook, not here.
    pub async fn record_login(&self, user_id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE users SET login_count = login_count + 1 WHERE id = ?1",
                    params![user_id],
                )?;
                if updated == 0 {
                    return Err(anyhow!("user {user_id} not found"));
                }
                Ok(())
            })
            .await
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub async fn upsert_credential(
        &self,
        user_id: i64,
        provider_type: ProviderType,
        encrypted_key: &str,
        base_url: Option<&str>,
        model_id: Option<&str>,
        model_ids: &[String],
    ) -> Result<i64> {
        let encrypted_key = encrypted_key.to_owned();
        let base_url = base_url.map(str::to_owned);
        let model_id = model_id.map(str::to_owned);
        let model_ids_json = serde_json::to_string(model_ids)?;
        self.db
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO user_credentials(user_id, provider_type, encrypted_key, base_url, model_id, model_ids)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(user_id, provider_type) DO UPDATE SET
                        encrypted_key = excluded.encrypted_key,
                        base_url = excluded.base_url,
                        model_id = excluded.model_id,
                        model_ids = excluded.model_ids
                    "#,
                    params![
                        user_id,
                        provider_type.as_str(),
                        encrypted_key,
                        base_url,
                        model_id,
                        model_ids_json
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn credential_for(
        &self,
        user_id: i64,
        provider_type: ProviderType,
    ) -> Result<Option<UserCredential>> {
        self.db
            .call(move |conn| {
                let cred = conn
                    .query_row(
                        r#"
                        SELECT id, user_id, provider_type, encrypted_key, base_url, model_id, model_ids
                        FROM user_credentials
                        WHERE user_id = ?1 AND provider_type = ?2
                        "#,
                        params![user_id, provider_type.as_str()],
                        row_to_credential,
                    )
                    .optional()?;
                Ok(cred)
            })
            .await
    }

    pub async fn credentials(&self, user_id: i64) -> Result<Vec<UserCredential>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, user_id, provider_type, encrypted_key, base_url, model_id, model_ids
                    FROM user_credentials
                    WHERE user_id = ?1
                    "#,
                )?;
                let rows = stmt.query_map(params![user_id], row_to_credential)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Points & achievements (read side; writes go through mentora-points
    // inside the caller's transaction)
    // ------------------------------------------------------------------

    pub async fn point_history(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PointTransaction>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, user_id, amount, reason, kind, related_entity_type, related_entity_id, created_at
                    FROM point_transactions
                    WHERE user_id = ?1
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?2 OFFSET ?3
                    "#,
                )?;
                let rows = stmt.query_map(params![user_id, limit, offset], |row| {
                    Ok(PointTransaction {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        amount: row.get(2)?,
                        reason: row.get(3)?,
                        kind: PointKind::parse(&row.get::<_, String>(4)?),
                        related_entity_type: row.get(5)?,
                        related_entity_id: row.get(6)?,
                        created_at: parse_sqlite_datetime(&row.get::<_, String>(7)?),
                    })
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Earned achievements joined with their definitions.
    pub async fn earned_achievements(
        &self,
        user_id: i64,
    ) -> Result<Vec<(UserAchievement, Achievement)>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT ua.id, ua.user_id, ua.achievement_id, ua.earned_at, ua.is_notified,
                           a.id, a.name, a.description, a.criteria_type, a.criteria_value,
                           a.reward_points, a.is_active
                    FROM user_achievements ua
                    JOIN achievements a ON a.id = ua.achievement_id
                    WHERE ua.user_id = ?1
                    ORDER BY ua.earned_at DESC
                    "#,
                )?;
                let rows = stmt.query_map(params![user_id], |row| {
                    Ok((
                        UserAchievement {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            achievement_id: row.get(2)?,
                            earned_at: parse_sqlite_datetime(&row.get::<_, String>(3)?),
                            is_notified: row.get::<_, i64>(4)? != 0,
                        },
                        Achievement {
                            id: row.get(5)?,
                            name: row.get(6)?,
                            description: row.get(7)?,
                            criteria_type: row.get(8)?,
                            criteria_value: row.get(9)?,
                            reward_points: row.get(10)?,
                            is_active: row.get::<_, i64>(11)? != 0,
                        },
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }
}

pub(crate) fn get_user(conn: &Connection, user_id: i64) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![user_id],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

fn row_to_credential(row: &Row) -> rusqlite::Result<UserCredential> {
    let provider_raw: String = row.get(2)?;
    let model_ids_json: String = row.get(6)?;
    Ok(UserCredential {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider_type: ProviderType::parse(&provider_raw).unwrap_or(ProviderType::Custom),
        encrypted_key: row.get(3)?,
        base_url: row.get(4)?,
        model_id: row.get(5)?,
        model_ids: serde_json::from_str(&model_ids_json).unwrap_or_default(),
    })
}
