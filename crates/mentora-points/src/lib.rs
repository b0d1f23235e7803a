//! Points and achievement hook.
//!
//! Every function here takes the caller's open transaction, so credits
//! and badge grants commit or roll back together with the action that
//! earned them. Nothing in this crate opens its own transaction.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

use mentora_schema::PointKind;

/// Standard award amounts for user-observable actions.
pub mod amounts {
    pub const DAILY_LOGIN: i64 = 5;
    pub const PROJECT_COMPLETED: i64 = 20;
    pub const COURSE_COMPLETED: i64 = 30;
    pub const FORUM_POST: i64 = 15;
    pub const COMMENT: i64 = 5;
    pub const LIKE_RECEIVED: i64 = 2;
    pub const CHAT_MESSAGE: i64 = 1;
}

/// User-visible transaction reasons.
pub mod reasons {
    pub const DAILY_LOGIN: &str = "每日登录";
    pub const PROJECT_COMPLETED: &str = "完成项目";
    pub const COURSE_COMPLETED: &str = "完成课程";
    pub const FORUM_POST: &str = "发布论坛话题";
    pub const COMMENT: &str = "发表评论";
    pub const LIKE_RECEIVED: &str = "收到点赞";
    pub const CHAT_MESSAGE: &str = "发送聊天消息";
}

/// Counter names an achievement's `criteria_type` may reference.
pub mod criteria {
    pub const FORUM_POSTS_COUNT: &str = "FORUM_POSTS_COUNT";
    pub const CHAT_MESSAGES_COUNT: &str = "CHAT_MESSAGES_COUNT";
    pub const LOGIN_COUNT: &str = "LOGIN_COUNT";
    pub const COMPLETED_PROJECTS_COUNT: &str = "COMPLETED_PROJECTS_COUNT";
    pub const COMPLETED_COURSES_COUNT: &str = "COMPLETED_COURSES_COUNT";
    pub const LIKES_RECEIVED_COUNT: &str = "LIKES_RECEIVED_COUNT";
}

/// Stage one point transaction and mutate the user's balance in the
/// surrounding transaction.
///
/// The balance is clamped at zero: a negative award larger than the
/// current balance is reduced to exactly drain it, and the staged row
/// records the applied (possibly reduced) amount so the ledger sum
/// always equals the balance. Returns the applied amount.
pub fn award_points(
    conn: &Connection,
    user_id: i64,
    amount: i64,
    reason: &str,
    kind: PointKind,
    related_entity_type: Option<&str>,
    related_entity_id: Option<i64>,
) -> Result<i64> {
    let current: Option<i64> = conn
        .query_row(
            "SELECT total_points FROM users WHERE id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?;
    let current = current.ok_or_else(|| anyhow!("user {user_id} not found"))?;

    let applied = if current + amount < 0 { -current } else { amount };
    if applied == 0 && amount != 0 {
        tracing::debug!(user_id, amount, "point award clamped to zero balance");
    }

    conn.execute(
        r#"
        INSERT INTO point_transactions
            (user_id, amount, reason, kind, related_entity_type, related_entity_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            user_id,
            applied,
            reason,
            kind.as_str(),
            related_entity_type,
            related_entity_id
        ],
    )?;
    conn.execute(
        "UPDATE users SET total_points = total_points + ?1 WHERE id = ?2",
        params![applied, user_id],
    )?;

    Ok(applied)
}

/// A badge granted by an achievement check.
#[derive(Debug, Clone)]
pub struct GrantedAchievement {
    pub achievement_id: i64,
    pub name: String,
    pub reward_points: i64,
}

/// Compare the user's activity counters against every active, not yet
/// earned achievement definition, granting matches. Counters are read
/// within the caller's transaction so the triggering action is visible.
///
/// Granting is single-flight: `(user_id, achievement_id)` is unique and
/// the insert is `OR IGNORE`, so a concurrent duplicate attempt awards
/// nothing twice.
pub fn check_and_award_achievements(
    conn: &Connection,
    user_id: i64,
) -> Result<Vec<GrantedAchievement>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT a.id, a.name, a.criteria_type, a.criteria_value, a.reward_points
        FROM achievements a
        WHERE a.is_active = 1
          AND NOT EXISTS (
              SELECT 1 FROM user_achievements ua
              WHERE ua.user_id = ?1 AND ua.achievement_id = a.id
          )
        "#,
    )?;
    let candidates = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut granted = Vec::new();
    for (achievement_id, name, criteria_type, criteria_value, reward_points) in candidates {
        let counter = read_counter(conn, user_id, &criteria_type)?;
        if counter < criteria_value {
            continue;
        }

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO user_achievements(user_id, achievement_id) VALUES (?1, ?2)",
            params![user_id, achievement_id],
        )?;
        if inserted == 0 {
            continue;
        }

        if reward_points > 0 {
            award_points(
                conn,
                user_id,
                reward_points,
                &format!("获得成就：{name}"),
                PointKind::Earn,
                Some("achievement"),
                Some(achievement_id),
            )?;
        }

        tracing::info!(user_id, achievement_id, %name, "achievement granted");
        granted.push(GrantedAchievement {
            achievement_id,
            name,
            reward_points,
        });
    }

    Ok(granted)
}

/// Read one activity counter. Counts derive from the live tables where
/// the platform owns the data; externally-owned counters (projects,
/// courses, likes) come from the `user_counters` contract table.
fn read_counter(conn: &Connection, user_id: i64, criteria_type: &str) -> Result<i64> {
    let value = match criteria_type {
        criteria::FORUM_POSTS_COUNT => conn.query_row(
            "SELECT COUNT(*) FROM forum_topics WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?,
        criteria::CHAT_MESSAGES_COUNT => conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM ai_conversation_messages m
            JOIN ai_conversations c ON c.id = m.conversation_id
            WHERE c.owner_id = ?1 AND m.role = 'user'
            "#,
            params![user_id],
            |r| r.get(0),
        )?,
        criteria::LOGIN_COUNT => conn.query_row(
            "SELECT login_count FROM users WHERE id = ?1",
            params![user_id],
            |r| r.get(0),
        )?,
        _ => conn
            .query_row(
                "SELECT value FROM user_counters WHERE user_id = ?1 AND counter = ?2",
                params![user_id, criteria_type],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0),
    };
    Ok(value)
}

/// Bump an externally-owned counter (projects completed, likes
/// received, ...) inside the caller's transaction.
pub fn increment_counter(conn: &Connection, user_id: i64, counter: &str, by: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO user_counters(user_id, counter, value) VALUES (?1, ?2, ?3)
        ON CONFLICT(user_id, counter) DO UPDATE SET value = value + excluded.value
        "#,
        params![user_id, counter, by],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mentora_store::Database;

    async fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let user_id = db
            .call(|conn| {
                conn.execute("INSERT INTO users(username) VALUES ('player')", [])?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .unwrap();
        (db, user_id)
    }

    fn balance(conn: &Connection, user_id: i64) -> i64 {
        conn.query_row(
            "SELECT total_points FROM users WHERE id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .unwrap()
    }

    fn ledger_sum(conn: &Connection, user_id: i64) -> i64 {
        conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM point_transactions WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn award_updates_balance_and_ledger() {
        let (db, user_id) = setup().await;
        db.transaction(move |tx| {
            award_points(tx, user_id, 15, reasons::FORUM_POST, PointKind::Earn, None, None)?;
            award_points(tx, user_id, 1, reasons::CHAT_MESSAGE, PointKind::Earn, None, None)?;
            assert_eq!(balance(tx, user_id), 16);
            assert_eq!(ledger_sum(tx, user_id), 16);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn negative_award_clamps_at_zero() {
        let (db, user_id) = setup().await;
        db.transaction(move |tx| {
            award_points(tx, user_id, 10, "seed", PointKind::Earn, None, None)?;
            let applied = award_points(
                tx,
                user_id,
                -25,
                "admin deduction",
                PointKind::AdminAdjust,
                None,
                None,
            )?;
            assert_eq!(applied, -10);
            assert_eq!(balance(tx, user_id), 0);
            // Ledger sum matches the clamped balance.
            assert_eq!(ledger_sum(tx, user_id), 0);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn achievement_grant_is_atomic_with_action() {
        let (db, user_id) = setup().await;
        db.transaction(move |tx| {
            tx.execute(
                "INSERT INTO achievements(name, criteria_type, criteria_value, reward_points)
                 VALUES ('首个话题', 'FORUM_POSTS_COUNT', 1, 10)",
                [],
            )?;

            // The triggering action is visible to the counter read.
            tx.execute(
                "INSERT INTO forum_topics(user_id, title) VALUES (?1, 'hello world')",
                params![user_id],
            )?;
            award_points(tx, user_id, amounts::FORUM_POST, reasons::FORUM_POST, PointKind::Earn, None, None)?;
            let granted = check_and_award_achievements(tx, user_id)?;
            assert_eq!(granted.len(), 1);
            assert_eq!(granted[0].reward_points, 10);

            // 15 for the post + 10 for the achievement reward.
            assert_eq!(balance(tx, user_id), 25);

            let reward_rows: i64 = tx.query_row(
                "SELECT COUNT(*) FROM point_transactions
                 WHERE user_id = ?1 AND related_entity_type = 'achievement'",
                params![user_id],
                |r| r.get(0),
            )?;
            assert_eq!(reward_rows, 1);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn achievement_never_granted_twice() {
        let (db, user_id) = setup().await;
        db.transaction(move |tx| {
            tx.execute(
                "INSERT INTO achievements(name, criteria_type, criteria_value, reward_points)
                 VALUES ('健谈', 'CHAT_MESSAGES_COUNT', 0, 5)",
                [],
            )?;
            let first = check_and_award_achievements(tx, user_id)?;
            assert_eq!(first.len(), 1);
            let second = check_and_award_achievements(tx, user_id)?;
            assert!(second.is_empty());
            assert_eq!(balance(tx, user_id), 5);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn inactive_achievements_ignored() {
        let (db, user_id) = setup().await;
        db.transaction(move |tx| {
            tx.execute(
                "INSERT INTO achievements(name, criteria_type, criteria_value, reward_points, is_active)
                 VALUES ('off', 'LOGIN_COUNT', 0, 100, 0)",
                [],
            )?;
            let granted = check_and_award_achievements(tx, user_id)?;
            assert!(granted.is_empty());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn external_counters_via_contract_table() {
        let (db, user_id) = setup().await;
        db.transaction(move |tx| {
            tx.execute(
                "INSERT INTO achievements(name, criteria_type, criteria_value, reward_points)
                 VALUES ('course finisher', 'COMPLETED_COURSES_COUNT', 2, 30)",
                [],
            )?;

            increment_counter(tx, user_id, criteria::COMPLETED_COURSES_COUNT, 1)?;
            assert!(check_and_award_achievements(tx, user_id)?.is_empty());

            increment_counter(tx, user_id, criteria::COMPLETED_COURSES_COUNT, 1)?;
            let granted = check_and_award_achievements(tx, user_id)?;
            assert_eq!(granted.len(), 1);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn rollback_erases_grant_and_points() {
        let (db, user_id) = setup().await;
        let result: anyhow::Result<()> = db
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO achievements(name, criteria_type, criteria_value, reward_points)
                     VALUES ('早起', 'LOGIN_COUNT', 0, 5)",
                    [],
                )?;
                check_and_award_achievements(tx, user_id)?;
                anyhow::bail!("outer handler failed")
            })
            .await;
        assert!(result.is_err());

        db.call(move |conn| {
            let grants: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_achievements WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )?;
            assert_eq!(grants, 0);
            assert_eq!(balance(conn, user_id), 0);
            Ok(())
        })
        .await
        .unwrap();
    }
}
