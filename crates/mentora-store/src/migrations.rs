use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;

type Migration = (i64, &'static str);

fn migrations() -> Vec<Migration> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                total_points INTEGER NOT NULL DEFAULT 0,
                login_count INTEGER NOT NULL DEFAULT 0,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS user_credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                provider_type TEXT NOT NULL,
                encrypted_key TEXT NOT NULL,
                base_url TEXT,
                model_id TEXT,
                model_ids TEXT NOT NULL DEFAULT '[]',
                UNIQUE(user_id, provider_type)
            );

            CREATE INDEX IF NOT EXISTS idx_credentials_user ON user_credentials(user_id);
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_bases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                description TEXT,
                access TEXT NOT NULL DEFAULT 'private',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS kb_folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kb_id INTEGER NOT NULL REFERENCES knowledge_bases(id),
                owner_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                parent_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS knowledge_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kb_id INTEGER NOT NULL REFERENCES knowledge_bases(id),
                owner_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS knowledge_documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kb_id INTEGER NOT NULL REFERENCES knowledge_bases(id),
                owner_id INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                blob_key TEXT NOT NULL,
                blob_public_url TEXT NOT NULL,
                mime TEXT NOT NULL,
                folder_id INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                status_message TEXT,
                total_chunks INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_documents_kb ON knowledge_documents(kb_id);
            CREATE INDEX IF NOT EXISTS idx_documents_owner ON knowledge_documents(owner_id);
            "#,
        ),
        (
            3,
            r#"
            CREATE TABLE IF NOT EXISTS document_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL REFERENCES knowledge_documents(id),
                owner_id INTEGER NOT NULL,
                kb_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_owner ON document_chunks(owner_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_kb ON document_chunks(kb_id);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        ),
        (
            4,
            r#"
            CREATE TABLE IF NOT EXISTS ai_conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL REFERENCES users(id),
                title TEXT,
                last_updated INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS ai_conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES ai_conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                tool_output TEXT,
                llm_type_used TEXT,
                llm_model_used TEXT,
                sent_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON ai_conversation_messages(conversation_id, sent_at);

            CREATE TABLE IF NOT EXISTS conversation_temp_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES ai_conversations(id),
                owner_id INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                blob_key TEXT NOT NULL,
                mime TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                status_message TEXT,
                extracted_text TEXT NOT NULL DEFAULT '',
                embedding TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_temp_files_conversation
                ON conversation_temp_files(conversation_id);
            "#,
        ),
        (
            5,
            r#"
            CREATE TABLE IF NOT EXISTS point_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                amount INTEGER NOT NULL,
                reason TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'EARN',
                related_entity_type TEXT,
                related_entity_id INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_points_user
                ON point_transactions(user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS achievements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                criteria_type TEXT NOT NULL,
                criteria_value INTEGER NOT NULL,
                reward_points INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS user_achievements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                achievement_id INTEGER NOT NULL REFERENCES achievements(id),
                earned_at TEXT NOT NULL DEFAULT (datetime('now')),
                is_notified INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, achievement_id)
            );
            "#,
        ),
        (
            6,
            r#"
            -- Activity surfaces owned by out-of-scope CRUD handlers.
            -- The achievement hook reads these counters inside the same
            -- transaction as the triggering write.
            CREATE TABLE IF NOT EXISTS forum_topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                title TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS user_counters (
                user_id INTEGER NOT NULL REFERENCES users(id),
                counter TEXT NOT NULL,
                value INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, counter)
            );
            "#,
        ),
    ]
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let mut stmt = conn.prepare("SELECT version FROM __schema_version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut applied = HashSet::new();
    for row in rows {
        applied.insert(row?);
    }

    for (version, sql) in migrations() {
        if applied.contains(&version) {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO __schema_version(version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        run_migrations(&conn)?;

        let applied: i64 =
            conn.query_row("SELECT COUNT(*) FROM __schema_version", [], |r| r.get(0))?;
        assert_eq!(applied as usize, migrations().len());
        Ok(())
    }

    #[test]
    fn unique_grant_constraint_exists() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;

        conn.execute(
            "INSERT INTO users(username) VALUES ('u1')",
            [],
        )?;
        conn.execute(
            "INSERT INTO achievements(name, criteria_type, criteria_value) VALUES ('first post', 'FORUM_POSTS_COUNT', 1)",
            [],
        )?;
        conn.execute(
            "INSERT INTO user_achievements(user_id, achievement_id) VALUES (1, 1)",
            [],
        )?;
        let dup = conn.execute(
            "INSERT INTO user_achievements(user_id, achievement_id) VALUES (1, 1)",
            [],
        );
        assert!(dup.is_err());
        Ok(())
    }
}
