//! SQLite-backed message queue.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection};

use crate::error::{Error, Result};

use super::queue::{QueueRepository, QueuedMessage, TakeFromQueue};

/// Queue persisted in a single SQLite file. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteQueueRepository {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path).map_err(|e| Error::Storage(format!("sqlite open: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queued_messages (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                connection_id TEXT NOT NULL,
                recipient_key TEXT,
                payload BLOB NOT NULL,
                received_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_connection ON queued_messages(connection_id, received_at, seq);
            "#,
        )
        .map_err(|e| Error::Storage(format!("sqlite init: {}", e)))?;
        tracing::debug!("Opened queue database {}", path.display());

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::Storage("queue connection poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Other(format!("queue task failed: {}", e)))?
    }
}

impl std::fmt::Debug for SqliteQueueRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQueueRepository")
            .field("path", &self.path)
            .finish()
    }
}

/// Most ids bound in a single DELETE, well under SQLite's variable limit.
const DELETE_CHUNK: usize = 500;

const SELECT_SQL: &str = "SELECT id, connection_id, recipient_key, payload, received_at FROM queued_messages
     WHERE connection_id = ?1 AND (?2 IS NULL OR recipient_key = ?2)
     ORDER BY received_at, seq
     LIMIT ?3";

/// SQLite reads a negative LIMIT as no limit.
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX))
}

fn read_messages(
    conn: &Connection,
    connection_id: &str,
    recipient_key: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<QueuedMessage>> {
    let mut stmt = conn.prepare(SELECT_SQL)?;
    let rows = stmt.query_map(
        params![connection_id, recipient_key, sql_limit(limit)],
        |row| -> rusqlite::Result<QueuedMessage> {
            Ok(QueuedMessage {
                id: row.get(0)?,
                connection_id: row.get(1)?,
                recipient_key: row.get(2)?,
                encrypted_payload: row.get(3)?,
                received_at: row.get(4)?,
            })
        },
    )?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn delete_ids(conn: &Connection, connection_id: &str, ids: &[String]) -> Result<usize> {
    let mut removed = 0;
    for chunk in ids.chunks(DELETE_CHUNK) {
        let placeholders: Vec<String> = (0..chunk.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "DELETE FROM queued_messages WHERE connection_id = ?1 AND id IN ({})",
            placeholders.join(", ")
        );
        let values = std::iter::once(connection_id).chain(chunk.iter().map(String::as_str));
        removed += conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(removed)
}

#[async_trait]
impl QueueRepository for SqliteQueueRepository {
    async fn get_available_message_count(&self, connection_id: &str, recipient_key: Option<&str>) -> Result<usize> {
        let connection_id = connection_id.to_string();
        let recipient_key = recipient_key.map(str::to_string);
        self.with_conn(move |conn| {
            let count: i64 = match recipient_key {
                Some(key) => conn.query_row(
                    "SELECT COUNT(*) FROM queued_messages WHERE connection_id = ?1 AND recipient_key = ?2",
                    params![connection_id, key],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT COUNT(*) FROM queued_messages WHERE connection_id = ?1",
                    params![connection_id],
                    |row| row.get(0),
                )?,
            };
            Ok(count as usize)
        })
        .await
    }

    async fn take_from_queue(&self, options: TakeFromQueue) -> Result<Vec<QueuedMessage>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let messages = read_messages(
                &tx,
                &options.connection_id,
                options.recipient_key.as_deref(),
                options.limit,
            )?;
            if !options.keep_messages {
                let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
                delete_ids(&tx, &options.connection_id, &ids)?;
            }
            tx.commit()?;
            Ok(messages)
        })
        .await
    }

    async fn add_message(&self, connection_id: &str, recipient_key: Option<&str>, payload: Vec<u8>) -> Result<String> {
        let message = QueuedMessage::new(connection_id, recipient_key.map(str::to_string), payload);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queued_messages (id, seq, connection_id, recipient_key, payload, received_at)
                 VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM queued_messages), ?2, ?3, ?4, ?5)",
                params![
                    message.id,
                    message.connection_id,
                    message.recipient_key,
                    message.encrypted_payload,
                    message.received_at
                ],
            )?;
            Ok(message.id)
        })
        .await
    }

    async fn remove_messages(&self, connection_id: &str, message_ids: &[String]) -> Result<usize> {
        let connection_id = connection_id.to_string();
        let ids = message_ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = delete_ids(&tx, &connection_id, &ids)?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, SqliteQueueRepository) {
        let dir = TempDir::new().unwrap();
        let repo = SqliteQueueRepository::open(dir.path().join("queue.db")).unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn test_fifo_take_and_remove() {
        let (_dir, repo) = open();
        for i in 0..5u8 {
            repo.add_message("conn-1", None, vec![i]).await.unwrap();
        }
        repo.add_message("conn-2", None, vec![9]).await.unwrap();

        let taken = repo.take_from_queue(TakeFromQueue::new("conn-1").limit(3)).await.unwrap();
        let payloads: Vec<u8> = taken.iter().map(|m| m.encrypted_payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2]);

        let again = repo.take_from_queue(TakeFromQueue::new("conn-1").limit(3)).await.unwrap();
        assert_eq!(again, taken);

        let ids: Vec<String> = taken.iter().map(|m| m.id.clone()).collect();
        assert_eq!(repo.remove_messages("conn-1", &ids).await.unwrap(), 3);
        assert_eq!(repo.get_available_message_count("conn-1", None).await.unwrap(), 2);
        assert_eq!(repo.get_available_message_count("conn-2", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_ignores_other_connections() {
        let (_dir, repo) = open();
        let id = repo.add_message("conn-1", None, vec![1]).await.unwrap();
        assert_eq!(repo.remove_messages("conn-2", &[id]).await.unwrap(), 0);
        assert_eq!(repo.get_available_message_count("conn-1", None).await.unwrap(), 1);
        assert_eq!(repo.remove_messages("conn-1", &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_take_without_keep_and_recipient_key() {
        let (_dir, repo) = open();
        repo.add_message("conn-1", Some("key-a"), vec![1]).await.unwrap();
        repo.add_message("conn-1", Some("key-b"), vec![2]).await.unwrap();

        let taken = repo
            .take_from_queue(
                TakeFromQueue::new("conn-1")
                    .recipient_key(Some("key-a".to_string()))
                    .keep_messages(false),
            )
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].recipient_key.as_deref(), Some("key-a"));
        assert_eq!(repo.get_available_message_count("conn-1", None).await.unwrap(), 1);
        assert_eq!(repo.get_available_message_count("conn-1", Some("key-a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_take_with_huge_limit_returns_everything() {
        let (_dir, repo) = open();
        for i in 0..3u8 {
            repo.add_message("conn-1", None, vec![i]).await.unwrap();
        }

        let taken = repo
            .take_from_queue(TakeFromQueue::new("conn-1").limit(usize::MAX))
            .await
            .unwrap();
        assert_eq!(taken.len(), 3);
        assert_eq!(sql_limit(Some(usize::MAX)), i64::MAX);
        assert_eq!(sql_limit(None), -1);
    }

    #[tokio::test]
    async fn test_remove_long_id_list() {
        let (_dir, repo) = open();
        let mut ids = Vec::new();
        for i in 0..600u32 {
            ids.push(repo.add_message("conn-1", None, i.to_be_bytes().to_vec()).await.unwrap());
        }
        repo.add_message("conn-1", None, vec![0]).await.unwrap();
        // Well past the number of variables one statement may bind.
        ids.extend((0..40_000).map(|i| format!("unknown-{}", i)));

        assert_eq!(repo.remove_messages("conn-1", &ids).await.unwrap(), 600);
        assert_eq!(repo.get_available_message_count("conn-1", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let (dir, repo) = open();
        repo.add_message("conn-1", None, b"sealed".to_vec()).await.unwrap();
        drop(repo);

        let reopened = SqliteQueueRepository::open(dir.path().join("queue.db")).unwrap();
        let taken = reopened.take_from_queue(TakeFromQueue::new("conn-1")).await.unwrap();
        assert_eq!(taken[0].encrypted_payload, b"sealed".to_vec());
    }
}
