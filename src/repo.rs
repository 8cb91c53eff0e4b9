use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::models::{AttachmentView, MessageView, RosterEntry, RoomDescriptor, UserIdentity};

/// Everything the core persists lives in these tables. Schema management
/// proper is out of scope; this just makes a fresh database usable.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    sex INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS user_geo (
    user_id INTEGER PRIMARY KEY REFERENCES users(id),
    country_code TEXT,
    country TEXT,
    region TEXT,
    city TEXT
);
CREATE TABLE IF NOT EXISTS rooms (
    id INTEGER PRIMARY KEY,
    name TEXT,
    disabled INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS room_users (
    room_id INTEGER NOT NULL REFERENCES rooms(id),
    user_id INTEGER NOT NULL REFERENCES users(id),
    last_read_message_id INTEGER,
    volume INTEGER NOT NULL DEFAULT 2,
    notifications INTEGER NOT NULL DEFAULT 1,
    UNIQUE (room_id, user_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id INTEGER NOT NULL REFERENCES users(id),
    room_id INTEGER NOT NULL REFERENCES rooms(id),
    time INTEGER NOT NULL,
    content TEXT,
    symbol TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    edited_times INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    message_id INTEGER NOT NULL REFERENCES messages(id),
    img TEXT,
    preview TEXT,
    type TEXT NOT NULL DEFAULT 'i',
    UNIQUE (symbol, message_id)
);
"#;

type MessageRow = (i64, i64, i64, i64, Option<String>, Option<String>, bool, i64);

fn view((id, sender_id, room_id, time, content, symbol, deleted, edited): MessageRow) -> MessageView {
    MessageView {
        id,
        user_id: sender_id,
        room_id,
        time,
        content,
        symbol,
        deleted,
        edited,
        files: Default::default(),
    }
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// Facade over the relational collaborator. The core never writes anything
/// here except the last-read pointer.
#[derive(Clone)]
pub struct Repo {
    pool: SqlitePool,
}

impl Repo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> sqlx::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn user(&self, id: i64) -> sqlx::Result<Option<UserIdentity>> {
        let row: Option<(i64, String, i64)> =
            sqlx::query_as("SELECT id,username,sex FROM users WHERE id=?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, username, sex)| UserIdentity { id, username, sex }))
    }

    /// Non-disabled rooms the user belongs to, with membership settings.
    /// Member lists and message batches are filled in by the caller.
    pub async fn rooms_for_user(&self, user_id: i64) -> sqlx::Result<Vec<RoomDescriptor>> {
        let rows: Vec<(i64, Option<String>, bool, i64)> = sqlx::query_as(
            "SELECT r.id,r.name,ru.notifications,ru.volume \
             FROM rooms r JOIN room_users ru ON ru.room_id=r.id \
             WHERE ru.user_id=? AND r.disabled=0 ORDER BY r.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(room_id, name, notifications, volume)| RoomDescriptor {
                room_id,
                name,
                notifications,
                volume,
                users: Vec::new(),
                missed_messages: Vec::new(),
                history_messages: Vec::new(),
            })
            .collect())
    }

    /// (room_id, user_id) membership pairs for the given rooms.
    pub async fn room_members(&self, room_ids: &[i64]) -> sqlx::Result<Vec<(i64, i64)>> {
        if room_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT room_id,user_id FROM room_users WHERE room_id IN ({}) ORDER BY room_id,user_id",
            placeholders(room_ids.len())
        );
        let mut query = sqlx::query_as(&sql);
        for id in room_ids {
            query = query.bind(id);
        }
        query.fetch_all(&self.pool).await
    }

    /// All live messages in the user's rooms past that room's last-read
    /// pointer (NULL pointer means everything), ordered room then id.
    pub async fn unread_messages(&self, user_id: i64) -> sqlx::Result<Vec<MessageView>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT m.id,m.sender_id,m.room_id,m.time,m.content,m.symbol,m.deleted,m.edited_times \
             FROM messages m JOIN room_users ru ON ru.room_id=m.room_id \
             WHERE ru.user_id=? AND m.deleted=0 AND m.id > IFNULL(ru.last_read_message_id,0) \
             ORDER BY m.room_id,m.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(view).collect())
    }

    /// Attachment rows for the given messages: (message_id, symbol, img,
    /// preview, type).
    pub async fn attachments_for(
        &self,
        message_ids: &[i64],
    ) -> sqlx::Result<Vec<(i64, String, Option<String>, Option<String>, String)>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT message_id,symbol,img,preview,type FROM images WHERE message_id IN ({})",
            placeholders(message_ids.len())
        );
        let mut query = sqlx::query_as(&sql);
        for id in message_ids {
            query = query.bind(id);
        }
        query.fetch_all(&self.pool).await
    }

    pub async fn roster(&self, with_geo: bool) -> sqlx::Result<Vec<RosterEntry>> {
        if with_geo {
            let rows: Vec<(i64, String, i64, Option<String>, Option<String>, Option<String>, Option<String>)> =
                sqlx::query_as(
                    "SELECT u.id,u.username,u.sex,g.country_code,g.country,g.region,g.city \
                     FROM users u LEFT JOIN user_geo g ON g.user_id=u.id ORDER BY u.id",
                )
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .into_iter()
                .map(|(id, username, sex, country_code, country, region, city)| RosterEntry {
                    id,
                    username,
                    sex,
                    country_code,
                    country,
                    region,
                    city,
                })
                .collect())
        } else {
            let rows: Vec<(i64, String, i64)> =
                sqlx::query_as("SELECT id,username,sex FROM users ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows
                .into_iter()
                .map(|(id, username, sex)| RosterEntry {
                    id,
                    username,
                    sex,
                    country_code: None,
                    country: None,
                    region: None,
                    city: None,
                })
                .collect())
        }
    }

    pub async fn insert_message(
        &self,
        sender_id: i64,
        room_id: i64,
        content: &str,
        symbol: Option<&str>,
    ) -> sqlx::Result<MessageView> {
        let time = now_ms();
        let result = sqlx::query(
            "INSERT INTO messages (sender_id,room_id,time,content,symbol) VALUES (?,?,?,?,?)",
        )
        .bind(sender_id)
        .bind(room_id)
        .bind(time)
        .bind(content)
        .bind(symbol)
        .execute(&self.pool)
        .await?;
        Ok(MessageView {
            id: result.last_insert_rowid(),
            user_id: sender_id,
            room_id,
            time,
            content: Some(content.to_owned()),
            symbol: symbol.map(str::to_owned),
            deleted: false,
            edited: 0,
            files: Default::default(),
        })
    }

    /// Sender-only content update. Returns None when the message doesn't
    /// exist, belongs to someone else, or is already deleted.
    pub async fn edit_message(
        &self,
        id: i64,
        sender_id: i64,
        content: &str,
    ) -> sqlx::Result<Option<MessageView>> {
        let result = sqlx::query(
            "UPDATE messages SET content=?, edited_times=edited_times+1 \
             WHERE id=? AND sender_id=? AND deleted=0",
        )
        .bind(content)
        .bind(id)
        .bind(sender_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.message(id).await
    }

    /// Tombstone: the row stays, the content goes.
    pub async fn delete_message(
        &self,
        id: i64,
        sender_id: i64,
    ) -> sqlx::Result<Option<MessageView>> {
        let result = sqlx::query(
            "UPDATE messages SET deleted=1, content=NULL WHERE id=? AND sender_id=? AND deleted=0",
        )
        .bind(id)
        .bind(sender_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.message(id).await
    }

    pub async fn message(&self, id: i64) -> sqlx::Result<Option<MessageView>> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id,sender_id,room_id,time,content,symbol,deleted,edited_times \
             FROM messages WHERE id=?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(view))
    }

    /// Page of live messages older than `before` (newest page when None),
    /// returned ascending by id.
    pub async fn older_messages(
        &self,
        room_id: i64,
        before: Option<i64>,
        count: i64,
    ) -> sqlx::Result<Vec<MessageView>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,sender_id,room_id,time,content,symbol,deleted,edited_times \
             FROM messages WHERE room_id=? AND id<? AND deleted=0 \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(room_id)
        .bind(before.unwrap_or(i64::MAX))
        .bind(count)
        .fetch_all(&self.pool)
        .await?;
        let mut messages: Vec<MessageView> = rows.into_iter().map(view).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Move every membership's last-read pointer to the newest message in
    /// its room. Fire-and-forget single statement; no cross-row transaction.
    pub async fn update_last_read(&self, user_id: i64) -> sqlx::Result<u64> {
        let result = sqlx::query(
            "UPDATE room_users SET last_read_message_id = \
             (SELECT MAX(id) FROM messages WHERE messages.room_id = room_users.room_id) \
             WHERE user_id=?",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    async fn seeded() -> Repo {
        let pool = pool().await;
        seed_user(&pool, 1, "alice", 2).await;
        seed_user(&pool, 2, "bob", 1).await;
        seed_room(&pool, 5, Some("lobby"), false).await;
        seed_room(&pool, 6, None, false).await;
        seed_room(&pool, 7, Some("closed"), true).await;
        seed_membership(&pool, 5, 1, Some(100)).await;
        seed_membership(&pool, 5, 2, None).await;
        seed_membership(&pool, 6, 1, None).await;
        seed_membership(&pool, 7, 1, None).await;
        seed_message(&pool, 100, 2, 5, "old", None).await;
        seed_message(&pool, 101, 2, 5, "newer", None).await;
        seed_message(&pool, 102, 2, 5, "newest", None).await;
        Repo::new(pool)
    }

    #[tokio::test]
    async fn disabled_rooms_are_filtered_out() {
        let repo = seeded().await;
        let rooms = repo.rooms_for_user(1).await.unwrap();
        let ids: Vec<i64> = rooms.iter().map(|r| r.room_id).collect();
        assert_eq!(ids, vec![5, 6]);
        assert_eq!(rooms[0].name.as_deref(), Some("lobby"));
        // private room has no name
        assert_eq!(rooms[1].name, None);
    }

    #[tokio::test]
    async fn unread_respects_the_last_read_pointer() {
        let repo = seeded().await;
        let unread = repo.unread_messages(1).await.unwrap();
        let ids: Vec<i64> = unread.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![101, 102]);
        // a NULL pointer means everything is unread
        let unread = repo.unread_messages(2).await.unwrap();
        let ids: Vec<i64> = unread.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![100, 101, 102]);
    }

    #[tokio::test]
    async fn deleted_messages_never_come_back() {
        let repo = seeded().await;
        repo.delete_message(101, 2).await.unwrap().unwrap();
        let unread = repo.unread_messages(1).await.unwrap();
        let ids: Vec<i64> = unread.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![102]);
    }

    #[tokio::test]
    async fn edits_are_sender_only() {
        let repo = seeded().await;
        assert!(repo.edit_message(101, 1, "hijack").await.unwrap().is_none());
        let edited = repo.edit_message(101, 2, "fixed").await.unwrap().unwrap();
        assert_eq!(edited.content.as_deref(), Some("fixed"));
        assert_eq!(edited.edited, 1);
    }

    #[tokio::test]
    async fn delete_tombstones_the_row() {
        let repo = seeded().await;
        let deleted = repo.delete_message(101, 2).await.unwrap().unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.content, None);
        // double delete is not an update
        assert!(repo.delete_message(101, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn older_messages_page_backwards() {
        let repo = seeded().await;
        let page = repo.older_messages(5, Some(102), 10).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![100, 101]);
        let page = repo.older_messages(5, None, 2).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![101, 102]);
    }

    #[tokio::test]
    async fn update_last_read_moves_every_pointer() {
        let repo = seeded().await;
        let touched = repo.update_last_read(1).await.unwrap();
        // three memberships, including the disabled room
        assert_eq!(touched, 3);
        let unread = repo.unread_messages(1).await.unwrap();
        assert!(unread.is_empty());
    }

    #[tokio::test]
    async fn roster_gates_geo_behind_the_flag() {
        let repo = seeded().await;
        sqlx::query("INSERT INTO user_geo (user_id,country_code,country) VALUES (1,'de','Germany')")
            .execute(&repo.pool)
            .await
            .unwrap();
        let plain = repo.roster(false).await.unwrap();
        assert_eq!(plain.len(), 2);
        assert_eq!(plain[0].country, None);
        let geo = repo.roster(true).await.unwrap();
        assert_eq!(geo[0].country.as_deref(), Some("Germany"));
        assert_eq!(geo[1].country, None);
    }

    #[tokio::test]
    async fn inserted_messages_get_monotonic_ids() {
        let repo = seeded().await;
        let a = repo.insert_message(1, 5, "one", None).await.unwrap();
        let b = repo.insert_message(1, 5, "two", Some("a")).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(b.symbol.as_deref(), Some("a"));
    }
}
