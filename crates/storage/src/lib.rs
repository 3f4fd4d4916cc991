use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{
        participant_pair_key, JobId, MessageId, MessageKind, ProposalId, ProposalKind,
        ProposalStatus, RoomId, UserId,
    },
    protocol::{
        BudgetPayload, ChatMessage, MessageSummary, NewMessage, NewProposal, Proposal,
        ProposalWithMessage, Room,
    },
};

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, content, kind, created_at, read_at, \
     attachment_url, budget_proposal_id, budget_amount_min, budget_amount_max, budget_currency, \
     sender_name, job_context";

const PROPOSAL_COLUMNS: &str = "id, room_id, job_id, proposer_id, recipient_id, kind, \
     amount_min, amount_max, currency, notes, status, created_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every in-memory connection is its own database
        let max_connections = if sqlite_path(database_url).is_none() { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns the single job-less room for the unordered pair, creating it on first contact.
    pub async fn get_or_create_general_room(&self, a: &UserId, b: &UserId) -> Result<Room> {
        if a.is_blank() || b.is_blank() {
            return Err(anyhow!("participants must not be blank"));
        }
        if a == b {
            return Err(anyhow!("a general room needs two distinct participants"));
        }

        let pair_key = participant_pair_key(a, b);
        if let Some(room) = self.general_room_by_pair(&pair_key).await? {
            return Ok(room);
        }

        match self.create_room(a, b, None).await {
            Ok(room) => Ok(room),
            Err(err) if is_unique_violation(&err) => self
                .general_room_by_pair(&pair_key)
                .await?
                .ok_or_else(|| anyhow!("general room for {pair_key} vanished after conflict")),
            Err(err) => Err(err),
        }
    }

    pub async fn create_room(&self, a: &UserId, b: &UserId, job_id: Option<&JobId>) -> Result<Room> {
        let room_id = RoomId::new(uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO rooms (id, participant_a, participant_b, pair_key, job_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(room_id.as_str())
        .bind(a.as_str())
        .bind(b.as_str())
        .bind(participant_pair_key(a, b))
        .bind(job_id.map(JobId::as_str))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Room {
            id: room_id,
            participant_a: a.clone(),
            participant_b: b.clone(),
            job_id: job_id.cloned(),
            created_at: now,
            updated_at: now,
            latest_message: None,
        })
    }

    async fn general_room_by_pair(&self, pair_key: &str) -> Result<Option<Room>> {
        let row = sqlx::query(
            "SELECT id, participant_a, participant_b, job_id, created_at, updated_at
             FROM rooms WHERE pair_key = ? AND job_id IS NULL",
        )
        .bind(pair_key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.room_with_summary(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn room(&self, room_id: &RoomId) -> Result<Option<Room>> {
        let row = sqlx::query(
            "SELECT id, participant_a, participant_b, job_id, created_at, updated_at
             FROM rooms WHERE id = ?",
        )
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.room_with_summary(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_rooms_for_user(&self, user_id: &UserId) -> Result<Vec<Room>> {
        let rows = sqlx::query(
            "SELECT id, participant_a, participant_b, job_id, created_at, updated_at
             FROM rooms
             WHERE participant_a = ? OR participant_b = ?
             ORDER BY updated_at DESC",
        )
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut rooms = Vec::with_capacity(rows.len());
        for row in &rows {
            rooms.push(self.room_with_summary(row).await?);
        }
        Ok(rooms)
    }

    async fn room_with_summary(&self, row: &SqliteRow) -> Result<Room> {
        let mut room = room_from_row(row)?;
        room.latest_message = self.latest_message(&room.id).await?;
        Ok(room)
    }

    pub async fn latest_message(&self, room_id: &RoomId) -> Result<Option<MessageSummary>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_id = ?
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1"
        ))
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| message_from_row(&row).map(|message| MessageSummary::from_message(&message)))
            .transpose()
    }

    pub async fn insert_message(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        new_message: &NewMessage,
    ) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: MessageId::new(uuid::Uuid::new_v4().to_string()),
            room_id: room_id.clone(),
            sender_id: sender_id.clone(),
            content: new_message.content.clone(),
            kind: new_message.kind,
            created_at: Utc::now(),
            read_at: None,
            attachment_url: new_message.attachment_url.clone(),
            budget: None,
            sender_name: new_message.sender_name.clone(),
            job_context: new_message.job_context.clone(),
        };

        let mut tx = self.pool.begin().await?;
        insert_message_row(&mut tx, &message).await?;
        touch_room(&mut tx, room_id, message.created_at).await?;
        tx.commit().await?;
        Ok(message)
    }

    pub async fn message(&self, message_id: &MessageId) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| message_from_row(&row)).transpose()
    }

    pub async fn list_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_id = ?
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Stamps `read_at` on every message in the room not sent by `reader` and returns the updated rows.
    pub async fn mark_read(&self, room_id: &RoomId, reader: &UserId) -> Result<Vec<ChatMessage>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM messages WHERE room_id = ? AND sender_id != ? AND read_at IS NULL",
        )
        .bind(room_id.as_str())
        .bind(reader.as_str())
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE messages SET read_at = ? WHERE room_id = ? AND sender_id != ? AND read_at IS NULL",
        )
        .bind(now)
        .bind(room_id.as_str())
        .bind(reader.as_str())
        .execute(&mut *tx)
        .await?;

        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
                .bind(&id)
                .fetch_one(&mut *tx)
                .await?;
            updated.push(message_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Inserts the proposal and the budget message announcing it in one transaction.
    pub async fn insert_proposal_with_message(
        &self,
        room_id: &RoomId,
        proposer_id: &UserId,
        new_proposal: &NewProposal,
    ) -> Result<ProposalWithMessage> {
        if new_proposal.amount_min > new_proposal.amount_max {
            return Err(anyhow!(
                "amount_min {} exceeds amount_max {}",
                new_proposal.amount_min,
                new_proposal.amount_max
            ));
        }

        let now = Utc::now();
        let proposal = Proposal {
            id: ProposalId::new(uuid::Uuid::new_v4().to_string()),
            room_id: room_id.clone(),
            job_id: new_proposal.job_id.clone(),
            proposer_id: proposer_id.clone(),
            recipient_id: new_proposal.recipient_id.clone(),
            kind: new_proposal.kind,
            amount_min: new_proposal.amount_min,
            amount_max: new_proposal.amount_max,
            currency: new_proposal.currency.clone(),
            notes: new_proposal.notes.clone(),
            status: ProposalStatus::Pending,
            created_at: now,
        };
        let message = ChatMessage {
            id: MessageId::new(uuid::Uuid::new_v4().to_string()),
            room_id: room_id.clone(),
            sender_id: proposer_id.clone(),
            content: new_proposal.notes.clone().unwrap_or_default(),
            kind: MessageKind::BudgetProposal,
            created_at: now,
            read_at: None,
            attachment_url: None,
            budget: Some(BudgetPayload {
                proposal_id: proposal.id.clone(),
                amount_min: proposal.amount_min,
                amount_max: proposal.amount_max,
                currency: proposal.currency.clone(),
            }),
            sender_name: new_proposal.sender_name.clone(),
            job_context: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO proposals ({PROPOSAL_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(proposal.id.as_str())
        .bind(proposal.room_id.as_str())
        .bind(proposal.job_id.as_ref().map(JobId::as_str))
        .bind(proposal.proposer_id.as_str())
        .bind(proposal.recipient_id.as_str())
        .bind(proposal.kind.as_str())
        .bind(proposal.amount_min)
        .bind(proposal.amount_max)
        .bind(&proposal.currency)
        .bind(proposal.notes.as_deref())
        .bind(proposal.status.as_str())
        .bind(proposal.created_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert proposal")?;
        insert_message_row(&mut tx, &message).await?;
        touch_room(&mut tx, room_id, now).await?;
        tx.commit().await?;

        Ok(ProposalWithMessage { proposal, message })
    }

    pub async fn proposal(&self, proposal_id: &ProposalId) -> Result<Option<Proposal>> {
        let row = sqlx::query(&format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = ?"))
            .bind(proposal_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| proposal_from_row(&row)).transpose()
    }

    pub async fn list_proposals(&self, room_id: &RoomId) -> Result<Vec<Proposal>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals
             WHERE room_id = ?
             ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(proposal_from_row).collect()
    }

    pub async fn update_proposal_status(
        &self,
        proposal_id: &ProposalId,
        status: ProposalStatus,
    ) -> Result<Option<Proposal>> {
        let result = sqlx::query("UPDATE proposals SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(proposal_id.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.proposal(proposal_id).await
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO objects (bucket, path, content_type, bytes, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(bucket, path) DO UPDATE SET
                content_type = excluded.content_type,
                bytes = excluded.bytes,
                created_at = excluded.created_at",
        )
        .bind(bucket)
        .bind(path)
        .bind(content_type)
        .bind(bytes)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store object {bucket}/{path}"))?;
        Ok(())
    }

    pub async fn get_object(&self, bucket: &str, path: &str) -> Result<Option<StoredObject>> {
        let row = sqlx::query(
            "SELECT bucket, path, content_type, bytes, created_at FROM objects WHERE bucket = ? AND path = ?",
        )
        .bind(bucket)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<StoredObject> {
            Ok(StoredObject {
                bucket: row.try_get("bucket")?,
                path: row.try_get("path")?,
                content_type: row.try_get("content_type")?,
                bytes: row.try_get("bytes")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    pub async fn delete_object(&self, bucket: &str, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE bucket = ? AND path = ?")
            .bind(bucket)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

async fn insert_message_row(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    message: &ChatMessage,
) -> Result<()> {
    let budget = message.budget.as_ref();
    sqlx::query(&format!(
        "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(message.id.as_str())
    .bind(message.room_id.as_str())
    .bind(message.sender_id.as_str())
    .bind(&message.content)
    .bind(message.kind.as_str())
    .bind(message.created_at)
    .bind(message.read_at)
    .bind(message.attachment_url.as_deref())
    .bind(budget.map(|b| b.proposal_id.as_str()))
    .bind(budget.map(|b| b.amount_min))
    .bind(budget.map(|b| b.amount_max))
    .bind(budget.map(|b| b.currency.as_str()))
    .bind(message.sender_name.as_deref())
    .bind(message.job_context.as_deref())
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to insert message {}", message.id))?;
    Ok(())
}

async fn touch_room(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    room_id: &RoomId,
    at: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query("UPDATE rooms SET updated_at = ? WHERE id = ?")
        .bind(at)
        .bind(room_id.as_str())
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(anyhow!("room {room_id} does not exist"));
    }
    Ok(())
}

fn room_from_row(row: &SqliteRow) -> Result<Room> {
    Ok(Room {
        id: RoomId::new(row.try_get::<String, _>("id")?),
        participant_a: UserId::new(row.try_get::<String, _>("participant_a")?),
        participant_b: UserId::new(row.try_get::<String, _>("participant_b")?),
        job_id: row.try_get::<Option<String>, _>("job_id")?.map(JobId::new),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        latest_message: None,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let kind_text: String = row.try_get("kind")?;
    let kind = MessageKind::parse(&kind_text)
        .ok_or_else(|| anyhow!("unknown message kind {kind_text:?}"))?;

    let budget = match row.try_get::<Option<String>, _>("budget_proposal_id")? {
        Some(proposal_id) => Some(BudgetPayload {
            proposal_id: ProposalId::new(proposal_id),
            amount_min: row
                .try_get::<Option<f64>, _>("budget_amount_min")?
                .unwrap_or_default(),
            amount_max: row
                .try_get::<Option<f64>, _>("budget_amount_max")?
                .unwrap_or_default(),
            currency: row
                .try_get::<Option<String>, _>("budget_currency")?
                .unwrap_or_else(|| "PEN".to_string()),
        }),
        None => None,
    };

    Ok(ChatMessage {
        id: MessageId::new(row.try_get::<String, _>("id")?),
        room_id: RoomId::new(row.try_get::<String, _>("room_id")?),
        sender_id: UserId::new(row.try_get::<String, _>("sender_id")?),
        content: row.try_get("content")?,
        kind,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
        attachment_url: row.try_get("attachment_url")?,
        budget,
        sender_name: row.try_get("sender_name")?,
        job_context: row.try_get("job_context")?,
    })
}

fn proposal_from_row(row: &SqliteRow) -> Result<Proposal> {
    let kind_text: String = row.try_get("kind")?;
    let status_text: String = row.try_get("status")?;
    Ok(Proposal {
        id: ProposalId::new(row.try_get::<String, _>("id")?),
        room_id: RoomId::new(row.try_get::<String, _>("room_id")?),
        job_id: row.try_get::<Option<String>, _>("job_id")?.map(JobId::new),
        proposer_id: UserId::new(row.try_get::<String, _>("proposer_id")?),
        recipient_id: UserId::new(row.try_get::<String, _>("recipient_id")?),
        kind: ProposalKind::parse(&kind_text)
            .ok_or_else(|| anyhow!("unknown proposal kind {kind_text:?}"))?,
        amount_min: row.try_get("amount_min")?,
        amount_max: row.try_get("amount_max")?,
        currency: row.try_get("currency")?,
        notes: row.try_get("notes")?,
        status: ProposalStatus::parse(&status_text)
            .ok_or_else(|| anyhow!("unknown proposal status {status_text:?}"))?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|err| err.as_database_error())
        .is_some_and(|db| db.is_unique_violation())
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:")
        || database_url.contains("mode=memory")
        || !database_url.starts_with("sqlite:")
    {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
