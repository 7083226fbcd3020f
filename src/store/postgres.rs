use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Row,
};

use super::{Assignment, CasOutcome, MessageStore, SessionStore, StatusChange};
use crate::error::StoreError;
use crate::types::{
    Attachment, ChatMessage, CustomerInfo, ProductSnapshot, Sender, Session, SessionStatus,
    StaffFilter,
};

const SESSION_COLUMNS: &str = "session_id, status, assigned_staff_id, assigned_staff_name, \
     customer_info, created_at, last_message_at, version";

const MESSAGE_COLUMNS: &str = "id, session_id, sender, staff_id, staff_name, product_data, \
     text, attachment, client_message_id, created_at, seq";

/// Postgres backend. Status transitions are single conditional `UPDATE`s, so
/// the database decides the winner of concurrent accepts.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Unavailable(format!("migration failed: {err}")))?;
        Ok(Self { pool })
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }
}

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    let status: String = row.try_get("status")?;
    let customer_info: Option<Json<CustomerInfo>> = row.try_get("customer_info")?;
    Ok(Session {
        session_id: row.try_get("session_id")?,
        status: status.parse::<SessionStatus>().map_err(StoreError::Corrupt)?,
        assigned_staff_id: row.try_get("assigned_staff_id")?,
        assigned_staff_name: row.try_get("assigned_staff_name")?,
        customer_info: customer_info.map(|Json(info)| info),
        created_at: row.try_get("created_at")?,
        last_message_at: row.try_get("last_message_at")?,
        version: row.try_get("version")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage, StoreError> {
    let sender_kind: String = row.try_get("sender")?;
    let sender = match sender_kind.as_str() {
        "user" => Sender::User,
        "bot" => Sender::Bot,
        "staff" => {
            let product_data: Option<Json<ProductSnapshot>> = row.try_get("product_data")?;
            Sender::Staff {
                staff_id: row
                    .try_get::<Option<String>, _>("staff_id")?
                    .unwrap_or_default(),
                staff_name: row
                    .try_get::<Option<String>, _>("staff_name")?
                    .unwrap_or_default(),
                product_data: product_data.map(|Json(p)| p),
            }
        }
        other => return Err(StoreError::Corrupt(format!("unknown sender '{other}'"))),
    };
    let attachment: Option<Json<Attachment>> = row.try_get("attachment")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        sender,
        text: row.try_get("text")?,
        attachment: attachment.map(|Json(a)| a),
        client_message_id: row.try_get("client_message_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn filter_clause(filter: StaffFilter) -> &'static str {
    match filter {
        StaffFilter::Waiting => "status = 'waiting_staff'",
        StaffFilter::Mine => "status = 'with_staff' AND assigned_staff_id = $1",
        StaffFilter::All => {
            "(status IN ('waiting_staff', 'resolved') \
              OR (status = 'with_staff' AND assigned_staff_id = $1))"
        }
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.fetch_session(session_id).await
    }

    async fn insert_if_absent(&self, session: Session) -> Result<(Session, bool), StoreError> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO chat_sessions ({SESSION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (session_id) DO NOTHING \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(&session.session_id)
        .bind(session.status.as_str())
        .bind(&session.assigned_staff_id)
        .bind(&session.assigned_staff_name)
        .bind(session.customer_info.clone().map(Json))
        .bind(session.created_at)
        .bind(session.last_message_at)
        .bind(session.version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((session_from_row(&row)?, true));
        }
        let existing = self
            .fetch_session(&session.session_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt("session vanished after conflict".to_string()))?;
        Ok((existing, false))
    }

    async fn compare_and_set(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        change: StatusChange,
    ) -> Result<CasOutcome, StoreError> {
        let (mode, staff_id, staff_name) = match &change.assignment {
            Assignment::Keep => ("keep", None, None),
            Assignment::Set {
                staff_id,
                staff_name,
            } => ("set", Some(staff_id.as_str()), Some(staff_name.as_str())),
            Assignment::Clear => ("clear", None, None),
        };
        let expected = expected
            .iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();

        let updated = sqlx::query(&format!(
            "UPDATE chat_sessions SET \
                status = $2, \
                assigned_staff_id = CASE $3::text WHEN 'set' THEN $4::text WHEN 'clear' THEN NULL ELSE assigned_staff_id END, \
                assigned_staff_name = CASE $3::text WHEN 'set' THEN $5::text WHEN 'clear' THEN NULL ELSE assigned_staff_name END, \
                version = version + 1 \
             WHERE session_id = $1 AND status = ANY($6) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(change.to.as_str())
        .bind(mode)
        .bind(staff_id)
        .bind(staff_name)
        .bind(&expected)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(CasOutcome::Applied(session_from_row(&row)?));
        }
        Ok(match self.fetch_session(session_id).await? {
            Some(current) => CasOutcome::Conflict(current),
            None => CasOutcome::Missing,
        })
    }

    async fn set_customer_info(
        &self,
        session_id: &str,
        info: CustomerInfo,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE chat_sessions SET customer_info = $2, version = version + 1 \
             WHERE session_id = $1 \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(Json(info))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn touch(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE chat_sessions \
             SET last_message_at = GREATEST(last_message_at, $2), version = version + 1 \
             WHERE session_id = $1 \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list(&self, filter: StaffFilter, staff_id: &str) -> Result<Vec<Session>, StoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE {} ORDER BY last_message_at DESC",
            filter_clause(filter)
        );
        let query = sqlx::query(&sql);
        let query = if filter == StaffFilter::Waiting {
            query
        } else {
            query.bind(staff_id)
        };
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(session_from_row).collect()
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let (staff_id, staff_name, product_data) = match &message.sender {
            Sender::Staff {
                staff_id,
                staff_name,
                product_data,
            } => (
                Some(staff_id.as_str()),
                Some(staff_name.as_str()),
                product_data.clone().map(Json),
            ),
            Sender::User | Sender::Bot => (None, None, None),
        };
        sqlx::query(
            "INSERT INTO chat_messages \
             (id, session_id, sender, staff_id, staff_name, product_data, text, attachment, client_message_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.sender.kind())
        .bind(staff_id)
        .bind(staff_name)
        .bind(product_data)
        .bind(&message.text)
        .bind(message.attachment.clone().map(Json))
        .bind(&message.client_message_id)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(message)
    }

    async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE session_id = $1 \
                ORDER BY created_at DESC, seq DESC LIMIT $2 \
             ) latest ORDER BY created_at ASC, seq ASC"
        ))
        .bind(session_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }
}
