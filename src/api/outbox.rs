//! Outbox drain for password-reset email.
//!
//! `request_password_reset` enqueues a `reset_password` row in `email_outbox`
//! inside the same transaction that stores the hashed token, so the email
//! exists if and only if the token does. A background task polls the table,
//! locks a batch with `FOR UPDATE SKIP LOCKED`, decodes each payload, and
//! hands it to the [`Mailer`].
//!
//! Delivery failures are retried with capped exponential backoff and jitter
//! until the attempt limit; rows that can never be delivered (unknown
//! template, undecodable payload) are marked `failed` immediately. The
//! default [`LogMailer`] logs the reset link instead of sending real mail.

use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub(crate) const RESET_PASSWORD_TEMPLATE: &str = "reset_password";

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Decoded payload of a `reset_password` outbox row.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct ResetPasswordEmail {
    pub email: String,
    pub reset_url: String,
}

impl ResetPasswordEmail {
    fn from_payload(payload_json: &str) -> Result<Self> {
        serde_json::from_str(payload_json).context("malformed reset_password payload")
    }
}

/// Delivery backend for outbox rows.
pub trait Mailer: Send + Sync {
    /// Deliver the reset link; an error schedules a retry.
    fn send_reset_password(&self, to_email: &str, message: &ResetPasswordEmail) -> Result<()>;
}

/// Local-dev mailer: the reset link goes to the log, nowhere else.
#[derive(Clone, Debug)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send_reset_password(&self, to_email: &str, message: &ResetPasswordEmail) -> Result<()> {
        info!(
            to_email = %to_email,
            reset_url = %message.reset_url,
            "password reset email (log only)"
        );
        Ok(())
    }
}

/// How a row left the delivery attempt.
enum Delivery {
    Sent,
    /// Transient failure, retry with backoff until the attempt limit.
    Retry(anyhow::Error),
    /// The row can never be delivered; no retry.
    Discard(anyhow::Error),
}

fn deliver(mailer: &dyn Mailer, to_email: &str, template: &str, payload_json: &str) -> Delivery {
    if template != RESET_PASSWORD_TEMPLATE {
        return Delivery::Discard(anyhow::anyhow!("unknown email template: {template}"));
    }
    let message = match ResetPasswordEmail::from_payload(payload_json) {
        Ok(message) => message,
        Err(err) => return Delivery::Discard(err),
    };
    match mailer.send_reset_password(to_email, &message) {
        Ok(()) => Delivery::Sent,
        Err(err) => Delivery::Retry(err),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OutboxWorkerConfig {
    poll_interval: Duration,
    batch_size: i64,
    max_attempts: u32,
}

impl OutboxWorkerConfig {
    /// Defaults: poll every 5s, 10 rows per batch, 5 delivery attempts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_secs(1));
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background task that drains the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    mailer: Arc<dyn Mailer>,
    config: OutboxWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = drain_batch(&pool, mailer.as_ref(), &config).await {
                error!("email outbox batch failed: {err}");
            }
            sleep(config.poll_interval).await;
        }
    })
}

/// Lock and process one batch of due rows. Returns how many rows were taken.
async fn drain_batch(
    pool: &PgPool,
    mailer: &dyn Mailer,
    config: &OutboxWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start email outbox transaction")?;

    // SKIP LOCKED lets several instances drain concurrently without
    // double-sending.
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(config.batch_size)
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load email outbox batch")?;

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let to_email: String = row.get("to_email");
        let template: String = row.get("template");
        let payload_json: String = row.get("payload_json");
        let attempts: i32 = row.get("attempts");
        let attempt = u32::try_from(attempts).unwrap_or(0).saturating_add(1);

        let delivery = deliver(mailer, &to_email, &template, &payload_json);
        settle_row(&mut tx, id, attempt, delivery, config.max_attempts).await?;
    }

    tx.commit()
        .await
        .context("failed to commit email outbox batch")?;

    Ok(row_count)
}

async fn settle_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempt: u32,
    delivery: Delivery,
    max_attempts: u32,
) -> Result<()> {
    let attempt_i32 = i32::try_from(attempt).unwrap_or(i32::MAX);
    match delivery {
        Delivery::Sent => {
            let query = r"
                UPDATE email_outbox
                SET status = 'sent', attempts = $2, last_error = NULL, sent_at = NOW()
                WHERE id = $1
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(id)
                .bind(attempt_i32)
                .execute(&mut **tx)
                .instrument(span)
                .await
                .context("failed to mark outbox row sent")?;
        }
        Delivery::Retry(err) if attempt < max_attempts => {
            let delay_ms = i64::try_from(backoff_delay(attempt).as_millis()).unwrap_or(i64::MAX);
            let query = r"
                UPDATE email_outbox
                SET attempts = $2, last_error = $3,
                    next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
                WHERE id = $1
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(id)
                .bind(attempt_i32)
                .bind(err.to_string())
                .bind(delay_ms)
                .execute(&mut **tx)
                .instrument(span)
                .await
                .context("failed to schedule outbox retry")?;
        }
        Delivery::Retry(err) | Delivery::Discard(err) => {
            let query = r"
                UPDATE email_outbox
                SET status = 'failed', attempts = $2, last_error = $3
                WHERE id = $1
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(id)
                .bind(attempt_i32)
                .bind(err.to_string())
                .execute(&mut **tx)
                .instrument(span)
                .await
                .context("failed to mark outbox row failed")?;
        }
    }
    Ok(())
}

/// Exponential backoff capped at [`BACKOFF_MAX`], with up to 25% jitter so
/// retries from parallel instances spread out.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE.saturating_mul(1u32 << exp).min(BACKOFF_MAX);
    let jitter_ms = base.as_millis() / 4;
    let jitter_ms = u64::try_from(jitter_ms).unwrap_or(0);
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingMailer {
        sent: Mutex<Vec<(String, ResetPasswordEmail)>>,
    }

    impl RecordingMailer {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl Mailer for RecordingMailer {
        fn send_reset_password(&self, to_email: &str, message: &ResetPasswordEmail) -> Result<()> {
            self.sent.lock().unwrap().push((
                to_email.to_string(),
                ResetPasswordEmail {
                    email: message.email.clone(),
                    reset_url: message.reset_url.clone(),
                },
            ));
            Ok(())
        }
    }

    #[test]
    fn reset_payload_decodes() {
        let payload = r#"{"email":"alice@example.com","reset_url":"https://warden.dev/reset-password#token=abc"}"#;
        let message = ResetPasswordEmail::from_payload(payload).unwrap();
        assert_eq!(message.email, "alice@example.com");
        assert!(message.reset_url.contains("#token="));

        assert!(ResetPasswordEmail::from_payload("{}").is_err());
        assert!(ResetPasswordEmail::from_payload("not json").is_err());
    }

    #[test]
    fn known_template_is_delivered() {
        let mailer = RecordingMailer::new();
        let payload = r#"{"email":"alice@example.com","reset_url":"https://warden.dev/r"}"#;
        assert!(matches!(
            deliver(&mailer, "alice@example.com", RESET_PASSWORD_TEMPLATE, payload),
            Delivery::Sent
        ));
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_template_is_discarded_not_retried() {
        let mailer = RecordingMailer::new();
        assert!(matches!(
            deliver(&mailer, "alice@example.com", "welcome", "{}"),
            Delivery::Discard(_)
        ));
        assert!(matches!(
            deliver(&mailer, "alice@example.com", RESET_PASSWORD_TEMPLATE, "not json"),
            Delivery::Discard(_)
        ));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let first = backoff_delay(1);
        assert!(first >= BACKOFF_BASE);
        assert!(first <= BACKOFF_BASE + BACKOFF_BASE / 4);

        // Far past the doubling range the cap plus jitter bounds the delay.
        let late = backoff_delay(30);
        assert!(late >= BACKOFF_MAX);
        assert!(late <= BACKOFF_MAX + BACKOFF_MAX / 4);
    }

    #[test]
    fn config_floors_are_enforced() {
        let config = OutboxWorkerConfig::new()
            .with_poll_interval(Duration::ZERO)
            .with_batch_size(0)
            .with_max_attempts(0);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_attempts, 1);
    }
}
