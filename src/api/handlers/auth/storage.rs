//! Database helpers for principals and recovery token state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::state::AuthConfig;
use super::utils::{build_reset_url, generate_recovery_token, hash_recovery_token, is_unique_violation};

/// Outcome when attempting to create a new principal.
#[derive(Debug)]
pub(super) enum SignupOutcome {
    Created,
    Conflict,
}

/// Outcome of a profile update.
#[derive(Debug)]
pub(super) enum ProfileOutcome {
    Updated,
    Conflict,
    NotFound,
}

/// Outcome of an atomic recovery-token consume.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum ResetOutcome {
    Done,
    AlreadyConsumed,
    Expired,
    Unknown,
}

/// One row of `users`, as the handlers see it.
#[derive(Debug, Clone)]
pub(super) struct UserRecord {
    pub(super) id: Uuid,
    pub(super) username: String,
    pub(super) email: String,
    pub(super) password_hash: String,
    pub(super) roles: Vec<String>,
    pub(super) account_enabled: bool,
    pub(super) account_locked: bool,
    pub(super) account_expired: bool,
    pub(super) credentials_expire_at: Option<DateTime<Utc>>,
    pub(super) twofa_enabled: bool,
    pub(super) twofa_secret: Option<String>,
    pub(super) twofa_pending_secret: Option<String>,
}

const USER_COLUMNS: &str = "id, username, email, password_hash, roles, \
     account_enabled, account_locked, account_expired, credentials_expire_at, \
     twofa_enabled, twofa_secret, twofa_pending_secret";

fn user_from_row(row: &PgRow) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        roles: row.get("roles"),
        account_enabled: row.get("account_enabled"),
        account_locked: row.get("account_locked"),
        account_expired: row.get("account_expired"),
        credentials_expire_at: row.get("credentials_expire_at"),
        twofa_enabled: row.get("twofa_enabled"),
        twofa_secret: row.get("twofa_secret"),
        twofa_pending_secret: row.get("twofa_pending_secret"),
    }
}

pub(super) async fn lookup_user_by_username(
    pool: &PgPool,
    username: &str,
) -> Result<Option<UserRecord>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = %query
    );
    let row = sqlx::query(&query)
        .bind(username)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by username")?;

    Ok(row.as_ref().map(user_from_row))
}

pub(super) async fn lookup_user_by_id(pool: &PgPool, id: Uuid) -> Result<Option<UserRecord>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = %query
    );
    let row = sqlx::query(&query)
        .bind(id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by id")?;

    Ok(row.as_ref().map(user_from_row))
}

pub(super) async fn insert_user(
    pool: &PgPool,
    username: &str,
    email: &str,
    password_hash: &str,
    roles: &[String],
) -> Result<SignupOutcome> {
    let query = r"
        INSERT INTO users (username, email, password_hash, roles)
        VALUES ($1, $2, $3, $4)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(roles)
        .execute(pool)
        .instrument(span)
        .await;

    match result {
        Ok(_) => Ok(SignupOutcome::Created),
        Err(err) if is_unique_violation(&err) => Ok(SignupOutcome::Conflict),
        Err(err) => Err(err).context("failed to insert user"),
    }
}

pub(super) async fn update_profile(
    pool: &PgPool,
    id: Uuid,
    username: Option<&str>,
    email: Option<&str>,
) -> Result<ProfileOutcome> {
    // COALESCE keeps unspecified fields; the unique indexes catch collisions.
    let query = r"
        UPDATE users
        SET username = COALESCE($2, username),
            email = COALESCE($3, email),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .bind(username)
        .bind(email)
        .execute(pool)
        .instrument(span)
        .await;

    match result {
        Ok(done) if done.rows_affected() == 0 => Ok(ProfileOutcome::NotFound),
        Ok(_) => Ok(ProfileOutcome::Updated),
        Err(err) if is_unique_violation(&err) => Ok(ProfileOutcome::Conflict),
        Err(err) => Err(err).context("failed to update profile"),
    }
}

/// Issue a recovery token for the account behind `email`, if it exists.
///
/// Always succeeds from the caller's point of view: an unknown email is a
/// silent no-op so the response cannot confirm account existence. A new
/// request invalidates any prior unconsumed tokens for the same account.
pub(super) async fn request_password_reset(
    pool: &PgPool,
    email: &str,
    config: &AuthConfig,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin password reset transaction")?;

    let query = "SELECT id, email FROM users WHERE email = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lookup user for password reset")?;

    let Some(row) = row else {
        tx.commit().await.context("commit empty reset transaction")?;
        return Ok(());
    };
    let user_id: Uuid = row.get("id");
    let to_email: String = row.get("email");

    let query = r"
        DELETE FROM password_reset_tokens
        WHERE user_id = $1 AND consumed_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to invalidate prior recovery tokens")?;

    // The raw token goes only into the email; the table holds its hash.
    let token = generate_recovery_token()?;
    let token_hash = hash_recovery_token(&token);

    let query = r"
        INSERT INTO password_reset_tokens (token_hash, user_id, expires_at)
        VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&token_hash)
        .bind(user_id)
        .bind(config.reset_token_ttl_seconds())
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert recovery token")?;

    let reset_url = build_reset_url(config.frontend_base_url(), &token);
    let payload_json = json!({
        "email": to_email,
        "reset_url": reset_url,
    });
    let payload_text =
        serde_json::to_string(&payload_json).context("failed to serialize email payload")?;

    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&to_email)
        .bind(crate::api::outbox::RESET_PASSWORD_TEMPLATE)
        .bind(payload_text)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;

    tx.commit().await.context("commit password reset transaction")?;

    Ok(())
}

/// Consume a recovery token and set the new password hash in one transaction.
///
/// The consume is a single conditional `UPDATE ... RETURNING`, so concurrent
/// requests with the same token race for one winner; losers get the
/// classified failure computed afterwards.
pub(super) async fn consume_reset_token(
    pool: &PgPool,
    token_hash: &[u8],
    new_password_hash: &str,
) -> Result<ResetOutcome> {
    let mut tx = pool.begin().await.context("begin reset consume transaction")?;

    let query = r"
        UPDATE password_reset_tokens
        SET consumed_at = NOW()
        WHERE token_hash = $1
          AND consumed_at IS NULL
          AND expires_at > NOW()
        RETURNING user_id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to consume recovery token")?;

    let Some(row) = row else {
        // Classify after the atomic attempt, never before.
        let outcome = classify_failed_consume(&mut tx, token_hash).await?;
        tx.commit().await.context("commit reset classification")?;
        return Ok(outcome);
    };
    let user_id: Uuid = row.get("user_id");

    let query = r"
        UPDATE users
        SET password_hash = $2, updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(new_password_hash)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to update password hash")?;

    tx.commit().await.context("commit reset consume transaction")?;

    Ok(ResetOutcome::Done)
}

async fn classify_failed_consume(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    token_hash: &[u8],
) -> Result<ResetOutcome> {
    let query = r"
        SELECT consumed_at, expires_at
        FROM password_reset_tokens
        WHERE token_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to classify recovery token")?;

    let Some(row) = row else {
        return Ok(ResetOutcome::Unknown);
    };
    let consumed_at: Option<DateTime<Utc>> = row.get("consumed_at");
    if consumed_at.is_some() {
        return Ok(ResetOutcome::AlreadyConsumed);
    }
    Ok(ResetOutcome::Expired)
}

/// Park a candidate secret until the principal proves possession of it.
pub(super) async fn store_pending_secret(
    pool: &PgPool,
    user_id: Uuid,
    secret_base32: &str,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET twofa_pending_secret = $2, updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(secret_base32)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to store pending TOTP secret")?;

    Ok(())
}

/// Promote the pending secret to active in one statement.
///
/// Returns `false` when no enrollment was pending.
pub(super) async fn confirm_pending_secret(pool: &PgPool, user_id: Uuid) -> Result<bool> {
    let query = r"
        UPDATE users
        SET twofa_enabled = TRUE,
            twofa_secret = twofa_pending_secret,
            twofa_pending_secret = NULL,
            updated_at = NOW()
        WHERE id = $1
          AND twofa_pending_secret IS NOT NULL
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to confirm TOTP enrollment")?;

    Ok(row.is_some())
}

/// Drop both the active and any pending secret.
pub(super) async fn disable_twofa(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE users
        SET twofa_enabled = FALSE,
            twofa_secret = NULL,
            twofa_pending_secret = NULL,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to disable second factor")?;

    Ok(())
}
