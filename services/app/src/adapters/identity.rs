//! services/app/src/adapters/identity.rs
//!
//! The identity adapter, the concrete implementation of the `IdentityProvider`
//! port. Operator accounts live in the `users` table with argon2 password
//! hashes; each sign-in is recorded in `auth_sessions` for 30 days so that a
//! restarted station comes back signed in.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{FromRow, PgPool};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use triage_core::domain::User;
use triage_core::ports::{AuthStateStream, IdentityProvider, PortError, PortResult};
use uuid::Uuid;

const SIGN_IN_DAYS: i64 = 30;
const INVALID_CREDENTIALS: &str = "Invalid email or password";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An identity adapter that implements the `IdentityProvider` port.
pub struct PgIdentityAdapter {
    pool: PgPool,
    changes: broadcast::Sender<Option<User>>,
    /// The `auth_sessions` id of the current sign-in, if any.
    current: Arc<Mutex<Option<String>>>,
}

impl PgIdentityAdapter {
    /// Creates a new `PgIdentityAdapter`.
    pub fn new(pool: PgPool) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            pool,
            changes,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Provisions an operator account.
    pub async fn create_user(&self, email: &str, password: &str) -> PortResult<User> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(PortError::Unexpected(
                "Email and password are required".to_string(),
            ));
        }

        let salt = SaltString::generate(&mut OsRng);
        let hashed_password = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| PortError::Unexpected(format!("Failed to hash password: {}", e)))?
            .to_string();

        let record = sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (id, email, hashed_password) VALUES ($1, $2, $3) \
             RETURNING id, email, hashed_password",
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(&hashed_password)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PortError::Unexpected(format!("User {} already exists", email))
            }
            _ => PortError::Unexpected(e.to_string()),
        })?;
        Ok(record.to_domain())
    }

    fn remember(&self, auth_session_id: Option<String>) {
        if let Ok(mut current) = self.current.lock() {
            *current = auth_session_id;
        }
    }

    fn notify(&self, user: Option<User>) {
        // No receivers simply means nobody is subscribed yet.
        let _ = self.changes.send(user);
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Looks up the most recent sign-in that has not expired yet.
async fn restore_sign_in(pool: &PgPool) -> Result<Option<(String, User)>, sqlx::Error> {
    let record = sqlx::query_as::<_, RestoredRecord>(
        "SELECT s.id AS session_id, u.id, u.email FROM auth_sessions s \
         JOIN users u ON u.id = s.user_id \
         WHERE s.expires_at > NOW() ORDER BY s.created_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(record.map(|r| {
        (
            r.session_id,
            User {
                id: r.id,
                email: Some(r.email),
            },
        )
    }))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    id: Uuid,
    email: String,
    hashed_password: String,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            id: self.id,
            email: Some(self.email),
        }
    }
}

#[derive(FromRow)]
struct RestoredRecord {
    session_id: String,
    id: Uuid,
    email: String,
}

//=========================================================================================
// `IdentityProvider` Trait Implementation
//=========================================================================================

#[async_trait]
impl IdentityProvider for PgIdentityAdapter {
    fn auth_state_changes(&self) -> AuthStateStream {
        // Subscribe before restoring so no change can slip in between.
        let mut changes = self.changes.subscribe();
        let pool = self.pool.clone();
        let current = self.current.clone();

        Box::pin(async_stream::stream! {
            let restored = match restore_sign_in(&pool).await {
                Ok(Some((auth_session_id, user))) => {
                    info!("Restored sign-in of {}", user.email.as_deref().unwrap_or("unknown"));
                    if let Ok(mut current) = current.lock() {
                        *current = Some(auth_session_id);
                    }
                    Some(user)
                }
                Ok(None) => None,
                Err(e) => {
                    error!("Failed to restore sign-in: {:?}", e);
                    None
                }
            };
            yield restored;

            loop {
                match changes.recv().await {
                    Ok(user) => yield user,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Auth state subscriber lagged; skipped {} change(s).", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<User> {
        // 1. Get user by email
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT id, email, hashed_password FROM users WHERE email = $1",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?
        .ok_or_else(|| PortError::Unauthorized(INVALID_CREDENTIALS.to_string()))?;

        // 2. Verify password
        let parsed_hash = PasswordHash::new(&record.hashed_password).map_err(|e| {
            error!("Failed to parse password hash: {:?}", e);
            PortError::Unexpected("Authentication error".to_string())
        })?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_err()
        {
            return Err(PortError::Unauthorized(INVALID_CREDENTIALS.to_string()));
        }

        // 3. Record the sign-in
        let auth_session_id = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + Duration::days(SIGN_IN_DAYS);
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&auth_session_id)
            .bind(record.id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        // 4. Publish the change
        let user = record.to_domain();
        self.remember(Some(auth_session_id));
        self.notify(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> PortResult<()> {
        let auth_session_id = self.current.lock().ok().and_then(|mut c| c.take());
        if let Some(auth_session_id) = auth_session_id {
            sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
                .bind(&auth_session_id)
                .execute(&self.pool)
                .await
                .map_err(|e| PortError::Unexpected(e.to_string()))?;
        }
        self.notify(None);
        Ok(())
    }
}
