//! Handle database requests.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::error::ErrorKind;

use crate::account::{Account, InvariantViolation, Password};

/// Unique constraint guarding `accounts.email`.
const EMAIL_CONSTRAINT: &str = "accounts_email_key";

pub type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("an account with this email address already exists")]
    Conflict,
    #[error("account not found")]
    NotFound,
    #[error("storage operation exceeded {0:?}")]
    Timeout(Duration),
    #[error("SQL request failed: {0}")]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Values assigned by the store on insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub version: i32,
}

impl Insertion {
    /// Copy assigned values onto `account`.
    pub fn apply(self, account: &mut Account) {
        account.id = self.id;
        account.created_at = self.created_at;
        account.version = self.version;
    }
}

/// Port for account persistence.
///
/// Each call is its own transaction; implementations are shared between
/// concurrent requests and background tasks.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Insert a new account, failing with [`RepositoryError::Conflict`] when
    /// the email is taken.
    async fn insert(&self, account: &Account) -> Result<Insertion>;

    /// Find an account using its `email`.
    async fn get_by_email(&self, email: &str) -> Result<Account>;
}

/// Account row as stored on database.
#[derive(Debug, sqlx::FromRow)]
struct AccountRecord {
    id: i64,
    created_at: DateTime<Utc>,
    name: String,
    email: String,
    password_hash: String,
    activated: bool,
    version: i32,
}

impl From<AccountRecord> for Account {
    fn from(record: AccountRecord) -> Self {
        Self {
            id: record.id,
            created_at: record.created_at,
            name: record.name,
            email: record.email,
            password: Password::from_hash(record.password_hash),
            activated: record.activated,
            version: record.version,
        }
    }
}

/// PostgreSQL account repository.
#[derive(Clone)]
pub struct PgAccountRepository {
    pool: PgPool,
    timeout: Duration,
}

impl PgAccountRepository {
    /// Create a new [`PgAccountRepository`].
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn bounded<T>(
        &self,
        query: impl Future<Output = std::result::Result<T, sqlx::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result.map_err(classify),
            Err(_) => {
                tracing::error!(timeout = ?self.timeout, "storage operation timed out");
                Err(RepositoryError::Timeout(self.timeout))
            },
        }
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn insert(&self, account: &Account) -> Result<Insertion> {
        let hash = account
            .password
            .hash()
            .ok_or(InvariantViolation("missing password hash for account"))?;

        let (id, created_at, version) = self
            .bounded(
                sqlx::query_as::<_, (i64, DateTime<Utc>, i32)>(
                    r#"INSERT INTO accounts (name, email, password_hash, activated)
                        VALUES ($1, $2, $3, $4)
                        RETURNING id, created_at, version"#,
                )
                .bind(&account.name)
                .bind(&account.email)
                .bind(hash)
                .bind(account.activated)
                .fetch_one(&self.pool),
            )
            .await?;

        Ok(Insertion {
            id,
            created_at,
            version,
        })
    }

    async fn get_by_email(&self, email: &str) -> Result<Account> {
        let record = self
            .bounded(
                sqlx::query_as::<_, AccountRecord>(
                    r#"SELECT id, created_at, name, email::TEXT AS email, password_hash, activated, version
                        FROM accounts
                        WHERE email = $1::CITEXT"#,
                )
                .bind(email)
                .fetch_optional(&self.pool),
            )
            .await?;

        record.map(Account::from).ok_or(RepositoryError::NotFound)
    }
}

/// Sort a backend error into a conflict or a storage failure.
fn classify(err: sqlx::Error) -> RepositoryError {
    if let Some(db_err) = err.as_database_error() {
        if is_email_conflict(db_err.kind(), db_err.constraint()) {
            return RepositoryError::Conflict;
        }
    }

    RepositoryError::Sql(err)
}

fn is_email_conflict(kind: ErrorKind, constraint: Option<&str>) -> bool {
    kind == ErrorKind::UniqueViolation && constraint == Some(EMAIL_CONSTRAINT)
}

/// In-memory store enforcing the same email uniqueness as PostgreSQL.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryAccountRepository {
    rows: std::sync::Mutex<Vec<Account>>,
}

#[cfg(test)]
impl MemoryAccountRepository {
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn insert(&self, account: &Account) -> Result<Insertion> {
        let hash = account
            .password
            .hash()
            .ok_or(InvariantViolation("missing password hash for account"))?;

        let mut rows = self.rows.lock().unwrap();
        if rows
            .iter()
            .any(|row| row.email.eq_ignore_ascii_case(&account.email))
        {
            return Err(RepositoryError::Conflict);
        }

        let insertion = Insertion {
            id: rows.len() as i64 + 1,
            created_at: Utc::now(),
            version: 1,
        };
        let mut row = Account {
            password: Password::from_hash(hash),
            ..account.clone()
        };
        insertion.apply(&mut row);
        rows.push(row);

        Ok(insertion)
    }

    async fn get_by_email(&self, email: &str) -> Result<Account> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_manager;

    fn account(email: &str) -> Account {
        let mut account = Account::new("Ann", email);
        account.password = Password::derive(&test_manager(), "longenough1").unwrap();
        account
    }

    #[test]
    fn test_conflict_classification() {
        assert!(is_email_conflict(ErrorKind::UniqueViolation, Some("accounts_email_key")));
        // another unique constraint is not an email conflict.
        assert!(!is_email_conflict(ErrorKind::UniqueViolation, Some("accounts_pkey")));
        assert!(!is_email_conflict(ErrorKind::ForeignKeyViolation, Some("accounts_email_key")));
        assert!(!is_email_conflict(ErrorKind::Other, None));
    }

    #[test]
    fn test_non_database_error_is_storage_failure() {
        assert!(matches!(
            classify(sqlx::Error::PoolTimedOut),
            RepositoryError::Sql(sqlx::Error::PoolTimedOut)
        ));
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            RepositoryError::Sql(_)
        ));
    }

    #[tokio::test]
    async fn test_memory_duplicate_email() {
        let repo = MemoryAccountRepository::default();
        let first = repo.insert(&account("ann@example.com")).await.unwrap();
        assert_eq!(first.version, 1);

        let second = repo.insert(&account("ANN@example.com")).await;
        assert!(matches!(second, Err(RepositoryError::Conflict)));
        assert_eq!(repo.len(), 1);

        let stored = repo.get_by_email("ann@example.com").await.unwrap();
        assert_eq!(stored.id, first.id);
        assert!(stored.password.plaintext().is_none());
    }

    #[tokio::test]
    async fn test_hashless_account_is_refused() {
        let repo = MemoryAccountRepository::default();

        let result = repo.insert(&Account::new("Ann", "ann@example.com")).await;
        assert!(matches!(result, Err(RepositoryError::Invariant(_))));
        assert_eq!(repo.len(), 0);
    }

    #[tokio::test]
    async fn test_memory_not_found() {
        let repo = MemoryAccountRepository::default();
        assert!(matches!(
            repo.get_by_email("nobody@example.com").await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[sqlx::test]
    async fn test_pg_insert_and_get(pool: PgPool) {
        let repo = PgAccountRepository::new(pool, Duration::from_secs(30));
        let account = account("ann@example.com");

        let insertion = repo.insert(&account).await.unwrap();
        assert_eq!(insertion.version, 1);
        assert!(insertion.id > 0);

        let stored = repo.get_by_email("Ann@Example.com").await.unwrap();
        assert_eq!(stored.id, insertion.id);
        assert_eq!(stored.created_at, insertion.created_at);
        assert_eq!(stored.email, "ann@example.com");
        assert!(!stored.activated);
        assert_eq!(stored.password.hash(), account.password.hash());
    }

    #[sqlx::test]
    async fn test_pg_duplicate_email(pool: PgPool) {
        let repo = PgAccountRepository::new(pool, Duration::from_secs(30));
        let first = repo.insert(&account("ann@example.com")).await.unwrap();

        let second = repo.insert(&account("ann@example.com")).await;
        assert!(matches!(second, Err(RepositoryError::Conflict)));

        let stored = repo.get_by_email("ann@example.com").await.unwrap();
        assert_eq!(stored.id, first.id);
    }

    #[sqlx::test]
    async fn test_pg_hashless_account_is_refused(pool: PgPool) {
        let repo = PgAccountRepository::new(pool, Duration::from_secs(30));

        let result = repo.insert(&Account::new("Ann", "ann@example.com")).await;
        assert!(matches!(result, Err(RepositoryError::Invariant(_))));
        assert!(matches!(
            repo.get_by_email("ann@example.com").await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[sqlx::test]
    async fn test_pg_not_found(pool: PgPool) {
        let repo = PgAccountRepository::new(pool, Duration::from_secs(30));
        assert!(matches!(
            repo.get_by_email("nobody@example.com").await,
            Err(RepositoryError::NotFound)
        ));
    }
}
