mod repository;

#[cfg(test)]
pub use repository::MemoryAccountRepository;
pub use repository::{
    AccountRepository, Insertion, PgAccountRepository, RepositoryError,
};

use serde::Serialize;
use validator::{ValidateEmail, ValidationError, ValidationErrors};
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, PasswordManager};

/// Maximum `name` length, in bytes.
pub const NAME_MAX_LENGTH: usize = 500;
/// Minimum password length, in bytes.
pub const PASSWORD_MIN_LENGTH: usize = 8;
/// Maximum password length, in bytes.
pub const PASSWORD_MAX_LENGTH: usize = 72;

/// Credential under construction.
///
/// Holds the plaintext only until validation is over; the PHC string is the
/// sole persisted part.
#[derive(Clone, Default)]
pub struct Password {
    plaintext: Option<Zeroizing<String>>,
    hash: Option<String>,
}

impl Password {
    /// Derive a [`Password`] from its plaintext.
    pub fn derive(
        pwd: &PasswordManager,
        plaintext: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        let plaintext = Zeroizing::new(plaintext.into());
        let hash = pwd.hash_password(plaintext.as_bytes())?;

        Ok(Self {
            plaintext: Some(plaintext),
            hash: Some(hash),
        })
    }

    /// Wrap an already stored PHC string.
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self {
            plaintext: None,
            hash: Some(hash.into()),
        }
    }

    /// Check a candidate plaintext against the stored hash.
    ///
    /// An account without hash never matches.
    pub fn matches(
        &self,
        pwd: &PasswordManager,
        candidate: impl AsRef<[u8]>,
    ) -> Result<bool, CryptoError> {
        match &self.hash {
            Some(hash) => pwd.verify_password(hash, candidate),
            None => Ok(false),
        }
    }

    /// Drop the plaintext. Only the hash remains afterward.
    pub fn forget_plaintext(&mut self) {
        self.plaintext = None;
    }

    pub fn plaintext(&self) -> Option<&str> {
        self.plaintext.as_deref().map(String::as_str)
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Password")
            .field("plaintext", &self.plaintext.as_ref().map(|_| "[REDACTED]"))
            .field("hash", &self.hash.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Account as saved on database.
#[derive(Clone, Debug, Default)]
pub struct Account {
    pub id: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub name: String,
    pub email: String,
    pub password: Password,
    pub activated: bool,
    pub version: i32,
}

/// Internal contract broken by the caller, not by user input.
#[derive(Debug, thiserror::Error)]
#[error("invariant violated: {0}")]
pub struct InvariantViolation(pub &'static str);

impl Account {
    /// Create a not-yet-persisted, non-activated account.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            activated: false,
            ..Default::default()
        }
    }

    /// Check every field, collecting all violations.
    ///
    /// The outer `Err` is reserved for a missing password hash.
    pub fn validate(
        &self,
    ) -> Result<Result<(), ValidationErrors>, InvariantViolation> {
        let mut errors = ValidationErrors::new();

        if self.name.is_empty() {
            errors.add("name", error("required", "must be provided"));
        }
        if self.name.len() > NAME_MAX_LENGTH {
            errors.add(
                "name",
                error("length", "must not be more than 500 bytes long"),
            );
        }

        validate_email(&mut errors, &self.email);

        if let Some(plaintext) = self.password.plaintext() {
            validate_password_plaintext(&mut errors, plaintext);
        }

        if self.password.hash().is_none() {
            tracing::error!(email = %self.email, "account has no password hash");
            #[cfg(not(test))]
            debug_assert!(false, "account validated before password derivation");
            return Err(InvariantViolation("missing password hash for account"));
        }

        if errors.is_empty() {
            Ok(Ok(()))
        } else {
            Ok(Err(errors))
        }
    }

    /// Externally visible form of the account, without credentials.
    pub fn public(&self) -> PublicAccount {
        PublicAccount {
            id: self.id,
            created_at: self.created_at,
            name: self.name.clone(),
            email: self.email.clone(),
            activated: self.activated,
            version: self.version,
        }
    }
}

/// Account representation returned to clients.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct PublicAccount {
    pub id: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub name: String,
    pub email: String,
    pub activated: bool,
    pub version: i32,
}

fn error(code: &'static str, message: &'static str) -> ValidationError {
    ValidationError::new(code).with_message(message.into())
}

/// Check `email` is present and formatted.
pub fn validate_email(errors: &mut ValidationErrors, email: &str) {
    if email.is_empty() {
        errors.add("email", error("required", "must be provided"));
    }
    if !email.validate_email() {
        errors.add("email", error("email", "must be a valid email address"));
    }
}

/// Check plaintext password length bounds.
pub fn validate_password_plaintext(errors: &mut ValidationErrors, password: &str) {
    if password.is_empty() {
        errors.add("password", error("required", "must be provided"));
    }
    if password.len() < PASSWORD_MIN_LENGTH {
        errors.add(
            "password",
            error("length", "must be at least 8 bytes long"),
        );
    }
    if password.len() > PASSWORD_MAX_LENGTH {
        errors.add(
            "password",
            error("length", "must not be more than 72 bytes long"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_manager;

    fn candidate(name: &str, email: &str, password: &str) -> Account {
        let mut account = Account::new(name, email);
        account.password = Password::derive(&test_manager(), password).unwrap();
        account
    }

    fn fields(account: &Account) -> Vec<String> {
        match account.validate().unwrap() {
            Ok(()) => Vec::new(),
            Err(errors) => {
                let mut fields: Vec<String> = errors
                    .field_errors()
                    .keys()
                    .map(|f| f.to_string())
                    .collect();
                fields.sort();
                fields
            },
        }
    }

    #[test]
    fn test_valid_account() {
        let account = candidate("Ann", "ann@example.com", &"a".repeat(8));
        assert!(fields(&account).is_empty());

        let account = candidate("Ann", "ann@example.com", &"a".repeat(72));
        assert!(fields(&account).is_empty());

        let account = candidate(&"n".repeat(500), "ann@example.com", "longenough1");
        assert!(fields(&account).is_empty());
    }

    #[test]
    fn test_rejected_fields() {
        assert_eq!(fields(&candidate("", "ann@example.com", "longenough1")), ["name"]);
        assert_eq!(
            fields(&candidate(&"n".repeat(501), "ann@example.com", "longenough1")),
            ["name"]
        );
        assert_eq!(fields(&candidate("Ann", "ann.example.com", "longenough1")), ["email"]);
        assert_eq!(fields(&candidate("Ann", "", "longenough1")), ["email"]);
        assert_eq!(fields(&candidate("Ann", "ann@example.com", &"a".repeat(7))), ["password"]);
        assert_eq!(fields(&candidate("Ann", "ann@example.com", &"a".repeat(73))), ["password"]);
    }

    #[test]
    fn test_violations_accumulate() {
        let account = candidate("", "nope", "short");
        assert_eq!(fields(&account), ["email", "name", "password"]);

        // empty email is both missing and malformed.
        let account = candidate("Ann", "", "longenough1");
        let errors = account.validate().unwrap().unwrap_err();
        assert_eq!(errors.field_errors()["email"].len(), 2);
    }

    #[test]
    fn test_plaintext_is_optional() {
        let mut account = candidate("Ann", "ann@example.com", "short");
        account.password.forget_plaintext();

        assert!(account.password.plaintext().is_none());
        assert!(fields(&account).is_empty());
    }

    #[test]
    fn test_missing_hash_is_an_invariant_violation() {
        // even an otherwise invalid account reports the invariant first.
        let account = Account::new("", "nope");
        let err = account.validate().unwrap_err();
        assert_eq!(err.to_string(), "invariant violated: missing password hash for account");
    }

    #[test]
    fn test_password_matches() {
        let pwd = test_manager();
        let password = Password::derive(&pwd, "longenough1").unwrap();

        assert!(password.matches(&pwd, "longenough1").unwrap());
        assert!(!password.matches(&pwd, "longenough2").unwrap());
        assert!(!Password::default().matches(&pwd, "longenough1").unwrap());

        let stored = Password::from_hash(password.hash().unwrap());
        assert!(stored.matches(&pwd, "longenough1").unwrap());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let account = candidate("Ann", "ann@example.com", "longenough1");
        let debug = format!("{account:?}");

        assert!(!debug.contains("longenough1"));
        assert!(!debug.contains("argon2"));
    }

    #[test]
    fn test_public_view_has_no_credentials() {
        let account = candidate("Ann", "ann@example.com", "longenough1");
        let json = serde_json::to_value(account.public()).unwrap();

        assert!(json.get("password").is_none());
        assert_eq!(json["activated"], false);
        assert_eq!(json["email"], "ann@example.com");
    }
}
