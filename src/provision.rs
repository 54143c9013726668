//! Account registration use case.

use std::sync::Arc;

use validator::{ValidationError, ValidationErrors};

use crate::account::{Account, AccountRepository, Password, PublicAccount, RepositoryError};
use crate::crypto::{CryptoError, PasswordManager};
use crate::error::{Result, ServerError};
use crate::mail::{Mailer, Template};
use crate::runner::TaskRunner;

const WELCOME_TASK: &str = "welcome_mail";

/// Registration request, already decoded.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Sequences derivation, validation, insertion and the welcome mail.
#[derive(Clone)]
pub struct Provisioner {
    repo: Arc<dyn AccountRepository>,
    pwd: Arc<PasswordManager>,
    mailer: Arc<dyn Mailer>,
    runner: TaskRunner,
}

impl Provisioner {
    /// Create a new [`Provisioner`].
    pub fn new(
        repo: Arc<dyn AccountRepository>,
        pwd: Arc<PasswordManager>,
        mailer: Arc<dyn Mailer>,
        runner: TaskRunner,
    ) -> Self {
        Self {
            repo,
            pwd,
            mailer,
            runner,
        }
    }

    /// Register a new, non-activated account.
    ///
    /// The welcome mail is only scheduled; its outcome never affects the
    /// result.
    pub async fn register(&self, request: Registration) -> Result<PublicAccount> {
        let Registration {
            name,
            email,
            password,
        } = request;
        let mut account = Account::new(name, email);

        let pwd = Arc::clone(&self.pwd);
        account.password =
            tokio::task::spawn_blocking(move || Password::derive(&pwd, password))
                .await
                .map_err(|err| CryptoError::Aborted(err.to_string()))??;

        account.validate()??;
        account.password.forget_plaintext();

        match self.repo.insert(&account).await {
            Ok(insertion) => insertion.apply(&mut account),
            Err(RepositoryError::Conflict) => {
                return Err(ServerError::Validation(duplicate_email()));
            },
            Err(err) => return Err(err.into()),
        }

        tracing::info!(account_id = account.id, "account created");
        metrics::counter!("accounts_created_total").increment(1);

        let public = account.public();
        let mailer = Arc::clone(&self.mailer);
        let data = serde_json::json!({
            "id": public.id,
            "name": public.name,
        });
        let to = public.email.clone();
        self.runner.run(WELCOME_TASK, async move {
            mailer.send(&to, Template::Welcome, data).await
        });

        Ok(public)
    }

    /// Find an account using its email.
    pub async fn find_by_email(&self, email: &str) -> Result<Account> {
        Ok(self.repo.get_by_email(email).await?)
    }
}

fn duplicate_email() -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    errors.add(
        "email",
        ValidationError::new("conflict")
            .with_message("a user with this email address already exists".into()),
    );
    errors
}
