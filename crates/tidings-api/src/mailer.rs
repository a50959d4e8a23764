use serde_json::{Value, json};
use tracing::info;

use tidings_db::{Token, User};

/// An outgoing templated mail.
#[derive(Debug, Clone)]
pub struct Mail {
    pub to: String,
    pub template: &'static str,
    pub data: Value,
}

impl Mail {
    pub fn activation(user: &User, token: &Token) -> Self {
        Self {
            to: user.email.clone(),
            template: "user_welcome",
            data: json!({
                "userID": user.id,
                "name": user.name,
                "activationToken": token.plaintext,
                "expiry": token.expiry,
            }),
        }
    }

    /// `data` with secrets blanked, fit for logs.
    pub fn redacted(&self) -> Value {
        let mut data = self.data.clone();
        if let Some(token) = data.get_mut("activationToken") {
            *token = Value::from("[redacted]");
        }
        data
    }
}

/// Delivers mail. Called from the blocking pool, so implementations may block.
pub trait Mailer: Send + Sync {
    fn send(&self, mail: &Mail) -> anyhow::Result<()>;
}

/// Writes mail to the log instead of delivering it.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, mail: &Mail) -> anyhow::Result<()> {
        info!(to = %mail.to, template = mail.template, data = %mail.redacted(), "mail");
        Ok(())
    }
}
