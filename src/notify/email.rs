//! SMTP notification channel.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

use super::{Channel, Notice};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

pub struct EmailNotifier {
    config: EmailConfig,
    // SMTP auth/send is serialized; transports are built lazily per send.
    send_lock: Mutex<()>,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            send_lock: Mutex::new(()),
        }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
            .map_err(|e| Error::upstream(format!("smtp relay setup failed: {e}")))?;
        if self.config.port != 0 {
            builder = builder.port(self.config.port);
        }
        Ok(builder
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ))
            .build())
    }
}

#[async_trait::async_trait]
impl Channel for EmailNotifier {
    async fn send(&self, notice: Notice) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        let message = Message::builder()
            .from(
                self.config
                    .from
                    .parse()
                    .map_err(|_| Error::bad_request("invalid email sender address"))?,
            )
            .to(self
                .config
                .to
                .parse()
                .map_err(|_| Error::bad_request("invalid email recipient address"))?)
            .subject(&notice.title)
            .header(ContentType::TEXT_HTML)
            .body(format!(
                "<html><body><h3>{}</h3><pre>{}</pre></body></html>",
                notice.title, notice.body
            ))
            .map_err(|e| Error::Internal(anyhow::anyhow!("build email: {e}")))?;

        self.transport()?
            .send(message)
            .await
            .map_err(|e| Error::upstream(format!("send email failed: {e}")))?;
        Ok(())
    }
}
