//! Send emails to accounts for important updates.
//!
//! Rendering and delivery belong to the mail service; we only publish a
//! CloudEvent describing which template to send to whom.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo,
};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use url::Url;

use crate::config::Mail;

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const ID_LENGTH: usize = 12;

pub type Result<T> = std::result::Result<T, MailError>;

/// Transport failure.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("unsupported AMQP scheme `{0}`")]
    InvalidScheme(String),
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Mail templates list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Greet a freshly registered account.
    Welcome,
}

/// Port for sending emails.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Ask for `template` to be sent to `to`, rendered with `data`.
    async fn send(
        &self,
        to: &str,
        template: Template,
        data: serde_json::Value,
    ) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: Content<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    to: &'a str,
    template: Template,
    data: serde_json::Value,
}

/// RabbitMQ mail publisher.
///
/// Without connection, events are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct MailManager {
    queue: String,
    conn: Option<Arc<Connection>>,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub async fn new(config: &Mail) -> Result<Self> {
        let addr = Url::parse(&config.address)?;
        let uri = AMQPUri {
            scheme: AMQPScheme::from_str(addr.scheme())
                .map_err(|_| MailError::InvalidScheme(addr.scheme().to_owned()))?,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let conn_config = ConnectionProperties::default()
            .with_connection_name("enlist_mail_client".into());
        let conn = Connection::connect_uri(uri, conn_config).await?;

        tracing::info!(%addr, queue = config.queue, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            conn: Some(Arc::new(conn)),
        })
    }

    async fn create_channel(
        conn: Arc<Connection>,
        queue: &str,
    ) -> Result<Channel> {
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(channel)
    }

    fn create_event(data: Content) -> Cloudevent {
        let id = Alphanumeric.sample_string(&mut OsRng, ID_LENGTH);
        Cloudevent {
            specversion: CLOUDEVENT_VERSION,
            r#type: "com.enlist.email",
            source: "com.enlist.accounts",
            id,
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }
}

#[async_trait]
impl Mailer for MailManager {
    async fn send(
        &self,
        to: &str,
        template: Template,
        data: serde_json::Value,
    ) -> Result<()> {
        let Some(conn) = &self.conn else {
            tracing::debug!(?template, "mail publisher disabled, event dropped");
            return Ok(());
        };
        let channel = Self::create_channel(Arc::clone(conn), &self.queue).await?;

        let payload = Self::create_event(Content { to, template, data });
        let payload = serde_json::to_vec(&payload)?;

        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        tracing::trace!(?template, "event sent");

        Ok(())
    }
}

/// Mailer recording every call, optionally failing each one.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: std::sync::Mutex<Vec<(String, Template, serde_json::Value)>>,
    pub fail: bool,
}

#[cfg(test)]
impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        to: &str,
        template: Template,
        data: serde_json::Value,
    ) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_owned(), template, data));

        if self.fail {
            Err(MailError::Amqp(lapin::Error::IOError(Arc::new(
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "broker unreachable",
                ),
            ))))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_publisher_drops_events() {
        let mail = MailManager::default();
        let result = mail
            .send("ann@example.com", Template::Welcome, serde_json::json!({}))
            .await;

        assert!(result.is_ok());
    }

    #[test]
    fn test_event_shape() {
        let event = MailManager::create_event(Content {
            to: "ann@example.com",
            template: Template::Welcome,
            data: serde_json::json!({ "name": "Ann" }),
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["data"]["template"], "welcome");
        assert_eq!(json["data"]["to"], "ann@example.com");
        assert_eq!(json["data"]["data"]["name"], "Ann");
        assert_eq!(json["id"].as_str().unwrap().len(), ID_LENGTH);
    }
}
