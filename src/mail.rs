//! Send emails to user for account events.
//!
//! Emails are rendered and delivered by an external worker. This module
//! only publishes CloudEvents describing which template to send, to whom,
//! and the action link carrying the verification token.

use std::borrow::Cow;
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
use uuid::Uuid;

use crate::config::Mail;

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const EVENT_TYPE: &str = "com.hearth.email";
const EVENT_SOURCE: &str = "com.hearth.auth";
const ID_LENGTH: usize = 12;

pub type Result<T> = std::result::Result<T, MailError>;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("unsupported AMQP scheme `{0}`")]
    InvalidScheme(String),
}

/// Mail templates list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Greets a new user and asks to confirm the address.
    Welcome,
    /// Carries a password reset link.
    PasswordReset,
    /// Asks to confirm the address again.
    Verification,
    /// Asks to confirm account destruction.
    AccountDeletion,
}

impl Template {
    /// Path of the page consuming the emailed token.
    fn action_path(&self) -> &'static str {
        match self {
            Template::Welcome | Template::Verification => "confirm-email",
            Template::PasswordReset => "reset-password",
            Template::AccountDeletion => "account/delete/confirm",
        }
    }
}

/// Port for sending emails.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver `template` to `email` with the given verification token.
    async fn send(
        &self,
        template: Template,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<()>;

    async fn send_welcome_email(
        &self,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<()> {
        self.send(Template::Welcome, user_id, email, token).await
    }

    async fn send_password_reset_email(
        &self,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<()> {
        self.send(Template::PasswordReset, user_id, email, token).await
    }

    async fn send_verification_email(
        &self,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<()> {
        self.send(Template::Verification, user_id, email, token).await
    }

    async fn send_account_deletion_email(
        &self,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<()> {
        self.send(Template::AccountDeletion, user_id, email, token).await
    }
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
    to: Cow<'a, str>,
    template: Template,
    user_id: Uuid,
    link: String,
}

fn action_link(base: &Url, template: Template, token: &str) -> Result<Url> {
    let mut link = base.join(template.action_path())?;
    link.query_pairs_mut().append_pair("token", token);
    Ok(link)
}

fn create_event(content: Content<'_>) -> Cloudevent<'_> {
    Cloudevent {
        specversion: CLOUDEVENT_VERSION,
        r#type: EVENT_TYPE,
        source: EVENT_SOURCE,
        id: Alphanumeric.sample_string(&mut OsRng, ID_LENGTH),
        time: Utc::now().to_rfc3339(),
        datacontenttype: DATA_CONTENT_TYPE,
        data: content,
    }
}

/// Publishes mail events on a RabbitMQ queue.
#[derive(Debug, Clone)]
pub struct QueueMailer {
    queue: String,
    base_url: Url,
    conn: Arc<Connection>,
}

impl QueueMailer {
    /// Connect to the broker described by `config`.
    pub async fn new(config: &Mail, base_url: Url) -> Result<Self> {
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
            .with_connection_name("hearth_mail_client".into());
        let conn = Connection::connect_uri(uri, conn_config).await?;

        tracing::info!(host = addr.host_str(), queue = config.queue, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            base_url,
            conn: Arc::new(conn),
        })
    }

    async fn create_channel(&self) -> Result<Channel> {
        let channel = self.conn.create_channel().await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(channel)
    }
}

#[async_trait]
impl Mailer for QueueMailer {
    async fn send(
        &self,
        template: Template,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<()> {
        let content = Content {
            to: Cow::from(email),
            template,
            user_id,
            link: action_link(&self.base_url, template, token)?.into(),
        };
        let payload = serde_json::to_string(&create_event(content))?;

        let channel = self.create_channel().await?;
        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        tracing::trace!(?template, %user_id, "mail event published");

        Ok(())
    }
}

/// Fallback when no queue is configured: logs and drops mails.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        template: Template,
        user_id: Uuid,
        email: &str,
        _token: &str,
    ) -> Result<()> {
        tracing::debug!(?template, %user_id, %email, "no mail queue configured, mail dropped");
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub template: Template,
    pub user_id: Uuid,
    pub email: String,
    pub token: String,
}

/// Keeps sent mails in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingMailer {
    sent: std::sync::Mutex<Vec<SentMail>>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<SentMail> {
        self.sent.lock().unwrap().last().cloned()
    }

    /// Make every following delivery fail.
    pub fn fail(&self) {
        self.failing.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        template: Template,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MailError::InvalidScheme("test".into()));
        }
        self.sent.lock().unwrap().push(SentMail {
            template,
            user_id,
            email: email.to_owned(),
            token: token.to_owned(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_link() {
        let base = Url::parse("https://auth.example.com/").unwrap();
        let link = action_link(&base, Template::PasswordReset, "abc.def").unwrap();
        assert_eq!(
            link.as_str(),
            "https://auth.example.com/reset-password?token=abc.def"
        );

        let link = action_link(&base, Template::AccountDeletion, "t").unwrap();
        assert_eq!(link.path(), "/account/delete/confirm");
    }

    #[test]
    fn test_cloudevent_shape() {
        let user_id = Uuid::new_v4();
        let event = create_event(Content {
            to: Cow::from("john@gmail.com"),
            template: Template::Welcome,
            user_id,
            link: "https://auth.example.com/confirm-email?token=t".into(),
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["specversion"], CLOUDEVENT_VERSION);
        assert_eq!(json["type"], EVENT_TYPE);
        assert_eq!(json["datacontenttype"], DATA_CONTENT_TYPE);
        assert_eq!(json["id"].as_str().unwrap().len(), ID_LENGTH);
        assert_eq!(json["data"]["template"], "welcome");
        assert_eq!(json["data"]["to"], "john@gmail.com");
        assert_eq!(json["data"]["user_id"], user_id.to_string());
    }

    #[tokio::test]
    async fn test_provided_methods_pick_template() {
        let mailer = RecordingMailer::default();
        let user_id = Uuid::new_v4();

        mailer.send_welcome_email(user_id, "a@b.co", "1").await.unwrap();
        mailer.send_password_reset_email(user_id, "a@b.co", "2").await.unwrap();
        mailer.send_verification_email(user_id, "a@b.co", "3").await.unwrap();
        mailer.send_account_deletion_email(user_id, "a@b.co", "4").await.unwrap();

        let templates: Vec<_> = mailer.sent().iter().map(|m| m.template).collect();
        assert_eq!(
            templates,
            [
                Template::Welcome,
                Template::PasswordReset,
                Template::Verification,
                Template::AccountDeletion
            ]
        );
    }
}
