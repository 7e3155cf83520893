use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use storefront_config::Config;
use storefront_contracts::{ChatId, Keyboard, OutboundMessage};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("transport rejected call: {0}")]
    Rejected(String),
}

/// Outbound half of the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError>;

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: &str,
        caption: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError>;

    async fn edit_controls(
        &self,
        chat_id: ChatId,
        message_id: i64,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError>;

    async fn answer_button(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), TransportError>;

    async fn resolve_photo_url(&self, file_id: &str) -> Result<String, TransportError>;
}

pub struct TelegramTransport {
    client: Client,
    api_base: String,
    token: Secret<String>,
}

#[derive(Debug, Deserialize)]
struct BotApiReply<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

impl TelegramTransport {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let token = std::env::var(&cfg.transport.bot_token_env)
            .map_err(|_| format!("{} is not set", cfg.transport.bot_token_env))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.transport.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_base: cfg.transport.api_base.trim_end_matches('/').to_string(),
            token: Secret::new(token),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, TransportError> {
        let url = format!(
            "{}/bot{}/{}",
            self.api_base,
            self.token.expose_secret(),
            method
        );
        // reqwest errors embed the URL, which carries the token.
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.without_url().to_string()))?;
        let reply: BotApiReply<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Request(e.without_url().to_string()))?;
        if !reply.ok {
            return Err(TransportError::Rejected(
                reply.description.unwrap_or_else(|| method.to_string()),
            ));
        }
        reply
            .result
            .ok_or_else(|| TransportError::Rejected(format!("{method}: empty result")))
    }
}

fn reply_markup(keyboard: Option<&Keyboard>) -> Value {
    let rows: Vec<Value> = keyboard
        .map(|k| {
            k.rows
                .iter()
                .map(|row| {
                    Value::Array(
                        row.iter()
                            .map(|b| match (&b.callback, &b.url) {
                                (_, Some(url)) => json!({ "text": b.label, "url": url }),
                                (Some(data), None) => {
                                    json!({ "text": b.label, "callback_data": data })
                                }
                                (None, None) => json!({ "text": b.label, "callback_data": "noop" }),
                            })
                            .collect(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "inline_keyboard": rows })
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if keyboard.is_some() {
            body["reply_markup"] = reply_markup(keyboard);
        }
        self.call::<Value>("sendMessage", body).await.map(|_| ())
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: &str,
        caption: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "photo": photo,
            "caption": caption,
            "parse_mode": "HTML",
        });
        if keyboard.is_some() {
            body["reply_markup"] = reply_markup(keyboard);
        }
        self.call::<Value>("sendPhoto", body).await.map(|_| ())
    }

    async fn edit_controls(
        &self,
        chat_id: ChatId,
        message_id: i64,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reply_markup": reply_markup(keyboard),
        });
        self.call::<Value>("editMessageReplyMarkup", body)
            .await
            .map(|_| ())
    }

    async fn answer_button(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), TransportError> {
        let body = json!({
            "callback_query_id": callback_id,
            "text": text.unwrap_or_default(),
            "show_alert": alert,
        });
        self.call::<Value>("answerCallbackQuery", body)
            .await
            .map(|_| ())
    }

    async fn resolve_photo_url(&self, file_id: &str) -> Result<String, TransportError> {
        let info: FileInfo = self.call("getFile", json!({ "file_id": file_id })).await?;
        let path = info
            .file_path
            .ok_or_else(|| TransportError::Rejected("getFile: no file_path".to_string()))?;
        Ok(format!(
            "{}/file/bot{}/{}",
            self.api_base,
            self.token.expose_secret(),
            path
        ))
    }
}

/// Keeps every outbound call in memory. Used for dry runs and tests.
#[derive(Default)]
pub struct RecordingTransport {
    outbox: Mutex<Vec<OutboundMessage>>,
    unreachable: Mutex<HashSet<ChatId>>,
    photos_refused: AtomicBool,
    files_lost: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends to `chat_id` fail from now on, as if the user had blocked the bot.
    pub async fn make_unreachable(&self, chat_id: ChatId) {
        self.unreachable.lock().await.insert(chat_id);
    }

    /// Photo sends fail from now on while text still goes through.
    pub fn refuse_photos(&self) {
        self.photos_refused.store(true, Ordering::SeqCst);
    }

    /// Stored photos can no longer be resolved to a URL.
    pub fn lose_files(&self) {
        self.files_lost.store(true, Ordering::SeqCst);
    }

    pub async fn messages_to(&self, chat_id: ChatId) -> Vec<OutboundMessage> {
        self.outbox
            .lock()
            .await
            .iter()
            .filter(|m| m.chat_id() == Some(chat_id))
            .cloned()
            .collect()
    }

    pub async fn texts_to(&self, chat_id: ChatId) -> Vec<String> {
        self.messages_to(chat_id)
            .await
            .iter()
            .filter_map(|m| m.text().map(str::to_string))
            .collect()
    }

    async fn deliver(&self, chat_id: ChatId, message: OutboundMessage) -> Result<(), TransportError> {
        if self.unreachable.lock().await.contains(&chat_id) {
            return Err(TransportError::Rejected(format!(
                "chat {chat_id} is unreachable"
            )));
        }
        self.outbox.lock().await.push(message);
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        self.deliver(
            chat_id,
            OutboundMessage::Text {
                chat_id,
                text: text.to_string(),
                keyboard: keyboard.cloned(),
            },
        )
        .await
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: &str,
        caption: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        if self.photos_refused.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("wrong file identifier".to_string()));
        }
        self.deliver(
            chat_id,
            OutboundMessage::Photo {
                chat_id,
                photo: photo.to_string(),
                caption: caption.to_string(),
                keyboard: keyboard.cloned(),
            },
        )
        .await
    }

    async fn edit_controls(
        &self,
        chat_id: ChatId,
        message_id: i64,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        self.deliver(
            chat_id,
            OutboundMessage::EditControls {
                chat_id,
                message_id,
                keyboard: keyboard.cloned(),
            },
        )
        .await
    }

    async fn answer_button(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<(), TransportError> {
        self.outbox.lock().await.push(OutboundMessage::ButtonAnswer {
            callback_id: callback_id.to_string(),
            text: text.map(str::to_string),
            alert,
        });
        Ok(())
    }

    async fn resolve_photo_url(&self, file_id: &str) -> Result<String, TransportError> {
        if self.files_lost.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!("file {file_id} not found")));
        }
        Ok(format!("recording://photos/{file_id}"))
    }
}
