//! A chat room bound to one viewer.
//!
//! Wires a store-backed server, a transport, the adapter and a sync session
//! together from a [`SyncConfig`], and sends messages the way the message
//! form does: a fresh identifier, the current time, the viewer as author.

use std::sync::Arc;

use chrono::Utc;
use log::info;
use serde_json::json;

use crate::config::SyncConfig;
use crate::error::ChatError;
use crate::message_model::MessageRecord;
use crate::server::MessageServer;
use crate::sync_session::{SessionConfig, SyncSession};
use crate::synced_chat::{synced_chat, SyncedChatProps};
use crate::transport::connect;

pub struct ChatRoom {
    session: SyncSession,
    viewer: String,
}

impl ChatRoom {
    /// Joins the room served by `server` as `viewer`.
    pub fn join(
        server: Arc<MessageServer>,
        config: &SyncConfig,
        session_config: SessionConfig,
        viewer: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let transport = connect(config.transport, server);
        let backend = synced_chat(SyncedChatProps::messages(transport, config))?;
        let session = SyncSession::init(Arc::new(backend), session_config)?;
        let viewer = viewer.into();
        info!("{viewer} joined the chat");

        Ok(Self { session, viewer })
    }

    /// Opens the store named in `config` and joins it.
    pub fn open(config: &SyncConfig, viewer: impl Into<String>) -> Result<(Arc<MessageServer>, Self), ChatError> {
        let server = MessageServer::open(&config.store)?;
        let room = Self::join(
            Arc::clone(&server),
            config,
            SessionConfig::from_sync_config(config),
            viewer,
        )?;
        Ok((server, room))
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    /// Sends `body` as a new message. Empty bodies are refused.
    pub fn send(&self, body: &str) -> Result<MessageRecord, ChatError> {
        if body.is_empty() {
            return Err(ChatError::BadRequest("message body is empty".to_string()));
        }
        let local_id = SyncSession::generate_id();
        let confirmed = self.session.assign(
            &local_id,
            json!({
                "localCreatedAt": Utc::now().timestamp_millis() as f64,
                "body": body,
                "author": self.viewer,
            }),
        )?;
        Ok(serde_json::from_value(confirmed)?)
    }

    /// Changes the body of an existing message. Unknown ids fail with
    /// [`ChatError::NotFound`].
    pub fn edit(&self, local_id: &str, body: &str) -> Result<MessageRecord, ChatError> {
        let confirmed = self.session.update(local_id, json!({ "body": body }))?;
        Ok(serde_json::from_value(confirmed)?)
    }

    pub fn delete(&self, local_id: &str) -> Result<(), ChatError> {
        self.session.delete(local_id)
    }

    /// Messages, newest first.
    pub fn messages(&self) -> Result<Vec<MessageRecord>, ChatError> {
        self.session.records_as()
    }

    pub fn leave(self) {
        self.session.dispose();
        info!("{} left the chat", self.viewer);
    }
}
