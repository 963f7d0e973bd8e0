//! Flex remoting over RTMP
//!
//! Flex messages ride in AMF3 invocations with an empty command name and a
//! single argument: a `RemotingMessage` for remote calls or a
//! `CommandMessage` for subscriptions, login and pings. Replies come back
//! through the usual `_result`/`_error` path; acknowledgement wrappers are
//! stripped there.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

use crate::amf::{AmfValue, ObjectEncoding};
use crate::error::Result;
use crate::protocol::constants::CSID_COMMAND;
use crate::protocol::message::Command;

use super::session::RtmpClient;

const REMOTING_MESSAGE: &str = "flex.messaging.messages.RemotingMessage";
const COMMAND_MESSAGE: &str = "flex.messaging.messages.CommandMessage";

const ENDPOINT_HEADER: &str = "DSEndpoint";
const FLEX_CLIENT_ID_HEADER: &str = "DSId";
const SUBTOPIC_HEADER: &str = "DSSubtopic";

/// Reply body the server sends for accepted commands
const SUCCESS: &str = "success";

/// `CommandMessage` operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandOperation {
    Subscribe = 0,
    Unsubscribe = 1,
    ClientPing = 5,
    Login = 8,
    Logout = 9,
}

/// Fields shared by every Flex message we send
struct FlexMessage {
    class_name: &'static str,
    client_id: String,
    destination: String,
    body: AmfValue,
    headers: HashMap<String, AmfValue>,
    extra: Vec<(&'static str, AmfValue)>,
}

impl FlexMessage {
    fn new(class_name: &'static str, client_id: String, destination: &str) -> Self {
        Self {
            class_name,
            client_id,
            destination: destination.to_string(),
            body: AmfValue::Null,
            headers: HashMap::new(),
            extra: Vec::new(),
        }
    }

    fn header(mut self, name: &str, value: impl Into<AmfValue>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    fn into_value(self) -> AmfValue {
        let mut properties: HashMap<String, AmfValue> = [
            ("body", self.body),
            ("clientId", AmfValue::String(self.client_id)),
            ("destination", AmfValue::String(self.destination)),
            ("headers", AmfValue::Object(self.headers)),
            ("messageId", AmfValue::String(new_id())),
            ("timestamp", AmfValue::Number(0.0)),
            ("timeToLive", AmfValue::Number(0.0)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        for (key, value) in self.extra {
            properties.insert(key.to_string(), value);
        }
        AmfValue::TypedObject {
            class_name: self.class_name.to_string(),
            properties,
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().hyphenated().to_string().to_uppercase()
}

fn command_message(operation: CommandOperation, client_id: String, destination: &str) -> FlexMessage {
    let mut message = FlexMessage::new(COMMAND_MESSAGE, client_id, destination);
    message.extra.push(("operation", AmfValue::Number(operation as u8 as f64)));
    message.extra.push(("correlationId", AmfValue::Null));
    message
}

fn credentials(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{}:{}", username, password))
}

impl RtmpClient {
    /// Call `operation` on a Flex remoting `destination`
    pub async fn invoke_remote(
        &self,
        endpoint: &str,
        destination: &str,
        operation: &str,
        arguments: Vec<AmfValue>,
    ) -> Result<AmfValue> {
        let flex_id = self.client_id().unwrap_or_else(|| "nil".to_string());
        let mut message = FlexMessage::new(REMOTING_MESSAGE, new_id(), destination)
            .header(ENDPOINT_HEADER, endpoint)
            .header(FLEX_CLIENT_ID_HEADER, flex_id);
        message.body = AmfValue::Array(arguments);
        message.extra.push(("operation", AmfValue::from(operation)));

        tracing::debug!(destination = destination, operation = operation, "Remoting call");
        self.flex_call(message).await
    }

    /// Subscribe `client_id` to a messaging destination; values arrive as
    /// [`SessionEvent::SubscriptionValue`](super::SessionEvent::SubscriptionValue)
    pub async fn subscribe_topic(
        &self,
        endpoint: &str,
        destination: &str,
        subtopic: &str,
        client_id: &str,
    ) -> Result<bool> {
        self.subscription(CommandOperation::Subscribe, endpoint, destination, subtopic, client_id)
            .await
    }

    pub async fn unsubscribe_topic(
        &self,
        endpoint: &str,
        destination: &str,
        subtopic: &str,
        client_id: &str,
    ) -> Result<bool> {
        self.subscription(CommandOperation::Unsubscribe, endpoint, destination, subtopic, client_id)
            .await
    }

    async fn subscription(
        &self,
        operation: CommandOperation,
        endpoint: &str,
        destination: &str,
        subtopic: &str,
        client_id: &str,
    ) -> Result<bool> {
        let message = command_message(operation, client_id.to_string(), destination)
            .header(ENDPOINT_HEADER, endpoint)
            .header(FLEX_CLIENT_ID_HEADER, client_id)
            .header(SUBTOPIC_HEADER, subtopic);
        let reply = self.flex_call(message).await?;
        Ok(reply.as_str() == Some(SUCCESS))
    }

    /// Authenticate the Flex client; `true` if the server accepted
    pub async fn login(&self, username: &str, password: &str) -> Result<bool> {
        let mut message = command_message(CommandOperation::Login, self.flex_client_id(), "");
        message.body = AmfValue::String(credentials(username, password));
        let reply = self.flex_call(message).await?;
        Ok(reply.as_str() == Some(SUCCESS))
    }

    pub async fn logout(&self) -> Result<()> {
        let message = command_message(CommandOperation::Logout, self.flex_client_id(), "");
        self.flex_call(message).await.map(|_| ())
    }

    pub async fn ping(&self) -> Result<()> {
        let message = command_message(CommandOperation::ClientPing, self.flex_client_id(), "");
        self.flex_call(message).await.map(|_| ())
    }

    fn flex_client_id(&self) -> String {
        self.client_id().unwrap_or_default()
    }

    /// Flex messages are always AMF3, whatever the session default
    async fn flex_call(&self, message: FlexMessage) -> Result<AmfValue> {
        let id = self.inner.callbacks.next_invoke_id();
        let command = Command::invoke("", id as f64, vec![message.into_value()], ObjectEncoding::Amf3);
        self.inner.call(CSID_COMMAND, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_base64() {
        assert_eq!(credentials("user", "pass"), "dXNlcjpwYXNz");
    }

    #[test]
    fn test_command_message_shape() {
        let value = command_message(CommandOperation::Subscribe, "abc".into(), "feed")
            .header(SUBTOPIC_HEADER, "prices")
            .into_value();

        assert_eq!(value.class_name(), Some(COMMAND_MESSAGE));
        assert_eq!(value.get_number("operation"), Some(0.0));
        assert_eq!(value.get_string("clientId"), Some("abc"));
        assert_eq!(value.get_string("destination"), Some("feed"));
        assert_eq!(
            value.get("headers").and_then(|h| h.get_string(SUBTOPIC_HEADER)),
            Some("prices")
        );
        assert_eq!(value.get_string("messageId").map(str::len), Some(36));
    }

    #[test]
    fn test_message_ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }
}
