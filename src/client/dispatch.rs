//! Inbound message routing
//!
//! Runs on the reader task for every message that is not flow control.
//! First match wins:
//!
//! 1. ping request, answered right away
//! 2. stream begin while a negotiation waits for it
//! 3. shared object messages, by object name
//! 4. `_result` / `_error`, completing the pending invocation
//! 5. `receive`, an out-of-band subscription value
//! 6. anything else on a registered chunk stream goes to its owner;
//!    channel-less calls go to the session delegate
//! 7. the rest is logged and dropped

use crate::amf::AmfValue;
use crate::error::{Error, InvocationError};
use crate::protocol::constants::*;
use crate::protocol::message::{Command, RtmpMessage, UserControlEvent};

use super::delegate::call_delegate;
use super::events::SessionEvent;
use super::session::SessionInner;

const ACKNOWLEDGE_MESSAGE: &str = "flex.messaging.messages.AcknowledgeMessage";
const ERROR_MESSAGE: &str = "flex.messaging.messages.ErrorMessage";
const ASYNC_MESSAGE: &str = "flex.messaging.messages.AsyncMessage";
const SUBTOPIC_HEADER: &str = "DSSubtopic";

pub(crate) fn dispatch(session: &SessionInner, csid: u32, stream_id: u32, message: RtmpMessage) {
    match message {
        RtmpMessage::UserControl(event) => on_user_control(session, csid, event),
        RtmpMessage::SharedObject(so) => {
            let name = so.name.clone();
            if !session.shared_objects.dispatch(so) {
                tracing::warn!(name = %name, "Shared object message for unknown object");
            }
        }
        RtmpMessage::Invoke(cmd) => on_invoke(session, csid, cmd),
        RtmpMessage::Notify(data) => match session.channels.get(csid) {
            Some(channel) => channel.deliver(RtmpMessage::Notify(data)),
            None => invoke_session_delegate(session, &data.name, &data.values),
        },
        message @ (RtmpMessage::Audio { .. } | RtmpMessage::Video { .. }) => {
            match session.channels.get(csid) {
                Some(channel) => channel.deliver(message),
                None => {
                    tracing::debug!(csid = csid, stream_id = stream_id, "Media on unknown chunk stream")
                }
            }
        }
        other => {
            tracing::debug!(csid = csid, message = ?other, "Unhandled message");
        }
    }
}

fn on_user_control(session: &SessionInner, csid: u32, event: UserControlEvent) {
    match event {
        UserControlEvent::PingRequest(timestamp) => {
            let pong = RtmpMessage::UserControl(UserControlEvent::PingResponse(timestamp));
            if let Err(e) = session.enqueue(pong.to_chunk(CSID_PROTOCOL_CONTROL, 0)) {
                tracing::debug!(error = %e, "Ping response not sent");
            }
        }
        // Stream 0 is the connection itself, never a negotiated stream
        UserControlEvent::StreamBegin(id)
            if csid == CSID_PROTOCOL_CONTROL && id != 0 && session.negotiator.is_pending() =>
        {
            if session.negotiator.resolve_stream_begin(id) {
                tracing::debug!(stream_id = id, "Stream negotiated");
            }
        }
        other => {
            tracing::debug!(csid = csid, event = ?other, "User control event");
        }
    }
}

fn on_invoke(session: &SessionInner, csid: u32, cmd: Command) {
    match cmd.name.as_str() {
        CMD_RESULT => {
            let payload = cmd.first_argument();
            if is_error_status(&payload) {
                on_error(session, &cmd, payload);
            } else {
                session
                    .callbacks
                    .set_result(invoke_id(&cmd), unwrap_acknowledge(payload));
            }
        }
        CMD_ERROR => on_error(session, &cmd, cmd.first_argument()),
        CMD_RECEIVE => match cmd.first_argument() {
            message if message.class_name() == Some(ASYNC_MESSAGE) => {
                session.publish(SessionEvent::SubscriptionValue {
                    client_id: message.get_string("clientId").map(str::to_string),
                    subtopic: message
                        .get("headers")
                        .and_then(|h| h.get_string(SUBTOPIC_HEADER))
                        .map(str::to_string),
                    body: message.get("body").cloned().unwrap_or_default(),
                });
            }
            other => tracing::debug!(value = ?other, "receive without an AsyncMessage"),
        },
        _ => match session.channels.get(csid) {
            Some(channel) => channel.deliver(RtmpMessage::Invoke(cmd)),
            None if cmd.name.eq_ignore_ascii_case(CMD_ON_STATUS) => {
                let status = cmd.first_argument();
                tracing::debug!(
                    code = status.get_string("code").unwrap_or_default(),
                    level = status.get_string("level").unwrap_or_default(),
                    "Status"
                );
                session.publish(SessionEvent::Status(status));
            }
            None => invoke_session_delegate(session, &cmd.name, &cmd.arguments),
        },
    }
}

fn on_error(session: &SessionInner, cmd: &Command, payload: AmfValue) {
    let fault = decode_fault(payload);

    if fault.fault_code.as_deref() == Some(NC_CONNECT_REJECTED) {
        let reason = fault
            .fault_string
            .clone()
            .unwrap_or_else(|| NC_CONNECT_REJECTED.to_string());
        session.close_with(reason, Some(Error::Invocation(fault)));
        return;
    }

    session
        .callbacks
        .set_error(invoke_id(cmd), Error::Invocation(fault));
}

fn invoke_session_delegate(session: &SessionInner, method: &str, args: &[AmfValue]) {
    let Some(delegate) = session.delegate() else {
        tracing::debug!(method = method, "No delegate for server call");
        return;
    };
    if let Err(e) = call_delegate(delegate.as_ref(), method, args) {
        tracing::warn!(method = method, error = %e, "Delegate failed");
        session.publish(SessionEvent::CallbackError(e.0));
    }
}

fn invoke_id(cmd: &Command) -> u32 {
    cmd.transaction_id as u32
}

/// A `_result` carrying `{ code, level: "error" }` is a failure
fn is_error_status(payload: &AmfValue) -> bool {
    payload.get("code").is_some() && payload.get_string("level") == Some("error")
}

/// Strip one Flex acknowledgement wrapper
fn unwrap_acknowledge(payload: AmfValue) -> AmfValue {
    match payload {
        AmfValue::TypedObject {
            class_name,
            mut properties,
        } if class_name == ACKNOWLEDGE_MESSAGE => properties.remove("body").unwrap_or_default(),
        other => other,
    }
}

fn decode_fault(payload: AmfValue) -> InvocationError {
    let text = |v: &AmfValue, key: &str| v.get(key).and_then(display_value);

    if let AmfValue::String(s) = &payload {
        return InvocationError {
            fault_string: Some(s.clone()),
            extended_data: payload.clone(),
            ..Default::default()
        };
    }

    if payload.class_name() == Some(ERROR_MESSAGE) {
        return InvocationError {
            fault_code: text(&payload, "faultCode"),
            fault_string: text(&payload, "faultString"),
            root_cause: text(&payload, "rootCause"),
            extended_data: payload.get("extendedData").cloned().unwrap_or_default(),
        };
    }

    if payload.as_object().is_some() {
        return InvocationError {
            fault_code: text(&payload, "code"),
            fault_string: text(&payload, "description"),
            root_cause: text(&payload, "application"),
            extended_data: payload,
        };
    }

    InvocationError {
        extended_data: payload,
        ..Default::default()
    }
}

fn display_value(value: &AmfValue) -> Option<String> {
    match value {
        AmfValue::String(s) => Some(s.clone()),
        AmfValue::Number(n) => Some(n.to_string()),
        AmfValue::Integer(i) => Some(i.to_string()),
        AmfValue::Boolean(b) => Some(b.to_string()),
        AmfValue::Null | AmfValue::Undefined => None,
        other => Some(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_detection() {
        let rejected = AmfValue::object([
            ("code", "NetConnection.Connect.Rejected"),
            ("level", "error"),
        ]);
        assert!(is_error_status(&rejected));

        let ok = AmfValue::object([("code", "NetConnection.Connect.Success"), ("level", "status")]);
        assert!(!is_error_status(&ok));
        assert!(!is_error_status(&AmfValue::Number(1.0)));
    }

    #[test]
    fn test_unwrap_acknowledge() {
        let ack = AmfValue::typed_object(ACKNOWLEDGE_MESSAGE, [("body", 42.0)]);
        assert_eq!(unwrap_acknowledge(ack), AmfValue::Number(42.0));

        // Only one level, and only acknowledgements
        let other = AmfValue::typed_object("com.example.Thing", [("body", 1.0)]);
        assert_eq!(unwrap_acknowledge(other.clone()), other);
    }

    #[test]
    fn test_decode_fault_shapes() {
        let fault = decode_fault(AmfValue::from("plain failure"));
        assert_eq!(fault.fault_string.as_deref(), Some("plain failure"));
        assert!(fault.fault_code.is_none());

        let status = AmfValue::object([
            ("code", "NetConnection.Call.Failed"),
            ("description", "no such method"),
            ("application", "app"),
            ("level", "error"),
        ]);
        let fault = decode_fault(status.clone());
        assert_eq!(fault.fault_code.as_deref(), Some("NetConnection.Call.Failed"));
        assert_eq!(fault.fault_string.as_deref(), Some("no such method"));
        assert_eq!(fault.root_cause.as_deref(), Some("app"));
        assert_eq!(fault.extended_data, status);

        let flex = AmfValue::typed_object(
            ERROR_MESSAGE,
            [
                ("faultCode", AmfValue::from("Server.Processing")),
                ("faultString", AmfValue::from("boom")),
                ("rootCause", AmfValue::Null),
                ("extendedData", AmfValue::object([("detail", 1.0)])),
            ],
        );
        let fault = decode_fault(flex);
        assert_eq!(fault.fault_code.as_deref(), Some("Server.Processing"));
        assert_eq!(fault.fault_string.as_deref(), Some("boom"));
        assert!(fault.root_cause.is_none());
        assert_eq!(fault.extended_data.get_number("detail"), Some(1.0));

        let fault = decode_fault(AmfValue::Null);
        assert!(fault.fault_code.is_none() && fault.fault_string.is_none());
    }
}
