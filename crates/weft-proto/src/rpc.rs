use rmpv::Value;

use crate::errors::ProtoError;

/// One MessagePack-RPC frame.
///
/// The wire shape is a tagged tuple: `[0, msgid, method, params]` for
/// requests, `[1, msgid, error, result]` for responses, and
/// `[2, method, params]` for notifications. The first element discriminates
/// the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        msgid: u32,
        method: String,
        params: Value,
    },
    Response {
        msgid: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

const TYPE_REQUEST: u64 = 0;
const TYPE_RESPONSE: u64 = 1;
const TYPE_NOTIFICATION: u64 = 2;

impl RpcMessage {
    pub fn request(msgid: u32, method: impl Into<String>, params: Value) -> Self {
        RpcMessage::Request {
            msgid,
            method: method.into(),
            params,
        }
    }

    /// Successful response: the error slot carries nil.
    pub fn response_ok(msgid: u32, result: Value) -> Self {
        RpcMessage::Response {
            msgid,
            error: Value::Nil,
            result,
        }
    }

    /// Error response: a string error and a nil result.
    pub fn response_err(msgid: u32, message: impl Into<String>) -> Self {
        RpcMessage::Response {
            msgid,
            error: Value::from(message.into()),
            result: Value::Nil,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        RpcMessage::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build the tagged tuple for encoding.
    pub fn to_value(&self) -> Value {
        match self {
            RpcMessage::Request {
                msgid,
                method,
                params,
            } => Value::Array(vec![
                Value::from(TYPE_REQUEST),
                Value::from(*msgid),
                Value::from(method.as_str()),
                params.clone(),
            ]),
            RpcMessage::Response {
                msgid,
                error,
                result,
            } => Value::Array(vec![
                Value::from(TYPE_RESPONSE),
                Value::from(*msgid),
                error.clone(),
                result.clone(),
            ]),
            RpcMessage::Notification { method, params } => Value::Array(vec![
                Value::from(TYPE_NOTIFICATION),
                Value::from(method.as_str()),
                params.clone(),
            ]),
        }
    }

    /// Parse a decoded value into one of the three frame shapes.
    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        let Value::Array(mut elems) = value else {
            return Err(ProtoError::InvalidFormat(
                "frame is not an array".to_string(),
            ));
        };

        let kind = elems
            .first()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProtoError::InvalidFormat("missing frame type tag".to_string()))?;

        match kind {
            TYPE_REQUEST => {
                if elems.len() != 4 {
                    return Err(ProtoError::InvalidFormat(format!(
                        "request frame has {} elements, expected 4",
                        elems.len()
                    )));
                }
                let params = elems.pop().expect("length checked");
                let method = elems.pop().expect("length checked");
                let msgid = elems.pop().expect("length checked");
                let msgid = msgid
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| ProtoError::InvalidFormat("bad request msgid".to_string()))?;
                let method = method
                    .as_str()
                    .ok_or_else(|| ProtoError::InvalidFormat("bad request method".to_string()))?
                    .to_string();
                Ok(RpcMessage::Request {
                    msgid,
                    method,
                    params,
                })
            }
            TYPE_RESPONSE => {
                if elems.len() != 4 {
                    return Err(ProtoError::InvalidFormat(format!(
                        "response frame has {} elements, expected 4",
                        elems.len()
                    )));
                }
                let result = elems.pop().expect("length checked");
                let error = elems.pop().expect("length checked");
                let msgid = elems.pop().expect("length checked");
                let msgid = msgid
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| ProtoError::InvalidFormat("bad response msgid".to_string()))?;
                Ok(RpcMessage::Response {
                    msgid,
                    error,
                    result,
                })
            }
            TYPE_NOTIFICATION => {
                if elems.len() != 3 {
                    return Err(ProtoError::InvalidFormat(format!(
                        "notification frame has {} elements, expected 3",
                        elems.len()
                    )));
                }
                let params = elems.pop().expect("length checked");
                let method = elems.pop().expect("length checked");
                let method = method
                    .as_str()
                    .ok_or_else(|| {
                        ProtoError::InvalidFormat("bad notification method".to_string())
                    })?
                    .to_string();
                Ok(RpcMessage::Notification { method, params })
            }
            other => Err(ProtoError::InvalidFormat(format!(
                "unknown frame type tag: {}",
                other
            ))),
        }
    }
}
