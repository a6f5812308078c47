//! Async RPC client for the weft daemon socket.
//!
//! Thin request/response + notification reader over a Unix stream. The
//! daemon's integration tests are the primary consumer; a UI client would
//! use the same framing.

use std::collections::VecDeque;
use std::path::Path;

use bytes::{Buf, BytesMut};
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::codec::{MESSAGE_SIZE_MAX, decode_frame, encode_frame};
use crate::errors::ProtoError;
use crate::rpc::RpcMessage;

pub struct Client {
    stream: UnixStream,
    acc: BytesMut,
    next_msgid: u32,
    /// Notifications received while waiting for a response.
    pending: VecDeque<(String, Value)>,
}

impl Client {
    pub async fn connect(path: &Path) -> Result<Self, ProtoError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            stream,
            acc: BytesMut::with_capacity(4096),
            next_msgid: 1,
            pending: VecDeque::new(),
        })
    }

    /// Send a request and wait for its response.
    ///
    /// Notifications arriving in the meantime are queued for
    /// `next_notification`. A response carrying a non-nil error slot is
    /// surfaced as `ProtoError::Remote`.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, ProtoError> {
        let msgid = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1);
        let frame = encode_frame(&RpcMessage::request(msgid, method, params))?;
        self.stream.write_all(&frame).await?;

        loop {
            match self.recv().await? {
                RpcMessage::Response {
                    msgid: got,
                    error,
                    result,
                } if got == msgid => {
                    if let Some(message) = error.as_str() {
                        return Err(ProtoError::Remote(message.to_string()));
                    }
                    if !error.is_nil() {
                        return Err(ProtoError::Remote(error.to_string()));
                    }
                    return Ok(result);
                }
                RpcMessage::Response { .. } => {
                    // Stale response from an abandoned request; skip it.
                }
                RpcMessage::Notification { method, params } => {
                    self.pending.push_back((method, params));
                }
                RpcMessage::Request { .. } => {
                    return Err(ProtoError::InvalidFormat(
                        "server sent a request frame".to_string(),
                    ));
                }
            }
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&mut self, method: &str, params: Value) -> Result<(), ProtoError> {
        let frame = encode_frame(&RpcMessage::notification(method, params))?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Next server notification, in arrival order.
    pub async fn next_notification(&mut self) -> Result<(String, Value), ProtoError> {
        loop {
            if let Some(front) = self.pending.pop_front() {
                return Ok(front);
            }
            match self.recv().await? {
                RpcMessage::Notification { method, params } => return Ok((method, params)),
                RpcMessage::Response { .. } => {
                    // Response with no request in flight; skip it.
                }
                RpcMessage::Request { .. } => {
                    return Err(ProtoError::InvalidFormat(
                        "server sent a request frame".to_string(),
                    ));
                }
            }
        }
    }

    async fn recv(&mut self) -> Result<RpcMessage, ProtoError> {
        loop {
            if let Some((msg, consumed)) = decode_frame(&self.acc)? {
                self.acc.advance(consumed);
                return Ok(msg);
            }
            if self.acc.len() > MESSAGE_SIZE_MAX {
                return Err(ProtoError::MessageTooLarge(self.acc.len()));
            }
            let n = self.stream.read_buf(&mut self.acc).await?;
            if n == 0 {
                return Err(ProtoError::PeerClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serve one scripted exchange on the other end of a socketpair.
    async fn scripted_server(stream: UnixStream, replies: Vec<RpcMessage>) {
        let mut stream = stream;
        let mut buf = vec![0u8; 4096];
        // Wait for at least one inbound frame before replying.
        let _ = stream.read(&mut buf).await.unwrap();
        for reply in replies {
            let frame = encode_frame(&reply).unwrap();
            stream.write_all(&frame).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_response() {
        let (a, b) = UnixStream::pair().unwrap();
        let server = tokio::spawn(scripted_server(
            b,
            vec![RpcMessage::response_ok(1, Value::from("pong"))],
        ));

        let mut client = Client {
            stream: a,
            acc: BytesMut::new(),
            next_msgid: 1,
            pending: VecDeque::new(),
        };
        let result = client.request("ping", Value::Array(vec![])).await.unwrap();
        assert_eq!(result.as_str(), Some("pong"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_queued_during_request() {
        let (a, b) = UnixStream::pair().unwrap();
        let server = tokio::spawn(scripted_server(
            b,
            vec![
                RpcMessage::notification("redraw", Value::Array(vec![])),
                RpcMessage::response_ok(1, Value::from(0u32)),
            ],
        ));

        let mut client = Client {
            stream: a,
            acc: BytesMut::new(),
            next_msgid: 1,
            pending: VecDeque::new(),
        };
        let result = client
            .request("spawn_pty", Value::Map(vec![]))
            .await
            .unwrap();
        assert_eq!(result.as_u64(), Some(0));
        let (method, _) = client.next_notification().await.unwrap();
        assert_eq!(method, "redraw");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_remote() {
        let (a, b) = UnixStream::pair().unwrap();
        let server = tokio::spawn(scripted_server(
            b,
            vec![RpcMessage::response_err(1, "PTY not found")],
        ));

        let mut client = Client {
            stream: a,
            acc: BytesMut::new(),
            next_msgid: 1,
            pending: VecDeque::new(),
        };
        let err = client
            .request("attach_pty", Value::Array(vec![Value::from(9u32)]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "server error: PTY not found");
        server.await.unwrap();
    }
}
