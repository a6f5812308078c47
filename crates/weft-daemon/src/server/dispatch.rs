//! Request and notification dispatch.
//!
//! Requests get a response (success or a string error); notifications are
//! fire-and-forget and log-and-drop on bad input. Neither ever takes the
//! server down.

use std::sync::Arc;
use std::time::Instant;

use rmpv::Value;
use tracing::{debug, warn};
use weft_proto::RpcMessage;
use weft_vt::keyboard::{KeyEvent, OptionAsAlt, encode_key};
use weft_vt::mouse::{MouseButton, MouseEvent, MouseEventKind, encode_mouse};
use weft_vt::selection::Pin;

use crate::errors::DaemonError;
use crate::server::ServerHandle;
use crate::server::state::ServerState;

/// Work that must happen after the response has been queued.
enum Post {
    /// Send this client its initial full redraw.
    FullRedraw { pty_id: u64 },
}

/// Entry point from the connection read loop.
pub(crate) async fn handle_message(server: &Arc<ServerHandle>, client_id: u64, msg: RpcMessage) {
    match msg {
        RpcMessage::Request {
            msgid,
            method,
            params,
        } => {
            let mut state = server.state.write().await;
            let (result, post) = dispatch_request(&mut state, client_id, &method, &params);
            let response = match result {
                Ok(value) => RpcMessage::response_ok(msgid, value),
                Err(e) => {
                    if e.is_user_error() {
                        debug!(
                            event = "daemon.dispatch.request_rejected",
                            method = %method,
                            error_code = e.error_code(),
                        );
                    } else {
                        warn!(
                            event = "daemon.dispatch.request_failed",
                            method = %method,
                            error_code = e.error_code(),
                            error = %e,
                        );
                    }
                    RpcMessage::response_err(msgid, e.to_string())
                }
            };
            state.send_message_to_client(client_id, &response);
            if let Some(Post::FullRedraw { pty_id }) = post {
                state.send_full_redraw_to(pty_id, client_id);
            }
        }
        RpcMessage::Notification { method, params } => {
            let mut state = server.state.write().await;
            if let Err(e) = dispatch_notification(&mut state, client_id, &method, &params) {
                debug!(
                    event = "daemon.dispatch.notification_dropped",
                    method = %method,
                    error_code = e.error_code(),
                );
            }
        }
        RpcMessage::Response { msgid, .. } => {
            debug!(
                event = "daemon.dispatch.unexpected_response",
                client_id = client_id,
                msgid = msgid,
            );
        }
    }
}

fn dispatch_request(
    state: &mut ServerState,
    client_id: u64,
    method: &str,
    params: &Value,
) -> (Result<Value, DaemonError>, Option<Post>) {
    match method {
        "ping" => (Ok(Value::from("pong")), None),

        "get_server_info" => (
            Ok(Value::Map(vec![
                (
                    Value::from("version"),
                    Value::from(env!("CARGO_PKG_VERSION")),
                ),
                (
                    Value::from("pty_validity"),
                    Value::from(state.start_time_ms),
                ),
            ])),
            None,
        ),

        "list_ptys" => (list_ptys(state), None),

        "spawn_pty" => spawn_pty(state, client_id, params),

        "close_pty" => (
            params_array(params)
                .and_then(|args| arg_u64(args, 0))
                .and_then(|pty_id| state.close_pty(pty_id))
                .map(|()| Value::Nil),
            None,
        ),

        "attach_pty" => attach_pty(state, client_id, params),

        "write_pty" => (write_pty(state, params).map(|()| Value::Nil), None),

        "resize_pty" => (resize_pty(state, params).map(|()| Value::Nil), None),

        "detach_pty" => (
            params_array(params)
                .and_then(|args| arg_u64(args, 0))
                .map(|pty_id| {
                    detach(state, client_id, pty_id);
                    Value::Nil
                }),
            None,
        ),

        "detach_ptys" => (
            params_array(params)
                .and_then(|args| {
                    let ids = args
                        .first()
                        .and_then(|v| v.as_array())
                        .ok_or_else(|| DaemonError::InvalidParams("pty id list".to_string()))?;
                    for id in ids {
                        if let Some(pty_id) = id.as_u64() {
                            detach(state, client_id, pty_id);
                        }
                    }
                    Ok(Value::Nil)
                }),
            None,
        ),

        "get_selection" => (get_selection(state, params), None),

        "clear_selection" => (
            params_array(params)
                .and_then(|args| arg_u64(args, 0))
                .and_then(|pty_id| {
                    let sup = state.pty(pty_id)?;
                    if let Some(mut term) = sup.shared.lock_term() {
                        term.screen_mut().clear_selection();
                    }
                    state.mark_dirty(pty_id);
                    Ok(Value::Nil)
                }),
            None,
        ),

        other => (Err(DaemonError::UnknownMethod(other.to_string())), None),
    }
}

fn dispatch_notification(
    state: &mut ServerState,
    client_id: u64,
    method: &str,
    params: &Value,
) -> Result<(), DaemonError> {
    match method {
        "write_pty" => write_pty(state, params),
        "paste_input" => paste_input(state, params),
        "key_input" => key_input(state, client_id, params, false),
        "key_release" => key_input(state, client_id, params, true),
        "mouse_input" => mouse_input(state, params),
        "resize_pty" => resize_pty(state, params),
        "detach_pty" => {
            let args = params_array(params)?;
            let pty_id = arg_u64(args, 0)?;
            detach(state, client_id, pty_id);
            Ok(())
        }
        "focus_event" => focus_event(state, params),
        "color_response" => color_response(state, params),
        other => Err(DaemonError::UnknownMethod(other.to_string())),
    }
}

// --- Request bodies -----------------------------------------------------

fn list_ptys(state: &ServerState) -> Result<Value, DaemonError> {
    let mut entries = Vec::new();
    for pty_id in state.pty_ids() {
        let Ok(sup) = state.pty(pty_id) else {
            continue;
        };
        let (cwd, title) = match sup.shared.lock_term() {
            Some(term) => (
                term.screen().cwd().map(str::to_string),
                term.screen().title().map(str::to_string),
            ),
            None => (None, None),
        };
        entries.push(Value::Map(vec![
            (Value::from("id"), Value::from(pty_id)),
            (
                Value::from("cwd"),
                cwd.map(Value::from).unwrap_or(Value::Nil),
            ),
            (
                Value::from("title"),
                title.map(Value::from).unwrap_or(Value::Nil),
            ),
            (
                Value::from("attached_client_count"),
                Value::from(sup.clients.len() as u64),
            ),
        ]));
    }
    Ok(Value::Map(vec![
        (
            Value::from("pty_validity"),
            Value::from(state.start_time_ms),
        ),
        (Value::from("ptys"), Value::Array(entries)),
    ]))
}

fn spawn_pty(
    state: &mut ServerState,
    client_id: u64,
    params: &Value,
) -> (Result<Value, DaemonError>, Option<Post>) {
    let map = match params.as_map() {
        Some(map) => map,
        None => {
            return (
                Err(DaemonError::InvalidParams("expected a map".to_string())),
                None,
            );
        }
    };

    let rows = map_u64(map, "rows").unwrap_or(24).clamp(1, u16::MAX as u64) as u16;
    let cols = map_u64(map, "cols").unwrap_or(80).clamp(1, u16::MAX as u64) as u16;
    let attach = map_bool(map, "attach").unwrap_or(false);
    let cwd = map_str(map, "cwd").map(str::to_string);
    let env: Option<Vec<(String, String)>> = map_get(map, "env").and_then(|v| {
        v.as_map().map(|entries| {
            entries
                .iter()
                .filter_map(|(k, v)| {
                    Some((k.as_str()?.to_string(), v.as_str()?.to_string()))
                })
                .collect()
        })
    });

    let pty_id = match state.spawn_pty(rows, cols, cwd.as_deref(), env.as_deref()) {
        Ok(id) => id,
        Err(e) => return (Err(e), None),
    };

    let mut post = None;
    if attach {
        let option_as_alt = map_get(map, "macos_option_as_alt").map(option_as_alt_value);
        if let Err(e) = attach_client(state, client_id, pty_id, option_as_alt) {
            return (Err(e), None);
        }
        post = Some(Post::FullRedraw { pty_id });
    }
    (Ok(Value::from(pty_id)), post)
}

fn attach_pty(
    state: &mut ServerState,
    client_id: u64,
    params: &Value,
) -> (Result<Value, DaemonError>, Option<Post>) {
    let parsed = params_array(params).and_then(|args| {
        let pty_id = arg_u64(args, 0)?;
        let option_as_alt = args.get(1).map(option_as_alt_value);
        Ok((pty_id, option_as_alt))
    });
    let (pty_id, option_as_alt) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => return (Err(e), None),
    };
    match attach_client(state, client_id, pty_id, option_as_alt) {
        Ok(()) => (
            Ok(Value::from(pty_id)),
            Some(Post::FullRedraw { pty_id }),
        ),
        Err(e) => (Err(e), None),
    }
}

fn attach_client(
    state: &mut ServerState,
    client_id: u64,
    pty_id: u64,
    option_as_alt: Option<OptionAsAlt>,
) -> Result<(), DaemonError> {
    state.pty_mut(pty_id)?.attach_client(client_id)?;
    if let Some(client) = state.client_mut(client_id) {
        client.attached.insert(pty_id);
        if let Some(option_as_alt) = option_as_alt {
            client.option_as_alt = option_as_alt;
        }
    }
    Ok(())
}

fn detach(state: &mut ServerState, client_id: u64, pty_id: u64) {
    if let Ok(sup) = state.pty_mut(pty_id) {
        sup.detach_client(client_id);
    }
    if let Some(client) = state.client_mut(client_id) {
        client.attached.remove(&pty_id);
    }
}

fn write_pty(state: &ServerState, params: &Value) -> Result<(), DaemonError> {
    let args = params_array(params)?;
    let pty_id = arg_u64(args, 0)?;
    let bytes = arg_bytes(args, 1)?;
    state.pty(pty_id)?.shared.write(&bytes);
    Ok(())
}

fn resize_pty(state: &mut ServerState, params: &Value) -> Result<(), DaemonError> {
    let args = params_array(params)?;
    let pty_id = arg_u64(args, 0)?;
    let rows = arg_u16(args, 1)?;
    let cols = arg_u16(args, 2)?;
    let x_pixel = args.get(3).and_then(|v| v.as_u64()).unwrap_or(0) as u16;
    let y_pixel = args.get(4).and_then(|v| v.as_u64()).unwrap_or(0) as u16;

    let sup = state.pty_mut(pty_id)?;
    let changed = sup.resize(rows, cols, x_pixel, y_pixel)?;
    let in_band = sup
        .shared
        .lock_term()
        .map(|term| term.screen().modes().in_band_resize)
        .unwrap_or(false);
    if in_band {
        let report = format!("\x1b[48;{};{};{};{}t", rows, cols, y_pixel, x_pixel);
        sup.shared.write(report.as_bytes());
    }
    if changed {
        state.mark_dirty(pty_id);
    }
    Ok(())
}

fn get_selection(state: &ServerState, params: &Value) -> Result<Value, DaemonError> {
    let args = params_array(params)?;
    let pty_id = arg_u64(args, 0)?;
    let sup = state.pty(pty_id)?;
    let text = sup
        .shared
        .lock_term()
        .and_then(|term| term.screen().selection_to_string());
    Ok(text.map(Value::from).unwrap_or(Value::Nil))
}

fn paste_input(state: &ServerState, params: &Value) -> Result<(), DaemonError> {
    let args = params_array(params)?;
    let pty_id = arg_u64(args, 0)?;
    let bytes = arg_bytes(args, 1)?;
    let sup = state.pty(pty_id)?;

    let bracketed = sup
        .shared
        .lock_term()
        .map(|term| term.screen().modes().bracketed_paste)
        .unwrap_or(false);

    let payload = if bracketed {
        let mut wrapped = Vec::with_capacity(bytes.len() + 12);
        wrapped.extend_from_slice(b"\x1b[200~");
        wrapped.extend_from_slice(&bytes);
        wrapped.extend_from_slice(b"\x1b[201~");
        wrapped
    } else {
        bytes
            .iter()
            .map(|&b| if b == b'\n' { b'\r' } else { b })
            .collect()
    };
    sup.shared.write(&payload);
    Ok(())
}

fn key_input(
    state: &ServerState,
    client_id: u64,
    params: &Value,
    release: bool,
) -> Result<(), DaemonError> {
    let args = params_array(params)?;
    let pty_id = arg_u64(args, 0)?;
    let map = args
        .get(1)
        .and_then(|v| v.as_map())
        .ok_or_else(|| DaemonError::InvalidParams("key event map".to_string()))?;

    let event = KeyEvent {
        key: map_str(map, "key").unwrap_or("").to_string(),
        code: map_str(map, "code").unwrap_or("").to_string(),
        shift: map_bool(map, "shiftKey").unwrap_or(false),
        ctrl: map_bool(map, "ctrlKey").unwrap_or(false),
        alt: map_bool(map, "altKey").unwrap_or(false),
        meta: map_bool(map, "metaKey").unwrap_or(false),
    };

    let option_as_alt = state.client_option_as_alt(client_id);
    let sup = state.pty(pty_id)?;
    let modes = sup
        .shared
        .lock_term()
        .map(|term| term.screen().modes().clone())
        .ok_or_else(|| DaemonError::PtyError("terminal lock poisoned".to_string()))?;

    if let Some(bytes) = encode_key(&event, &modes, option_as_alt, release) {
        sup.shared.write(&bytes);
    }
    Ok(())
}

fn mouse_input(state: &mut ServerState, params: &Value) -> Result<(), DaemonError> {
    let args = params_array(params)?;
    let pty_id = arg_u64(args, 0)?;
    let map = args
        .get(1)
        .and_then(|v| v.as_map())
        .ok_or_else(|| DaemonError::InvalidParams("mouse event map".to_string()))?;

    let col = map_f64(map, "x").unwrap_or(0.0).max(0.0) as f32;
    let row = map_f64(map, "y").unwrap_or(0.0).max(0.0) as f32;
    let button = MouseButton::from_wire(map_u64(map, "button").unwrap_or(3))
        .ok_or_else(|| DaemonError::InvalidParams("mouse button".to_string()))?;
    let kind = MouseEventKind::from_wire(map_u64(map, "event_type").unwrap_or(0))
        .ok_or_else(|| DaemonError::InvalidParams("mouse event type".to_string()))?;
    let event = MouseEvent {
        col,
        row,
        button,
        kind,
        mods: map_u64(map, "modifiers").unwrap_or(0) as u8,
    };

    let mut needs_dirty = false;
    {
        let sup = state.pty_mut(pty_id)?;
        let modes = sup
            .shared
            .lock_term()
            .map(|term| term.screen().modes().clone())
            .ok_or_else(|| DaemonError::PtyError("terminal lock poisoned".to_string()))?;

        if modes.mouse_reporting() {
            if let Some(bytes) = encode_mouse(&event, &modes, sup.cell_width, sup.cell_height) {
                sup.shared.write(&bytes);
            }
        } else if button.is_wheel() && kind == MouseEventKind::Press {
            if modes.alt_screen && modes.alternate_scroll {
                let up = button == MouseButton::WheelUp;
                let seq: &[u8] = match (up, modes.app_cursor) {
                    (true, false) => b"\x1b[A",
                    (true, true) => b"\x1bOA",
                    (false, false) => b"\x1b[B",
                    (false, true) => b"\x1bOB",
                };
                sup.shared.write(seq);
            } else {
                let delta = if button == MouseButton::WheelUp { 1 } else { -1 };
                if let Some(mut term) = sup.shared.lock_term() {
                    term.screen_mut().scroll_display(delta);
                    needs_dirty = true;
                }
            }
        } else if button == MouseButton::Left {
            let pin = Pin::new(row as usize, col as usize);
            needs_dirty = match kind {
                MouseEventKind::Press => sup.selection_press(pin, Instant::now()),
                MouseEventKind::Motion => sup.selection_drag(pin),
                MouseEventKind::Release => {
                    sup.selection_release();
                    false
                }
            };
        }
        // Anything else with reporting disabled is dropped.
    }
    if needs_dirty {
        state.mark_dirty(pty_id);
    }
    Ok(())
}

fn focus_event(state: &ServerState, params: &Value) -> Result<(), DaemonError> {
    let args = params_array(params)?;
    let pty_id = arg_u64(args, 0)?;
    let focused = args
        .get(1)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| DaemonError::InvalidParams("focus flag".to_string()))?;

    let sup = state.pty(pty_id)?;
    let enabled = sup
        .shared
        .lock_term()
        .map(|term| term.screen().modes().focus_events)
        .unwrap_or(false);
    if enabled {
        sup.shared
            .write(if focused { b"\x1b[I" } else { b"\x1b[O" });
    }
    Ok(())
}

fn color_response(state: &mut ServerState, params: &Value) -> Result<(), DaemonError> {
    let map = params
        .as_map()
        .ok_or_else(|| DaemonError::InvalidParams("expected a map".to_string()))?;
    let pty_id = map_u64(map, "pty_id")
        .ok_or_else(|| DaemonError::InvalidParams("pty_id".to_string()))?;
    let r = map_u64(map, "r").unwrap_or(0).min(255) as u8;
    let g = map_u64(map, "g").unwrap_or(0).min(255) as u8;
    let b = map_u64(map, "b").unwrap_or(0).min(255) as u8;
    let index = map_u64(map, "index").map(|v| v.min(255) as u8);
    let kind = map_str(map, "kind");

    state.handle_color_response(pty_id, r, g, b, index, kind);
    Ok(())
}

// --- Param helpers ------------------------------------------------------

fn params_array(params: &Value) -> Result<&[Value], DaemonError> {
    params
        .as_array()
        .map(|v| v.as_slice())
        .ok_or_else(|| DaemonError::InvalidParams("expected an array".to_string()))
}

fn arg_u64(args: &[Value], index: usize) -> Result<u64, DaemonError> {
    args.get(index)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| DaemonError::InvalidParams(format!("argument {} must be an integer", index)))
}

fn arg_u16(args: &[Value], index: usize) -> Result<u16, DaemonError> {
    let value = arg_u64(args, index)?;
    u16::try_from(value)
        .map_err(|_| DaemonError::InvalidParams(format!("argument {} out of range", index)))
}

fn arg_bytes(args: &[Value], index: usize) -> Result<Vec<u8>, DaemonError> {
    let value = args.get(index).ok_or_else(|| {
        DaemonError::InvalidParams(format!("argument {} must be bytes", index))
    })?;
    if let Some(slice) = value.as_slice() {
        return Ok(slice.to_vec());
    }
    if let Some(text) = value.as_str() {
        return Ok(text.as_bytes().to_vec());
    }
    Err(DaemonError::InvalidParams(format!(
        "argument {} must be bytes",
        index
    )))
}

fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn map_u64(map: &[(Value, Value)], key: &str) -> Option<u64> {
    map_get(map, key).and_then(|v| v.as_u64())
}

fn map_f64(map: &[(Value, Value)], key: &str) -> Option<f64> {
    map_get(map, key).and_then(|v| v.as_f64().or_else(|| v.as_u64().map(|n| n as f64)))
}

fn map_bool(map: &[(Value, Value)], key: &str) -> Option<bool> {
    map_get(map, key).and_then(|v| v.as_bool())
}

fn map_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    map_get(map, key).and_then(|v| v.as_str())
}

fn option_as_alt_value(value: &Value) -> OptionAsAlt {
    if let Some(text) = value.as_str() {
        OptionAsAlt::parse(text)
    } else if value.as_bool() == Some(true) {
        OptionAsAlt::Both
    } else {
        OptionAsAlt::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_helpers() {
        let args = vec![Value::from(3u64), Value::from("text")];
        assert_eq!(arg_u64(&args, 0).unwrap(), 3);
        assert!(arg_u64(&args, 1).is_err());
        assert_eq!(arg_bytes(&args, 1).unwrap(), b"text".to_vec());
        assert!(arg_bytes(&args, 5).is_err());

        let binary = vec![Value::Binary(vec![1, 2, 3])];
        assert_eq!(arg_bytes(&binary, 0).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_map_helpers() {
        let map = vec![
            (Value::from("rows"), Value::from(24u64)),
            (Value::from("attach"), Value::from(true)),
            (Value::from("x"), Value::F64(1.5)),
        ];
        assert_eq!(map_u64(&map, "rows"), Some(24));
        assert_eq!(map_bool(&map, "attach"), Some(true));
        assert_eq!(map_f64(&map, "x"), Some(1.5));
        assert_eq!(map_u64(&map, "missing"), None);
    }

    #[test]
    fn test_option_as_alt_value_shapes() {
        assert_eq!(
            option_as_alt_value(&Value::from("false")),
            OptionAsAlt::None
        );
        assert_eq!(option_as_alt_value(&Value::from("left")), OptionAsAlt::Left);
        assert_eq!(option_as_alt_value(&Value::from(true)), OptionAsAlt::Both);
        assert_eq!(option_as_alt_value(&Value::Nil), OptionAsAlt::None);
    }
}
