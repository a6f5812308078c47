//! Integration tests for the weft-daemon client-server roundtrip.
//!
//! These tests start a real server on a temp socket, connect with the
//! weft-proto client, and exercise the RPC surface end to end.

use std::path::PathBuf;
use std::time::Duration;

use rmpv::Value;
use weft_daemon::types::DaemonConfig;
use weft_proto::Client;

/// Create a DaemonConfig pointing at a temp directory for test isolation.
fn test_config(dir: &std::path::Path, shell: &str) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.join("daemon.sock"),
        shell: Some(shell.to_string()),
        scrollback_lines: 200,
        log_json: false,
    }
}

async fn start_server(
    config: DaemonConfig,
) -> (PathBuf, tokio::task::JoinHandle<Result<(), weft_daemon::DaemonError>>) {
    let socket_path = config.socket_path.clone();
    let handle = tokio::spawn(async move { weft_daemon::run_server(config).await });
    // Wait for the server to bind.
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    (socket_path, handle)
}

fn spawn_params(rows: u64, cols: u64, attach: bool) -> Value {
    Value::Map(vec![
        (Value::from("rows"), Value::from(rows)),
        (Value::from("cols"), Value::from(cols)),
        (Value::from("attach"), Value::from(attach)),
    ])
}

/// Event names of a redraw notification payload.
fn event_names(params: &Value) -> Vec<String> {
    params
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e.as_array().unwrap()[0].as_str().unwrap().to_string())
        .collect()
}

fn first_event<'a>(params: &'a Value, name: &str) -> Option<Vec<Value>> {
    params.as_array().unwrap().iter().find_map(|e| {
        let entry = e.as_array().unwrap();
        if entry[0].as_str() == Some(name) {
            Some(entry[1].as_array().unwrap().clone())
        } else {
            None
        }
    })
}

/// All text written by `write` events in a redraw payload.
fn redraw_text(params: &Value) -> String {
    let mut out = String::new();
    for entry in params.as_array().unwrap() {
        let entry = entry.as_array().unwrap();
        if entry[0].as_str() != Some("write") {
            continue;
        }
        let args = entry[1].as_array().unwrap();
        for cell in args[3].as_array().unwrap() {
            let cell = cell.as_array().unwrap();
            if let Some(text) = cell[0].as_str() {
                out.push_str(text);
            }
        }
        out.push('\n');
    }
    out
}

#[tokio::test]
async fn test_ping_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let result = client.request("ping", Value::Array(vec![])).await.unwrap();
    assert_eq!(result.as_str(), Some("pong"));
}

#[tokio::test]
async fn test_unknown_method() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let err = client
        .request("frobnicate", Value::Array(vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "server error: unknown method");
}

#[tokio::test]
async fn test_server_info_and_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();

    let info = client
        .request("get_server_info", Value::Array(vec![]))
        .await
        .unwrap();
    let info = info.as_map().unwrap();
    let validity = info
        .iter()
        .find(|(k, _)| k.as_str() == Some("pty_validity"))
        .and_then(|(_, v)| v.as_u64())
        .unwrap();
    assert!(validity > 1_600_000_000_000);

    let list = client
        .request("list_ptys", Value::Array(vec![]))
        .await
        .unwrap();
    let list = list.as_map().unwrap();
    let ptys = list
        .iter()
        .find(|(k, _)| k.as_str() == Some("ptys"))
        .and_then(|(_, v)| v.as_array())
        .unwrap();
    assert!(ptys.is_empty());
}

#[tokio::test]
async fn test_spawn_attach_gets_full_redraw() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let pty_id = client
        .request("spawn_pty", spawn_params(24, 80, true))
        .await
        .unwrap();
    assert_eq!(pty_id.as_u64(), Some(0));

    let (method, params) = tokio::time::timeout(Duration::from_secs(5), client.next_notification())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(method, "redraw");

    let names = event_names(&params);
    assert_eq!(names[0], "resize");
    assert_eq!(names.iter().filter(|n| *n == "write").count(), 24);
    assert!(names.contains(&"cursor_pos".to_string()));
    assert_eq!(names.last().unwrap(), "flush");

    let resize = first_event(&params, "resize").unwrap();
    assert_eq!(resize[0].as_u64(), Some(0));
    assert_eq!(resize[1].as_u64(), Some(24));
    assert_eq!(resize[2].as_u64(), Some(80));

    let style = first_event(&params, "style").unwrap();
    assert_eq!(style[0].as_u64(), Some(0));
}

#[tokio::test]
async fn test_second_client_attach() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut first = Client::connect(&socket_path).await.unwrap();
    let pty_id = first
        .request("spawn_pty", spawn_params(24, 80, true))
        .await
        .unwrap()
        .as_u64()
        .unwrap();

    let mut second = Client::connect(&socket_path).await.unwrap();
    let attached = second
        .request(
            "attach_pty",
            Value::Array(vec![Value::from(pty_id), Value::from("false")]),
        )
        .await
        .unwrap();
    assert_eq!(attached.as_u64(), Some(pty_id));

    let (method, params) = tokio::time::timeout(Duration::from_secs(5), second.next_notification())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(method, "redraw");
    let names = event_names(&params);
    assert_eq!(names[0], "resize");
    assert_eq!(names.last().unwrap(), "flush");

    // Attach counts are visible in list_ptys.
    let list = first
        .request("list_ptys", Value::Array(vec![]))
        .await
        .unwrap();
    let entry = list
        .as_map()
        .unwrap()
        .iter()
        .find(|(k, _)| k.as_str() == Some("ptys"))
        .and_then(|(_, v)| v.as_array())
        .unwrap()[0]
        .as_map()
        .unwrap()
        .to_vec();
    let count = entry
        .iter()
        .find(|(k, _)| k.as_str() == Some("attached_client_count"))
        .and_then(|(_, v)| v.as_u64())
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_attach_unknown_pty() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let err = client
        .request(
            "attach_pty",
            Value::Array(vec![Value::from(42u64), Value::from("false")]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "server error: PTY not found");
}

#[tokio::test]
async fn test_close_pty_delivers_exit_then_rejects_attach() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let pty_id = client
        .request("spawn_pty", spawn_params(24, 80, true))
        .await
        .unwrap()
        .as_u64()
        .unwrap();

    client
        .request("close_pty", Value::Array(vec![Value::from(pty_id)]))
        .await
        .unwrap();

    // Exactly one pty_exited, after any remaining redraws.
    let exited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (method, params) = client.next_notification().await.unwrap();
            if method == "pty_exited" {
                return params;
            }
            assert_eq!(method, "redraw");
        }
    })
    .await
    .unwrap();

    let args = exited.as_array().unwrap();
    assert_eq!(args[0].as_u64(), Some(pty_id));
    assert!(args[1].as_i64().is_some() || args[1].as_u64().is_some());

    // The PTY is gone now.
    let err = client
        .request(
            "attach_pty",
            Value::Array(vec![Value::from(pty_id), Value::from("false")]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "server error: PTY not found");
}

#[tokio::test]
async fn test_write_pty_output_streams_back() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/cat")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let pty_id = client
        .request("spawn_pty", spawn_params(6, 40, true))
        .await
        .unwrap()
        .as_u64()
        .unwrap();

    client
        .request(
            "write_pty",
            Value::Array(vec![
                Value::from(pty_id),
                Value::Binary(b"weft-test\r".to_vec()),
            ]),
        )
        .await
        .unwrap();

    // Redraw frames eventually carry the echoed text.
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (method, params) = client.next_notification().await.unwrap();
            if method == "redraw" && redraw_text(&params).contains("weft-test") {
                return true;
            }
        }
    })
    .await
    .unwrap();
    assert!(found);
}

#[tokio::test]
async fn test_paste_input_translates_newlines() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/cat")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let pty_id = client
        .request("spawn_pty", spawn_params(6, 40, true))
        .await
        .unwrap()
        .as_u64()
        .unwrap();

    client
        .notify(
            "paste_input",
            Value::Array(vec![
                Value::from(pty_id),
                Value::Binary(b"aaa\nbbb".to_vec()),
            ]),
        )
        .await
        .unwrap();

    // LF became CR, so the echo lands on two separate rows.
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (method, params) = client.next_notification().await.unwrap();
            if method == "redraw" {
                let text = redraw_text(&params);
                if text.contains("aaa") && text.contains("bbb") {
                    return true;
                }
            }
        }
    })
    .await
    .unwrap();
    assert!(found);
}

#[tokio::test]
async fn test_detach_keeps_pty_running() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let pty_id = client
        .request("spawn_pty", spawn_params(24, 80, true))
        .await
        .unwrap()
        .as_u64()
        .unwrap();

    client
        .request("detach_pty", Value::Array(vec![Value::from(pty_id)]))
        .await
        .unwrap();

    // Still listed, and attachable again.
    let attached = client
        .request(
            "attach_pty",
            Value::Array(vec![Value::from(pty_id), Value::from("false")]),
        )
        .await
        .unwrap();
    assert_eq!(attached.as_u64(), Some(pty_id));
}

#[tokio::test]
async fn test_resize_pty_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (socket_path, _server) = start_server(test_config(dir.path(), "/bin/sh")).await;

    let mut client = Client::connect(&socket_path).await.unwrap();
    let pty_id = client
        .request("spawn_pty", spawn_params(24, 80, true))
        .await
        .unwrap()
        .as_u64()
        .unwrap();

    client
        .request(
            "resize_pty",
            Value::Array(vec![
                Value::from(pty_id),
                Value::from(30u64),
                Value::from(100u64),
            ]),
        )
        .await
        .unwrap();

    // The resize produces a full redraw with the new dimensions.
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (method, params) = client.next_notification().await.unwrap();
            if method == "redraw"
                && let Some(resize) = first_event(&params, "resize")
                && resize[1].as_u64() == Some(30)
                && resize[2].as_u64() == Some(100)
            {
                return true;
            }
        }
    })
    .await
    .unwrap();
    assert!(found);
}

#[tokio::test]
async fn test_stale_socket_is_replaced_and_live_socket_refused() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "/bin/sh");

    // Stale file with no listener behind it.
    std::fs::write(&config.socket_path, b"").unwrap();
    let (socket_path, _server) = start_server(config.clone()).await;
    let mut client = Client::connect(&socket_path).await.unwrap();
    let result = client.request("ping", Value::Array(vec![])).await.unwrap();
    assert_eq!(result.as_str(), Some("pong"));

    // A second daemon on the same live socket must refuse to start.
    let err = weft_daemon::run_server(config).await.unwrap_err();
    assert_eq!(err.error_code(), "address_in_use");
}
