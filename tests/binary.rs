//! Integration tests for the server binary.

use mediabus::client::Client;
use serial_test::serial;
use std::path::PathBuf;
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

fn socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("mediabus-test-{}", std::process::id()))
}

#[test]
fn test_server_help_flag() {
    let out = Command::new(env!("CARGO_BIN_EXE_server"))
        .arg("--help")
        .output()
        .expect("failed to run server --help");
    let stdout = String::from_utf8(out.stdout).expect("non utf-8 output");
    assert!(stdout.contains("--socket"));
}

#[test]
// serialize: tests share the filesystem socket namespace
#[serial]
fn test_connect_to_server() {
    let path = socket_path();
    let mut server = Command::new(env!("CARGO_BIN_EXE_server"))
        .arg("--socket")
        .arg(&path)
        .args(["--name", "smoke"])
        .spawn()
        .expect("failed to start server");

    let mut client = None;
    for _ in 0..50 {
        sleep(Duration::from_millis(50));
        if let Ok(c) = Client::connect(&path) {
            client = Some(c);
            break;
        }
    }
    let mut client = client.expect("server did not come up");
    client.roundtrip().unwrap();
    assert_eq!(client.core_info().unwrap().name, "smoke");
    drop(client);

    server.kill().unwrap();
    let _ = std::fs::remove_file(&path);
}
