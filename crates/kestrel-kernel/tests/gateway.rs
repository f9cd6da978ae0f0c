//! The name-based syscall gateway.

mod common;

use std::sync::Arc;

use kestrel_kernel::Gateway;
use kestrel_platform::{ManualClock, MemoryStorage};
use kestrel_types::ErrorKind;
use serde_json::{Value, json};

fn booted() -> (Gateway, MemoryStorage) {
    let storage = MemoryStorage::new();
    let gateway = Gateway::new();
    gateway
        .boot(
            common::config(),
            Box::new(storage.clone()),
            Arc::new(ManualClock::default()),
        )
        .unwrap_or_else(|e| panic!("boot failed: {e}"));
    (gateway, storage)
}

fn ok(gateway: &Gateway, domain: &str, method: &str, args: &[Value]) -> Value {
    let response = gateway.call(domain, method, args);
    assert!(
        response.success,
        "{domain}.{method} failed: {:?}",
        response.error
    );
    response.data.unwrap_or(Value::Null)
}

fn kind(gateway: &Gateway, domain: &str, method: &str, args: &[Value]) -> ErrorKind {
    let response = gateway.call(domain, method, args);
    assert!(!response.success, "{domain}.{method} should have failed");
    response.kind.unwrap()
}

#[test]
fn calls_before_boot_are_refused() {
    let gateway = Gateway::new();
    assert!(!gateway.is_ready());
    assert_eq!(
        kind(&gateway, "session", "current_user", &[]),
        ErrorKind::KernelNotReady
    );
    let text = gateway.call_json("session", "current_user", &[]);
    let parsed: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["success"], false);
    assert_eq!(parsed["kind"], "KernelNotReady");
}

#[test]
fn shutdown_stops_serving() {
    let (gateway, storage) = booted();
    ok(&gateway, "filesystem", "create_directory", &[json!("keep"), json!(false)]);
    gateway.shutdown().unwrap();
    assert!(!gateway.is_ready());
    assert!(storage.document().unwrap().contains("keep"));
    assert_eq!(kind(&gateway, "session", "cwd", &[]), ErrorKind::KernelNotReady);
}

#[test]
fn filesystem_domain() {
    let (gateway, storage) = booted();
    ok(&gateway, "filesystem", "create_or_update_file", &[json!("notes.txt"), json!("hello")]);
    assert!(storage.document().unwrap().contains("hello"));
    assert_eq!(ok(&gateway, "filesystem", "calculate_size", &[json!("notes.txt")]), 5);
    assert_eq!(
        ok(&gateway, "filesystem", "resolve", &[json!("../x"), json!("/home/Guest")]),
        "/home/x"
    );

    let validated = ok(
        &gateway,
        "filesystem",
        "validate_path",
        &[json!("notes.txt"), json!({"expect": "file", "require": ["read"]})],
    );
    assert_eq!(validated["path"], "/home/Guest/notes.txt");
    assert_eq!(
        kind(&gateway, "filesystem", "validate_path", &[json!("notes.txt"), json!({"expect": "directory"})]),
        ErrorKind::NotADirectory
    );
    assert_eq!(
        kind(&gateway, "filesystem", "create_or_update_file", &[json!("/etc/motd"), json!("x")]),
        ErrorKind::PermissionDenied
    );

    ok(&gateway, "filesystem", "rename", &[json!("notes.txt"), json!("kept.txt")]);
    assert_eq!(ok(&gateway, "filesystem", "get_node", &[json!("notes.txt")]), Value::Null);
    ok(&gateway, "filesystem", "remove", &[json!("kept.txt"), json!(false)]);
    assert_eq!(
        kind(&gateway, "filesystem", "calculate_size", &[json!("kept.txt")]),
        ErrorKind::NotFound
    );

    let report = ok(&gateway, "filesystem", "fsck", &[json!(false)]);
    assert_eq!(report["issues"], json!([]));
    assert_eq!(kind(&gateway, "filesystem", "fsck", &[json!(true)]), ErrorKind::PermissionDenied);
}

#[test]
fn account_changes_need_root() {
    let (gateway, _) = booted();
    assert_eq!(
        kind(&gateway, "users", "create_user", &[json!("carol"), json!("pw123")]),
        ErrorKind::PermissionDenied
    );
    assert_eq!(kind(&gateway, "groups", "create", &[json!("staff")]), ErrorKind::PermissionDenied);

    assert_eq!(ok(&gateway, "session", "push", &[json!("root"), json!("")]), "root");
    ok(&gateway, "users", "create_user", &[json!("carol"), json!("pw123")]);
    assert_eq!(ok(&gateway, "users", "user_exists", &[json!("carol")]), true);
    assert_eq!(ok(&gateway, "users", "verify_password", &[json!("carol"), json!("pw123")]), true);
    assert_eq!(ok(&gateway, "users", "verify_password", &[json!("carol"), json!("nope")]), false);

    ok(&gateway, "groups", "create", &[json!("staff")]);
    assert_eq!(ok(&gateway, "groups", "add_member", &[json!("staff"), json!("carol")]), true);
    assert_eq!(
        ok(&gateway, "groups", "groups_for_user", &[json!("carol")]),
        json!(["carol", "staff"])
    );
    assert_eq!(ok(&gateway, "groups", "remove_member", &[json!("staff"), json!("carol")]), true);

    assert_eq!(ok(&gateway, "session", "stack", &[]), json!(["Guest", "root"]));
    assert_eq!(ok(&gateway, "session", "pop", &[]), "Guest");
    assert_eq!(kind(&gateway, "session", "pop", &[]), ErrorKind::InvalidArgument);
}

#[test]
fn session_push_checks_the_password() {
    let (gateway, _) = booted();
    ok(&gateway, "users", "first_time_setup", &[json!("alice"), json!("alicepw"), json!("rootpw")]);
    assert_eq!(
        kind(&gateway, "session", "push", &[json!("alice"), json!("wrong")]),
        ErrorKind::AuthenticationFailed
    );
    assert_eq!(ok(&gateway, "session", "push", &[json!("alice"), json!("alicepw")]), "alice");
    assert_eq!(ok(&gateway, "session", "cwd", &[]), "/home/alice");
}

#[test]
fn executor_and_resume() {
    let (gateway, _) = booted();
    let outcome = ok(&gateway, "executor", "execute", &[json!("echo hi there")]);
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["output"], json!(["hi there"]));

    let piped = ok(&gateway, "executor", "execute", &[json!("wc -l"), json!("a\nb\nc")]);
    assert_eq!(piped["output"][0], "3");

    let asked = ok(&gateway, "executor", "execute", &[json!("su root")]);
    assert!(asked.get("effect").is_none());
    assert_eq!(ok(&gateway, "session", "current_user", &[]), "root");

    let asked = ok(&gateway, "executor", "execute", &[json!("passwd")]);
    assert_eq!(asked["effect"]["effect"], "passwd");
    assert_eq!(asked["prompts"].as_array().map(Vec::len), Some(2));
    let done = ok(
        &gateway,
        "executor",
        "resume",
        &[asked["effect"].clone(), json!(["rootpw", "rootpw"])],
    );
    assert_eq!(done["output"], json!(["Password updated for root."]));
    assert_eq!(ok(&gateway, "users", "has_password", &[json!("root")]), true);

    assert_eq!(
        kind(&gateway, "executor", "resume", &[json!({"effect": "beep"}), json!([])]),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        kind(&gateway, "executor", "execute", &[json!("frobnicate")]),
        ErrorKind::CommandNotFound
    );
}

#[test]
fn shell_state_domains() {
    let (gateway, _) = booted();
    ok(&gateway, "executor", "execute", &[json!("pwd")]);
    assert_eq!(ok(&gateway, "history", "list", &[]), json!(["pwd"]));
    assert_eq!(ok(&gateway, "history", "add", &[json!("ls")]), true);
    assert_eq!(ok(&gateway, "history", "previous", &[]), "ls");
    assert_eq!(ok(&gateway, "history", "search", &[json!("pw"), json!(true)]), "pwd");
    ok(&gateway, "history", "clear", &[]);
    assert_eq!(ok(&gateway, "history", "list", &[]), json!([]));

    ok(&gateway, "alias", "set", &[json!("gs"), json!("ls -l")]);
    assert_eq!(ok(&gateway, "alias", "get", &[json!("gs")]), "ls -l");
    assert_eq!(ok(&gateway, "alias", "remove", &[json!("gs")]), true);
    assert_eq!(ok(&gateway, "alias", "get", &[json!("gs")]), Value::Null);

    ok(&gateway, "env", "set", &[json!("COLOR"), json!("blue")]);
    assert_eq!(ok(&gateway, "env", "get", &[json!("COLOR")]), "blue");
    assert_eq!(ok(&gateway, "env", "push", &[]), 2);
    ok(&gateway, "env", "set", &[json!("COLOR"), json!("red")]);
    assert_eq!(ok(&gateway, "env", "pop", &[]), true);
    assert_eq!(ok(&gateway, "env", "get", &[json!("COLOR")]), "blue");
    assert_eq!(ok(&gateway, "env", "list", &[])["USER"], "Guest");
    assert_eq!(kind(&gateway, "env", "set", &[json!("1BAD"), json!("x")]), ErrorKind::InvalidArgument);
}

#[test]
fn sudo_and_jobs_domains() {
    let (gateway, _) = booted();
    ok(&gateway, "users", "first_time_setup", &[json!("alice"), json!("alicepw"), json!("rootpw")]);
    assert_eq!(
        ok(&gateway, "sudo", "can_user_run_command", &[json!("alice"), json!("ls /root")]),
        true
    );
    assert_eq!(
        ok(&gateway, "sudo", "can_user_run_command", &[json!("Guest"), json!("ls")]),
        false
    );
    assert_eq!(
        kind(&gateway, "sudo", "update_timestamp", &[json!("alice"), json!("bad")]),
        ErrorKind::AuthenticationFailed
    );
    assert_eq!(ok(&gateway, "sudo", "is_timestamp_valid", &[json!("alice")]), false);
    ok(&gateway, "sudo", "update_timestamp", &[json!("alice"), json!("alicepw")]);
    assert_eq!(ok(&gateway, "sudo", "is_timestamp_valid", &[json!("alice")]), true);
    ok(&gateway, "sudo", "clear_timestamp", &[json!("alice")]);
    assert_eq!(ok(&gateway, "sudo", "is_timestamp_valid", &[json!("alice")]), false);

    ok(&gateway, "executor", "execute", &[json!("echo later &")]);
    let listed = ok(&gateway, "jobs", "list", &[]);
    assert_eq!(listed[0]["command"], "echo later");
    ok(&gateway, "jobs", "signal", &[json!("%1"), json!("STOP")]);
    assert_eq!(ok(&gateway, "jobs", "list", &[])[0]["status"], "paused");
    assert_eq!(ok(&gateway, "jobs", "poll", &[]), json!([]));
    ok(&gateway, "jobs", "signal", &[json!(1), json!("CONT")]);
    let reports = ok(&gateway, "jobs", "poll", &[]);
    assert_eq!(reports[0]["output"], json!(["later"]));
    assert_eq!(ok(&gateway, "jobs", "list", &[]), json!([]));
}

#[test]
fn unknown_names_and_bad_arguments() {
    let (gateway, _) = booted();
    assert_eq!(kind(&gateway, "editor", "open", &[]), ErrorKind::InvalidArgument);
    assert_eq!(kind(&gateway, "users", "explode", &[]), ErrorKind::InvalidArgument);
    let response = gateway.call("users", "user_exists", &[json!(42)]);
    assert_eq!(
        response.error.as_deref(),
        Some("user_exists: argument 1 must be a string")
    );
}
