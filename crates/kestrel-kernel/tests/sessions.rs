//! Accounts, nested sessions, and sudo elevation through the kernel API.

mod common;

use std::sync::Arc;

use chrono::Duration;
use kestrel_platform::{ManualClock, MemoryStorage};
use kestrel_shell::Effect;
use kestrel_types::ErrorKind;

use common::{boot, boot_with_clock, run, strings};

#[test]
fn useradd_then_su_checks_the_password() {
    let mut k = boot(&MemoryStorage::new());
    run(&mut k, "su root");
    assert_eq!(k.current_user(), "root");
    assert_eq!(k.cwd(), "/home/root");

    let asked = k.execute("useradd bob").unwrap();
    assert!(asked.is_pending());
    assert_eq!(asked.prompts, ["New password for bob:", "Confirm password:"]);
    let created = k
        .resume(asked.effect.unwrap(), strings(&["pass1", "pass1"]))
        .unwrap();
    assert_eq!(created.output, ["User 'bob' created."]);
    assert_eq!(k.vfs().get_node("/home/bob").unwrap().owner, "bob");

    run(&mut k, "logout");
    assert_eq!(k.current_user(), "Guest");

    let asked = k.execute("su bob").unwrap();
    assert_eq!(asked.prompts, ["Password for bob:"]);
    let err = k.resume(asked.effect.unwrap(), strings(&["wrong"])).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
    assert_eq!(k.current_user(), "Guest");

    let asked = k.execute("su bob").unwrap();
    k.resume(asked.effect.unwrap(), strings(&["pass1"])).unwrap();
    assert_eq!(k.current_user(), "bob");
    assert_eq!(k.sessions().entries(), ["Guest", "bob"]);
    assert_eq!(k.cwd(), "/home/bob");

    let log = k.vfs().get_node("/var/log/audit.log").unwrap().content().unwrap();
    assert!(log.contains("root USERADD bob"));
    assert!(log.contains("Guest AUTH_FAILED bob"));
    assert!(log.contains("Guest SU bob"));
}

#[test]
fn useradd_is_root_only() {
    let mut k = boot(&MemoryStorage::new());
    let err = k.execute("useradd carol").unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
    assert!(!k.users().exists("carol"));
}

#[test]
fn mismatched_confirmation_creates_nothing() {
    let mut k = boot(&MemoryStorage::new());
    run(&mut k, "su root");
    let asked = k.execute("useradd dave").unwrap();
    let err = k
        .resume(asked.effect.unwrap(), strings(&["one", "two"]))
        .unwrap_err();
    assert_eq!(err.message, "passwords do not match");
    assert!(!k.users().exists("dave"));
}

#[test]
fn sessions_keep_their_own_directory() {
    let mut k = boot(&MemoryStorage::new());
    run(&mut k, "cd /tmp");
    run(&mut k, "su root");
    run(&mut k, "cd /etc");
    run(&mut k, "logout");
    assert_eq!(k.current_user(), "Guest");
    assert_eq!(k.cwd(), "/tmp");

    let err = k.execute("logout").unwrap_err();
    assert!(err.message.contains("no nested session"));
}

#[test]
fn prompt_expands_user_and_home() {
    let mut k = boot(&MemoryStorage::new());
    assert_eq!(k.prompt(), "Guest@kestrel:~$ ");
    run(&mut k, "cd /tmp");
    assert_eq!(k.prompt(), "Guest@kestrel:/tmp$ ");
    run(&mut k, "su root");
    assert_eq!(k.prompt(), "root@kestrel:~# ");
}

#[test]
fn sudo_remembers_authentication_until_timeout() {
    let clock = Arc::new(ManualClock::default());
    let mut k = boot_with_clock(&MemoryStorage::new(), Arc::clone(&clock));
    k.first_time_setup("alice", "alicepw", "rootpw").unwrap();
    run(&mut k, "su alice alicepw");
    assert_eq!(k.current_user(), "alice");

    let asked = k.execute("sudo whoami").unwrap();
    assert_eq!(asked.prompts, ["[sudo] password:"]);
    let done = k.resume(asked.effect.unwrap(), strings(&["alicepw"])).unwrap();
    assert_eq!(done.output, ["root"]);
    assert_eq!(k.current_user(), "alice");

    clock.advance(Duration::minutes(10));
    let again = k.execute("sudo whoami").unwrap();
    assert!(!again.is_pending());
    assert_eq!(again.output, ["root"]);

    clock.advance(Duration::minutes(16));
    let expired = k.execute("sudo whoami").unwrap();
    assert!(matches!(expired.effect, Some(Effect::SudoExec { .. })));
}

#[test]
fn failed_sudo_does_not_start_a_window() {
    let mut k = boot(&MemoryStorage::new());
    k.first_time_setup("alice", "alicepw", "rootpw").unwrap();
    run(&mut k, "su alice alicepw");

    let asked = k.execute("sudo whoami").unwrap();
    let err = k.resume(asked.effect.unwrap(), strings(&["nope"])).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
    assert!(k.execute("sudo whoami").unwrap().is_pending());
}

#[test]
fn sudo_refuses_users_outside_the_policy() {
    let mut k = boot(&MemoryStorage::new());
    let err = k.execute("sudo whoami").unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
}

#[test]
fn setup_runs_once() {
    let mut k = boot(&MemoryStorage::new());
    k.first_time_setup("alice", "alicepw", "rootpw").unwrap();
    assert!(k.users().has_password("root"));
    assert!(k.groups().members("root").unwrap().contains("alice"));

    let err = k.first_time_setup("mallory", "pw", "pw").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert!(!k.users().exists("mallory"));
}

#[test]
fn failed_setup_leaves_nothing_behind() {
    let mut k = boot(&MemoryStorage::new());
    let err = k.first_time_setup("alice", "alicepw", "").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert!(!k.users().exists("alice"));
    assert!(!k.vfs().exists("/home/alice"));
    assert!(!k.users().has_password("root"));
}

#[test]
fn script_scope_is_popped_after_a_session_switch() {
    let mut k = boot(&MemoryStorage::new());
    run(&mut k, "echo 'LEAK=yes' > switch.sh");
    run(&mut k, "echo 'su root' >> switch.sh");
    run(&mut k, "run switch.sh");
    assert_eq!(k.current_user(), "root");
    assert_eq!(k.env().depth(), 1);

    run(&mut k, "logout");
    assert_eq!(k.current_user(), "Guest");
    assert_eq!(k.env().depth(), 1);
    assert_eq!(k.env().get("LEAK"), None);
    assert_eq!(run(&mut k, "echo [$LEAK]"), ["[]"]);
}

#[test]
fn chain_continues_after_the_prompt_is_answered() {
    let mut k = boot(&MemoryStorage::new());
    k.first_time_setup("alice", "alicepw", "rootpw").unwrap();

    let asked = k.execute("su alice; whoami && echo switched").unwrap();
    assert!(asked.is_pending());
    assert!(asked.output.is_empty());
    let done = k.resume(asked.effect.unwrap(), strings(&["alicepw"])).unwrap();
    assert!(done.output.ends_with(&strings(&["alice", "switched"])));
    assert_eq!(k.current_user(), "alice");

    run(&mut k, "logout");
    let asked = k.execute("su alice && echo yes || echo no").unwrap();
    let done = k.resume(asked.effect.unwrap(), strings(&["wrong"])).unwrap();
    assert_eq!(done.output.last().map(String::as_str), Some("no"));
    assert!(done.output.iter().any(|l| l.contains("authentication failed")));
    assert_eq!(k.current_user(), "Guest");
}
