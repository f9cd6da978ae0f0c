//! Background jobs and scripts driven through the kernel.

mod common;

use kestrel_platform::MemoryStorage;
use kestrel_shell::{Effect, JobStatus};
use kestrel_types::ErrorKind;

use common::{boot, run};

fn write_script(k: &mut kestrel_kernel::Kernel, path: &str, lines: &[&str]) {
    let mut redirect = ">";
    for line in lines {
        run(k, &format!("echo '{line}' {redirect} {path}"));
        redirect = ">>";
    }
}

#[test]
fn background_command_runs_on_poll() {
    let mut k = boot(&MemoryStorage::new());
    let started = k.execute("echo hi &").unwrap();
    assert!(matches!(started.effect, Some(Effect::Background { job_id: 1, .. })));
    assert!(!started.is_pending());
    assert_eq!(k.jobs().list().len(), 1);

    let reports = k.poll_jobs();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].id, 1);
    assert_eq!(reports[0].output, ["hi"]);
    assert!(reports[0].finished);
    assert!(k.jobs().list().is_empty());
    assert!(k.poll_jobs().is_empty());
}

#[test]
fn background_script_runs_a_line_per_poll() {
    let mut k = boot(&MemoryStorage::new());
    write_script(&mut k, "count.sh", &["echo one", "echo two", "echo three"]);
    run(&mut k, "run count.sh &");

    let first = k.poll_jobs();
    assert!(first[0].output.is_empty());
    assert!(!first[0].finished);

    let reports: Vec<_> = (0..3).map(|_| k.poll_jobs().remove(0)).collect();
    let outputs: Vec<&[String]> = reports.iter().map(|r| r.output.as_slice()).collect();
    assert_eq!(outputs, [["one"], ["two"], ["three"]]);
    let finished: Vec<bool> = reports.iter().map(|r| r.finished).collect();
    assert_eq!(finished, [false, false, true]);
    assert!(k.jobs().list().is_empty());
}

#[test]
fn stopped_jobs_wait_and_killed_jobs_vanish() {
    let mut k = boot(&MemoryStorage::new());
    write_script(&mut k, "slow.sh", &["echo a", "echo b", "echo c"]);
    run(&mut k, "run slow.sh &");
    k.poll_jobs();
    assert_eq!(k.poll_jobs()[0].output, ["a"]);

    run(&mut k, "kill -STOP %1");
    assert_eq!(k.jobs().list()[0].status, JobStatus::Paused);
    assert!(k.poll_jobs().is_empty());

    run(&mut k, "kill -CONT %1");
    assert_eq!(k.poll_jobs()[0].output, ["b"]);

    run(&mut k, "kill %1");
    assert!(k.jobs().list().is_empty());
    assert!(k.poll_jobs().is_empty());
}

#[test]
fn jobs_cannot_switch_sessions() {
    let mut k = boot(&MemoryStorage::new());
    run(&mut k, "su root &");
    let reports = k.poll_jobs();
    let error = reports[0].error.as_ref().unwrap();
    assert!(error.message.contains("background job"));
    assert_eq!(k.current_user(), "Guest");
}

#[test]
fn background_job_keeps_its_own_directory() {
    let mut k = boot(&MemoryStorage::new());
    write_script(&mut k, "walk.sh", &["cd /tmp", "pwd"]);
    run(&mut k, "run walk.sh &");
    k.poll_jobs();
    k.poll_jobs();
    assert_eq!(k.poll_jobs()[0].output, ["/tmp"]);
    assert_eq!(k.cwd(), "/home/Guest");
}

#[test]
fn failing_script_line_is_reported_with_its_number() {
    let mut k = boot(&MemoryStorage::new());
    write_script(&mut k, "broken.sh", &["echo start", "frobnicate", "echo unreachable"]);
    let err = k.execute("run broken.sh").unwrap_err();
    assert_eq!(err.kind, ErrorKind::CommandNotFound);
    assert!(err.message.starts_with("error on line 2: frobnicate"));
}

#[test]
fn script_arguments_are_substituted() {
    let mut k = boot(&MemoryStorage::new());
    write_script(&mut k, "greet.sh", &["echo hello $1", "echo $# args"]);
    let out = k.execute("run greet.sh world extra").unwrap();
    assert_eq!(out.output, ["hello world", "2 args"]);
}

#[test]
fn recursive_script_hits_the_depth_limit() {
    let mut k = boot(&MemoryStorage::new());
    write_script(&mut k, "loop.sh", &["run loop.sh"]);
    let err = k.execute("run loop.sh").unwrap_err();
    assert_eq!(err.kind, ErrorKind::ScriptLimitExceeded);
}

#[test]
fn script_feeds_following_lines_as_passwords() {
    let mut k = boot(&MemoryStorage::new());
    run(&mut k, "su root");
    write_script(&mut k, "/root/setup.sh", &["useradd erin", "secret9", "secret9"]);
    let out = k.execute("run /root/setup.sh").unwrap();
    assert_eq!(out.output, ["User 'erin' created."]);
    assert!(k.users().verify_password("erin", "secret9"));
}
