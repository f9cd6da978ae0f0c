//! The in-VFS security audit log.

use chrono::{DateTime, SecondsFormat, Utc};

use kestrel_shell::AuditEvent;
use kestrel_types::error::Result;
use kestrel_vfs::{Credentials, Vfs};

/// Mode given to a freshly created log.
const LOG_MODE: u16 = 0o640;

pub fn format_line(at: DateTime<Utc>, event: &AuditEvent) -> String {
    let stamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let line = format!("{stamp} {} {} {}", event.actor, event.action, event.details);
    line.trim_end().to_string()
}

/// Append `events` to the log at `log_path`, writing as root. The log is
/// created root-owned with mode 640 on first use.
pub fn append(vfs: &mut Vfs, log_path: &str, at: DateTime<Utc>, events: &[AuditEvent]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let root = Credentials::root();
    let created = !vfs.exists(log_path);
    let mut text = vfs
        .get_node(log_path)
        .and_then(|n| n.content())
        .unwrap_or_default()
        .to_string();
    for event in events {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format_line(at, event));
        text.push('\n');
    }
    vfs.create_or_update_file(log_path, &text, &root)?;
    if created {
        vfs.chmod(log_path, LOG_MODE, &root, false)?;
    }
    log::debug!("Appended {} audit event(s)", events.len());
    Ok(())
}
