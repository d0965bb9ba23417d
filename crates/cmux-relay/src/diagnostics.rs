//! User-facing failure messages, written inline into the terminal before the
//! session closes.

use crate::error::ErrorKind;
use crate::executor::ExecTarget;
use crate::shell::{ContainerProfile, OsFamily};

/// What the bridge knew when it gave up.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub target: &'a ExecTarget,
    pub attempted: &'a [String],
    pub profile: &'a ContainerProfile,
    /// Whether the environment was actually probed.
    pub probed: bool,
    pub detail: Option<&'a str>,
}

/// Format the message for a terminal failure. Transport closures and protocol
/// errors are never shown to the user and yield `None`.
pub fn render(kind: ErrorKind, ctx: &FailureContext<'_>) -> Option<String> {
    let mut lines = Vec::new();
    match kind {
        ErrorKind::TransportClosed | ErrorKind::ProtocolError => return None,
        ErrorKind::CommandNotFound => command_not_found(ctx, &mut lines),
        ErrorKind::PermissionDenied => {
            lines.push(format!(
                "Permission denied while starting a shell in {}.",
                ctx.target
            ));
            push_attempted(ctx, &mut lines);
            push_detail(ctx, &mut lines);
            lines.push(String::new());
            lines.push("The shell binary exists but the runtime refused to execute it.".to_string());
            lines.push("Check the security context of the target:".to_string());
            lines.push("  - the user it runs as can read and execute the shell".to_string());
            lines.push("  - the filesystem holding the shell is not mounted noexec".to_string());
            lines.push("  - seccomp, AppArmor or SELinux profiles allow exec".to_string());
        }
        ErrorKind::Timeout => {
            lines.push(format!("Timed out starting a shell in {}.", ctx.target));
            push_detail(ctx, &mut lines);
            lines.push("This is usually transient. Reconnect to try again.".to_string());
        }
        ErrorKind::TargetUnavailable => {
            lines.push(format!("{} is not available.", ctx.target));
            push_detail(ctx, &mut lines);
            lines.push(String::new());
            lines.push("Troubleshooting:".to_string());
            lines.push(format!("  1. Check that {} exists and is running.", ctx.target));
            lines.push("  2. Check that the name or id is spelled correctly.".to_string());
            lines.push("  3. Check that the container runtime is reachable from the relay.".to_string());
        }
        ErrorKind::Failed => {
            lines.push(format!("Could not start a shell in {}.", ctx.target));
            push_attempted(ctx, &mut lines);
            push_detail(ctx, &mut lines);
        }
    }
    Some(frame(&lines))
}

fn command_not_found(ctx: &FailureContext<'_>, lines: &mut Vec<String>) {
    lines.push(format!("No usable shell found in {}.", ctx.target));
    push_attempted(ctx, lines);
    lines.push(String::new());

    let profile = ctx.profile;
    if !ctx.probed {
        lines.push("The environment could not be inspected.".to_string());
    } else {
        lines.push(format!(
            "The environment looks {}.",
            profile.os_family.label()
        ));
    }

    match profile.os_family {
        OsFamily::Distroless => {
            lines.push("Distroless images ship without a shell. Options:".to_string());
            lines.push("  - use the image's debug variant, which includes busybox".to_string());
            lines.push("  - attach a debug container that shares the process namespace".to_string());
        }
        OsFamily::BusyBox => {
            lines.push("BusyBox is present but none of its shell applets ran.".to_string());
            lines.push("Check that the image's busybox build includes sh or ash.".to_string());
        }
        _ => match profile.install_hint("bash") {
            Some(hint) => lines.push(format!("Install a shell in the image, e.g. `{}`.", hint)),
            None => lines.push("Install a POSIX shell in the image.".to_string()),
        },
    }
    lines.push("A different shell can be requested with the `shell` query parameter.".to_string());
}

fn push_attempted(ctx: &FailureContext<'_>, lines: &mut Vec<String>) {
    if !ctx.attempted.is_empty() {
        lines.push(format!(
            "Tried {} command(s): {}",
            ctx.attempted.len(),
            ctx.attempted.join(", ")
        ));
    }
}

fn push_detail(ctx: &FailureContext<'_>, lines: &mut Vec<String>) {
    if let Some(detail) = ctx.detail {
        lines.push(format!("Last error: {}", detail));
    }
}

/// Raw-mode terminals do not return the carriage on `\n`, so every line is
/// started with `\r\n` explicitly.
fn frame(lines: &[String]) -> String {
    let mut out = String::from("\r\n");
    for line in lines {
        out.push_str("\r\n");
        out.push_str(line);
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::PackageManager;

    fn context<'a>(
        target: &'a ExecTarget,
        attempted: &'a [String],
        profile: &'a ContainerProfile,
    ) -> FailureContext<'a> {
        FailureContext {
            target,
            attempted,
            profile,
            probed: true,
            detail: None,
        }
    }

    #[test]
    fn test_command_not_found_lists_attempts() {
        let target = ExecTarget::new("web-1");
        let attempted = vec!["sh".to_string(), "/bin/busybox sh".to_string()];
        let profile = ContainerProfile {
            os_family: OsFamily::Alpine,
            package_manager: Some(PackageManager::Apk),
            ..ContainerProfile::default()
        };

        let text = render(
            ErrorKind::CommandNotFound,
            &context(&target, &attempted, &profile),
        )
        .unwrap();

        assert!(text.contains("Tried 2 command(s): sh, /bin/busybox sh"));
        assert!(text.contains("Alpine Linux"));
        assert!(text.contains("apk add --no-cache bash"));
    }

    #[test]
    fn test_every_line_starts_with_carriage_return() {
        let target = ExecTarget::new("web-1");
        let profile = ContainerProfile::default();
        let text = render(ErrorKind::TargetUnavailable, &context(&target, &[], &profile)).unwrap();

        assert!(text.starts_with("\r\n"));
        let bytes = text.as_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if *b == b'\n' {
                assert!(i > 0 && bytes[i - 1] == b'\r', "bare newline at {}", i);
            }
        }
    }

    #[test]
    fn test_distroless_guidance() {
        let target = ExecTarget::new("api");
        let profile = ContainerProfile {
            os_family: OsFamily::Distroless,
            is_distroless: true,
            ..ContainerProfile::default()
        };
        let text = render(
            ErrorKind::CommandNotFound,
            &context(&target, &["sh".to_string()], &profile),
        )
        .unwrap();
        assert!(text.contains("debug variant"));
    }

    #[test]
    fn test_permission_denied_mentions_security_context() {
        let target = ExecTarget::new("api");
        let profile = ContainerProfile::default();
        let mut ctx = context(&target, &[], &profile);
        ctx.detail = Some("exec /bin/sh: permission denied");

        let text = render(ErrorKind::PermissionDenied, &ctx).unwrap();
        assert!(text.contains("security context"));
        assert!(text.contains("Last error: exec /bin/sh: permission denied"));
    }

    #[test]
    fn test_silent_kinds() {
        let target = ExecTarget::new("api");
        let profile = ContainerProfile::default();
        let ctx = context(&target, &[], &profile);
        assert!(render(ErrorKind::TransportClosed, &ctx).is_none());
        assert!(render(ErrorKind::ProtocolError, &ctx).is_none());
    }
}
