use super::profile::{ContainerProfile, OsFamily};

/// Interactive shells tried in every environment, most likely first.
pub const BASE_CANDIDATES: [&str; 15] = [
    "sh",
    "/bin/sh",
    "/usr/bin/sh",
    "bash",
    "/bin/bash",
    "/usr/bin/bash",
    "ash",
    "/bin/ash",
    "dash",
    "/bin/dash",
    "/usr/bin/dash",
    "busybox sh",
    "/bin/busybox sh",
    "/usr/bin/busybox sh",
    "/bin/busybox ash",
];

/// Used when probing found nothing usable.
pub const FALLBACK_COMMANDS: [&str; 3] = ["sh", "/bin/sh", "cat"];

/// Bare commands worth trying in images that ship no shell at all.
pub const DISTROLESS_COMMANDS: [&str; 2] = ["cat", "echo"];

pub const MAX_PREFERRED_SHELL_LEN: usize = 64;

/// A preferred shell is passed straight to the remote side, so only plain
/// paths and a single argument separator are accepted.
pub fn is_valid_shell(shell: &str) -> bool {
    !shell.trim().is_empty()
        && shell.len() <= MAX_PREFERRED_SHELL_LEN
        && shell
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'/' | b' ' | b'-'))
}

/// Preferred shell (if valid) followed by the base list. Duplicates are kept
/// here; the resolver skips them while probing.
pub fn superset(preferred: Option<&str>) -> Vec<String> {
    let mut list = Vec::with_capacity(BASE_CANDIDATES.len() + 1);
    if let Some(shell) = preferred.map(str::trim).filter(|s| is_valid_shell(s)) {
        list.push(shell.to_string());
    }
    list.extend(BASE_CANDIDATES.iter().map(|s| s.to_string()));
    list
}

/// Reorder `candidates` for `profile`. The first `pinned` entries (the
/// caller's preferred shell) keep their place; the rest are stably sorted
/// so equal ranks keep list order.
pub fn rank(candidates: &mut Vec<String>, pinned: usize, profile: &ContainerProfile) {
    let pinned = pinned.min(candidates.len());
    candidates[pinned..].sort_by_key(|command| score(profile.os_family, command));

    if profile.os_family == OsFamily::Distroless {
        for command in DISTROLESS_COMMANDS {
            candidates.push(command.to_string());
        }
    }
}

fn score(family: OsFamily, command: &str) -> u8 {
    let kind = ShellKind::of(command);
    match family {
        OsFamily::Alpine => match kind {
            ShellKind::Ash | ShellKind::Busybox => 0,
            ShellKind::Sh => 1,
            _ => 2,
        },
        OsFamily::BusyBox => match kind {
            ShellKind::Busybox => 0,
            ShellKind::Ash => 1,
            ShellKind::Sh => 2,
            _ => 3,
        },
        OsFamily::Debian | OsFamily::Rhel => match kind {
            ShellKind::Bash => 0,
            ShellKind::Sh => 1,
            _ => 2,
        },
        OsFamily::Distroless | OsFamily::Unknown => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShellKind {
    Sh,
    Bash,
    Ash,
    Dash,
    Busybox,
    Other,
}

impl ShellKind {
    fn of(command: &str) -> Self {
        let program = command.split_whitespace().next().unwrap_or_default();
        match program.rsplit('/').next().unwrap_or(program) {
            "sh" => ShellKind::Sh,
            "bash" => ShellKind::Bash,
            "ash" => ShellKind::Ash,
            "dash" => ShellKind::Dash,
            "busybox" => ShellKind::Busybox,
            _ => ShellKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(os_family: OsFamily) -> ContainerProfile {
        ContainerProfile {
            os_family,
            ..ContainerProfile::default()
        }
    }

    #[test]
    fn test_preferred_shell_validation() {
        assert!(is_valid_shell("/usr/local/bin/fish"));
        assert!(is_valid_shell("busybox sh"));
        assert!(!is_valid_shell("bash; rm -rf /"));
        assert!(!is_valid_shell("$(reboot)"));
        assert!(!is_valid_shell("   "));
        assert!(!is_valid_shell(&"a".repeat(65)));
        assert!(is_valid_shell(&"a".repeat(64)));
    }

    #[test]
    fn test_superset_puts_preferred_first() {
        let list = superset(Some("zsh"));
        assert_eq!(list.len(), 16);
        assert_eq!(list[0], "zsh");
        assert_eq!(list[1], "sh");

        let list = superset(Some("zsh && id"));
        assert_eq!(list.len(), 15);
        assert_eq!(list[0], "sh");
    }

    #[test]
    fn test_alpine_prefers_ash_over_bash() {
        let mut list = superset(None);
        rank(&mut list, 0, &profile(OsFamily::Alpine));

        let pos = |cmd: &str| list.iter().position(|c| c == cmd).unwrap();
        assert_eq!(list[0], "ash");
        assert!(pos("/bin/busybox sh") < pos("sh"));
        assert!(pos("sh") < pos("bash"));
        // Stable: relative order inside a rank is unchanged.
        assert!(pos("ash") < pos("/bin/ash"));
        assert!(pos("busybox sh") < pos("/bin/busybox sh"));
    }

    #[test]
    fn test_debian_prefers_bash_and_keeps_preferred() {
        let mut list = superset(Some("zsh"));
        rank(&mut list, 1, &profile(OsFamily::Debian));
        assert_eq!(list[0], "zsh");
        assert_eq!(&list[1..4], &["bash", "/bin/bash", "/usr/bin/bash"]);
    }

    #[test]
    fn test_distroless_appends_bare_commands() {
        let mut list = superset(None);
        rank(&mut list, 0, &profile(OsFamily::Distroless));
        assert_eq!(&list[..15], &BASE_CANDIDATES.map(String::from));
        assert_eq!(&list[15..], &["cat", "echo"]);
    }

    #[test]
    fn test_unknown_keeps_order() {
        let mut list = superset(None);
        rank(&mut list, 0, &profile(OsFamily::Unknown));
        assert_eq!(list, BASE_CANDIDATES.map(String::from).to_vec());
    }
}
