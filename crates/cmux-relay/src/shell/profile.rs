use std::fmt;

use futures::future::join_all;

use super::ProbeSession;
use crate::error::EXIT_COMMAND_NOT_FOUND;
use crate::executor::ProbeOutcome;

const ALPINE_RELEASE: &str = "/etc/alpine-release";
const DEBIAN_VERSION: &str = "/etc/debian_version";
const REDHAT_RELEASE: &str = "/etc/redhat-release";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsFamily {
    Alpine,
    BusyBox,
    Distroless,
    Debian,
    Rhel,
    #[default]
    Unknown,
}

impl OsFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            OsFamily::Alpine => "alpine",
            OsFamily::BusyBox => "busybox",
            OsFamily::Distroless => "distroless",
            OsFamily::Debian => "debian",
            OsFamily::Rhel => "rhel",
            OsFamily::Unknown => "unknown",
        }
    }

    /// Human-readable name for diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            OsFamily::Alpine => "Alpine Linux",
            OsFamily::BusyBox => "BusyBox-based",
            OsFamily::Distroless => "distroless",
            OsFamily::Debian => "Debian/Ubuntu",
            OsFamily::Rhel => "RHEL/Fedora",
            OsFamily::Unknown => "unrecognized",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apk,
    AptGet,
    Dnf,
    Yum,
    Microdnf,
}

impl PackageManager {
    pub const ALL: [PackageManager; 5] = [
        PackageManager::Apk,
        PackageManager::AptGet,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Microdnf,
    ];

    pub fn binary(self) -> &'static str {
        match self {
            PackageManager::Apk => "apk",
            PackageManager::AptGet => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Microdnf => "microdnf",
        }
    }

    pub fn install_command(self, package: &str) -> String {
        match self {
            PackageManager::Apk => format!("apk add --no-cache {}", package),
            PackageManager::AptGet => {
                format!("apt-get update && apt-get install -y {}", package)
            }
            other => format!("{} install -y {}", other.binary(), package),
        }
    }

    fn is_rhel(self) -> bool {
        matches!(
            self,
            PackageManager::Dnf | PackageManager::Yum | PackageManager::Microdnf
        )
    }
}

/// What detection learned about the remote environment. Built once per
/// session and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerProfile {
    pub os_family: OsFamily,
    pub is_alpine: bool,
    pub is_busybox: bool,
    pub is_distroless: bool,
    pub package_manager: Option<PackageManager>,
    /// Probe binaries that turned out to exist.
    pub available_commands: Vec<String>,
}

impl ContainerProfile {
    /// Command that would install `package` in this environment, if known.
    pub fn install_hint(&self, package: &str) -> Option<String> {
        self.package_manager
            .map(|manager| manager.install_command(package))
    }
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn ran(outcome: &ProbeOutcome) -> bool {
    matches!(outcome, ProbeOutcome::Exited(code) if *code != EXIT_COMMAND_NOT_FOUND)
}

fn missing(outcome: &ProbeOutcome) -> bool {
    matches!(outcome, ProbeOutcome::Exited(code) if *code == EXIT_COMMAND_NOT_FOUND)
}

/// Run the fingerprint and package-manager probes concurrently and classify
/// the environment. Failed or timed out probes simply count as "no answer".
pub(super) async fn detect(probe: &mut ProbeSession<'_>) -> ContainerProfile {
    let mut probes = vec![
        argv(&["cat", ALPINE_RELEASE]),
        argv(&["cat", DEBIAN_VERSION]),
        argv(&["cat", REDHAT_RELEASE]),
        argv(&["busybox"]),
    ];
    probes.extend(
        PackageManager::ALL
            .iter()
            .map(|manager| argv(&[manager.binary(), "--version"])),
    );

    let outcomes = join_all(probes.iter().map(|argv| probe.run(argv))).await;
    for (argv, outcome) in probes.iter().zip(&outcomes) {
        probe.record(argv, outcome.clone());
    }

    let file_exists = |i: usize| matches!(outcomes[i], ProbeOutcome::Exited(0));
    let alpine_release = file_exists(0);
    let debian_version = file_exists(1);
    let redhat_release = file_exists(2);
    let has_cat = outcomes[..3].iter().any(ran);
    let is_busybox = ran(&outcomes[3]);
    let managers: Vec<PackageManager> = PackageManager::ALL
        .iter()
        .zip(&outcomes[4..])
        .filter(|(_, outcome)| ran(outcome))
        .map(|(manager, _)| *manager)
        .collect();
    let package_manager = managers.first().copied();
    let nothing_exists = outcomes.iter().all(missing);

    let os_family = if alpine_release || managers.contains(&PackageManager::Apk) {
        OsFamily::Alpine
    } else if debian_version || managers.contains(&PackageManager::AptGet) {
        OsFamily::Debian
    } else if redhat_release || managers.iter().any(|m| m.is_rhel()) {
        OsFamily::Rhel
    } else if is_busybox {
        OsFamily::BusyBox
    } else if nothing_exists {
        OsFamily::Distroless
    } else {
        OsFamily::Unknown
    };

    let mut available_commands = Vec::new();
    if has_cat {
        available_commands.push("cat".to_string());
    }
    if is_busybox {
        available_commands.push("busybox".to_string());
    }
    available_commands.extend(managers.iter().map(|m| m.binary().to_string()));

    ContainerProfile {
        os_family,
        is_alpine: os_family == OsFamily::Alpine,
        is_busybox,
        is_distroless: os_family == OsFamily::Distroless,
        package_manager,
        available_commands,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;
    use std::time::Duration;

    async fn detect_with(runner: &ScriptedProbe) -> ContainerProfile {
        let mut probe = ProbeSession::new(runner, Duration::from_millis(200));
        detect(&mut probe).await
    }

    #[tokio::test]
    async fn test_detects_alpine() {
        let runner = ScriptedProbe::new()
            .exits("cat /etc/alpine-release", 0)
            .exits("cat /etc/debian_version", 1)
            .exits("cat /etc/redhat-release", 1)
            .exits("busybox", 0)
            .exits("apk --version", 0);

        let profile = detect_with(&runner).await;
        assert_eq!(profile.os_family, OsFamily::Alpine);
        assert!(profile.is_alpine);
        assert!(profile.is_busybox);
        assert_eq!(profile.package_manager, Some(PackageManager::Apk));
        assert_eq!(profile.available_commands, vec!["cat", "busybox", "apk"]);
        assert_eq!(
            profile.install_hint("bash").as_deref(),
            Some("apk add --no-cache bash")
        );
    }

    #[tokio::test]
    async fn test_detects_debian_from_package_manager() {
        let runner = ScriptedProbe::new().exits("apt-get --version", 0);
        let profile = detect_with(&runner).await;
        assert_eq!(profile.os_family, OsFamily::Debian);
        assert_eq!(profile.package_manager, Some(PackageManager::AptGet));
    }

    #[tokio::test]
    async fn test_detects_rhel() {
        let runner = ScriptedProbe::new()
            .exits("cat /etc/redhat-release", 0)
            .exits("microdnf --version", 0);
        let profile = detect_with(&runner).await;
        assert_eq!(profile.os_family, OsFamily::Rhel);
        assert_eq!(profile.package_manager, Some(PackageManager::Microdnf));
    }

    #[tokio::test]
    async fn test_detects_plain_busybox() {
        let runner = ScriptedProbe::new().exits("busybox", 1);
        let profile = detect_with(&runner).await;
        assert_eq!(profile.os_family, OsFamily::BusyBox);
        assert!(profile.is_busybox);
        assert_eq!(profile.install_hint("bash"), None);
    }

    #[tokio::test]
    async fn test_nothing_found_is_distroless() {
        let profile = detect_with(&ScriptedProbe::new()).await;
        assert_eq!(profile.os_family, OsFamily::Distroless);
        assert!(profile.is_distroless);
        assert!(profile.available_commands.is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_probes_are_unknown() {
        let runner = ScriptedProbe::new().failing();
        let profile = detect_with(&runner).await;
        assert_eq!(profile.os_family, OsFamily::Unknown);
        assert!(!profile.is_distroless);
    }
}
