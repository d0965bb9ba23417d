//! Shell discovery for arbitrary, possibly minimal, remote environments.
//!
//! The resolver fingerprints the target, ranks a fixed list of POSIX shell
//! commands for what it found and smoke tests them in order. It never fails:
//! anything it cannot learn degrades to a static fallback list.

mod candidates;
mod profile;

pub use candidates::{is_valid_shell, BASE_CANDIDATES, FALLBACK_COMMANDS};
pub use profile::{ContainerProfile, OsFamily, PackageManager};

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ResolverConfig;
use crate::error::EXIT_COMMAND_NOT_FOUND;
use crate::executor::{command_argv, ProbeOutcome, ProbeRunner};

/// One probe that was run during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRecord {
    pub command: String,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub profile: ContainerProfile,
    /// Commands to attempt, in order.
    pub candidates: Vec<String>,
    /// False when the backend had no probe capability and the list is unverified.
    pub probed: bool,
    pub used_fallback: bool,
    pub probes: Vec<ProbeRecord>,
}

/// Runs probes under the resolver's timeout and keeps a log of them.
pub(crate) struct ProbeSession<'a> {
    runner: &'a dyn ProbeRunner,
    timeout: Duration,
    log: Vec<ProbeRecord>,
}

impl<'a> ProbeSession<'a> {
    pub(crate) fn new(runner: &'a dyn ProbeRunner, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            log: Vec::new(),
        }
    }

    /// A runner that ignores its own timeout still cannot stall resolution.
    pub(crate) async fn run(&self, argv: &[String]) -> ProbeOutcome {
        tokio::time::timeout(self.timeout, self.runner.run_probe(argv, self.timeout))
            .await
            .unwrap_or(ProbeOutcome::TimedOut)
    }

    pub(crate) fn record(&mut self, argv: &[String], outcome: ProbeOutcome) {
        self.log.push(ProbeRecord {
            command: argv.join(" "),
            outcome,
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShellResolver {
    config: ResolverConfig,
}

impl ShellResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub async fn resolve(
        &self,
        preferred: Option<&str>,
        runner: Option<&dyn ProbeRunner>,
    ) -> Resolution {
        let mut list = candidates::superset(preferred);
        let pinned = list.len() - BASE_CANDIDATES.len();

        let Some(runner) = runner else {
            let mut visited = HashSet::new();
            list.retain(|command| visited.insert(command.clone()));
            debug!("[shell] no probe capability, using {} unverified candidates", list.len());
            return Resolution {
                candidates: list,
                ..Resolution::default()
            };
        };

        let mut probe = ProbeSession::new(runner, self.config.probe_timeout);
        let profile = profile::detect(&mut probe).await;
        candidates::rank(&mut list, pinned, &profile);
        debug!("[shell] profile {:?}, ranked {:?}", profile.os_family, list);

        let mut visited = HashSet::new();
        let mut available = Vec::new();
        for command in list {
            if available.len() >= self.config.max_available {
                break;
            }
            if !visited.insert(command.clone()) {
                continue;
            }

            let mut argv = command_argv(&command);
            argv.extend(["-c".to_string(), "exit 0".to_string()]);
            let outcome = probe.run(&argv).await;
            probe.record(&argv, outcome.clone());

            match outcome {
                ProbeOutcome::Exited(EXIT_COMMAND_NOT_FOUND) => {
                    debug!("[shell] {} not found", command);
                }
                // Any other exit means the binary exists, even if it
                // rejected the arguments.
                ProbeOutcome::Exited(_) => available.push(command),
                ProbeOutcome::TimedOut => debug!("[shell] {} timed out", command),
                ProbeOutcome::Failed(reason) => {
                    debug!("[shell] {} probe failed: {}", command, reason)
                }
            }
        }

        let used_fallback = available.is_empty();
        if used_fallback {
            available = FALLBACK_COMMANDS.iter().map(|s| s.to_string()).collect();
        }
        info!(
            "[shell] {} environment, candidates: {:?}{}",
            profile.os_family,
            available,
            if used_fallback { " (fallback)" } else { "" }
        );

        Resolution {
            profile,
            candidates: available,
            probed: true,
            used_fallback,
            probes: probe.log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;

    fn resolver() -> ShellResolver {
        ShellResolver::new(ResolverConfig::default().with_probe_timeout(Duration::from_millis(200)))
    }

    fn smoke_tests(runner: &ScriptedProbe) -> Vec<String> {
        runner
            .calls()
            .into_iter()
            .filter(|call| call.ends_with(" -c exit 0"))
            .collect()
    }

    #[tokio::test]
    async fn test_busybox_only_environment() {
        let runner = ScriptedProbe::new().exits("/bin/busybox sh -c exit 0", 0);

        // "sh" is also in the base list and must only be probed once.
        let resolution = resolver().resolve(Some("sh"), Some(&runner)).await;

        assert_eq!(resolution.candidates, vec!["/bin/busybox sh"]);
        assert!(!resolution.used_fallback);

        let ranked = candidates::superset(Some("sh"));
        let position = ranked.iter().position(|c| c == "/bin/busybox sh").unwrap();
        let duplicates_before = 1;

        let probed = smoke_tests(&runner);
        let success = probed
            .iter()
            .position(|call| call == "/bin/busybox sh -c exit 0")
            .unwrap();
        assert_eq!(success, position - duplicates_before);
        assert_eq!(probed.iter().filter(|c| *c == "sh -c exit 0").count(), 1);
    }

    #[tokio::test]
    async fn test_alpine_ranks_ash_first() {
        let runner = ScriptedProbe::new()
            .exits("cat /etc/alpine-release", 0)
            .exits("apk --version", 0)
            .exits("busybox", 0)
            .exits("sh -c exit 0", 0)
            .exits("/bin/sh -c exit 0", 0)
            .exits("ash -c exit 0", 0)
            .exits("/bin/ash -c exit 0", 0)
            .exits("busybox sh -c exit 0", 0)
            .exits("/bin/busybox sh -c exit 0", 0)
            .exits("/bin/busybox ash -c exit 0", 0);

        let resolution = resolver().resolve(None, Some(&runner)).await;

        assert!(resolution.profile.is_alpine);
        assert_eq!(
            resolution.candidates,
            vec![
                "ash",
                "/bin/ash",
                "busybox sh",
                "/bin/busybox sh",
                "/bin/busybox ash",
                "sh",
                "/bin/sh",
            ]
        );
    }

    #[tokio::test]
    async fn test_misused_command_counts_as_available() {
        let runner = ScriptedProbe::new().exits("bash -c exit 0", 2);
        let resolution = resolver().resolve(None, Some(&runner)).await;
        assert_eq!(resolution.candidates, vec!["bash"]);
    }

    #[tokio::test]
    async fn test_nothing_available_uses_fallback() {
        let resolution = resolver().resolve(None, Some(&ScriptedProbe::new())).await;

        assert!(resolution.probed);
        assert!(resolution.used_fallback);
        assert_eq!(resolution.candidates, vec!["sh", "/bin/sh", "cat"]);
        // Distroless images also get the bare commands tried.
        assert!(resolution
            .probes
            .iter()
            .any(|p| p.command == "cat -c exit 0"));
    }

    #[tokio::test]
    async fn test_failing_probes_never_abort() {
        let runner = ScriptedProbe::new().failing();
        let resolution = resolver().resolve(Some("bash"), Some(&runner)).await;

        assert_eq!(resolution.profile.os_family, OsFamily::Unknown);
        assert_eq!(resolution.candidates, vec!["sh", "/bin/sh", "cat"]);
    }

    #[tokio::test]
    async fn test_stalled_probe_is_dropped() {
        let runner = ScriptedProbe::new()
            .stalls("sh -c exit 0")
            .exits("bash -c exit 0", 0);
        let resolution = resolver().resolve(None, Some(&runner)).await;

        assert_eq!(resolution.candidates, vec!["bash"]);
        assert!(resolution.probes.contains(&ProbeRecord {
            command: "sh -c exit 0".to_string(),
            outcome: ProbeOutcome::TimedOut,
        }));
    }

    #[tokio::test]
    async fn test_stops_after_ten_available() {
        let runner = ScriptedProbe::new().default_exit(0);
        let resolution = resolver().resolve(None, Some(&runner)).await;

        assert_eq!(resolution.candidates.len(), 10);
        assert_eq!(smoke_tests(&runner).len(), 10);
    }

    #[tokio::test]
    async fn test_without_prober_returns_full_list() {
        let resolution = resolver().resolve(Some("sh"), None).await;

        assert!(!resolution.probed);
        assert_eq!(resolution.candidates.len(), 15);
        assert_eq!(resolution.candidates[0], "sh");
        assert_eq!(resolution.candidates[1], "/bin/sh");
    }
}
