//! Parses the upgrade dry run into a plan, and classifies that plan.
//!
//! The classifier decides the two questions that change the shape of the
//! whole session: does the change set touch the running kernel (forcing a
//! kernel-first upgrade and a second pass after reboot), and does it touch
//! this tool itself (forcing the self-bootstrap hand-off).

use crate::{events::Reporter, misc, session::Session};
use as_result::IntoResult;
use serde_derive::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read {name} from the kernel")]
    Sysctl {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to query which package owns {file}")]
    KernelOwner {
        file: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to determine the kernel package from {output:?}")]
    KernelUnparsed { output: String },

    #[error("failed to query the kernel package metadata")]
    KernelInfo(#[source] io::Error),

    #[error("kernel package metadata has no name field")]
    KernelNameMissing,

    #[error("failed to run the upgrade dry run")]
    DryRun(#[source] io::Error),

    #[error("failed to query the remote repository build version")]
    RemoteQuery(#[source] io::Error),

    #[error("remote repository did not advertise a build version: {output:?}")]
    RemoteUnparsed { output: String },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NewPkg {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct UpPkg {
    pub name: String,
    #[serde(rename = "old")]
    pub old_version: String,
    #[serde(rename = "new")]
    pub new_version: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RiPkg {
    pub name: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DelPkg {
    pub name: String,
    pub version: String,
}

/// Everything one dry run revealed about the pending change set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct UpdatePlan {
    #[serde(rename = "new")]
    pub new: Vec<NewPkg>,
    #[serde(rename = "upgrade")]
    pub upgraded: Vec<UpPkg>,
    #[serde(rename = "reinstall")]
    pub reinstalled: Vec<RiPkg>,
    #[serde(rename = "delete")]
    pub removed: Vec<DelPkg>,
    #[serde(rename = "kernelup")]
    pub kernel_up: bool,
    #[serde(rename = "kernelpkg")]
    pub kernel_pkg: String,
    #[serde(rename = "selfup")]
    pub self_up: bool,
    #[serde(rename = "selfpkg")]
    pub self_pkg: String,
}

const UP_TO_DATE: &str = "Your packages are up to date";

/// Whether a dry-run transcript contains any pending change at all.
pub fn have_updates(transcript: &str) -> bool { !transcript.contains(UP_TO_DATE) }

/// Captures the dry-run transcript. The package tool exits non-zero when
/// updates are pending, so only a failure to run it at all is an error.
pub async fn dry_run(session: &Session) -> Result<String, PlanError> {
    let output = session
        .pkg_conf()
        .args(&["upgrade", "-n"])
        .output()
        .await
        .map_err(PlanError::DryRun)?;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

enum Section {
    None,
    New,
    Upgraded,
    Reinstalled,
    Removed,
}

/// Parses a dry-run transcript. Lines which do not carry the expected token
/// count are skipped rather than failing the whole parse.
pub fn parse_dry_run(transcript: &str, kernel_pkg: &str) -> UpdatePlan {
    let mut plan = UpdatePlan { kernel_pkg: kernel_pkg.to_owned(), ..Default::default() };
    let mut section = Section::None;

    for line in transcript.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // REINSTALLED must be matched before INSTALLED, which it contains.
        if line.contains("REINSTALLED:") {
            section = Section::Reinstalled;
            continue;
        } else if line.contains("INSTALLED:") {
            section = Section::New;
            continue;
        } else if line.contains("UPGRADED:") {
            section = Section::Upgraded;
            continue;
        } else if line.contains("REMOVED:") {
            section = Section::Removed;
            continue;
        }

        match section {
            Section::New => {
                if let Some((name, version)) = name_version(line) {
                    plan.new.push(NewPkg { name, version });
                }
            }
            Section::Removed => {
                if let Some((name, version)) = name_version(line) {
                    plan.removed.push(DelPkg { name, version });
                }
            }
            Section::Upgraded => {
                if !line.contains(" -> ") {
                    continue;
                }

                let fields = line.split_whitespace().collect::<Vec<&str>>();
                if fields.len() < 4 {
                    continue;
                }

                plan.upgraded.push(UpPkg {
                    name: fields[0].trim_end_matches(':').to_owned(),
                    old_version: fields[1].to_owned(),
                    new_version: fields[3].to_owned(),
                });
            }
            Section::Reinstalled => {
                if let Some(start) = line.find(" (") {
                    let reason = line[start + 2..].trim_end_matches(')');
                    plan.reinstalled.push(RiPkg {
                        name: line[..start].to_owned(),
                        reason: reason.to_owned(),
                    });
                }
            }
            Section::None => (),
        }
    }

    plan.kernel_up =
        !kernel_pkg.is_empty() && plan.upgraded.iter().any(|pkg| pkg.name == kernel_pkg);

    if plan.upgraded.iter().any(|pkg| pkg.name == crate::SELF_PACKAGE) {
        plan.self_up = true;
        plan.self_pkg = crate::SELF_PACKAGE.to_owned();
    }

    plan
}

/// Resolves the human name of the package owning the currently booted kernel.
///
/// Every step here is fatal to the session: without the kernel package name
/// the upgrade ordering cannot be decided safely.
pub async fn kernel_package(session: &Session) -> Result<String, PlanError> {
    let bootfile = sysctl("kern.bootfile").await?;

    let output = session
        .pkg()
        .args(&["which", bootfile.as_str()])
        .output()
        .await
        .map_err(|source| PlanError::KernelOwner { file: bootfile.clone(), source })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let ident = owning_package(&stdout)
        .ok_or_else(|| PlanError::KernelUnparsed { output: stdout.clone() })?
        .to_owned();

    let output = session
        .pkg()
        .args(&["info", ident.as_str()])
        .output()
        .await
        .map_err(PlanError::KernelInfo)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let kernel = name_field(&stdout).ok_or(PlanError::KernelNameMissing)?;

    info!("booted kernel belongs to package {}", kernel);
    Ok(kernel)
}

/// Compares the host kernel build against the build the remote repository
/// was compiled for. A delta means the repository targets a different ABI,
/// which forces full-update mode and kernel-first ordering.
pub async fn host_abi_changed(
    session: &Session,
    reporter: &Reporter,
) -> Result<bool, PlanError> {
    let local = sysctl("kern.osreldate").await?;

    let output = session
        .pkg_conf()
        .args(&["rquery", "-U", "%At=%Av", "ports-mgmt/pkg"])
        .output()
        .await
        .map_err(PlanError::RemoteQuery)?;

    output.status.into_result().map_err(PlanError::RemoteQuery)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let remote = remote_build(&stdout)
        .ok_or_else(|| PlanError::RemoteUnparsed { output: stdout.clone().into_owned() })?;

    if local != remote {
        reporter.info(fomat!("Remote ABI change detected: " (local) " -> " (remote)));
        return Ok(true);
    }

    Ok(false)
}

async fn sysctl(name: &'static str) -> Result<String, PlanError> {
    misc::sysctl(name).await.map_err(|source| PlanError::Sysctl { name, source })
}

// `pkg which` reports "<file> was installed by package <pkg>".
fn owning_package(output: &str) -> Option<&str> {
    let ident = output.split_whitespace().nth(5)?;
    if ident.is_empty() {
        None
    } else {
        Some(ident)
    }
}

fn name_field(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with("Name"))
        .and_then(|line| line.split_whitespace().nth(2))
        .map(String::from)
}

fn remote_build(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("FreeBSD_version="))
        .and_then(|line| line.splitn(2, '=').nth(1))
}

fn name_version(line: &str) -> Option<(String, String)> {
    if !line.contains(": ") {
        return None;
    }

    let mut fields = line.split_whitespace();
    let name = fields.next()?.trim_end_matches(':');
    let version = fields.next()?;

    Some((name.to_owned(), version.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const TRANSCRIPT: &str = r#"Updating Update repository catalogue...
Checking for upgrades (7 candidates): .......
The following 7 package(s) will be affected (of 0 checked):

New packages to be INSTALLED:
	zstd: 1.5.2
	libedit: 3.1.20210910

Installed packages to be UPGRADED:
	curl: 7.83.0 -> 7.84.0
	os-generic-kernel: 13.0 -> 13.1
	snapup: 1.0.0 -> 1.0.1

Installed packages to be REINSTALLED:
	pcre-8.45 (option added)

Installed packages to be REMOVED:
	gnome-mines: 40.0

Number of packages to be installed: 2
"#;

    #[test]
    fn full_transcript() {
        let plan = parse_dry_run(TRANSCRIPT, "os-generic-kernel");

        assert_eq!(
            plan.new,
            vec![
                NewPkg { name: "zstd".into(), version: "1.5.2".into() },
                NewPkg { name: "libedit".into(), version: "3.1.20210910".into() },
            ]
        );
        assert_eq!(plan.upgraded.len(), 3);
        assert_eq!(
            plan.upgraded[0],
            UpPkg {
                name: "curl".into(),
                old_version: "7.83.0".into(),
                new_version: "7.84.0".into()
            }
        );
        assert_eq!(
            plan.reinstalled,
            vec![RiPkg { name: "pcre-8.45".into(), reason: "option added".into() }]
        );
        assert_eq!(
            plan.removed,
            vec![DelPkg { name: "gnome-mines".into(), version: "40.0".into() }]
        );
    }

    #[test]
    fn kernel_and_self_classification() {
        let plan = parse_dry_run(TRANSCRIPT, "os-generic-kernel");
        assert!(plan.kernel_up);
        assert!(plan.self_up);
        assert_eq!(plan.self_pkg, crate::SELF_PACKAGE);
    }

    #[test]
    fn kernel_not_affected() {
        let plan = parse_dry_run(TRANSCRIPT, "os-zol-kernel");
        assert!(!plan.kernel_up);
        assert_eq!(plan.kernel_pkg, "os-zol-kernel");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let transcript = "Installed packages to be UPGRADED:
	curl:
	broken
	vim: 9.0 -> 9.1
";
        let plan = parse_dry_run(transcript, "");
        assert_eq!(plan.upgraded.len(), 1);
        assert_eq!(plan.upgraded[0].name, "vim");
    }

    #[test]
    fn reinstall_section_is_not_confused_with_install() {
        let transcript = "Installed packages to be REINSTALLED:
	pkg-1.18.4 (ABI changed)
";
        let plan = parse_dry_run(transcript, "");
        assert!(plan.new.is_empty());
        assert_eq!(plan.reinstalled.len(), 1);
        assert_eq!(plan.reinstalled[0].reason, "ABI changed");
    }

    #[test_case("Your packages are up to date", false; "up to date")]
    #[test_case("Installed packages to be UPGRADED:", true; "upgrades pending")]
    fn update_detection(transcript: &str, expected: bool) {
        assert_eq!(have_updates(transcript), expected);
    }

    #[test]
    fn owning_package_field() {
        assert_eq!(
            owning_package("/boot/kernel/kernel was installed by package os-generic-kernel-13.1"),
            Some("os-generic-kernel-13.1")
        );
        assert_eq!(owning_package("no such file"), None);
    }

    #[test]
    fn name_field_parse() {
        let output = "os-generic-kernel-13.1
Name           : os-generic-kernel
Version        : 13.1
";
        assert_eq!(name_field(output), Some("os-generic-kernel".into()));
    }

    #[test]
    fn remote_build_parse() {
        let output = "FreeBSD_version=1301000\n";
        assert_eq!(remote_build(output), Some("1301000"));
        assert_eq!(remote_build("annotations: none"), None);
    }
}
