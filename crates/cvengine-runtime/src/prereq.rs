use std::fmt;

/// Set to `1` to skip prerequisite checks.
pub const SKIP_PREREQS_ENV: &str = "CVENGINE_SKIP_PREREQS";

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

pub fn prereqs_skipped() -> bool {
    std::env::var(SKIP_PREREQS_ENV).is_ok_and(|v| v == "1")
}

const ANSIBLE_HINT: &str =
    "pip install ansible-core | dnf install ansible-core | apt install ansible";

/// The automation runner every platform needs.
pub fn check_runner_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists("ansible-playbook") {
        missing.push(MissingPrereq {
            name: "ansible-playbook",
            purpose: "running validation playbooks",
            install_hint: ANSIBLE_HINT,
        });
    }

    if !command_exists("ansible") {
        missing.push(MissingPrereq {
            name: "ansible",
            purpose: "ad-hoc commands on the execution target",
            install_hint: ANSIBLE_HINT,
        });
    }

    missing
}

/// Tools for remote-shell platforms.
pub fn check_ssh_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    for (name, purpose) in [("ssh", "remote sessions"), ("scp", "artifact transfer")] {
        if !command_exists(name) {
            missing.push(MissingPrereq {
                name,
                purpose,
                install_hint: "dnf install openssh-clients | apt install openssh-client",
            });
        }
    }

    if !command_exists("sshpass") {
        missing.push(MissingPrereq {
            name: "sshpass",
            purpose: "password authentication to provisioned hosts",
            install_hint: "dnf install sshpass | apt install sshpass",
        });
    }

    missing
}

/// The cluster CLI for local-CLI platforms.
pub fn check_cluster_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists("oc") && !std::path::Path::new(crate::cluster::OC_INSTALL_PATH).is_file()
    {
        missing.push(MissingPrereq {
            name: "oc",
            purpose: "managing the OpenShift cluster under test",
            install_hint: "download the OpenShift client to /tmp/oc/oc or put it on PATH",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\ncvengine drives these tools to validate containers.");
    msg
}
