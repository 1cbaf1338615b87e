use super::{EXIT_FAILURE, EXIT_SUCCESS};
use cvengine_runtime::{
    check_cluster_prereqs, check_runner_prereqs, check_ssh_prereqs, format_missing,
    MissingPrereq,
};

pub fn run(json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    record(
        &mut checks,
        &mut all_pass,
        "runner_prereqs",
        "Automation runner",
        &check_runner_prereqs(),
        true,
    );
    record(
        &mut checks,
        &mut all_pass,
        "ssh_prereqs",
        "Secure-shell tools",
        &check_ssh_prereqs(),
        true,
    );
    // Only cluster platforms need the CLI.
    record(
        &mut checks,
        &mut all_pass,
        "cluster_prereqs",
        "Cluster CLI",
        &check_cluster_prereqs(),
        false,
    );

    print_results(&checks, all_pass, json_output)
}

fn record(
    checks: &mut Vec<Check>,
    all_pass: &mut bool,
    name: &str,
    label: &str,
    missing: &[MissingPrereq],
    required: bool,
) {
    if missing.is_empty() {
        checks.push(Check::pass(name, &format!("{label} available")));
    } else if required {
        *all_pass = false;
        checks.push(Check::fail(name, &format_missing(missing)));
    } else {
        checks.push(Check::warn(name, &format_missing(missing)));
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("cvengine doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                _ => "⚠",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: String,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &str, status: &'static str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }
}
