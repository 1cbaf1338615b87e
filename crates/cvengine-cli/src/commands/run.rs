use super::{json_pretty, load_config, parse_extra_vars, CommandError, EXIT_SUCCESS};
use console::Style;
use cvengine_core::{install_signal_handler, run_container_validation, RunReport, Stage};
use cvengine_remote::CancelToken;
use cvengine_schema::VarMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug)]
pub struct RunArgs {
    pub image_url: String,
    pub metadata_url: String,
    pub config: String,
    pub artifacts_dir: PathBuf,
    pub extra_vars: Option<String>,
}

pub fn run(args: &RunArgs, json: bool) -> Result<u8, CommandError> {
    let config = load_config(&args.config)?;
    let extra_vars = match args.extra_vars.as_deref() {
        Some(raw) => parse_extra_vars(raw)?,
        None => VarMap::new(),
    };
    std::fs::create_dir_all(&args.artifacts_dir).map_err(|e| {
        CommandError::at(
            Stage::Configuration,
            format!(
                "cannot create artifacts directory {}: {e}",
                args.artifacts_dir.display()
            ),
        )
    })?;

    debug!(
        "artifacts go to {}, {} extra vars",
        args.artifacts_dir.display(),
        extra_vars.len()
    );

    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone());
    let outcome = run_container_validation(
        &args.image_url,
        &args.metadata_url,
        config,
        &args.artifacts_dir,
        extra_vars,
        cancel,
    );

    match outcome {
        Ok(report) => {
            print_report(&report, json)?;
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if json {
                let payload = serde_json::json!({
                    "status": "failed",
                    "stage": e.stage(),
                    "error": e.to_string(),
                });
                println!("{}", json_pretty(&payload)?);
            }
            Err(e.into())
        }
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<(), String> {
    if json {
        let mut payload = serde_json::to_value(report).map_err(|e| e.to_string())?;
        payload["status"] = "passed".into();
        println!("{}", json_pretty(&payload)?);
        return Ok(());
    }
    let ok = Style::new().green().bold();
    let duration = report.finished_at - report.started_at;
    println!(
        "{} {} on {} ({})",
        ok.apply_to("✓ validation passed:"),
        report.host_type,
        report.environment,
        report.run_id.short()
    );
    for playbook in &report.playbooks {
        println!("  playbook  {playbook}");
    }
    println!("  artifacts {}", report.artifacts_dir.display());
    println!("  duration  {}s", duration.num_seconds());
    Ok(())
}
