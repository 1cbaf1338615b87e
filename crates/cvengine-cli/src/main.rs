mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::run::RunArgs;
use commands::CommandError;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cvengine",
    version,
    about = "Validate a container image by running its playbooks on a provisioned host"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the validation scenario for an image.
    Run {
        /// Image under test.
        #[arg(long, env = "CV_IMAGE_URL")]
        image_url: String,
        /// URL or path of the scenario metadata document.
        #[arg(long, env = "CV_CVDATA_URL")]
        metadata_url: String,
        /// Run configuration: a YAML or TOML file, or inline YAML.
        #[arg(long, env = "CV_CONFIG")]
        config: String,
        /// Local directory artifacts are copied into.
        #[arg(long, env = "CV_ARTIFACTS_DIRECTORY")]
        artifacts_dir: PathBuf,
        /// Extra variables as a YAML/JSON mapping, or @file.
        #[arg(long, env = "CV_EXTRA_VARS")]
        extra_vars: Option<String>,
    },
    /// Show which scenario a metadata document selects.
    Resolve {
        /// URL or path of the scenario metadata document.
        #[arg(long, env = "CV_CVDATA_URL")]
        metadata_url: String,
        /// Requested host type; without it the default scenario is used.
        #[arg(long)]
        host_type: Option<String>,
        /// Skip TLS certificate verification.
        #[arg(long, default_value_t = false)]
        insecure_tls: bool,
    },
    /// Check for the external tools a run needs.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CVENGINE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Run {
            image_url,
            metadata_url,
            config,
            artifacts_dir,
            extra_vars,
        } => commands::run::run(
            &RunArgs {
                image_url,
                metadata_url,
                config,
                artifacts_dir,
                extra_vars,
            },
            json_output,
        ),
        Commands::Resolve {
            metadata_url,
            host_type,
            insecure_tls,
        } => commands::resolve::run(
            &metadata_url,
            host_type.as_deref(),
            insecure_tls,
            json_output,
        ),
        Commands::Doctor => commands::doctor::run(json_output).map_err(CommandError::from),
        Commands::Completions { shell } => {
            commands::completions::run::<Cli>(shell).map_err(CommandError::from)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
