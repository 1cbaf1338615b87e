use super::{json_pretty, spin_fail, spin_ok, spinner, CommandError, EXIT_SUCCESS};
use cvengine_core::Stage;
use cvengine_remote::{Fetch, HttpFetcher};
use cvengine_schema::{parse_metadata_str, resolve_scenario, ScenarioMetadata};

pub fn run(
    metadata_url: &str,
    host_type: Option<&str>,
    insecure_tls: bool,
    json: bool,
) -> Result<u8, CommandError> {
    let pb = if json {
        None
    } else {
        Some(spinner("fetching scenario metadata..."))
    };
    let metadata = match fetch(metadata_url, insecure_tls) {
        Ok(m) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, &format!("{} scenarios in {metadata_url}", m.scenarios.len()));
            }
            m
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "metadata unavailable");
            }
            return Err(e);
        }
    };

    let scenario = resolve_scenario(&metadata, host_type)
        .map_err(|e| CommandError::at(Stage::Resolution, e))?;

    if json {
        println!("{}", json_pretty(scenario)?);
    } else {
        println!("host_type:     {}", scenario.host_type);
        println!("default:       {}", scenario.is_default);
        println!("instance_name: {}", scenario.instance_name);
        println!("deploy:        {}", scenario.do_container_deploy);
        for (idx, url) in scenario.playbook_urls().iter().enumerate() {
            println!("playbook {idx}:    {url}");
        }
    }
    Ok(EXIT_SUCCESS)
}

fn fetch(url: &str, insecure_tls: bool) -> Result<ScenarioMetadata, CommandError> {
    let text = HttpFetcher::new(insecure_tls)
        .fetch_string(url)
        .map_err(|e| CommandError::at(Stage::Resolution, format!("failed to fetch {url}: {e}")))?;
    parse_metadata_str(&text).map_err(|e| CommandError::at(Stage::Resolution, e))
}
