use crate::metadata::{MetadataError, ScenarioMetadata, TestScenario};
use tracing::debug;

/// Select the scenario a run targets.
///
/// Entries are scanned in document order. With a requested `host_type`, the
/// first entry carrying it wins and nothing else is considered. Only when no
/// host type is requested (absent or blank) does the first entry flagged
/// default apply.
pub fn resolve_scenario<'a>(
    metadata: &'a ScenarioMetadata,
    requested: Option<&str>,
) -> Result<&'a TestScenario, MetadataError> {
    let requested = requested.map(str::trim).filter(|r| !r.is_empty());

    let found = match requested {
        Some(host_type) => {
            let found = metadata.scenarios.iter().find(|s| s.host_type == host_type);
            if found.is_some() {
                debug!("scenario resolved by host_type '{host_type}'");
            }
            found
        }
        None => {
            let found = metadata.scenarios.iter().find(|s| s.is_default);
            if let Some(s) = found {
                debug!("scenario resolved by default flag: '{}'", s.host_type);
            }
            found
        }
    };

    found.ok_or_else(|| MetadataError::ScenarioNotFound {
        requested: requested.map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::parse_metadata_str;

    fn meta(doc: &str) -> ScenarioMetadata {
        parse_metadata_str(doc).unwrap()
    }

    const MIXED: &str = r"
Test:
  - host_type: fedora
    default: true
    instance_name: first-default
  - host_type: atomic
    instance_name: first-atomic
  - host_type: atomic
    instance_name: second-atomic
  - host_type: openshift
    default: true
    instance_name: second-default
";

    #[test]
    fn exact_match_beats_earlier_default() {
        let m = meta(MIXED);
        let s = resolve_scenario(&m, Some("atomic")).unwrap();
        assert_eq!(s.instance_name, "first-atomic");
    }

    #[test]
    fn exact_match_beats_later_default() {
        let m = meta(
            r"
Test:
  - host_type: atomic
  - host_type: fedora
    default: true
",
        );
        let s = resolve_scenario(&m, Some("atomic")).unwrap();
        assert_eq!(s.host_type, "atomic");
    }

    #[test]
    fn first_match_in_document_order() {
        let m = meta(MIXED);
        let s = resolve_scenario(&m, Some("openshift")).unwrap();
        assert_eq!(s.instance_name, "second-default");
    }

    #[test]
    fn absent_request_uses_first_default() {
        let m = meta(MIXED);
        assert_eq!(
            resolve_scenario(&m, None).unwrap().instance_name,
            "first-default"
        );
        assert_eq!(
            resolve_scenario(&m, Some("  ")).unwrap().instance_name,
            "first-default"
        );
    }

    #[test]
    fn unmatched_request_ignores_default() {
        let m = meta(MIXED);
        let err = resolve_scenario(&m, Some("rhel")).unwrap_err();
        assert!(matches!(
            err,
            MetadataError::ScenarioNotFound { requested: Some(ref r) } if r == "rhel"
        ));
    }

    #[test]
    fn unmatched_request_with_leading_default_is_not_found() {
        let m = meta(
            r"
Test:
  - host_type: fedora
    default: true
  - host_type: atomic
",
        );
        assert!(resolve_scenario(&m, Some("rhel")).is_err());
        assert_eq!(resolve_scenario(&m, None).unwrap().host_type, "fedora");
        assert_eq!(resolve_scenario(&m, Some(" atomic ")).unwrap().host_type, "atomic");
    }

    #[test]
    fn no_match_and_no_default_is_not_found() {
        let m = meta(
            r"
Test:
  - host_type: atomic
  - host_type: fedora
",
        );
        let err = resolve_scenario(&m, Some("openshift")).unwrap_err();
        assert!(matches!(
            err,
            MetadataError::ScenarioNotFound { requested: Some(ref r) } if r == "openshift"
        ));
        let err = resolve_scenario(&m, None).unwrap_err();
        assert!(matches!(
            err,
            MetadataError::ScenarioNotFound { requested: None }
        ));
    }

    #[test]
    fn empty_document_is_not_found() {
        let m = meta("Test: []\n");
        assert!(resolve_scenario(&m, Some("atomic")).is_err());
    }
}
