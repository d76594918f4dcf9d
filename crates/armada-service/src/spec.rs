use armada_core::{DiffStat, Error, Result};
use serde::de::DeserializeOwned;

/// Parse a spec body. Clients send JSON or YAML; the raw text stays
/// authoritative in storage and this parse is re-run on read, so both
/// formats must round-trip.
pub fn parse_spec_body<T: DeserializeOwned>(raw: &str) -> Result<T> {
    match serde_json::from_str(raw) {
        Ok(parsed) => Ok(parsed),
        Err(json_err) => serde_yml::from_str(raw).map_err(|yaml_err| {
            Error::InvalidInput(format!(
                "spec is neither valid JSON ({json_err}) nor valid YAML ({yaml_err})"
            ))
        }),
    }
}

/// Validate a branch template the way git validates ref components.
pub fn validate_branch(branch: &str) -> Result<()> {
    let invalid = branch.is_empty()
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("//")
        || branch.contains('\\')
        || branch
            .chars()
            .any(|c| c.is_ascii_control() || " ~^:?*[".contains(c));

    if invalid {
        return Err(Error::CampaignBranchInvalid);
    }
    Ok(())
}

/// Diff stat of a unified diff: `+`/`-` lines, excluding file headers.
pub fn diff_stat_of(diff: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            stat.added += 1;
        } else if line.starts_with('-') {
            stat.deleted += 1;
        }
    }
    stat
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::{CampaignSpecFields, ChangesetSpecFields};

    #[test]
    fn campaign_spec_parses_from_json_and_yaml() {
        let json = r#"{"name": "gofmt", "description": "Run gofmt", "changesetTemplate": {"branch": "armada/gofmt"}}"#;
        let from_json: CampaignSpecFields = parse_spec_body(json).unwrap();
        assert_eq!(from_json.name, "gofmt");
        assert_eq!(from_json.changeset_template.branch, "armada/gofmt");

        let yaml = "name: gofmt\ndescription: Run gofmt\nchangesetTemplate:\n  branch: armada/gofmt\n";
        let from_yaml: CampaignSpecFields = parse_spec_body(yaml).unwrap();
        assert_eq!(from_yaml.name, from_json.name);
        assert_eq!(from_yaml.changeset_template.branch, from_json.changeset_template.branch);
    }

    #[test]
    fn changeset_spec_published_draft_round_trips_in_yaml() {
        let yaml = "headRef: refs/heads/fix\nbaseRef: refs/heads/main\ntitle: T\npublished: draft\n";
        let spec: ChangesetSpecFields = parse_spec_body(yaml).unwrap();
        assert!(spec.published.is_draft());

        let yaml_bool = "headRef: refs/heads/fix\nbaseRef: refs/heads/main\npublished: true\n";
        let spec: ChangesetSpecFields = parse_spec_body(yaml_bool).unwrap();
        assert!(spec.published.is_true());
    }

    #[test]
    fn garbage_body_is_rejected() {
        let result: Result<CampaignSpecFields> = parse_spec_body("{not json: [nor yaml");
        assert!(result.is_err());
    }

    #[test]
    fn branch_validation() {
        assert!(validate_branch("armada/gofmt").is_ok());
        assert!(validate_branch("fix-123").is_ok());

        assert!(validate_branch("").is_err());
        assert!(validate_branch("/leading").is_err());
        assert!(validate_branch("trailing/").is_err());
        assert!(validate_branch("has space").is_err());
        assert!(validate_branch("dot..dot").is_err());
        assert!(validate_branch("tilde~1").is_err());
        assert!(validate_branch("head.lock").is_err());
    }

    #[test]
    fn diff_stat_counts_hunk_lines_only() {
        let diff = "--- a/x.txt\n+++ b/x.txt\n@@ -1,2 +1,2 @@\n-old\n+new\n+added\n";
        let stat = diff_stat_of(diff);
        assert_eq!(stat.added, 2);
        assert_eq!(stat.deleted, 1);
        assert_eq!(stat.changed, 0);
    }
}
