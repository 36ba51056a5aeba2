use anyhow::{anyhow, Result};
use std::collections::HashMap;

/// CI metadata attached to a drift run. CLI flags win; CI provider env vars
/// fill in whatever the flags left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CiMetadata {
    pub provider: Option<CiProvider>,
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub pr_number: Option<u64>,
    pub external_check_run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiProvider {
    GithubActions,
    GitlabCi,
}

impl CiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GithubActions => "github_actions",
            Self::GitlabCi => "gitlab_ci",
        }
    }
}

impl CiMetadata {
    /// Detect from the process environment.
    pub fn detect() -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_env(&env)
    }

    /// Detect from an explicit env map (testable).
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| env.get(key).map(String::as_str).filter(|v| !v.is_empty());

        if get("GITHUB_ACTIONS").is_some() {
            let pr_number = match get("GITHUB_REF") {
                Some(gh_ref) => parse_github_pr_ref(gh_ref)?,
                None => None,
            };
            return Ok(Self {
                provider: Some(CiProvider::GithubActions),
                commit_sha: get("GITHUB_SHA").map(str::to_string),
                branch: get("GITHUB_HEAD_REF")
                    .or_else(|| get("GITHUB_REF_NAME"))
                    .map(str::to_string),
                pr_number,
                external_check_run_id: None,
            });
        }

        if get("GITLAB_CI").is_some() {
            let pr_number = match get("CI_MERGE_REQUEST_IID") {
                Some(raw) => Some(
                    raw.parse::<u64>()
                        .map_err(|_| anyhow!("CI_MERGE_REQUEST_IID is not a number: {raw}"))?,
                ),
                None => None,
            };
            return Ok(Self {
                provider: Some(CiProvider::GitlabCi),
                commit_sha: get("CI_COMMIT_SHA").map(str::to_string),
                branch: get("CI_COMMIT_REF_NAME").map(str::to_string),
                pr_number,
                external_check_run_id: None,
            });
        }

        Ok(Self::default())
    }

    /// Overlay CLI flags on top of detected values.
    pub fn with_overrides(
        mut self,
        commit_sha: Option<String>,
        branch: Option<String>,
        pr_number: Option<u64>,
        external_check_run_id: Option<String>,
    ) -> Self {
        if commit_sha.is_some() {
            self.commit_sha = commit_sha;
        }
        if branch.is_some() {
            self.branch = branch;
        }
        if pr_number.is_some() {
            self.pr_number = pr_number;
        }
        if external_check_run_id.is_some() {
            self.external_check_run_id = external_check_run_id;
        }
        self
    }
}

/// Parse a PR number out of `GITHUB_REF`.
///
/// Only `refs/pull/<n>/...` carries one; branch and tag refs yield `None`.
/// A pull ref whose number segment is missing or non-numeric is an error
/// rather than a silent zero.
fn parse_github_pr_ref(gh_ref: &str) -> Result<Option<u64>> {
    let Some(rest) = gh_ref.strip_prefix("refs/pull/") else {
        return Ok(None);
    };
    let number = rest
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| anyhow!("unexpected GITHUB_REF shape: {gh_ref}"))?;
    number
        .parse::<u64>()
        .map(Some)
        .map_err(|_| anyhow!("unexpected GITHUB_REF shape: {gh_ref} (PR segment {number:?})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_ci_detected() {
        let meta = CiMetadata::from_env(&env(&[])).unwrap();
        assert_eq!(meta, CiMetadata::default());
    }

    #[test]
    fn test_github_pull_request() {
        let meta = CiMetadata::from_env(&env(&[
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_SHA", "abc123"),
            ("GITHUB_REF", "refs/pull/482/merge"),
            ("GITHUB_HEAD_REF", "feature/retry"),
        ]))
        .unwrap();
        assert_eq!(meta.provider, Some(CiProvider::GithubActions));
        assert_eq!(meta.pr_number, Some(482));
        assert_eq!(meta.branch.as_deref(), Some("feature/retry"));
    }

    #[test]
    fn test_github_branch_ref_has_no_pr() {
        let meta = CiMetadata::from_env(&env(&[
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_REF", "refs/heads/main"),
            ("GITHUB_REF_NAME", "main"),
        ]))
        .unwrap();
        assert_eq!(meta.pr_number, None);
        assert_eq!(meta.branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_malformed_pull_ref_is_an_error() {
        let err = CiMetadata::from_env(&env(&[
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_REF", "refs/pull/not-a-number/merge"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("GITHUB_REF"));

        let err = CiMetadata::from_env(&env(&[
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_REF", "refs/pull/"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("GITHUB_REF"));
    }

    #[test]
    fn test_gitlab_merge_request() {
        let meta = CiMetadata::from_env(&env(&[
            ("GITLAB_CI", "true"),
            ("CI_COMMIT_SHA", "def456"),
            ("CI_COMMIT_REF_NAME", "fix/timeout"),
            ("CI_MERGE_REQUEST_IID", "91"),
        ]))
        .unwrap();
        assert_eq!(meta.provider, Some(CiProvider::GitlabCi));
        assert_eq!(meta.pr_number, Some(91));
    }

    #[test]
    fn test_flag_overrides_win() {
        let meta = CiMetadata::from_env(&env(&[
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_SHA", "abc123"),
        ]))
        .unwrap()
        .with_overrides(Some("override".to_string()), None, Some(7), None);
        assert_eq!(meta.commit_sha.as_deref(), Some("override"));
        assert_eq!(meta.pr_number, Some(7));
    }
}
