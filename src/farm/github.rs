//! Paginated source of merged pull requests.
//!
//! [`CandidateSource`] is the seam the farm loop pulls from. The GitHub
//! implementation walks `GET /repos/{repo}/pulls` oldest-first so a replayed
//! stream always has the same order and keeps merged PRs only. Size metrics
//! cost one extra call per PR and are fetched only for PRs the farm will
//! actually attempt.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use super::PrCandidate;
use crate::error::SourceError;

const GITHUB_API: &str = "https://api.github.com";

/// A paginated, ordered stream of candidate PRs.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Fetch page `page` (1-based).
    ///
    /// `None` means the stream is drained. `Some` may be empty when every
    /// entry of the upstream page was filtered out (e.g. closed unmerged PRs).
    async fn fetch_page(&self, page: u32) -> Result<Option<Vec<PrCandidate>>, SourceError>;

    /// Fill in details that are expensive to fetch, such as size metrics.
    ///
    /// Called only for candidates that survive the resume/skip filter.
    async fn enrich(&self, candidate: PrCandidate) -> Result<PrCandidate, SourceError> {
        Ok(candidate)
    }
}

/// Configuration for [`GitHubPullSource`].
#[derive(Debug, Clone)]
pub struct GitHubSourceConfig {
    /// Repository in `owner/repo` format.
    pub repo: String,
    pub token: Option<String>,
    pub per_page: u32,
    /// Delay between GitHub API calls.
    pub api_delay: Duration,
    pub api_base: String,
}

impl Default for GitHubSourceConfig {
    fn default() -> Self {
        Self {
            repo: String::new(),
            token: std::env::var("GITHUB_TOKEN")
                .ok()
                .or_else(|| std::env::var("GITHUB_PERSONAL_ACCESS_TOKEN").ok()),
            per_page: 100,
            api_delay: Duration::from_millis(500),
            api_base: GITHUB_API.to_string(),
        }
    }
}

impl GitHubSourceConfig {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        if token.is_some() {
            self.token = token;
        }
        self
    }

    pub fn with_api_delay(mut self, delay: Duration) -> Self {
        self.api_delay = delay;
        self
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, 100);
        self
    }
}

/// GitHub REST API candidate source.
pub struct GitHubPullSource {
    config: GitHubSourceConfig,
    client: Client,
    issue_patterns: Vec<Regex>,
}

impl GitHubPullSource {
    pub fn new(config: GitHubSourceConfig) -> anyhow::Result<Self> {
        validate_repo_name(&config.repo)?;
        let issue_patterns = [
            r"(?i)fix(?:e[sd])?\s+#(\d+)",
            r"(?i)close[sd]?\s+#(\d+)",
            r"(?i)resolve[sd]?\s+#(\d+)",
        ]
        .iter()
        .map(|p| Regex::new(p).map_err(|e| anyhow::anyhow!("invalid regex: {e}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            config,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            issue_patterns,
        })
    }

    async fn get(&self, url: &str) -> Result<Value, SourceError> {
        let mut request = self
            .client
            .get(url)
            .header("User-Agent", "swe-farm/0.1")
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::ParseError(e.to_string()))
    }

    fn linked_issues(&self, body: &str) -> Vec<u64> {
        let mut issues: Vec<u64> = self
            .issue_patterns
            .iter()
            .flat_map(|re| re.captures_iter(body))
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u64>().ok()))
            .collect();
        issues.sort_unstable();
        issues.dedup();
        issues
    }

    async fn fetch_size(&self, number: u64) -> Result<(usize, usize, usize), SourceError> {
        let url = format!(
            "{}/repos/{}/pulls/{}",
            self.config.api_base, self.config.repo, number
        );
        let detail = self.get(&url).await?;
        let field = |name: &str| detail.get(name).and_then(Value::as_u64).unwrap_or(0) as usize;
        Ok((field("changed_files"), field("additions"), field("deletions")))
    }
}

#[async_trait]
impl CandidateSource for GitHubPullSource {
    async fn fetch_page(&self, page: u32) -> Result<Option<Vec<PrCandidate>>, SourceError> {
        let url = format!(
            "{}/repos/{}/pulls?state=closed&sort=created&direction=asc&per_page={}&page={}",
            self.config.api_base, self.config.repo, self.config.per_page, page
        );
        if page > 1 {
            tokio::time::sleep(self.config.api_delay).await;
        }
        let raw = self.get(&url).await?;
        let items = raw
            .as_array()
            .ok_or_else(|| SourceError::ParseError("expected a JSON array of pulls".to_string()))?;
        if items.is_empty() {
            return Ok(None);
        }

        let mut candidates = Vec::with_capacity(items.len());
        for item in items {
            let Some(mut candidate) = parse_pull(item) else {
                continue;
            };
            if candidate.merged_at.is_none() {
                continue;
            }
            let body = item.get("body").and_then(Value::as_str).unwrap_or_default();
            candidate.linked_issues = self.linked_issues(body);
            candidates.push(candidate);
        }

        tracing::info!(
            repo = %self.config.repo,
            page = page,
            items = items.len(),
            merged = candidates.len(),
            "GitHub pulls page fetched"
        );

        Ok(Some(candidates))
    }

    async fn enrich(&self, mut candidate: PrCandidate) -> Result<PrCandidate, SourceError> {
        tokio::time::sleep(self.config.api_delay).await;
        let (files, additions, deletions) = self.fetch_size(candidate.number).await?;
        candidate.files_changed = files;
        candidate.additions = additions;
        candidate.deletions = deletions;
        Ok(candidate)
    }
}

/// Parse one entry of the pulls listing. Size metrics are filled in later.
fn parse_pull(item: &Value) -> Option<PrCandidate> {
    let number = item.get("number").and_then(Value::as_u64)?;
    let created_at = parse_ts(item.get("created_at"))?;
    Some(PrCandidate {
        number,
        title: item
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Untitled change")
            .to_string(),
        created_at,
        merged_at: parse_ts(item.get("merged_at")),
        author: item
            .get("user")
            .and_then(|u| u.get("login"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        files_changed: 0,
        additions: 0,
        deletions: 0,
        url: item
            .get("html_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        linked_issues: Vec::new(),
    })
}

fn parse_ts(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

async fn error_from_response(response: Response) -> SourceError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();

    let remaining_zero = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);
    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && (remaining_zero || body.to_lowercase().contains("rate limit")));

    if rate_limited {
        let retry_after = headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .or_else(|| {
                let reset = headers
                    .get("x-ratelimit-reset")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<i64>().ok())?;
                let wait = reset - Utc::now().timestamp();
                (wait > 0).then(|| Duration::from_secs(wait as u64))
            });
        tracing::warn!(status = %status, retry_after = ?retry_after, "GitHub API rate limited");
        return SourceError::RateLimited { retry_after };
    }

    SourceError::Http {
        status: status.as_u16(),
        body,
    }
}

/// Validate a GitHub repository name (`owner/repo`).
///
/// Both parts must be non-empty, contain only alphanumerics, `-`, `_` and
/// `.`, and must not start with `.` or `-`.
pub fn validate_repo_name(s: &str) -> anyhow::Result<()> {
    if s.is_empty() {
        anyhow::bail!("repository name is empty");
    }
    if s.len() > 256 {
        anyhow::bail!("repository name too long ({} chars, max 256)", s.len());
    }
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 2 {
        anyhow::bail!(
            "invalid repository name '{}': expected 'owner/repo' format",
            s
        );
    }
    for part in &parts {
        if part.is_empty() {
            anyhow::bail!(
                "invalid repository name '{}': owner and repo must be non-empty",
                s
            );
        }
        if part.starts_with('.') || part.starts_with('-') {
            anyhow::bail!(
                "invalid repository name '{}': parts must not start with '.' or '-'",
                s
            );
        }
        if let Some(ch) = part
            .chars()
            .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        {
            anyhow::bail!(
                "invalid character '{}' in repository name '{}': only alphanumeric, -, _, . allowed",
                ch,
                s
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> GitHubPullSource {
        GitHubPullSource::new(GitHubSourceConfig::new("owner/repo")).unwrap()
    }

    #[test]
    fn test_parse_pull_merged() {
        let item = serde_json::json!({
            "number": 42,
            "title": "Fix parser",
            "created_at": "2024-01-15T10:30:00Z",
            "merged_at": "2024-01-16T08:00:00Z",
            "user": {"login": "octocat"},
            "html_url": "https://github.com/owner/repo/pull/42"
        });
        let pr = parse_pull(&item).unwrap();
        assert_eq!(pr.number, 42);
        assert_eq!(pr.author, "octocat");
        assert!(pr.merged_at.is_some());
        assert_eq!(pr.url, "https://github.com/owner/repo/pull/42");
    }

    #[test]
    fn test_parse_pull_unmerged_and_invalid() {
        let unmerged = serde_json::json!({
            "number": 1,
            "created_at": "2024-01-15T10:30:00Z",
            "merged_at": null
        });
        let pr = parse_pull(&unmerged).unwrap();
        assert!(pr.merged_at.is_none());
        assert_eq!(pr.title, "Untitled change");

        let missing_number = serde_json::json!({"created_at": "2024-01-15T10:30:00Z"});
        assert!(parse_pull(&missing_number).is_none());
    }

    #[test]
    fn test_linked_issues_detection() {
        let src = source();
        assert_eq!(
            src.linked_issues("Fixes #12, closes #7 and resolves #12"),
            vec![7, 12]
        );
        assert!(src.linked_issues("Refactor, see #3").is_empty());
        assert_eq!(src.linked_issues("fixed #4"), vec![4]);
    }

    #[test]
    fn test_validate_repo_name() {
        assert!(validate_repo_name("fastapi/fastapi").is_ok());
        assert!(validate_repo_name("my-org/my_repo.rs").is_ok());
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("noslash").is_err());
        assert!(validate_repo_name("a/b/c").is_err());
        assert!(validate_repo_name("-a/b").is_err());
        assert!(validate_repo_name("a/b;rm").is_err());
    }

    #[test]
    fn test_config_builders() {
        let config = GitHubSourceConfig::new("a/b")
            .with_per_page(500)
            .with_api_delay(Duration::ZERO)
            .with_token(Some("t".to_string()));
        assert_eq!(config.per_page, 100);
        assert_eq!(config.api_delay, Duration::ZERO);
        assert_eq!(config.token.as_deref(), Some("t"));
    }
}
