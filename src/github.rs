//! Minimal GitHub capability: PR creation and lookup. The core consumes
//! only the returned summaries; tests substitute fakes.

use async_trait::async_trait;
use serde::Serialize;

/// Summary of a pull request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrSummary {
    /// Web URL.
    pub url: String,

    /// PR number.
    pub number: u64,
}

/// Injectable GitHub client capability.
#[async_trait]
pub trait GithubClient: Send + Sync {
    /// Create a pull request on the repository behind `remote_url`.
    async fn create_pr(
        &self,
        remote_url: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<PrSummary>;

    /// Find the open PR for a branch, if one exists.
    async fn find_open_pr(
        &self,
        remote_url: &str,
        branch: &str,
    ) -> anyhow::Result<Option<PrSummary>>;
}

/// Default client using the REST API with a `GITHUB_TOKEN`.
pub struct HttpGithubClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpGithubClient {
    /// Build a client reading `GITHUB_TOKEN` from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }

    fn token(&self) -> anyhow::Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("GITHUB_TOKEN not configured"))
    }
}

/// Split a normalized remote URL into (owner, repo).
fn owner_repo(remote_url: &str) -> anyhow::Result<(String, String)> {
    let path = remote_url
        .strip_prefix("https://")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, path)| path)
        .ok_or_else(|| anyhow::anyhow!("unsupported remote url: {remote_url}"))?;
    let mut parts = path.split('/');
    let owner = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("unsupported remote url: {remote_url}"))?;
    let repo = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("unsupported remote url: {remote_url}"))?;
    Ok((owner.to_string(), repo.to_string()))
}

#[async_trait]
impl GithubClient for HttpGithubClient {
    async fn create_pr(
        &self,
        remote_url: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<PrSummary> {
        let token = self.token()?;
        let (owner, repo) = owner_repo(remote_url)?;

        #[derive(serde::Deserialize)]
        struct PrResponse {
            html_url: String,
            number: u64,
        }

        let response: PrResponse = self
            .client
            .post(format!("https://api.github.com/repos/{owner}/{repo}/pulls"))
            .bearer_auth(token)
            .header("User-Agent", "switchboard")
            .header("Accept", "application/vnd.github+json")
            .json(&serde_json::json!({
                "title": title,
                "body": body,
                "head": head,
                "base": base,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(PrSummary {
            url: response.html_url,
            number: response.number,
        })
    }

    async fn find_open_pr(
        &self,
        remote_url: &str,
        branch: &str,
    ) -> anyhow::Result<Option<PrSummary>> {
        let token = self.token()?;
        let (owner, repo) = owner_repo(remote_url)?;

        #[derive(serde::Deserialize)]
        struct PrResponse {
            html_url: String,
            number: u64,
        }

        let prs: Vec<PrResponse> = self
            .client
            .get(format!("https://api.github.com/repos/{owner}/{repo}/pulls"))
            .query(&[
                ("state", "open"),
                ("head", &format!("{owner}:{branch}")),
            ])
            .bearer_auth(token)
            .header("User-Agent", "switchboard")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(prs.into_iter().next().map(|pr| PrSummary {
            url: pr.html_url,
            number: pr.number,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_repo_parsing() {
        let (owner, repo) = owner_repo("https://github.com/acme/widgets").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "widgets");
        assert!(owner_repo("not-a-url").is_err());
    }

    #[tokio::test]
    async fn test_missing_token_surfaces_configuration_error() {
        let client = HttpGithubClient {
            client: reqwest::Client::new(),
            token: None,
        };
        let err = client
            .create_pr("https://github.com/acme/widgets", "feature", "main", "t", "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("GITHUB_TOKEN not configured"));
    }
}
