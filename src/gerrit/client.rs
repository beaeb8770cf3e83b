use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::QueryRow;

/// Errors from the query client. The retry loop needs to tell transport
/// failures (worth another attempt) apart from protocol failures (not).
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("transport error talking to review server: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("review server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("failed to decode query response line: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid change record from server: {0}")]
    Invalid(String),

    #[error("gave up querying review server after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Branch restriction for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchFilter {
    /// No branch term; the full history of every branch.
    Any,
    /// One stable branch by short name ("havana" -> branch:stable/havana).
    Stable(String),
    /// Every open stable branch.
    AllStable,
}

impl BranchFilter {
    fn query_term(&self) -> Option<String> {
        match self {
            Self::Any => None,
            Self::Stable(name) => Some(format!("branch:stable/{}", name)),
            Self::AllStable => Some("branch:^stable/.*".to_string()),
        }
    }
}

/// What subset of changes a query asks for. A pass with any restriction is
/// partial and must not be written back to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilter {
    pub open_only: bool,
    pub branch: BranchFilter,
}

impl QueryFilter {
    pub fn full_history() -> Self {
        Self {
            open_only: false,
            branch: BranchFilter::Any,
        }
    }

    pub fn open() -> Self {
        Self {
            open_only: true,
            branch: BranchFilter::Any,
        }
    }

    /// True when this filter covers the complete history, which is the only
    /// case where results may overwrite the cached snapshot.
    pub fn is_full(&self) -> bool {
        !self.open_only && self.branch == BranchFilter::Any
    }
}

/// Client for the Gerrit change-query protocol: paginated requests, each
/// answered with newline-delimited JSON terminated by a stats row.
pub struct GerritClient {
    http: Client,
    base_url: String,
    auth: Option<(String, String)>,
    connect_attempts: u32,
    retry_backoff: Duration,
}

impl GerritClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            auth: None,
            connect_attempts: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((user.into(), password.into()));
        self
    }

    pub fn with_retry(mut self, connect_attempts: u32, retry_backoff: Duration) -> Self {
        self.connect_attempts = connect_attempts.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    fn query_url(&self) -> String {
        format!("{}/query", self.base_url.trim_end_matches('/'))
    }

    fn build_query(&self, project_expr: &str, filter: &QueryFilter) -> String {
        let mut q = project_expr.to_string();
        if filter.open_only {
            q.push_str(" status:open");
        }
        if let Some(term) = filter.branch.query_term() {
            q.push(' ');
            q.push_str(&term);
        }
        q
    }

    /// Fetch and decode one page of query results.
    ///
    /// On a transport or server failure the connection is dropped and the
    /// whole connect+query step is retried after a fixed backoff, up to the
    /// configured attempt budget. Within one attempt, a failed authenticated
    /// request is retried once without credentials before the attempt counts
    /// as failed. Decode failures are never retried.
    pub async fn query_page(
        &self,
        project_expr: &str,
        filter: &QueryFilter,
        start: u64,
        limit: u32,
    ) -> Result<Vec<QueryRow>, QueryError> {
        let q = self.build_query(project_expr, filter);

        for attempt in 1..=self.connect_attempts {
            let body = match self.fetch_page(&q, start, limit, true).await {
                Ok(body) => Some(body),
                Err(err) if err_is_retryable(&err) => {
                    if self.auth.is_some() {
                        // Degraded retry: some servers reject our credentials
                        // while still answering anonymous queries.
                        debug!(attempt, error = %err, "Retrying query without credentials");
                        self.fetch_page(&q, start, limit, false).await.ok()
                    } else {
                        None
                    }
                }
                Err(err) => return Err(err),
            };

            if let Some(body) = body {
                return decode_rows(&body);
            }

            warn!(
                attempt,
                max_attempts = self.connect_attempts,
                "Query attempt failed, backing off"
            );
            tokio::time::sleep(self.retry_backoff).await;
        }

        Err(QueryError::RetriesExhausted {
            attempts: self.connect_attempts,
        })
    }

    async fn fetch_page(
        &self,
        q: &str,
        start: u64,
        limit: u32,
        with_auth: bool,
    ) -> Result<String, QueryError> {
        debug!(q, start, limit, with_auth, "Issuing change query");

        let start = start.to_string();
        let limit = limit.to_string();
        let mut request = self.http.get(self.query_url()).query(&[
            ("q", q),
            ("format", "JSON"),
            ("start", start.as_str()),
            ("limit", limit.as_str()),
        ]);

        if with_auth {
            if let Some((user, password)) = &self.auth {
                request = request.basic_auth(user, Some(password));
            }
        }

        let response = request.send().await.map_err(QueryError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status(status));
        }

        response.text().await.map_err(QueryError::Transport)
    }

    /// Resolve the usernames of a server-side group's members.
    ///
    /// Gerrit prefixes REST responses with an XSSI guard line that has to be
    /// stripped before the JSON payload.
    pub async fn group_members(&self, group: &str) -> Result<Vec<String>, QueryError> {
        let url = format!(
            "{}/groups/{}/members",
            self.base_url.trim_end_matches('/'),
            group
        );
        info!(group, "Resolving group membership");

        let mut request = self.http.get(&url);
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await.map_err(QueryError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status(status));
        }

        let body = response.text().await.map_err(QueryError::Transport)?;
        let payload = body.strip_prefix(")]}'").unwrap_or(&body).trim_start();

        let members: Vec<crate::models::Account> =
            serde_json::from_str(payload).map_err(QueryError::Decode)?;

        Ok(members
            .into_iter()
            .map(|a| a.username_or_unknown().to_string())
            .collect())
    }
}

fn err_is_retryable(err: &QueryError) -> bool {
    matches!(err, QueryError::Transport(_) | QueryError::Status(_))
}

fn decode_rows(body: &str) -> Result<Vec<QueryRow>, QueryError> {
    let mut rows = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: QueryRow = serde_json::from_str(line).map_err(QueryError::Decode)?;
        if let QueryRow::Change(change) = &row {
            // The protocol invariant: a returned change always carries its
            // patch-set history. Anything else is a data-integrity fault.
            if change.patch_sets.is_empty() {
                return Err(QueryError::Invalid(format!(
                    "change {} has no patch sets",
                    change.id
                )));
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryRow;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHANGE_LINE: &str = r#"{"id":"I0a9f","project":"openstack/nova","branch":"master","status":"NEW","url":"https://review.example.org/1234","subject":"Fix scheduler race","sortKey":"002e4ab700001234","patchSets":[{"number":1,"createdOn":1390000000,"uploader":{"username":"jdoe"},"approvals":[]}]}"#;
    const SENTINEL_LINE: &str = r#"{"type":"stats","rowCount":0,"runTimeMilliseconds":3}"#;

    fn ndjson(lines: &[&str]) -> String {
        let mut body = lines.join("\n");
        body.push('\n');
        body
    }

    #[tokio::test]
    async fn test_query_page_decodes_changes_and_sentinel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("format", "JSON"))
            .and(query_param("start", "0"))
            .and(query_param("limit", "5"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(ndjson(&[CHANGE_LINE, SENTINEL_LINE])),
            )
            .mount(&server)
            .await;

        let client = GerritClient::new(server.uri());
        let rows = client
            .query_page("(project:openstack/nova)", &QueryFilter::open(), 0, 5)
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert!(matches!(&rows[0], QueryRow::Change(c) if c.id == "I0a9f"));
        assert!(matches!(&rows[1], QueryRow::Stats(s) if s.row_count == 0));
    }

    #[tokio::test]
    async fn test_query_includes_filter_terms() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param(
                "q",
                "(project:openstack/nova) status:open branch:stable/havana",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[SENTINEL_LINE])))
            .mount(&server)
            .await;

        let client = GerritClient::new(server.uri());
        let filter = QueryFilter {
            open_only: true,
            branch: BranchFilter::Stable("havana".to_string()),
        };
        let rows = client
            .query_page("(project:openstack/nova)", &filter, 0, 500)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[SENTINEL_LINE])))
            .mount(&server)
            .await;

        let client =
            GerritClient::new(server.uri()).with_retry(3, Duration::from_millis(0));
        let rows = client
            .query_page("(project:p)", &QueryFilter::open(), 0, 5)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client =
            GerritClient::new(server.uri()).with_retry(2, Duration::from_millis(0));
        let err = client
            .query_page("(project:p)", &QueryFilter::open(), 0, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::RetriesExhausted { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_degraded_auth_fallback() {
        let server = MockServer::start().await;
        // Authenticated requests are rejected; anonymous ones succeed.
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(wiremock::matchers::header_exists("authorization"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[SENTINEL_LINE])))
            .mount(&server)
            .await;

        let client = GerritClient::new(server.uri())
            .with_auth("jdoe", "hunter2")
            .with_retry(1, Duration::from_millis(0));
        let rows = client
            .query_page("(project:p)", &QueryFilter::open(), 0, 5)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_line_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json\n"))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            GerritClient::new(server.uri()).with_retry(3, Duration::from_millis(0));
        let err = client
            .query_page("(project:p)", &QueryFilter::open(), 0, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Decode(_)));
    }

    #[tokio::test]
    async fn test_change_without_patch_sets_rejected() {
        let server = MockServer::start().await;
        let bad = r#"{"id":"I1","project":"p","branch":"master","status":"NEW","patchSets":[]}"#;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(ndjson(&[bad, SENTINEL_LINE])),
            )
            .mount(&server)
            .await;

        let client = GerritClient::new(server.uri());
        let err = client
            .query_page("(project:p)", &QueryFilter::open(), 0, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_group_members_strips_xssi_prefix() {
        let server = MockServer::start().await;
        let body = ")]}'\n[{\"username\":\"core1\"},{\"username\":\"core2\"}]";
        Mock::given(method("GET"))
            .and(path("/groups/nova-core/members"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = GerritClient::new(server.uri());
        let members = client.group_members("nova-core").await.unwrap();
        assert_eq!(members, vec!["core1".to_string(), "core2".to_string()]);
    }
}
