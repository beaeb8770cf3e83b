use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cache::{merge_page, ChangeCache, ChangeMap, MergeOutcome};
use crate::config::{Project, QueryConfig};
use crate::gerrit::{GerritClient, QueryFilter};
use crate::models::{ChangeRecord, QueryRow};

/// Orchestrates the query client and the cache to produce an up-to-date,
/// de-duplicated set of changes for a list of projects.
///
/// Projects are synced strictly one at a time, one page at a time. A
/// transport failure that survives the client's retry budget aborts the
/// project's sync and propagates; partial data would silently undercount
/// everything computed downstream.
pub struct Synchronizer<'a> {
    client: &'a GerritClient,
    cache: &'a ChangeCache,
    query: QueryConfig,
}

impl<'a> Synchronizer<'a> {
    pub fn new(client: &'a GerritClient, cache: &'a ChangeCache, query: QueryConfig) -> Self {
        Self {
            client,
            cache,
            query,
        }
    }

    /// Fetch the current change set for every project and flatten it into
    /// one sequence. Order is not significant to callers.
    pub async fn fetch_changes(
        &self,
        projects: &[Project],
        filter: &QueryFilter,
    ) -> Result<Vec<ChangeRecord>> {
        let mut all = Vec::new();
        for project in projects {
            let changes = self
                .sync_project(project, filter)
                .await
                .with_context(|| format!("Failed to sync project {}", project.name))?;
            all.extend(changes.into_values());
        }
        Ok(all)
    }

    async fn sync_project(&self, project: &Project, filter: &QueryFilter) -> Result<ChangeMap> {
        info!(project = %project.name, "Syncing changes");

        // Only a full, unfiltered pass may read or write the snapshot; a
        // filtered pass is not the complete history.
        let full_pass = filter.is_full();
        let mut changes = if full_pass {
            self.cache.load(&project.name)
        } else {
            ChangeMap::new()
        };

        let expression = project.query_expression();
        let mut start: u64 = 0;

        loop {
            // While the working set is empty, ask for a small page so the
            // first merge check happens quickly.
            let limit = if changes.is_empty() {
                self.query.initial_page_size
            } else {
                self.query.page_size
            };

            let rows = self
                .client
                .query_page(&expression, filter, start, limit)
                .await?;

            let mut page = Vec::new();
            let mut exhausted = false;
            for row in rows {
                match row {
                    QueryRow::Change(change) => page.push(change),
                    QueryRow::Stats(stats) => {
                        if stats.row_count == 0 {
                            exhausted = true;
                        }
                    }
                }
            }

            let fetched = page.len() as u64;
            start += fetched;

            let outcome = merge_page(&mut changes, page);
            debug!(
                project = %project.name,
                fetched,
                total = changes.len(),
                "Merged query page"
            );

            if exhausted || outcome == MergeOutcome::Frontier || fetched == 0 {
                break;
            }
        }

        if full_pass {
            self.cache.save(&project.name, &changes)?;
        }

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn change_line(id: &str, subject: &str) -> String {
        format!(
            r#"{{"id":"{id}","project":"openstack/nova","branch":"master","status":"NEW","subject":"{subject}","patchSets":[{{"number":1,"createdOn":1390000000,"uploader":{{"username":"jdoe"}},"approvals":[]}}]}}"#
        )
    }

    fn sentinel(count: u64) -> String {
        format!(r#"{{"type":"stats","rowCount":{count}}}"#)
    }

    fn project() -> Project {
        Project {
            name: "nova".to_string(),
            subprojects: vec!["openstack/nova".to_string()],
            core_team: None,
            core_team_group: None,
            unofficial: false,
        }
    }

    fn query_config() -> QueryConfig {
        QueryConfig {
            initial_page_size: 5,
            page_size: 2,
            connect_attempts: 1,
            retry_backoff_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_full_pass_pages_until_sentinel_and_saves() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("start", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n{}\n{}\n",
                change_line("I1", "a"),
                change_line("I2", "b"),
                sentinel(2)
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("start", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n{}\n",
                change_line("I3", "c"),
                sentinel(0)
            )))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = GerritClient::new(server.uri());
        let cache = ChangeCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let sync = Synchronizer::new(&client, &cache, query_config());

        let changes = sync
            .fetch_changes(&[project()], &QueryFilter::full_history())
            .await
            .unwrap();
        assert_eq!(changes.len(), 3);

        // Full pass persisted the snapshot
        assert_eq!(cache.load("nova").len(), 3);
    }

    #[tokio::test]
    async fn test_cached_frontier_stops_paging() {
        let server = MockServer::start().await;
        // First run: one page, full history.
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n{}\n{}\n",
                change_line("I1", "a"),
                change_line("I2", "b"),
                sentinel(0)
            )))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = GerritClient::new(server.uri());
        let cache = ChangeCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let sync = Synchronizer::new(&client, &cache, query_config());

        sync.fetch_changes(&[project()], &QueryFilter::full_history())
            .await
            .unwrap();

        // Second run: the server streams newest-first; the first page holds
        // one new change plus an already-cached one, so no second page is
        // ever requested even though the stats row says more rows exist.
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("start", "0"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n{}\n{}\n",
                change_line("I9", "brand new"),
                change_line("I2", "b"),
                sentinel(2)
            )))
            .expect(1)
            .mount(&server)
            .await;

        let changes = sync
            .fetch_changes(&[project()], &QueryFilter::full_history())
            .await
            .unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(cache.load("nova").len(), 3);
    }

    #[tokio::test]
    async fn test_open_only_pass_does_not_touch_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n{}\n",
                change_line("I1", "a"),
                sentinel(0)
            )))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = GerritClient::new(server.uri());
        let cache = ChangeCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let sync = Synchronizer::new(&client, &cache, query_config());

        let changes = sync
            .fetch_changes(&[project()], &QueryFilter::open())
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!(cache.load("nova").is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = GerritClient::new(server.uri()).with_retry(1, Duration::from_millis(0));
        let cache = ChangeCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let sync = Synchronizer::new(&client, &cache, query_config());

        let err = sync
            .fetch_changes(&[project()], &QueryFilter::open())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nova"));
        // Nothing was persisted
        assert!(cache.load("nova").is_empty());
    }
}
