use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use tracing::debug;

use super::GerritClient;
use crate::config::Project;

/// Resolver for core-team membership.
///
/// Group lookups hit the server once per group name and are cached for the
/// lifetime of this object (one process run). Projects with an explicit
/// core-team list in their descriptor never touch the server.
#[derive(Default)]
pub struct CoreTeams {
    resolved: HashMap<String, HashSet<String>>,
}

impl CoreTeams {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn for_project(
        &mut self,
        client: &GerritClient,
        project: &Project,
    ) -> Result<&HashSet<String>> {
        if let Some(team) = &project.core_team {
            let key = format!("explicit:{}", project.name);
            self.resolved
                .entry(key.clone())
                .or_insert_with(|| team.iter().cloned().collect());
            return Ok(&self.resolved[&key]);
        }

        let group = project.core_group_name();
        if !self.resolved.contains_key(&group) {
            let members = client
                .group_members(&group)
                .await
                .with_context(|| format!("Failed to resolve members of group {}", group))?;
            debug!(group = %group, count = members.len(), "Cached group membership");
            self.resolved
                .insert(group.clone(), members.into_iter().collect());
        }
        Ok(&self.resolved[&group])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn project(core_team: Option<Vec<String>>) -> Project {
        Project {
            name: "nova".to_string(),
            subprojects: vec!["openstack/nova".to_string()],
            core_team,
            core_team_group: None,
            unofficial: false,
        }
    }

    #[tokio::test]
    async fn test_explicit_team_skips_server() {
        // Client pointed at an unroutable address: any lookup would fail.
        let client = GerritClient::new("http://127.0.0.1:1");
        let mut teams = CoreTeams::new();

        let project = project(Some(vec!["alice".to_string(), "bob".to_string()]));
        let team = teams.for_project(&client, &project).await.unwrap();
        assert!(team.contains("alice"));
        assert!(team.contains("bob"));
    }

    #[tokio::test]
    async fn test_group_resolution_cached_per_group() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/nova-core/members"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"[{"username":"core1"}]"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = GerritClient::new(server.uri());
        let mut teams = CoreTeams::new();
        let project = project(None);

        let first = teams.for_project(&client, &project).await.unwrap().clone();
        let second = teams.for_project(&client, &project).await.unwrap().clone();
        assert_eq!(first, second);
        assert!(first.contains("core1"));
    }
}
