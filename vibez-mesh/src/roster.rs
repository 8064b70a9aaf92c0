//! Participant roster: who holds which role in a space

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ParticipantRole, SpaceId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub role: ParticipantRole,
}

/// Read/write access to the participant records of a space
#[async_trait]
pub trait Roster: Send + Sync {
    /// Participants of `space_id` whose role is one of `roles`
    async fn participants(
        &self,
        space_id: &SpaceId,
        roles: &[ParticipantRole],
    ) -> Result<Vec<Participant>>;

    async fn role_of(
        &self,
        space_id: &SpaceId,
        user_id: &UserId,
    ) -> Result<Option<ParticipantRole>>;

    async fn set_role(
        &self,
        space_id: &SpaceId,
        user_id: &UserId,
        role: ParticipantRole,
    ) -> Result<()>;
}

/// Roster kept in memory
#[derive(Default)]
pub struct MemoryRoster {
    entries: DashMap<(SpaceId, UserId), ParticipantRole>,
    failing: AtomicBool,
}

impl MemoryRoster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, space_id: &SpaceId, user_id: &UserId, role: ParticipantRole) {
        self.entries
            .insert((space_id.clone(), user_id.clone()), role);
    }

    pub fn remove(&self, space_id: &SpaceId, user_id: &UserId) {
        self.entries.remove(&(space_id.clone(), user_id.clone()));
    }

    #[must_use]
    pub fn get(&self, space_id: &SpaceId, user_id: &UserId) -> Option<ParticipantRole> {
        self.entries
            .get(&(space_id.clone(), user_id.clone()))
            .map(|r| *r.value())
    }

    /// Make every call fail, as when the backing store is unreachable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(Error::Roster("roster unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Roster for MemoryRoster {
    async fn participants(
        &self,
        space_id: &SpaceId,
        roles: &[ParticipantRole],
    ) -> Result<Vec<Participant>> {
        self.check()?;
        let mut participants: Vec<Participant> = self
            .entries
            .iter()
            .filter(|e| &e.key().0 == space_id && roles.contains(e.value()))
            .map(|e| Participant {
                user_id: e.key().1.clone(),
                role: *e.value(),
            })
            .collect();
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(participants)
    }

    async fn role_of(
        &self,
        space_id: &SpaceId,
        user_id: &UserId,
    ) -> Result<Option<ParticipantRole>> {
        self.check()?;
        Ok(self.get(space_id, user_id))
    }

    async fn set_role(
        &self,
        space_id: &SpaceId,
        user_id: &UserId,
        role: ParticipantRole,
    ) -> Result<()> {
        self.check()?;
        self.insert(space_id, user_id, role);
        Ok(())
    }
}

/// Roster backed by the `space_participants` table of a PostgREST endpoint
pub struct RestRoster {
    client: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for RestRoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRoster")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

const PARTICIPANTS_TABLE: &str = "space_participants";

impl RestRoster {
    /// `base_url` is the REST root, e.g. `https://<project>.supabase.co/rest/v1`
    pub fn new(
        base_url: impl Into<String>,
        api_key: &str,
        access_token: Option<&str>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key)
                .map_err(|e| Error::InvalidInput(format!("invalid api key: {e}")))?,
        );
        let bearer = format!("Bearer {}", access_token.unwrap_or(api_key));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| Error::InvalidInput(format!("invalid access token: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/{PARTICIPANTS_TABLE}", self.base_url)
    }
}

fn role_filter(roles: &[ParticipantRole]) -> String {
    let list: Vec<&str> = roles.iter().map(ParticipantRole::as_str).collect();
    format!("in.({})", list.join(","))
}

#[async_trait]
impl Roster for RestRoster {
    async fn participants(
        &self,
        space_id: &SpaceId,
        roles: &[ParticipantRole],
    ) -> Result<Vec<Participant>> {
        let rows: Vec<Participant> = self
            .client
            .get(self.table_url())
            .query(&[
                ("select", "user_id,role".to_string()),
                ("space_id", format!("eq.{space_id}")),
                ("role", role_filter(roles)),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(space_id = %space_id, count = rows.len(), "Loaded participants");
        Ok(rows)
    }

    async fn role_of(
        &self,
        space_id: &SpaceId,
        user_id: &UserId,
    ) -> Result<Option<ParticipantRole>> {
        let rows: Vec<Participant> = self
            .client
            .get(self.table_url())
            .query(&[
                ("select", "user_id,role".to_string()),
                ("space_id", format!("eq.{space_id}")),
                ("user_id", format!("eq.{user_id}")),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(rows.into_iter().next().map(|p| p.role))
    }

    async fn set_role(
        &self,
        space_id: &SpaceId,
        user_id: &UserId,
        role: ParticipantRole,
    ) -> Result<()> {
        self.client
            .patch(self.table_url())
            .query(&[
                ("space_id", format!("eq.{space_id}")),
                ("user_id", format!("eq.{user_id}")),
            ])
            .json(&serde_json::json!({ "role": role }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_memory_roster_filters_by_space_and_role() {
        let roster = MemoryRoster::new();
        let space = SpaceId::from("s1");
        roster.insert(&space, &UserId::from("bob"), ParticipantRole::Speaker);
        roster.insert(&space, &UserId::from("alice"), ParticipantRole::Host);
        roster.insert(&space, &UserId::from("carol"), ParticipantRole::Listener);
        roster.insert(&SpaceId::from("s2"), &UserId::from("dave"), ParticipantRole::Host);

        let speakers = roster
            .participants(&space, &ParticipantRole::MESH_ROLES)
            .await
            .unwrap();
        let ids: Vec<&str> = speakers.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_memory_roster_failure() {
        let roster = MemoryRoster::new();
        roster.set_failing(true);
        let result = roster.role_of(&SpaceId::from("s1"), &UserId::from("a")).await;
        assert!(matches!(result, Err(Error::Roster(_))));
    }

    #[test]
    fn test_role_filter() {
        assert_eq!(role_filter(&ParticipantRole::MESH_ROLES), "in.(host,speaker)");
    }

    #[tokio::test]
    async fn test_rest_roster_queries_speakers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/space_participants"))
            .and(query_param("space_id", "eq.s1"))
            .and(query_param("role", "in.(host,speaker)"))
            .and(header("apikey", "anon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "user_id": "alice", "role": "host" },
                { "user_id": "bob", "role": "speaker" }
            ])))
            .mount(&server)
            .await;

        let roster = RestRoster::new(format!("{}/rest/v1/", server.uri()), "anon", None).unwrap();
        let participants = roster
            .participants(&SpaceId::from("s1"), &ParticipantRole::MESH_ROLES)
            .await
            .unwrap();

        assert_eq!(participants.len(), 2);
        assert_eq!(participants[1].role, ParticipantRole::Speaker);
    }

    #[tokio::test]
    async fn test_rest_roster_updates_role() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/space_participants"))
            .and(query_param("user_id", "eq.alice"))
            .and(header("authorization", "Bearer token"))
            .and(body_json(serde_json::json!({ "role": "speaker" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let roster =
            RestRoster::new(format!("{}/rest/v1", server.uri()), "anon", Some("token")).unwrap();
        roster
            .set_role(&SpaceId::from("s1"), &UserId::from("alice"), ParticipantRole::Speaker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rest_roster_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let roster = RestRoster::new(format!("{}/rest/v1", server.uri()), "anon", None).unwrap();
        let result = roster.role_of(&SpaceId::from("s1"), &UserId::from("a")).await;
        assert!(matches!(result, Err(Error::Http(_))));
    }
}
