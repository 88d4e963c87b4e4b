//! One-shot snapshot path used when the push channel cannot be opened.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::auth::{AuthError, TokenSource};
use crate::events::EventLog;
use crate::model::MatchId;
use crate::normalize::{MatchSnapshot, Normalizer};
use crate::reconcile::StateReconciler;

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("invalid api configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("credentials unavailable: {0}")]
    Auth(#[from] AuthError),
}

/// Request/response side of the match service.
#[async_trait]
pub trait MatchApi: Send + Sync {
    async fn fetch_match(&self, match_id: &MatchId) -> Result<Value, FallbackError>;

    /// Forces the simulation to completion and returns the final snapshot.
    async fn simulate_remainder(&self, match_id: &MatchId) -> Result<Value, FallbackError>;
}

pub struct ReqwestMatchApi {
    client: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenSource>,
}

impl ReqwestMatchApi {
    pub fn new(base_url: Url, tokens: Arc<dyn TokenSource>) -> Result<Self, FallbackError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    fn match_endpoint(&self, match_id: &MatchId, suffix: &str) -> Result<Url, FallbackError> {
        self.base_url
            .join(&format!("matches/{match_id}{suffix}"))
            .map_err(|err| {
                FallbackError::InvalidConfig(format!(
                    "unable to construct url for match {match_id}: {err}"
                ))
            })
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, FallbackError> {
        let builder = match self.tokens.bearer_token().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(FallbackError::HttpStatus(response.status()));
        }
        let body = response.json::<Value>().await?;
        Ok(body)
    }
}

#[async_trait]
impl MatchApi for ReqwestMatchApi {
    async fn fetch_match(&self, match_id: &MatchId) -> Result<Value, FallbackError> {
        let endpoint = self.match_endpoint(match_id, "")?;
        self.send(self.client.get(endpoint)).await
    }

    async fn simulate_remainder(&self, match_id: &MatchId) -> Result<Value, FallbackError> {
        let endpoint = self.match_endpoint(match_id, "/simulate")?;
        self.send(self.client.post(endpoint)).await
    }
}

/// Fetches a snapshot, runs it through the live normalization rules, and
/// seeds the session sinks with it.
#[derive(Clone)]
pub struct FallbackLoader {
    api: Arc<dyn MatchApi>,
    normalizer: Normalizer,
}

impl FallbackLoader {
    pub fn new(api: Arc<dyn MatchApi>, normalizer: Normalizer) -> Self {
        Self { api, normalizer }
    }

    pub fn api(&self) -> &Arc<dyn MatchApi> {
        &self.api
    }

    pub async fn load(
        &self,
        match_id: &MatchId,
        reconciler: &StateReconciler,
        events: &Mutex<EventLog>,
    ) -> Result<MatchSnapshot, FallbackError> {
        let body = self.api.fetch_match(match_id).await.inspect_err(|err| {
            warn!(
                target = "matchday::fallback",
                match_id = %match_id,
                error = %err,
                "snapshot fetch failed"
            );
        })?;
        self.seed(match_id, &body, reconciler, events)
    }

    pub async fn simulate_remainder(
        &self,
        match_id: &MatchId,
        reconciler: &StateReconciler,
        events: &Mutex<EventLog>,
    ) -> Result<MatchSnapshot, FallbackError> {
        let body = self.api.simulate_remainder(match_id).await?;
        self.seed(match_id, &body, reconciler, events)
    }

    fn seed(
        &self,
        match_id: &MatchId,
        body: &Value,
        reconciler: &StateReconciler,
        events: &Mutex<EventLog>,
    ) -> Result<MatchSnapshot, FallbackError> {
        if !body.is_object() {
            return Err(FallbackError::InvalidResponse(format!(
                "expected a match object, got {}",
                json_kind(body)
            )));
        }
        let snapshot = self.normalizer.snapshot(body);
        if !snapshot.info.is_empty() {
            reconciler.apply_info(snapshot.info.clone());
        }
        match self.normalizer.snapshot_tick(body) {
            Some(_) => reconciler.apply_state(snapshot.state.clone()),
            None => reconciler.apply_untimed(snapshot.state.clone()),
        };
        let added = events.lock().extend(snapshot.events.iter().cloned());
        info!(
            target = "matchday::fallback",
            match_id = %match_id,
            tick = snapshot.state.tick,
            score = %snapshot.state.score_line(),
            status = ?snapshot.state.status,
            events = added,
            "seeded session from snapshot"
        );
        Ok(snapshot)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MatchStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockMatchApi {
        snapshot: Value,
        simulated: Value,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MatchApi for MockMatchApi {
        async fn fetch_match(&self, _match_id: &MatchId) -> Result<Value, FallbackError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        }

        async fn simulate_remainder(&self, _match_id: &MatchId) -> Result<Value, FallbackError> {
            Ok(self.simulated.clone())
        }
    }

    struct FailingApi;

    #[async_trait]
    impl MatchApi for FailingApi {
        async fn fetch_match(&self, _match_id: &MatchId) -> Result<Value, FallbackError> {
            Err(FallbackError::HttpStatus(StatusCode::SERVICE_UNAVAILABLE))
        }

        async fn simulate_remainder(&self, _match_id: &MatchId) -> Result<Value, FallbackError> {
            Err(FallbackError::HttpStatus(StatusCode::NOT_FOUND))
        }
    }

    fn loader(snapshot: Value, simulated: Value) -> FallbackLoader {
        FallbackLoader::new(
            Arc::new(MockMatchApi {
                snapshot,
                simulated,
                fetches: AtomicUsize::new(0),
            }),
            Normalizer::default(),
        )
    }

    #[tokio::test]
    async fn finished_snapshot_seeds_state_and_events() {
        let loader = loader(
            json!({
                "data": {
                    "HomeScore": 2,
                    "AwayScore": 1,
                    "Status": "Finished",
                    "CurrentTick": 5400,
                    "HomeTeam": {"Name": "Rovers", "Formation": "4-4-2"},
                    "AwayTeam": {"Name": "United"},
                    "Events": [
                        {"Id": "e1", "Tick": 600, "Type": "Goal", "IsHomeTeam": true},
                        {"Id": "e1", "Tick": 600, "Type": "Goal", "IsHomeTeam": true},
                        {"Id": "e2", "Tick": 1800, "Type": "Goal", "IsHomeTeam": false}
                    ]
                }
            }),
            Value::Null,
        );
        let reconciler = StateReconciler::new();
        let events = Mutex::new(EventLog::new());
        let snapshot = loader
            .load(&MatchId::new("m-1"), &reconciler, &events)
            .await
            .unwrap();

        let state = reconciler.snapshot();
        assert_eq!((state.home_score, state.away_score), (2, 1));
        assert_eq!(state.status, MatchStatus::Finished);
        assert_eq!(snapshot.events.len(), 3);
        assert_eq!(events.lock().len(), 2);
        assert_eq!(reconciler.info().unwrap().home.name, "Rovers");
    }

    #[tokio::test]
    async fn non_object_body_is_rejected() {
        let loader = loader(json!([1, 2, 3]), Value::Null);
        let reconciler = StateReconciler::new();
        let events = Mutex::new(EventLog::new());
        let err = loader
            .load(&MatchId::new("m-1"), &reconciler, &events)
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::InvalidResponse(msg) if msg.contains("array")));
        assert_eq!(reconciler.revision(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_is_reported() {
        let loader = FallbackLoader::new(Arc::new(FailingApi), Normalizer::default());
        let reconciler = StateReconciler::new();
        let events = Mutex::new(EventLog::new());
        let err = loader
            .load(&MatchId::new("m-1"), &reconciler, &events)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FallbackError::HttpStatus(StatusCode::SERVICE_UNAVAILABLE)
        ));
    }

    #[tokio::test]
    async fn simulate_remainder_advances_seeded_state() {
        let loader = loader(
            json!({"homeScore": 0, "awayScore": 0, "tick": 900, "status": "InProgress"}),
            json!({"homeScore": 1, "awayScore": 3, "tick": 5400, "status": 3}),
        );
        let reconciler = StateReconciler::new();
        let events = Mutex::new(EventLog::new());
        let id = MatchId::new("m-9");
        loader.load(&id, &reconciler, &events).await.unwrap();
        assert_eq!(reconciler.snapshot().tick, 900);

        loader
            .simulate_remainder(&id, &reconciler, &events)
            .await
            .unwrap();
        let state = reconciler.snapshot();
        assert_eq!(state.tick, 5400);
        assert_eq!(state.score_line(), "1-3");
        assert!(state.status.is_finished());
    }

    #[tokio::test]
    async fn result_without_tick_still_lands() {
        let loader = loader(
            json!({"homeScore": 1, "awayScore": 1, "tick": 4000, "status": "InProgress"}),
            json!({"data": {"homeScore": 2, "awayScore": 1, "status": "Finished"}}),
        );
        let reconciler = StateReconciler::new();
        let events = Mutex::new(EventLog::new());
        let id = MatchId::new("m-10");
        loader.load(&id, &reconciler, &events).await.unwrap();
        loader
            .simulate_remainder(&id, &reconciler, &events)
            .await
            .unwrap();
        let state = reconciler.snapshot();
        assert_eq!(state.tick, 4000);
        assert_eq!(state.score_line(), "2-1");
        assert!(state.status.is_finished());
    }

    #[test]
    fn endpoints_keep_api_prefix() {
        let api = ReqwestMatchApi::new(
            Url::parse("http://localhost:5000/api/").unwrap(),
            Arc::new(crate::auth::StaticToken::anonymous()),
        )
        .unwrap();
        let id = MatchId::new("42");
        assert_eq!(
            api.match_endpoint(&id, "").unwrap().as_str(),
            "http://localhost:5000/api/matches/42"
        );
        assert_eq!(
            api.match_endpoint(&id, "/simulate").unwrap().as_str(),
            "http://localhost:5000/api/matches/42/simulate"
        );
    }
}
