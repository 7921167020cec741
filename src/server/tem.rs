//! TEM control service: the only writer of microscope state.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Reply, Service};
use crate::command::{magnification, query_fields, TemRequest};
use crate::error::AppResult;
use crate::protocol::{RawRequest, Response};
use crate::state::StateStore;

/// Applies state-changing commands and answers state queries.
///
/// Set commands reply with the complete new state so clients never need a
/// follow-up `get_state` to learn the generation their write produced.
#[derive(Debug, Clone)]
pub struct TemService {
    store: Arc<StateStore>,
}

impl TemService {
    /// A service writing to `store`.
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Service for TemService {
    fn name(&self) -> &'static str {
        "tem"
    }

    async fn handle(&self, request: RawRequest) -> AppResult<Reply> {
        let response = match TemRequest::parse(&request)? {
            TemRequest::Apply(command) => {
                let next = self.store.apply(&command)?;
                debug!(command = command.name(), generation = next.generation, "state updated");
                Response::ok(next.generation, next.as_ref())
            }
            TemRequest::GetState(None) => {
                let snapshot = self.store.read_snapshot();
                Response::ok(snapshot.generation, snapshot.as_ref())
            }
            TemRequest::GetState(Some(fields)) => {
                let snapshot = self.store.read_snapshot();
                Response::ok(snapshot.generation, query_fields(&snapshot, &fields)?)
            }
            TemRequest::GetMagnification => {
                let snapshot = self.store.read_snapshot();
                let reading = magnification(&snapshot, self.store.calibration())?;
                Response::ok(snapshot.generation, reading)
            }
            TemRequest::Exit => return Ok(Reply::close_session()),
        };
        Ok(Reply::respond(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmulatorError;
    use crate::state::{Calibration, MicroscopeState};
    use serde_json::{json, Value};

    fn service() -> TemService {
        let store =
            StateStore::new(MicroscopeState::default(), Arc::new(Calibration::default())).unwrap();
        TemService::new(Arc::new(store))
    }

    async fn ok(service: &TemService, command: &str, params: Value) -> (u64, Value) {
        let reply = service.handle(RawRequest::new(command, params)).await.unwrap();
        match reply.response() {
            Some(Response::Ok { generation, result }) => (*generation, result.clone()),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_returns_full_new_state() {
        let svc = service();
        let (generation, state) =
            ok(&svc, "set_stage_position", json!({"x_nm": 1500.0, "alpha_deg": 5.0})).await;
        assert_eq!(generation, 1);
        assert_eq!(state["generation"], 1);
        assert_eq!(state["stage"]["x_nm"], 1500.0);
        assert_eq!(state["stage"]["alpha_deg"], 5.0);
        assert!(state.get("beam").is_some());
    }

    #[tokio::test]
    async fn test_rejected_command_leaves_generation() {
        let svc = service();
        let err = svc
            .handle(RawRequest::new("set_stage_position", json!({"alpha_deg": 95.0})))
            .await
            .unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidParameter { .. }));

        let (generation, _) = ok(&svc, "get_state", Value::Null).await;
        assert_eq!(generation, 0);
    }

    #[tokio::test]
    async fn test_get_state_field_subset() {
        let svc = service();
        let (_, result) = ok(&svc, "get_state", json!({"fields": ["beam"]})).await;
        let keys: Vec<_> = result.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["beam".to_string()]);
    }

    #[tokio::test]
    async fn test_get_magnification_follows_mode() {
        let svc = service();
        let (_, reading) = ok(&svc, "get_magnification", Value::Null).await;
        assert_eq!(reading["unit"], "x");

        ok(&svc, "set_mode", json!({"mode": "diffraction", "magnification_index": 2})).await;
        let (_, reading) = ok(&svc, "get_magnification", Value::Null).await;
        assert_eq!(reading["mode"], "diffraction");
        assert_eq!(reading["unit"], "mm");
        assert_eq!(reading["index"], 2);
    }

    #[tokio::test]
    async fn test_exit_and_unknown() {
        let svc = service();
        let reply = svc.handle(RawRequest::new("kill", Value::Null)).await.unwrap();
        assert!(reply.close);
        assert!(reply.frames.is_empty());

        let err = svc.handle(RawRequest::new("FOO", Value::Null)).await.unwrap_err();
        assert!(matches!(err, EmulatorError::UnknownCommand(_)));
    }
}
