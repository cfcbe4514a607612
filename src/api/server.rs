use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::directory::PeerDirectory;
use crate::lifecycle::Orchestrator;
use crate::transport::{SignalRouter, RECEIVER_PATH};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<SignalRouter>,
    pub directory: Arc<PeerDirectory>,
    /// Only monitors manage isolates.
    pub orchestrator: Option<Arc<Orchestrator>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            &format!("{}/*name", RECEIVER_PATH),
            post(handlers::receive_signal),
        )
        .route("/health", get(handlers::health_check))
        .route("/directory", get(handlers::get_directory))
        .route("/isolates", get(handlers::list_isolates))
        .route("/isolates/:id", get(handlers::get_isolate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves on an already bound listener until cancelled.
pub async fn serve_listener(
    state: AppState,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    let address = listener.local_addr()?;
    info!("Signal receiver listening on {}", address);

    let app = create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;

    info!("Signal receiver on {} stopped", address);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    use crate::forker::{ForkerEvent, ForkerService};
    use crate::lifecycle::{FailurePolicy, IsolateStatus};
    use crate::transport::{HttpSignalSender, SignalListener, MODE_HEADER};
    use crate::types::{ForkerStatus, IsolateDescription, LocalIsolate, SignalData};

    #[derive(Default)]
    struct EchoListener {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SignalListener for EchoListener {
        async fn handle_received_signal(
            &self,
            name: &str,
            data: &SignalData,
        ) -> anyhow::Result<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(json!({
                "signal": name,
                "from": data.sender_uid,
                "address": data.sender_address,
            })))
        }
    }

    fn create_test_state() -> (AppState, Arc<EchoListener>) {
        let directory = Arc::new(PeerDirectory::new(LocalIsolate::new(
            "monitor-local",
            "node-local",
            8000,
        )));
        let router = Arc::new(SignalRouter::new());
        let listener = Arc::new(EchoListener::default());
        router.register("/test/*", listener.clone());
        (
            AppState {
                router,
                directory,
                orchestrator: None,
            },
            listener,
        )
    }

    fn envelope() -> String {
        serde_json::to_string(&SignalData::new("iso-a", "a", "node-A", json!({"k": 1}))).unwrap()
    }

    fn signal_request(path: &str, mode: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header(MODE_HEADER, mode)
            .body(Body::from(envelope()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (state, _) = create_test_state();
        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["uid"], "monitor-local");
    }

    #[tokio::test]
    async fn test_signal_dispatched_to_listener() {
        let (state, _) = create_test_state();
        let response = create_router(state)
            .oneshot(signal_request("/signal-receiver/test/ping", "send"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["code"], 200);
        assert_eq!(json["results"][0]["signal"], "/test/ping");
        assert_eq!(json["results"][0]["from"], "iso-a");
    }

    #[tokio::test]
    async fn test_signal_without_listener() {
        let (state, listener) = create_test_state();
        let response = create_router(state)
            .oneshot(signal_request("/signal-receiver/other/ping", "send"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], 404);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_forget_mode_answers_first() {
        let (state, listener) = create_test_state();
        let response = create_router(state)
            .oneshot(signal_request("/signal-receiver/test/ping", "forget"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["results"]
            .as_array()
            .unwrap()
            .is_empty());

        while listener.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_rejected() {
        let (state, listener) = create_test_state();
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/signal-receiver/test/ping")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_directory_dump() {
        let (state, _) = create_test_state();
        let response = create_router(state)
            .oneshot(Request::builder().uri("/directory").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["accesses"]["monitor-local"]["port"], 8000);
    }

    struct IdleForkers {
        events: broadcast::Sender<ForkerEvent>,
    }

    #[async_trait]
    impl ForkerService for IdleForkers {
        async fn start_isolate(&self, _description: &IsolateDescription) -> ForkerStatus {
            ForkerStatus::NoMatchingForker
        }

        async fn stop_isolate(&self, _isolate_id: &str) {}

        async fn ping(&self, _isolate_id: &str) -> ForkerStatus {
            ForkerStatus::NoMatchingForker
        }

        async fn set_platform_stopping(&self) {}

        fn subscribe(&self) -> broadcast::Receiver<ForkerEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test]
    async fn test_isolates_listing() {
        let (mut state, _) = create_test_state();
        let status = IsolateStatus::new("monitor-local");
        status.load([IsolateDescription::new("iso-a", "node-A", "java")]);
        let (events, _) = broadcast::channel(1);
        let forkers = Arc::new(IdleForkers { events });
        let sender = Arc::new(HttpSignalSender::new(
            state.directory.clone(),
            state.router.clone(),
            Duration::from_secs(1),
        ));
        state.orchestrator = Some(Orchestrator::new(
            forkers,
            sender,
            status,
            FailurePolicy::default(),
        ));
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/isolates").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json[0]["id"], "iso-a");
        assert_eq!(json[0]["state"], "WAITING");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/isolates/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_observed_address_over_tcp() {
        let (state, _) = create_test_state();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_listener(state, listener, cancel.clone()));

        let response: Value = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/signal-receiver/test/ping", port))
            .header(MODE_HEADER, "send")
            .body(envelope())
            .header("content-type", "application/json")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response["results"][0]["address"], "127.0.0.1");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
