mod logging;

use std::{sync::Arc, time::Duration};

use chatsdk_core::{
    Connection, ErrorCategory, Pagination, Reachability, SessionContext, SessionError,
    TransportEvent,
};
use chatsdk_platform::{InMemoryBackgroundExecution, ManualReachability, ScriptedTransport};
use chatsdk_runtime::{SessionConfig, SessionPlatform, spawn_runtime};
use serde_json::json;
use tracing::{info, warn};

const SETTLE: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let transport = ScriptedTransport::default();
    let reachability = ManualReachability::new(Reachability::Available);
    let background = InMemoryBackgroundExecution::default();
    let handle = spawn_runtime(
        &config,
        SessionPlatform {
            transport: Arc::new(transport.clone()),
            reachability: Arc::new(reachability.clone()),
            background: Arc::new(background.clone()),
        },
        SessionContext::new(),
    );

    let mut states = handle.subscribe_connection();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            info!(state = state.label(), connection_id = ?state.connection_id(), "observed");
        }
    });

    let mut events = handle.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(kind = event.kind(), "event delivered");
        }
    });

    let presenter = handle.presenter::<String>();
    let mut requests = presenter.prepare_request_stream(Pagination::first_page(2));

    if let Err(err) = handle.connect() {
        eprintln!("Session runtime is not running: {err}");
        std::process::exit(1);
    }
    tokio::time::sleep(SETTLE).await;

    let frames = [
        json!({
            "type": "health.check",
            "connection_id": "smoke-conn-1",
            "me": { "id": "smoke-user", "name": "Smoke" },
        }),
        json!({ "type": "message.new", "id": "m1", "text": "hello" }),
        json!({ "type": "message.new", "id": "m1", "text": "hello" }),
        json!({
            "type": "notification.mutes_updated",
            "me": { "id": "smoke-user", "mutes": [{ "target_id": "noisy-user" }] },
        }),
    ];
    let _ = transport.emit(TransportEvent::Connected);
    for frame in &frames {
        let _ = transport.emit_frame(frame.to_string());
    }
    let _ = transport.emit_frame("not a frame");
    tokio::time::sleep(SETTLE).await;

    if let Ok(Some(request)) = tokio::time::timeout(SETTLE, requests.next()).await {
        info!(offset = request.pagination.offset, "first page requested");
        presenter.apply_page(request, vec!["channel-a".to_owned()]);
        info!(cursor = ?presenter.next_cursor(), items = presenter.items().len(), "page applied");
    }

    let mutes = handle
        .subscribe_user()
        .borrow()
        .as_ref()
        .map(|user| user.mutes.len())
        .unwrap_or(0);
    info!(mutes, "cached identity");

    let _ = handle.enter_background();
    tokio::time::sleep(SETTLE).await;
    info!(grants = background.active_tasks(), "entered background");
    let _ = handle.enter_foreground();
    tokio::time::sleep(SETTLE).await;
    info!(grants = background.active_tasks(), "returned to foreground");

    let _ = transport.emit(TransportEvent::Disconnected {
        error: Some(SessionError::new(
            ErrorCategory::Auth,
            "token_revoked",
            "token revoked by smoke run",
        )),
    });
    tokio::time::sleep(SETTLE).await;

    match handle.connection() {
        Connection::Disconnected { error } => {
            info!(code = %error.code, "session stopped as expected");
            println!(
                "Smoke run complete: {} connect(s), {} ping(s)",
                transport.connect_calls(),
                transport.pings_sent()
            );
        }
        other => {
            warn!(state = other.label(), "unexpected final state");
            std::process::exit(1);
        }
    }
}
