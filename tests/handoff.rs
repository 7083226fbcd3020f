use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post as post_route},
    Json, Router,
};
use handoff_server::{
    app::build_state,
    chat::{ChatService, ChatSettings},
    config::Config,
    error::ChatError,
    http::router,
    hub::FanoutHub,
    hydrator::{Hydration, ProductHydrator, ProductState},
    registry::SessionRegistry,
    responder::RuleResponder,
    store::MemoryStore,
    types::{
        ChatMessage, ClientFrame, PostMessageBody, Sender, ServerEvent, SessionStatus,
        StaffFilter, StaffIdentity,
    },
    viewer::{
        ChatTransport, HttpTransport, InProcessTransport, InboxSource, PushResult, Viewer,
        ViewerKind,
    },
};
use serde_json::{json, Value};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};

struct Harness {
    store: Arc<MemoryStore>,
    hub: Arc<FanoutHub>,
    chat: Arc<ChatService>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(FanoutHub::new());
        let registry = Arc::new(SessionRegistry::new(store.clone(), hub.clone()));
        let chat = Arc::new(ChatService::new(
            registry,
            store.clone(),
            hub.clone(),
            Arc::new(RuleResponder::new("Mai")),
            ChatSettings::default(),
        ));
        Self { store, hub, chat }
    }

    async fn watcher(&self, session_id: &str) -> UnboundedReceiver<String> {
        let (id, rx) = self.hub.register().await;
        self.hub.join(id, session_id).await;
        rx
    }
}

fn staff(id: &str) -> StaffIdentity {
    StaffIdentity {
        id: id.to_string(),
        name: format!("Agent {id}"),
        role: "staff".to_string(),
    }
}

fn post(text: &str) -> PostMessageBody {
    PostMessageBody {
        text: text.to_string(),
        attachment: None,
        customer_info: None,
        client_message_id: None,
    }
}

fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        events.push(serde_json::from_str(&payload).unwrap());
    }
    events
}

async fn serve(app: Router) -> (String, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base_url, server)
}

/// Catalog with one product, `ao-thun`, and a 10% promotion on everything.
async fn stub_catalog(hits: Arc<AtomicUsize>) -> (String, JoinHandle<()>) {
    async fn product(Path(slug): Path<String>, State(hits): State<Arc<AtomicUsize>>) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);
        if slug != "ao-thun" {
            return StatusCode::NOT_FOUND.into_response();
        }
        Json(json!({
            "id": "p-1",
            "slug": "ao-thun",
            "name": "Áo thun",
            "price": 200000.0,
            "categoryIds": ["shirts"],
        }))
        .into_response()
    }

    async fn eligible() -> Json<Value> {
        Json(json!([{ "id": "promo-1", "code": "TEN", "type": "percent", "value": 10 }]))
    }

    let app = Router::new()
        .route("/products/slug/{slug}", get(product))
        .route("/promotions/eligible", post_route(eligible))
        .with_state(hits);
    serve(app).await
}

#[tokio::test]
async fn greeting_stays_with_assistant_and_reaches_watchers() {
    let harness = Harness::new();
    let mut watcher = harness.watcher("s1").await;

    let outcome = harness.chat.post_message("s1", post("Xin chào")).await.unwrap();
    assert!(!outcome.escalated);
    let bot = outcome.bot_message.expect("bot reply");
    assert_eq!(bot.sender, Sender::Bot);

    let session = harness.chat.registry().get("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Ai);

    let messages = drain(&mut watcher)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::NewMessage(m) => Some(m.id),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(messages, vec![outcome.user_message.id, bot.id]);
}

#[tokio::test]
async fn every_post_is_answered_or_escalated_never_both() {
    let harness = Harness::new();
    for (i, text) in ["hello", "what sizes?", "talk to staff please", "still there?"]
        .iter()
        .enumerate()
    {
        let session_id = format!("s{i}");
        let outcome = harness.chat.post_message(&session_id, post(text)).await.unwrap();
        assert!(outcome.escalated != outcome.bot_message.is_some(), "{text}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_agents_accepting_at_once_have_one_winner() {
    let harness = Harness::new();
    harness
        .chat
        .post_message("s1", post("cho tôi gặp nhân viên"))
        .await
        .unwrap();

    let registry = harness.chat.registry().clone();
    let (a, b) = tokio::join!(
        {
            let registry = registry.clone();
            async move { registry.accept_session("s1", &staff("a")).await }
        },
        {
            let registry = registry.clone();
            async move { registry.accept_session("s1", &staff("b")).await }
        }
    );

    let (winner, loser) = match (a, b) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    let ChatError::AlreadyAssigned { session } = &loser else {
        panic!("loser should see a conflict, got {loser:?}");
    };
    assert_eq!(session.assigned_staff_id, winner.assigned_staff_id);
}

#[tokio::test]
async fn resolve_reaches_every_client_and_closes_the_thread() {
    let harness = Harness::new();
    harness.chat.post_message("s1", post("talk to a human")).await.unwrap();
    harness.chat.registry().accept_session("s1", &staff("a")).await.unwrap();

    let mut customer = harness.watcher("s1").await;
    let mut console = harness.watcher("s1").await;
    harness.chat.registry().resolve("s1", &staff("a")).await.unwrap();

    for rx in [&mut customer, &mut console] {
        assert!(drain(rx).iter().any(|event| matches!(
            event,
            ServerEvent::SessionResolved { session_id, .. } if session_id == "s1"
        )));
    }

    let outcome = harness.chat.post_message("s1", post("thanks!")).await.unwrap();
    assert_ne!(outcome.session_id, "s1");
    let old_thread = harness.chat.history("s1", None).await.unwrap();
    assert!(old_thread.iter().all(|m| m.text != "thanks!"));
    assert!(drain(&mut customer)
        .iter()
        .all(|event| !matches!(event, ServerEvent::NewMessage(_))));
}

#[tokio::test]
async fn store_outage_is_reported_not_swallowed() {
    let harness = Harness::new();
    harness.chat.post_message("s1", post("hello")).await.unwrap();
    harness.store.set_offline(true);

    assert!(matches!(
        harness.chat.post_message("s1", post("hello again")).await,
        Err(ChatError::Store(_))
    ));
    assert!(matches!(
        harness.chat.registry().request_staff("s1", None).await,
        Err(ChatError::Store(_))
    ));

    harness.store.set_offline(false);
    assert_eq!(harness.chat.history("s1", None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn post_then_history_round_trips() {
    let harness = Harness::new();
    let before = chrono::Utc::now();
    let outcome = harness.chat.post_message("s1", post("Áo size M còn không?")).await.unwrap();
    let history = harness.chat.history("s1", Some(50)).await.unwrap();
    assert_eq!(history[0], outcome.user_message);
    assert!(history[0].created_at >= before);
    assert_eq!(history[0].text, "Áo size M còn không?");
}

#[tokio::test]
async fn viewer_ignores_redelivered_pushes() {
    let harness = Harness::new();
    let transport = Arc::new(InProcessTransport::customer(harness.chat.clone()));
    let viewer = Viewer::new(ViewerKind::Customer, "s1", transport);
    let mut pushes = harness.watcher("s1").await;

    let sent = viewer.send("Xin chào", None).await.unwrap();
    let events = drain(&mut pushes);
    for event in events.iter().chain(events.iter()) {
        viewer.on_event(event).await;
    }

    let entries = viewer.entries().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].message.id, sent.id);
    assert!(entries.iter().all(|e| !e.pending));
    let echo = events
        .iter()
        .find(|e| matches!(e, ServerEvent::NewMessage(m) if m.id == sent.id))
        .unwrap();
    assert_eq!(viewer.on_event(echo).await, Some(PushResult::Duplicate));
}

#[tokio::test]
async fn staff_console_flow_over_http() {
    let media_dir = tempfile::tempdir().unwrap();
    let config = Config {
        media_storage_dir: media_dir.path().to_path_buf(),
        staff_tokens: vec![("tok-a".to_string(), staff("a"))],
        ..Config::default()
    };
    let state = build_state(&config).await.unwrap();
    let (base_url, server) = serve(router(state)).await;

    let client = reqwest::Client::new();
    let customer = Arc::new(HttpTransport::new(client.clone(), &base_url, None));
    let console = Arc::new(HttpTransport::new(
        client.clone(),
        &base_url,
        Some("tok-a".to_string()),
    ));

    let widget = Viewer::new(ViewerKind::Customer, "web-1", customer.clone());
    widget.send("Cho mình gặp nhân viên", None).await.unwrap();

    let waiting = console.list_sessions(StaffFilter::Waiting).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].session_id, "web-1");

    let accepted = client
        .post(format!("{base_url}/api/session/web-1/accept"))
        .bearer_auth("tok-a")
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), reqwest::StatusCode::OK);

    let unauthorized = client
        .post(format!("{base_url}/api/session/web-1/accept"))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), reqwest::StatusCode::UNAUTHORIZED);

    let agent = Viewer::new(
        ViewerKind::Staff {
            staff_id: "a".to_string(),
            staff_name: "Agent a".to_string(),
        },
        "web-1",
        console.clone(),
    )
    .with_staff_token("tok-a");
    agent.send("Chào bạn, mình hỗ trợ nhé", None).await.unwrap();
    assert_eq!(
        agent.rejoin_frames().await[0],
        ClientFrame::JoinStaff {
            token: "tok-a".to_string()
        }
    );

    let history = customer.history("web-1", 50).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(matches!(history[1].sender, Sender::Staff { .. }));

    let mine = console.list_sessions(StaffFilter::Mine).await.unwrap();
    assert_eq!(mine[0].status, SessionStatus::WithStaff);

    server.abort();
}

#[tokio::test]
async fn rejected_staff_send_is_rolled_back() {
    let harness = Harness::new();
    let transport = Arc::new(InProcessTransport::staff(harness.chat.clone(), staff("a")));
    let agent = Viewer::new(
        ViewerKind::Staff {
            staff_id: "a".to_string(),
            staff_name: "Agent a".to_string(),
        },
        "nobody-accepted",
        transport,
    )
    .with_grace_period(Duration::from_millis(1_500));
    harness.chat.registry().ensure_session("nobody-accepted", None).await.unwrap();

    let err = agent.send("hello", None).await.unwrap_err();
    assert!(err.to_string().contains("403"));
    assert!(agent.entries().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_post_and_resolve_never_write_into_a_resolved_thread() {
    let harness = Harness::new();
    for round in 0..50 {
        let session_id = format!("race-{round}");
        let registry = harness.chat.registry().clone();
        registry.request_staff(&session_id, None).await.unwrap();
        registry.accept_session(&session_id, &staff("a")).await.unwrap();
        let mut room = harness.watcher(&session_id).await;

        let posting = {
            let chat = harness.chat.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { chat.post_message(&session_id, post("one last thing")).await })
        };
        let resolving = {
            let session_id = session_id.clone();
            tokio::spawn(async move { registry.resolve(&session_id, &staff("a")).await })
        };
        let outcome = posting.await.unwrap().unwrap();
        resolving.await.unwrap().unwrap();

        let events = drain(&mut room);
        let resolved_at = events
            .iter()
            .position(|e| matches!(e, ServerEvent::SessionResolved { .. }))
            .expect("resolve is broadcast to the room");
        let posted_at = events.iter().position(
            |e| matches!(e, ServerEvent::NewMessage(m) if m.id == outcome.user_message.id),
        );
        let thread = harness.chat.history(&session_id, None).await.unwrap();

        if outcome.session_id == session_id {
            assert!(posted_at.expect("message is broadcast") < resolved_at);
            assert_eq!(thread.len(), 1);
        } else {
            assert!(posted_at.is_none(), "round {round}: message leaked into resolved room");
            assert!(thread.is_empty(), "round {round}: message stored in resolved thread");
        }
    }
}

#[tokio::test]
async fn reconnecting_viewer_keeps_history_in_order() {
    let harness = Harness::new();
    harness.chat.post_message("s1", post("Xin chào")).await.unwrap();
    let mut room = harness.watcher("s1").await;
    harness.chat.post_message("s1", post("Size M còn không?")).await.unwrap();

    let transport = Arc::new(InProcessTransport::customer(harness.chat.clone()));
    let viewer = Viewer::new(ViewerKind::Customer, "s1", transport);
    for event in drain(&mut room) {
        viewer.on_event(&event).await;
    }
    viewer.load_history(50).await.unwrap();

    let shown = viewer
        .entries()
        .await
        .into_iter()
        .map(|e| e.message.id)
        .collect::<Vec<_>>();
    let stored = harness
        .chat
        .history("s1", None)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect::<Vec<_>>();
    assert_eq!(stored.len(), 4);
    assert_eq!(shown, stored);
}

#[tokio::test]
async fn viewer_hydrates_products_the_assistant_mentions() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (catalog_url, catalog) = stub_catalog(hits.clone()).await;
    let config = Config {
        catalog_api_url: Some(catalog_url),
        ..Config::default()
    };
    let hydrator = Arc::new(ProductHydrator::from_config(reqwest::Client::new(), &config).unwrap());

    let harness = Harness::new();
    let transport = Arc::new(InProcessTransport::customer(harness.chat.clone()));
    let viewer =
        Viewer::new(ViewerKind::Customer, "s1", transport).with_hydrator(hydrator.clone());

    let reply = ChatMessage {
        id: "b1".to_string(),
        session_id: "s1".to_string(),
        sender: Sender::Bot,
        text: "Gợi ý: [Áo thun](/product/ao-thun) và [Mũ len](/product/mu-len)".to_string(),
        attachment: None,
        client_message_id: None,
        created_at: chrono::Utc::now(),
    };
    let event = ServerEvent::NewMessage(reply.clone());
    assert_eq!(viewer.on_event(&event).await, Some(PushResult::Appended));
    assert_eq!(viewer.on_event(&event).await, Some(PushResult::Duplicate));

    let Hydration::Ready(product) = hydrator.hydrate("ao-thun").await else {
        panic!("ao-thun should resolve");
    };
    assert_eq!(product.final_price(), 180_000.0);
    assert_eq!(product.snapshot().promotion_code.as_deref(), Some("TEN"));
    assert_eq!(hydrator.hydrate("mu-len").await, Hydration::Unavailable);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let cards = viewer.product_cards(&reply);
    assert!(matches!(cards[0].1, ProductState::Ready(_)));
    assert_eq!(cards[1].1, ProductState::Unavailable);

    viewer
        .send("Còn [Áo khoác](/product/ao-khoac) không?", None)
        .await
        .unwrap();
    assert_eq!(hydrator.state("ao-khoac"), ProductState::Pending);

    catalog.abort();
}

#[tokio::test]
async fn malformed_bodies_get_the_error_envelope() {
    let media_dir = tempfile::tempdir().unwrap();
    let config = Config {
        media_storage_dir: media_dir.path().to_path_buf(),
        staff_tokens: vec![("tok-a".to_string(), staff("a"))],
        ..Config::default()
    };
    let (base_url, server) = serve(router(build_state(&config).await.unwrap())).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base_url}/api/session/web-1/message"))
        .header("content-type", "application/json")
        .body("{\"text\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let response = client
        .patch(format!("{base_url}/api/session/web-1/ai"))
        .bearer_auth("tok-a")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let response = client
        .post(format!("{base_url}/api/session/%20web-1/message"))
        .json(&post("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    server.abort();
}
