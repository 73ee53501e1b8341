//! WebhookNotifier against a fake chat webhook.

mod common;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{patch, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use time::OffsetDateTime;

use axe_relay::config::DeviceConfig;
use axe_relay::device::{FetchError, layout};
use axe_relay::notify::{MAX_CONTENT_CHARS, Notifier, NotifyError, WebhookNotifier};
use axe_relay::summary::{DeviceSummary, StatusSummary};

#[derive(Debug, Clone, PartialEq)]
struct Request {
    method: &'static str,
    path: String,
    wait: bool,
    content: String,
}

/// Remembers every request. Messages that are "deleted" answer edits
/// and deletes with 404; `reply` overrides the response to every POST.
#[derive(Default)]
struct Hook {
    requests: Mutex<Vec<Request>>,
    messages: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    reply: Mutex<Option<(StatusCode, Value)>>,
}

impl Hook {
    fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

async fn create(
    State(hook): State<Arc<Hook>>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let wait = query.get("wait").is_some_and(|w| w == "true");
    hook.requests.lock().push(Request {
        method: "POST",
        path: "/hook".into(),
        wait,
        content: body["content"].as_str().unwrap_or_default().to_string(),
    });

    if let Some((status, body)) = hook.reply.lock().clone() {
        return (status, Json(body)).into_response();
    }

    let id = {
        let mut messages = hook.messages.lock();
        let id = format!("m{}", messages.len() + 1);
        messages.push(id.clone());
        id
    };
    if wait {
        Json(json!({ "id": id, "content": body["content"] })).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn edit(
    State(hook): State<Arc<Hook>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    hook.requests.lock().push(Request {
        method: "PATCH",
        path: format!("/hook/messages/{id}"),
        wait: false,
        content: body["content"].as_str().unwrap_or_default().to_string(),
    });

    if hook.deleted.lock().contains(&id) || !hook.messages.lock().contains(&id) {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "Unknown Message" })))
            .into_response();
    }
    Json(json!({ "id": id })).into_response()
}

async fn remove(State(hook): State<Arc<Hook>>, Path(id): Path<String>) -> StatusCode {
    hook.requests.lock().push(Request {
        method: "DELETE",
        path: format!("/hook/messages/{id}"),
        wait: false,
        content: String::new(),
    });

    let mut deleted = hook.deleted.lock();
    if deleted.contains(&id) || !hook.messages.lock().contains(&id) {
        return StatusCode::NOT_FOUND;
    }
    deleted.push(id);
    StatusCode::NO_CONTENT
}

async fn start() -> (Arc<Hook>, WebhookNotifier) {
    let hook = Arc::new(Hook::default());
    let router = Router::new()
        .route("/hook", post(create))
        .route("/hook/messages/{id}", patch(edit).delete(remove))
        .with_state(hook.clone());
    let addr = common::serve(router).await;
    (hook, WebhookNotifier::new(format!("http://{addr}/hook")))
}

fn summary() -> StatusSummary {
    let device = DeviceConfig::new("bitaxe-gamma", "192.168.1.50");
    let devices = vec![DeviceSummary::new(
        &device,
        &Err(FetchError::Unreachable("connection refused".into())),
    )];
    StatusSummary::new(devices, &BTreeMap::new(), OffsetDateTime::now_utc())
}

/// Eight fully reporting devices: well past one message.
fn fleet_summary() -> StatusSummary {
    let now = OffsetDateTime::now_utc();
    let devices = (1..=8)
        .map(|n| {
            let config = DeviceConfig::new(format!("axe-{n:02}"), format!("192.168.1.{}", 100 + n));
            let snapshot = layout::parse(
                &json!({
                    "hostname": format!("axe-{n:02}"),
                    "ASICModel": "BM1370",
                    "deviceModel": "601",
                    "hashRate": 1200.0 + n as f64,
                    "hashRate_1m": 1190.0,
                    "hashRate_10m": 1195.0,
                    "hashRate_1h": 1201.0,
                    "power": 20.0,
                    "voltage": 5100,
                    "temp": 58.0,
                    "vrTemp": 49,
                    "fanrpm": 4100,
                    "fanspeed": 60,
                    "frequency": 525,
                    "coreVoltage": 1150,
                    "coreVoltageActual": 1141,
                    "bestDiff": "4.29G",
                    "bestSessionDiff": "12.8M",
                    "sharesAccepted": 10_000 + n,
                    "sharesRejected": 3,
                    "stratumURL": "public-pool.io",
                    "stratumPort": 21496,
                    "fallbackStratumURL": "solo.ckpool.org",
                    "fallbackStratumPort": 3333,
                    "stratumUser": format!("bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh.axe-{n:02}"),
                    "uptimeSeconds": 86_400 + n * 61
                }),
                now,
            )
            .unwrap();
            DeviceSummary::new(&config, &Ok(snapshot))
        })
        .collect();
    StatusSummary::new(devices, &BTreeMap::new(), now)
        .with_next_update(Duration::from_secs(60))
}

#[tokio::test]
async fn alert_is_posted_as_new_message() {
    let (hook, notifier) = start().await;

    notifier.send_alert("🔥 bitaxe-gamma: critical temperature 78°C").await.unwrap();

    let requests = hook.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert!(!requests[0].wait);
    assert_eq!(requests[0].content, "🔥 bitaxe-gamma: critical temperature 78°C");
}

#[tokio::test]
async fn summary_is_posted_once_then_edited() {
    let (hook, notifier) = start().await;

    notifier.publish_summary(&summary()).await.unwrap();
    notifier.publish_summary(&summary()).await.unwrap();
    notifier.publish_summary(&summary()).await.unwrap();

    let requests = hook.requests();
    let calls: Vec<_> = requests.iter().map(|r| (r.method, r.path.as_str(), r.wait)).collect();
    assert_eq!(
        calls,
        [
            ("POST", "/hook", true),
            ("PATCH", "/hook/messages/m1", false),
            ("PATCH", "/hook/messages/m1", false),
        ]
    );
    assert!(requests[0].content.contains("bitaxe-gamma"));
}

#[tokio::test]
async fn deleted_summary_is_posted_again() {
    let (hook, notifier) = start().await;

    notifier.publish_summary(&summary()).await.unwrap();
    hook.deleted.lock().push("m1".into());
    notifier.publish_summary(&summary()).await.unwrap();
    notifier.publish_summary(&summary()).await.unwrap();

    let calls: Vec<_> = hook
        .requests()
        .into_iter()
        .map(|r| (r.method, r.path))
        .collect();
    assert_eq!(
        calls,
        [
            ("POST", "/hook".to_string()),
            ("PATCH", "/hook/messages/m1".to_string()),
            ("POST", "/hook".to_string()),
            ("PATCH", "/hook/messages/m2".to_string()),
        ]
    );
}

#[tokio::test]
async fn rate_limit_reports_retry_after() {
    let (hook, notifier) = start().await;
    *hook.reply.lock() = Some((
        StatusCode::TOO_MANY_REQUESTS,
        json!({ "message": "You are being rate limited.", "retry_after": 0.5, "global": false }),
    ));

    let err = notifier.send_alert("hello").await.unwrap_err();

    assert_eq!(
        err,
        NotifyError::Throttled {
            retry_after: Duration::from_millis(500)
        }
    );
}

#[tokio::test]
async fn rejection_is_not_throttling() {
    let (hook, notifier) = start().await;
    *hook.reply.lock() = Some((StatusCode::BAD_REQUEST, json!({ "message": "Invalid Form Body" })));

    let err = notifier.send_alert("hello").await.unwrap_err();

    assert_eq!(err, NotifyError::Rejected { status: 400 });
}

#[tokio::test]
async fn unreachable_webhook_is_transport_error() {
    let addr = common::closed_port().await;
    let notifier = WebhookNotifier::new(format!("http://{addr}/api/webhooks/1/secret-token"));

    let err = notifier.send_alert("hello").await.unwrap_err();

    let NotifyError::Transport(message) = err else {
        panic!("expected transport error, got {err:?}");
    };
    assert!(!message.contains("secret-token"));
}

#[tokio::test]
async fn long_summary_is_split_between_devices() {
    let (hook, notifier) = start().await;
    let summary = fleet_summary();

    notifier.publish_summary(&summary).await.unwrap();

    let posts = hook.requests();
    assert!(posts.len() > 1, "expected several messages, got {}", posts.len());
    for post in &posts {
        assert_eq!((post.method, post.wait), ("POST", true));
        assert!(post.content.chars().count() <= MAX_CONTENT_CHARS);
        // Every device block that starts in a message also ends in it.
        assert_eq!(
            post.content.matches("🛠️ ").count(),
            post.content.matches("⏱️ Uptime").count()
        );
    }
    let text: String = posts.iter().map(|p| p.content.as_str()).collect();
    for n in 1..=8 {
        assert!(text.contains(&format!("🛠️ axe-{n:02} (192.168.1.{})", 100 + n)));
    }
    assert!(posts[0].content.starts_with("📡 Device overview"));
    assert!(posts.last().unwrap().content.ends_with("⏳ Next update in 1m 0s\n"));

    // The next summary edits the same messages in order.
    notifier.publish_summary(&summary).await.unwrap();
    let edits: Vec<_> = hook.requests()[posts.len()..]
        .iter()
        .map(|r| (r.method, r.path.clone()))
        .collect();
    let expected: Vec<_> = (1..=posts.len())
        .map(|n| ("PATCH", format!("/hook/messages/m{n}")))
        .collect();
    assert_eq!(edits, expected);
}

#[tokio::test]
async fn shorter_summary_deletes_extra_messages() {
    let (hook, notifier) = start().await;

    notifier.publish_summary(&fleet_summary()).await.unwrap();
    let posted = hook.requests().len();
    notifier.publish_summary(&summary()).await.unwrap();

    let calls: Vec<_> = hook.requests()[posted..]
        .iter()
        .map(|r| (r.method, r.path.clone()))
        .collect();
    let mut expected = vec![("PATCH", "/hook/messages/m1".to_string())];
    expected.extend((2..=posted).map(|n| ("DELETE", format!("/hook/messages/m{n}"))));
    assert_eq!(calls, expected);

    // Only the first message is kept from now on.
    notifier.publish_summary(&summary()).await.unwrap();
    let last = hook.requests().pop().unwrap();
    assert_eq!((last.method, last.path.as_str()), ("PATCH", "/hook/messages/m1"));
}

#[tokio::test]
async fn gone_message_reposts_the_rest() {
    let (hook, notifier) = start().await;

    notifier.publish_summary(&fleet_summary()).await.unwrap();
    let posted = hook.requests().len();
    assert!(posted > 1);
    hook.deleted.lock().push("m1".into());
    notifier.publish_summary(&fleet_summary()).await.unwrap();

    let calls: Vec<_> = hook.requests()[posted..]
        .iter()
        .map(|r| (r.method, r.path.clone()))
        .collect();
    let mut expected = vec![("PATCH", "/hook/messages/m1".to_string())];
    expected.extend((2..=posted).map(|n| ("DELETE", format!("/hook/messages/m{n}"))));
    expected.extend((0..posted).map(|_| ("POST", "/hook".to_string())));
    assert_eq!(calls, expected);
}
