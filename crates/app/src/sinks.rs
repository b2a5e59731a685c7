//! Concrete delivery sinks: spreadsheet web app, Telegram chat and the
//! in-process dashboard feed served over SSE.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use dockcount::{CountEvent, dispatch::{DeliveryError, Sink}};
use reqwest::{StatusCode, blocking::Client};
use serde_json::{Value, json};

use crate::cli::{AppConfig, TelegramTarget};

/// Events retained for dashboard clients.
pub const FEED_CAPACITY: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build every sink enabled by the configuration.
pub fn build_sinks(config: &AppConfig, feed: Arc<DashboardFeed>) -> Result<Vec<Box<dyn Sink>>> {
    let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(DashboardSink { feed })];
    if config.sheets_url.is_none() && config.telegram.is_none() {
        return Ok(sinks);
    }

    let client = http_client()?;
    if let Some(url) = &config.sheets_url {
        sinks.push(Box::new(SheetsSink::new(client.clone(), url.clone())));
    }
    if let Some(target) = &config.telegram {
        sinks.push(Box::new(TelegramSink::new(client, target.clone())));
    }
    Ok(sinks)
}

pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("dockcount/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

/// Appends each event as a row through a spreadsheet web app endpoint.
pub struct SheetsSink {
    client: Client,
    url: String,
}

impl SheetsSink {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }

    fn payload(event: &CountEvent) -> Value {
        json!({
            "event_id": event.id,
            "direction": event.direction.label(),
            "timestamp": event.timestamp.to_rfc3339(),
            "plate": event.metadata.plate,
            "inbound": event.metadata.inbound_total,
            "outbound": event.metadata.outbound_total,
            "class": event.class.label(),
            "track_id": event.track_id.0,
        })
    }
}

impl Sink for SheetsSink {
    fn name(&self) -> &str {
        "sheets"
    }

    fn deliver(&mut self, event: &CountEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(event))
            .send()
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().map_err(transport_error)?;
        classify_response(status, &body, |json| {
            json.get("status").and_then(Value::as_str) == Some("success")
        })
    }
}

/// Posts a notification for each event to a Telegram chat.
pub struct TelegramSink {
    client: Client,
    target: TelegramTarget,
}

impl TelegramSink {
    pub fn new(client: Client, target: TelegramTarget) -> Self {
        Self { client, target }
    }

    fn endpoint(&self) -> String {
        format!("https://api.telegram.org/bot{}/sendMessage", self.target.token)
    }
}

impl Sink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    fn deliver(&mut self, event: &CountEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&json!({
                "chat_id": self.target.chat_id,
                "text": telegram_message(event),
                "parse_mode": "Markdown",
            }))
            .send()
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().map_err(transport_error)?;
        classify_response(status, &body, |json| {
            json.get("ok").and_then(Value::as_bool) == Some(true)
        })
    }
}

pub(crate) fn telegram_message(event: &CountEvent) -> String {
    let arrow = match event.direction {
        dockcount::Direction::Inbound => "⬇️",
        dockcount::Direction::Outbound => "⬆️",
    };
    let mut text = format!(
        "{arrow} *{}* {} {}\nIn: {} | Out: {}",
        escape_markdown(&event.direction.label().to_uppercase()),
        event.class,
        escape_markdown(&event.track_id.to_string()),
        event.metadata.inbound_total,
        event.metadata.outbound_total,
    );
    if let Some(plate) = &event.metadata.plate {
        text.push_str(&format!("\nPlate: `{}`", plate.replace('`', "'")));
    }
    text.push_str(&format!("\n{}", event.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
    text
}

fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Map an HTTP exchange onto a delivery outcome.
///
/// Client errors other than rate limiting are permanent; everything else is
/// worth retrying.
pub(crate) fn classify_response(
    status: StatusCode,
    body: &str,
    acknowledged: impl Fn(&Value) -> bool,
) -> Result<(), DeliveryError> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(DeliveryError::Unavailable(format!("HTTP {status}")));
    }
    if status.is_client_error() {
        return Err(DeliveryError::Rejected(format!(
            "HTTP {status}: {}",
            truncate(body, 200)
        )));
    }
    if !status.is_success() {
        return Err(DeliveryError::Unavailable(format!("unexpected HTTP {status}")));
    }
    match serde_json::from_str::<Value>(body) {
        Ok(json) if acknowledged(&json) => Ok(()),
        Ok(json) => Err(DeliveryError::Rejected(format!(
            "not acknowledged: {}",
            truncate(&json.to_string(), 200)
        ))),
        Err(_) => Err(DeliveryError::Unavailable(format!(
            "non-JSON response: {}",
            truncate(body, 200)
        ))),
    }
}

fn transport_error(err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::Unavailable(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Ring of the most recent events for dashboard clients.
pub struct DashboardFeed {
    events: Mutex<VecDeque<CountEvent>>,
    capacity: usize,
}

impl DashboardFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: CountEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Events with an id greater than `last_id`, oldest first.
    pub fn since(&self, last_id: Option<u64>) -> Vec<CountEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .filter(|event| last_id.is_none_or(|last| event.id > last))
            .cloned()
            .collect()
    }

    pub fn latest_id(&self) -> Option<u64> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .map(|event| event.id)
    }
}

/// Sink side of the dashboard feed; never fails.
struct DashboardSink {
    feed: Arc<DashboardFeed>,
}

impl Sink for DashboardSink {
    fn name(&self) -> &str {
        "dashboard"
    }

    fn deliver(&mut self, event: &CountEvent) -> Result<(), DeliveryError> {
        self.feed.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use dockcount::{Direction, EventMetadata, ObjectClass, TrackId};

    use super::*;

    fn event(id: u64) -> CountEvent {
        CountEvent {
            id,
            direction: Direction::Inbound,
            timestamp: Utc::now(),
            track_id: TrackId(7),
            class: ObjectClass::Truck,
            metadata: EventMetadata {
                plate: Some("KA_01".into()),
                inbound_total: 3,
                outbound_total: 1,
            },
        }
    }

    fn sheets_ack(json: &Value) -> bool {
        json.get("status").and_then(Value::as_str) == Some("success")
    }

    #[test]
    fn test_classify_success_requires_ack() {
        assert!(classify_response(StatusCode::OK, r#"{"status":"success"}"#, sheets_ack).is_ok());
        assert!(matches!(
            classify_response(StatusCode::OK, r#"{"status":"error"}"#, sheets_ack),
            Err(DeliveryError::Rejected(_))
        ));
        assert!(matches!(
            classify_response(StatusCode::OK, "<html>login</html>", sheets_ack),
            Err(DeliveryError::Unavailable(_))
        ));
    }

    #[test]
    fn test_classify_status_codes() {
        assert!(matches!(
            classify_response(StatusCode::BAD_REQUEST, "bad", sheets_ack),
            Err(DeliveryError::Rejected(_))
        ));
        assert!(matches!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, "", sheets_ack),
            Err(DeliveryError::Unavailable(_))
        ));
        assert!(matches!(
            classify_response(StatusCode::BAD_GATEWAY, "", sheets_ack),
            Err(DeliveryError::Unavailable(_))
        ));
    }

    #[test]
    fn test_sheets_payload_fields() {
        let payload = SheetsSink::payload(&event(9));
        assert_eq!(payload["event_id"], 9);
        assert_eq!(payload["direction"], "inbound");
        assert_eq!(payload["plate"], "KA_01");
        assert_eq!(payload["inbound"], 3);
        assert_eq!(payload["class"], "truck");
    }

    #[test]
    fn test_telegram_message_escapes_markdown() {
        let text = telegram_message(&event(1));
        assert!(text.contains("*INBOUND*"));
        assert!(text.contains("In: 3 | Out: 1"));
        assert!(text.contains("`KA_01`"));
    }

    #[test]
    fn test_feed_keeps_latest_events() {
        let feed = Arc::new(DashboardFeed::new(2));
        let mut sink = DashboardSink { feed: feed.clone() };
        for id in 1..=3 {
            sink.deliver(&event(id)).unwrap();
        }
        let ids: Vec<u64> = feed.since(None).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(feed.since(Some(2)).len(), 1);
        assert_eq!(feed.latest_id(), Some(3));
    }
}
