use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};

use crate::backend::ConfigBackend;
use crate::cache::{ConfigCache, Snapshot};
use crate::classifier::passes_length_gate;
use crate::dedupe::{Deduplicator, Verdict};
use crate::error::StageError;
use crate::lead::Lead;
use crate::platform::IncomingMessage;
use crate::sink::WebhookSink;

/// What happened to a lead after it was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Duplicate,
    Failed,
}

/// Running counters, logged by the heartbeat job.
#[derive(Debug, Default)]
pub struct Stats {
    pub received: AtomicU64,
    pub filtered: AtomicU64,
    pub relevant: AtomicU64,
    pub duplicates: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    /// Leads dispatched but not finished, including those waiting for a slot
    pub pending: AtomicU64,
}

impl Stats {
    pub fn summary(&self) -> String {
        format!(
            "received={} filtered={} relevant={} duplicates={} delivered={} failed={} pending={}",
            self.received.load(Ordering::Relaxed),
            self.filtered.load(Ordering::Relaxed),
            self.relevant.load(Ordering::Relaxed),
            self.duplicates.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.pending.load(Ordering::Relaxed),
        )
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Length gate → classification → (spawned) dedupe → delivery → record.
///
/// Classification runs inline on the caller's task; everything that does I/O
/// runs in a spawned task bounded by a semaphore, so a slow webhook never
/// holds up the event stream. Failures are logged here and never returned to
/// the event source.
#[derive(Clone)]
pub struct Pipeline {
    cache: ConfigCache,
    backend: Arc<dyn ConfigBackend>,
    sink: WebhookSink,
    dedupe: Deduplicator,
    permits: Arc<Semaphore>,
    stats: Arc<Stats>,
}

impl Pipeline {
    pub fn new(
        cache: ConfigCache,
        backend: Arc<dyn ConfigBackend>,
        sink: WebhookSink,
        max_in_flight: usize,
    ) -> Self {
        Self {
            cache,
            backend,
            sink,
            dedupe: Deduplicator::new(),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cache.snapshot()
    }

    pub fn cache(&self) -> &ConfigCache {
        &self.cache
    }

    pub fn backend(&self) -> Arc<dyn ConfigBackend> {
        self.backend.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Handle one message against the snapshot the caller already took.
    ///
    /// Returns the handle of the delivery task when the message is a lead.
    pub fn process(
        &self,
        message: IncomingMessage,
        snapshot: &Snapshot,
    ) -> Option<JoinHandle<DeliveryOutcome>> {
        bump(&self.stats.received);

        let min_len = snapshot.min_message_length();
        if !passes_length_gate(&message.text, min_len) {
            bump(&self.stats.filtered);
            debug!(
                "Skipping short message {} in {} ({}): < {} chars",
                message.message_id, message.chat.title, message.chat_id, min_len
            );
            return None;
        }

        let analysis = snapshot.keywords.classify(&message.text);
        if !analysis.is_relevant {
            return None;
        }
        bump(&self.stats.relevant);

        let lead = Lead::new(message, analysis);
        info!("Lead found in {}: {}", lead.chat.title, lead.preview(50));

        if self.permits.available_permits() == 0 {
            warn!(
                "Webhook delivery backlog: all slots busy, {} leads pending",
                self.stats.pending.load(Ordering::Relaxed) + 1
            );
        }
        self.stats.pending.fetch_add(1, Ordering::Relaxed);

        let this = self.clone();
        Some(tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(this.dispatch(&lead)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    bump(&this.stats.failed);
                    error!(
                        "Delivery task panicked: {}/{}",
                        lead.chat_key(),
                        lead.message_id
                    );
                    DeliveryOutcome::Failed
                }
            };
            this.stats.pending.fetch_sub(1, Ordering::Relaxed);
            outcome
        }))
    }

    async fn dispatch(&self, lead: &Lead) -> DeliveryOutcome {
        // The semaphore is never closed
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return DeliveryOutcome::Failed,
        };

        let (verdict, lookup_error) = self
            .dedupe
            .claim(self.backend.as_ref(), lead.chat_key(), lead.message_id)
            .await;
        if let Some(e) = lookup_error {
            report(lead, &e);
        }

        let _claim = match verdict {
            Verdict::Fresh(claim) => claim,
            Verdict::InFlight | Verdict::Recorded => {
                bump(&self.stats.duplicates);
                info!("Duplicate skipped: {}/{}", lead.chat_key(), lead.message_id);
                return DeliveryOutcome::Duplicate;
            }
        };

        if let Err(e) = self.sink.deliver(lead).await {
            bump(&self.stats.failed);
            report(lead, &StageError::from(e));
            return DeliveryOutcome::Failed;
        }
        bump(&self.stats.delivered);
        info!("Sent to webhook: {}/{}", lead.chat_key(), lead.message_id);

        if let Err(e) = self.backend.record_lead(lead).await {
            report(lead, &StageError::Record(e));
        }

        DeliveryOutcome::Delivered
    }
}

/// Bookkeeping failures and webhook timeouts are warnings; the rest are
/// errors.
fn severity(err: &StageError) -> Level {
    match err {
        StageError::Record(_) | StageError::Metadata(_) => Level::WARN,
        StageError::Delivery(e) if e.is_timeout() => Level::WARN,
        _ => Level::ERROR,
    }
}

fn report(lead: &Lead, err: &StageError) {
    let chat = lead.chat_key();
    if severity(err) == Level::WARN {
        warn!("[{}] {}/{}: {}", err.stage(), chat, lead.message_id, err);
    } else {
        error!("[{}] {}/{}: {}", err.stage(), chat, lead.message_id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SqliteStore, StaticBackend};
    use crate::classifier::KeywordSet;
    use crate::error::DeliveryError;
    use crate::lead::{ChatInfo, ChatKind, SenderInfo};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Local webhook that records payloads and answers with a scripted status.
    #[derive(Clone, Default)]
    struct Hook {
        received: Arc<Mutex<Vec<Value>>>,
        fail_first: Arc<AtomicUsize>,
    }

    async fn serve(hook: Hook, delay: Duration) -> String {
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<Value>| {
                let hook = hook.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    if hook
                        .fail_first
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return StatusCode::BAD_GATEWAY;
                    }
                    hook.received.lock().await.push(body);
                    StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    fn keywords() -> KeywordSet {
        KeywordSet::new(["сниму", "снять"], ["куплю"], ["квартир", "комнат"])
    }

    fn pipeline(url: &str, backend: Arc<dyn ConfigBackend>) -> Pipeline {
        let cache = ConfigCache::new(Snapshot::new(
            vec!["pattaya_arenda".to_string()],
            keywords(),
            20,
        ));
        let sink = WebhookSink::new(url, Duration::from_secs(2)).unwrap();
        Pipeline::new(cache, backend, sink, 4)
    }

    fn static_backend() -> Arc<dyn ConfigBackend> {
        Arc::new(StaticBackend::new(vec![], keywords(), 20))
    }

    fn lead_message(id: i32, text: &str) -> IncomingMessage {
        message(id, text, Some("pattaya_arenda"))
    }

    fn message(id: i32, text: &str, username: Option<&str>) -> IncomingMessage {
        IncomingMessage {
            chat_id: -100500,
            message_id: id,
            text: text.to_string(),
            date: chrono::Utc::now(),
            chat: ChatInfo {
                title: "Pattaya Rent".to_string(),
                username: username.map(str::to_string),
                kind: Some(ChatKind::Supergroup),
            },
            sender: SenderInfo::default(),
        }
    }

    #[tokio::test]
    async fn test_short_message_is_filtered_before_classification() {
        let hook = Hook::default();
        let url = serve(hook.clone(), Duration::ZERO).await;
        let pipeline = pipeline(&url, static_backend());
        let snapshot = pipeline.snapshot();

        // Relevant keywords, but only 14 characters
        let short = message(1, "Сниму квартиру", Some("pattaya_arenda"));
        let handle = pipeline.process(short, &snapshot);
        assert!(handle.is_none());
        assert_eq!(pipeline.stats().filtered.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().relevant.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_irrelevant_message_is_not_dispatched() {
        let url = serve(Hook::default(), Duration::ZERO).await;
        let pipeline = pipeline(&url, static_backend());
        let snapshot = pipeline.snapshot();

        let handle = pipeline.process(
            message(2, "Кто знает хороший ресторан в Джомтьене?", Some("pattaya_arenda")),
            &snapshot,
        );
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_lead_is_delivered_with_link() {
        let hook = Hook::default();
        let url = serve(hook.clone(), Duration::ZERO).await;
        let pipeline = pipeline(&url, static_backend());
        let snapshot = pipeline.snapshot();

        let outcome = pipeline
            .process(
                message(3, "Ищу снять квартиру в Паттайе на месяц", Some("pattaya_arenda")),
                &snapshot,
            )
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let outcome = pipeline
            .process(message(4, "Ищу снять квартиру в Паттайе на месяц", None), &snapshot)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let received = hook.received.lock().await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0]["message_link"], "https://t.me/pattaya_arenda/3");
        assert_eq!(received[0]["keyword_analysis"]["has_rent_intent"], true);
        assert_eq!(received[0]["keyword_analysis"]["has_buy_intent"], false);
        assert!(received[1]["message_link"].is_null());
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_stop_next_message() {
        let hook = Hook::default();
        hook.fail_first.store(1, Ordering::SeqCst);
        let url = serve(hook.clone(), Duration::ZERO).await;
        let pipeline = pipeline(&url, static_backend());
        let snapshot = pipeline.snapshot();

        let first = pipeline
            .process(lead_message(5, "Сниму комнату недалеко от пляжа"), &snapshot)
            .unwrap()
            .await
            .unwrap();
        let second = pipeline
            .process(lead_message(6, "Куплю квартиру с видом на море"), &snapshot)
            .unwrap()
            .await
            .unwrap();

        assert_eq!(first, DeliveryOutcome::Failed);
        assert_eq!(second, DeliveryOutcome::Delivered);
        assert_eq!(pipeline.stats().failed.load(Ordering::Relaxed), 1);
        assert_eq!(hook.received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_contained() {
        let pipeline = pipeline("http://127.0.0.1:1/hook", static_backend());
        let snapshot = pipeline.snapshot();

        let outcome = pipeline
            .process(lead_message(7, "Сниму комнату недалеко от пляжа"), &snapshot)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Failed);
    }

    #[tokio::test]
    async fn test_recorded_lead_is_suppressed() {
        let hook = Hook::default();
        let url = serve(hook.clone(), Duration::ZERO).await;
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_chat("pattaya_arenda").await.unwrap();
        let pipeline = pipeline(&url, Arc::new(store.clone()));
        let snapshot = pipeline.snapshot();

        let text = "Ищу снять квартиру в Паттайе на месяц";
        let first = pipeline
            .process(message(8, text, Some("pattaya_arenda")), &snapshot)
            .unwrap()
            .await
            .unwrap();
        let second = pipeline
            .process(message(8, text, Some("pattaya_arenda")), &snapshot)
            .unwrap()
            .await
            .unwrap();

        assert_eq!(first, DeliveryOutcome::Delivered);
        assert_eq!(second, DeliveryOutcome::Duplicate);
        assert_eq!(hook.received.lock().await.len(), 1);
        assert_eq!(store.leads_count("pattaya_arenda").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_message_delivers_once() {
        let hook = Hook::default();
        let url = serve(hook.clone(), Duration::from_millis(200)).await;
        let store = SqliteStore::open_in_memory().unwrap();
        let pipeline = pipeline(&url, Arc::new(store));
        let snapshot = pipeline.snapshot();

        let text = "Ищу снять квартиру в Паттайе на месяц";
        let a = pipeline
            .process(message(9, text, Some("pattaya_arenda")), &snapshot)
            .unwrap();
        let b = pipeline
            .process(message(9, text, Some("pattaya_arenda")), &snapshot)
            .unwrap();

        let mut outcomes = vec![a.await.unwrap(), b.await.unwrap()];
        outcomes.sort_by_key(|o| *o == DeliveryOutcome::Duplicate);
        assert_eq!(
            outcomes,
            vec![DeliveryOutcome::Delivered, DeliveryOutcome::Duplicate]
        );
        assert_eq!(hook.received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_counts_queued_deliveries() {
        let hook = Hook::default();
        let url = serve(hook.clone(), Duration::from_millis(200)).await;
        let cache = ConfigCache::new(Snapshot::new(
            vec!["pattaya_arenda".to_string()],
            keywords(),
            20,
        ));
        let sink = WebhookSink::new(&url, Duration::from_secs(2)).unwrap();
        let pipeline = Pipeline::new(cache, static_backend(), sink, 1);
        let snapshot = pipeline.snapshot();

        let a = pipeline
            .process(lead_message(10, "Сниму комнату недалеко от пляжа"), &snapshot)
            .unwrap();
        let b = pipeline
            .process(lead_message(11, "Куплю квартиру с видом на море"), &snapshot)
            .unwrap();
        assert_eq!(pipeline.stats().pending.load(Ordering::Relaxed), 2);
        assert!(pipeline.stats().summary().contains("pending=2"));

        assert_eq!(a.await.unwrap(), DeliveryOutcome::Delivered);
        assert_eq!(b.await.unwrap(), DeliveryOutcome::Delivered);
        assert_eq!(pipeline.stats().pending.load(Ordering::Relaxed), 0);
        assert_eq!(hook.received.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_timeout_is_a_warning() {
        let url = serve(Hook::default(), Duration::from_secs(5)).await;
        let sink = WebhookSink::new(&url, Duration::from_millis(200)).unwrap();
        let lead = Lead::new(
            lead_message(12, "Сниму комнату недалеко от пляжа"),
            keywords().classify("Сниму комнату недалеко от пляжа"),
        );

        let timeout = sink.deliver(&lead).await.unwrap_err();
        assert_eq!(severity(&StageError::from(timeout)), Level::WARN);

        let rejected = DeliveryError::Status {
            status: reqwest::StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert_eq!(severity(&StageError::from(rejected)), Level::ERROR);
        assert_eq!(
            severity(&StageError::Record(anyhow::anyhow!("rpc down"))),
            Level::WARN
        );
    }
}
