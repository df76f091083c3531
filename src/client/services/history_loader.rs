use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::config::SessionConfig;
use crate::client::services::api_client::HistorySource;
use crate::common::error::Result;
use crate::common::models::{HistoryPage, Message};

/// Completion of a history fetch, delivered on the session's event queue.
#[derive(Debug)]
pub enum HistoryEvent {
    Fetched {
        ticket: u64,
        page: u32,
        append: bool,
        result: Result<HistoryPage>,
    },
    /// The settle delay after a fetch has elapsed.
    Settled { ticket: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryUpdate {
    None,
    Loaded {
        page: u32,
        append: bool,
        messages: Vec<Message>,
        has_more: bool,
    },
    Failed { page: u32 },
    /// Loading flag cleared; another page may be requested.
    Settled,
}

/// Paginated backfill of a room's persisted messages, newest page first.
pub struct HistoryLoader {
    source: Arc<dyn HistorySource>,
    room_id: String,
    username: String,
    page_size: u32,
    settle: Duration,
    page: u32,
    has_more: bool,
    in_flight: bool,
    cancelled: bool,
    ticket: u64,
    fetch_count: u64,
    events: mpsc::UnboundedSender<HistoryEvent>,
    task: Option<JoinHandle<()>>,
}

impl HistoryLoader {
    pub fn new(
        config: &SessionConfig,
        source: Arc<dyn HistorySource>,
        room_id: &str,
        username: &str,
    ) -> (Self, mpsc::UnboundedReceiver<HistoryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let loader = Self {
            source,
            room_id: room_id.to_string(),
            username: username.to_string(),
            page_size: config.page_size,
            settle: config.history_settle,
            page: 0,
            has_more: true,
            in_flight: false,
            cancelled: false,
            ticket: 0,
            fetch_count: 0,
            events,
            task: None,
        };
        (loader, rx)
    }

    /// Last page loaded successfully; 0 before the first one.
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight
    }

    /// Fetches actually dispatched to the source.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count
    }

    pub fn load_initial(&mut self) -> bool {
        self.load_page(1, false)
    }

    /// Scroll-to-end trigger: asks for the page after the last loaded one.
    pub fn load_more(&mut self) -> bool {
        if !self.has_more {
            debug!("[HISTORY] No more pages for room {}", self.room_id);
            return false;
        }
        self.load_page(self.page + 1, true)
    }

    /// Starts fetching `page` unless a fetch is already outstanding. Returns
    /// whether a request was dispatched.
    pub fn load_page(&mut self, page: u32, append: bool) -> bool {
        if self.cancelled || self.in_flight {
            return false;
        }

        self.in_flight = true;
        self.ticket += 1;
        self.fetch_count += 1;
        info!("[HISTORY] Fetching page {} for room {}", page, self.room_id);

        let ticket = self.ticket;
        let source = Arc::clone(&self.source);
        let events = self.events.clone();
        let room_id = self.room_id.clone();
        let username = self.username.clone();
        let limit = self.page_size;
        let settle = self.settle;

        self.task = Some(tokio::spawn(async move {
            let result = source.fetch_page(&room_id, &username, page, limit).await;
            let _ = events.send(HistoryEvent::Fetched {
                ticket,
                page,
                append,
                result,
            });
            tokio::time::sleep(settle).await;
            let _ = events.send(HistoryEvent::Settled { ticket });
        }));
        true
    }

    pub fn handle_event(&mut self, event: HistoryEvent) -> HistoryUpdate {
        if self.cancelled {
            return HistoryUpdate::None;
        }

        match event {
            HistoryEvent::Fetched { ticket, .. } | HistoryEvent::Settled { ticket }
                if ticket != self.ticket =>
            {
                HistoryUpdate::None
            }
            HistoryEvent::Fetched {
                page,
                append,
                result,
                ..
            } => match result {
                Ok(loaded) => {
                    debug!(
                        "[HISTORY] Page {} brought {} messages, has more: {}",
                        page,
                        loaded.messages.len(),
                        loaded.has_more
                    );
                    self.page = page;
                    self.has_more = loaded.has_more;
                    HistoryUpdate::Loaded {
                        page,
                        append,
                        messages: loaded.messages,
                        has_more: loaded.has_more,
                    }
                }
                Err(e) => {
                    warn!("[HISTORY] Error fetching page {}: {}", page, e);
                    HistoryUpdate::Failed { page }
                }
            },
            HistoryEvent::Settled { .. } => {
                self.in_flight = false;
                self.task = None;
                HistoryUpdate::Settled
            }
        }
    }

    /// Results of fetches still in flight will be ignored.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.in_flight = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HistoryLoader {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::SyncError;
    use crate::common::models::MessageKind;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    struct GatedSource {
        calls: AtomicUsize,
        gate: Semaphore,
        fail: bool,
    }

    #[async_trait]
    impl HistorySource for GatedSource {
        async fn fetch_page(&self, room_id: &str, _username: &str, page: u32, _limit: u32) -> Result<HistoryPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.expect("gate open");
            if self.fail {
                return Err(SyncError::Status { status: 503, body: "down".into() });
            }
            let message = Message {
                id: format!("p{}", page),
                room_id: room_id.to_string(),
                sender: "bob".into(),
                content: format!("page {}", page),
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
                    - ChronoDuration::minutes(page as i64),
                kind: MessageKind::Chat,
            };
            Ok(HistoryPage {
                messages: vec![message],
                has_more: page < 2,
            })
        }
    }

    fn loader(fail: bool, permits: usize) -> (HistoryLoader, mpsc::UnboundedReceiver<HistoryEvent>, Arc<GatedSource>) {
        let source = Arc::new(GatedSource {
            calls: AtomicUsize::new(0),
            gate: Semaphore::new(permits),
            fail,
        });
        let mut config = SessionConfig::default();
        config.history_settle = Duration::from_millis(0);
        let (loader, rx) = HistoryLoader::new(&config, source.clone(), "42", "alice");
        (loader, rx, source)
    }

    async fn settle(loader: &mut HistoryLoader, rx: &mut mpsc::UnboundedReceiver<HistoryEvent>) -> HistoryUpdate {
        let fetched = loader.handle_event(rx.recv().await.expect("fetched"));
        assert_eq!(loader.handle_event(rx.recv().await.expect("settled")), HistoryUpdate::Settled);
        fetched
    }

    #[tokio::test]
    async fn only_one_fetch_at_a_time() {
        let (mut loader, mut rx, source) = loader(false, 0);
        assert!(loader.load_initial());
        assert!(!loader.load_initial());
        assert!(!loader.load_more());
        assert!(loader.is_loading());

        source.gate.add_permits(10);
        let update = settle(&mut loader, &mut rx).await;
        assert!(matches!(update, HistoryUpdate::Loaded { page: 1, append: false, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.fetch_count(), 1);
        assert!(!loader.is_loading());
    }

    #[tokio::test]
    async fn pages_advance_until_exhausted() {
        let (mut loader, mut rx, _source) = loader(false, 10);
        loader.load_initial();
        settle(&mut loader, &mut rx).await;
        assert_eq!(loader.page(), 1);

        assert!(loader.load_more());
        let update = settle(&mut loader, &mut rx).await;
        assert!(matches!(update, HistoryUpdate::Loaded { page: 2, append: true, has_more: false, .. }));
        assert_eq!(loader.page(), 2);

        assert!(!loader.load_more());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cursor_alone() {
        let (mut loader, mut rx, _source) = loader(true, 10);
        loader.load_initial();
        assert_eq!(settle(&mut loader, &mut rx).await, HistoryUpdate::Failed { page: 1 });
        assert_eq!(loader.page(), 0);
        assert!(loader.has_more());

        // user can retry by scrolling again
        assert!(loader.load_more());
        assert_eq!(settle(&mut loader, &mut rx).await, HistoryUpdate::Failed { page: 1 });
    }

    #[tokio::test]
    async fn cancelled_results_are_ignored() {
        let (mut loader, mut rx, source) = loader(false, 0);
        loader.load_initial();
        loader.cancel();
        source.gate.add_permits(1);

        assert!(!loader.load_initial());
        assert_eq!(
            loader.handle_event(HistoryEvent::Settled { ticket: 1 }),
            HistoryUpdate::None
        );
        // the fetch task was aborted, nothing ever arrives
        drop(loader);
        assert!(rx.recv().await.is_none());
    }
}
