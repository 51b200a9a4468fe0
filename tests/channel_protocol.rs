//! Client and server talking over real transports with a scripted provider.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use modelport::protocol::{AvailabilityStatus, Turn, UsageInfo};
use modelport::provider::{
    AbortSignal, FragmentStream, ModelProvider, ModelSession, ProgressFn, ProviderAvailability,
    ProviderError,
};
use modelport::transport::{memory_transport, port_from_io, Port, Transport};
use modelport::{AppContext, BridgeError, ChannelClient, ChannelServer, ClientOptions};

const QUOTA: u64 = 4096;
const USAGE_AFTER_PROMPT: u64 = 410;
const REPLY: [&str; 6] = ["Hel", "lo", ", ", "wor", "ld", "!"];

struct ScriptedSession {
    id: String,
    usage: AtomicU64,
    destroyed: AtomicBool,
    fragment_delay: Duration,
}

#[async_trait]
impl ModelSession for ScriptedSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn input_usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    fn input_quota(&self) -> u64 {
        QUOTA
    }

    async fn prompt_streaming(
        &self,
        turns: Vec<Turn>,
        signal: AbortSignal,
    ) -> Result<FragmentStream, ProviderError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::Failed("Session has been destroyed".into()));
        }
        self.usage.store(USAGE_AFTER_PROMPT, Ordering::SeqCst);

        let last = turns.last().map(|t| t.content.clone()).unwrap_or_default();
        let fragments: Vec<String> = if last.contains("forever") {
            vec!["tick ".to_string(); 10_000]
        } else if last.contains("fail") {
            return Err(ProviderError::Failed("The model refused".into()));
        } else {
            REPLY.iter().map(|s| s.to_string()).collect()
        };

        let delay = self.fragment_delay;
        let stream = futures::stream::iter(fragments)
            .then(move |fragment| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, ProviderError>(fragment)
            })
            .take_until(async move { signal.aborted().await });
        Ok(stream.boxed())
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

struct ScriptedProvider {
    availability: ProviderAvailability,
    fragment_delay: Duration,
    download_steps: usize,
    download_step_delay: Duration,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
    completed_downloads: AtomicUsize,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            availability: ProviderAvailability::Available,
            fragment_delay: Duration::from_millis(1),
            download_steps: 4,
            download_step_delay: Duration::from_millis(1),
            sessions: Mutex::new(Vec::new()),
            completed_downloads: AtomicUsize::new(0),
        }
    }

    fn live_sessions(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|s| !s.destroyed.load(Ordering::SeqCst))
            .count()
    }

    fn created_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn availability(&self) -> Result<ProviderAvailability, ProviderError> {
        Ok(self.availability.clone())
    }

    async fn create_session(&self) -> Result<Arc<dyn ModelSession>, ProviderError> {
        let mut sessions = self.sessions.lock();
        let session = Arc::new(ScriptedSession {
            id: format!("session-{}", sessions.len() + 1),
            usage: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            fragment_delay: self.fragment_delay,
        });
        sessions.push(session.clone());
        Ok(session)
    }

    async fn download(
        &self,
        on_progress: ProgressFn,
        signal: AbortSignal,
    ) -> Result<(), ProviderError> {
        for step in 1..=self.download_steps {
            tokio::select! {
                biased;
                _ = signal.aborted() => return Err(ProviderError::Aborted),
                _ = tokio::time::sleep(self.download_step_delay) => {}
            }
            on_progress(step as f64 / self.download_steps as f64);
        }
        self.completed_downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn connect(provider: Arc<ScriptedProvider>) -> Arc<ChannelClient> {
    let (transport, listener) = memory_transport();
    let server = ChannelServer::new(provider);
    tokio::spawn(async move { server.serve(listener).await });
    Arc::new(ChannelClient::new(
        Arc::new(transport),
        ClientOptions::default(),
    ))
}

async fn reply_text(client: &ChannelClient, message: &str) -> String {
    let stream = client
        .prompt_streaming(message, &[], &AppContext::default())
        .await
        .unwrap();
    let fragments: Vec<String> = stream.map(|item| item.unwrap()).collect().await;
    fragments.concat()
}

#[tokio::test]
async fn availability_status_mapping_is_total() {
    let cases = [
        (ProviderAvailability::Available, AvailabilityStatus::Ready, true),
        (ProviderAvailability::Downloadable, AvailabilityStatus::NeedsDownload, true),
        (ProviderAvailability::Downloading, AvailabilityStatus::Downloading, false),
        (ProviderAvailability::Unavailable, AvailabilityStatus::Unavailable, false),
        (
            ProviderAvailability::Other("after-download".into()),
            AvailabilityStatus::Unavailable,
            false,
        ),
    ];

    for (reported, expected, available) in cases {
        let provider = ScriptedProvider {
            availability: reported.clone(),
            ..ScriptedProvider::new()
        };
        let client = connect(Arc::new(provider));
        let result = client.check_availability().await;
        assert_eq!(result.status, expected, "for {:?}", reported);
        assert_eq!(result.available, available, "for {:?}", reported);
    }
}

#[tokio::test]
async fn prompt_without_session_is_rejected_locally() {
    let provider = Arc::new(ScriptedProvider::new());
    let client = connect(provider.clone());

    let result = client
        .prompt_streaming("hi", &[], &AppContext::default())
        .await;

    assert_eq!(result.err(), Some(BridgeError::NoActiveSession));
    assert_eq!(provider.created_sessions(), 0);
}

#[tokio::test]
async fn usage_reports_rounded_percentage() {
    let provider = Arc::new(ScriptedProvider::new());
    let client = connect(provider.clone());

    assert_eq!(client.get_usage_info().await, Ok(None));

    assert_eq!(client.create_session().await, Ok(true));
    assert!(client.has_active_session());
    assert_eq!(reply_text(&client, "hi").await, "Hello, world!");

    assert_eq!(
        client.get_usage_info().await,
        Ok(Some(UsageInfo {
            input_usage: 410,
            input_quota: 4096,
            percent_used: 10,
        }))
    );
}

#[tokio::test]
async fn destroy_then_create_leaves_one_fresh_session() {
    let provider = Arc::new(ScriptedProvider::new());
    let client = connect(provider.clone());

    client.create_session().await.unwrap();
    reply_text(&client, "hi").await;

    client.destroy_session().await;
    assert!(!client.has_active_session());
    assert_eq!(provider.live_sessions(), 0);

    client.create_session().await.unwrap();
    assert_eq!(
        client.get_usage_info().await,
        Ok(Some(UsageInfo::new(0, QUOTA)))
    );
    assert_eq!(provider.live_sessions(), 1);
    assert_eq!(provider.created_sessions(), 2);
}

#[tokio::test]
async fn create_session_twice_replaces_the_handle() {
    let provider = Arc::new(ScriptedProvider::new());
    let client = connect(provider.clone());

    client.create_session().await.unwrap();
    client.create_session().await.unwrap();

    assert_eq!(provider.created_sessions(), 2);
    assert_eq!(provider.live_sessions(), 1);
}

#[tokio::test]
async fn buffered_and_immediate_consumption_yield_the_same_text() {
    let provider = Arc::new(ScriptedProvider::new());
    let client = connect(provider);
    client.create_session().await.unwrap();

    let immediate = reply_text(&client, "hi").await;

    let stream = client
        .prompt_streaming("hi", &[], &AppContext::default())
        .await
        .unwrap();
    // Let every chunk arrive before the first pull.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let buffered: Vec<String> = stream.map(|item| item.unwrap()).collect().await;

    assert_eq!(immediate, REPLY.concat());
    assert_eq!(buffered.concat(), immediate);
}

#[tokio::test]
async fn provider_failure_surfaces_on_the_stream() {
    let provider = Arc::new(ScriptedProvider::new());
    let client = connect(provider);
    client.create_session().await.unwrap();

    let mut stream = client
        .prompt_streaming("please fail", &[], &AppContext::default())
        .await
        .unwrap();

    assert_eq!(
        stream.next().await,
        Some(Err(BridgeError::Provider("The model refused".into())))
    );
    assert_eq!(stream.next().await, None);
    // The session survives a failed prompt.
    assert_eq!(reply_text(&client, "hi").await, "Hello, world!");
}

#[tokio::test]
async fn new_prompt_aborts_the_running_one() {
    let provider = Arc::new(ScriptedProvider::new());
    let client = connect(provider);
    client.create_session().await.unwrap();

    let mut first = client
        .prompt_streaming("talk forever", &[], &AppContext::default())
        .await
        .unwrap();
    assert_eq!(first.next().await, Some(Ok("tick ".to_string())));

    let second = client
        .prompt_streaming("hi", &[], &AppContext::default())
        .await
        .unwrap();

    let mut tail = Vec::new();
    while let Some(item) = first.next().await {
        tail.push(item);
    }
    assert_eq!(tail.last(), Some(&Err(BridgeError::Aborted)));
    assert!(tail[..tail.len() - 1]
        .iter()
        .all(|item| item.as_deref() == Ok("tick ")));

    let fragments: Vec<String> = second.map(|item| item.unwrap()).collect().await;
    assert_eq!(fragments.concat(), "Hello, world!");
}

#[tokio::test]
async fn only_the_latest_download_completes() {
    let provider = Arc::new(ScriptedProvider {
        download_steps: 50,
        download_step_delay: Duration::from_millis(5),
        ..ScriptedProvider::new()
    });
    let client = connect(provider.clone());

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let first = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .download_model(move |p| {
                    let _ = first_tx.send(p);
                })
                .await
        }
    });
    // Wait until the first download is visibly underway.
    first_rx.recv().await.unwrap();

    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    let second = client
        .download_model(move |p| {
            let _ = second_tx.send(p);
        })
        .await;

    assert_eq!(first.await.unwrap(), Err(BridgeError::Aborted));
    assert_eq!(second, Ok(()));
    assert_eq!(provider.completed_downloads.load(Ordering::SeqCst), 1);
    assert!(client.has_active_session());

    // The first callback was dropped with its call and never saw completion.
    let mut first_progress = Vec::new();
    while let Some(p) = first_rx.recv().await {
        first_progress.push(p);
    }
    assert!(first_progress.iter().all(|p| *p < 1.0));

    let mut second_progress = Vec::new();
    while let Ok(p) = second_rx.try_recv() {
        second_progress.push(p);
    }
    assert_eq!(second_progress.len(), 50);
    assert!(second_progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(second_progress.last(), Some(&1.0));
}

/// Serves every opened channel as JSON lines over an in-memory byte pipe.
struct LinesTransport {
    server: ChannelServer,
}

#[async_trait]
impl Transport for LinesTransport {
    async fn open(&self, name: &str) -> Result<Port, BridgeError> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let server = self.server.clone();
        let server_port = port_from_io(name, server_read, server_write);
        tokio::spawn(async move { server.serve_port(server_port).await });

        Ok(port_from_io(name, client_read, client_write))
    }
}

#[tokio::test]
async fn full_conversation_over_json_lines() {
    let provider = Arc::new(ScriptedProvider::new());
    let transport = LinesTransport {
        server: ChannelServer::new(provider.clone()),
    };
    let client = ChannelClient::new(Arc::new(transport), ClientOptions::default());

    assert_eq!(
        client.check_availability().await.status,
        AvailabilityStatus::Ready
    );
    client.create_session().await.unwrap();

    let history = vec![Turn::user("earlier"), Turn::assistant("noted")];
    let stream = client
        .prompt_streaming("hi", &history, &AppContext::default())
        .await
        .unwrap();
    let fragments: Vec<String> = stream.map(|item| item.unwrap()).collect().await;
    assert_eq!(fragments.concat(), "Hello, world!");

    let usage = client.get_usage_info().await.unwrap().unwrap();
    assert_eq!(usage.percent_used, 10);

    client.destroy_session().await;
    assert_eq!(provider.live_sessions(), 0);
}
