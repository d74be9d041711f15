//! Stub collaborators and state builders for tests.
//!
//! The stubs stand in for the llama-server processes: scripted delta
//! streams, canned vectors, and enough instrumentation (load counters,
//! concurrency high-water marks, pacing semaphores) to pin down the gate
//! and swap behavior.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use unified_ai_common::ChatMessage;

use crate::error::{Error, Result};
use crate::model::{LoadedModel, ModelBackend, SamplingParams, TextEncoder, TokenStream};

/// Tracks how many stub operations are inside the accelerator at once.
///
/// Share one meter between a backend and an encoder to assert that nothing
/// ever overlaps across capability classes.
#[derive(Default)]
pub struct ActivityMeter {
    active: AtomicUsize,
    high_water: AtomicUsize,
}

impl ActivityMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(self: Arc<Self>) -> ActivityPermit {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        ActivityPermit(self)
    }

    /// Highest number of concurrently active stub operations observed.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

pub struct ActivityPermit(Arc<ActivityMeter>);

impl Drop for ActivityPermit {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct StubShared {
    deltas: Vec<String>,
    template: Option<String>,
    trailing_error: Option<String>,
    fail_all_loads: bool,
    fail_next_load: AtomicBool,
    /// When set, each delta consumes one permit; tests feed permits to pace
    /// the stream.
    pacing: Option<Arc<Semaphore>>,
    meter: Arc<ActivityMeter>,
    loads: StdMutex<Vec<String>>,
    releases: AtomicUsize,
    prompts: StdMutex<Vec<String>>,
    params: StdMutex<Vec<SamplingParams>>,
}

/// Scripted [`ModelBackend`]: every loaded model generates the same fixed
/// delta sequence.
pub struct StubBackend {
    shared: Arc<StubShared>,
}

impl StubBackend {
    pub fn with_deltas(deltas: Vec<&str>) -> Self {
        Self {
            shared: Arc::new(StubShared {
                deltas: deltas.into_iter().map(String::from).collect(),
                template: None,
                trailing_error: None,
                fail_all_loads: false,
                fail_next_load: AtomicBool::new(false),
                pacing: None,
                meter: ActivityMeter::new(),
                loads: StdMutex::new(Vec::new()),
                releases: AtomicUsize::new(0),
                prompts: StdMutex::new(Vec::new()),
                params: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn failing_loads() -> Self {
        let mut stub = Self::with_deltas(vec![]);
        Self::shared_mut(&mut stub).fail_all_loads = true;
        stub
    }

    /// Every loaded model renders conversations to this fixed prompt.
    pub fn with_template(mut self, template: &str) -> Self {
        Self::shared_mut(&mut self).template = Some(template.to_string());
        self
    }

    /// The delta stream yields an error after the scripted deltas.
    pub fn with_trailing_error(mut self, message: &str) -> Self {
        Self::shared_mut(&mut self).trailing_error = Some(message.to_string());
        self
    }

    /// Pace the delta stream: each delta waits for one permit.
    pub fn paced(mut self, pacing: Arc<Semaphore>) -> Self {
        Self::shared_mut(&mut self).pacing = Some(pacing);
        self
    }

    pub fn with_meter(mut self, meter: Arc<ActivityMeter>) -> Self {
        Self::shared_mut(&mut self).meter = meter;
        self
    }

    fn shared_mut(stub: &mut Self) -> &mut StubShared {
        Arc::get_mut(&mut stub.shared).expect("configure the stub before sharing it")
    }

    /// Make exactly the next load fail.
    pub fn fail_next_load(&self) {
        self.shared.fail_next_load.store(true, Ordering::SeqCst);
    }

    pub fn loads_of(&self, identity: &str) -> usize {
        self.shared
            .loads
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.as_str() == identity)
            .count()
    }

    pub fn total_loads(&self) -> usize {
        self.shared.loads.lock().unwrap().len()
    }

    pub fn releases(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }

    /// Prompts passed to `generate`, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.shared.prompts.lock().unwrap().clone()
    }

    /// Sampling parameters passed to `generate`, in call order.
    pub fn params(&self) -> Vec<SamplingParams> {
        self.shared.params.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for StubBackend {
    async fn load(&self, identity: &str) -> Result<Box<dyn LoadedModel>> {
        if self.shared.fail_all_loads || self.shared.fail_next_load.swap(false, Ordering::SeqCst) {
            return Err(Error::Communication("stub load failure".to_string()));
        }
        self.shared.loads.lock().unwrap().push(identity.to_string());
        Ok(Box::new(StubModel {
            shared: self.shared.clone(),
        }))
    }
}

struct StubModel {
    shared: Arc<StubShared>,
}

#[async_trait]
impl LoadedModel for StubModel {
    async fn apply_chat_template(&self, _messages: &[ChatMessage]) -> Option<String> {
        self.shared.template.clone()
    }

    async fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<TokenStream> {
        self.shared.prompts.lock().unwrap().push(prompt.to_string());
        self.shared.params.lock().unwrap().push(*params);

        let shared = self.shared.clone();
        let permit = shared.meter.clone().enter();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            // The permit spans the whole stream so overlapping generations
            // show up in the meter's high-water mark.
            let _permit = permit;
            for delta in shared.deltas.clone() {
                if let Some(pacing) = &shared.pacing {
                    match pacing.acquire().await {
                        Ok(permit) => permit.forget(),
                        Err(_closed) => break,
                    }
                }
                if tx.send(Ok(delta)).await.is_err() {
                    break;
                }
            }
            if let Some(message) = &shared.trailing_error {
                let _ = tx
                    .send(Err(Error::Communication(message.clone())))
                    .await;
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn release(&mut self) {
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Echo [`TextEncoder`]: each vector is `[text length, batch position]`, so
/// tests can verify both the prefix policy and order preservation.
pub struct StubEncoder {
    meter: Arc<ActivityMeter>,
    received: StdMutex<Vec<Vec<String>>>,
    fail: bool,
}

impl StubEncoder {
    pub fn new() -> Self {
        Self {
            meter: ActivityMeter::new(),
            received: StdMutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn with_meter(mut self, meter: Arc<ActivityMeter>) -> Self {
        self.meter = meter;
        self
    }

    /// Batches seen by `encode`, in call order.
    pub fn received(&self) -> Vec<Vec<String>> {
        self.received.lock().unwrap().clone()
    }
}

impl Default for StubEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextEncoder for StubEncoder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self.meter.clone().enter();
        // Yield so a concurrent (incorrectly unserialized) operation would
        // get a chance to overlap and trip the meter.
        tokio::task::yield_now().await;

        if self.fail {
            return Err(Error::Communication("stub encode failure".to_string()));
        }

        self.received.lock().unwrap().push(texts.to_vec());
        Ok(texts
            .iter()
            .enumerate()
            .map(|(position, text)| vec![text.len() as f32, position as f32])
            .collect())
    }
}
