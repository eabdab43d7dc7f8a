use crate::client::CompletionRequest;
use crate::errors::{BibSortError, Result};
use crate::preprocess::ProcessedPayload;
use crate::task::ImageTask;
use crate::traits::{BibDetector, CompletionTransport, PayloadPreparer, Sleeper};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// テスト用のトランスポート：台本どおりに応答する
///
/// Replies are taken from the script in order; once it runs out the
/// fallback reply (if any) is repeated.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<String>>>,
    fallback: Option<String>,
    latency: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::default()
        }
    }

    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self.script.lock().pop_front();
        match (next, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Err(BibSortError::FatalApi {
                status: None,
                message: "script exhausted".to_string(),
            }),
        }
    }
}

/// テスト用のスリーパー：待たずに要求された時間を記録する
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}

/// テスト用の検出器：ファイル名ごとに決められた番号を返す
///
/// Unknown file names detect nothing. Every call is counted per path so
/// tests can check that no image was processed twice, and the number of
/// concurrent calls is tracked so tests can check the pool bound.
#[derive(Debug, Default)]
pub struct ScriptedDetector {
    answers: HashMap<String, BTreeSet<String>>,
    failing: BTreeSet<String>,
    panicking: BTreeSet<String>,
    latency: Option<(u64, u64)>,
    seen: Mutex<HashMap<PathBuf, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// 同時実行数のゲージ：ドロップ時に減らす
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(current)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answer(mut self, file_name: &str, numbers: &[&str]) -> Self {
        self.answers.insert(
            file_name.to_string(),
            numbers.iter().map(|n| n.to_string()).collect(),
        );
        self
    }

    pub fn with_failure(mut self, file_name: &str) -> Self {
        self.failing.insert(file_name.to_string());
        self
    }

    pub fn with_panic(mut self, file_name: &str) -> Self {
        self.panicking.insert(file_name.to_string());
        self
    }

    /// Sleep a per-path pseudo-random time in `min_ms..=max_ms` before answering.
    pub const fn with_latency_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.latency = Some((min_ms, max_ms));
        self
    }

    pub fn calls_for(&self, path: &Path) -> usize {
        self.seen.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.seen.lock().values().sum()
    }

    /// Highest number of `detect` calls that were running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl BibDetector for ScriptedDetector {
    async fn detect(&self, payload: &ProcessedPayload) -> Result<BTreeSet<String>> {
        let path = payload.source().to_path_buf();
        *self.seen.lock().entry(path.clone()).or_default() += 1;
        let _gauge = InFlight::enter(&self.in_flight, &self.max_in_flight);

        if let Some((min_ms, max_ms)) = self.latency {
            let spread = max_ms.saturating_sub(min_ms) + 1;
            let hash = path
                .to_string_lossy()
                .bytes()
                .fold(17u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            tokio::time::sleep(Duration::from_millis(min_ms + hash % spread)).await;
        }

        let name = file_name(&path);
        if self.panicking.contains(&name) {
            panic!("detector blew up on {name}");
        }
        if self.failing.contains(&name) {
            return Err(BibSortError::DetectionFailed {
                path,
                attempts: 3,
                source: Box::new(BibSortError::from_status(503, "scripted outage")),
            });
        }
        Ok(self.answers.get(&name).cloned().unwrap_or_default())
    }
}

/// テスト用の前処理：画像を読まずにパスだけのペイロードを返す
#[derive(Debug, Default)]
pub struct PassthroughPreparer {
    unreadable: BTreeSet<String>,
    panicking: BTreeSet<String>,
}

impl PassthroughPreparer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unreadable(mut self, file_name: &str) -> Self {
        self.unreadable.insert(file_name.to_string());
        self
    }

    pub fn with_panic(mut self, file_name: &str) -> Self {
        self.panicking.insert(file_name.to_string());
        self
    }
}

impl PayloadPreparer for PassthroughPreparer {
    fn prepare(&self, task: &ImageTask) -> Result<ProcessedPayload> {
        let name = file_name(task.path());
        if self.panicking.contains(&name) {
            panic!("preparer blew up on {name}");
        }
        if self.unreadable.contains(&name) {
            return Err(BibSortError::UnreadableImage {
                path: task.path().to_path_buf(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "scripted decode failure",
                )),
            });
        }
        Ok(ProcessedPayload::new(
            task.path(),
            name.into_bytes(),
            "image/jpeg",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_transport_order_and_fallback() {
        let transport = ScriptedTransport::new(vec![
            Err(BibSortError::from_status(500, "boom")),
            Ok("1".to_string()),
        ]);
        let request = CompletionRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            max_tokens: 1,
            provider: None,
        };

        assert!(transport.complete(&request).await.is_err());
        assert_eq!(transport.complete(&request).await.unwrap(), "1");
        assert!(transport.complete(&request).await.is_err());
        assert_eq!(transport.calls(), 3);
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_detector_counts_calls() -> Result<()> {
        let detector = ScriptedDetector::new().with_answer("a.jpg", &["123"]);
        let payload = ProcessedPayload::new("dir/a.jpg", Vec::new(), "image/jpeg");

        let numbers = detector.detect(&payload).await?;
        assert!(numbers.contains("123"));
        assert_eq!(detector.calls_for(Path::new("dir/a.jpg")), 1);
        assert_eq!(detector.total_calls(), 1);
        assert_eq!(detector.max_in_flight(), 1);
        Ok(())
    }

    #[test]
    fn test_passthrough_preparer() {
        let preparer = PassthroughPreparer::new().with_unreadable("bad.jpg");
        assert!(preparer.prepare(&ImageTask::new("ok.jpg")).is_ok());
        assert!(matches!(
            preparer.prepare(&ImageTask::new("bad.jpg")),
            Err(BibSortError::UnreadableImage { .. })
        ));
    }
}
