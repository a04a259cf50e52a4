//! Idempotent synthesis of derived audio assets.
//!
//! The cache key is the destination filename: existence on disk is the hit
//! signal, so an asset is synthesized at most once for as long as the file
//! persists, within and across runs. Synthesis itself is an injected
//! collaborator; failures are counted and never abort the run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::models::AudioRequest;

/// A text-to-speech collaborator that writes audio bytes to a destination
/// path. Any failure surfaces as an error to the cache, which treats it as
/// non-fatal.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, dest: &Path) -> Result<()>;
}

/// HTTP text-to-speech client (ElevenLabs-style endpoint).
pub struct HttpSynthesizer {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
}

impl HttpSynthesizer {
    pub fn new(api_key: String, voice_id: String, model_id: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            voice_id,
            model_id,
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, dest: &Path) -> Result<()> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}?output_format=mp3_44100_128",
            self.voice_id
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model_id,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::Synthesis {
                phrase: text.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let bytes = response.bytes().await?;
        std::fs::write(dest, &bytes)?;
        Ok(())
    }
}

/// Existence-checked cache over a synthesis collaborator.
///
/// Check-then-write for one filename is a critical section guarded by a
/// per-filename lock, so concurrent requests for the same asset cannot race;
/// requests for distinct filenames run freely in parallel up to the
/// configured concurrency limit.
pub struct AudioCache {
    media_dir: Option<PathBuf>,
    synthesizer: Arc<dyn Synthesizer>,
    permits: Arc<Semaphore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generated: AtomicU64,
    errors: AtomicU64,
}

/// Placeholder collaborator for runs with synthesis turned off; the cache
/// never reaches it because the media directory is unset.
struct DisabledSynthesizer;

#[async_trait]
impl Synthesizer for DisabledSynthesizer {
    async fn synthesize(&self, text: &str, _dest: &Path) -> Result<()> {
        Err(SyncError::Synthesis {
            phrase: text.to_string(),
            reason: "synthesis is disabled".to_string(),
        })
    }
}

impl AudioCache {
    pub fn new(
        media_dir: Option<PathBuf>,
        synthesizer: Arc<dyn Synthesizer>,
        concurrency: usize,
    ) -> Self {
        Self {
            media_dir,
            synthesizer,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            locks: Mutex::new(HashMap::new()),
            generated: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// A cache that performs no synthesis at all.
    pub fn disabled() -> Self {
        Self::new(None, Arc::new(DisabledSynthesizer), 1)
    }

    /// Number of assets actually synthesized so far.
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    /// Number of synthesis attempts that failed.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Synthesize one asset unless it already exists.
    ///
    /// No-op when the phrase, the filename, or the media directory is unset.
    pub async fn synthesize_if_needed(&self, phrase: &str, filename: &str) {
        let Some(media_dir) = &self.media_dir else {
            return;
        };
        if phrase.is_empty() || filename.is_empty() {
            return;
        }

        let lock = self.lock_for(filename);
        let _guard = lock.lock().await;

        let dest = media_dir.join(filename);
        if dest.exists() {
            debug!(filename, "audio cache hit");
            return;
        }

        match self.synthesizer.synthesize(phrase, &dest).await {
            Ok(()) => {
                self.generated.fetch_add(1, Ordering::Relaxed);
                debug!(filename, "audio synthesized");
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(filename, error = %e, "audio synthesis failed");
            }
        }
    }

    fn lock_for(&self, filename: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Run a batch of requests on the cache's bounded pool. Order is not
/// significant; requests sharing a filename are serialized by the
/// per-filename lock, everything else runs in parallel up to the limit.
pub async fn synthesize_many(cache: &Arc<AudioCache>, requests: Vec<AudioRequest>) {
    let mut tasks = JoinSet::new();
    for request in requests {
        let cache = Arc::clone(cache);
        tasks.spawn(async move {
            let permits = Arc::clone(&cache.permits);
            let _permit = permits.acquire_owned().await.expect("semaphore never closed");
            cache
                .synthesize_if_needed(&request.phrase, &request.filename)
                .await;
        });
    }
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingSynthesizer {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingSynthesizer {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Synthesizer for CountingSynthesizer {
        async fn synthesize(&self, text: &str, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SyncError::Synthesis {
                    phrase: text.to_string(),
                    reason: "boom".to_string(),
                });
            }
            std::fs::write(dest, b"mp3")?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_synthesis_at_most_once_per_filename() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(CountingSynthesizer::new(false));
        let cache = AudioCache::new(Some(dir.path().to_path_buf()), synth.clone(), 4);

        cache.synthesize_if_needed("το σπίτι", "σπίτι.mp3").await;
        cache.synthesize_if_needed("το σπίτι", "σπίτι.mp3").await;

        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.generated(), 1);
        assert!(dir.path().join("σπίτι.mp3").exists());
    }

    #[tokio::test]
    async fn test_existing_file_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("σπίτι.mp3"), b"already").unwrap();

        let synth = Arc::new(CountingSynthesizer::new(false));
        let cache = AudioCache::new(Some(dir.path().to_path_buf()), synth.clone(), 4);
        cache.synthesize_if_needed("το σπίτι", "σπίτι.mp3").await;

        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.generated(), 0);
    }

    #[tokio::test]
    async fn test_unset_inputs_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(CountingSynthesizer::new(false));

        let no_dir = AudioCache::new(None, synth.clone(), 4);
        no_dir.synthesize_if_needed("φράση", "x.mp3").await;

        let cache = AudioCache::new(Some(dir.path().to_path_buf()), synth.clone(), 4);
        cache.synthesize_if_needed("", "x.mp3").await;
        cache.synthesize_if_needed("φράση", "").await;

        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(CountingSynthesizer::new(true));
        let cache = AudioCache::new(Some(dir.path().to_path_buf()), synth.clone(), 4);

        cache.synthesize_if_needed("το σπίτι", "σπίτι.mp3").await;

        assert_eq!(cache.errors(), 1);
        assert_eq!(cache.generated(), 0);
        assert!(!dir.path().join("σπίτι.mp3").exists());
    }

    #[tokio::test]
    async fn test_batch_dedupes_same_filename() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(CountingSynthesizer::new(false));
        let cache = Arc::new(AudioCache::new(Some(dir.path().to_path_buf()), synth.clone(), 2));

        let request = AudioRequest {
            phrase: "το σπίτι".to_string(),
            filename: "σπίτι.mp3".to_string(),
        };
        synthesize_many(&cache, vec![request.clone(), request.clone(), request]).await;

        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.generated(), 1);
    }
}
