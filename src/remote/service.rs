use crate::common::frame::monotonic_ns;
use crate::error::{AppError, RemoteError};
use crate::remote::breaker::CircuitBreaker;
use crate::remote::cache::{CacheKey, ResultCache};
use crate::remote::client::{RemoteDetector, RemoteRequest, RemoteResult};
use crate::remote::rate_limit::RateLimiter;
use crate::state::settings::RemoteLimits;
use serde::Serialize;
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tower::Service;

const BACKOFF: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_millis(200),
    Duration::from_millis(400),
    Duration::from_millis(800),
];
const MIN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RemoteMetrics {
    pub enabled: bool,
    /// Configured calls per second while enabled, zero otherwise.
    pub rps: u32,
    pub last_ok_ns: Option<u64>,
    pub ok_count: u64,
    pub fail_count: u64,
    pub breaker_open: bool,
    pub latency_ms: f64,
}

struct ServiceState {
    breaker: CircuitBreaker,
    cache: ResultCache,
    limiter: RateLimiter,
    timeout: Duration,
    ok_count: u64,
    fail_count: u64,
    last_ok_ns: Option<u64>,
    last_latency_ms: f64,
}

/// Rate-limited, cached, breaker-protected landmark refinement.
///
/// Cheap to clone; clones share state. Refused calls (breaker open, rate
/// limited, disabled) resolve to `None` without touching the detector.
#[derive(Clone)]
pub struct RemoteLandmarkService {
    detector: Option<Arc<dyn RemoteDetector>>,
    state: Arc<Mutex<ServiceState>>,
}

impl RemoteLandmarkService {
    pub fn new(detector: Arc<dyn RemoteDetector>, limits: RemoteLimits) -> Self {
        Self::build(Some(detector), limits)
    }

    pub fn disabled() -> Self {
        Self::build(
            None,
            RemoteLimits {
                rps: 1,
                timeout: MIN_TIMEOUT,
                min_interval: Duration::ZERO,
            },
        )
    }

    fn build(detector: Option<Arc<dyn RemoteDetector>>, limits: RemoteLimits) -> Self {
        Self {
            detector,
            state: Arc::new(Mutex::new(ServiceState {
                breaker: CircuitBreaker::default(),
                cache: ResultCache::default(),
                limiter: RateLimiter::new(limits.rps, limits.min_interval),
                timeout: limits.timeout.max(MIN_TIMEOUT),
                ok_count: 0,
                fail_count: 0,
                last_ok_ns: None,
                last_latency_ms: 0.0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.detector.is_some()
    }

    pub fn update_limits(&self, limits: RemoteLimits) {
        let mut state = self.state();
        state.limiter.update(limits.rps, limits.min_interval);
        state.timeout = limits.timeout.max(MIN_TIMEOUT);
    }

    pub fn metrics(&self) -> RemoteMetrics {
        let state = self.state();
        RemoteMetrics {
            enabled: self.is_enabled(),
            rps: if self.is_enabled() { state.limiter.rps() } else { 0 },
            last_ok_ns: state.last_ok_ns,
            ok_count: state.ok_count,
            fail_count: state.fail_count,
            breaker_open: state.breaker.is_open(),
            latency_ms: state.last_latency_ms,
        }
    }

    pub async fn refine(&self, request: RemoteRequest) -> Option<RemoteResult> {
        let detector = self.detector.as_ref()?;
        if request.jpeg.is_empty() {
            return None;
        }

        let now = Instant::now();
        if !self.state().breaker.allow(now) {
            tracing::debug!("Remote breaker open, skipping request");
            return None;
        }

        let key = match image::load_from_memory(&request.jpeg) {
            Ok(image) => CacheKey::from_image(&image),
            Err(err) => {
                tracing::debug!("Remote request image could not be decoded: {}", err);
                return None;
            }
        };

        let timeout = {
            let mut state = self.state();
            if let Some(mut cached) = state.cache.get(&key, now) {
                tracing::debug!("Remote result served from cache for {}", key);
                cached.captured_ns = request.captured_ns;
                return Some(cached);
            }
            if !state.limiter.try_acquire(now) {
                tracing::debug!("Remote request rate limited");
                return None;
            }
            state.timeout
        };

        let started = Instant::now();
        let mut last_error = None;
        for delay in BACKOFF {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = match tokio::time::timeout(timeout, detector.annotate(&request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(timeout_error(timeout)),
            };
            match outcome {
                Ok(annotation) => {
                    let result = RemoteResult {
                        ok: !annotation.landmarks.is_empty(),
                        landmarks: annotation.landmarks,
                        confidence: annotation.confidence,
                        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                        captured_ns: request.captured_ns,
                    };
                    self.register_success(key, &result);
                    return Some(result);
                }
                Err(err) => {
                    tracing::debug!("Remote request attempt failed: {}", err);
                    last_error = Some(err);
                }
            }
        }

        let mut state = self.state();
        state.fail_count += 1;
        state.breaker.on_failure(Instant::now());
        if let Some(err) = last_error {
            tracing::warn!("Remote request failed after retries: {}", err);
        }
        None
    }

    fn register_success(&self, key: CacheKey, result: &RemoteResult) {
        let mut state = self.state();
        state.breaker.on_success();
        if result.ok {
            state.ok_count += 1;
            state.last_ok_ns = Some(monotonic_ns(std::time::Instant::now()));
            state.last_latency_ms = result.latency_ms;
        }
        state.cache.insert(key, result.clone(), Instant::now());
    }
}

fn timeout_error(timeout: Duration) -> RemoteError {
    RemoteError::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
}

impl Service<RemoteRequest> for RemoteLandmarkService {
    type Response = Option<RemoteResult>;
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RemoteRequest) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.refine(request).await) })
    }
}
