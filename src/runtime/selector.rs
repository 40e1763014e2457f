//! Scoring-based backend selection.

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ExecutionBackend, RuntimeDescriptor, RuntimeType, SelectionPreference};
use crate::error::{Result, SandboxError};

pub const DEFAULT_AVAILABILITY_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct CachedAvailability {
    available: bool,
    checked_at: Instant,
}

/// Snapshot of one registered backend, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub name: String,
    pub runtime_type: RuntimeType,
    pub languages: Vec<String>,
    pub available: bool,
    pub descriptor: RuntimeDescriptor,
}

/// Picks a backend for a language.
///
/// Backends are scored in registration order; ties go to the earliest one.
/// Availability checks run concurrently and their outcome is cached for a
/// short window per backend.
pub struct RuntimeSelector {
    backends: Vec<Arc<dyn ExecutionBackend>>,
    availability: DashMap<usize, CachedAvailability>,
    cache_ttl: Duration,
}

impl RuntimeSelector {
    pub fn new(backends: Vec<Arc<dyn ExecutionBackend>>) -> Self {
        Self::with_cache_ttl(backends, DEFAULT_AVAILABILITY_TTL)
    }

    pub fn with_cache_ttl(backends: Vec<Arc<dyn ExecutionBackend>>, cache_ttl: Duration) -> Self {
        Self {
            backends,
            availability: DashMap::new(),
            cache_ttl,
        }
    }

    pub fn backends(&self) -> &[Arc<dyn ExecutionBackend>] {
        &self.backends
    }

    /// Drop every cached availability result.
    pub fn invalidate(&self) {
        self.availability.clear();
    }

    /// Highest-scoring available backend that supports `language`.
    pub async fn select_best(
        &self,
        language: &str,
        preference: Option<SelectionPreference>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ExecutionBackend>> {
        let preference = preference.unwrap_or_default();
        let candidates = self.available_candidates(language, cancel).await?;

        let mut best: Option<(usize, f64)> = None;
        for index in candidates {
            let score = self.backends[index].capabilities().score(preference);
            debug!(
                backend = self.backends[index].name(),
                score,
                ?preference,
                "Scored runtime"
            );
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((index, score)),
            }
        }

        let (index, score) = best.ok_or_else(|| no_runtime(language))?;
        let backend = Arc::clone(&self.backends[index]);
        info!(
            backend = backend.name(),
            language,
            ?preference,
            score,
            "Selected runtime"
        );
        Ok(backend)
    }

    /// First available backend of the given type that supports `language`.
    pub async fn select_by_type(
        &self,
        runtime_type: RuntimeType,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ExecutionBackend>> {
        let candidates = self.available_candidates(language, cancel).await?;
        candidates
            .into_iter()
            .find(|&i| self.backends[i].runtime_type() == runtime_type)
            .map(|i| Arc::clone(&self.backends[i]))
            .ok_or_else(|| {
                SandboxError::RuntimeUnavailable(format!(
                    "no available {} runtime supports {}",
                    runtime_type, language
                ))
            })
    }

    /// Status of every registered backend, probing where the cache is stale.
    pub async fn describe(&self, cancel: &CancellationToken) -> Result<Vec<RuntimeStatus>> {
        let indexes: Vec<usize> = (0..self.backends.len()).collect();
        let available = self.check_availability(&indexes, cancel).await?;
        Ok(self
            .backends
            .iter()
            .zip(available)
            .map(|(backend, available)| RuntimeStatus {
                name: backend.name().to_string(),
                runtime_type: backend.runtime_type(),
                languages: backend.supported_environments().to_vec(),
                available,
                descriptor: backend.capabilities(),
            })
            .collect())
    }

    /// Indexes of backends supporting `language` that are currently available,
    /// in registration order.
    async fn available_candidates(
        &self,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>> {
        let supporting: Vec<usize> = self
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.supports(language))
            .map(|(i, _)| i)
            .collect();

        if supporting.is_empty() {
            return Err(no_runtime(language));
        }

        let available = self.check_availability(&supporting, cancel).await?;
        let candidates: Vec<usize> = supporting
            .into_iter()
            .zip(available)
            .filter_map(|(i, ok)| ok.then_some(i))
            .collect();

        if candidates.is_empty() {
            return Err(no_runtime(language));
        }
        Ok(candidates)
    }

    /// Availability of the given backends, same order as `indexes`.
    async fn check_availability(
        &self,
        indexes: &[usize],
        cancel: &CancellationToken,
    ) -> Result<Vec<bool>> {
        let now = Instant::now();
        let mut results: Vec<Option<bool>> = indexes
            .iter()
            .map(|i| {
                self.availability
                    .get(i)
                    .filter(|c| now.duration_since(c.checked_at) < self.cache_ttl)
                    .map(|c| c.available)
            })
            .collect();

        let stale: Vec<(usize, usize)> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(pos, _)| (pos, indexes[pos]))
            .collect();

        if !stale.is_empty() {
            let checks = stale.iter().map(|&(_, i)| {
                let backend = Arc::clone(&self.backends[i]);
                async move { backend.is_available(cancel).await }
            });

            let outcomes = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
                outcomes = join_all(checks) => outcomes,
            };

            let checked_at = Instant::now();
            for (&(pos, i), available) in stale.iter().zip(outcomes) {
                debug!(backend = self.backends[i].name(), available, "Checked runtime availability");
                self.availability.insert(
                    i,
                    CachedAvailability {
                        available,
                        checked_at,
                    },
                );
                results[pos] = Some(available);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap_or(false)).collect())
    }
}

fn no_runtime(language: &str) -> SandboxError {
    SandboxError::RuntimeUnavailable(format!("no available runtime supports {}", language))
}
