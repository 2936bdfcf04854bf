//! Backend container lifecycle: start, wait until ready, stop
//!
//! One [`ContainerLifecycle`] manages exactly one container. Operations take
//! `&mut self`, so overlapping calls are ruled out by the borrow checker and
//! the state machine only moves forward:
//!
//! ```text
//! Created -> Starting -> AwaitingReady -> Ready -> Stopping -> Removed
//!               |             |
//!               +--> Failed <-+
//! ```
//!
//! `start` and `wait_ready` observe a shutdown channel and return
//! [`LifecycleError::Cancelled`] as soon as it flips to `true`.

use crate::duration::format_duration;
use crate::pool::ConnectionPool;
use crate::proxy::Origin;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use chrono::TimeDelta;
use hyper::Uri;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument, Span};

/// Interval between readiness probes
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Timeout applied to each readiness probe
pub const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on removing a container left behind by a failed start
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// When to pull the backend image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Always pull, picking up new versions of a floating tag
    #[default]
    Always,
    /// Pull only if the image is not present locally
    IfNotPresent,
    /// Never pull; the image must already exist
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Starting,
    AwaitingReady,
    Ready,
    Stopping,
    Removed,
    Failed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Created => "created",
            ContainerState::Starting => "starting",
            ContainerState::AwaitingReady => "awaiting-ready",
            ContainerState::Ready => "ready",
            ContainerState::Stopping => "stopping",
            ContainerState::Removed => "removed",
            ContainerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("backend already started (state: {0})")]
    AlreadyStarted(ContainerState),
    #[error("cannot {operation} while backend is {state}")]
    InvalidState {
        operation: &'static str,
        state: ContainerState,
    },
    #[error("image {0:?} is not present locally and pull policy is 'never'")]
    ImageMissing(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("container not ready after {0}")]
    NotReady(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("teardown did not finish within {0}")]
    DeadlineExceeded(String),
}

/// The running backend container
#[derive(Debug)]
pub struct BackendHandle {
    id: String,
    image: String,
    host_port: u16,
}

impl BackendHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Loopback origin the backend is reachable on
    pub fn origin(&self) -> Origin {
        Origin::new("http", "127.0.0.1", Some(self.host_port))
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub image: String,
    pub container_name: String,
    pub container_port: u16,
    pub host_port: u16,
    pub pull_policy: PullPolicy,
    /// Time the container gets to exit after a stop request before it is killed
    pub stop_grace: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl LifecycleConfig {
    pub fn new(image: &str, container_port: u16, host_port: u16) -> Self {
        Self {
            image: image.to_string(),
            container_name: "mandelbrot-auth-proxy".to_string(),
            container_port,
            host_port,
            pull_policy: PullPolicy::default(),
            stop_grace: Duration::from_secs(10),
            poll_interval: READY_POLL_INTERVAL,
            probe_timeout: READY_PROBE_TIMEOUT,
        }
    }

    pub fn container_spec(&self) -> ContainerSpec {
        ContainerSpec::new(
            &self.container_name,
            &self.image,
            self.container_port,
            self.host_port,
        )
    }
}

/// Resolves once `cancel` reads `true`; never resolves if the sender is gone
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run a runtime call unless cancellation wins first
async fn race<T>(
    cancel: &mut watch::Receiver<bool>,
    call: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, LifecycleError> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(LifecycleError::Cancelled),
        result = call => result.map_err(LifecycleError::from),
    }
}

fn rounded(elapsed: Duration) -> String {
    format_duration(TimeDelta::milliseconds(elapsed.as_millis() as i64))
}

/// Drives a single backend container through its lifecycle
pub struct ContainerLifecycle<R> {
    runtime: R,
    config: LifecycleConfig,
    pool: Arc<ConnectionPool>,
    state: ContainerState,
    span: Span,
}

impl<R: ContainerRuntime> ContainerLifecycle<R> {
    pub fn new(runtime: R, config: LifecycleConfig, pool: Arc<ConnectionPool>) -> Self {
        let span = tracing::info_span!("lifecycle", container = %config.container_name);
        Self {
            runtime,
            config,
            pool,
            state: ContainerState::Created,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    fn transition(&mut self, next: ContainerState) {
        debug!(parent: &self.span, from = %self.state, to = %next, "Backend state changed");
        self.state = next;
    }

    /// Pull, create and start the backend container
    pub async fn start(
        &mut self,
        cancel: &watch::Receiver<bool>,
    ) -> Result<BackendHandle, LifecycleError> {
        if self.state != ContainerState::Created {
            return Err(LifecycleError::AlreadyStarted(self.state));
        }
        self.transition(ContainerState::Starting);

        let mut cancel = cancel.clone();
        let span = self.span.clone();
        let result = self.launch(&mut cancel).instrument(span).await;

        match &result {
            Ok(_) => self.transition(ContainerState::AwaitingReady),
            Err(_) => self.transition(ContainerState::Failed),
        }
        result
    }

    async fn launch(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<BackendHandle, LifecycleError> {
        let spec = self.config.container_spec();

        // A container from a previous run would hold both the name and the port
        match race(cancel, self.runtime.remove_container(&spec.name)).await {
            Ok(()) => {}
            Err(LifecycleError::Cancelled) => return Err(LifecycleError::Cancelled),
            Err(e) => debug!(container = %spec.name, error = %e, "Could not remove stale container"),
        }

        self.ensure_image(cancel).await?;

        let id = race(cancel, self.runtime.create_container(&spec)).await?;
        info!(
            container_id = %id,
            container_name = %spec.name,
            image = %spec.image,
            "Created backend container"
        );

        if let Err(e) = race(cancel, self.runtime.start_container(&id)).await {
            self.discard(&id).await;
            return Err(e);
        }

        info!(container_id = %id, host_port = spec.host_port, "Started backend container");

        Ok(BackendHandle {
            id,
            image: spec.image,
            host_port: spec.host_port,
        })
    }

    async fn ensure_image(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), LifecycleError> {
        let image = self.config.image.as_str();

        let pull = match self.config.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => {
                let present = race(cancel, self.runtime.image_exists(image)).await?;
                if present {
                    debug!(image, "Image exists locally, skipping pull");
                }
                !present
            }
            PullPolicy::Never => {
                if !race(cancel, self.runtime.image_exists(image)).await? {
                    return Err(LifecycleError::ImageMissing(image.to_string()));
                }
                false
            }
        };

        if pull {
            race(cancel, self.runtime.pull_image(image)).await?;
        }
        Ok(())
    }

    /// Best-effort removal of a container that never became usable
    async fn discard(&self, id: &str) {
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.runtime.remove_container(id)).await {
            Ok(Ok(())) => debug!(container_id = id, "Removed container after failed start"),
            Ok(Err(e)) => warn!(container_id = id, error = %e, "Failed to remove container after failed start"),
            Err(_) => warn!(container_id = id, "Timed out removing container after failed start"),
        }
    }

    /// Poll the backend's root path until it answers 2xx, `timeout` elapses,
    /// or `cancel` fires. The first probe goes out one interval after the call.
    pub async fn wait_ready(
        &mut self,
        handle: &BackendHandle,
        timeout: Duration,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), LifecycleError> {
        match self.state {
            ContainerState::Ready => return Ok(()),
            ContainerState::AwaitingReady => {}
            state => {
                return Err(LifecycleError::InvalidState {
                    operation: "wait for readiness",
                    state,
                })
            }
        }

        let uri: Uri = format!("{}/", handle.origin())
            .parse()
            .map_err(|e| RuntimeError::api("build readiness URI", e))?;

        let mut cancel = cancel.clone();
        let pool = Arc::clone(&self.pool);
        let interval = self.config.poll_interval;
        let probe_timeout = self.config.probe_timeout;
        let started = Instant::now();

        let poll = async {
            let mut ticker = tokio::time::interval_at(started + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut attempts: u32 = 0;
            loop {
                ticker.tick().await;
                attempts += 1;
                if pool.probe(&uri, probe_timeout).await {
                    return attempts;
                }
            }
        };

        let outcome = async {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => Err(LifecycleError::Cancelled),
                result = tokio::time::timeout(timeout, poll) => {
                    result.map_err(|_| LifecycleError::NotReady(rounded(started.elapsed())))
                }
            }
        }
        .instrument(self.span.clone())
        .await;

        match outcome {
            Ok(attempts) => {
                info!(
                    parent: &self.span,
                    container_id = handle.id(),
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend is ready"
                );
                self.transition(ContainerState::Ready);
                Ok(())
            }
            Err(e) => {
                self.transition(ContainerState::Failed);
                Err(e)
            }
        }
    }

    /// Stop and remove the container, all within `deadline`.
    ///
    /// A failed graceful stop is logged and removal is forced anyway.
    pub async fn stop(
        &mut self,
        handle: BackendHandle,
        deadline: Duration,
    ) -> Result<(), LifecycleError> {
        self.transition(ContainerState::Stopping);

        let grace = self.config.stop_grace;
        let runtime = &self.runtime;
        let id = handle.id();

        let teardown = async {
            if let Err(e) = runtime.stop_container(id, grace).await {
                warn!(container_id = id, error = %e, "Graceful stop failed, forcing removal");
            }
            runtime.remove_container(id).await
        };

        let result = match tokio::time::timeout(deadline, teardown.instrument(self.span.clone())).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::Runtime(e)),
            Err(_) => Err(LifecycleError::DeadlineExceeded(rounded(deadline))),
        };

        if result.is_ok() {
            info!(parent: &self.span, container_id = id, "Removed backend container");
            self.transition(ContainerState::Removed);
        }
        result
    }
}
