//! Backend posting pipeline. Telemetry batches to `/blob/ingest` on a
//! fixed cadence or when the batch grows large; CRITICAL alerts go to
//! `/blob/health` immediately, WARNING/INFO on a slower batch cadence.
//! Failed posts are retained in bounded memory and retried on the next
//! flush, evicting oldest-first once the cap is reached.

use crate::alerts::{AlertEvent, Severity};
use crate::battery::TelemetrySample;
use crate::state::Endpoints;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const TELEMETRY_CHANNEL_CAP: usize = 1024;
const ALERT_CHANNEL_CAP: usize = 256;
/// Flush early once this many samples are waiting.
const TELEMETRY_FLUSH_THRESHOLD: usize = 32;
/// Retention caps for failed posts.
const TELEMETRY_RETAIN_CAP: usize = 720;
const ALERT_RETAIN_CAP: usize = 256;
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap clone handed to every controller; sends never block a tick.
#[derive(Clone)]
pub struct PosterHandle {
    telemetry_tx: mpsc::Sender<TelemetrySample>,
    alert_tx: mpsc::Sender<AlertEvent>,
}

impl PosterHandle {
    /// Bare channel pair, for embedding the controller without the HTTP
    /// pipeline (and for driving it under test).
    pub fn channel() -> (
        Self,
        mpsc::Receiver<TelemetrySample>,
        mpsc::Receiver<AlertEvent>,
    ) {
        let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_CHANNEL_CAP);
        let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAP);
        (
            Self {
                telemetry_tx,
                alert_tx,
            },
            telemetry_rx,
            alert_rx,
        )
    }

    pub fn enqueue_telemetry(&self, sample: TelemetrySample) {
        if self.telemetry_tx.try_send(sample).is_err() {
            warn!("telemetry queue full; sample dropped");
        }
    }

    pub fn enqueue_alert(&self, event: AlertEvent) {
        if self.alert_tx.try_send(event).is_err() {
            warn!("alert queue full; event dropped");
        }
    }
}

pub struct BackendPoster {
    client: reqwest::Client,
    ingest_url: String,
    health_url: String,
    telemetry_rx: mpsc::Receiver<TelemetrySample>,
    alert_rx: mpsc::Receiver<AlertEvent>,
    flush_interval: Duration,
    alert_batch_interval: Duration,
    telemetry_buf: Vec<TelemetrySample>,
    alert_buf: Vec<AlertEvent>,
    evicted: u64,
}

impl BackendPoster {
    pub fn new(
        endpoints: &Endpoints,
        flush_interval: Duration,
        alert_batch_interval: Duration,
    ) -> (Self, PosterHandle) {
        let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_CHANNEL_CAP);
        let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAP);
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        (
            Self {
                client,
                ingest_url: join_path(&endpoints.ingest_url, "/blob/ingest"),
                health_url: join_path(&endpoints.health_url, "/blob/health"),
                telemetry_rx,
                alert_rx,
                flush_interval,
                alert_batch_interval,
                telemetry_buf: Vec::new(),
                alert_buf: Vec::new(),
                evicted: 0,
            },
            PosterHandle {
                telemetry_tx,
                alert_tx,
            },
        )
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut flush = tokio::time::interval(self.flush_interval);
        let mut alert_flush = tokio::time::interval(self.alert_batch_interval);
        info!(
            ingest = %self.ingest_url,
            health = %self.health_url,
            "backend poster started"
        );
        loop {
            tokio::select! {
                Some(sample) = self.telemetry_rx.recv() => {
                    self.telemetry_buf.push(sample);
                    if self.telemetry_buf.len() >= TELEMETRY_FLUSH_THRESHOLD {
                        self.flush_telemetry().await;
                    }
                }
                Some(event) = self.alert_rx.recv() => {
                    if event.severity == Severity::Critical {
                        self.post_alerts(vec![event]).await;
                    } else {
                        self.alert_buf.push(event);
                    }
                }
                _ = flush.tick() => self.flush_telemetry().await,
                _ = alert_flush.tick() => self.flush_alerts().await,
                _ = shutdown.changed() => break,
            }
        }
        // Final drain within the shutdown grace period.
        while let Ok(sample) = self.telemetry_rx.try_recv() {
            self.telemetry_buf.push(sample);
        }
        while let Ok(event) = self.alert_rx.try_recv() {
            self.alert_buf.push(event);
        }
        self.flush_telemetry().await;
        self.flush_alerts().await;
        info!(evicted = self.evicted, "backend poster stopped");
    }

    async fn flush_telemetry(&mut self) {
        if self.telemetry_buf.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.telemetry_buf);
        match post_json(&self.client, &self.ingest_url, &batch).await {
            Ok(()) => debug!(count = batch.len(), "telemetry batch posted"),
            Err(e) => {
                warn!(error = %e, count = batch.len(), "telemetry post failed; retaining");
                self.telemetry_buf = batch;
                self.evicted += trim_oldest(&mut self.telemetry_buf, TELEMETRY_RETAIN_CAP);
            }
        }
    }

    async fn flush_alerts(&mut self) {
        if self.alert_buf.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.alert_buf);
        self.post_alerts(batch).await;
    }

    async fn post_alerts(&mut self, batch: Vec<AlertEvent>) {
        match post_json(&self.client, &self.health_url, &batch).await {
            Ok(()) => debug!(count = batch.len(), "alert batch posted"),
            Err(e) => {
                warn!(error = %e, count = batch.len(), "alert post failed; retaining");
                let mut retained = batch;
                retained.append(&mut self.alert_buf);
                self.alert_buf = retained;
                self.evicted += trim_oldest(&mut self.alert_buf, ALERT_RETAIN_CAP);
            }
        }
    }
}

async fn post_json<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    body: &[T],
) -> anyhow::Result<()> {
    let response = client.post(url).json(body).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("backend returned {}", response.status());
    }
    Ok(())
}

fn join_path(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Drop oldest entries beyond `cap`, returning how many were evicted.
fn trim_oldest<T>(buf: &mut Vec<T>, cap: usize) -> u64 {
    if buf.len() <= cap {
        return 0;
    }
    let excess = buf.len() - cap;
    buf.drain(0..excess);
    excess as u64
}
