use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use crate::exec::{CommandExecutor, ExecOutput};
use crate::types::{ChartSpec, Outcome};
use crate::{Result, ErrorKind};

mod render;
mod schema;
mod extract;
mod verify;

pub use verify::VerifyCache;

/// Explicit configuration handed to the Coordinator at construction.
///
/// spec.md §9 "Global state" recasts the source's two process-wide
/// variables (`srcPrefix`, `verboseLogging`) as config passed around rather
/// than singletons - `src_prefix` belongs to [`crate::discovery`], this
/// struct carries the rest of what the pipeline itself needs.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Recreated (wiped then created) once, before any worker starts.
    pub output_dir: PathBuf,
    /// Worker count applied uniformly to all four stages (spec.md §4.5:
    /// "Default 10 per stage... not per-stage differentiated").
    pub workers_per_stage: usize,
    /// Per-call deadline for S4's registry inspection (spec.md §4.4: 2 min).
    pub verify_timeout: Duration,
    /// Buffer size applied to every inter-stage channel (S1→S2, S2→S3,
    /// S3→S4) and to the Coordinator's merged result channel. Spec.md §5
    /// allows either unbuffered or "modestly buffered for throughput"; a
    /// small buffer gives some overlap without masking backpressure bugs.
    pub channel_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            output_dir: PathBuf::from("manifests"),
            workers_per_stage: 10,
            verify_timeout: Duration::from_secs(120),
            channel_buffer: 16,
        }
    }
}

/// Wires the four stages together: owns the top-level input, connects
/// S1→S2→S3→S4, and exposes one merged [`Outcome`] stream.
pub struct Coordinator<E: CommandExecutor + 'static> {
    executor: Arc<E>,
    config: PipelineConfig,
}

impl<E: CommandExecutor + 'static> Coordinator<E> {
    pub fn new(executor: E, config: PipelineConfig) -> Self {
        Coordinator {
            executor: Arc::new(executor),
            config,
        }
    }

    /// Convenience entry point for callers that already have the full list
    /// of charts (e.g. the CLI, after [`crate::discovery::discover`] runs).
    /// Builds the input channel, sends every chart, then drops the sender -
    /// spec.md §4.5 step 1: "Caller closes the Coordinator's input channel
    /// after the last ChartSpec."
    pub async fn run_charts(
        &self,
        charts: Vec<ChartSpec>,
        cancel: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<Outcome>> {
        let (tx, rx) = mpsc::channel(charts.len().max(1));
        tokio::spawn(async move {
            for chart in charts {
                if tx.send(chart).await.is_err() {
                    break;
                }
            }
            // tx drops here, closing the input channel.
        });
        self.run(rx, cancel).await
    }

    /// Recreates the output directory, spawns every stage's worker pool,
    /// and returns the merged result channel. Returns as soon as the
    /// directory is ready; stages keep running in the background.
    pub async fn run(
        &self,
        input: mpsc::Receiver<ChartSpec>,
        cancel: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<Outcome>> {
        if self.config.output_dir.exists() {
            tokio::fs::remove_dir_all(&self.config.output_dir)
                .await
                .map_err(|e| {
                    ErrorKind::ManifestIo(
                        self.config.output_dir.display().to_string(),
                        format!("failed to wipe output dir: {}", e),
                    )
                })?;
        }
        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| {
                ErrorKind::ManifestIo(
                    self.config.output_dir.display().to_string(),
                    format!("failed to create output dir: {}", e),
                )
            })?;
        info!(
            "starting pipeline: {} workers/stage, output={}",
            self.config.workers_per_stage,
            self.config.output_dir.display()
        );

        let buffer = self.config.channel_buffer.max(1);
        let (results_tx, results_rx) = mpsc::channel(buffer);

        let s1_in = Arc::new(Mutex::new(input));
        let (s2_in, _s1_handles) = render::spawn(
            self.config.workers_per_stage,
            self.executor.clone(),
            self.config.output_dir.clone(),
            s1_in,
            cancel.clone(),
            results_tx.clone(),
            buffer,
        );

        let s2_in = Arc::new(Mutex::new(s2_in));
        let (s3_in, _s2_handles) = schema::spawn(
            self.config.workers_per_stage,
            self.executor.clone(),
            s2_in,
            cancel.clone(),
            results_tx.clone(),
            buffer,
        );

        let s3_in = Arc::new(Mutex::new(s3_in));
        let (s4_in, _s3_handles) = extract::spawn(
            self.config.workers_per_stage,
            s3_in,
            cancel.clone(),
            results_tx.clone(),
            buffer,
        );

        let cache = Arc::new(VerifyCache::new());
        let s4_in = Arc::new(Mutex::new(s4_in));
        let (_s4_out_unused, _s4_handles) = verify::spawn(
            self.config.workers_per_stage,
            self.executor.clone(),
            cache,
            self.config.verify_timeout,
            s4_in,
            cancel,
            results_tx,
            buffer,
        );

        Ok(results_rx)
    }
}

/// Pulls the next item from a pool-shared input channel, or `None` if
/// either the channel drained or the cancellation signal fired - the one
/// suspension-point pattern every stage worker loop uses (spec.md §5:
/// "every blocking point is multiplexed with the pipeline's cancellation
/// signal").
async fn recv_or_cancel<T>(
    input: &Mutex<mpsc::Receiver<T>>,
    cancel: &mut watch::Receiver<bool>,
) -> Option<T> {
    if *cancel.borrow() {
        return None;
    }
    tokio::select! {
        biased;
        changed = cancel.changed() => {
            let _ = changed;
            None
        }
        item = async { input.lock().await.recv().await } => item,
    }
}

/// Sends a terminal `Outcome` downstream, returning `false` once the
/// result channel itself has been closed (only happens if the caller
/// dropped the receiver, e.g. gave up early).
async fn send_outcome(tx: &mpsc::Sender<Outcome>, outcome: Outcome) -> bool {
    tx.send(outcome).await.is_ok()
}

/// Races one external tool invocation against the cancellation signal, so a
/// hung `helm`/`kubeconform`/`docker` process can't keep a worker blocked
/// past cancellation (spec.md §5: "every blocking point is multiplexed with
/// the pipeline's cancellation signal... an external process invocation").
/// `ProcessExecutor::run` uses `kill_on_drop(true)`, so dropping the losing
/// future here actually kills the child process.
async fn run_cancelable<E: CommandExecutor>(
    executor: &E,
    program: &str,
    args: &[String],
    cancel: &mut watch::Receiver<bool>,
) -> Result<ExecOutput> {
    if *cancel.borrow() {
        return Err(ErrorKind::Cancelled(program.to_string()).into());
    }
    tokio::select! {
        biased;
        changed = cancel.changed() => {
            let _ = changed;
            Err(ErrorKind::Cancelled(program.to_string()).into())
        }
        result = executor.run(program, args) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;
    use crate::types::ChartSpec;
    use std::path::Path;

    fn chart(dir: &Path, name: &str) -> ChartSpec {
        let base = dir.join(format!("{}-base.yaml", name));
        let overrides = dir.join(format!("{}-override.yaml", name));
        std::fs::write(&base, "replicas: 1\n").unwrap();
        std::fs::write(&overrides, "env: dev\n").unwrap();
        ChartSpec {
            env: "dev".to_string(),
            chart_name: name.to_string(),
            repo_url: "https://charts.example.com".to_string(),
            chart_version: "1.2.3".to_string(),
            base_values_file: base,
            values_override: overrides,
        }
    }

    fn deployment_manifest(image: &str) -> String {
        format!(
            "kind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n        - name: app\n          image: {}\n",
            image
        )
    }

    /// Scenario A: one chart, one image, registry has it.
    #[tokio::test]
    async fn happy_path_single_chart() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("manifests");
        let executor = FakeExecutor::new();
        executor.push("helm", true, &deployment_manifest("nginx:1.20"), "");
        executor.push("kubeconform", true, "valid", "");
        executor.push("docker", true, "manifest ok", "");

        let coordinator = Coordinator::new(
            executor,
            PipelineConfig {
                output_dir: out,
                workers_per_stage: 2,
                verify_timeout: Duration::from_secs(5),
                channel_buffer: 8,
            },
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut results = coordinator
            .run_charts(vec![chart(dir.path(), "frontend")], cancel_rx)
            .await
            .unwrap();

        let outcome = results.recv().await.unwrap();
        match outcome {
            Outcome::Verified(v) => {
                assert_eq!(v.chart.chart_name, "frontend");
                assert_eq!(v.image, "nginx:1.20");
                assert!(v.exists);
                assert!(v.error.is_none());
            }
            Outcome::Failed(e) => panic!("expected success, got {:?}", e),
        }
        assert!(results.recv().await.is_none());
    }

    /// Scenario B: three charts referencing the same image dedup to one
    /// registry call.
    #[tokio::test]
    async fn deduplicates_shared_image_across_charts() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("manifests");
        let executor = FakeExecutor::new();
        for _ in 0..3 {
            executor.push("helm", true, &deployment_manifest("redis:6.2"), "");
            executor.push("kubeconform", true, "valid", "");
        }
        executor.push("docker", true, "manifest ok", "");

        let charts = vec![
            chart(dir.path(), "svc-a"),
            chart(dir.path(), "svc-b"),
            chart(dir.path(), "svc-c"),
        ];
        let coordinator = Coordinator::new(
            executor,
            PipelineConfig {
                output_dir: out,
                workers_per_stage: 4,
                verify_timeout: Duration::from_secs(5),
                channel_buffer: 8,
            },
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut results = coordinator.run_charts(charts, cancel_rx).await.unwrap();

        let mut seen = Vec::new();
        while let Some(outcome) = results.recv().await {
            match outcome {
                Outcome::Verified(v) => {
                    assert!(v.exists);
                    seen.push(v.chart.chart_name);
                }
                Outcome::Failed(e) => panic!("unexpected failure: {:?}", e),
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["svc-a", "svc-b", "svc-c"]);
    }

    /// Scenario C: missing values override produces an ErrorEnvelope, no
    /// downstream entries for that chart.
    #[tokio::test]
    async fn missing_values_override_errors() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("manifests");
        let mut spec = chart(dir.path(), "broken");
        std::fs::remove_file(&spec.values_override).unwrap();
        spec.values_override = dir.path().join("does-not-exist.yaml");

        let executor = FakeExecutor::new();
        let coordinator = Coordinator::new(
            executor,
            PipelineConfig {
                output_dir: out,
                workers_per_stage: 2,
                verify_timeout: Duration::from_secs(5),
                channel_buffer: 8,
            },
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut results = coordinator.run_charts(vec![spec], cancel_rx).await.unwrap();

        let outcome = results.recv().await.unwrap();
        match outcome {
            Outcome::Failed(e) => {
                assert!(e.error.contains("values override file does not exist"));
            }
            Outcome::Verified(v) => panic!("expected failure, got {:?}", v),
        }
        assert!(results.recv().await.is_none());
    }

    /// Scenario E: registry miss surfaces exists=false with an error, and
    /// the coordinator-level outcome is reported as unsuccessful.
    #[tokio::test]
    async fn registry_miss_is_unsuccessful() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("manifests");
        let executor = FakeExecutor::new();
        executor.push("helm", true, &deployment_manifest("ghcr.io/example/nope:v9"), "");
        executor.push("kubeconform", true, "valid", "");
        executor.push("docker", false, "", "manifest unknown");

        let coordinator = Coordinator::new(
            executor,
            PipelineConfig {
                output_dir: out,
                workers_per_stage: 2,
                verify_timeout: Duration::from_secs(5),
                channel_buffer: 8,
            },
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut results = coordinator
            .run_charts(vec![chart(dir.path(), "backend")], cancel_rx)
            .await
            .unwrap();

        let outcome = results.recv().await.unwrap();
        assert!(!outcome.is_success());
        match outcome {
            Outcome::Verified(v) => {
                assert!(!v.exists);
                assert!(v.error.is_some());
            }
            Outcome::Failed(e) => panic!("expected a VerifyResult, got {:?}", e),
        }
    }

    /// Empty input closes the result channel immediately with no entries
    /// (spec.md §8 boundary case).
    #[tokio::test]
    async fn empty_input_closes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("manifests");
        let executor = FakeExecutor::new();
        let coordinator = Coordinator::new(
            executor,
            PipelineConfig {
                output_dir: out,
                ..Default::default()
            },
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut results = coordinator.run_charts(Vec::new(), cancel_rx).await.unwrap();
        assert!(results.recv().await.is_none());
    }

    /// Scenario F: cancelling mid-run causes the result channel to close in
    /// finite time, with no hang.
    #[tokio::test]
    async fn cancellation_drains_without_hang() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("manifests");
        let executor = FakeExecutor::new();
        for _ in 0..20 {
            executor.push("helm", true, &deployment_manifest("alpine:3"), "");
            executor.push("kubeconform", true, "valid", "");
        }
        executor.push("docker", true, "manifest ok", "");

        let charts: Vec<_> = (0..20)
            .map(|i| chart(dir.path(), &format!("svc-{}", i)))
            .collect();
        let coordinator = Coordinator::new(
            executor,
            PipelineConfig {
                output_dir: out,
                workers_per_stage: 2,
                verify_timeout: Duration::from_secs(5),
                channel_buffer: 4,
            },
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut results = coordinator.run_charts(charts, cancel_rx).await.unwrap();

        cancel_tx.send(true).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            tokio::select! {
                item = results.recv() => {
                    if item.is_none() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    panic!("result channel did not close after cancellation");
                }
            }
        }
    }
}
