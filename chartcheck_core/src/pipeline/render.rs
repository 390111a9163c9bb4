use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::{recv_or_cancel, run_cancelable, send_outcome};
use crate::exec::{file_exists, CommandExecutor};
use crate::types::{ChartSpec, ErrorEnvelope, Outcome, RenderResult};

const SUFFIX_LEN: usize = 6;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Collision-proofing suffix for rendered manifest filenames (spec.md §4.1:
/// "6-character alphanumeric suffix"; §9 notes it's collision-resistant,
/// not collision-proof, and that a monotonic counter or content hash would
/// be the deterministic alternative - kept as specified).
fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SUFFIX_ALPHABET.len());
            SUFFIX_ALPHABET[idx] as char
        })
        .collect()
}

/// S1 Renderer: expands `chart + values` into a manifest file on disk.
///
/// Grounded on the teacher's `helm/direct.rs::template`, generalized from a
/// single synchronous call into a worker-pool stage over `CommandExecutor`.
pub fn spawn<E: CommandExecutor + 'static>(
    workers: usize,
    executor: Arc<E>,
    output_dir: PathBuf,
    input: Arc<Mutex<mpsc::Receiver<ChartSpec>>>,
    cancel: watch::Receiver<bool>,
    results: mpsc::Sender<Outcome>,
    buffer: usize,
) -> (mpsc::Receiver<RenderResult>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers.max(1) {
        let input = input.clone();
        let executor = executor.clone();
        let output_dir = output_dir.clone();
        let tx = tx.clone();
        let results = results.clone();
        let mut cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            while let Some(chart) = recv_or_cancel(&input, &mut cancel).await {
                trace_render(worker_id, &chart);
                match render_one(executor.as_ref(), &output_dir, &chart, &mut cancel).await {
                    Ok(rendered) => {
                        if tx.send(rendered).await.is_err() {
                            break;
                        }
                    }
                    Err(envelope) => {
                        if !send_outcome(&results, Outcome::Failed(envelope)).await {
                            break;
                        }
                    }
                }
            }
        }));
    }
    drop(tx); // all output-channel clones now live on worker tasks only
    (rx, handles)
}

fn trace_render(worker_id: usize, chart: &ChartSpec) {
    debug!(
        "[render#{}] {} {} ({})",
        worker_id, chart.chart_name, chart.chart_version, chart.env
    );
}

async fn render_one<E: CommandExecutor>(
    executor: &E,
    output_dir: &Path,
    chart: &ChartSpec,
    cancel: &mut watch::Receiver<bool>,
) -> std::result::Result<RenderResult, ErrorEnvelope> {
    let envelope = |msg: String| ErrorEnvelope {
        chart: chart.clone(),
        error: msg,
    };

    // Explicit existence checks: the template tool's own error for a
    // missing values file is opaque (spec.md §4.1).
    if !file_exists(&chart.base_values_file) {
        return Err(envelope(format!(
            "base values file does not exist: {}",
            chart.base_values_file.display()
        )));
    }
    if !file_exists(&chart.values_override) {
        return Err(envelope(format!(
            "values override file does not exist: {}",
            chart.values_override.display()
        )));
    }

    let args = vec![
        "template".to_string(),
        chart.chart_name.clone(),
        "--release-name".to_string(),
        chart.chart_name.clone(),
        "--repo".to_string(),
        chart.repo_url.clone(),
        "-f".to_string(),
        chart.base_values_file.to_string_lossy().into_owned(),
        "-f".to_string(),
        chart.values_override.to_string_lossy().into_owned(),
        "--version".to_string(),
        chart.chart_version.clone(),
        "--include-crds".to_string(),
    ];

    let output = run_cancelable(executor, "helm", &args, cancel)
        .await
        .map_err(|e| envelope(format!("failed to invoke helm template: {}", e)))?;
    if !output.success {
        warn!(
            "helm template failed for {}: {}",
            chart.chart_name,
            output.combined()
        );
        return Err(envelope(format!(
            "helm template exited non-zero for {}: {}",
            chart.chart_name,
            output.combined()
        )));
    }

    let filename = format!("{}_{}.yaml", chart.chart_name, random_suffix());
    let manifest_path = output_dir.join(filename);
    tokio::fs::write(&manifest_path, output.combined().as_bytes())
        .await
        .map_err(|e| {
            envelope(format!(
                "failed to write rendered manifest to {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

    Ok(RenderResult {
        chart: chart.clone(),
        manifest_path,
    })
}
