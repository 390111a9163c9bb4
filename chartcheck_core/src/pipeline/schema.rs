use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::{recv_or_cancel, run_cancelable, send_outcome};
use crate::exec::CommandExecutor;
use crate::types::{ErrorEnvelope, Outcome, RenderResult, ValidationResult};

/// Built-in schema location, the default kubeconform ships with.
const SCHEMA_DEFAULT: &str = "default";
/// Third-party CRD catalog, queried after the built-ins (spec.md §4.2:
/// "Order matters: first hit wins").
const SCHEMA_CRD_CATALOG: &str =
    "https://raw.githubusercontent.com/datreeio/CRDs-catalog/main/{{.Group}}/{{.ResourceKind}}_{{.ResourceAPIVersion}}.json";
/// Local override directory, queried last.
const SCHEMA_LOCAL: &str = "ci/schemas/{{.ResourceKind}}_{{.ResourceAPIVersion}}.json";

/// S2 SchemaValidator: runs the schema validator against one rendered
/// manifest. Grounded on the teacher's external-tool-invocation style in
/// `kubectl.rs`/`helm/helpers.rs` (capture output, non-zero exit is fatal
/// to that chart, never to the pipeline).
pub fn spawn<E: CommandExecutor + 'static>(
    workers: usize,
    executor: Arc<E>,
    input: Arc<Mutex<mpsc::Receiver<RenderResult>>>,
    cancel: watch::Receiver<bool>,
    results: mpsc::Sender<Outcome>,
    buffer: usize,
) -> (mpsc::Receiver<ValidationResult>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers.max(1) {
        let input = input.clone();
        let executor = executor.clone();
        let tx = tx.clone();
        let results = results.clone();
        let mut cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            while let Some(rendered) = recv_or_cancel(&input, &mut cancel).await {
                debug!(
                    "[schema#{}] validating {}",
                    worker_id,
                    rendered.manifest_path.display()
                );
                match validate_one(executor.as_ref(), rendered, &mut cancel).await {
                    Ok(validated) => {
                        if tx.send(validated).await.is_err() {
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
    drop(tx);
    (rx, handles)
}

async fn validate_one<E: CommandExecutor>(
    executor: &E,
    rendered: RenderResult,
    cancel: &mut watch::Receiver<bool>,
) -> std::result::Result<ValidationResult, ErrorEnvelope> {
    let envelope = |msg: String| ErrorEnvelope {
        chart: rendered.chart.clone(),
        error: msg,
    };

    if !rendered.manifest_path.is_file() {
        return Err(envelope(format!(
            "rendered manifest missing: {}",
            rendered.manifest_path.display()
        )));
    }

    let args = vec![
        "-strict".to_string(),
        "-summary".to_string(),
        "-schema-location".to_string(),
        SCHEMA_DEFAULT.to_string(),
        "-schema-location".to_string(),
        SCHEMA_CRD_CATALOG.to_string(),
        "-schema-location".to_string(),
        SCHEMA_LOCAL.to_string(),
        "-verbose".to_string(),
        "-exit-on-error".to_string(),
        rendered.manifest_path.to_string_lossy().into_owned(),
    ];

    let output = run_cancelable(executor, "kubeconform", &args, cancel)
        .await
        .map_err(|e| envelope(format!("failed to invoke kubeconform: {}", e)))?;
    if !output.success {
        warn!(
            "kubeconform failed for {}: {}",
            rendered.chart.chart_name,
            output.combined()
        );
        return Err(envelope(format!(
            "kubeconform rejected {}: {}",
            rendered.manifest_path.display(),
            output.combined()
        )));
    }

    Ok(ValidationResult {
        chart: rendered.chart,
        manifest_path: rendered.manifest_path,
    })
}
