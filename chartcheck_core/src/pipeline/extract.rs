use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::{recv_or_cancel, send_outcome};
use crate::types::{ErrorEnvelope, ImageRef, Outcome, ValidationResult};

/// Minimal typed projection of a container entry - the only field this
/// stage ever reads (spec.md §9 design note: "keep the projection
/// minimal").
#[derive(Deserialize, Default)]
struct ContainerRef {
    image: Option<String>,
}

#[derive(Deserialize, Default)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<ContainerRef>,
    #[serde(default, rename = "initContainers")]
    init_containers: Vec<ContainerRef>,
}

#[derive(Deserialize, Default)]
struct PodDoc {
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Deserialize, Default)]
struct PodTemplate {
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Deserialize, Default)]
struct WorkloadSpec {
    #[serde(default)]
    template: PodTemplate,
}

#[derive(Deserialize, Default)]
struct WorkloadDoc {
    #[serde(default)]
    spec: WorkloadSpec,
}

#[derive(Deserialize)]
struct KindOnly {
    kind: Option<String>,
}

fn images_from_pod_spec(spec: &PodSpec) -> Vec<String> {
    spec.containers
        .iter()
        .chain(spec.init_containers.iter())
        .filter_map(|c| c.image.clone())
        .collect()
}

/// Parse one YAML document, dispatch on `kind`, and return every image
/// string it references - in document order, before cross-document
/// deduplication (spec.md §4.3 steps 2-3).
fn images_in_document(doc_text: &str) -> Vec<String> {
    let value: serde_yaml::Value = match serde_yaml::from_str(doc_text) {
        Ok(v) => v,
        Err(e) => {
            warn!("skipping malformed manifest document: {}", e);
            return Vec::new();
        }
    };
    if value.is_null() {
        return Vec::new();
    }
    let kind_only: KindOnly = match serde_yaml::from_value(value.clone()) {
        Ok(k) => k,
        Err(e) => {
            warn!("skipping document without a readable kind: {}", e);
            return Vec::new();
        }
    };
    let kind = match kind_only.kind {
        Some(k) => k,
        None => {
            warn!("skipping document missing a kind field");
            return Vec::new();
        }
    };

    match kind.as_str() {
        "Pod" => {
            let pod: PodDoc = serde_yaml::from_value(value).unwrap_or_default();
            images_from_pod_spec(&pod.spec)
        }
        "Deployment" | "DaemonSet" | "StatefulSet" => {
            let workload: WorkloadDoc = serde_yaml::from_value(value).unwrap_or_default();
            images_from_pod_spec(&workload.spec.template.spec)
        }
        _ => Vec::new(),
    }
}

/// S3 ImageExtractor: splits a rendered manifest into documents, extracts
/// container images from the four recognized workload kinds, and emits one
/// [`ImageRef`] per unique image (first-occurrence order, spec.md §4.3).
pub fn spawn(
    workers: usize,
    input: Arc<Mutex<mpsc::Receiver<ValidationResult>>>,
    cancel: watch::Receiver<bool>,
    results: mpsc::Sender<Outcome>,
    buffer: usize,
) -> (mpsc::Receiver<ImageRef>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers.max(1) {
        let input = input.clone();
        let tx = tx.clone();
        let results = results.clone();
        let mut cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            while let Some(validated) = recv_or_cancel(&input, &mut cancel).await {
                debug!(
                    "[extract#{}] reading {}",
                    worker_id,
                    validated.manifest_path.display()
                );
                match extract_one(validated).await {
                    Ok(refs) => {
                        for image_ref in refs {
                            if tx.send(image_ref).await.is_err() {
                                return;
                            }
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

async fn extract_one(
    validated: ValidationResult,
) -> std::result::Result<Vec<ImageRef>, ErrorEnvelope> {
    let envelope = |msg: String| ErrorEnvelope {
        chart: validated.chart.clone(),
        error: msg,
    };

    let raw = tokio::fs::read_to_string(&validated.manifest_path)
        .await
        .map_err(|e| {
            envelope(format!(
                "failed to read manifest {}: {}",
                validated.manifest_path.display(),
                e
            ))
        })?;

    let mut seen = HashSet::new();
    let mut images = Vec::new();
    for doc in raw.split("\n---\n") {
        if doc.trim().is_empty() {
            continue;
        }
        for image in images_in_document(doc) {
            if seen.insert(image.clone()) {
                images.push(image);
            }
        }
    }

    let refs = images
        .into_iter()
        .map(|image| ImageRef {
            chart: validated.chart.clone(),
            manifest_path: validated.manifest_path.clone(),
            image,
        })
        .collect();
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_pod_containers() {
        let doc = r#"
kind: Pod
spec:
  containers:
    - name: app
      image: alpine:3
  initContainers:
    - name: init
      image: busybox:1
"#;
        let images = images_in_document(doc);
        assert_eq!(images, vec!["alpine:3".to_string(), "busybox:1".to_string()]);
    }

    #[test]
    fn extracts_deployment_template() {
        let doc = r#"
kind: Deployment
spec:
  template:
    spec:
      containers:
        - name: app
          image: nginx:1
"#;
        let images = images_in_document(doc);
        assert_eq!(images, vec!["nginx:1".to_string()]);
    }

    #[test]
    fn ignores_unrecognized_kind() {
        let doc = "kind: ConfigMap\ndata:\n  key: value\n";
        let images = images_in_document(doc);
        assert!(images.is_empty());
    }

    #[test]
    fn ignores_missing_kind() {
        let doc = "data:\n  key: value\n";
        let images = images_in_document(doc);
        assert!(images.is_empty());
    }
}
