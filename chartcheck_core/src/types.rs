use std::path::PathBuf;

/// An immutable descriptor of one application to validate.
///
/// Produced by [`crate::discovery`], handed to the Coordinator, and then
/// flows by value through the pipeline - each stage wraps it, never mutates
/// the fields set here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChartSpec {
    /// Environment tag, for reporting only.
    pub env: String,
    pub chart_name: String,
    pub repo_url: String,
    pub chart_version: String,
    /// Absolute path, must exist before rendering.
    pub base_values_file: PathBuf,
    /// Absolute path, must exist before rendering.
    pub values_override: PathBuf,
}

/// Output of S1 Renderer: a chart plus the multi-document YAML it expanded to.
#[derive(Clone, Debug)]
pub struct RenderResult {
    pub chart: ChartSpec,
    /// Absolute path to the rendered, multi-document (`\n---\n`-separated) YAML.
    pub manifest_path: PathBuf,
}

/// Output of S2 SchemaValidator. Reaching this stage's output implies the
/// manifest is schema-valid; the path is unchanged from `RenderResult`.
#[derive(Clone, Debug)]
pub struct ValidationResult {
    pub chart: ChartSpec,
    pub manifest_path: PathBuf,
}

/// One unique image reference found in one rendered manifest file.
#[derive(Clone, Debug)]
pub struct ImageRef {
    pub chart: ChartSpec,
    pub manifest_path: PathBuf,
    pub image: String,
}

/// Terminal outcome of S4 ImageVerifier for one (chart, image) pair.
#[derive(Clone, Debug)]
pub struct VerifyResult {
    pub chart: ChartSpec,
    pub image: String,
    pub exists: bool,
    pub error: Option<String>,
}

/// Emitted by any stage that fails on a particular chart, so the Coordinator
/// can report the failure against the originating [`ChartSpec`].
#[derive(Clone, Debug)]
pub struct ErrorEnvelope {
    pub chart: ChartSpec,
    pub error: String,
}

/// Merged terminal event surfaced by the Coordinator's result stream.
///
/// spec.md's source keeps results and errors on two separate channels, and
/// only reads the result channel at the top level - a chart that produces
/// only an `ErrorEnvelope` can then go unobserved. Merging both kinds into
/// one `Outcome` stream closes that gap (see DESIGN.md, open question 1).
#[derive(Clone, Debug)]
pub enum Outcome {
    Verified(VerifyResult),
    Failed(ErrorEnvelope),
}

impl Outcome {
    pub fn chart(&self) -> &ChartSpec {
        match self {
            Outcome::Verified(v) => &v.chart,
            Outcome::Failed(e) => &e.chart,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Outcome::Verified(v) => v.exists && v.error.is_none(),
            Outcome::Failed(_) => false,
        }
    }
}
