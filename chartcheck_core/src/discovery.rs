use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::types::ChartSpec;
use crate::{Result, ErrorKind};

/// Shape of one `spec.generators[0].list.elements[*]` entry. Fields are
/// `Option<String>` because spec.md §6 allows them to be missing, in which
/// case an empty string is substituted.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct AppSetElement {
    #[serde(default)]
    chart_name: Option<String>,
    #[serde(default)]
    repo_url: Option<String>,
    #[serde(default)]
    chart_version: Option<String>,
    #[serde(default)]
    base_values_file: Option<String>,
    #[serde(default)]
    values_override: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ListGenerator {
    elements: Vec<AppSetElement>,
}

#[derive(Deserialize, Debug)]
struct Generator {
    list: ListGenerator,
}

#[derive(Deserialize, Debug)]
struct ApplicationSetSpec {
    generators: Vec<Generator>,
}

#[derive(Deserialize, Debug)]
struct ApplicationSet {
    spec: ApplicationSetSpec,
}

fn opt(s: Option<String>) -> String {
    s.unwrap_or_default()
}

/// Read one `*appset.yaml` file into a flat list of [`ChartSpec`]s.
///
/// `base_values_file`/`values_override` fragments are joined onto
/// `src_prefix` per spec.md §6; missing string fields become `""`.
fn load_appset(path: &Path, env: &str, src_prefix: &Path) -> Result<Vec<ChartSpec>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        ErrorKind::InputMissing(format!("could not read appset {}: {}", path.display(), e))
    })?;
    let doc: ApplicationSet = serde_yaml::from_str(&raw)?;
    let mut out = Vec::new();
    for gen in doc.spec.generators {
        for el in gen.list.elements {
            out.push(ChartSpec {
                env: env.to_string(),
                chart_name: opt(el.chart_name),
                repo_url: opt(el.repo_url),
                chart_version: opt(el.chart_version),
                base_values_file: src_prefix.join(opt(el.base_values_file)),
                values_override: src_prefix.join(opt(el.values_override)),
            });
        }
    }
    Ok(out)
}

/// Discover every ChartSpec under `<envdir>/<env>/appsets/*appset.yaml`.
///
/// `env` restricts discovery to a single environment subdirectory; `None`
/// scans every subdirectory of `envdir` (spec.md §6 default behavior).
pub fn discover(envdir: &Path, env: Option<&str>, src_prefix: &Path) -> Result<Vec<ChartSpec>> {
    if !envdir.is_dir() {
        return Err(ErrorKind::InputMissing(format!(
            "envdir does not exist: {}",
            envdir.display()
        ))
        .into());
    }

    let env_dirs: Vec<PathBuf> = if let Some(e) = env {
        vec![envdir.join(e)]
    } else {
        fs::read_dir(envdir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect()
    };

    let mut specs = Vec::new();
    for dir in env_dirs {
        let env_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let appsets_dir = dir.join("appsets");
        if !appsets_dir.is_dir() {
            debug!("no appsets directory under {}, skipping", dir.display());
            continue;
        }
        for entry in WalkDir::new(&appsets_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with("appset.yaml") {
                continue;
            }
            debug!("discovered appset {}", entry.path().display());
            specs.extend(load_appset(entry.path(), &env_name, src_prefix)?);
        }
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovers_elements_with_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = dir.path().join("dev").join("appsets");
        fs::create_dir_all(&env_dir).unwrap();
        fs::write(
            env_dir.join("frontend.appset.yaml"),
            r#"
spec:
  generators:
    - list:
        elements:
          - chartName: frontend
            repoURL: https://charts.example.com
            chartVersion: 1.2.3
            baseValuesFile: frontend/base.yaml
            valuesOverride: frontend/dev.yaml
          - chartName: partial
"#,
        )
        .unwrap();

        let specs = discover(dir.path(), Some("dev"), Path::new("../")).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].chart_name, "frontend");
        assert_eq!(specs[0].env, "dev");
        assert_eq!(
            specs[0].base_values_file,
            Path::new("../frontend/base.yaml")
        );
        assert_eq!(specs[1].chart_name, "partial");
        assert_eq!(specs[1].repo_url, "");
    }

    #[test]
    fn missing_envdir_errors() {
        let res = discover(Path::new("/does/not/exist"), None, Path::new("../"));
        assert!(res.is_err());
    }
}
