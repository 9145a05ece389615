//! Minimal manifest synthesis for projects submitted without one.

use crate::files::find_manifest;
use crate::model::{ProjectDependencies, ProjectFile, Runtime};
use serde_json::{Map, Value, json};

/// Build a manifest for `runtime` with `extra` merged in.
pub fn synthesize_manifest(
    runtime: Runtime,
    project_id: &str,
    extra: &ProjectDependencies,
) -> ProjectFile {
    match runtime {
        Runtime::Python => ProjectFile::new("requirements.txt", requirements_txt(extra)),
        Runtime::Node | Runtime::Bun | Runtime::Deno => {
            ProjectFile::new("package.json", package_json(project_id, extra))
        }
    }
}

/// Append a synthesized manifest if the file set has none. Returns whether
/// one was added.
pub fn ensure_manifest(
    files: &mut Vec<ProjectFile>,
    runtime: Runtime,
    project_id: &str,
    extra: &ProjectDependencies,
) -> bool {
    if find_manifest(files).is_some() {
        return false;
    }
    files.push(synthesize_manifest(runtime, project_id, extra));
    true
}

fn package_json(project_id: &str, extra: &ProjectDependencies) -> String {
    let mut dev_dependencies = Map::new();
    dev_dependencies.insert("vite".to_string(), json!("^5.0.0"));
    for (name, version) in &extra.dev_dependencies {
        dev_dependencies.insert(name.clone(), json!(version));
    }

    let mut manifest = json!({
        "name": package_name(project_id),
        "version": "0.0.0",
        "private": true,
        "type": "module",
        "scripts": {
            "dev": "vite",
            "build": "vite build",
            "preview": "vite preview",
        },
        "dependencies": extra.dependencies,
        "devDependencies": Value::Object(dev_dependencies),
    });
    if !extra.peer_dependencies.is_empty() {
        manifest["peerDependencies"] = json!(extra.peer_dependencies);
    }

    // A Value built from maps of strings always serializes.
    serde_json::to_string_pretty(&manifest).unwrap_or_default()
}

fn requirements_txt(extra: &ProjectDependencies) -> String {
    let mut out = String::new();
    for (name, version) in extra
        .dependencies
        .iter()
        .chain(extra.dev_dependencies.iter())
    {
        let version = version.trim();
        if version.is_empty() || version == "*" {
            out.push_str(name);
        } else if version.starts_with(['=', '>', '<', '~', '!']) {
            out.push_str(&format!("{name}{version}"));
        } else {
            out.push_str(&format!("{name}=={version}"));
        }
        out.push('\n');
    }
    out
}

/// npm package names: lowercase, url-safe.
fn package_name(project_id: &str) -> String {
    let name: String = project_id
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches(['-', '.', '_']).to_string();
    if name.is_empty() {
        "buildq-project".to_string()
    } else {
        name
    }
}
