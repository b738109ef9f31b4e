//! Code generation: per-tool Python modules in the kernel workspace.
//!
//! Layout under the workspace:
//!
//! ```text
//! tools/__init__.py           package marker
//! tools/_preamble.py          tool service address + secret (mode 0600)
//! tools/<provider>/__init__.py  aggregator
//! tools/<provider>/<tool>.py    one module per tool
//! ```
//!
//! Regeneration is idempotent: identical tool lists produce
//! byte-identical files, writes go through temp-then-rename, and
//! modules whose tool disappeared are removed.

pub mod ident;
pub mod module;
pub mod pytype;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::ExecutorResult;
use sandcell_providers::Tool;

pub struct CodeGenerator {
    workspace: PathBuf,
}

impl CodeGenerator {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.workspace.join("tools")
    }

    /// Write the shared preamble with the tool service address and
    /// bearer secret. The file is owner-readable only.
    pub fn write_preamble(&self, base_url: &str, secret: &str) -> ExecutorResult<()> {
        let tools_dir = self.tools_dir();
        fs::create_dir_all(&tools_dir)?;

        let init_path = tools_dir.join("__init__.py");
        if !init_path.exists() {
            atomic_write(&init_path, &module::render_tools_init())?;
        }

        let preamble_path = tools_dir.join("_preamble.py");
        atomic_write(&preamble_path, &module::render_preamble(base_url, secret))?;
        restrict_permissions(&preamble_path)?;

        debug!(path = %preamble_path.display(), "Preamble written");
        Ok(())
    }

    /// Generate (or regenerate) the modules for one provider.
    ///
    /// Returns the module identifiers, in tool-name order.
    pub fn generate_provider(
        &self,
        provider: &str,
        tools: &[&Tool],
    ) -> ExecutorResult<Vec<String>> {
        let provider_dir = self.tools_dir().join(ident::py_ident(provider));
        fs::create_dir_all(&provider_dir)?;

        let by_name: std::collections::HashMap<&str, &Tool> = tools
            .iter()
            .map(|tool| (tool.name.as_ref(), *tool))
            .collect();
        let names: Vec<&str> = by_name.keys().copied().collect();
        let resolved = ident::resolve_collisions(&names);

        let mut module_idents = Vec::with_capacity(resolved.len());
        for (tool_name, module_ident) in &resolved {
            let Some(tool) = by_name.get(tool_name.as_str()) else {
                continue;
            };
            let rendered = module::render_tool_module(provider, tool);
            atomic_write(&provider_dir.join(format!("{module_ident}.py")), &rendered)?;
            module_idents.push(module_ident.clone());
        }

        atomic_write(
            &provider_dir.join("__init__.py"),
            &module::render_aggregator(provider, &module_idents),
        )?;

        prune_stale_modules(&provider_dir, &module_idents)?;

        info!(
            provider,
            tools = module_idents.len(),
            "Generated tool modules"
        );
        Ok(module_idents)
    }
}

/// Remove `.py` modules whose tool no longer exists.
fn prune_stale_modules(provider_dir: &Path, keep: &[String]) -> io::Result<()> {
    for entry in fs::read_dir(provider_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem == "__init__" || keep.iter().any(|ident| ident == stem) {
            continue;
        }
        debug!(path = %path.display(), "Removing stale tool module");
        fs::remove_file(&path)?;
    }
    Ok(())
}

/// Write through a temp file in the same directory, then rename into
/// place, so the kernel never imports a half-written module.
fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = temp_sibling(path);
    fs::write(&tmp, contents)?;
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("module");
    path.with_file_name(format!(".{file_name}.tmp"))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}
