use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fry_builder::config::BASE_CONFIG_FILENAME;

/// Explicit root, or the nearest ancestor of the current directory holding a
/// base document.
pub(crate) fn locate_project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(root) = explicit {
        if !root.join(BASE_CONFIG_FILENAME).is_file() {
            bail!(
                "'{}' has no {}; pass the project root with --root or FRY_ROOT",
                root.display(),
                BASE_CONFIG_FILENAME
            );
        }
        return Ok(root.to_path_buf());
    }

    let cwd = std::env::current_dir().context("resolving current directory")?;
    for ancestor in cwd.ancestors() {
        if ancestor.join(BASE_CONFIG_FILENAME).is_file() {
            return Ok(ancestor.to_path_buf());
        }
    }
    bail!(
        "no {} found in '{}' or its parents; pass the project root with --root or FRY_ROOT",
        BASE_CONFIG_FILENAME,
        cwd.display()
    )
}
