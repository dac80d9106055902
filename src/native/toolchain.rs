use std::{ffi::OsStr, path::PathBuf};

#[derive(Debug, thiserror::Error)]
#[error("Toolchain programs not found on PATH: {}", .missing.join(", "))]
pub struct MissingToolchains {
    pub missing: Vec<String>,
}

/// Resolves every program against `search_path`, failing with the full
/// list of programs that could not be found.
pub fn locate<S: AsRef<OsStr>>(
    programs: &[&str],
    search_path: Option<S>,
) -> Result<Vec<PathBuf>, MissingToolchains> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let search_path = search_path.map(|path| path.as_ref().to_owned());

    let mut found = Vec::with_capacity(programs.len());
    let mut missing = Vec::new();
    for program in programs {
        match which::which_in(program, search_path.as_ref(), &cwd) {
            Ok(path) => found.push(path),
            Err(_) => missing.push(program.to_string()),
        }
    }

    if missing.is_empty() {
        Ok(found)
    } else {
        Err(MissingToolchains { missing })
    }
}

/// Same as [`locate`] against the service's own `PATH`.
pub fn validate(programs: &[&str]) -> Result<Vec<PathBuf>, MissingToolchains> {
    let found = locate(programs, std::env::var_os("PATH"))?;
    for path in &found {
        tracing::debug!(path = %path.display(), "Toolchain found");
    }
    Ok(found)
}
