//! The `GIT_SSH` wrapper script and the `SSH_ASKPASS` fallback.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use sha1::{Digest, Sha1};

const SSH_OPTIONS: &str = "-o StrictHostKeyChecking=no -o BatchMode=yes -o UserKnownHostsFile=/dev/null";

const ECHO_CANDIDATES: &[&str] = &["/bin/echo", "/usr/bin/echo"];

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Script body that runs ssh non-interactively, or the custom command.
pub fn wrapper_script_content(custom_ssh: Option<&str>) -> String {
    match custom_ssh.map(str::trim).filter(|cmd| !cmd.is_empty()) {
        Some(cmd) => format!("#!/bin/sh\nexec \"{}\" \"$@\"\n", cmd),
        None => format!("#!/bin/sh\nexec ssh {} \"$@\"\n", SSH_OPTIONS),
    }
}

/// Writes the wrapper script into `dir` (once per distinct content) and
/// returns its path. The file name is derived from the content, so callers
/// configured the same way share one script.
pub fn ensure_wrapper_script(dir: &Path, custom_ssh: Option<&str>) -> io::Result<PathBuf> {
    let content = wrapper_script_content(custom_ssh);
    let digest = hex::encode(Sha1::digest(content.as_bytes()));
    let path = dir.join(format!("gitsync-ssh-{}.sh", &digest[..12]));

    if fs::read_to_string(&path).is_ok_and(|existing| existing == content) {
        return Ok(path);
    }

    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".gitsync-ssh-{}-{}.tmp",
        std::process::id(),
        SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp, &content)?;
    make_executable(&tmp)?;
    fs::rename(&tmp, &path)?;
    log::debug!("Wrote ssh wrapper script {}", path.display());
    Ok(path)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// A command that prints nothing useful, used as `SSH_ASKPASS` so ssh never
/// blocks on a prompt. `None` (with a warning, logged once) when none exists.
pub fn empty_output_command() -> Option<&'static str> {
    static FOUND: OnceLock<Option<&'static str>> = OnceLock::new();
    *FOUND.get_or_init(|| {
        let found = ECHO_CANDIDATES
            .iter()
            .copied()
            .find(|candidate| Path::new(candidate).is_file());
        if found.is_none() {
            log::warn!(
                "No echo command found in {:?}; SSH_ASKPASS will not be set",
                ECHO_CANDIDATES
            );
        }
        found
    })
}
