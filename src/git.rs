use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Run `git args...` in `dir` and return trimmed-right stdout.
fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| Error::Git(format!("failed to run git {}: {e}", args.join(" "))))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

/// Top-level directory of the repository containing `dir`.
pub fn repo_root(dir: &Path) -> Result<PathBuf> {
    let root = git(dir, &["rev-parse", "--show-toplevel"])?;
    Ok(PathBuf::from(root))
}

/// Diff of `HEAD` against its merge base with `base`.
pub fn diff_against(dir: &Path, base: &str) -> Result<String> {
    let range = format!("{base}...HEAD");
    let diff = git(dir, &["diff", &range])?;
    debug!(base, bytes = diff.len(), "computed diff");
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {args:?} failed");
    }

    fn init_repo() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        run(dir, &["init", "-q", "-b", "main"]);
        run(dir, &["config", "user.email", "test@example.com"]);
        run(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("lib.rs"), "fn a() {}\n").unwrap();
        run(dir, &["add", "."]);
        run(dir, &["commit", "-q", "-m", "init"]);
        tmp
    }

    #[test]
    fn test_diff_against_base() {
        let tmp = init_repo();
        let dir = tmp.path();
        run(dir, &["checkout", "-q", "-b", "feature"]);
        std::fs::write(dir.join("lib.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        run(dir, &["commit", "-q", "-am", "add b"]);

        let diff = diff_against(dir, "main").unwrap();
        assert!(diff.contains("+fn b() {}"));
        assert!(diff_against(dir, "main").unwrap() == diff);
    }

    #[test]
    fn test_diff_unknown_base_is_error() {
        let tmp = init_repo();
        let err = diff_against(tmp.path(), "no-such-branch").unwrap_err();
        assert!(matches!(err, Error::Git(_)));
    }

    #[test]
    fn test_repo_root_from_subdir() {
        let tmp = init_repo();
        let sub = tmp.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        let root = repo_root(&sub).unwrap();
        assert_eq!(
            root.canonicalize().unwrap(),
            tmp.path().canonicalize().unwrap()
        );
    }
}
