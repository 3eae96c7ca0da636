//! Git Repository Manager (C3).
//!
//! Filesystem-local repo store keyed by slug: init, shallow clone,
//! branch list/create/checkout/delete, status, log, commit, diff summary,
//! per-file diff. Built on `git2`, following the `Repository::open`/
//! `Repository::init` + `Signature` + index-staging pattern used by
//! `other_examples`' `GitGPT` (the teacher itself carries no git support).
//! `git2` is synchronous; every operation runs on a blocking thread so the
//! async caller still suspends rather than blocks, per the concurrency
//! model's "all git operations may suspend" rule.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// One branch as reported by `listBranches`.
#[derive(Debug, Clone)]
pub struct Branch {
    pub name: String,
    pub is_current: bool,
    pub upstream: Option<String>,
    pub ahead: usize,
    pub behind: usize,
}

/// One commit as reported by `log`.
#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub sha: String,
    pub author: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct FileDiffEntry {
    pub status: FileStatus,
    pub path: String,
    pub old_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DiffSummary {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub staged: Vec<FileDiffEntry>,
    pub unstaged: Vec<FileDiffEntry>,
}

/// A unified-diff hunk for a single file.
#[derive(Debug, Clone)]
pub struct Hunk {
    pub header: String,
    pub lines: Vec<String>,
}

fn status_from_git2(status: git2::Status) -> Option<FileStatus> {
    if status.is_wt_new() || status.is_index_new() {
        Some(FileStatus::Added)
    } else if status.is_wt_deleted() || status.is_index_deleted() {
        Some(FileStatus::Deleted)
    } else if status.is_wt_renamed() || status.is_index_renamed() {
        Some(FileStatus::Renamed)
    } else if status.is_wt_modified() || status.is_index_modified() {
        Some(FileStatus::Modified)
    } else {
        None
    }
}

/// Manages all repos under `{data_root}/repos/{slug}`, serializing
/// operations per repo with a dedicated mutex so concurrent callers never
/// race on the same git index, while unrelated repos proceed independently.
pub struct RepoManager {
    data_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoManager {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repo_path(&self, slug: &str) -> PathBuf {
        self.data_root.join("repos").join(slug)
    }

    async fn lock_for(&self, slug: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(slug.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Initialize an empty repo with the given default branch.
    pub async fn create(&self, slug: &str, default_branch: &str) -> Result<PathBuf> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        let branch = default_branch.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&path)?;
            let mut opts = git2::RepositoryInitOptions::new();
            opts.initial_head(&branch);
            git2::Repository::init_opts(&path, &opts)
                .map_err(|e| Error::runtime(format!("git init failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))??;
        Ok(self.repo_path(slug))
    }

    /// Shallow clone (depth=1) a remote URL into `{data_root}/repos/{slug}`.
    pub async fn clone(&self, url: &str, slug: &str) -> Result<PathBuf> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        let url = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut fetch_opts = git2::FetchOptions::new();
            fetch_opts.depth(1);
            git2::build::RepoBuilder::new()
                .fetch_options(fetch_opts)
                .clone(&url, &path)
                .map_err(|e| classify_clone_error(&e))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))??;
        Ok(self.repo_path(slug))
    }

    pub async fn list_branches(&self, slug: &str) -> Result<Vec<Branch>> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        tokio::task::spawn_blocking(move || -> Result<Vec<Branch>> {
            let repo = open(&path)?;
            let head_name = repo
                .head()
                .ok()
                .and_then(|h| h.shorthand().map(String::from));
            let mut out = Vec::new();
            let branches = repo
                .branches(Some(git2::BranchType::Local))
                .map_err(|e| Error::runtime(format!("list branches failed: {e}")))?;
            for item in branches {
                let (branch, _) = item.map_err(|e| Error::runtime(e.to_string()))?;
                let name = branch.name().ok().flatten().unwrap_or("").to_string();
                let upstream = branch.upstream().ok().and_then(|u| u.name().ok().flatten().map(String::from));
                let is_current = head_name.as_deref() == Some(name.as_str());
                out.push(Branch {
                    name,
                    is_current,
                    upstream,
                    ahead: 0,
                    behind: 0,
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    pub async fn create_branch(&self, slug: &str, name: &str, from_ref: Option<&str>) -> Result<()> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        let name = name.to_string();
        let from_ref = from_ref.map(String::from);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = open(&path)?;
            let target = match &from_ref {
                Some(r) => repo
                    .revparse_single(r)
                    .map_err(|_| Error::not_found(format!("ref '{r}'")))?
                    .peel_to_commit()
                    .map_err(|e| Error::runtime(e.to_string()))?,
                None => repo
                    .head()
                    .map_err(|e| Error::runtime(e.to_string()))?
                    .peel_to_commit()
                    .map_err(|e| Error::runtime(e.to_string()))?,
            };
            repo.branch(&name, &target, false)
                .map_err(|e| Error::conflict(format!("branch '{name}' already exists: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    pub async fn checkout(&self, slug: &str, name: &str) -> Result<()> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = open(&path)?;
            let refname = format!("refs/heads/{name}");
            let obj = repo
                .revparse_single(&refname)
                .map_err(|_| Error::not_found(format!("branch '{name}'")))?;
            repo.checkout_tree(&obj, None)
                .map_err(|e| Error::runtime(format!("checkout failed: {e}")))?;
            repo.set_head(&refname)
                .map_err(|e| Error::runtime(format!("set_head failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    /// Refuses to delete the currently checked-out branch.
    pub async fn delete_branch(&self, slug: &str, name: &str) -> Result<()> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = open(&path)?;
            let current = repo.head().ok().and_then(|h| h.shorthand().map(String::from));
            if current.as_deref() == Some(name.as_str()) {
                return Err(Error::conflict(format!("cannot delete the current branch '{name}'")));
            }
            let mut branch = repo
                .find_branch(&name, git2::BranchType::Local)
                .map_err(|_| Error::not_found(format!("branch '{name}'")))?;
            branch
                .delete()
                .map_err(|e| Error::runtime(format!("delete branch failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    pub async fn status(&self, slug: &str) -> Result<StatusReport> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        tokio::task::spawn_blocking(move || -> Result<StatusReport> {
            let repo = open(&path)?;
            let mut opts = git2::StatusOptions::new();
            opts.include_untracked(true);
            let statuses = repo
                .statuses(Some(&mut opts))
                .map_err(|e| Error::runtime(format!("status failed: {e}")))?;
            let mut report = StatusReport::default();
            for entry in statuses.iter() {
                let Some(path) = entry.path().map(String::from) else {
                    continue;
                };
                let Some(kind) = status_from_git2(entry.status()) else {
                    continue;
                };
                let diff_entry = FileDiffEntry {
                    status: kind,
                    path,
                    old_path: None,
                };
                let s = entry.status();
                if s.is_index_new() || s.is_index_modified() || s.is_index_deleted() || s.is_index_renamed() {
                    report.staged.push(diff_entry);
                } else {
                    report.unstaged.push(diff_entry);
                }
            }
            Ok(report)
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    pub async fn log(&self, slug: &str, limit: usize) -> Result<Vec<CommitEntry>> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        tokio::task::spawn_blocking(move || -> Result<Vec<CommitEntry>> {
            let repo = open(&path)?;
            let mut walk = repo.revwalk().map_err(|e| Error::runtime(e.to_string()))?;
            walk.push_head().map_err(|e| Error::runtime(e.to_string()))?;
            let mut out = Vec::new();
            for oid in walk.take(limit) {
                let oid = oid.map_err(|e| Error::runtime(e.to_string()))?;
                let commit = repo.find_commit(oid).map_err(|e| Error::runtime(e.to_string()))?;
                let author = commit.author();
                let time = DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_else(Utc::now);
                out.push(CommitEntry {
                    sha: oid.to_string(),
                    author: author.name().unwrap_or("unknown").to_string(),
                    message: commit.message().unwrap_or("").to_string(),
                    time,
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    /// Stage all changes and commit; returns the new commit sha.
    pub async fn commit(&self, slug: &str, message: &str, author_name: &str, author_email: &str) -> Result<String> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        let message = message.to_string();
        let author_name = author_name.to_string();
        let author_email = author_email.to_string();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let repo = open(&path)?;
            let mut index = repo.index().map_err(|e| Error::runtime(e.to_string()))?;
            index
                .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                .map_err(|e| Error::runtime(format!("stage failed: {e}")))?;
            index.write().map_err(|e| Error::runtime(e.to_string()))?;

            let tree_oid = index.write_tree().map_err(|e| Error::runtime(e.to_string()))?;
            let tree = repo.find_tree(tree_oid).map_err(|e| Error::runtime(e.to_string()))?;
            let sig = git2::Signature::now(&author_name, &author_email)
                .map_err(|e| Error::runtime(format!("invalid author: {e}")))?;

            let parents = match repo.head().ok().and_then(|h| h.target()) {
                Some(oid) => vec![repo.find_commit(oid).map_err(|e| Error::runtime(e.to_string()))?],
                None => vec![],
            };
            let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

            let commit_oid = repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &parent_refs)
                .map_err(|e| Error::runtime(format!("commit failed: {e}")))?;
            Ok(commit_oid.to_string())
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    pub async fn diff_summary(&self, slug: &str, from_ref: Option<&str>, to_ref: Option<&str>) -> Result<DiffSummary> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        let from_ref = from_ref.map(String::from);
        let to_ref = to_ref.map(String::from);
        tokio::task::spawn_blocking(move || -> Result<DiffSummary> {
            let repo = open(&path)?;
            let diff = build_diff(&repo, from_ref.as_deref(), to_ref.as_deref())?;
            let mut summary = DiffSummary::default();
            diff.foreach(
                &mut |delta, _progress| {
                    let old_path = delta.old_file().path().map(|p| p.display().to_string());
                    let new_path = delta.new_file().path().map(|p| p.display().to_string());
                    match delta.status() {
                        git2::Delta::Added => {
                            if let Some(p) = new_path {
                                summary.added.push(p);
                            }
                        }
                        git2::Delta::Deleted => {
                            if let Some(p) = old_path {
                                summary.deleted.push(p);
                            }
                        }
                        git2::Delta::Renamed => {
                            if let (Some(o), Some(n)) = (old_path, new_path) {
                                summary.renamed.push((o, n));
                            }
                        }
                        _ => {
                            if let Some(p) = new_path {
                                summary.modified.push(p);
                            }
                        }
                    }
                    true
                },
                None,
                None,
                None,
            )
            .map_err(|e| Error::runtime(format!("diff failed: {e}")))?;
            Ok(summary)
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    pub async fn file_diff(
        &self,
        slug: &str,
        path_filter: &str,
        from_ref: Option<&str>,
        to_ref: Option<&str>,
    ) -> Result<Vec<Hunk>> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let repo_path = self.repo_path(slug);
        let path_filter = path_filter.to_string();
        let from_ref = from_ref.map(String::from);
        let to_ref = to_ref.map(String::from);
        tokio::task::spawn_blocking(move || -> Result<Vec<Hunk>> {
            let repo = open(&repo_path)?;
            let mut opts = git2::DiffOptions::new();
            opts.pathspec(&path_filter);
            let diff = build_diff_with_opts(&repo, from_ref.as_deref(), to_ref.as_deref(), Some(&mut opts))?;
            let mut hunks: Vec<Hunk> = Vec::new();
            diff.foreach(
                &mut |_delta, _progress| true,
                None,
                Some(&mut |_delta, hunk| {
                    hunks.push(Hunk {
                        header: String::from_utf8_lossy(hunk.header()).trim_end().to_string(),
                        lines: Vec::new(),
                    });
                    true
                }),
                Some(&mut |_delta, _hunk, line| {
                    if let Some(last) = hunks.last_mut() {
                        let prefix = match line.origin() {
                            '+' => "+",
                            '-' => "-",
                            _ => " ",
                        };
                        let content = String::from_utf8_lossy(line.content());
                        last.lines.push(format!("{prefix}{}", content.trim_end()));
                    }
                    true
                }),
            )
            .map_err(|e| Error::runtime(format!("file diff failed: {e}")))?;
            Ok(hunks)
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }

    /// Add or update a named remote. Degrades gracefully: this is for
    /// future GitHub sync and never participates in the core lifecycle.
    pub async fn add_remote(&self, slug: &str, name: &str, url: &str) -> Result<()> {
        let lock = self.lock_for(slug).await;
        let _guard = lock.lock().await;
        let path = self.repo_path(slug);
        let name = name.to_string();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = open(&path)?;
            repo.remote(&name, &url).map_err(|e| Error::runtime(format!("add remote failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("join error: {e}")))?
    }
}

fn open(path: &Path) -> Result<git2::Repository> {
    git2::Repository::open(path).map_err(|_| Error::not_found(format!("repo at {}", path.display())))
}

fn classify_clone_error(err: &git2::Error) -> Error {
    match err.code() {
        git2::ErrorCode::Auth => Error::Auth(err.message().to_string()),
        git2::ErrorCode::NotFound => Error::not_found(err.message()),
        _ => Error::Network(err.message().to_string()),
    }
}

fn resolve_tree<'a>(repo: &'a git2::Repository, reference: Option<&str>) -> Result<git2::Tree<'a>> {
    let obj = match reference {
        Some(r) => repo.revparse_single(r).map_err(|_| Error::not_found(format!("ref '{r}'")))?,
        None => repo
            .head()
            .map_err(|e| Error::runtime(e.to_string()))?
            .resolve()
            .map_err(|e| Error::runtime(e.to_string()))?
            .peel(git2::ObjectType::Commit)
            .map_err(|e| Error::runtime(e.to_string()))?,
    };
    obj.peel_to_tree().map_err(|e| Error::runtime(e.to_string()))
}

fn build_diff<'a>(repo: &'a git2::Repository, from_ref: Option<&str>, to_ref: Option<&str>) -> Result<git2::Diff<'a>> {
    build_diff_with_opts(repo, from_ref, to_ref, None)
}

fn build_diff_with_opts<'a>(
    repo: &'a git2::Repository,
    from_ref: Option<&str>,
    to_ref: Option<&str>,
    opts: Option<&mut git2::DiffOptions>,
) -> Result<git2::Diff<'a>> {
    let from_tree = resolve_tree(repo, from_ref)?;
    match to_ref {
        Some(_) => {
            let to_tree = resolve_tree(repo, to_ref)?;
            repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), opts)
                .map_err(|e| Error::runtime(e.to_string()))
        }
        None => repo
            .diff_tree_to_workdir_with_index(Some(&from_tree), opts)
            .map_err(|e| Error::runtime(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_then_commit_then_log() {
        let dir = tempdir().unwrap();
        let manager = RepoManager::new(dir.path());
        manager.create("demo", "main").await.unwrap();

        std::fs::write(manager.repo_path("demo").join("README.md"), "hello").unwrap();
        let sha = manager.commit("demo", "initial commit", "Test User", "test@example.com").await.unwrap();
        assert_eq!(sha.len(), 40);

        let log = manager.log("demo", 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "initial commit");
    }

    #[tokio::test]
    async fn branch_lifecycle() {
        let dir = tempdir().unwrap();
        let manager = RepoManager::new(dir.path());
        manager.create("demo", "main").await.unwrap();
        std::fs::write(manager.repo_path("demo").join("a.txt"), "a").unwrap();
        manager.commit("demo", "first", "T", "t@example.com").await.unwrap();

        manager.create_branch("demo", "feature", None).await.unwrap();
        let branches = manager.list_branches("demo").await.unwrap();
        assert!(branches.iter().any(|b| b.name == "feature"));

        manager.checkout("demo", "feature").await.unwrap();
        let err = manager.delete_branch("demo", "feature").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        manager.checkout("demo", "main").await.unwrap();
        manager.delete_branch("demo", "feature").await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_untracked_file() {
        let dir = tempdir().unwrap();
        let manager = RepoManager::new(dir.path());
        manager.create("demo", "main").await.unwrap();
        std::fs::write(manager.repo_path("demo").join("untracked.txt"), "x").unwrap();

        let status = manager.status("demo").await.unwrap();
        assert!(status.unstaged.iter().any(|e| e.path == "untracked.txt"));
    }
}
