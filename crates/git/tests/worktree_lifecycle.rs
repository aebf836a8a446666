use std::{fs, path::Path};

use git::{GitCli, Worktree, diff_contents, unified_diff, worktree::WORKTREE_DIR};
use git2::Repository;
use tempfile::TempDir;

fn write_file<P: AsRef<Path>>(base: P, rel: &str, content: &str) {
    let path = base.as_ref().join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
}

fn commit_all(repo: &Repository, message: &str) {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = repo.signature().unwrap();
    let parents: Vec<git2::Commit> = match repo.head() {
        Ok(h) => vec![h.peel_to_commit().unwrap()],
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => vec![],
        Err(e) => panic!("failed to read HEAD: {e}"),
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap();
}

fn setup_repo(td: &TempDir) -> std::path::PathBuf {
    let repo_path = td.path().join("repo");
    fs::create_dir_all(&repo_path).unwrap();
    let repo = Repository::init(&repo_path).unwrap();
    let mut cfg = repo.config().unwrap();
    cfg.set_str("user.name", "Test User").unwrap();
    cfg.set_str("user.email", "test@example.com").unwrap();
    write_file(&repo_path, "src/lib.js", "function add(a, b) { return a + b; }\n");
    write_file(&repo_path, "README.md", "# fixture\n");
    commit_all(&repo, "initial");
    repo_path
}

#[tokio::test(flavor = "multi_thread")]
async fn create_reset_remove_roundtrip() {
    let td = TempDir::new().unwrap();
    let repo_path = setup_repo(&td);
    let cli = GitCli::default();

    let wt = Worktree::create(cli.clone(), &repo_path).await.unwrap();
    let wt_path = wt.path().to_path_buf();
    assert!(wt_path.starts_with(repo_path.join(WORKTREE_DIR)));
    assert_eq!(wt.run_id().len(), 12);
    // Worktrees carry a `.git` file pointing at the parent repo.
    assert!(wt_path.join(".git").is_file());
    assert!(wt_path.join("src/lib.js").is_file());

    // Detached HEAD, not a named branch.
    let head = cli.git_quiet(&wt_path, ["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(head, "HEAD");

    let sha = wt.head_sha().await.unwrap();
    assert_eq!(sha.len(), 40);

    // Dirty the tree, then reset back to HEAD.
    write_file(&wt_path, "src/lib.js", "mutated\n");
    write_file(&wt_path, "scratch.txt", "untracked\n");
    wt.reset_hard().await.unwrap();
    assert_eq!(
        fs::read_to_string(wt_path.join("src/lib.js")).unwrap(),
        "function add(a, b) { return a + b; }\n"
    );
    assert!(!wt_path.join("scratch.txt").exists());

    let run_id = wt.run_id().to_string();
    wt.remove().await;
    assert!(!wt_path.exists());
    let listed = cli.git_quiet(&repo_path, ["worktree", "list", "--porcelain"]);
    assert!(!listed.contains(&run_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_guard_cleans_up_without_explicit_remove() {
    let td = TempDir::new().unwrap();
    let repo_path = setup_repo(&td);
    let cli = GitCli::default();

    let wt_path = {
        let wt = Worktree::create(cli.clone(), &repo_path).await.unwrap();
        wt.path().to_path_buf()
    };
    assert!(!wt_path.exists());
    let listed = cli.git_quiet(&repo_path, ["worktree", "list", "--porcelain"]);
    assert!(!listed.contains(".crucible"));
}

#[tokio::test(flavor = "multi_thread")]
async fn worktree_prefix_is_excluded_from_status() {
    let td = TempDir::new().unwrap();
    let repo_path = setup_repo(&td);
    let cli = GitCli::default();

    let wt = Worktree::create(cli.clone(), &repo_path).await.unwrap();
    let status = cli.git_quiet(&repo_path, ["status", "--porcelain"]);
    assert!(
        !status.contains(".crucible"),
        "worktree dir leaked into status: {status}"
    );
    wt.remove().await;
}

#[test]
fn diff_contents_of_identical_inputs_is_empty() {
    let cli = GitCli::default();
    let diff = diff_contents(&cli, "same\n", "same\n", "src/x.js").unwrap();
    assert_eq!(diff, "");
}

#[test]
fn diff_contents_reports_changed_lines() {
    let cli = GitCli::default();
    let diff = diff_contents(&cli, "old line\n", "new line\n", "src/x.js").unwrap();
    assert!(diff.contains("-old line"));
    assert!(diff.contains("+new line"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unified_diff_covers_unstaged_changes() {
    let td = TempDir::new().unwrap();
    let repo_path = setup_repo(&td);
    let cli = GitCli::default();

    let wt = Worktree::create(cli.clone(), &repo_path).await.unwrap();
    write_file(wt.path(), "src/lib.js", "function add(a, b) { return a - b; }\n");

    let full = unified_diff(&cli, wt.path(), None).unwrap();
    assert!(full.contains("return a - b"));

    let scoped = unified_diff(&cli, wt.path(), Some("src/lib.js")).unwrap();
    assert!(scoped.contains("return a - b"));
    let unrelated = unified_diff(&cli, wt.path(), Some("README.md")).unwrap();
    assert_eq!(unrelated, "");

    wt.remove().await;
}

#[test]
fn quiet_runner_never_fails() {
    let cli = GitCli::default();
    let td = TempDir::new().unwrap();
    // Not a repository: non-zero exit maps to an empty string.
    let out = cli.git_quiet(td.path(), ["rev-parse", "HEAD"]);
    assert_eq!(out, "");
}
