use std::fs;

use anyhow::Result;

use shunt_core::config::CACHE_DIR_NAME;
use shunt_core::logger::EngineLogger;
use shunt_core::planner;

#[test]
fn scan_finds_nested_files_with_sizes() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("data");
    fs::create_dir_all(root.join("sub/deeper"))?;
    fs::write(root.join("one.txt"), b"11")?;
    fs::write(root.join("sub/two.txt"), b"2222")?;
    fs::write(root.join("sub/deeper/three.txt"), b"333333")?;

    let cache = root.join(CACHE_DIR_NAME);
    let mut entries = planner::scan_source(&root, &cache, &EngineLogger::noop())?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    assert_eq!(entries.len(), 3);
    let total: u64 = entries.iter().map(|e| e.size).sum();
    assert_eq!(total, 12);
    Ok(())
}

#[test]
fn scan_skips_the_cache_directory() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("data");
    let cache = root.join(CACHE_DIR_NAME);
    fs::create_dir_all(&cache)?;
    fs::write(root.join("real.txt"), b"r")?;
    fs::write(cache.join("pack_1.zip"), b"stale archive")?;
    fs::write(cache.join("transfer_session.json"), b"{}")?;

    let entries = planner::scan_source(&root, &cache, &EngineLogger::noop())?;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].path.ends_with("real.txt"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn scan_skips_broken_symlinks() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("data");
    fs::create_dir_all(&root)?;
    fs::write(root.join("kept.txt"), b"k")?;
    std::os::unix::fs::symlink(root.join("missing-target"), root.join("dangling"))?;

    let cache = root.join(CACHE_DIR_NAME);
    let entries = planner::scan_source(&root, &cache, &EngineLogger::noop())?;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].path.ends_with("kept.txt"));
    Ok(())
}

#[test]
fn scan_of_a_missing_root_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("nope");
    let cache = root.join(CACHE_DIR_NAME);
    assert!(planner::scan_source(&root, &cache, &EngineLogger::noop()).is_err());
}
