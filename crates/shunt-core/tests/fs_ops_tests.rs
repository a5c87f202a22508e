use std::fs;
use std::time::Duration;

use anyhow::Result;
use filetime::FileTime;

use shunt_core::fs_ops;

const NO_DELAY: Duration = Duration::from_millis(1);

#[test]
fn remove_clears_readonly_and_deletes() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let file = temp.path().join("locked.txt");
    fs::write(&file, b"data")?;
    let mut perms = fs::metadata(&file)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(&file, perms)?;

    assert!(fs_ops::remove_file_retrying(&file, 3, NO_DELAY));
    assert!(!file.exists());
    Ok(())
}

#[test]
fn removing_a_missing_file_is_success() {
    let temp = tempfile::tempdir().unwrap();
    let gone = temp.path().join("never-existed.bin");
    assert!(fs_ops::remove_file_retrying(&gone, 3, NO_DELAY));
}

#[test]
fn copy_preserves_the_source_mtime() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let src = temp.path().join("src.bin");
    let dst = temp.path().join("dst.bin");
    fs::write(&src, vec![7u8; 4096])?;

    let past = FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(&src, past)?;

    let copied = fs_ops::copy_large_retrying(&src, &dst, 3, NO_DELAY)?;
    assert_eq!(copied, 4096);
    assert_eq!(fs::read(&src)?, fs::read(&dst)?);

    let dst_mtime = FileTime::from_last_modification_time(&fs::metadata(&dst)?);
    assert_eq!(dst_mtime.unix_seconds(), past.unix_seconds());
    Ok(())
}

#[test]
fn copy_fails_fast_on_a_missing_source() {
    let temp = tempfile::tempdir().unwrap();
    let err = fs_ops::copy_large_retrying(
        &temp.path().join("absent.bin"),
        &temp.path().join("out.bin"),
        3,
        Duration::from_secs(1),
    )
    .unwrap_err();
    // NotFound is fatal: no retries, so the error surfaces immediately.
    assert!(err.to_string().contains("absent.bin"));
}

#[test]
fn move_file_lands_content_and_removes_source() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let src_dir = temp.path().join("a");
    let dst_dir = temp.path().join("b");
    fs::create_dir_all(&src_dir)?;
    fs::create_dir_all(&dst_dir)?;
    let src = src_dir.join("payload.bin");
    let dst = dst_dir.join("payload.bin");
    fs::write(&src, b"payload-bytes")?;

    let moved = fs_ops::move_file(&src, &dst)?;
    assert_eq!(moved, 13);
    assert!(!src.exists());
    assert_eq!(fs::read(&dst)?, b"payload-bytes");
    Ok(())
}

#[test]
fn remove_tree_takes_out_nested_content() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("tree");
    fs::create_dir_all(root.join("x/y/z"))?;
    fs::write(root.join("x/y/z/deep.txt"), b"d")?;
    fs::write(root.join("top.txt"), b"t")?;

    assert!(fs_ops::remove_tree(&root));
    assert!(!root.exists());
    // Idempotent on a missing tree.
    assert!(fs_ops::remove_tree(&root));
    Ok(())
}
