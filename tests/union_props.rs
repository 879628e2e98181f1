mod common;

use common::{faulty_stack, Stack};
use std::sync::atomic::Ordering;
use unionfs::storage::FileKind;
use unionfs::{BranchId, BranchOp, Permission, UnionError};

use Permission::{ReadOnly as RO, ReadWrite as RW};

#[test]
fn whiteout_hides_lower_content() {
    let s = Stack::new(&[RW, RO]);
    s.put(1, "a/f", b"lower");

    s.union.delete("/a/f").unwrap();

    assert!(matches!(
        s.union.resolve("/a/f").unwrap_err(),
        UnionError::NotFound(_)
    ));
    assert!(s.names("/a").is_empty());
    assert!(s.exists(0, "a/.wh.f"));
    assert_eq!(s.raw(1, "a/f"), b"lower");
}

#[test]
fn create_after_delete_reveals_only_the_new_object() {
    let s = Stack::new(&[RW, RO]);
    s.put(1, "a/f", b"lower");
    s.union.delete("/a/f").unwrap();

    let created = s.union.create("/a/f", 0o644).unwrap();
    assert_eq!(created.effective, 0);
    assert_eq!(s.read("/a/f"), b"");
    assert!(!s.exists(0, "a/.wh.f"));
    assert_eq!(s.names("/a"), vec!["f"]);
}

#[test]
fn mkdir_over_a_deleted_directory_is_opaque() {
    let s = Stack::new(&[RW, RO]);
    s.put(1, "d/x", b"old");

    s.union.delete("/d/x").unwrap();
    s.union.delete("/d").unwrap();
    assert!(s.exists(0, ".wh.d"));
    assert!(!s.exists(0, "d"));

    s.union.mkdir("/d", 0o755).unwrap();
    assert!(s.names("/d").is_empty());
    assert!(s.exists(0, "d/.wh..wh..opq"));
    assert!(!s.exists(0, ".wh.d"));
    assert!(s.union.resolve("/d/x").is_err());
    assert_eq!(s.raw(1, "d/x"), b"old");
}

#[test]
fn copy_up_preserves_content_and_promotes_effective_branch() {
    use std::os::unix::fs::PermissionsExt;

    let s = Stack::new(&[RW, RO]);
    s.put(1, "dir/f", b"some lower bytes");
    std::fs::set_permissions(s.file(1, "dir/f"), std::fs::Permissions::from_mode(0o640)).unwrap();
    assert_eq!(s.union.resolve("/dir/f").unwrap().effective, 1);

    assert_eq!(s.union.ensure_writable("/dir/f").unwrap(), BranchId(0));

    let r = s.union.resolve("/dir/f").unwrap();
    assert_eq!(r.effective, 0);
    assert_eq!(s.raw(0, "dir/f"), b"some lower bytes");
    let (_, st) = s.union.stat("/dir/f").unwrap();
    assert_eq!(st.mode & 0o777, 0o640);
    assert_eq!(s.raw_names(0, "dir"), vec!["f"]);
}

#[test]
fn ensure_writable_is_idempotent() {
    let s = Stack::new(&[RW, RO]);
    s.put(1, "f", b"x");
    s.union.ensure_writable("/f").unwrap();
    s.union.write("/f", 0, b"y").unwrap();
    s.union.ensure_writable("/f").unwrap();
    assert_eq!(s.read("/f"), b"y");
}

#[test]
fn ensure_writable_without_writable_branch_is_read_only() {
    let s = Stack::new(&[RO, RO]);
    s.put(1, "f", b"x");
    let err = s.union.ensure_writable("/f").unwrap_err();
    assert!(matches!(err, UnionError::ReadOnly(_)));
    assert_eq!(err.errno(), libc::EROFS);
}

#[test]
fn failed_copy_up_leaves_nothing_behind() {
    let (dirs, top, union) = faulty_stack();
    std::fs::create_dir_all(dirs[1].path().join("a/b")).unwrap();
    std::fs::write(dirs[1].path().join("a/b/f"), b"payload").unwrap();

    top.fail_write.store(true, Ordering::SeqCst);
    let err = union.ensure_writable("/a/b/f").unwrap_err();
    assert!(matches!(err, UnionError::CopyUpFailed { .. }));
    assert_eq!(err.errno(), libc::ENOSPC);

    assert_eq!(std::fs::read_dir(dirs[0].path()).unwrap().count(), 0);
    assert_eq!(union.resolve("/a/b/f").unwrap().effective, 1);
    assert_eq!(std::fs::read(dirs[1].path().join("a/b/f")).unwrap(), b"payload");

    top.fail_write.store(false, Ordering::SeqCst);
    union.ensure_writable("/a/b/f").unwrap();
    assert_eq!(std::fs::read(dirs[0].path().join("a/b/f")).unwrap(), b"payload");
}

#[test]
fn failed_install_rename_rolls_back() {
    let (dirs, top, union) = faulty_stack();
    std::fs::write(dirs[1].path().join("f"), b"payload").unwrap();

    top.fail_rename.store(true, Ordering::SeqCst);
    assert!(union.write("/f", 0, b"x").is_err());
    assert_eq!(std::fs::read_dir(dirs[0].path()).unwrap().count(), 0);
    assert_eq!(union.read("/f", 0, 64).unwrap(), b"payload");
}

#[test]
fn failed_whiteout_keeps_object_visible() {
    let (dirs, top, union) = faulty_stack();
    std::fs::write(dirs[0].path().join("f"), b"top").unwrap();
    std::fs::write(dirs[1].path().join("f"), b"low").unwrap();

    top.fail_create.store(true, Ordering::SeqCst);
    let err = union.delete("/f").unwrap_err();
    assert!(matches!(err, UnionError::DeleteFailed { .. }));

    assert_eq!(union.read("/f", 0, 64).unwrap(), b"top");
    let mut names: Vec<String> = std::fs::read_dir(dirs[0].path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["f"]);
}

#[test]
fn merged_listing_is_the_union_of_branches() {
    let s = Stack::new(&[RW, RO]);
    s.put(0, "a", b"top a");
    s.put(0, "b", b"top b");
    s.put(1, "b", b"low b");
    s.put(1, "c", b"low c");

    assert_eq!(s.names("/"), vec!["a", "b", "c"]);
    assert_eq!(s.read("/b"), b"top b");
}

#[test]
fn opaque_marker_cuts_lower_visibility() {
    let s = Stack::new(&[RW, RO]);
    s.put(0, "d/y", b"");
    s.put(0, "d/.wh..wh..opq", b"");
    s.put(1, "d/x", b"");

    assert_eq!(s.names("/d"), vec!["y"]);
    assert!(matches!(
        s.union.resolve("/d/x").unwrap_err(),
        UnionError::NotFound(_)
    ));
}

#[test]
fn same_branch_whiteout_wins_over_object() {
    let s = Stack::new(&[RW, RO]);
    s.put(0, "f", b"stray");
    s.put(0, ".wh.f", b"");
    s.put(1, "f", b"low");
    assert!(s.union.resolve("/f").is_err());
    assert!(s.names("/").is_empty());
}

#[test]
fn deleting_a_non_empty_directory_fails() {
    let s = Stack::new(&[RW, RO]);
    s.put(1, "d/x", b"");
    assert!(matches!(
        s.union.delete("/d").unwrap_err(),
        UnionError::NotEmpty(_)
    ));
    assert!(matches!(
        s.union.delete("/missing").unwrap_err(),
        UnionError::NotFound(_)
    ));
}

#[test]
fn deleting_top_only_object_leaves_no_whiteout() {
    let s = Stack::new(&[RW, RO]);
    s.put(0, "f", b"");
    s.union.delete("/f").unwrap();
    assert!(s.raw_names(0, "/").is_empty());
}

#[test]
fn busy_removal_leaves_the_table_unchanged() {
    let s = Stack::new(&[RW, RO]);
    s.put(1, "f", b"low");
    let before = s.union.branches();

    let fh = s.union.open("/f", false).unwrap();
    let err = s
        .union
        .reconfigure_branches(BranchOp::Remove(BranchId(1)))
        .unwrap_err();
    assert!(matches!(err, UnionError::Busy(1)));

    let after = s.union.branches();
    assert_eq!(after.len(), 2);
    assert_eq!(
        after.iter().map(|b| b.id).collect::<Vec<_>>(),
        before.iter().map(|b| b.id).collect::<Vec<_>>()
    );
    assert!(after[1].removing);
    assert_eq!(s.read("/f"), b"low");

    s.union.release(fh);
    assert_eq!(s.union.branches().len(), 1);
    assert!(s.union.resolve("/f").is_err());
}

#[test]
fn symlinks_resolve_and_read_back() {
    let s = Stack::new(&[RW, RO]);
    s.union
        .symlink(std::path::Path::new("../elsewhere"), "/l")
        .unwrap();
    let r = s.union.resolve("/l").unwrap();
    assert_eq!(r.kind, FileKind::Symlink);
    assert_eq!(
        s.union.read_link("/l").unwrap(),
        std::path::PathBuf::from("../elsewhere")
    );
}

fn physical_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn failed_rename_keeps_the_replaced_destination() {
    let (dirs, top, union) = faulty_stack();
    std::fs::write(dirs[0].path().join("a"), b"src-top").unwrap();
    std::fs::write(dirs[1].path().join("a"), b"src-low").unwrap();
    std::fs::write(dirs[0].path().join("b"), b"precious").unwrap();

    top.fail_create.store(true, Ordering::SeqCst);
    let err = union.rename("/a", "/b").unwrap_err();
    assert!(matches!(err, UnionError::DeleteFailed { .. }));

    assert_eq!(union.read("/b", 0, 64).unwrap(), b"precious");
    assert_eq!(union.read("/a", 0, 64).unwrap(), b"src-top");
    assert_eq!(physical_names(dirs[0].path()), vec!["a", "b"]);

    top.fail_create.store(false, Ordering::SeqCst);
    union.rename("/a", "/b").unwrap();
    assert_eq!(union.read("/b", 0, 64).unwrap(), b"src-top");
    assert!(union.resolve("/a").is_err());
    assert_eq!(physical_names(dirs[0].path()), vec![".wh.a", "b"]);
}

#[test]
fn failed_rename_of_the_object_itself_changes_nothing() {
    let (dirs, top, union) = faulty_stack();
    std::fs::write(dirs[0].path().join("a"), b"new").unwrap();
    std::fs::write(dirs[0].path().join("b"), b"old").unwrap();

    top.fail_rename.store(true, Ordering::SeqCst);
    let err = union.rename("/a", "/b").unwrap_err();
    assert!(matches!(err, UnionError::RenameFailed { .. }));
    assert_eq!(err.errno(), libc::ENOSPC);

    assert_eq!(union.read("/a", 0, 64).unwrap(), b"new");
    assert_eq!(union.read("/b", 0, 64).unwrap(), b"old");
    assert_eq!(physical_names(dirs[0].path()), vec!["a", "b"]);
}

#[test]
fn failed_directory_rename_keeps_deleted_entries_hidden() {
    let (dirs, top, union) = faulty_stack();
    std::fs::create_dir(dirs[0].path().join("s")).unwrap();
    std::fs::write(dirs[0].path().join("s/keep"), b"").unwrap();
    std::fs::create_dir(dirs[1].path().join("t")).unwrap();
    std::fs::write(dirs[1].path().join("t/x"), b"").unwrap();
    union.delete("/t/x").unwrap();
    assert!(union.list_directory("/t").unwrap().is_empty());

    top.fail_create.store(true, Ordering::SeqCst);
    let err = union.rename("/s", "/t").unwrap_err();
    assert!(matches!(err, UnionError::RenameFailed { .. }));

    assert!(union.list_directory("/t").unwrap().is_empty());
    let kept: Vec<String> = union
        .list_directory("/s")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(kept, vec!["keep"]);
    assert_eq!(physical_names(&dirs[0].path().join("s")), vec!["keep"]);
}

#[test]
fn copy_up_links_and_unlinks_without_atomic_rename() {
    let (dirs, top, union) = faulty_stack();
    std::fs::write(dirs[1].path().join("f"), b"payload").unwrap();

    top.atomic_rename.store(false, Ordering::SeqCst);
    top.fail_rename.store(true, Ordering::SeqCst);
    union.write("/f", 0, b"P").unwrap();

    assert_eq!(physical_names(dirs[0].path()), vec!["f"]);
    assert_eq!(std::fs::read(dirs[0].path().join("f")).unwrap(), b"Payload");
    assert_eq!(std::fs::read(dirs[1].path().join("f")).unwrap(), b"payload");
    assert_eq!(union.resolve("/f").unwrap().effective, 0);
}

#[test]
fn failed_link_leaves_the_real_name_untouched() {
    let (dirs, top, union) = faulty_stack();
    std::fs::write(dirs[1].path().join("f"), b"payload").unwrap();

    top.atomic_rename.store(false, Ordering::SeqCst);
    top.fail_link.store(true, Ordering::SeqCst);
    let err = union.write("/f", 0, b"P").unwrap_err();
    assert!(matches!(err, UnionError::CopyUpFailed { .. }));

    assert!(physical_names(dirs[0].path()).is_empty());
    assert_eq!(union.read("/f", 0, 64).unwrap(), b"payload");
    assert_eq!(union.resolve("/f").unwrap().effective, 1);
}
