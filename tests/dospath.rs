use std::fs;

use tempdir::TempDir;

use stbridge::dospath::{
    dos_to_unix, match_dos_pattern, resolve_path, unix_to_dos, valid_83, PathClass,
};

#[test]
fn dos_patterns() {
    // star stops at the dot
    assert!(match_dos_pattern("*", "README"));
    assert!(!match_dos_pattern("*", "README.TXT"));
    assert!(match_dos_pattern("*.TXT", "readme.txt"));
    assert!(!match_dos_pattern("*.TXT", "readme.doc"));
    // "*.*" matches everything, extension or not
    assert!(match_dos_pattern("*.*", "FOO.PRG"));
    assert!(match_dos_pattern("*.*", "noext"));
    // a trailing ".*" matches extension-less names
    assert!(match_dos_pattern("FOO.*", "foo"));
    assert!(match_dos_pattern("FOO.*", "FOO.BAR"));
    // question marks
    assert!(match_dos_pattern("FOO?.C", "FOO1.C"));
    assert!(!match_dos_pattern("FOO?.C", "FOO12.C"));
    // case-insensitive literals
    assert!(match_dos_pattern("AuTo.inf", "auto.INF"));
    assert!(!match_dos_pattern("AUTO.INF", "AUTO.INX"));
}

#[test]
fn eight_dot_three() {
    assert!(valid_83("FOO.PRG"));
    assert!(valid_83("DESKTOP.INF"));
    assert!(valid_83("NOEXT"));
    assert!(valid_83(".."));
    assert!(!valid_83("TOOLONGNAME.PRG"));
    assert!(!valid_83("FOO.LONG"));
    assert!(!valid_83("TWO.DOTS.X"));
    assert!(!valid_83("NINECHARS"));
}

#[test]
fn resolver_is_case_insensitive_per_segment() {
    let dir = TempDir::new("dospath").unwrap();
    let root = dir.path();
    fs::create_dir(root.join("Games")).unwrap();
    fs::write(root.join("Games").join("foo.prg"), b"x").unwrap();

    match resolve_path(root, root, 2, 2, "\\GAMES\\FOO.PRG") {
        PathClass::File(p) => assert_eq!(p, root.join("Games").join("foo.prg")),
        other => panic!("unexpected {:?}", other),
    }
    match resolve_path(root, root, 2, 2, "\\GAMES") {
        PathClass::Dir(p) => assert_eq!(p, root.join("Games")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn resolver_classifies_missing_and_invalid() {
    let dir = TempDir::new("dospath").unwrap();
    let root = dir.path();
    fs::create_dir(root.join("sub")).unwrap();

    // last component missing: synthesized lower-case name
    match resolve_path(root, root, 2, 2, "\\SUB\\NEW.TXT") {
        PathClass::Missing(p) => assert_eq!(p, root.join("sub").join("new.txt")),
        other => panic!("unexpected {:?}", other),
    }
    // missing intermediate component
    match resolve_path(root, root, 2, 2, "\\NOPE\\NEW.TXT") {
        PathClass::Invalid => {}
        other => panic!("unexpected {:?}", other),
    }
    // a file used as a directory
    fs::write(root.join("sub").join("file"), b"x").unwrap();
    match resolve_path(root, root, 2, 2, "\\SUB\\FILE\\MORE") {
        PathClass::Invalid => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn resolver_honors_drive_letters() {
    let dir = TempDir::new("dospath").unwrap();
    let root = dir.path();

    match resolve_path(root, root, 2, 2, "C:\\") {
        PathClass::Dir(p) => assert_eq!(p, root),
        other => panic!("unexpected {:?}", other),
    }
    match resolve_path(root, root, 2, 2, "A:\\FOO") {
        PathClass::NotManaged => {}
        other => panic!("unexpected {:?}", other),
    }
    // relative path while another drive is current
    match resolve_path(root, root, 0, 2, "FOO") {
        PathClass::NotManaged => {}
        other => panic!("unexpected {:?}", other),
    }
    // explicit drive letter overrides the current drive
    match resolve_path(root, root, 0, 2, "C:\\") {
        PathClass::Dir(_) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn relative_paths_anchor_at_the_current_directory() {
    let dir = TempDir::new("dospath").unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("work").join("deep")).unwrap();

    let current = root.join("work");
    match resolve_path(root, &current, 2, 2, "DEEP") {
        PathClass::Dir(p) => assert_eq!(p, root.join("work").join("deep")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn dos_time_encoding() {
    // 1980-01-01 00:00:02 UTC
    let (time, date) = unix_to_dos(315_532_802, 0);
    assert_eq!(date, 1 << 5 | 1);
    assert_eq!(time, 1);

    // same instant, one hour east
    let (time, date) = unix_to_dos(315_532_802, 1);
    assert_eq!(date, 1 << 5 | 1);
    assert_eq!(time, 1 << 11 | 1);

    // 1985-06-20 13:45:30, zone folds back out in the round trip
    let secs = dos_to_unix(13 << 11 | 45 << 5 | 15, (1985 - 1980) << 9 | 6 << 5 | 20, -3);
    let (time, date) = unix_to_dos(secs, -3);
    assert_eq!(time, 13 << 11 | 45 << 5 | 15);
    assert_eq!(date, (1985 - 1980) << 9 | 6 << 5 | 20);
}
