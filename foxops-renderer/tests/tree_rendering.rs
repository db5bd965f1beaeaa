//! Tree rendering integration tests: paths, contents, symlinks, modes.

use std::fs;
use std::path::Path;

use foxops_core::TemplateData;
use foxops_renderer::{render, RenderError};
use serde_json::json;
use tempfile::TempDir;

fn data() -> TemplateData {
    serde_json::from_value(json!({
        "name": "Jon",
        "age": 18,
        "service": "billing",
        "db": {"port": 5432}
    }))
    .unwrap()
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn contents_and_paths_are_expanded() {
    let template = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    write(template.path(), "README.md", "{{ name }} is of age {{ age }}");
    write(template.path(), "{{ service }}/config-{{ db.port }}.yaml", "port: {{ db.port }}\n");

    render(template.path(), target.path(), &data(), &[]).expect("render");

    assert_eq!(
        fs::read_to_string(target.path().join("README.md")).unwrap(),
        "Jon is of age 18"
    );
    assert_eq!(
        fs::read_to_string(target.path().join("billing/config-5432.yaml")).unwrap(),
        "port: 5432\n"
    );
}

#[test]
fn excluded_files_keep_raw_content_but_expanded_path() {
    let template = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    write(template.path(), "docs/{{ service }}.md", "raw {{ name }}");

    render(template.path(), target.path(), &data(), &["docs/*".to_string()]).expect("render");

    assert_eq!(
        fs::read_to_string(target.path().join("docs/billing.md")).unwrap(),
        "raw {{ name }}"
    );
}

#[test]
fn binary_files_are_copied_verbatim() {
    let template = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bytes = vec![0xff, 0xfe, b'{', b'{', 0x00, 0x01];
    fs::write(template.path().join("blob.bin"), &bytes).unwrap();

    render(template.path(), target.path(), &data(), &[]).expect("render");

    assert_eq!(fs::read(target.path().join("blob.bin")).unwrap(), bytes);
}

#[test]
fn undefined_variable_aborts_render() {
    let template = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    write(template.path(), "README.md", "{{ nope }}");

    let err = render(template.path(), target.path(), &data(), &[]).unwrap_err();
    assert!(matches!(err, RenderError::Template { .. }), "got: {err}");
}

#[test]
fn existing_unrelated_content_is_preserved() {
    let template = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    write(template.path(), "README.md", "hello");
    write(target.path(), "notes.txt", "mine");

    render(template.path(), target.path(), &data(), &[]).expect("render");

    assert_eq!(fs::read_to_string(target.path().join("notes.txt")).unwrap(), "mine");
    assert!(target.path().join("README.md").exists());
}

#[test]
#[cfg(unix)]
fn permission_bits_are_copied() {
    use std::os::unix::fs::PermissionsExt;

    let template = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    write(template.path(), "bin/run.sh", "#!/bin/sh\necho {{ name }}\n");
    let script = template.path().join("bin/run.sh");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    render(template.path(), target.path(), &data(), &[]).expect("render");

    let mode = fs::metadata(target.path().join("bin/run.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
#[cfg(unix)]
fn symlinks_are_recreated_with_expanded_target() {
    let template = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    write(template.path(), "{{ service }}.md", "doc");
    std::os::unix::fs::symlink("{{ service }}.md", template.path().join("current.md")).unwrap();

    render(template.path(), target.path(), &data(), &[]).expect("render");

    let link = target.path().join("current.md");
    let meta = fs::symlink_metadata(&link).unwrap();
    assert!(meta.file_type().is_symlink(), "symlink must not be followed");
    assert_eq!(fs::read_link(&link).unwrap(), Path::new("billing.md"));
}

#[test]
#[cfg(unix)]
fn symlink_leaves_its_target_mode_alone() {
    use std::os::unix::fs::PermissionsExt;

    let template = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    write(template.path(), "bin/run.sh", "#!/bin/sh\necho {{ name }}\n");
    fs::set_permissions(template.path().join("bin/run.sh"), fs::Permissions::from_mode(0o750)).unwrap();
    std::os::unix::fs::symlink("bin/run.sh", template.path().join("run")).unwrap();

    render(template.path(), target.path(), &data(), &[]).expect("render");

    let link = target.path().join("run");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap(), Path::new("bin/run.sh"));
    let mode = fs::metadata(target.path().join("bin/run.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o750);
}

#[test]
fn render_is_deterministic_across_runs() {
    let template = TempDir::new().unwrap();
    write(template.path(), "a/b/c.txt", "{{ name }}");
    write(template.path(), "z.txt", "{{ age }}");

    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    render(template.path(), first.path(), &data(), &[]).unwrap();
    render(template.path(), second.path(), &data(), &[]).unwrap();

    for rel in ["a/b/c.txt", "z.txt"] {
        assert_eq!(
            fs::read(first.path().join(rel)).unwrap(),
            fs::read(second.path().join(rel)).unwrap(),
            "{rel} differs between runs"
        );
    }
}
