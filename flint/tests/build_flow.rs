// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end pipeline runs against a stub toolchain: tiny shell
//! scripts stand in for cc/ar so the orchestration itself - job
//! collection, parallel dispatch, archiving, linking, emitted
//! artifacts - is exercised for real.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use fs_err as fs;

use flint::paths::BuildName;
use flint::{Builder, Project, Target, util};

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn write_tool(path: &Path, content: &str) {
    write(path, content);
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

/// A project whose compiler package points at stub tools
fn fixture() -> (tempfile::TempDir, Project) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    write_tool(
        &root.join("tools/fakecc"),
        "#!/bin/sh\nout=\"\"\nprev=\"\"\nfor a in \"$@\"; do\n  if [ \"$prev\" = \"-o\" ]; then out=\"$a\"; fi\n  prev=\"$a\"\ndone\nif [ -n \"$out\" ]; then : > \"$out\"; fi\nexit 0\n",
    );
    write_tool(&root.join("tools/fakear"), "#!/bin/sh\n: > \"$2\"\nexit 0\n");

    write(&root.join("project.yml"), "project.name: demo");

    write(
        &root.join("apps/blinky/pkg.yml"),
        "pkg.type: app\npkg.deps:\n    - sys/log\n",
    );
    write(&root.join("apps/blinky/src/main.c"), "int main(void) { return 0; }\n");
    write(&root.join("apps/blinky/src/led.c"), "void led(void) {}\n");

    write(
        &root.join("sys/log/pkg.yml"),
        "pkg.type: lib\npkg.init:\n    log_init: 100\n",
    );
    write(&root.join("sys/log/src/log.c"), "void log_init(void) {}\n");

    write(
        &root.join("hw/bsp/native/pkg.yml"),
        "pkg.type: bsp\nbsp.arch: native\nbsp.linkerscript:\n    - hw/bsp/native/native.ld\n",
    );
    write(&root.join("hw/bsp/native/native.ld"), "/* stub */\n");

    write(
        &root.join("compiler/fake/pkg.yml"),
        &format!(
            "pkg.type: compiler\ncompiler.path.cc: {root}/tools/fakecc\ncompiler.path.archive: {root}/tools/fakear\ncompiler.flags.default: [-Os]\n",
            root = root.display()
        ),
    );

    write(&root.join("targets/t/pkg.yml"), "pkg.type: target");
    write(
        &root.join("targets/t/target.yml"),
        "target.app: apps/blinky\ntarget.bsp: hw/bsp/native\ntarget.compiler: compiler/fake\n",
    );

    let project = Project::open(root).unwrap();
    (dir, project)
}

#[test]
fn minimal_build_produces_artifacts() {
    let (dir, project) = fixture();
    let target = Target::load(&project, "targets/t").unwrap();

    let mut builder = Builder::new(&project, &target, BuildName::App, util::num_cpus()).unwrap();
    builder.prep_build().unwrap();

    let outcome = builder.build().unwrap();
    // main.c, led.c, log.c plus the generated sysinit source
    assert_eq!(outcome.jobs_total, 4);
    assert_eq!(outcome.jobs_run, 4);

    let image = builder.image_pkg().clone();
    assert_eq!(image.path(), "apps/blinky");

    // per-package archives for every package with sources
    let app_archive = builder.paths().archive(BuildName::App, &image);
    assert!(app_archive.exists());
    assert!(
        builder
            .archives()
            .unwrap()
            .iter()
            .any(|a| a.file_name().is_some_and(|n| n == "log.a"))
    );

    // compile commands: one entry per source, sorted by file
    let commands = fs::read_to_string(builder.paths().compile_commands(BuildName::App)).unwrap();
    let entries: serde_json::Value = serde_json::from_str(&commands).unwrap();
    let files: Vec<&str> = entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["file"].as_str().unwrap())
        .collect();
    assert_eq!(files.len(), 4);
    let mut sorted = files.clone();
    sorted.sort_unstable();
    assert_eq!(files, sorted);
    assert!(files.iter().any(|f| f.ends_with("flint_sysinit.c")));

    // link and emit
    let elf = builder.paths().elf(BuildName::App, &image);
    builder
        .link(&elf, &builder.linker_scripts(false), vec![], None)
        .unwrap();
    assert!(elf.exists());

    builder.write_build_manifest(&elf).unwrap();
    let manifest = fs::read_to_string(builder.paths().build_manifest(BuildName::App, &image)).unwrap();
    assert!(manifest.contains("apps/blinky"), "{manifest}");

    drop(dir);
}

#[test]
fn unchanged_rebuild_runs_zero_jobs() {
    let (dir, project) = fixture();
    let target = Target::load(&project, "targets/t").unwrap();

    let mut builder = Builder::new(&project, &target, BuildName::App, util::num_cpus()).unwrap();
    builder.build().unwrap();

    let commands_path = builder.paths().compile_commands(BuildName::App);
    let first_commands = fs::read(&commands_path).unwrap();

    // a second builder over the same tree sees everything up to date
    let mut again = Builder::new(&project, &target, BuildName::App, util::num_cpus()).unwrap();
    let outcome = again.build().unwrap();
    assert_eq!(outcome.jobs_run, 0);
    assert_eq!(outcome.jobs_total, 4);

    assert_eq!(fs::read(&commands_path).unwrap(), first_commands);

    drop(dir);
}

#[test]
fn deterministic_dependency_rendering() {
    let (dir, project) = fixture();
    let target = Target::load(&project, "targets/t").unwrap();

    let a = Builder::new(&project, &target, BuildName::App, util::num_cpus()).unwrap();
    let b = Builder::new(&project, &target, BuildName::App, util::num_cpus()).unwrap();

    assert_eq!(a.resolution().package_names(), b.resolution().package_names());
    assert_eq!(
        a.resolution().api_map().len(),
        b.resolution().api_map().len()
    );

    drop(dir);
}

#[test]
fn stage_scripts_publish_outputs_once() {
    use flint::stage::{self, Stage};

    let (dir, _) = fixture();
    let root = dir.path();

    // the app deposits a generated source during pre-build
    write(
        &root.join("apps/blinky/pkg.yml"),
        "pkg.type: app\npkg.deps:\n    - sys/log\npkg.pre_build_cmds:\n    - sh -c \"cp pkg.yml $MYNEWT_USER_SRC_DIR/gen.c\"\n",
    );
    let project = Project::open(root).unwrap();
    let target = Target::load(&project, "targets/t").unwrap();

    let mut builder = Builder::new(&project, &target, BuildName::App, util::num_cpus()).unwrap();
    builder.prep_build().unwrap();

    stage::run(Stage::PreBuild, &builder).unwrap();

    let published = builder
        .paths()
        .generated()
        .base
        .join("stage/pre_build/src/gen.c");
    assert!(published.exists());
    let first_mtime = fs::metadata(&published).unwrap().modified().unwrap();

    // an unchanged stage must not republish
    stage::run(Stage::PreBuild, &builder).unwrap();
    assert_eq!(fs::metadata(&published).unwrap().modified().unwrap(), first_mtime);
}

#[test]
fn failing_stage_script_is_fatal() {
    use flint::stage::{self, Stage};

    let (dir, _) = fixture();
    let root = dir.path();

    write(
        &root.join("apps/blinky/pkg.yml"),
        "pkg.type: app\npkg.deps:\n    - sys/log\npkg.post_link_cmds:\n    - sh -c \"exit 3\"\n",
    );
    let project = Project::open(root).unwrap();
    let target = Target::load(&project, "targets/t").unwrap();

    let mut builder = Builder::new(&project, &target, BuildName::App, util::num_cpus()).unwrap();
    builder.prep_build().unwrap();

    let err = stage::run(Stage::PostLink, &builder).unwrap_err();
    assert!(matches!(err, stage::Error::ScriptFailed { code: Some(3), .. }));
}

#[test]
fn package_without_sources_is_absent_from_link_input() {
    let (dir, project) = fixture();
    let target = Target::load(&project, "targets/t").unwrap();

    let mut builder = Builder::new(&project, &target, BuildName::App, util::num_cpus()).unwrap();
    builder.build().unwrap();

    // the bsp has no src/ and must contribute no archive
    let archives = builder.archives().unwrap();
    assert!(archives.iter().all(|a| !a.display().to_string().contains("bsp")));

    drop(dir);
}
