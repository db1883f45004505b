//! End-to-end runs over the fixture files in `tests/macros`: import
//! expansion, compilation, validation, and execution against a recording
//! backend.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};

use makrovm::backend::{ActionBackend, MatchSpec};
use makrovm::compile_file;
use makrovm::vm::{Interpreter, Options, Outcome, Repeat};

fn macros_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/macros")
}

#[derive(Default)]
struct RecordingBackend {
    /// Scripted locate results; an empty queue means everything is found.
    finds: VecDeque<Option<(i32, i32)>>,
    clicks: Vec<(i32, i32, u8)>,
    searches: Vec<(PathBuf, MatchSpec)>,
    slept: u64,
}

impl ActionBackend for RecordingBackend {
    fn click(&mut self, x: i32, y: i32, clicks: u8) {
        self.clicks.push((x, y, clicks));
    }

    fn locate_center(
        &mut self,
        image: &Path,
        _timeout_secs: u64,
        spec: MatchSpec,
    ) -> Option<(i32, i32)> {
        self.searches.push((image.to_path_buf(), spec));
        self.finds.pop_front().unwrap_or(Some((111, 222)))
    }

    fn sleep(&mut self, seconds: u64) {
        self.slept += seconds;
    }
}

fn run_entry(finds: Vec<Option<(i32, i32)>>) -> Result<RecordingBackend> {
    let dir = macros_dir();
    let compiled = compile_file(&dir.join("main.mkr")).context("compiling main.mkr")?;
    compiled.validate(&dir).context("validating main.mkr")?;

    let backend = RecordingBackend {
        finds: finds.into(),
        ..RecordingBackend::default()
    };
    let options = Options {
        base_dir: dir,
        ..Options::default()
    };
    let mut interpreter = Interpreter::new(compiled.into_program(), backend, options);
    let outcome = interpreter
        .interpret("entry", Repeat::Times(1))
        .context("running entry")?;
    ensure!(outcome == Outcome::Finished, "unexpected outcome {outcome:?}");
    Ok(interpreter.into_backend())
}

#[test]
fn fixture_file_compiles_and_validates() -> Result<()> {
    let dir = macros_dir();
    let compiled = compile_file(&dir.join("main.mkr"))?;
    compiled.validate(&dir)?;
    Ok(())
}

#[test]
fn entry_macro_runs_imported_procedure_and_then_branch() -> Result<()> {
    let backend = run_entry(Vec::new())?;

    // CLICK 10,20 then the imported PCLICK at the located center.
    ensure!(
        backend.clicks == vec![(10, 20, 1), (111, 222, 1)],
        "clicks were {:?}",
        backend.clicks
    );
    // Banner found, so the then-branch waits instead of double-clicking.
    ensure!(backend.slept == 1, "slept {} seconds", backend.slept);

    // The imported PCLICK searches exactly; the IF condition uses the
    // session defaults.
    ensure!(backend.searches.len() == 2, "searches {:?}", backend.searches);
    ensure!(backend.searches[0].0.ends_with("images/button.png"));
    ensure!(backend.searches[0].1 == MatchSpec::PRECISE);
    ensure!(backend.searches[1].0.ends_with("images/banner.png"));
    ensure!(backend.searches[1].1 == MatchSpec::default());
    Ok(())
}

#[test]
fn entry_macro_takes_else_branch_when_banner_is_missing() -> Result<()> {
    let backend = run_entry(vec![Some((111, 222)), None])?;

    ensure!(
        backend.clicks == vec![(10, 20, 1), (111, 222, 1), (30, 40, 2)],
        "clicks were {:?}",
        backend.clicks
    );
    ensure!(backend.slept == 0, "slept {} seconds", backend.slept);
    Ok(())
}

#[test]
fn validation_rejects_a_missing_image() -> Result<()> {
    let dir = macros_dir();
    let compiled = compile_file(&dir.join("missing.mkr"))?;
    let error = compiled
        .validate(&dir)
        .expect_err("ghost.png should not validate");
    ensure!(
        error.to_string().contains("ghost.png"),
        "unexpected error {error}"
    );
    Ok(())
}

#[test]
fn validation_rejects_a_call_to_an_undefined_label() -> Result<()> {
    let dir = macros_dir();
    let compiled = compile_file(&dir.join("undefined.mkr"))?;
    let error = compiled
        .check_labels()
        .expect_err("nowhere should not resolve");
    ensure!(
        error.to_string() == "Label 'nowhere' is not defined",
        "unexpected error {error}"
    );
    Ok(())
}
