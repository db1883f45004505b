//! Stack-based virtual machine for compiled macro programs.
//!
//! One logical flow executes at a time; pause/resume/cancel arrive on a
//! shared [`ControlHandle`] and are observed cooperatively at safe
//! points: before fetching an instruction and while waiting in
//! WAIT/retry/pause backoff. A live click or image scan is never
//! interrupted mid-flight.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;

use crate::backend::{ActionBackend, MatchSpec, resolve_image};
use crate::program::{Command, Instruction, Opcode, Operand, Program};

/// Settling delay after a resume, so we do not act on stale UI state.
const RESUME_SETTLE_SECS: u64 = 2;
/// Backoff between retry attempts of a failed instruction.
const RETRY_BACKOFF_SECS: u64 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The one recoverable failure kind, subject to the retry policy.
    #[error("Image '{path}' not found within {timeout_secs} seconds")]
    ImageNotFound { path: String, timeout_secs: u64 },

    #[error("Maximum retries reached: {cause}")]
    RetriesExhausted { cause: String },

    #[error("Cannot return, no caller")]
    NoCaller,

    #[error("Label '{0}' is not defined")]
    UndefinedLabel(String),

    #[error("Macro '{0}' is not defined")]
    UndefinedMacro(String),

    #[error("Program counter {0} out of bounds")]
    PcOutOfBounds(usize),

    #[error("Instruction {0} is malformed and cannot be executed")]
    MalformedInstruction(Opcode),
}

impl RuntimeError {
    /// Condition failures may be retried; everything else is fatal.
    fn is_condition(&self) -> bool {
        matches!(self, RuntimeError::ImageNotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Status(String),
    Fatal(String),
}

/// Write side of the VM's progress channel. The presentation layer owns
/// the receiver and decides how (or whether) to render messages.
#[derive(Clone, Default)]
pub struct Notifier {
    sender: Option<Sender<Notification>>,
}

impl Notifier {
    pub fn channel() -> (Self, Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn status(&self, message: impl Into<String>) {
        self.send(Notification::Status(message.into()));
    }

    pub fn fatal(&self, message: impl Into<String>) {
        self.send(Notification::Fatal(message.into()));
    }

    fn send(&self, notification: Notification) {
        if let Some(sender) = &self.sender {
            // The drain side may already be gone during shutdown.
            let _ = sender.send(notification);
        }
    }
}

#[derive(Default)]
struct ControlFlags {
    paused: bool,
    cancelled: bool,
}

/// Cloneable pause/resume/cancel signal shared between the executing
/// flow and any number of control listeners. Pause-wait and cancel-wait
/// are combined: a cancel wakes a paused session.
#[derive(Clone, Default)]
pub struct ControlHandle {
    state: Arc<ControlState>,
}

#[derive(Default)]
struct ControlState {
    flags: Mutex<ControlFlags>,
    changed: Condvar,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.update(|flags| flags.paused = true);
    }

    pub fn resume(&self) {
        self.update(|flags| flags.paused = false);
    }

    pub fn toggle_pause(&self) {
        self.update(|flags| flags.paused = !flags.paused);
    }

    pub fn cancel(&self) {
        self.update(|flags| flags.cancelled = true);
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state.flags).paused
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state.flags).cancelled
    }

    /// Blocks until the session is resumed or cancelled; returns whether
    /// it was cancelled.
    fn wait_resumed(&self) -> bool {
        let mut flags = lock(&self.state.flags);
        while flags.paused && !flags.cancelled {
            flags = self
                .state
                .changed
                .wait(flags)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        flags.cancelled
    }

    fn update(&self, apply: impl FnOnce(&mut ControlFlags)) {
        let mut flags = lock(&self.state.flags);
        apply(&mut flags);
        self.state.changed.notify_all();
    }
}

fn lock(mutex: &Mutex<ControlFlags>) -> MutexGuard<'_, ControlFlags> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session-level configuration; retry policy is not per-instruction.
#[derive(Debug, Clone)]
pub struct Options {
    pub enable_retry: bool,
    pub retry_times: u32,
    /// Default grayscale matching for non-precise image searches.
    pub grayscale: bool,
    /// Default scan stride for non-precise image searches.
    pub match_step: u8,
    /// Directory of the macro file, for resolving relative image paths.
    pub base_dir: PathBuf,
    /// Pause on an exhausted instruction instead of failing the session;
    /// resuming restarts the retry budget.
    pub pause_on_fail: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_retry: false,
            retry_times: 1,
            grayscale: true,
            match_step: 2,
            base_dir: PathBuf::from("."),
            pause_on_fail: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Forever,
    Times(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Cancelled,
}

/// Outcome of one dispatched step inside a session.
enum Step {
    Continue,
    Cancelled,
}

pub struct Interpreter<B> {
    program: Program,
    backend: B,
    options: Options,
    control: ControlHandle,
    notifier: Notifier,
}

impl<B: ActionBackend> Interpreter<B> {
    pub fn new(program: Program, backend: B, options: Options) -> Self {
        Self {
            program,
            backend,
            options,
            control: ControlHandle::new(),
            notifier: Notifier::disabled(),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Handle for delivering pause/resume/cancel requests from other
    /// threads.
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Runs `macro_name` until it finishes, is cancelled, or an
    /// unrecovered failure surfaces. Each repeat iteration restarts at
    /// the macro's label with a fresh call stack; cancellation carries
    /// across iterations.
    pub fn interpret(&mut self, macro_name: &str, repeat: Repeat) -> Result<Outcome, RuntimeError> {
        let start = match self.program.entry(macro_name) {
            Some(index) => index,
            None => {
                let error = RuntimeError::UndefinedMacro(macro_name.to_string());
                self.notifier.fatal(error.to_string());
                return Err(error);
            }
        };

        let mut iteration: u32 = 0;
        loop {
            if let Repeat::Times(times) = repeat {
                if iteration >= times {
                    return Ok(Outcome::Finished);
                }
                self.notifier.status(format!("Iteration {}", iteration + 1));
            }
            iteration = iteration.saturating_add(1);

            match self.run_session(start) {
                Ok(Outcome::Finished) => {}
                Ok(Outcome::Cancelled) => return Ok(Outcome::Cancelled),
                Err(error) => {
                    self.notifier.fatal(error.to_string());
                    return Err(error);
                }
            }
        }
    }

    fn run_session(&mut self, start: usize) -> Result<Outcome, RuntimeError> {
        let mut pc = start;
        let mut call_stack: Vec<usize> = Vec::new();

        loop {
            // Safe point: the only place pause/cancel take effect.
            if self.observe_controls() {
                return Ok(Outcome::Cancelled);
            }

            let instruction = self
                .program
                .instructions
                .get(pc)
                .cloned()
                .ok_or(RuntimeError::PcOutOfBounds(pc))?;

            match instruction {
                Instruction::Command(command) => match command.opcode {
                    Opcode::Label => pc += 1,
                    Opcode::Call => {
                        let target = name_operand(&command)?;
                        self.notifier.status(format!("Call {target}"));
                        call_stack.push(pc + 1);
                        pc = self.label(target)?;
                    }
                    Opcode::Jump => {
                        let target = name_operand(&command)?;
                        self.notifier.status(format!("Jump to {target}"));
                        pc = self.label(target)?;
                    }
                    Opcode::Return => {
                        pc = call_stack.pop().ok_or(RuntimeError::NoCaller)?;
                    }
                    Opcode::Pause => {
                        self.control.pause();
                        pc += 1;
                    }
                    Opcode::End => {
                        self.notifier.status("Macro finished");
                        return Ok(Outcome::Finished);
                    }
                    Opcode::Wait => {
                        let Operand::Seconds(seconds) = command.operand else {
                            return Err(RuntimeError::MalformedInstruction(command.opcode));
                        };
                        self.notifier.status(format!("Waiting {seconds} seconds"));
                        if let Step::Cancelled = self.wait(seconds) {
                            return Ok(Outcome::Cancelled);
                        }
                        pc += 1;
                    }
                    Opcode::Click
                    | Opcode::DoubleClick
                    | Opcode::Pclick
                    | Opcode::Find
                    | Opcode::Pfind => {
                        if let Step::Cancelled = self.execute_with_retry(&command)? {
                            return Ok(Outcome::Cancelled);
                        }
                        pc += 1;
                    }
                    Opcode::If => {
                        return Err(RuntimeError::MalformedInstruction(Opcode::If));
                    }
                },
                Instruction::Conditional(conditional) => {
                    let found = match self.execute_command(&conditional.condition) {
                        Ok(()) => true,
                        Err(error) if error.is_condition() => false,
                        Err(error) => return Err(error),
                    };
                    // Success falls through to the body; failure takes
                    // the else branch when present, the end otherwise.
                    if found != conditional.negate {
                        pc += 1;
                    } else {
                        let target = conditional
                            .else_label
                            .as_deref()
                            .unwrap_or(&conditional.end_label);
                        pc = self.label(target)?;
                    }
                }
            }
        }
    }

    /// Returns true when the session is cancelled. Blocks while paused;
    /// a resume is followed by the settling delay.
    fn observe_controls(&mut self) -> bool {
        if self.control.is_cancelled() {
            return true;
        }
        if self.control.is_paused() {
            self.notifier.status("Execution paused");
            if self.control.wait_resumed() {
                return true;
            }
            self.notifier
                .status(format!("Resuming in {RESUME_SETTLE_SECS} seconds"));
            self.backend.sleep(RESUME_SETTLE_SECS);
        }
        false
    }

    fn execute_with_retry(&mut self, command: &Command) -> Result<Step, RuntimeError> {
        loop {
            let error = match self.execute_command(command) {
                Ok(()) => return Ok(Step::Continue),
                Err(error) if error.is_condition() => error,
                Err(error) => return Err(error),
            };

            if self.options.enable_retry {
                let mut recovered = false;
                for attempt in 1..=self.options.retry_times {
                    self.notifier.status(format!(
                        "Retrying, attempt {attempt} of {}",
                        self.options.retry_times
                    ));
                    self.backend.sleep(RETRY_BACKOFF_SECS);
                    if self.observe_controls() {
                        return Ok(Step::Cancelled);
                    }
                    match self.execute_command(command) {
                        Ok(()) => {
                            recovered = true;
                            break;
                        }
                        Err(retry_error) if retry_error.is_condition() => continue,
                        Err(retry_error) => return Err(retry_error),
                    }
                }
                if recovered {
                    return Ok(Step::Continue);
                }
            }

            if self.options.pause_on_fail {
                self.notifier.status(format!("{error}; pausing execution"));
                self.control.pause();
                if self.observe_controls() {
                    return Ok(Step::Cancelled);
                }
                continue;
            }

            if self.options.enable_retry {
                return Err(RuntimeError::RetriesExhausted {
                    cause: error.to_string(),
                });
            }
            return Err(error);
        }
    }

    /// Performs the actual screen action for a click/find command.
    fn execute_command(&mut self, command: &Command) -> Result<(), RuntimeError> {
        match (command.opcode, &command.operand) {
            (Opcode::Click | Opcode::DoubleClick | Opcode::Pclick, Operand::Coords(x, y)) => {
                self.notifier.status(format!("Click at {x},{y}"));
                self.backend.click(*x, *y, click_count(command.opcode));
                Ok(())
            }
            (
                Opcode::Click | Opcode::DoubleClick | Opcode::Pclick,
                Operand::Image { path, timeout_secs },
            ) => {
                let (x, y) = self.locate(command.opcode, path, *timeout_secs)?;
                self.backend.click(x, y, click_count(command.opcode));
                Ok(())
            }
            (Opcode::Find | Opcode::Pfind, Operand::Image { path, timeout_secs }) => {
                self.locate(command.opcode, path, *timeout_secs)?;
                Ok(())
            }
            _ => Err(RuntimeError::MalformedInstruction(command.opcode)),
        }
    }

    fn locate(
        &mut self,
        opcode: Opcode,
        path: &str,
        timeout_secs: u64,
    ) -> Result<(i32, i32), RuntimeError> {
        let spec = if opcode.is_precise() {
            MatchSpec::PRECISE
        } else {
            MatchSpec {
                grayscale: self.options.grayscale,
                step: self.options.match_step,
            }
        };

        self.notifier.status(format!("Looking for image {path}"));
        let resolved = resolve_image(&self.options.base_dir, path);
        match self.backend.locate_center(&resolved, timeout_secs, spec) {
            Some(center) => {
                self.notifier.status("Image found");
                Ok(center)
            }
            None => {
                self.notifier.status("Image not found within the time limit");
                Err(RuntimeError::ImageNotFound {
                    path: path.to_string(),
                    timeout_secs,
                })
            }
        }
    }

    /// Sleeps in one-second slices so a cancel lands promptly.
    fn wait(&mut self, seconds: u64) -> Step {
        for _ in 0..seconds {
            if self.control.is_cancelled() {
                return Step::Cancelled;
            }
            self.backend.sleep(1);
        }
        Step::Continue
    }

    fn label(&self, name: &str) -> Result<usize, RuntimeError> {
        self.program
            .entry(name)
            .ok_or_else(|| RuntimeError::UndefinedLabel(name.to_string()))
    }
}

fn name_operand(command: &Command) -> Result<&str, RuntimeError> {
    match &command.operand {
        Operand::Name(name) => Ok(name),
        _ => Err(RuntimeError::MalformedInstruction(command.opcode)),
    }
}

fn click_count(opcode: Opcode) -> u8 {
    if opcode == Opcode::DoubleClick { 2 } else { 1 }
}
