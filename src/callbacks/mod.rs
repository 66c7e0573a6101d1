//! Per-iteration callbacks.
//!
//! Minimizers report every iteration to a [`CallbackPipeline`], which runs its stages in a
//! fixed order:
//!
//! ```text
//! state updating → progress logging → file logging → user callbacks
//! ```
//!
//! The first stage that returns anything other than [`CallbackReturnType::Continue`]
//! stops the pipeline and the minimizer.
//!
//! # Custom callback
//!
//! ```
//! use lsq_solver::callbacks::{CallbackReturnType, IterationCallback};
//! use lsq_solver::optimizer::IterationSummary;
//! use nalgebra::DVector;
//!
//! struct StopBelow(f64);
//!
//! impl IterationCallback for StopBelow {
//!     fn on_iteration(&mut self, summary: &IterationSummary, _x: &DVector<f64>) -> CallbackReturnType {
//!         if summary.cost < self.0 {
//!             CallbackReturnType::TerminateSuccessfully
//!         } else {
//!             CallbackReturnType::Continue
//!         }
//!     }
//! }
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::DVector;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::{problem::Problem, program::Program};
use crate::optimizer::{IterationSummary, MinimizerType};

/// Callback-specific error types
#[derive(Debug, Clone, Error)]
pub enum CallbackError {
    /// The solver log could not be created
    #[error("Failed to open solver log '{path}': {reason}")]
    LogFileOpen { path: String, reason: String },
}

impl CallbackError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for callback operations
pub type CallbackResult<T> = Result<T, CallbackError>;

/// What the minimizer should do after a callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReturnType {
    Continue,
    /// Stop with `USER_ABORT`; nothing is written back.
    Abort,
    /// Stop with `USER_SUCCESS`; the result is written back.
    TerminateSuccessfully,
}

/// Callback invoked once per minimizer iteration, including iteration 0.
///
/// `x` is the minimizer's current state in reduced-program layout.
pub trait IterationCallback: Send {
    fn on_iteration(&mut self, summary: &IterationSummary, x: &DVector<f64>) -> CallbackReturnType;
}

/// Copies the minimizer state into user memory after every accepted step.
pub struct StateUpdatingCallback<'a> {
    problem: &'a mut Problem,
    program: &'a Program,
}

impl<'a> StateUpdatingCallback<'a> {
    pub fn new(problem: &'a mut Problem, program: &'a Program) -> Self {
        Self { problem, program }
    }

    fn on_iteration(&mut self, summary: &IterationSummary, x: &DVector<f64>) -> CallbackReturnType {
        if !summary.step_is_successful {
            return CallbackReturnType::Continue;
        }
        match self.program.state_vector_to_parameter_blocks(x, self.problem) {
            Ok(()) => CallbackReturnType::Continue,
            Err(e) => {
                error!("Writing iteration {} back failed: {}", summary.iteration, e);
                CallbackReturnType::Abort
            }
        }
    }
}

/// One table row per iteration through `tracing`.
pub struct ProgressLoggingCallback {
    minimizer_type: MinimizerType,
    to_stdout: bool,
}

impl ProgressLoggingCallback {
    /// Rows go to `info` when `to_stdout`, otherwise to `debug`.
    pub fn new(minimizer_type: MinimizerType, to_stdout: bool) -> Self {
        Self {
            minimizer_type,
            to_stdout,
        }
    }

    fn emit(&self, line: &str) {
        if self.to_stdout {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
    }
}

impl IterationCallback for ProgressLoggingCallback {
    fn on_iteration(&mut self, summary: &IterationSummary, _x: &DVector<f64>) -> CallbackReturnType {
        let (header, row) = match self.minimizer_type {
            MinimizerType::TrustRegion => {
                (IterationSummary::table_header(), summary.table_row())
            }
            MinimizerType::LineSearch => (
                IterationSummary::line_search_table_header(),
                summary.line_search_table_row(),
            ),
        };
        if summary.iteration == 0 {
            self.emit(&header);
        }
        self.emit(&row);
        CallbackReturnType::Continue
    }
}

/// Plain-text per-iteration dump into the solver log file.
pub struct FileLoggingCallback {
    path: PathBuf,
    minimizer_type: MinimizerType,
    writer: BufWriter<File>,
    failed: bool,
}

impl FileLoggingCallback {
    /// Create (or truncate) the log file at `path`.
    ///
    /// # Errors
    /// Returns `CallbackError::LogFileOpen` when the file cannot be created.
    pub fn create(path: &Path, minimizer_type: MinimizerType) -> CallbackResult<Self> {
        let file = File::create(path).map_err(|e| {
            CallbackError::LogFileOpen {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .log_with_source(e)
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            minimizer_type,
            writer: BufWriter::new(file),
            failed: false,
        })
    }

    fn write_iteration(&mut self, summary: &IterationSummary) -> std::io::Result<()> {
        let (header, row) = match self.minimizer_type {
            MinimizerType::TrustRegion => {
                (IterationSummary::table_header(), summary.table_row())
            }
            MinimizerType::LineSearch => (
                IterationSummary::line_search_table_header(),
                summary.line_search_table_row(),
            ),
        };
        if summary.iteration == 0 {
            writeln!(self.writer, "{header}")?;
        }
        writeln!(self.writer, "{row}")?;
        self.writer.flush()
    }
}

impl IterationCallback for FileLoggingCallback {
    fn on_iteration(&mut self, summary: &IterationSummary, _x: &DVector<f64>) -> CallbackReturnType {
        if self.failed {
            return CallbackReturnType::Continue;
        }
        if let Err(e) = self.write_iteration(summary) {
            // Logging problems never stop the solve.
            warn!("Writing solver log {} failed, disabling it: {}", self.path.display(), e);
            self.failed = true;
        }
        CallbackReturnType::Continue
    }
}

/// Ordered list of iteration callbacks.
pub struct CallbackPipeline<'a> {
    state_updater: Option<StateUpdatingCallback<'a>>,
    progress_logger: Option<ProgressLoggingCallback>,
    file_logger: Option<FileLoggingCallback>,
    user: &'a mut [Box<dyn IterationCallback>],
}

impl Default for CallbackPipeline<'_> {
    fn default() -> Self {
        Self {
            state_updater: None,
            progress_logger: None,
            file_logger: None,
            user: Default::default(),
        }
    }
}

impl<'a> CallbackPipeline<'a> {
    /// Pipeline running only `user` callbacks, in order.
    pub fn new(user: &'a mut [Box<dyn IterationCallback>]) -> Self {
        Self {
            user,
            ..Default::default()
        }
    }

    pub fn with_state_updater(mut self, callback: StateUpdatingCallback<'a>) -> Self {
        self.state_updater = Some(callback);
        self
    }

    pub fn with_progress_logger(mut self, callback: ProgressLoggingCallback) -> Self {
        self.progress_logger = Some(callback);
        self
    }

    pub fn with_file_logger(mut self, callback: FileLoggingCallback) -> Self {
        self.file_logger = Some(callback);
        self
    }

    /// Number of stages that will run each iteration.
    pub fn len(&self) -> usize {
        usize::from(self.state_updater.is_some())
            + usize::from(self.progress_logger.is_some())
            + usize::from(self.file_logger.is_some())
            + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every stage in order, stopping at the first one that does not continue.
    pub fn run(&mut self, summary: &IterationSummary, x: &DVector<f64>) -> CallbackReturnType {
        if let Some(updater) = self.state_updater.as_mut() {
            let decision = updater.on_iteration(summary, x);
            if decision != CallbackReturnType::Continue {
                return decision;
            }
        }
        if let Some(logger) = self.progress_logger.as_mut() {
            logger.on_iteration(summary, x);
        }
        if let Some(logger) = self.file_logger.as_mut() {
            logger.on_iteration(summary, x);
        }
        for callback in self.user.iter_mut() {
            let decision = callback.on_iteration(summary, x);
            if decision != CallbackReturnType::Continue {
                return decision;
            }
        }
        CallbackReturnType::Continue
    }
}
