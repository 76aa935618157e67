use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use comms::CommErr;
use ndarray::ShapeError;

/// The result type used in the entire optimizer crate.
pub type Result<T> = std::result::Result<T, LambErr>;

/// The optimizer's error type.
#[derive(Debug)]
pub enum LambErr {
    Config(String),
    SparseGradient {
        group: usize,
        param: usize,
    },
    GroupOutOfRange {
        group: usize,
        groups: usize,
    },
    GradientCount {
        group: Option<usize>,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        what: &'static str,
        group: usize,
        param: usize,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    Transport(CommErr),
    MissingCompressionState {
        step: u64,
        freeze_step: u64,
    },
    CheckpointLayout {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Layout(ShapeError),
    Serde(serde_json::Error),
    Io(io::Error),
}

impl Display for LambErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LambErr::Config(detail) => write!(f, "invalid configuration: {detail}"),
            LambErr::SparseGradient { group, param } => write!(
                f,
                "sparse gradients are not supported, got one for param {param} of group {group}"
            ),
            LambErr::GroupOutOfRange { group, groups } => {
                write!(f, "group {group} is out of range, the optimizer has {groups} groups")
            }
            LambErr::GradientCount {
                group: Some(group),
                got,
                expected,
            } => write!(
                f,
                "group {group} got {got} gradient overrides, expected {expected}"
            ),
            LambErr::GradientCount {
                group: None,
                got,
                expected,
            } => write!(f, "got gradient overrides for {got} groups, expected {expected}"),
            LambErr::ShapeMismatch {
                what,
                group,
                param,
                got,
                expected,
            } => write!(
                f,
                "{what} of param {param} in group {group} has shape {got:?}, expected {expected:?}"
            ),
            LambErr::Transport(e) => write!(f, "compressed allreduce failed: {e}"),
            LambErr::MissingCompressionState { step, freeze_step } => write!(
                f,
                "checkpoint at step {step} (freeze step {freeze_step}) lacks the compression state"
            ),
            LambErr::CheckpointLayout {
                what,
                got,
                expected,
            } => write!(f, "checkpoint {what} has length {got}, expected {expected}"),
            LambErr::Layout(e) => write!(f, "momentum layout error: {e}"),
            LambErr::Serde(e) => write!(f, "checkpoint encoding error: {e}"),
            LambErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for LambErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LambErr::Transport(e) => Some(e),
            LambErr::Layout(e) => Some(e),
            LambErr::Serde(e) => Some(e),
            LambErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommErr> for LambErr {
    fn from(value: CommErr) -> Self {
        Self::Transport(value)
    }
}

impl From<ShapeError> for LambErr {
    fn from(value: ShapeError) -> Self {
        Self::Layout(value)
    }
}

impl From<serde_json::Error> for LambErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

impl From<io::Error> for LambErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
