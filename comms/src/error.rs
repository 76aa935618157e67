use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type for every reduction backend.
pub type Result<T> = std::result::Result<T, CommErr>;

/// Failures raised by a compressed reduction backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Misaligned {
        len: usize,
        alignment: usize,
    },
    MissingContribution {
        rank: usize,
    },
}

impl Display for CommErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what} has {got} elements, expected {expected}"),
            CommErr::Misaligned { len, alignment } => write!(
                f,
                "buffer of {len} elements is not a multiple of the {alignment} element alignment"
            ),
            CommErr::MissingContribution { rank } => {
                write!(f, "rank {rank} did not contribute to the reduction round")
            }
        }
    }
}

impl Error for CommErr {}
