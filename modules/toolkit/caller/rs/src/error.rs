use eyre::Result;
use thiserror::Error;

/// Failures that abort the processing of a single chromosome.
/// Degraded stages (skipped GC correction, failed fits, boundary adjustment without an improving
/// step) are not errors and are reported through return values instead.
#[derive(Error, Clone, PartialEq, Debug)]
pub enum CallError {
    #[error("{what} has {got} bins, expected {expected}")]
    InputShape {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{what} holds an invalid value at bin {index}")]
    InvalidValue { what: &'static str, index: usize },
    #[error("Region [{start}, {end}] has no usable bins")]
    EmptyPartition { start: usize, end: usize },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub(crate) fn ensure_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(CallError::InputShape {
            what,
            expected,
            got,
        }
        .into());
    }
    Ok(())
}
