use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, ErrorKind};

/// One failed run, version or object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Human readable path such as `experiment 3 / run ab12`.
    pub object: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(object: impl Into<String>, error: &Error) -> Self {
        Failure {
            object: object.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.object, self.kind, self.message)
    }
}

/// Outcome of one top-level object of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReport {
    pub object: String,
    /// Failures of the object itself or of any run or version below it.
    pub failures: Vec<Failure>,
}

impl ObjectReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Summary of a bulk export or import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub objects: Vec<ObjectReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.objects.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.objects.len() - self.succeeded()
    }

    /// Whether anything at all failed; successes still landed either way.
    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &Failure> {
        self.objects.iter().flat_map(|o| o.failures.iter())
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} succeeded, {} failed", self.succeeded(), self.failed())?;
        for failure in self.failures() {
            writeln!(f, "  {}", failure)?;
        }
        Ok(())
    }
}
