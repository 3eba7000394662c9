//! Collection error taxonomy and per-pid aggregation

use std::io;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The scan (or the pid) produced nothing usable.
    Fatal,
    /// One field is missing; the rest of the record stands.
    NonFatal,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("error enumerating processes: {0}")]
    Enumeration(#[source] io::Error),

    #[error("error opening pid {pid}: {source}")]
    HandleOpen {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("error parsing {record}: {reason}")]
    Parse { record: &'static str, reason: String },

    #[error("error fetching {field}: {source}")]
    FieldCollection {
        field: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("error reading cgroups: {0}")]
    CgroupRead(#[source] BoxError),
}

impl CollectError {
    pub fn parse(record: &'static str, reason: impl Into<String>) -> Self {
        CollectError::Parse {
            record,
            reason: reason.into(),
        }
    }

    pub fn field(field: &'static str, source: impl Into<BoxError>) -> Self {
        CollectError::FieldCollection {
            field,
            source: source.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CollectError::Enumeration(_)
            | CollectError::HandleOpen { .. }
            | CollectError::Parse { .. } => Severity::Fatal,
            CollectError::FieldCollection { .. } | CollectError::CgroupRead(_) => {
                Severity::NonFatal
            }
        }
    }

    /// Whether the process had already gone away.
    pub fn is_not_found(&self) -> bool {
        match self {
            CollectError::HandleOpen { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// A non-fatal failure tied to the field it left unset.
#[derive(Debug)]
pub struct FieldError {
    pub field: &'static str,
    pub error: CollectError,
}

impl FieldError {
    pub fn severity(&self) -> Severity {
        self.error.severity()
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.error)
    }
}

/// Every non-fatal error collected for one pid.
#[derive(Debug, Default)]
pub struct PidErrors {
    pub pid: u32,
    pub errors: Vec<FieldError>,
}

impl PidErrors {
    pub fn new(pid: u32) -> Self {
        PidErrors {
            pid,
            errors: Vec::new(),
        }
    }

    pub fn push(&mut self, field: &'static str, error: CollectError) {
        self.errors.push(FieldError { field, error });
    }

    /// Record the error from `result` if there is one and hand back the value.
    pub fn record<T>(&mut self, field: &'static str, result: Result<T, CollectError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(field, e);
                None
            }
        }
    }

    pub fn extend(&mut self, other: PidErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.errors.iter().map(|e| e.field)
    }
}

impl std::fmt::Display for PidErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "could not get all information for PID {}: ", self.pid)?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for PidErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_taxonomy() {
        let open = CollectError::HandleOpen {
            pid: 1,
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(open.severity(), Severity::Fatal);
        assert!(open.is_not_found());
        assert_eq!(CollectError::parse("stat", "short").severity(), Severity::Fatal);
        let denied = CollectError::field("username", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.severity(), Severity::NonFatal);
    }

    #[test]
    fn joined_message_names_every_field() {
        let mut errs = PidErrors::new(42);
        errs.push("username", CollectError::field("username", "uid 1000 not found"));
        errs.push("memory", CollectError::field("memory", "permission denied"));
        let msg = errs.to_string();
        assert!(msg.starts_with("could not get all information for PID 42: "));
        assert!(msg.contains("username: error fetching username: uid 1000 not found"));
        assert!(msg.contains("; memory: "));
        assert_eq!(errs.fields().collect::<Vec<_>>(), vec!["username", "memory"]);
    }
}
