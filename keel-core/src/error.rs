use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Which validation boundary rejected a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaBoundary {
    Input,
    Result,
    Config,
    Payload,
    MiddlewareConfig,
}

impl fmt::Display for SchemaBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaBoundary::Input => "input",
            SchemaBoundary::Result => "result",
            SchemaBoundary::Config => "config",
            SchemaBoundary::Payload => "payload",
            SchemaBoundary::MiddlewareConfig => "middleware config",
        };
        f.write_str(name)
    }
}

/// A schema rejected a value at one of the validation boundaries.
#[derive(Debug)]
pub struct SchemaViolation {
    pub boundary: SchemaBoundary,
    /// Id of the definition whose boundary rejected the value.
    pub owner: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Schema rejected {} for '{}': {}",
            self.boundary, self.owner, self.message
        )
    }
}

/// Errors raised while assembling the definition registry.
#[derive(Debug)]
pub enum RegistryError {
    /// Two distinct definitions share one id.
    DuplicateId { id: String },
    /// A lookup referenced an id that is not in the registry.
    UnknownId { id: String },
    /// An override targets an id that was never registered.
    OverrideTargetMissing { id: String },
    /// A mutation was attempted after the store was locked.
    Locked { operation: &'static str },
    /// A body asked for a dependency it never declared.
    NotDeclared { owner: String, id: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateId { id } => {
                write!(f, "Duplicate definition id '{id}': ids must be unique across the whole graph")
            }
            RegistryError::UnknownId { id } => {
                write!(f, "No definition registered under id '{id}'")
            }
            RegistryError::OverrideTargetMissing { id } => {
                write!(f, "Override targets '{id}', which is not registered")
            }
            RegistryError::Locked { operation } => {
                write!(f, "Store is locked: {operation} is only allowed before boot completes")
            }
            RegistryError::NotDeclared { owner, id } => {
                write!(
                    f,
                    "'{owner}' asked for '{id}' without declaring it as a dependency. \
                     Add it to the definition's dependency list"
                )
            }
        }
    }
}

/// Which side of a declared contract was violated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContractSide {
    Input,
    Output,
}

impl fmt::Display for ContractSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContractSide::Input => "input",
            ContractSide::Output => "output",
        })
    }
}

/// One finding from graph validation. Findings of the same run are batched
/// into a [`ValidationReport`].
#[derive(Debug)]
pub enum GraphIssue {
    MissingDependency {
        owner: String,
        dependency: String,
    },
    ResourceCycle {
        /// The cycle, in edge order; the first id is repeated at the end.
        path: Vec<String>,
    },
    UnregisteredTag {
        owner: String,
        tag: String,
    },
    UnregisteredMiddleware {
        owner: String,
        middleware: String,
    },
    TagContract {
        owner: String,
        tag: String,
        side: ContractSide,
        expected: &'static str,
        found: &'static str,
    },
    MiddlewareContract {
        owner: String,
        middleware: String,
        side: ContractSide,
        expected: &'static str,
        found: &'static str,
    },
    TunnelOwnershipConflict {
        task: String,
        tunnels: Vec<String>,
    },
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphIssue::MissingDependency { owner, dependency } => {
                write!(
                    f,
                    "Missing dependency for '{owner}': '{dependency}' is not registered"
                )
            }
            GraphIssue::ResourceCycle { path } => {
                write!(f, "Circular resource dependency: {}", path.join(" -> "))
            }
            GraphIssue::UnregisteredTag { owner, tag } => {
                write!(f, "'{owner}' uses tag '{tag}', which is not registered")
            }
            GraphIssue::UnregisteredMiddleware { owner, middleware } => {
                write!(
                    f,
                    "'{owner}' uses middleware '{middleware}', which is not registered"
                )
            }
            GraphIssue::TagContract {
                owner,
                tag,
                side,
                expected,
                found,
            } => {
                write!(
                    f,
                    "Tag '{tag}' requires {side} type '{expected}' but '{owner}' declares '{found}'"
                )
            }
            GraphIssue::MiddlewareContract {
                owner,
                middleware,
                side,
                expected,
                found,
            } => {
                write!(
                    f,
                    "Middleware '{middleware}' requires {side} type '{expected}' but '{owner}' declares '{found}'"
                )
            }
            GraphIssue::TunnelOwnershipConflict { task, tunnels } => {
                write!(
                    f,
                    "Task '{task}' is claimed by more than one tunnel: {}",
                    tunnels.join(", ")
                )
            }
        }
    }
}

/// The batched outcome of graph validation.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub issues: Vec<GraphIssue>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph validation failed with {} issue(s):", self.issues.len())?;
        for issue in &self.issues {
            writeln!(f, "  - {issue}")?;
        }
        Ok(())
    }
}

/// A runtime contract check failed while materializing a chain.
#[derive(Debug)]
pub struct ContractViolation {
    pub owner: String,
    pub layer: String,
    pub side: ContractSide,
    pub expected: &'static str,
    pub found: &'static str,
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Contract violation on '{}': layer '{}' expects {} '{}', got '{}'",
            self.owner, self.layer, self.side, self.expected, self.found
        )
    }
}

/// Journal misuse.
#[derive(Debug)]
pub enum JournalError {
    /// A key was written twice without the override flag.
    KeyInUse { key: &'static str },
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalError::KeyInUse { key } => {
                write!(
                    f,
                    "Journal key '{key}' is already set. Pass override to replace it"
                )
            }
        }
    }
}

/// Emission-time failures from the event manager.
#[derive(Debug)]
pub enum EventError {
    /// A returned-payload emission was requested on a parallel event.
    PayloadFoldOnParallel { event: String },
    /// A hook re-emitted an event already being emitted on this call chain.
    Cycle { chain: Vec<String> },
    /// One or more hooks failed and the emission was configured to raise.
    HookFailures { event: String, errors: Vec<Error> },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::PayloadFoldOnParallel { event } => {
                write!(
                    f,
                    "Event '{event}' is parallel; a returned-payload emission needs ordered delivery"
                )
            }
            EventError::Cycle { chain } => {
                write!(f, "Event emission cycle: {}", chain.join(" -> "))
            }
            EventError::HookFailures { event, errors } => {
                write!(f, "{} hook(s) failed while emitting '{event}'", errors.len())?;
                for err in errors {
                    write!(f, "; {err}")?;
                }
                Ok(())
            }
        }
    }
}

/// Lifecycle misuse or failure.
#[derive(Debug)]
pub enum LifecycleError {
    /// A resource value was read before its init resolved (or under dry run).
    NotInitialized { id: String },
    /// The runtime was already disposed.
    Disposed,
    /// A resource init failed; boot was unwound.
    InitFailed { id: String, source: Box<Error> },
    /// An ambient context was read outside any `provide` scope.
    ContextMissing { id: String },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::NotInitialized { id } => {
                write!(f, "Resource '{id}' is not initialized")
            }
            LifecycleError::Disposed => write!(f, "Runtime is disposed"),
            LifecycleError::InitFailed { id, source } => {
                write!(f, "Resource '{id}' failed to initialize: {source}")
            }
            LifecycleError::ContextMissing { id } => {
                write!(
                    f,
                    "Async context '{id}' was read outside a provide() scope"
                )
            }
        }
    }
}

/// At least one dispose function failed. Disposal always runs to completion;
/// the failures are collected here.
#[derive(Debug, Default)]
pub struct DisposalError {
    /// `(resource id, error)` pairs in dispose order.
    pub failures: Vec<(String, Error)>,
}

impl fmt::Display for DisposalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s) failed to dispose:", self.failures.len())?;
        for (id, err) in &self.failures {
            write!(f, " '{id}': {err};")?;
        }
        Ok(())
    }
}

/// A typed application error raised through an
/// [`ErrorKind`](crate::defs::ErrorKind).
pub struct Raised {
    pub id: String,
    pub message: String,
    pub code: Option<u16>,
    pub remediation: Option<String>,
    pub data: Arc<dyn Any + Send + Sync>,
}

impl fmt::Display for Raised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.message)?;
        if let Some(remediation) = &self.remediation {
            write!(f, " ({remediation})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Raised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raised")
            .field("id", &self.id)
            .field("message", &self.message)
            .field("code", &self.code)
            .finish()
    }
}

/// The kernel error type. Every failure that crosses a task, hook,
/// middleware, resource, or façade boundary is one of these.
#[derive(Debug)]
pub enum Error {
    Registry(RegistryError),
    Validation(ValidationReport),
    Schema(SchemaViolation),
    Contract(ContractViolation),
    Journal(JournalError),
    Event(EventError),
    Lifecycle(LifecycleError),
    Disposal(DisposalError),
    /// A typed application error declared through the error-kind builder.
    App(Raised),
    /// Any other error escaping a user body.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary error from a user body.
    pub fn other<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Error::Other(Box::new(err))
    }

    /// Build an ad-hoc error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Other(Box::new(SimpleError {
            message: message.into(),
        }))
    }

    /// Generic "is a kernel-raised application error" guard.
    pub fn is_app(&self) -> bool {
        matches!(self, Error::App(_))
    }

    /// Access the typed application payload, if this is an app error.
    pub fn as_app(&self) -> Option<&Raised> {
        match self {
            Error::App(raised) => Some(raised),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Registry(e) => e.fmt(f),
            Error::Validation(e) => e.fmt(f),
            Error::Schema(e) => e.fmt(f),
            Error::Contract(e) => e.fmt(f),
            Error::Journal(e) => e.fmt(f),
            Error::Event(e) => e.fmt(f),
            Error::Lifecycle(e) => e.fmt(f),
            Error::Disposal(e) => e.fmt(f),
            Error::App(e) => e.fmt(f),
            Error::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Other(e) => Some(e.as_ref()),
            Error::Lifecycle(LifecycleError::InitFailed { source, .. }) => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        Error::Registry(err)
    }
}

impl From<ValidationReport> for Error {
    fn from(report: ValidationReport) -> Self {
        Error::Validation(report)
    }
}

impl From<SchemaViolation> for Error {
    fn from(err: SchemaViolation) -> Self {
        Error::Schema(err)
    }
}

impl From<JournalError> for Error {
    fn from(err: JournalError) -> Self {
        Error::Journal(err)
    }
}

impl From<EventError> for Error {
    fn from(err: EventError) -> Self {
        Error::Event(err)
    }
}

impl From<LifecycleError> for Error {
    fn from(err: LifecycleError) -> Self {
        Error::Lifecycle(err)
    }
}

impl std::error::Error for RegistryError {}
impl std::error::Error for ValidationReport {}
impl std::error::Error for SchemaViolation {}
impl std::error::Error for ContractViolation {}
impl std::error::Error for JournalError {}
impl std::error::Error for EventError {}
impl std::error::Error for LifecycleError {}
impl std::error::Error for DisposalError {}

/// Minimal message-only error behind [`Error::msg`].
#[derive(Debug)]
struct SimpleError {
    message: String,
}

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SimpleError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_report_lists_every_issue() {
        let report = ValidationReport {
            issues: vec![
                GraphIssue::MissingDependency {
                    owner: "app.tasks.a".into(),
                    dependency: "app.resources.db".into(),
                },
                GraphIssue::ResourceCycle {
                    path: vec!["a".into(), "b".into(), "a".into()],
                },
            ],
        };
        let text = report.to_string();
        assert!(text.contains("2 issue(s)"));
        assert!(text.contains("app.resources.db"));
        assert!(text.contains("a -> b -> a"));
    }

    #[test]
    fn error_msg_roundtrip() {
        let err = Error::msg("boom");
        assert_eq!(err.to_string(), "boom");
        assert!(!err.is_app());
    }

    #[test]
    fn disposal_error_display() {
        let err = DisposalError {
            failures: vec![("app.resources.db".into(), Error::msg("socket gone"))],
        };
        let text = err.to_string();
        assert!(text.contains("1 resource(s)"));
        assert!(text.contains("socket gone"));
    }
}
