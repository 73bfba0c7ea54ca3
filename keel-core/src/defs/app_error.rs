//! Typed application errors.
//!
//! An [`ErrorKind`] is a declared, registrable error shape with a stable id,
//! a typed data payload, and optional http code, formatter, and remediation
//! text. Raising one produces an [`Error::App`] the caller can detect with
//! [`ErrorKind::is`].

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Raised, SchemaBoundary, SchemaViolation};
use crate::schema::{ErasedSchema, Schema};
use crate::types::TypeTag;

use super::tag::AppliedTag;
use super::{DefKind, DefNode, Definition, DepRef, Meta};

pub(crate) struct ErrorKindInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    pub(crate) data_schema: Option<ErasedSchema>,
    #[allow(dead_code)]
    pub(crate) data_type: TypeTag,
    pub(crate) http_code: Option<u16>,
    pub(crate) formatter: Option<Arc<dyn Fn(&(dyn Any + Send + Sync)) -> String + Send + Sync>>,
    pub(crate) remediation: Option<String>,
}

/// A declared error shape with data payload `D`.
///
/// ```ignore
/// let not_found = ErrorKind::<MissingUser>::builder("app.errors.user-not-found")
///     .code(404)
///     .format(|data| format!("no user '{}'", data.id))
///     .remediation("check the id and retry")
///     .build();
///
/// return Err(not_found.raise(MissingUser { id }));
/// ```
pub struct ErrorKind<D = ()> {
    pub(crate) inner: Arc<ErrorKindInner>,
    _marker: PhantomData<fn(D)>,
}

impl<D> Clone for ErrorKind<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<D> ErrorKind<D>
where
    D: Send + Sync + 'static,
{
    pub fn builder(id: impl Into<String>) -> ErrorKindBuilder<D> {
        ErrorKindBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Raise this error with a data payload.
    ///
    /// If the kind declares a data schema and the payload is rejected, the
    /// returned error is the schema violation instead.
    pub fn raise(&self, data: D) -> Error {
        if let Some(schema) = &self.inner.data_schema {
            if let Err(message) = (schema.as_ref())(&data) {
                return Error::Schema(SchemaViolation {
                    boundary: SchemaBoundary::Payload,
                    owner: self.inner.id.clone(),
                    message,
                });
            }
        }
        let message = match self.inner.formatter.as_deref() {
            Some(formatter) => formatter(&data),
            None => self.inner.id.clone(),
        };
        Error::App(Raised {
            id: self.inner.id.clone(),
            message,
            code: self.inner.http_code,
            remediation: self.inner.remediation.clone(),
            data: Arc::new(data),
        })
    }

    /// Whether `err` was raised through this kind.
    pub fn is(&self, err: &Error) -> bool {
        matches!(err, Error::App(raised) if raised.id == self.inner.id)
    }

    /// Extract the typed payload, if `err` was raised through this kind.
    pub fn data_of(&self, err: &Error) -> Option<Arc<D>> {
        match err {
            Error::App(raised) if raised.id == self.inner.id => {
                raised.data.clone().downcast::<D>().ok()
            }
            _ => None,
        }
    }
}

impl<D> From<&ErrorKind<D>> for Definition {
    fn from(kind: &ErrorKind<D>) -> Self {
        Definition {
            node: DefNode::ErrorKind(kind.inner.clone()),
        }
    }
}

impl<D> From<ErrorKind<D>> for Definition {
    fn from(kind: ErrorKind<D>) -> Self {
        Definition {
            node: DefNode::ErrorKind(kind.inner),
        }
    }
}

impl<D> From<&ErrorKind<D>> for DepRef {
    fn from(kind: &ErrorKind<D>) -> Self {
        DepRef {
            id: kind.inner.id.clone(),
            kind: DefKind::ErrorKind,
            optional: false,
        }
    }
}

/// Builder for [`ErrorKind`].
pub struct ErrorKindBuilder<D> {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    data_schema: Option<ErasedSchema>,
    http_code: Option<u16>,
    formatter: Option<Arc<dyn Fn(&(dyn Any + Send + Sync)) -> String + Send + Sync>>,
    remediation: Option<String>,
    _marker: PhantomData<fn(D)>,
}

impl<D> ErrorKindBuilder<D>
where
    D: Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            data_schema: None,
            http_code: None,
            formatter: None,
            remediation: None,
            _marker: PhantomData,
        }
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = AppliedTag>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn data_schema(mut self, schema: Schema<D>) -> Self {
        self.data_schema = Some(schema.erase());
        self
    }

    /// Suggested http status for transports that surface this error.
    pub fn code(mut self, code: u16) -> Self {
        self.http_code = Some(code);
        self
    }

    /// Message formatter over the typed payload.
    pub fn format<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&D) -> String + Send + Sync + 'static,
    {
        self.formatter = Some(Arc::new(move |data: &(dyn Any + Send + Sync)| {
            match data.downcast_ref::<D>() {
                Some(data) => formatter(data),
                None => "malformed error payload".to_string(),
            }
        }));
        self
    }

    /// Remediation hint shown alongside the message.
    pub fn remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn build(self) -> ErrorKind<D> {
        ErrorKind {
            inner: Arc::new(ErrorKindInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                data_schema: self.data_schema,
                data_type: TypeTag::of::<D>(),
                http_code: self.http_code,
                formatter: self.formatter,
                remediation: self.remediation,
            }),
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct MissingUser {
        id: u64,
    }

    fn kind() -> ErrorKind<MissingUser> {
        ErrorKind::<MissingUser>::builder("app.errors.user-not-found")
            .code(404)
            .format(|data| format!("no user '{}'", data.id))
            .remediation("check the id and retry")
            .build()
    }

    #[test]
    fn raise_formats_and_tags() {
        let kind = kind();
        let err = kind.raise(MissingUser { id: 7 });
        assert!(kind.is(&err));
        assert!(err.is_app());
        let raised = err.as_app().unwrap();
        assert_eq!(raised.message, "no user '7'");
        assert_eq!(raised.code, Some(404));
        assert_eq!(kind.data_of(&err).unwrap().id, 7);
    }

    #[test]
    fn is_rejects_other_kinds() {
        let kind = kind();
        let other = ErrorKind::<()>::builder("app.errors.other").build();
        let err = other.raise(());
        assert!(!kind.is(&err));
        assert!(kind.data_of(&err).is_none());
    }

    #[test]
    fn data_schema_rejection_wins() {
        let kind = ErrorKind::<MissingUser>::builder("app.errors.user-not-found")
            .data_schema(Schema::from_fn(|data: &MissingUser| {
                if data.id > 0 {
                    Ok(())
                } else {
                    Err("id must be positive".into())
                }
            }))
            .build();
        let err = kind.raise(MissingUser { id: 0 });
        assert!(!kind.is(&err));
        assert!(matches!(err, Error::Schema(_)));
    }
}
