//! Value schemas.
//!
//! A [`Schema`] is a first-class check attached to a definition boundary:
//! task input/result, resource config/value, event payload, or middleware
//! config. The kernel runs the check at the boundary and maps a rejection to
//! [`SchemaViolation`](crate::error::SchemaViolation) naming that boundary.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, SchemaBoundary, SchemaViolation};

/// A validation check over values of type `T`.
///
/// Construct one from a closure with [`Schema::from_fn`], or from a
/// `garde`-annotated type with [`Schema::derived`]:
///
/// ```ignore
/// #[derive(garde::Validate)]
/// struct CreateUser {
///     #[garde(length(min = 1))]
///     name: String,
/// }
///
/// let schema = Schema::<CreateUser>::derived();
/// ```
pub struct Schema<T> {
    check: Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>,
    _marker: PhantomData<fn(&T)>,
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            check: self.check.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Schema<T> {
    /// Build a schema from a plain check closure.
    pub fn from_fn<F>(check: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
            _marker: PhantomData,
        }
    }

    /// Build a schema backed by the type's `garde::Validate` derive.
    pub fn derived() -> Self
    where
        T: garde::Validate,
        T::Context: Default,
    {
        Self::from_fn(|value: &T| value.validate().map_err(|report| report.to_string()))
    }

    /// Run the check.
    pub fn parse(&self, value: &T) -> Result<(), String> {
        (self.check.as_ref())(value)
    }

    /// Erase the schema so it can be stored on a definition.
    pub(crate) fn erase(&self) -> ErasedSchema {
        let check = self.check.clone();
        Arc::new(move |value: &(dyn Any + Send + Sync)| match value.downcast_ref::<T>() {
            Some(typed) => (check.as_ref())(typed),
            None => Err(format!(
                "expected a value of type '{}'",
                std::any::type_name::<T>()
            )),
        })
    }
}

/// Type-erased schema stored on definitions.
pub(crate) type ErasedSchema =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<(), String> + Send + Sync>;

/// Run an optional erased schema and map a rejection to the right boundary.
pub(crate) fn check_erased(
    schema: &Option<ErasedSchema>,
    value: &(dyn Any + Send + Sync),
    boundary: SchemaBoundary,
    owner: &str,
) -> Result<(), Error> {
    if let Some(schema) = schema {
        (schema.as_ref())(value).map_err(|message| {
            Error::Schema(SchemaViolation {
                boundary,
                owner: owner.to_string(),
                message,
            })
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fn_accepts_and_rejects() {
        let schema = Schema::<u32>::from_fn(|n| {
            if *n > 0 {
                Ok(())
            } else {
                Err("must be positive".into())
            }
        });
        assert!(schema.parse(&3).is_ok());
        assert_eq!(schema.parse(&0).unwrap_err(), "must be positive");
    }

    #[test]
    fn erased_schema_rejects_wrong_type() {
        let schema = Schema::<u32>::from_fn(|_| Ok(()));
        let erased = schema.erase();
        let wrong: &(dyn Any + Send + Sync) = &"nope";
        assert!(erased(wrong).is_err());
    }

    #[test]
    fn derived_schema_uses_garde() {
        #[derive(garde::Validate)]
        struct Payload {
            #[garde(length(min = 1))]
            name: String,
        }

        let schema = Schema::<Payload>::derived();
        assert!(schema
            .parse(&Payload {
                name: "ada".into()
            })
            .is_ok());
        assert!(schema.parse(&Payload { name: String::new() }).is_err());
    }
}
