//! Shared type aliases for stored callbacks and erased values.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, pinned, `Send` future. All stored kernel callbacks return this.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A type-erased, shareable value. Definition bodies exchange inputs,
/// outputs, configs, and journal entries through this shape; typed handles
/// downcast at the edges.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Box a future into a [`BoxFuture`].
pub(crate) fn boxed<F>(fut: F) -> BoxFuture<F::Output>
where
    F: Future + Send + 'static,
{
    Box::pin(fut)
}

/// Erase a value into an [`AnyValue`].
pub(crate) fn erase<T: Send + Sync + 'static>(value: T) -> AnyValue {
    Arc::new(value)
}

/// A `TypeId` paired with its human-readable name, recorded on definitions
/// for contract checking and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeTag {
    pub id: std::any::TypeId,
    pub name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: std::any::TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The unit type stands for "no contract declared".
    pub fn is_unit(&self) -> bool {
        self.id == std::any::TypeId::of::<()>()
    }
}
