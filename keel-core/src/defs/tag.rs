//! Tags: queryable markers attachable to any definition.
//!
//! A tag may carry a config payload and may declare input/output contracts
//! that constrain its users. Tags are first-class definitions and must be
//! registered like everything else.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, SchemaBoundary, SchemaViolation};
use crate::schema::{ErasedSchema, Schema};
use crate::types::{AnyValue, TypeTag};

use super::{DefNode, Definition, Meta};

pub(crate) struct TagInner {
    pub(crate) id: String,
    pub(crate) meta: Meta,
    pub(crate) tags: Vec<AppliedTag>,
    pub(crate) config_schema: Option<ErasedSchema>,
    pub(crate) input_contract: Option<TypeTag>,
    pub(crate) output_contract: Option<TypeTag>,
}

/// A tag applied to a definition, optionally bound to a config value.
#[derive(Clone)]
pub struct AppliedTag {
    pub(crate) tag_id: String,
    pub(crate) config: Option<AnyValue>,
    pub(crate) input_contract: Option<TypeTag>,
    pub(crate) output_contract: Option<TypeTag>,
}

impl AppliedTag {
    pub fn tag_id(&self) -> &str {
        &self.tag_id
    }
}

impl std::fmt::Debug for AppliedTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppliedTag")
            .field("tag_id", &self.tag_id)
            .field("has_config", &self.config.is_some())
            .finish()
    }
}

/// A tag definition.
///
/// Type parameters: `C` is the config payload attached per application,
/// `In`/`Out` are optional contracts imposed on users (`()` means none).
///
/// ```ignore
/// let cacheable = Tag::<CacheCfg>::builder("app.tags.cacheable").build();
/// let task = Task::<Query, Rows>::builder("app.tasks.search")
///     .tags([cacheable.with(CacheCfg { ttl_secs: 30 })])
///     .run(search)
///     .build();
///
/// assert_eq!(cacheable.extract(task_tags).map(|c| c.ttl_secs), Some(30));
/// ```
pub struct Tag<C = (), In = (), Out = ()> {
    pub(crate) inner: Arc<TagInner>,
    _marker: PhantomData<fn(C, In) -> Out>,
}

impl<C, In, Out> Clone for Tag<C, In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl Tag {
    /// A plain marker tag with no config and no contracts.
    pub fn new(id: impl Into<String>) -> Tag {
        TagBuilder::<(), (), ()>::new(id).build()
    }
}

impl<C, In, Out> Tag<C, In, Out>
where
    C: Clone + Send + Sync + 'static,
    In: 'static,
    Out: 'static,
{
    pub fn builder(id: impl Into<String>) -> TagBuilder<C, In, Out> {
        TagBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Apply this tag with a config payload.
    ///
    /// # Panics
    ///
    /// Panics if the tag declares a config schema and the value is rejected.
    /// Use [`try_with`](Self::try_with) for a non-panicking variant.
    pub fn with(&self, config: C) -> AppliedTag {
        self.try_with(config)
            .expect("tag config failed schema validation")
    }

    /// Apply this tag with a config payload, returning a schema error
    /// instead of panicking.
    pub fn try_with(&self, config: C) -> Result<AppliedTag, Error> {
        if let Some(schema) = &self.inner.config_schema {
            (schema.as_ref())(&config).map_err(|message| {
                Error::Schema(SchemaViolation {
                    boundary: SchemaBoundary::Config,
                    owner: self.inner.id.clone(),
                    message,
                })
            })?;
        }
        Ok(AppliedTag {
            tag_id: self.inner.id.clone(),
            config: Some(Arc::new(config)),
            input_contract: self.inner.input_contract,
            output_contract: self.inner.output_contract,
        })
    }

    /// Apply this tag without a config payload.
    pub fn applied(&self) -> AppliedTag {
        AppliedTag {
            tag_id: self.inner.id.clone(),
            config: None,
            input_contract: self.inner.input_contract,
            output_contract: self.inner.output_contract,
        }
    }

    /// Whether this tag is applied in the given tag list.
    pub fn exists(&self, tags: &[AppliedTag]) -> bool {
        tags.iter().any(|t| t.tag_id == self.inner.id)
    }

    /// Whether this tag is applied to the given definition.
    pub fn exists_on(&self, def: &Definition) -> bool {
        self.exists(def.tags())
    }

    /// Extract the config this tag was applied with, if present.
    pub fn extract(&self, tags: &[AppliedTag]) -> Option<C> {
        tags.iter()
            .find(|t| t.tag_id == self.inner.id)
            .and_then(|t| t.config.as_ref())
            .and_then(|config| config.clone().downcast::<C>().ok())
            .map(|arc| (*arc).clone())
    }

    /// Extract the config from a definition's tag list.
    pub fn extract_from(&self, def: &Definition) -> Option<C> {
        self.extract(def.tags())
    }
}

impl<C, In, Out> From<&Tag<C, In, Out>> for Definition {
    fn from(tag: &Tag<C, In, Out>) -> Self {
        Definition {
            node: DefNode::Tag(tag.inner.clone()),
        }
    }
}

impl<C, In, Out> From<Tag<C, In, Out>> for Definition {
    fn from(tag: Tag<C, In, Out>) -> Self {
        Definition {
            node: DefNode::Tag(tag.inner),
        }
    }
}

/// Marker tags convert straight into an application.
impl From<&Tag> for AppliedTag {
    fn from(tag: &Tag) -> Self {
        tag.applied()
    }
}

/// Builder for [`Tag`].
pub struct TagBuilder<C = (), In = (), Out = ()> {
    id: String,
    meta: Meta,
    tags: Vec<AppliedTag>,
    config_schema: Option<ErasedSchema>,
    _marker: PhantomData<fn(C, In) -> Out>,
}

impl<C, In, Out> TagBuilder<C, In, Out>
where
    C: Clone + Send + Sync + 'static,
    In: 'static,
    Out: 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: Meta::default(),
            tags: Vec::new(),
            config_schema: None,
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

    pub fn config_schema(mut self, schema: Schema<C>) -> Self {
        self.config_schema = Some(schema.erase());
        self
    }

    pub fn build(self) -> Tag<C, In, Out> {
        let unit = |tag: TypeTag| if tag.is_unit() { None } else { Some(tag) };
        Tag {
            inner: Arc::new(TagInner {
                id: self.id,
                meta: self.meta,
                tags: self.tags,
                config_schema: self.config_schema,
                input_contract: unit(TypeTag::of::<In>()),
                output_contract: unit(TypeTag::of::<Out>()),
            }),
            _marker: PhantomData,
        }
    }
}
