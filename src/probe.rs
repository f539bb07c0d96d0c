//! Lazily evaluated graphics capability probe.
//!
//! The first query creates a throwaway 4x4 context, records the maximum
//! texture size and the first shader precision that compiles, then drops the
//! context. Results are memoized for the life of the probe; the process-wide
//! probe behind [`capability_probe`] is queried at most once per process.

use std::sync::OnceLock;

use crate::{
    context::{ContextAttributes, ContextFactory, Precision},
    foundation::core::Extent,
};

/// What the graphics subsystem reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub max_texture_size: u32,
    pub precision: Option<Precision>,
}

/// The one-shot query primitive behind a [`CapabilityProbe`].
pub trait CapabilityQuery: Send + Sync {
    /// `None` when no context can be produced.
    fn query(&self) -> Option<Capabilities>;
}

const PROBE_EXTENT: Extent = Extent::new(4, 4);

/// Queries a throwaway context from a [`ContextFactory`].
pub struct FactoryQuery<F> {
    factory: F,
}

impl<F> FactoryQuery<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F: ContextFactory + Send + Sync> CapabilityQuery for FactoryQuery<F> {
    fn query(&self) -> Option<Capabilities> {
        let mut ctx = self
            .factory
            .create(PROBE_EXTENT, &ContextAttributes::FILTERING)?;
        let max_texture_size = ctx.max_texture_size();
        let precision = Precision::PROBE_ORDER
            .into_iter()
            .find(|p| ctx.supports_precision(*p));
        tracing::info!(
            max_texture_size,
            factory = self.factory.name(),
            "max texture size {max_texture_size}"
        );
        Some(Capabilities {
            max_texture_size,
            precision,
        })
    }
}

/// Memoizing front of a [`CapabilityQuery`].
///
/// Absence of a context is a result, not an error: every accessor returns
/// `None` and [`CapabilityProbe::is_supported`] is `false` for all sizes.
pub struct CapabilityProbe {
    query: Box<dyn CapabilityQuery>,
    caps: OnceLock<Option<Capabilities>>,
}

impl CapabilityProbe {
    pub fn new(query: impl CapabilityQuery + 'static) -> Self {
        Self {
            query: Box::new(query),
            caps: OnceLock::new(),
        }
    }

    pub fn from_factory(factory: impl ContextFactory + Send + Sync + 'static) -> Self {
        Self::new(FactoryQuery::new(factory))
    }

    /// A probe for builds without any hardware context.
    pub fn unavailable() -> Self {
        struct Nothing;
        impl CapabilityQuery for Nothing {
            fn query(&self) -> Option<Capabilities> {
                None
            }
        }
        Self::new(Nothing)
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        *self.caps.get_or_init(|| self.query.query())
    }

    pub fn max_texture_size(&self) -> Option<u32> {
        self.capabilities().map(|c| c.max_texture_size)
    }

    pub fn precision(&self) -> Option<Precision> {
        self.capabilities().and_then(|c| c.precision)
    }

    /// Whether textures of `texture_size` pixels per side can be filtered.
    pub fn is_supported(&self, texture_size: u32) -> bool {
        self.max_texture_size()
            .is_some_and(|max| max > 0 && max >= texture_size)
    }
}

/// The process-wide probe of the hardware graphics subsystem.
///
/// Backed by a headless wgpu context when built with the `gpu` feature;
/// reports no capability otherwise.
pub fn capability_probe() -> &'static CapabilityProbe {
    static PROBE: OnceLock<CapabilityProbe> = OnceLock::new();
    PROBE.get_or_init(|| {
        #[cfg(feature = "gpu")]
        {
            CapabilityProbe::from_factory(crate::context::HeadlessContextFactory::default())
        }
        #[cfg(not(feature = "gpu"))]
        {
            CapabilityProbe::unavailable()
        }
    })
}
