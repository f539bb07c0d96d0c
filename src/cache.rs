//! Context-bound resource caches.
//!
//! Everything here holds handles into one graphics context and must be
//! cleared whenever that context goes away.

use std::{borrow::Cow, collections::HashMap, fmt};

use crate::{
    context::{GraphicsContext, ProgramDesc, ProgramHandle, TextureHandle},
    foundation::{
        core::{CacheKey, Extent},
        error::RasterFxResult,
    },
    surface::{ImageSource, source_extent},
    texture::{ConversionSurface, create_texture},
};

/// Counters since the cache was created. Survive [`ResourceCache::clear`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub texture_uploads: u64,
    pub texture_hits: u64,
    pub evictions: u64,
    pub program_compiles: u64,
    pub program_hits: u64,
}

/// Identity of a filter's shader program, usually the filter type name plus
/// any variant that changes the shader source.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProgramKey(Cow<'static, str>);

impl ProgramKey {
    pub fn new(key: impl Into<Cow<'static, str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for ProgramKey {
    fn from(value: &'static str) -> Self {
        Self(Cow::Borrowed(value))
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compiled programs keyed by [`ProgramKey`], kept across filter runs.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: HashMap<ProgramKey, ProgramHandle>,
    compiles: u64,
    hits: u64,
}

impl ProgramCache {
    pub fn get(&self, key: &ProgramKey) -> Option<ProgramHandle> {
        self.programs.get(key).copied()
    }

    /// Return the cached program for `key`, compiling `desc()` on a miss.
    pub fn get_or_compile(
        &mut self,
        ctx: &mut dyn GraphicsContext,
        key: &ProgramKey,
        desc: impl FnOnce() -> ProgramDesc,
    ) -> RasterFxResult<ProgramHandle> {
        if let Some(program) = self.programs.get(key) {
            self.hits += 1;
            return Ok(*program);
        }
        let program = ctx.create_program(&desc())?;
        tracing::debug!(program = %key, "compiled filter program");
        self.programs.insert(key.clone(), program);
        self.compiles += 1;
        Ok(program)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    fn clear(&mut self, ctx: &mut dyn GraphicsContext) {
        for (_, program) in self.programs.drain() {
            ctx.delete_program(program);
        }
    }
}

/// Named helper textures filters keep between runs: created once, resized
/// when a different size is requested, released only with the context.
#[derive(Debug, Default)]
pub struct HelperLayers {
    layers: HashMap<String, (TextureHandle, Extent)>,
}

impl HelperLayers {
    pub fn get(&self, name: &str) -> Option<TextureHandle> {
        self.layers.get(name).map(|(t, _)| *t)
    }

    /// Return the `name` layer at exactly `width` x `height`, reallocating on size change.
    ///
    /// Reallocated layers start uninitialized.
    pub fn ensure(
        &mut self,
        ctx: &mut dyn GraphicsContext,
        name: &str,
        width: u32,
        height: u32,
    ) -> RasterFxResult<TextureHandle> {
        let extent = Extent::new(width, height);
        if let Some((texture, current)) = self.layers.get(name)
            && *current == extent
        {
            return Ok(*texture);
        }
        let texture = ctx.create_texture(width, height)?;
        if let Some((old, _)) = self.layers.insert(name.to_string(), (texture, extent)) {
            ctx.delete_texture(old);
        }
        Ok(texture)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn clear(&mut self, ctx: &mut dyn GraphicsContext) {
        for (_, (texture, _)) in self.layers.drain() {
            ctx.delete_texture(texture);
        }
    }
}

/// Source textures keyed by [`CacheKey`] plus the program and helper caches.
#[derive(Debug, Default)]
pub struct ResourceCache {
    textures: HashMap<CacheKey, TextureHandle>,
    pub(crate) programs: ProgramCache,
    pub(crate) helpers: HelperLayers,
    texture_uploads: u64,
    texture_hits: u64,
    evictions: u64,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the texture cached under `key`, uploading `source` on a miss.
    ///
    /// A hit never looks at `source`: callers must evict a key whose content changed.
    pub fn get_or_create_texture(
        &mut self,
        ctx: &mut dyn GraphicsContext,
        conversion: &mut ConversionSurface,
        key: &CacheKey,
        source: &dyn ImageSource,
    ) -> RasterFxResult<TextureHandle> {
        if let Some(texture) = self.textures.get(key) {
            self.texture_hits += 1;
            tracing::trace!(%key, "texture cache hit");
            return Ok(*texture);
        }
        let extent = source_extent(source);
        let texture = create_texture(ctx, conversion, extent.width, extent.height, Some(source))?;
        self.textures.insert(key.clone(), texture);
        self.texture_uploads += 1;
        Ok(texture)
    }

    pub fn texture(&self, key: &CacheKey) -> Option<TextureHandle> {
        self.textures.get(key).copied()
    }

    /// Destroy and forget the texture under `key`. Returns whether one existed.
    pub fn evict(&mut self, ctx: &mut dyn GraphicsContext, key: &CacheKey) -> bool {
        let Some(texture) = self.textures.remove(key) else {
            return false;
        };
        ctx.delete_texture(texture);
        self.evictions += 1;
        tracing::debug!(%key, "evicted cached texture");
        true
    }

    /// Destroy every cached texture, program and helper layer.
    pub fn clear(&mut self, ctx: &mut dyn GraphicsContext) {
        for (_, texture) in self.textures.drain() {
            ctx.delete_texture(texture);
        }
        self.programs.clear(ctx);
        self.helpers.clear(ctx);
    }

    /// Forget every entry without touching a context, for when it is already gone.
    pub(crate) fn forget(&mut self) {
        self.textures.clear();
        self.programs.programs.clear();
        self.helpers.layers.clear();
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    pub fn helpers(&self) -> &HelperLayers {
        &self.helpers
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty() && self.programs.is_empty() && self.helpers.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            texture_uploads: self.texture_uploads,
            texture_hits: self.texture_hits,
            evictions: self.evictions,
            program_compiles: self.programs.compiles,
            program_hits: self.programs.hits,
        }
    }
}
