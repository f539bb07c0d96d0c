use crate::{
    context::ContextKind,
    foundation::error::{RasterFxError, RasterFxResult},
};

/// Default width and height of the backing surface and readback buffer.
pub const DEFAULT_TILE_SIZE: u32 = 2048;

/// Construction-time backend configuration.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendOptions {
    /// Side length of the backing surface. Filter destinations must not exceed it.
    pub tile_size: u32,
    pub context: ContextKind,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            context: ContextKind::default(),
        }
    }
}

impl BackendOptions {
    pub fn from_json_str(s: &str) -> RasterFxResult<Self> {
        let options: Self = serde_json::from_str(s)
            .map_err(|e| RasterFxError::config(format!("parse backend options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> RasterFxResult<()> {
        if self.tile_size == 0 {
            return Err(RasterFxError::config("tile_size must be > 0"));
        }
        Ok(())
    }
}
