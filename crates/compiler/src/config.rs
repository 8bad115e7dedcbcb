//! The configuration of the lowering pipeline.
//!
//! Configuration is passed by value into the construction of the passes that
//! need it, and is never consulted globally.

/// The capabilities of the hardware that the pipeline targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Target {
    /// Whether the target can convert to and from `bf16` natively.
    pub native_bf16_conversions: bool,
}

impl Target {
    /// Creates a target description with the default capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self {
            native_bf16_conversions: true,
        }
    }

    /// Specifies whether the target converts to and from `bf16` natively.
    ///
    /// # API Style
    ///
    /// Please note that the API for the target consumes `self` and is hence
    /// designed to have calls chained in the "fluent" API style.
    #[must_use]
    pub fn with_native_bf16_conversions(mut self, native: bool) -> Self {
        self.native_bf16_conversions = native;
        self
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration for a run of the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PipelineConfig {
    /// Whether `bf16` conversions may be left for the target to perform
    /// natively.
    pub enable_bf16: bool,

    /// Whether the module is verified after every pass.
    pub verify: bool,

    /// The hardware being targeted.
    pub target: Target,
}

impl PipelineConfig {
    /// Creates the default configuration, which expands `bf16` conversions and
    /// verifies after every pass.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enable_bf16: false,
            verify: true,
            target: Target::new(),
        }
    }

    /// Specifies whether native `bf16` conversions are enabled.
    ///
    /// # API Style
    ///
    /// Please note that the API for the configuration consumes `self` and is
    /// hence designed to have calls chained in the "fluent" API style.
    #[must_use]
    pub fn with_bf16(mut self, enable: bool) -> Self {
        self.enable_bf16 = enable;
        self
    }

    /// Specifies whether to verify the module after every pass.
    ///
    /// # API Style
    ///
    /// Please note that the API for the configuration consumes `self` and is
    /// hence designed to have calls chained in the "fluent" API style.
    #[must_use]
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Specifies the target hardware.
    ///
    /// # API Style
    ///
    /// Please note that the API for the configuration consumes `self` and is
    /// hence designed to have calls chained in the "fluent" API style.
    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Returns `true` if conversions involving `bf16` should be left for the
    /// target to perform.
    #[must_use]
    pub fn keeps_bf16_conversions(&self) -> bool {
        self.enable_bf16 && self.target.native_bf16_conversions
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use crate::config::{PipelineConfig, Target};

    #[test]
    fn bf16_conversions_need_both_flag_and_target() {
        let config = PipelineConfig::new();
        assert!(!config.keeps_bf16_conversions());
        assert!(config.with_bf16(true).keeps_bf16_conversions());

        let target = Target::new().with_native_bf16_conversions(false);
        assert!(!config.with_bf16(true).with_target(target).keeps_bf16_conversions());
    }
}
