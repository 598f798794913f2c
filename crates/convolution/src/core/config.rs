//! Static configuration of a masked convolution and the geometry derived
//! from it.
//!
//! Kernels are `k × k` with `k` odd and centred on the output cell. Let
//! `half = (k - 1) / 2`. Kernel rows after the centre would look at future
//! target positions and are always masked; with `double_masked`, kernel
//! columns after the centre (future source positions) are masked as well.

use crate::core::GridError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub source_dilation: usize,
    pub target_dilation: usize,
    /// Stride along the source axis. Target stride is always 1.
    pub stride: usize,
    /// Pad so that output extents equal input extents.
    pub maintain_resolution: bool,
    /// Also mask future source positions.
    pub double_masked: bool,
    pub bias: bool,
}

impl ConvConfig {
    /// Resolution-preserving, target-causal convolution without bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            source_dilation: 1,
            target_dilation: 1,
            stride: 1,
            maintain_resolution: true,
            double_masked: false,
            bias: false,
        }
    }

    pub fn with_double_masking(mut self, double_masked: bool) -> Self {
        self.double_masked = double_masked;
        self
    }

    pub fn with_dilation(mut self, target: usize, source: usize) -> Self {
        self.target_dilation = target;
        self.source_dilation = source;
        self
    }

    pub fn validate(&self) -> Result<(), GridError> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(GridError::config("convolution channels must be non-zero"));
        }
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(GridError::config(format!(
                "kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        if self.source_dilation == 0 || self.target_dilation == 0 {
            return Err(GridError::config("dilation must be at least 1"));
        }
        if self.stride == 0 {
            return Err(GridError::config("stride must be at least 1"));
        }
        if self.maintain_resolution && self.stride != 1 {
            return Err(GridError::config(format!(
                "could not maintain the resolution with stride={}",
                self.stride
            )));
        }
        Ok(())
    }

    pub fn half(&self) -> usize {
        (self.kernel_size - 1) / 2
    }

    /// Number of past target rows a step needs besides the current one.
    pub fn history_rows(&self) -> usize {
        self.half() * self.target_dilation
    }

    /// Live kernel columns (`half + 1` when double masked, `k` otherwise).
    pub fn source_taps(&self) -> usize {
        if self.double_masked {
            self.half() + 1
        } else {
            self.kernel_size
        }
    }

    /// Zero columns added to the left and right of the source axis.
    pub fn source_padding(&self) -> (usize, usize) {
        if !self.maintain_resolution {
            return (0, 0);
        }
        let side = self.half() * self.source_dilation;
        if self.double_masked {
            (side, 0)
        } else {
            (side, side)
        }
    }

    /// Output source extent for an input of `source_len` columns.
    pub fn output_width(&self, source_len: usize) -> Result<usize, GridError> {
        let (left, right) = self.source_padding();
        let padded = source_len + left + right;
        let span = (self.source_taps() - 1) * self.source_dilation;
        if source_len == 0 || padded <= span {
            return Err(GridError::shape(format!(
                "source length {source_len} too short for kernel {} with dilation {}",
                self.kernel_size, self.source_dilation
            )));
        }
        Ok((padded - span - 1) / self.stride + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_is_maintained_for_both_masking_modes() -> Result<(), GridError> {
        for double in [false, true] {
            let cfg = ConvConfig::new(4, 4, 5)
                .with_double_masking(double)
                .with_dilation(2, 3);
            cfg.validate()?;
            assert_eq!(cfg.output_width(7)?, 7);
            assert_eq!(cfg.history_rows(), 4);
        }
        Ok(())
    }

    #[test]
    fn stride_requires_dropping_resolution() {
        let mut cfg = ConvConfig::new(4, 4, 3);
        cfg.stride = 2;
        assert!(matches!(
            cfg.validate(),
            Err(GridError::UnsupportedConfig(_))
        ));
        cfg.maintain_resolution = false;
        assert!(cfg.validate().is_ok());
        // valid convolution: (9 - 2 - 1) / 2 + 1
        assert_eq!(cfg.output_width(9).ok(), Some(4));
    }

    #[test]
    fn even_kernels_are_rejected() {
        assert!(ConvConfig::new(2, 2, 4).validate().is_err());
        assert!(ConvConfig::new(2, 2, 0).validate().is_err());
    }

    #[test]
    fn unpadded_source_too_short_errors() {
        let mut cfg = ConvConfig::new(1, 1, 5);
        cfg.maintain_resolution = false;
        assert!(cfg.output_width(4).is_err());
        assert_eq!(cfg.output_width(5).ok(), Some(1));
    }
}
