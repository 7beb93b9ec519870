use crate::{InvalidConfigurationSnafu, Result};
use snafu::ensure;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct NvencConfig<D> {
    /// The graphics device that frames will be submitted from.
    pub device: D,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// The number of frames that can be in flight at once.
    pub pool_size: usize,
    /// How long teardown waits for each in-flight frame before giving up on it.
    pub flush_timeout: Duration,
}

impl<D> NvencConfig<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            width: 1920,
            height: 1080,
            frame_rate: 60.0,
            pool_size: 3,
            flush_timeout: Duration::from_secs(1),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(self.width > 0, InvalidConfigurationSnafu { reason: "width must be positive" });
        ensure!(self.height > 0, InvalidConfigurationSnafu { reason: "height must be positive" });
        ensure!(
            self.frame_rate.is_finite() && self.frame_rate > 0.0,
            InvalidConfigurationSnafu {
                reason: "frame rate must be positive"
            }
        );
        // the cast in fps_to_rational saturates
        let (numerator, _) = fps_to_rational(self.frame_rate);
        ensure!(
            numerator > 0 && numerator < u32::MAX,
            InvalidConfigurationSnafu {
                reason: "frame rate is out of range"
            }
        );
        ensure!(self.pool_size > 0, InvalidConfigurationSnafu { reason: "pool size must be at least 1" });
        ensure!(
            !self.flush_timeout.is_zero(),
            InvalidConfigurationSnafu {
                reason: "flush timeout must be non-zero"
            }
        );
        Ok(())
    }
}

/// Returns the frame rate as a numerator and denominator.
pub(crate) fn fps_to_rational(fps: f64) -> (u32, u32) {
    let denominator = if fps.fract() == 0.0 {
        1000
    } else {
        // a denominator of 1001 for 29.97 or 59.94 is more
        // conventional
        1001
    };
    let numerator = (fps * denominator as f64).round() as u32;
    (numerator, denominator)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::NvencError;

    #[test]
    fn test_fps_to_rational() {
        assert_eq!(fps_to_rational(60.0), (60000, 1000));
        assert_eq!(fps_to_rational(30.0), (30000, 1000));
        assert_eq!(fps_to_rational(29.97), (30000, 1001));
        assert_eq!(fps_to_rational(59.94), (60000, 1001));
    }

    #[test]
    fn test_defaults() {
        let config = NvencConfig::new(());
        assert_eq!(config.width, 1920);
        assert_eq!(config.height, 1080);
        assert_eq!(config.frame_rate, 60.0);
        assert_eq!(config.pool_size, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_frame_rate_range() {
        for frame_rate in [1e-3, 0.5, 23.976, 240.0, 1e6] {
            let config = NvencConfig {
                frame_rate,
                ..NvencConfig::new(())
            };
            assert!(config.validate().is_ok(), "{frame_rate}");
            assert!(fps_to_rational(frame_rate).0 > 0);
        }
    }

    #[test]
    fn test_validate() {
        let invalid = [
            NvencConfig { width: 0, ..NvencConfig::new(()) },
            NvencConfig { height: 0, ..NvencConfig::new(()) },
            NvencConfig {
                frame_rate: 0.0,
                ..NvencConfig::new(())
            },
            NvencConfig {
                frame_rate: -30.0,
                ..NvencConfig::new(())
            },
            NvencConfig {
                frame_rate: f64::NAN,
                ..NvencConfig::new(())
            },
            NvencConfig {
                frame_rate: f64::INFINITY,
                ..NvencConfig::new(())
            },
            NvencConfig {
                frame_rate: 1e-5,
                ..NvencConfig::new(())
            },
            NvencConfig {
                frame_rate: 1e7,
                ..NvencConfig::new(())
            },
            NvencConfig { pool_size: 0, ..NvencConfig::new(()) },
            NvencConfig {
                flush_timeout: Duration::ZERO,
                ..NvencConfig::new(())
            },
        ];
        for config in invalid {
            assert!(
                matches!(config.validate(), Err(NvencError::InvalidConfiguration { .. })),
                "{config:?} should be rejected"
            );
        }
    }
}
