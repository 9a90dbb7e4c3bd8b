//! Spatially-adaptive normalization.
//!
//! The activations are first normalized by a parameter-free norm, then scaled
//! and shifted per pixel by values predicted from a condition map.

use super::misc::{Norm, NormKind};
use crate::common::*;
use regex::Regex;

/// Width of the shared embedding computed from the condition map.
const NUM_HIDDEN: i64 = 128;

/// Parsed form of a `spade<norm><k>x<k>` configuration, e.g. `spadeinstance3x3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpadeConfig {
    pub norm_kind: NormKind,
    pub ksize: usize,
}

impl Default for SpadeConfig {
    fn default() -> Self {
        Self {
            norm_kind: NormKind::InstanceNorm,
            ksize: 3,
        }
    }
}

impl FromStr for SpadeConfig {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        ensure!(
            text.starts_with("spade"),
            "SPADE config '{}' must start with 'spade'",
            text
        );

        let pattern = Regex::new(r"spade(\D+)(\d)x\d")?;
        let captures = pattern.captures(text).ok_or_else(|| {
            format_err!(
                "SPADE config '{}' does not match the form spade<norm><k>x<k>",
                text
            )
        })?;
        let norm_name = &captures[1];
        let ksize = decimal_value(&captures[2])?;

        let norm_kind = match norm_name {
            "instance" => NormKind::InstanceNorm,
            "batch" => NormKind::BatchNorm,
            _ => bail!(
                "{} is not a recognized param-free norm type in SPADE",
                norm_name
            ),
        };

        ensure!(
            ksize % 2 == 1,
            "SPADE kernel size must be odd, but get {} in '{}'",
            ksize,
            text
        );

        Ok(Self {
            norm_kind,
            ksize: ksize as usize,
        })
    }
}

/// Value of a single Unicode decimal digit.
///
/// Decimal digits are laid out in runs of ten consecutive code points
/// starting from zero, so the value is the offset from the start of the run.
fn decimal_value(digit: &str) -> Result<u32> {
    let is_decimal = Regex::new(r"^\d$")?;
    let ch = digit
        .chars()
        .exactly_one()
        .map_err(|_| format_err!("expect a single digit, but get '{}'", digit))?;

    if let Some(value) = ch.to_digit(10) {
        return Ok(value);
    }

    let mut buf = [0u8; 4];
    let mut zero = ch as u32;
    while let Some(prev) = zero.checked_sub(1).and_then(char::from_u32) {
        if !is_decimal.is_match(prev.encode_utf8(&mut buf)) {
            break;
        }
        zero -= 1;
    }

    Ok((ch as u32 - zero) % 10)
}

impl TryFrom<String> for SpadeConfig {
    type Error = Error;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<SpadeConfig> for String {
    fn from(config: SpadeConfig) -> Self {
        config.to_string()
    }
}

impl std::fmt::Display for SpadeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let norm_name = match self.norm_kind {
            NormKind::InstanceNorm => "instance",
            NormKind::BatchNorm => "batch",
        };
        write!(f, "spade{}{}x{}", norm_name, self.ksize, self.ksize)
    }
}

#[derive(Debug, Clone)]
pub struct SpadeInit {
    pub config: SpadeConfig,
    /// Channels of the normalized activations.
    pub norm_channels: usize,
    /// Channels of the condition map.
    pub label_channels: usize,
}

impl SpadeInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Spade {
        let path = path.borrow();
        let Self {
            config: SpadeConfig { norm_kind, ksize },
            norm_channels,
            label_channels,
        } = self;
        let ksize = ksize as i64;
        let norm_channels = norm_channels as i64;
        let conv_config = nn::ConvConfig {
            padding: ksize / 2,
            ..Default::default()
        };

        let param_free_norm = norm_kind.build_param_free(path / "param_free_norm", norm_channels);
        let mlp_shared = nn::conv2d(
            path / "mlp_shared",
            label_channels as i64,
            NUM_HIDDEN,
            ksize,
            conv_config,
        );
        let mlp_gamma = nn::conv2d(
            path / "mlp_gamma",
            NUM_HIDDEN,
            norm_channels,
            ksize,
            conv_config,
        );
        let mlp_beta = nn::conv2d(
            path / "mlp_beta",
            NUM_HIDDEN,
            norm_channels,
            ksize,
            conv_config,
        );

        Spade {
            param_free_norm,
            mlp_shared,
            mlp_gamma,
            mlp_beta,
        }
    }
}

#[derive(Debug)]
pub struct Spade {
    param_free_norm: Norm,
    mlp_shared: nn::Conv2D,
    mlp_gamma: nn::Conv2D,
    mlp_beta: nn::Conv2D,
}

impl Spade {
    pub fn forward_t(&self, input: &Tensor, segmap: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref param_free_norm,
            ref mlp_shared,
            ref mlp_gamma,
            ref mlp_beta,
        } = *self;
        let (_, _, height, width) = input.size4()?;

        let normalized = param_free_norm.forward_t(input, train);

        let segmap = segmap.upsample_nearest2d(&[height, width], None::<f64>, None::<f64>);
        let actv = segmap.apply(mlp_shared).relu();
        let gamma = actv.apply(mlp_gamma);
        let beta = actv.apply(mlp_beta);

        Ok(normalized * (gamma + 1.0) + beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spade_config_parse() -> Result<()> {
        let config: SpadeConfig = "spadeinstance3x3".parse()?;
        ensure!(
            config
                == SpadeConfig {
                    norm_kind: NormKind::InstanceNorm,
                    ksize: 3
                }
        );

        let config: SpadeConfig = "spadebatch5x5".parse()?;
        ensure!(
            config
                == SpadeConfig {
                    norm_kind: NormKind::BatchNorm,
                    ksize: 5
                }
        );
        ensure!(config.to_string() == "spadebatch5x5");

        // trailing text is tolerated like a regex search
        let config: SpadeConfig = "spadeinstance1x1_extra".parse()?;
        ensure!(config.ksize == 1);

        Ok(())
    }

    #[test]
    fn spade_config_accepts_unicode_digits() -> Result<()> {
        // arabic-indic three
        let config: SpadeConfig = "spadeinstance\u{663}x3".parse()?;
        ensure!(
            config
                == SpadeConfig {
                    norm_kind: NormKind::InstanceNorm,
                    ksize: 3
                }
        );

        // fullwidth five
        let config: SpadeConfig = "spadebatch\u{ff15}x5".parse()?;
        ensure!(config.ksize == 5);

        // mathematical bold digits share one long run of decimal code points
        let config: SpadeConfig = "spadebatch\u{1d7d1}x3".parse()?;
        ensure!(config.ksize == 3);

        // arabic-indic four is even
        ensure!("spadeinstance\u{664}x4".parse::<SpadeConfig>().is_err());
        Ok(())
    }

    #[test]
    fn spade_config_rejects_unknown_norm() -> Result<()> {
        for text in ["spadefoo3x3", "spadesyncbatch3x3"] {
            let err = text.parse::<SpadeConfig>().unwrap_err();
            ensure!(
                err.to_string().contains("not a recognized param-free norm type"),
                "unexpected error for {}: {}",
                text,
                err
            );
        }
        Ok(())
    }

    #[test]
    fn spade_config_rejects_malformed_text() -> Result<()> {
        for text in [
            "instance3x3",
            "spade3x3",
            "spadeinstance",
            "spadeinstance3y3",
            "spadeinstance3x",
            "spadeinstance11x11",
            "spadeinstance4x4",
        ] {
            ensure!(
                text.parse::<SpadeConfig>().is_err(),
                "{} should be rejected",
                text
            );
        }
        Ok(())
    }

    #[test]
    fn spade_preserves_input_shape() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        for (index, ksize) in [1, 3, 5].into_iter().enumerate() {
            for norm_kind in [NormKind::InstanceNorm, NormKind::BatchNorm] {
                let spade = SpadeInit {
                    config: SpadeConfig { norm_kind, ksize },
                    norm_channels: 6,
                    label_channels: 3,
                }
                .build(&root / format!("spade_{}_{:?}", index, norm_kind));

                for (height, width) in [(7, 9), (16, 16), (1, 5)] {
                    let input = Tensor::rand(&[2, 6, height, width], FLOAT_CPU);
                    let segmap = Tensor::rand(&[2, 3, 11, 13], FLOAT_CPU);
                    let output = spade.forward_t(&input, &segmap, true)?;
                    ensure!(
                        output.size() == input.size(),
                        "incorrect output shape for ksize {}",
                        ksize
                    );
                }
            }
        }

        Ok(())
    }

    #[test]
    fn spade_with_zero_weights_reduces_to_normalization() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let spade = SpadeInit {
            config: SpadeConfig::default(),
            norm_channels: 4,
            label_channels: 3,
        }
        .build(vs.root());

        tch::no_grad(|| {
            vs.variables().values_mut().for_each(|var| {
                let _ = var.zero_();
            })
        });

        let input = Tensor::rand(&[1, 4, 8, 8], FLOAT_CPU);
        let segmap = Tensor::rand(&[1, 3, 8, 8], FLOAT_CPU);
        let output = spade.forward_t(&input, &segmap, false)?;
        let expect = Tensor::instance_norm(
            &input,
            None::<&Tensor>,
            None,
            None,
            None,
            true,
            0.1,
            1e-5,
            false,
        );

        ensure!(output.allclose(&expect, 1e-5, 1e-6, false));
        Ok(())
    }
}
