use super::batch_norm::{BatchNorm2D, BatchNorm2DInit, InstanceNorm2D, InstanceNorm2DInit};
use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingKind {
    Reflect,
    Replicate,
    Zero,
}

impl PaddingKind {
    /// Builds the explicit padding layer, or `None` for zero padding, which is
    /// carried by the convolution itself.
    pub fn build(self, padding: usize) -> Option<Pad2D> {
        let padding = padding as i64;
        match self {
            Self::Zero => None,
            kind => Some(Pad2D {
                kind,
                lrtb: [padding; 4],
            }),
        }
    }

    /// Padding to be passed to the convolution following the padding layer.
    pub fn conv_padding(self, padding: usize) -> i64 {
        match self {
            Self::Zero => padding as i64,
            Self::Reflect | Self::Replicate => 0,
        }
    }
}

impl Default for PaddingKind {
    fn default() -> Self {
        Self::Reflect
    }
}

impl FromStr for PaddingKind {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let kind = match text {
            "reflect" => Self::Reflect,
            "replicate" => Self::Replicate,
            "zero" => Self::Zero,
            _ => bail!("padding [{}] is not implemented", text),
        };
        Ok(kind)
    }
}

#[derive(Debug)]
pub struct Pad2D {
    kind: PaddingKind,
    lrtb: [i64; 4],
}

impl nn::Module for Pad2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self.kind {
            PaddingKind::Reflect => xs.reflection_pad2d(&self.lrtb),
            PaddingKind::Replicate => xs.replication_pad2d(&self.lrtb),
            PaddingKind::Zero => {
                let [l, r, t, b] = self.lrtb;
                xs.zero_pad2d(l, r, t, b)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    BatchNorm,
    InstanceNorm,
}

impl NormKind {
    /// Builds the norm with libtorch's default affinity: batch norm learns a
    /// scale and shift, instance norm does not.
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: i64) -> Norm {
        match self {
            Self::BatchNorm => Norm::BatchNorm(BatchNorm2DInit::default().build(path, out_dim)),
            Self::InstanceNorm => {
                Norm::InstanceNorm(InstanceNorm2DInit::default().build(path, out_dim))
            }
        }
    }

    /// Builds the norm without learnable affine parameters.
    pub fn build_param_free<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: i64) -> Norm {
        match self {
            Self::BatchNorm => Norm::BatchNorm(
                BatchNorm2DInit {
                    affine: false,
                    ..Default::default()
                }
                .build(path, out_dim),
            ),
            Self::InstanceNorm => Norm::InstanceNorm(
                InstanceNorm2DInit {
                    affine: false,
                    ..Default::default()
                }
                .build(path, out_dim),
            ),
        }
    }
}

#[derive(Debug)]
pub enum Norm {
    BatchNorm(BatchNorm2D),
    InstanceNorm(InstanceNorm2D),
}

impl nn::ModuleT for Norm {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        match self {
            Self::BatchNorm(norm) => norm.forward_t(input, train),
            Self::InstanceNorm(norm) => norm.forward_t(input, train),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nn::Module;

    #[test]
    fn padding_kind_parse() -> Result<()> {
        ensure!("reflect".parse::<PaddingKind>()? == PaddingKind::Reflect);
        ensure!("replicate".parse::<PaddingKind>()? == PaddingKind::Replicate);
        ensure!("zero".parse::<PaddingKind>()? == PaddingKind::Zero);

        let err = "circular".parse::<PaddingKind>().unwrap_err();
        ensure!(
            err.to_string().contains("circular"),
            "the error must name the rejected value"
        );
        Ok(())
    }

    #[test]
    fn padding_layers_grow_input() -> Result<()> {
        let input = Tensor::rand(&[2, 3, 5, 7], FLOAT_CPU);

        for kind in [PaddingKind::Reflect, PaddingKind::Replicate] {
            let pad = kind.build(2).unwrap();
            let output = pad.forward(&input);
            ensure!(output.size() == vec![2, 3, 9, 11], "incorrect output shape");
            ensure!(kind.conv_padding(2) == 0);
        }

        ensure!(PaddingKind::Zero.build(2).is_none());
        ensure!(PaddingKind::Zero.conv_padding(2) == 2);
        Ok(())
    }

    #[test]
    fn norm_kind_uses_serde_names() -> Result<()> {
        ensure!(json5::from_str::<NormKind>("\"batch_norm\"")? == NormKind::BatchNorm);
        ensure!(json5::from_str::<NormKind>("\"instance_norm\"")? == NormKind::InstanceNorm);
        ensure!(json5::from_str::<NormKind>("\"batch\"").is_err());
        ensure!(json5::from_str::<NormKind>("\"instance\"").is_err());
        Ok(())
    }

    #[test]
    fn norm_affinity() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let _ = NormKind::BatchNorm.build(&root / "bn", 4);
        let _ = NormKind::BatchNorm.build_param_free(&root / "bn_free", 4);
        let _ = NormKind::InstanceNorm.build(&root / "in", 4);

        let names = vs.variables();
        ensure!(names.contains_key("bn.weight") && names.contains_key("bn.bias"));
        ensure!(names.contains_key("bn_free.running_mean"));
        ensure!(!names.contains_key("bn_free.weight"));
        ensure!(!names.keys().any(|name| name.starts_with("in.")));
        Ok(())
    }
}
