use super::{
    misc::{NormKind, PaddingKind},
    resnet_block::ResnetBlockInit,
};
use crate::common::*;

/// Channel multiplier of the stem, relative to `base_channels`.
const STEM_MULTIPLIER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    Sigmoid,
    Tanh,
}

impl Default for OutputActivation {
    fn default() -> Self {
        Self::Tanh
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalGeneratorInit {
    pub input_channels: usize,
    pub output_channels: usize,
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_num_downsampling")]
    pub num_downsampling: usize,
    /// Number of up sampling stages. Zero falls back to `num_downsampling`.
    #[serde(default)]
    pub num_upsampling: usize,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_norm_kind")]
    pub norm_kind: NormKind,
    #[serde(default)]
    pub padding_kind: PaddingKind,
    #[serde(default)]
    pub activation: OutputActivation,
}

impl GlobalGeneratorInit {
    pub fn new(input_channels: usize, output_channels: usize) -> Self {
        Self {
            input_channels,
            output_channels,
            base_channels: default_base_channels(),
            num_downsampling: default_num_downsampling(),
            num_upsampling: 0,
            num_blocks: default_num_blocks(),
            norm_kind: default_norm_kind(),
            padding_kind: PaddingKind::default(),
            activation: OutputActivation::default(),
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<GlobalGenerator> {
        let path = path.borrow();
        let Self {
            input_channels,
            output_channels,
            base_channels: ngf,
            num_downsampling,
            num_upsampling,
            num_blocks,
            norm_kind,
            padding_kind,
            activation,
        } = self;
        ensure!(ngf > 0, "base_channels must be positive");

        let mut mult = STEM_MULTIPLIER;

        // stem
        let seq = nn::seq_t()
            .add_fn(|xs| xs.reflection_pad2d(&[4, 4, 4, 4]))
            .add(nn::conv2d(
                path / "stem_conv",
                input_channels as i64,
                (ngf * mult) as i64,
                7,
                Default::default(),
            ))
            .add(norm_kind.build(path / "stem_norm", (ngf * mult) as i64))
            .add_fn(|xs| xs.relu());

        // "down" sampling halves the channels with transposed convolutions,
        // which doubles the spatial size
        let mut seq = seq;
        for index in 0..num_downsampling {
            let in_c = ngf * mult;
            let out_c = ngf * mult / 2;
            ensure!(
                out_c > 0,
                "{} down sampling stages exhaust the {} stem channels",
                num_downsampling,
                ngf * STEM_MULTIPLIER
            );

            seq = seq
                .add(nn::conv_transpose2d(
                    path / format!("down_conv_{}", index),
                    in_c as i64,
                    out_c as i64,
                    4,
                    nn::ConvTransposeConfig {
                        stride: 2,
                        padding: 1,
                        ..Default::default()
                    },
                ))
                .add(norm_kind.build(path / format!("down_norm_{}", index), out_c as i64))
                .add_fn(|xs| xs.relu());
            mult /= 2;
        }

        let num_upsampling = if num_upsampling == 0 {
            num_downsampling
        } else {
            num_upsampling
        };

        let bottleneck_channels = ngf * mult;
        ensure!(
            bottleneck_channels > 0,
            "the bottleneck of the global generator has no channels"
        );
        for index in 0..num_blocks {
            seq = seq.add(
                ResnetBlockInit {
                    padding_kind,
                    norm_kind,
                    dropout: false,
                    bias: true,
                }
                .build(path / format!("block_{}", index), bottleneck_channels),
            );
        }

        for index in 0..num_upsampling {
            let mut next_mult = mult / 2;
            if next_mult == 0 {
                next_mult = 1;
                mult = 1;
            }

            let in_c = (ngf * mult) as i64;
            let out_c = (ngf * next_mult) as i64;
            seq = seq
                .add(nn::conv_transpose2d(
                    path / format!("up_conv_{}", index),
                    in_c,
                    out_c,
                    3,
                    nn::ConvTransposeConfig {
                        stride: 2,
                        padding: 1,
                        output_padding: 1,
                        ..Default::default()
                    },
                ))
                .add(norm_kind.build(path / format!("up_norm_{}", index), out_c))
                .add_fn(|xs| xs.relu());
            mult = next_mult;
        }

        ensure!(
            mult == 1,
            "the up sampling ends at {} channels but the output projection expects {}",
            ngf * mult,
            ngf
        );

        let seq = seq
            .add_fn(|xs| xs.reflection_pad2d(&[3, 3, 3, 3]))
            .add(nn::conv2d(
                path / "output_conv",
                ngf as i64,
                output_channels as i64,
                7,
                Default::default(),
            ));
        let seq = match activation {
            OutputActivation::Sigmoid => seq.add_fn(|xs| xs.sigmoid()),
            OutputActivation::Tanh => seq.add_fn(|xs| xs.tanh()),
        };

        debug!(
            "built global generator with {} down, {} blocks, {} up sampling stages",
            num_downsampling, num_blocks, num_upsampling
        );

        Ok(GlobalGenerator {
            scale: 1 << (num_downsampling + num_upsampling),
            seq,
        })
    }
}

/// Deep generator whose output is larger than its input by a power of two.
#[derive(Debug)]
pub struct GlobalGenerator {
    scale: i64,
    seq: nn::SequentialT,
}

impl GlobalGenerator {
    /// Spatial size of the output for a given input size.
    pub fn output_size(&self, height: i64, width: i64) -> (i64, i64) {
        ((height + 2) * self.scale, (width + 2) * self.scale)
    }
}

impl nn::ModuleT for GlobalGenerator {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        self.seq.forward_t(input, train)
    }
}

fn default_base_channels() -> usize {
    64
}

fn default_num_downsampling() -> usize {
    3
}

fn default_num_blocks() -> usize {
    9
}

fn default_norm_kind() -> NormKind {
    NormKind::BatchNorm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_generator_output_size() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let generator = GlobalGeneratorInit {
            base_channels: 2,
            num_downsampling: 1,
            num_upsampling: 2,
            num_blocks: 1,
            ..GlobalGeneratorInit::new(3, 3)
        }
        .build(&root / "a")?;
        ensure!(generator.output_size(5, 6) == (56, 64));

        let input = Tensor::rand(&[2, 3, 5, 6], FLOAT_CPU);
        let output = generator.forward_t(&input, true);
        ensure!(output.size() == vec![2, 3, 56, 64], "incorrect output shape");
        let min = output.min().double_value(&[]);
        let max = output.max().double_value(&[]);
        ensure!((-1.0..=1.0).contains(&min) && (-1.0..=1.0).contains(&max));

        let generator = GlobalGeneratorInit {
            base_channels: 2,
            num_downsampling: 3,
            num_blocks: 1,
            norm_kind: NormKind::InstanceNorm,
            padding_kind: PaddingKind::Zero,
            activation: OutputActivation::Sigmoid,
            ..GlobalGeneratorInit::new(1, 2)
        }
        .build(&root / "b")?;
        let input = Tensor::rand(&[1, 1, 5, 5], FLOAT_CPU);
        let output = generator.forward_t(&input, false);
        ensure!(output.size() == vec![1, 2, 448, 448], "incorrect output shape");
        ensure!(output.min().double_value(&[]) >= 0.0);

        Ok(())
    }

    #[test]
    fn global_generator_channel_sequence() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = GlobalGeneratorInit {
            base_channels: 4,
            num_downsampling: 2,
            num_upsampling: 3,
            num_blocks: 1,
            ..GlobalGeneratorInit::new(3, 3)
        }
        .build(vs.root())?;

        let variables = vs.variables();
        let shape_of = |name: &str| -> Result<Vec<i64>> {
            let var = variables
                .get(name)
                .ok_or_else(|| format_err!("missing variable {}", name))?;
            Ok(var.size())
        };

        // transposed convolution weights are (in, out, k, k)
        ensure!(shape_of("stem_conv.weight")? == vec![32, 3, 7, 7]);
        ensure!(shape_of("down_conv_0.weight")? == vec![32, 16, 4, 4]);
        ensure!(shape_of("down_conv_1.weight")? == vec![16, 8, 4, 4]);
        ensure!(shape_of("block_0.conv1.weight")? == vec![8, 8, 3, 3]);
        ensure!(shape_of("up_conv_0.weight")? == vec![8, 4, 3, 3]);
        ensure!(shape_of("up_conv_1.weight")? == vec![4, 4, 3, 3]);
        ensure!(shape_of("up_conv_2.weight")? == vec![4, 4, 3, 3]);
        ensure!(shape_of("output_conv.weight")? == vec![3, 4, 7, 7]);
        Ok(())
    }

    #[test]
    fn global_generator_rejects_inconsistent_channels() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        // the multiplier runs out after three halvings
        ensure!(GlobalGeneratorInit {
            base_channels: 2,
            num_downsampling: 4,
            num_blocks: 0,
            ..GlobalGeneratorInit::new(3, 3)
        }
        .build(&root / "too_deep")
        .is_err());

        // up sampling stops before reaching the base width
        ensure!(GlobalGeneratorInit {
            base_channels: 2,
            num_downsampling: 1,
            num_upsampling: 1,
            num_blocks: 0,
            ..GlobalGeneratorInit::new(3, 3)
        }
        .build(&root / "too_shallow")
        .is_err());

        Ok(())
    }
}
