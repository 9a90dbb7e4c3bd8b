use super::{
    generator::{down_sampling, output_projection, stem, up_conv, NUM_SAMPLING},
    misc::{NormKind, PaddingKind},
    resnet_block::{SpadeResnetBlock, SpadeResnetBlockInit},
    spade::{Spade, SpadeConfig, SpadeInit},
};
use crate::common::*;

/// How the depth map is treated before it conditions the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthMode {
    /// Keep or zero the whole batch's depth on a single fair coin flip.
    RandomDrop,
    Keep,
    Zero,
}

impl Default for DepthMode {
    fn default() -> Self {
        Self::RandomDrop
    }
}

impl TryFrom<i64> for DepthMode {
    type Error = Error;

    fn try_from(sign: i64) -> Result<Self, Self::Error> {
        let mode = match sign {
            0 => Self::RandomDrop,
            1 => Self::Keep,
            2 => Self::Zero,
            _ => bail!("depth mode must be one of 0, 1, 2, but get {}", sign),
        };
        Ok(mode)
    }
}

impl DepthMode {
    pub fn apply(self, depth: &Tensor) -> Tensor {
        match self {
            Self::RandomDrop => {
                let gate = (Tensor::rand(&[1], (depth.kind(), depth.device())) * 2.0).floor();
                depth * gate
            }
            Self::Keep => depth.shallow_clone(),
            Self::Zero => depth * 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpadeGeneratorInit {
    pub input_channels: usize,
    pub output_channels: usize,
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_num_residual_blocks")]
    pub num_residual_blocks: usize,
    #[serde(default = "default_label_channels")]
    pub label_channels: usize,
    #[serde(default)]
    pub spade: SpadeConfig,
    #[serde(default = "default_norm_kind")]
    pub norm_kind: NormKind,
    #[serde(default = "default_sigmoid")]
    pub sigmoid: bool,
}

impl SpadeGeneratorInit {
    pub fn new(input_channels: usize, output_channels: usize) -> Self {
        Self {
            input_channels,
            output_channels,
            base_channels: default_base_channels(),
            num_residual_blocks: default_num_residual_blocks(),
            label_channels: default_label_channels(),
            spade: SpadeConfig::default(),
            norm_kind: default_norm_kind(),
            sigmoid: default_sigmoid(),
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<SpadeGenerator> {
        let path = path.borrow();
        let Self {
            input_channels,
            output_channels,
            base_channels,
            num_residual_blocks,
            label_channels,
            spade,
            norm_kind,
            sigmoid,
        } = self;
        ensure!(base_channels > 0, "base_channels must be positive");
        ensure!(label_channels > 0, "label_channels must be positive");

        let mut stages = vec![];

        stages.push(Stage::Plain(stem(
            path / "model0",
            input_channels,
            base_channels,
            norm_kind,
        )));

        let (down_sampling, bottleneck_channels) =
            down_sampling(path / "model1", base_channels, norm_kind);
        stages.push(Stage::Plain(down_sampling));

        {
            let path = path / "model2";
            stages.extend((0..num_residual_blocks).map(|index| {
                let block = SpadeResnetBlockInit {
                    padding_kind: PaddingKind::Reflect,
                    spade,
                    label_channels,
                }
                .build(&path / index, bottleneck_channels);
                Stage::SpadeBlock(block)
            }));
        }

        {
            let path = path / "model3";
            for index in 0..NUM_SAMPLING {
                let in_c = bottleneck_channels >> index;
                let out_c = in_c / 2;

                stages.push(Stage::Plain(nn::seq_t().add(up_conv(
                    &path / format!("up_conv_{}", index),
                    in_c as i64,
                    out_c as i64,
                ))));
                stages.push(Stage::Spade(
                    SpadeInit {
                        config: spade,
                        norm_channels: out_c,
                        label_channels,
                    }
                    .build(&path / format!("spade_{}", index)),
                ));
                stages.push(Stage::Plain(nn::seq_t().add_fn(|xs| xs.relu())));
            }
        }

        let output = output_projection(path / "model4", base_channels, output_channels);
        let output = if sigmoid {
            output.add_fn(|xs| xs.sigmoid())
        } else {
            output
        };
        stages.push(Stage::Plain(output));

        debug!(
            "built SPADE generator with {} residual blocks at {} channels, {}",
            num_residual_blocks, bottleneck_channels, spade
        );

        Ok(SpadeGenerator {
            label_channels: label_channels as i64,
            stages,
        })
    }
}

/// A pipeline stage, either unconditioned or consuming the depth map.
#[derive(Debug)]
enum Stage {
    Plain(nn::SequentialT),
    Spade(Spade),
    SpadeBlock(SpadeResnetBlock),
}

/// Generator whose bottleneck and up sampling are conditioned on a depth map.
#[derive(Debug)]
pub struct SpadeGenerator {
    label_channels: i64,
    stages: Vec<Stage>,
}

impl SpadeGenerator {
    pub fn forward_t(
        &self,
        input: &Tensor,
        depth: &Tensor,
        mode: DepthMode,
        train: bool,
    ) -> Result<Tensor> {
        let Self {
            label_channels,
            ref stages,
        } = *self;
        let (_, depth_channels, _, _) = depth.size4()?;
        ensure!(
            depth_channels == label_channels,
            "expect {} depth channels, but get {}",
            label_channels,
            depth_channels
        );

        let depth = mode.apply(depth);

        stages
            .iter()
            .try_fold(input.shallow_clone(), |xs, stage| -> Result<_> {
                let xs = match stage {
                    Stage::Plain(seq) => seq.forward_t(&xs, train),
                    Stage::Spade(spade) => spade.forward_t(&xs, &depth, train)?,
                    Stage::SpadeBlock(block) => block.forward_t(&xs, &depth, train)?,
                };
                Ok(xs)
            })
    }
}

fn default_base_channels() -> usize {
    64
}

fn default_num_residual_blocks() -> usize {
    9
}

fn default_label_channels() -> usize {
    3
}

fn default_norm_kind() -> NormKind {
    NormKind::InstanceNorm
}

fn default_sigmoid() -> bool {
    true
}
