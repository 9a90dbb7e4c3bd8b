use super::{
    misc::{NormKind, PaddingKind},
    resnet_block::ResnetBlockInit,
};
use crate::common::*;

/// Number of stride-2 stages on each side of the bottleneck.
pub(crate) const NUM_SAMPLING: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorInit {
    pub input_channels: usize,
    pub output_channels: usize,
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_num_residual_blocks")]
    pub num_residual_blocks: usize,
    #[serde(default = "default_norm_kind")]
    pub norm_kind: NormKind,
    #[serde(default = "default_sigmoid")]
    pub sigmoid: bool,
}

impl GeneratorInit {
    pub fn new(input_channels: usize, output_channels: usize) -> Self {
        Self {
            input_channels,
            output_channels,
            base_channels: default_base_channels(),
            num_residual_blocks: default_num_residual_blocks(),
            norm_kind: default_norm_kind(),
            sigmoid: default_sigmoid(),
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Generator> {
        let path = path.borrow();
        let Self {
            input_channels,
            output_channels,
            base_channels,
            num_residual_blocks,
            norm_kind,
            sigmoid,
        } = self;
        ensure!(base_channels > 0, "base_channels must be positive");

        let stem = stem(
            path / "model0",
            input_channels,
            base_channels,
            norm_kind,
        );

        let (down_sampling, bottleneck_channels) =
            down_sampling(path / "model1", base_channels, norm_kind);

        let bottleneck = {
            let path = path / "model2";
            (0..num_residual_blocks).fold(nn::seq_t(), |seq, index| {
                seq.add(
                    ResnetBlockInit {
                        padding_kind: PaddingKind::Reflect,
                        norm_kind,
                        dropout: false,
                        bias: true,
                    }
                    .build(&path / index, bottleneck_channels),
                )
            })
        };

        let up_sampling = {
            let path = path / "model3";
            (0..NUM_SAMPLING).fold(nn::seq_t(), |seq, index| {
                let in_c = (bottleneck_channels >> index) as i64;
                let out_c = in_c / 2;
                seq.add(up_conv(&path / format!("up_conv_{}", index), in_c, out_c))
                    .add(norm_kind.build(&path / format!("norm_{}", index), out_c))
                    .add_fn(|xs| xs.relu())
            })
        };

        let output = output_projection(path / "model4", base_channels, output_channels);
        let output = if sigmoid {
            output.add_fn(|xs| xs.sigmoid())
        } else {
            output
        };

        debug!(
            "built generator with {} residual blocks at {} channels",
            num_residual_blocks, bottleneck_channels
        );

        Ok(Generator {
            seq: nn::seq_t()
                .add(stem)
                .add(down_sampling)
                .add(bottleneck)
                .add(up_sampling)
                .add(output),
        })
    }
}

/// Image-to-image generator: down sampling, residual blocks, up sampling.
#[derive(Debug)]
pub struct Generator {
    seq: nn::SequentialT,
}

impl nn::ModuleT for Generator {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        self.seq.forward_t(input, train)
    }
}

/// Reflection padded 7x7 convolution followed by norm and ReLU.
pub(crate) fn stem<'a>(
    path: impl Borrow<nn::Path<'a>>,
    in_c: usize,
    out_c: usize,
    norm_kind: NormKind,
) -> nn::SequentialT {
    let path = path.borrow();
    let out_c = out_c as i64;

    nn::seq_t()
        .add_fn(|xs| xs.reflection_pad2d(&[3, 3, 3, 3]))
        .add(nn::conv2d(
            path / "conv",
            in_c as i64,
            out_c,
            7,
            Default::default(),
        ))
        .add(norm_kind.build(path / "norm", out_c))
        .add_fn(|xs| xs.relu())
}

/// Stride-2 convolutions doubling the channels at each stage. Returns the
/// stages and the channels at the bottleneck.
pub(crate) fn down_sampling<'a>(
    path: impl Borrow<nn::Path<'a>>,
    base_channels: usize,
    norm_kind: NormKind,
) -> (nn::SequentialT, usize) {
    let path = path.borrow();

    let seq = (0..NUM_SAMPLING).fold(nn::seq_t(), |seq, index| {
        let in_c = (base_channels << index) as i64;
        let out_c = in_c * 2;
        seq.add(nn::conv2d(
            path / format!("down_conv_{}", index),
            in_c,
            out_c,
            3,
            nn::ConvConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        ))
        .add(norm_kind.build(path / format!("norm_{}", index), out_c))
        .add_fn(|xs| xs.relu())
    });

    (seq, base_channels << NUM_SAMPLING)
}

/// Transposed convolution doubling the spatial size.
pub(crate) fn up_conv<'a>(
    path: impl Borrow<nn::Path<'a>>,
    in_c: i64,
    out_c: i64,
) -> nn::ConvTranspose2D {
    nn::conv_transpose2d(
        path,
        in_c,
        out_c,
        3,
        nn::ConvTransposeConfig {
            stride: 2,
            padding: 1,
            output_padding: 1,
            ..Default::default()
        },
    )
}

/// Reflection padded 7x7 convolution to the output channels.
pub(crate) fn output_projection<'a>(
    path: impl Borrow<nn::Path<'a>>,
    in_c: usize,
    out_c: usize,
) -> nn::SequentialT {
    let path = path.borrow();

    nn::seq_t()
        .add_fn(|xs| xs.reflection_pad2d(&[3, 3, 3, 3]))
        .add(nn::conv2d(
            path / "conv",
            in_c as i64,
            out_c as i64,
            7,
            Default::default(),
        ))
}

fn default_base_channels() -> usize {
    64
}

fn default_num_residual_blocks() -> usize {
    9
}

fn default_norm_kind() -> NormKind {
    NormKind::InstanceNorm
}

fn default_sigmoid() -> bool {
    true
}
