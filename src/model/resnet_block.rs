use super::{
    misc::{NormKind, PaddingKind},
    spade::{Spade, SpadeConfig, SpadeInit},
};
use crate::common::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResnetBlockInit {
    pub padding_kind: PaddingKind,
    pub dropout: bool,
    pub norm_kind: NormKind,
    pub bias: bool,
}

impl Default for ResnetBlockInit {
    fn default() -> Self {
        Self {
            padding_kind: PaddingKind::Reflect,
            norm_kind: NormKind::BatchNorm,
            dropout: false,
            bias: true,
        }
    }
}

impl ResnetBlockInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, channels: usize) -> ResnetBlock {
        let path = path.borrow();
        let Self {
            padding_kind,
            norm_kind,
            dropout,
            bias,
        } = self;
        let channels = channels as i64;
        let conv_config = nn::ConvConfig {
            padding: padding_kind.conv_padding(1),
            bias,
            ..Default::default()
        };

        let seq = nn::seq_t();
        let seq = match padding_kind.build(1) {
            Some(pad) => seq.add(pad),
            None => seq,
        };
        let seq = seq
            .add(nn::conv2d(
                path / "conv1",
                channels,
                channels,
                3,
                conv_config,
            ))
            .add(norm_kind.build(path / "norm1", channels))
            .add_fn(|xs| xs.relu());

        let seq = if dropout {
            seq.add_fn_t(|xs, train| xs.dropout(0.5, train))
        } else {
            seq
        };

        let seq = match padding_kind.build(1) {
            Some(pad) => seq.add(pad),
            None => seq,
        };
        let seq = seq
            .add(nn::conv2d(
                path / "conv2",
                channels,
                channels,
                3,
                conv_config,
            ))
            .add(norm_kind.build(path / "norm2", channels));

        ResnetBlock { seq }
    }
}

/// Residual block computing `xs + F(xs)`.
#[derive(Debug)]
pub struct ResnetBlock {
    seq: nn::SequentialT,
}

impl ResnetBlock {
    /// The residual branch `F`.
    pub fn residual_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.seq.forward_t(xs, train)
    }
}

impl nn::ModuleT for ResnetBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs + self.residual_t(xs, train)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpadeResnetBlockInit {
    pub padding_kind: PaddingKind,
    pub spade: SpadeConfig,
    pub label_channels: usize,
}

impl Default for SpadeResnetBlockInit {
    fn default() -> Self {
        Self {
            padding_kind: PaddingKind::Reflect,
            spade: SpadeConfig::default(),
            label_channels: 3,
        }
    }
}

impl SpadeResnetBlockInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, channels: usize) -> SpadeResnetBlock {
        let path = path.borrow();
        let Self {
            padding_kind,
            spade,
            label_channels,
        } = self;
        let conv_config = nn::ConvConfig {
            padding: padding_kind.conv_padding(1),
            ..Default::default()
        };
        let spade_init = SpadeInit {
            config: spade,
            norm_channels: channels,
            label_channels,
        };
        let channels = channels as i64;

        let conv_block0 = {
            let seq = nn::seq_t();
            let seq = match padding_kind.build(1) {
                Some(pad) => seq.add(pad),
                None => seq,
            };
            seq.add(nn::conv2d(
                path / "conv_block0",
                channels,
                channels,
                3,
                conv_config,
            ))
        };
        let conv_block1 = {
            let seq = nn::seq_t().add_fn(|xs| xs.relu());
            let seq = match padding_kind.build(1) {
                Some(pad) => seq.add(pad),
                None => seq,
            };
            seq.add(nn::conv2d(
                path / "conv_block1",
                channels,
                channels,
                3,
                conv_config,
            ))
        };

        SpadeResnetBlock {
            conv_block0,
            norm_layer0: spade_init.clone().build(path / "norm_layer0"),
            conv_block1,
            norm_layer1: spade_init.build(path / "norm_layer1"),
        }
    }
}

/// Residual block whose two normalizations are conditioned on a depth map.
#[derive(Debug)]
pub struct SpadeResnetBlock {
    conv_block0: nn::SequentialT,
    norm_layer0: Spade,
    conv_block1: nn::SequentialT,
    norm_layer1: Spade,
}

impl SpadeResnetBlock {
    pub fn residual_t(&self, xs: &Tensor, depth: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref conv_block0,
            ref norm_layer0,
            ref conv_block1,
            ref norm_layer1,
        } = *self;

        let xs = conv_block0.forward_t(xs, train);
        let xs = norm_layer0.forward_t(&xs, depth, train)?;
        let xs = conv_block1.forward_t(&xs, train);
        let xs = norm_layer1.forward_t(&xs, depth, train)?;
        Ok(xs)
    }

    pub fn forward_t(&self, xs: &Tensor, depth: &Tensor, train: bool) -> Result<Tensor> {
        Ok(xs + self.residual_t(xs, depth, train)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resnet_block_is_identity_plus_residual() -> Result<()> {
        tch::manual_seed(7);
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        for (index, padding_kind) in [
            PaddingKind::Reflect,
            PaddingKind::Replicate,
            PaddingKind::Zero,
        ]
        .into_iter()
        .enumerate()
        {
            let block = ResnetBlockInit {
                padding_kind,
                norm_kind: NormKind::InstanceNorm,
                ..Default::default()
            }
            .build(&root / format!("block_{}", index), 8);

            let input = Tensor::rand(&[2, 8, 10, 12], FLOAT_CPU);
            let output = block.forward_t(&input, false);
            let residual = block.residual_t(&input, false);

            ensure!(output.size() == input.size(), "incorrect output shape");
            ensure!((output - &input).allclose(&residual, 1e-5, 1e-6, false));
        }

        Ok(())
    }

    #[test]
    fn resnet_block_with_batch_norm_and_dropout() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResnetBlockInit {
            dropout: true,
            ..Default::default()
        }
        .build(vs.root(), 4);

        let input = Tensor::rand(&[3, 4, 6, 6], FLOAT_CPU);
        let output = block.forward_t(&input, true);
        ensure!(output.size() == input.size(), "incorrect output shape");
        Ok(())
    }

    #[test]
    fn spade_resnet_block_is_identity_plus_residual() -> Result<()> {
        tch::manual_seed(7);
        let vs = nn::VarStore::new(Device::Cpu);
        let block = SpadeResnetBlockInit::default().build(vs.root(), 8);

        let input = Tensor::rand(&[2, 8, 6, 10], FLOAT_CPU);
        let depth = Tensor::rand(&[2, 3, 24, 40], FLOAT_CPU);
        let output = block.forward_t(&input, &depth, false)?;
        let residual = block.residual_t(&input, &depth, false)?;

        ensure!(output.size() == input.size(), "incorrect output shape");
        ensure!((output - &input).allclose(&residual, 1e-5, 1e-6, false));
        Ok(())
    }
}
