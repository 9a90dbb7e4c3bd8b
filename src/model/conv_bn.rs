use crate::common::*;

/// Bias-free convolution followed by batch norm and ReLU.
#[derive(Debug, Clone)]
pub struct ConvBnInit {
    pub ksize: [i64; 2],
    pub stride: i64,
    pub padding: [i64; 2],
    pub bn_eps: f64,
}

impl ConvBnInit {
    pub fn new(ksize: i64) -> Self {
        Self {
            ksize: [ksize, ksize],
            stride: 1,
            padding: [0, 0],
            bn_eps: 0.001,
        }
    }

    pub fn with_padding(ksize: i64, padding: i64) -> Self {
        Self {
            padding: [padding, padding],
            ..Self::new(ksize)
        }
    }

    pub fn with_stride(ksize: i64, stride: i64) -> Self {
        Self {
            stride,
            ..Self::new(ksize)
        }
    }

    /// Asymmetric kernel padded to keep the spatial size.
    pub fn rect(kh: i64, kw: i64) -> Self {
        Self {
            ksize: [kh, kw],
            padding: [kh / 2, kw / 2],
            ..Self::new(1)
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, in_dim: i64, out_dim: i64) -> ConvBn {
        let path = path.borrow();
        let Self {
            ksize,
            stride,
            padding,
            bn_eps,
        } = self;

        let conv = nn::conv(
            path / "conv",
            in_dim,
            out_dim,
            ksize,
            nn::ConvConfigND::<[i64; 2]> {
                stride: [stride, stride],
                padding,
                bias: false,
                ..Default::default()
            },
        );
        let bn = nn::batch_norm2d(
            path / "bn",
            out_dim,
            nn::BatchNormConfig {
                eps: bn_eps,
                ..Default::default()
            },
        );

        ConvBn { conv, bn }
    }
}

#[derive(Debug)]
pub struct ConvBn {
    conv: nn::Conv<[i64; 2]>,
    bn: nn::BatchNorm,
}

impl nn::ModuleT for ConvBn {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        input.apply(&self.conv).apply_t(&self.bn, train).relu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_bn_output_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let input = Tensor::rand(&[2, 4, 17, 17], FLOAT_CPU);

        let rect = ConvBnInit::rect(1, 7).build(&root / "rect", 4, 6);
        ensure!(rect.forward_t(&input, true).size() == vec![2, 6, 17, 17]);

        let strided = ConvBnInit::with_stride(3, 2).build(&root / "strided", 4, 6);
        ensure!(strided.forward_t(&input, true).size() == vec![2, 6, 8, 8]);

        let padded = ConvBnInit::with_padding(5, 2).build(&root / "padded", 4, 6);
        ensure!(padded.forward_t(&input, false).size() == vec![2, 6, 17, 17]);

        ensure!(!vs.variables().contains_key("rect.conv.bias"));
        Ok(())
    }
}
