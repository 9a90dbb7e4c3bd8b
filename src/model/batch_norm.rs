use crate::common::*;

#[cfg(debug_assertions)]
static SMALL_VARIANCE_WARN: std::sync::Once = std::sync::Once::new();

#[derive(Debug, Clone)]
pub struct BatchNorm2DInit {
    pub cudnn_enabled: bool,
    pub eps: f64,
    pub momentum: f64,
    pub affine: bool,
}

impl Default for BatchNorm2DInit {
    fn default() -> Self {
        Self {
            cudnn_enabled: true,
            eps: 1e-5,
            momentum: 0.1,
            affine: true,
        }
    }
}

impl BatchNorm2DInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: i64) -> BatchNorm2D {
        let path = path.borrow();
        let Self {
            cudnn_enabled,
            eps,
            momentum,
            affine,
        } = self;

        let ws = affine.then(|| path.var("weight", &[out_dim], nn::Init::Const(1.0)));
        let bs = affine.then(|| path.var("bias", &[out_dim], nn::Init::Const(0.0)));

        BatchNorm2D {
            running_mean: path.zeros_no_train("running_mean", &[out_dim]),
            running_var: path.ones_no_train("running_var", &[out_dim]),
            ws,
            bs,
            cudnn_enabled,
            eps,
            momentum,
        }
    }
}

/// Batch normalization over (N, C, H, W) inputs with running statistics.
#[derive(Debug)]
pub struct BatchNorm2D {
    running_mean: Tensor,
    running_var: Tensor,
    ws: Option<Tensor>,
    bs: Option<Tensor>,
    cudnn_enabled: bool,
    eps: f64,
    momentum: f64,
}

impl nn::ModuleT for BatchNorm2D {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let Self {
            ref running_mean,
            ref running_var,
            ref ws,
            ref bs,
            cudnn_enabled,
            eps,
            momentum,
        } = *self;

        let output = Tensor::batch_norm(
            input,
            ws.as_ref(),
            bs.as_ref(),
            Some(running_mean),
            Some(running_var),
            train,
            momentum,
            eps,
            cudnn_enabled,
        );

        #[cfg(debug_assertions)]
        {
            let has_small_var = bool::from(running_var.abs().le(1e-15).any());
            if has_small_var {
                SMALL_VARIANCE_WARN.call_once(|| {
                    warn!(
                        "running variance {} is too small",
                        running_var.abs().min().double_value(&[])
                    );
                });
            }
        }

        output
    }
}

#[derive(Debug, Clone)]
pub struct InstanceNorm2DInit {
    pub cudnn_enabled: bool,
    pub eps: f64,
    pub affine: bool,
}

impl Default for InstanceNorm2DInit {
    fn default() -> Self {
        Self {
            cudnn_enabled: true,
            eps: 1e-5,
            affine: false,
        }
    }
}

impl InstanceNorm2DInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: i64) -> InstanceNorm2D {
        let path = path.borrow();
        let Self {
            cudnn_enabled,
            eps,
            affine,
        } = self;

        let ws = affine.then(|| path.var("weight", &[out_dim], nn::Init::Const(1.0)));
        let bs = affine.then(|| path.var("bias", &[out_dim], nn::Init::Const(0.0)));

        InstanceNorm2D {
            ws,
            bs,
            cudnn_enabled,
            eps,
        }
    }
}

/// Instance normalization always computed from the input statistics.
#[derive(Debug)]
pub struct InstanceNorm2D {
    ws: Option<Tensor>,
    bs: Option<Tensor>,
    cudnn_enabled: bool,
    eps: f64,
}

impl nn::ModuleT for InstanceNorm2D {
    fn forward_t(&self, input: &Tensor, _train: bool) -> Tensor {
        let Self {
            ref ws,
            ref bs,
            cudnn_enabled,
            eps,
        } = *self;

        Tensor::instance_norm(
            input,
            ws.as_ref(),
            bs.as_ref(),
            None,
            None,
            true, // use_input_stats
            0.1,
            eps,
            cudnn_enabled,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::abs_diff_eq;

    #[test]
    fn instance_norm_standardizes_each_channel() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = InstanceNorm2DInit::default().build(vs.root(), 3);

        let input = Tensor::rand(&[2, 3, 8, 8], FLOAT_CPU) * 5.0 + 2.0;
        let output = norm.forward_t(&input, false);

        let mean = output.mean_dim(&[2, 3], false, Kind::Float);
        let max_mean = mean.abs().max().double_value(&[]);
        ensure!(abs_diff_eq!(max_mean, 0.0, epsilon = 1e-4));

        let var = output.var_dim(&[2, 3], false, false);
        let max_dev = (var - 1.0).abs().max().double_value(&[]);
        ensure!(abs_diff_eq!(max_dev, 0.0, epsilon = 1e-2));
        Ok(())
    }

    #[test]
    fn batch_norm_updates_running_stats_in_training() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = BatchNorm2DInit {
            affine: false,
            ..Default::default()
        }
        .build(vs.root(), 3);

        let input = Tensor::rand(&[4, 3, 6, 6], FLOAT_CPU) + 10.0;
        let _ = norm.forward_t(&input, true);

        let running_mean = vs
            .variables()
            .remove("running_mean")
            .ok_or_else(|| format_err!("running_mean is missing"))?;
        let min_mean = running_mean.min().double_value(&[]);
        ensure!(min_mean > 0.5, "running mean was not updated");
        Ok(())
    }
}
