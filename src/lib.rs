pub mod common;
pub mod config;
pub mod model;

use crate::{
    common::*,
    config::{Config, Input, ModelConfig},
    model::{InceptionExtra, InceptionOutput},
};

/// Builds the configured model, runs it on a random input and optionally
/// saves the freshly built variables.
pub fn start(config: Config, output: Option<&Path>) -> Result<()> {
    let Config {
        device,
        input,
        model,
    } = config;
    let Input {
        batch_size,
        height,
        width,
        depth_mode,
    } = input;
    let batch_size = batch_size.get() as i64;
    let height = height.get() as i64;
    let width = width.get() as i64;
    let options = (Kind::Float, device);

    let vs = nn::VarStore::new(device);
    let root = vs.root();

    let output_shapes: Vec<Vec<i64>> = match model {
        ModelConfig::Generator(init) => {
            let input_channels = init.input_channels as i64;
            let generator = init.build(&root / "generator")?;
            let input = Tensor::rand(&[batch_size, input_channels, height, width], options);
            let output = tch::no_grad(|| generator.forward_t(&input, false));
            vec![output.size()]
        }
        ModelConfig::SpadeGenerator(init) => {
            let input_channels = init.input_channels as i64;
            let label_channels = init.label_channels as i64;
            let generator = init.build(&root / "generator")?;
            let input = Tensor::rand(&[batch_size, input_channels, height, width], options);
            let depth = Tensor::rand(&[batch_size, label_channels, height, width], options);
            let output =
                tch::no_grad(|| generator.forward_t(&input, &depth, depth_mode, false))?;
            vec![output.size()]
        }
        ModelConfig::GlobalGenerator(init) => {
            let input_channels = init.input_channels as i64;
            let generator = init.build(&root / "generator")?;
            let (out_h, out_w) = generator.output_size(height, width);
            debug!("expect {}x{} outputs", out_h, out_w);
            let input = Tensor::rand(&[batch_size, input_channels, height, width], options);
            let output = tch::no_grad(|| generator.forward_t(&input, false));
            vec![output.size()]
        }
        ModelConfig::InceptionV3(init) => {
            let model = init.build(&vs)?;
            let input = Tensor::rand(&[batch_size, 3, height, width], options);
            let InceptionOutput { logits, extra } =
                tch::no_grad(|| model.forward_t(&input, false))?;
            match extra {
                InceptionExtra::Aux(Some(aux)) => vec![logits.size(), aux.size()],
                InceptionExtra::Aux(None) => vec![logits.size()],
                InceptionExtra::Feature(feature) => vec![logits.size(), feature.size()],
            }
        }
    };

    let num_params: i64 = vs
        .trainable_variables()
        .iter()
        .filter(|var| var.requires_grad())
        .map(|var| var.numel() as i64)
        .sum();
    info!(
        "output shapes: {}",
        output_shapes
            .iter()
            .map(|shape| format!("{:?}", shape))
            .join(", ")
    );
    info!("{} trainable parameters", num_params);

    if let Some(output) = output {
        vs.save(output)
            .with_context(|| format!("unable to save weights to {}", output.display()))?;
        info!("saved weights to {}", output.display());
    }

    Ok(())
}
