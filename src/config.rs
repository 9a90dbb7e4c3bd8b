use crate::{
    common::*,
    model::{
        DepthMode, GeneratorInit, GlobalGeneratorInit, InceptionV3Init, SpadeGeneratorInit,
    },
};
use std::num::NonZeroUsize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    pub input: Input,
    pub model: ModelConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        Ok(config)
    }
}

/// Shape of the random input fed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub batch_size: NonZeroUsize,
    pub height: NonZeroUsize,
    pub width: NonZeroUsize,
    #[serde(default)]
    pub depth_mode: DepthMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelConfig {
    Generator(GeneratorInit),
    SpadeGenerator(SpadeGeneratorInit),
    GlobalGenerator(GlobalGeneratorInit),
    InceptionV3(InceptionV3Init),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NormKind, OutputActivation, PaddingKind, SpadeConfig};

    #[test]
    fn parse_spade_generator_config() -> Result<()> {
        let config: Config = json5::from_str(
            r#"{
                device: "cpu",
                input: { batch_size: 2, height: 64, width: 48, depth_mode: "keep" },
                model: {
                    spade_generator: {
                        input_channels: 3,
                        output_channels: 1,
                        spade: "spadebatch5x5",
                    },
                },
            }"#,
        )?;

        ensure!(config.device == Device::Cpu);
        ensure!(config.input.depth_mode == DepthMode::Keep);
        match config.model {
            ModelConfig::SpadeGenerator(init) => {
                ensure!(init.output_channels == 1);
                ensure!(init.num_residual_blocks == 9);
                ensure!(init.base_channels == 64);
                ensure!(init.label_channels == 3);
                ensure!(init.norm_kind == NormKind::InstanceNorm);
                ensure!(
                    init.spade
                        == SpadeConfig {
                            norm_kind: NormKind::BatchNorm,
                            ksize: 5
                        }
                );
            }
            _ => bail!("expect a SPADE generator config"),
        }
        Ok(())
    }

    #[test]
    fn parse_global_generator_config() -> Result<()> {
        let config: Config = json5::from_str(
            r#"{
                device: "cpu",
                input: { batch_size: 1, height: 8, width: 8 },
                model: {
                    global_generator: {
                        input_channels: 3,
                        output_channels: 3,
                        padding_kind: "replicate",
                        activation: "sigmoid",
                    },
                },
            }"#,
        )?;

        ensure!(config.input.depth_mode == DepthMode::RandomDrop);
        match config.model {
            ModelConfig::GlobalGenerator(init) => {
                ensure!(init.num_downsampling == 3);
                ensure!(init.num_upsampling == 0);
                ensure!(init.norm_kind == NormKind::BatchNorm);
                ensure!(init.padding_kind == PaddingKind::Replicate);
                ensure!(init.activation == OutputActivation::Sigmoid);
            }
            _ => bail!("expect a global generator config"),
        }
        Ok(())
    }

    #[test]
    fn reject_bad_model_strings() -> Result<()> {
        let bad_spade = r#"{
            device: "cpu",
            input: { batch_size: 1, height: 8, width: 8 },
            model: { spade_generator: { input_channels: 3, output_channels: 3, spade: "spadefoo3x3" } },
        }"#;
        ensure!(json5::from_str::<Config>(bad_spade).is_err());

        let bad_padding = r#"{
            device: "cpu",
            input: { batch_size: 1, height: 8, width: 8 },
            model: { global_generator: { input_channels: 3, output_channels: 3, padding_kind: "circular" } },
        }"#;
        ensure!(json5::from_str::<Config>(bad_padding).is_err());
        Ok(())
    }
}
