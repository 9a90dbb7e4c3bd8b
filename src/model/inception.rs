//! Inception v3 used as a feature extractor.
//!
//! Variables follow torchvision's naming so that converted checkpoints load
//! by name. Both classification heads are replaced by fresh linear layers
//! sized for `num_classes`.

use super::conv_bn::{ConvBn, ConvBnInit};
use crate::common::*;

/// Children of the network in torchvision's enumeration order.
pub const CHILDREN: [&str; 22] = [
    "Conv2d_1a_3x3",
    "Conv2d_2a_3x3",
    "Conv2d_2b_3x3",
    "maxpool1",
    "Conv2d_3b_1x1",
    "Conv2d_4a_3x3",
    "maxpool2",
    "Mixed_5b",
    "Mixed_5c",
    "Mixed_5d",
    "Mixed_6a",
    "Mixed_6b",
    "Mixed_6c",
    "Mixed_6d",
    "Mixed_6e",
    "AuxLogits",
    "Mixed_7a",
    "Mixed_7b",
    "Mixed_7c",
    "avgpool",
    "dropout",
    "fc",
];

/// Number of leading children frozen when fine-tuning from pretrained weights.
pub const NUM_FROZEN_CHILDREN: usize = 17;

/// Heads replaced after loading, never taken from a checkpoint.
const REPLACED_HEADS: [&str; 2] = ["fc.", "AuxLogits.fc."];

const NUM_AUX_FEATURES: i64 = 768;
const NUM_FEATURES: i64 = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InceptionV3Init {
    pub num_classes: usize,
    #[serde(default = "default_use_aux")]
    pub use_aux: bool,
    /// Checkpoint in libtorch's `.ot` format.
    #[serde(default)]
    pub pretrained: Option<PathBuf>,
    #[serde(default = "default_freeze")]
    pub freeze: bool,
    #[serde(default)]
    pub every_feat: bool,
}

impl InceptionV3Init {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            use_aux: default_use_aux(),
            pretrained: None,
            freeze: default_freeze(),
            every_feat: false,
        }
    }

    /// Builds the network at the root of `vs`, then loads and freezes the
    /// pretrained weights if a checkpoint is given.
    pub fn build(self, vs: &nn::VarStore) -> Result<InceptionV3> {
        let Self {
            num_classes,
            use_aux,
            pretrained,
            freeze,
            every_feat,
        } = self;
        ensure!(num_classes > 0, "num_classes must be positive");
        let root = vs.root();
        let path = &root;
        let num_classes = num_classes as i64;

        let model = InceptionV3 {
            conv2d_1a: ConvBnInit::with_stride(3, 2).build(path / "Conv2d_1a_3x3", 3, 32),
            conv2d_2a: ConvBnInit::new(3).build(path / "Conv2d_2a_3x3", 32, 32),
            conv2d_2b: ConvBnInit::with_padding(3, 1).build(path / "Conv2d_2b_3x3", 32, 64),
            conv2d_3b: ConvBnInit::new(1).build(path / "Conv2d_3b_1x1", 64, 80),
            conv2d_4a: ConvBnInit::new(3).build(path / "Conv2d_4a_3x3", 80, 192),
            mixed_5b: InceptionA::new(path / "Mixed_5b", 192, 32),
            mixed_5c: InceptionA::new(path / "Mixed_5c", 256, 64),
            mixed_5d: InceptionA::new(path / "Mixed_5d", 288, 64),
            mixed_6a: InceptionB::new(path / "Mixed_6a", 288),
            mixed_6b: InceptionC::new(path / "Mixed_6b", 768, 128),
            mixed_6c: InceptionC::new(path / "Mixed_6c", 768, 160),
            mixed_6d: InceptionC::new(path / "Mixed_6d", 768, 160),
            mixed_6e: InceptionC::new(path / "Mixed_6e", 768, 192),
            aux_logits: InceptionAux::new(path / "AuxLogits", NUM_AUX_FEATURES, num_classes),
            mixed_7a: InceptionD::new(path / "Mixed_7a", 768),
            mixed_7b: InceptionE::new(path / "Mixed_7b", 1280),
            mixed_7c: InceptionE::new(path / "Mixed_7c", 2048),
            fc: nn::linear(path / "fc", NUM_FEATURES, num_classes, Default::default()),
            use_aux,
            every_feat,
        };

        if let Some(pretrained) = pretrained {
            load_pretrained(vs, &pretrained)?;
            if freeze {
                freeze_children(vs);
            }
        }

        Ok(model)
    }
}

/// Second output next to the classification logits.
#[derive(Debug)]
pub enum InceptionExtra {
    /// Auxiliary logits, present in training mode when the auxiliary head is enabled.
    Aux(Option<Tensor>),
    /// Activation of Mixed_6b, N×768×17×17 for 299×299 inputs.
    Feature(Tensor),
}

#[derive(Debug)]
pub struct InceptionOutput {
    pub logits: Tensor,
    pub extra: InceptionExtra,
}

#[derive(Debug)]
pub struct InceptionV3 {
    conv2d_1a: ConvBn,
    conv2d_2a: ConvBn,
    conv2d_2b: ConvBn,
    conv2d_3b: ConvBn,
    conv2d_4a: ConvBn,
    mixed_5b: InceptionA,
    mixed_5c: InceptionA,
    mixed_5d: InceptionA,
    mixed_6a: InceptionB,
    mixed_6b: InceptionC,
    mixed_6c: InceptionC,
    mixed_6d: InceptionC,
    mixed_6e: InceptionC,
    aux_logits: InceptionAux,
    mixed_7a: InceptionD,
    mixed_7b: InceptionE,
    mixed_7c: InceptionE,
    fc: nn::Linear,
    use_aux: bool,
    every_feat: bool,
}

impl InceptionV3 {
    pub fn every_feat(&self) -> bool {
        self.every_feat
    }

    pub fn set_every_feat(&mut self, every_feat: bool) {
        self.every_feat = every_feat;
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<InceptionOutput> {
        let (_, channels, _, _) = input.size4()?;
        ensure!(
            channels == 3,
            "expect an RGB input, but get {} channels",
            channels
        );

        let xs = input
            .apply_t(&self.conv2d_1a, train)
            .apply_t(&self.conv2d_2a, train)
            .apply_t(&self.conv2d_2b, train)
            .max_pool2d(&[3, 3], &[2, 2], &[0, 0], &[1, 1], false)
            .apply_t(&self.conv2d_3b, train)
            .apply_t(&self.conv2d_4a, train)
            .max_pool2d(&[3, 3], &[2, 2], &[0, 0], &[1, 1], false)
            .apply_t(&self.mixed_5b, train)
            .apply_t(&self.mixed_5c, train)
            .apply_t(&self.mixed_5d, train)
            .apply_t(&self.mixed_6a, train)
            .apply_t(&self.mixed_6b, train);
        let feature = self.every_feat.then(|| xs.shallow_clone());

        let xs = xs
            .apply_t(&self.mixed_6c, train)
            .apply_t(&self.mixed_6d, train)
            .apply_t(&self.mixed_6e, train);

        let aux = (train && self.use_aux).then(|| xs.apply_t(&self.aux_logits, train));

        let logits = xs
            .apply_t(&self.mixed_7a, train)
            .apply_t(&self.mixed_7b, train)
            .apply_t(&self.mixed_7c, train)
            .adaptive_avg_pool2d(&[1, 1])
            .dropout(0.5, train)
            .flatten(1, -1)
            .apply(&self.fc);

        let extra = match feature {
            Some(feature) => InceptionExtra::Feature(feature),
            None => InceptionExtra::Aux(aux),
        };

        Ok(InceptionOutput { logits, extra })
    }
}

/// Copies the variables of a libtorch checkpoint into `vs` by name. The
/// replaced classification heads keep their fresh initialization.
pub fn load_pretrained(vs: &nn::VarStore, file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    let pretrained: HashMap<String, Tensor> = Tensor::load_multi(file)
        .with_context(|| format!("unable to load pretrained weights from {}", file.display()))?
        .into_iter()
        .collect();

    let mut variables = vs.variables();
    let num_loaded = tch::no_grad(|| -> Result<_> {
        let mut num_loaded = 0;

        for (name, var) in variables.iter_mut() {
            if is_replaced_head(name) {
                continue;
            }

            let src = pretrained
                .get(name)
                .ok_or_else(|| format_err!("{} is missing in {}", name, file.display()))?;
            ensure!(
                src.size() == var.size(),
                "{} has shape {:?} in {}, but the model expects {:?}",
                name,
                src.size(),
                file.display(),
                var.size()
            );
            var.copy_(src);
            num_loaded += 1;
        }

        Ok(num_loaded)
    })?;

    info!(
        "loaded {} pretrained tensors from {}",
        num_loaded,
        file.display()
    );
    Ok(())
}

/// Disables gradients for the first [NUM_FROZEN_CHILDREN] children, the
/// freshly created auxiliary head excepted.
pub fn freeze_children(vs: &nn::VarStore) {
    let frozen = &CHILDREN[..NUM_FROZEN_CHILDREN];
    let mut num_frozen = 0;

    for (name, var) in vs.variables() {
        let child = name.split('.').next().unwrap_or("");
        if frozen.contains(&child) && !is_replaced_head(&name) {
            let _ = var.set_requires_grad(false);
            num_frozen += 1;
        }
    }

    debug!(
        "froze {} tensors in the first {} children",
        num_frozen, NUM_FROZEN_CHILDREN
    );
}

fn is_replaced_head(name: &str) -> bool {
    REPLACED_HEADS.iter().any(|prefix| name.starts_with(prefix))
}

fn avg_pool_3x3(xs: &Tensor) -> Tensor {
    xs.avg_pool2d(&[3, 3], &[1, 1], &[1, 1], false, true, None::<i64>)
}

fn max_pool_3x3_s2(xs: &Tensor) -> Tensor {
    xs.max_pool2d(&[3, 3], &[2, 2], &[0, 0], &[1, 1], false)
}

#[derive(Debug)]
struct InceptionA {
    branch1x1: ConvBn,
    branch5x5_1: ConvBn,
    branch5x5_2: ConvBn,
    branch3x3dbl_1: ConvBn,
    branch3x3dbl_2: ConvBn,
    branch3x3dbl_3: ConvBn,
    branch_pool: ConvBn,
}

impl InceptionA {
    fn new(path: nn::Path, in_c: i64, pool_c: i64) -> Self {
        let path = &path;
        Self {
            branch1x1: ConvBnInit::new(1).build(path / "branch1x1", in_c, 64),
            branch5x5_1: ConvBnInit::new(1).build(path / "branch5x5_1", in_c, 48),
            branch5x5_2: ConvBnInit::with_padding(5, 2).build(path / "branch5x5_2", 48, 64),
            branch3x3dbl_1: ConvBnInit::new(1).build(path / "branch3x3dbl_1", in_c, 64),
            branch3x3dbl_2: ConvBnInit::with_padding(3, 1).build(path / "branch3x3dbl_2", 64, 96),
            branch3x3dbl_3: ConvBnInit::with_padding(3, 1).build(path / "branch3x3dbl_3", 96, 96),
            branch_pool: ConvBnInit::new(1).build(path / "branch_pool", in_c, pool_c),
        }
    }
}

impl nn::ModuleT for InceptionA {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let b1 = xs.apply_t(&self.branch1x1, train);
        let b2 = xs
            .apply_t(&self.branch5x5_1, train)
            .apply_t(&self.branch5x5_2, train);
        let b3 = xs
            .apply_t(&self.branch3x3dbl_1, train)
            .apply_t(&self.branch3x3dbl_2, train)
            .apply_t(&self.branch3x3dbl_3, train);
        let b4 = avg_pool_3x3(xs).apply_t(&self.branch_pool, train);
        Tensor::cat(&[b1, b2, b3, b4], 1)
    }
}

#[derive(Debug)]
struct InceptionB {
    branch3x3: ConvBn,
    branch3x3dbl_1: ConvBn,
    branch3x3dbl_2: ConvBn,
    branch3x3dbl_3: ConvBn,
}

impl InceptionB {
    fn new(path: nn::Path, in_c: i64) -> Self {
        let path = &path;
        Self {
            branch3x3: ConvBnInit::with_stride(3, 2).build(path / "branch3x3", in_c, 384),
            branch3x3dbl_1: ConvBnInit::new(1).build(path / "branch3x3dbl_1", in_c, 64),
            branch3x3dbl_2: ConvBnInit::with_padding(3, 1).build(path / "branch3x3dbl_2", 64, 96),
            branch3x3dbl_3: ConvBnInit::with_stride(3, 2).build(path / "branch3x3dbl_3", 96, 96),
        }
    }
}

impl nn::ModuleT for InceptionB {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let b1 = xs.apply_t(&self.branch3x3, train);
        let b2 = xs
            .apply_t(&self.branch3x3dbl_1, train)
            .apply_t(&self.branch3x3dbl_2, train)
            .apply_t(&self.branch3x3dbl_3, train);
        let b3 = max_pool_3x3_s2(xs);
        Tensor::cat(&[b1, b2, b3], 1)
    }
}

#[derive(Debug)]
struct InceptionC {
    branch1x1: ConvBn,
    branch7x7_1: ConvBn,
    branch7x7_2: ConvBn,
    branch7x7_3: ConvBn,
    branch7x7dbl_1: ConvBn,
    branch7x7dbl_2: ConvBn,
    branch7x7dbl_3: ConvBn,
    branch7x7dbl_4: ConvBn,
    branch7x7dbl_5: ConvBn,
    branch_pool: ConvBn,
}

impl InceptionC {
    fn new(path: nn::Path, in_c: i64, c7: i64) -> Self {
        let path = &path;
        Self {
            branch1x1: ConvBnInit::new(1).build(path / "branch1x1", in_c, 192),
            branch7x7_1: ConvBnInit::new(1).build(path / "branch7x7_1", in_c, c7),
            branch7x7_2: ConvBnInit::rect(1, 7).build(path / "branch7x7_2", c7, c7),
            branch7x7_3: ConvBnInit::rect(7, 1).build(path / "branch7x7_3", c7, 192),
            branch7x7dbl_1: ConvBnInit::new(1).build(path / "branch7x7dbl_1", in_c, c7),
            branch7x7dbl_2: ConvBnInit::rect(7, 1).build(path / "branch7x7dbl_2", c7, c7),
            branch7x7dbl_3: ConvBnInit::rect(1, 7).build(path / "branch7x7dbl_3", c7, c7),
            branch7x7dbl_4: ConvBnInit::rect(7, 1).build(path / "branch7x7dbl_4", c7, c7),
            branch7x7dbl_5: ConvBnInit::rect(1, 7).build(path / "branch7x7dbl_5", c7, 192),
            branch_pool: ConvBnInit::new(1).build(path / "branch_pool", in_c, 192),
        }
    }
}

impl nn::ModuleT for InceptionC {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let b1 = xs.apply_t(&self.branch1x1, train);
        let b2 = xs
            .apply_t(&self.branch7x7_1, train)
            .apply_t(&self.branch7x7_2, train)
            .apply_t(&self.branch7x7_3, train);
        let b3 = xs
            .apply_t(&self.branch7x7dbl_1, train)
            .apply_t(&self.branch7x7dbl_2, train)
            .apply_t(&self.branch7x7dbl_3, train)
            .apply_t(&self.branch7x7dbl_4, train)
            .apply_t(&self.branch7x7dbl_5, train);
        let b4 = avg_pool_3x3(xs).apply_t(&self.branch_pool, train);
        Tensor::cat(&[b1, b2, b3, b4], 1)
    }
}

#[derive(Debug)]
struct InceptionD {
    branch3x3_1: ConvBn,
    branch3x3_2: ConvBn,
    branch7x7x3_1: ConvBn,
    branch7x7x3_2: ConvBn,
    branch7x7x3_3: ConvBn,
    branch7x7x3_4: ConvBn,
}

impl InceptionD {
    fn new(path: nn::Path, in_c: i64) -> Self {
        let path = &path;
        Self {
            branch3x3_1: ConvBnInit::new(1).build(path / "branch3x3_1", in_c, 192),
            branch3x3_2: ConvBnInit::with_stride(3, 2).build(path / "branch3x3_2", 192, 320),
            branch7x7x3_1: ConvBnInit::new(1).build(path / "branch7x7x3_1", in_c, 192),
            branch7x7x3_2: ConvBnInit::rect(1, 7).build(path / "branch7x7x3_2", 192, 192),
            branch7x7x3_3: ConvBnInit::rect(7, 1).build(path / "branch7x7x3_3", 192, 192),
            branch7x7x3_4: ConvBnInit::with_stride(3, 2).build(path / "branch7x7x3_4", 192, 192),
        }
    }
}

impl nn::ModuleT for InceptionD {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let b1 = xs
            .apply_t(&self.branch3x3_1, train)
            .apply_t(&self.branch3x3_2, train);
        let b2 = xs
            .apply_t(&self.branch7x7x3_1, train)
            .apply_t(&self.branch7x7x3_2, train)
            .apply_t(&self.branch7x7x3_3, train)
            .apply_t(&self.branch7x7x3_4, train);
        let b3 = max_pool_3x3_s2(xs);
        Tensor::cat(&[b1, b2, b3], 1)
    }
}

#[derive(Debug)]
struct InceptionE {
    branch1x1: ConvBn,
    branch3x3_1: ConvBn,
    branch3x3_2a: ConvBn,
    branch3x3_2b: ConvBn,
    branch3x3dbl_1: ConvBn,
    branch3x3dbl_2: ConvBn,
    branch3x3dbl_3a: ConvBn,
    branch3x3dbl_3b: ConvBn,
    branch_pool: ConvBn,
}

impl InceptionE {
    fn new(path: nn::Path, in_c: i64) -> Self {
        let path = &path;
        Self {
            branch1x1: ConvBnInit::new(1).build(path / "branch1x1", in_c, 320),
            branch3x3_1: ConvBnInit::new(1).build(path / "branch3x3_1", in_c, 384),
            branch3x3_2a: ConvBnInit::rect(1, 3).build(path / "branch3x3_2a", 384, 384),
            branch3x3_2b: ConvBnInit::rect(3, 1).build(path / "branch3x3_2b", 384, 384),
            branch3x3dbl_1: ConvBnInit::new(1).build(path / "branch3x3dbl_1", in_c, 448),
            branch3x3dbl_2: ConvBnInit::with_padding(3, 1).build(path / "branch3x3dbl_2", 448, 384),
            branch3x3dbl_3a: ConvBnInit::rect(1, 3).build(path / "branch3x3dbl_3a", 384, 384),
            branch3x3dbl_3b: ConvBnInit::rect(3, 1).build(path / "branch3x3dbl_3b", 384, 384),
            branch_pool: ConvBnInit::new(1).build(path / "branch_pool", in_c, 192),
        }
    }
}

impl nn::ModuleT for InceptionE {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let b1 = xs.apply_t(&self.branch1x1, train);

        let b2 = xs.apply_t(&self.branch3x3_1, train);
        let b2 = Tensor::cat(
            &[
                b2.apply_t(&self.branch3x3_2a, train),
                b2.apply_t(&self.branch3x3_2b, train),
            ],
            1,
        );

        let b3 = xs
            .apply_t(&self.branch3x3dbl_1, train)
            .apply_t(&self.branch3x3dbl_2, train);
        let b3 = Tensor::cat(
            &[
                b3.apply_t(&self.branch3x3dbl_3a, train),
                b3.apply_t(&self.branch3x3dbl_3b, train),
            ],
            1,
        );

        let b4 = avg_pool_3x3(xs).apply_t(&self.branch_pool, train);
        Tensor::cat(&[b1, b2, b3, b4], 1)
    }
}

#[derive(Debug)]
struct InceptionAux {
    conv0: ConvBn,
    conv1: ConvBn,
    fc: nn::Linear,
}

impl InceptionAux {
    fn new(path: nn::Path, in_c: i64, num_classes: i64) -> Self {
        let path = &path;
        Self {
            conv0: ConvBnInit::new(1).build(path / "conv0", in_c, 128),
            conv1: ConvBnInit::new(5).build(path / "conv1", 128, NUM_AUX_FEATURES),
            fc: nn::linear(
                path / "fc",
                NUM_AUX_FEATURES,
                num_classes,
                Default::default(),
            ),
        }
    }
}

impl nn::ModuleT for InceptionAux {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.avg_pool2d(&[5, 5], &[3, 3], &[0, 0], false, true, None::<i64>)
            .apply_t(&self.conv0, train)
            .apply_t(&self.conv1, train)
            .adaptive_avg_pool2d(&[1, 1])
            .flatten(1, -1)
            .apply(&self.fc)
    }
}

fn default_use_aux() -> bool {
    true
}

fn default_freeze() -> bool {
    true
}
