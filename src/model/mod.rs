mod batch_norm;
mod conv_bn;
mod generator;
mod global_generator;
mod inception;
mod misc;
mod resnet_block;
mod spade;
mod spade_generator;

pub use batch_norm::*;
pub use conv_bn::*;
pub use generator::*;
pub use global_generator::*;
pub use inception::*;
pub use misc::*;
pub use resnet_block::*;
pub use spade::*;
pub use spade_generator::*;
