pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use itertools::Itertools;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::HashMap,
    fs, iter,
    path::{Path, PathBuf},
    str::FromStr,
};
pub use structopt::StructOpt;
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, ModuleT},
    Device, Kind, Tensor,
};
pub use tracing::{debug, info, warn};
