pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use image::DynamicImage;
pub use indexmap::IndexMap;
pub use itertools::Itertools as _;
pub use log::{debug, info, warn};
pub use once_cell::sync::Lazy;
pub use semver::{Version, VersionReq};
pub use serde::{de::Error as DeserializeError, Deserialize, Deserializer, Serialize};
pub use std::{
    collections::HashMap,
    fmt::{self, Debug, Display},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
pub use tch::{nn, Device, IndexOp, Kind, Tensor};
pub use tch_goodies::TensorExt as _;
pub use tch_tensor_like::TensorLike;
pub use tfrecord::{Example, ExampleIter, FeatureKind, RecordReaderConfig};
