pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use derivative::Derivative;
pub use getset::Getters;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use lazy_static::lazy_static;
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    collections::{HashMap, HashSet},
    fmt::{self, Debug},
    fs,
    iter,
    path::Path,
    sync::{Arc, Mutex},
};
pub use tch::{
    nn::{self, Module as _, ModuleT as _},
    Device, IndexOp, Kind, Tensor,
};
pub use tch_act::{Activation, TensorActivationExt as _};
pub use tch_goodies::{fields, BoxList, TensorExt as _};
pub use tch_tensor_like::TensorLike;

#[cfg(feature = "profiling")]
pub use dashmap::DashSet;
#[cfg(feature = "profiling")]
pub use std::time::{Duration, Instant};

pub type Fallible<T> = Result<T, Error>;

unzip_n::unzip_n!(pub 2);
unzip_n::unzip_n!(pub 3);
unzip_n::unzip_n!(pub 6);
