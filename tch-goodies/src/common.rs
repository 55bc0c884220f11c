pub use anyhow::{ensure, format_err, Error, Result};
pub use getset::Getters;
pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    convert::{TryFrom, TryInto},
};
pub use tch::{Device, IndexOp, Kind, Tensor};

pub type Fallible<T> = Result<T, Error>;
