//! The input modes of an exported detector.

use crate::common::*;

/// How an exported detector receives its images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// `[B, H, W, 3]` uint8 pixels.
    ImageTensor,
    /// PNG or JPEG encoded images.
    EncodedImageStringTensor,
    /// Records holding the encoded image and the secondary input.
    TfExample,
}

impl InputType {
    pub const ALL: [Self; 3] = [
        Self::ImageTensor,
        Self::EncodedImageStringTensor,
        Self::TfExample,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImageTensor => "image_tensor",
            Self::EncodedImageStringTensor => "encoded_image_string_tensor",
            Self::TfExample => "tf_example",
        }
    }
}

impl Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputType {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|input_type| input_type.as_str() == text)
            .ok_or_else(|| {
                format_err!(
                    "unknown input type '{}', expect one of {}",
                    text,
                    Self::ALL.iter().join(", ")
                )
            })
    }
}

/// Parse a comma-separated `B,H,W,C` shape. `-1` leaves a dimension open.
pub fn parse_input_shape(text: &str) -> Result<Vec<i64>> {
    let shape: Vec<i64> = text
        .split(',')
        .map(|dim| {
            let dim = dim.trim();
            dim.parse()
                .with_context(|| format!("invalid dimension '{}' in input shape '{}'", dim, text))
        })
        .try_collect()?;
    ensure!(
        shape.len() == 4,
        "the input shape must have 4 dimensions, but get '{}'",
        text
    );
    ensure!(
        shape.iter().all(|&dim| dim == -1 || dim > 0),
        "input shape dimensions must be positive or -1, but get '{}'",
        text
    );
    ensure!(
        shape[3] == 3 || shape[3] == -1,
        "the input shape must have 3 channels, but get '{}'",
        text
    );
    Ok(shape)
}

/// Fixed shapes apply to `image_tensor` inputs only.
pub fn validate_input_shape(input_type: InputType, input_shape: Option<&[i64]>) -> Result<()> {
    if input_shape.is_some() {
        ensure!(
            input_type == InputType::ImageTensor,
            "can only specify input shape for 'image_tensor' inputs, but the input type is '{}'",
            input_type
        );
    }
    Ok(())
}

/// Check a `[B, H, W, C]` tensor against a declared shape.
pub fn check_input_shape(input_shape: &[i64], actual: &[i64]) -> Result<()> {
    let matches = input_shape.len() == actual.len()
        && input_shape
            .iter()
            .zip(actual)
            .all(|(&expect, &actual)| expect == -1 || expect == actual);
    ensure!(
        matches,
        "the input must have shape {:?}, but get {:?}",
        input_shape,
        actual
    );
    Ok(())
}
