use crate::common::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageResizerConfig {
    pub height: i64,
    pub width: i64,
}

impl Default for ImageResizerConfig {
    fn default() -> Self {
        Self {
            height: 300,
            width: 300,
        }
    }
}

impl ImageResizerConfig {
    pub fn build(&self, secondary_size: Option<[i64; 2]>) -> Result<ImageResizer> {
        let Self { height, width } = *self;
        ensure!(
            height > 0 && width > 0,
            "the resized image size must be positive, but get {}x{}",
            height,
            width
        );
        Ok(ImageResizer {
            size: [height, width],
            secondary_size,
        })
    }
}

/// Bilinearly resizes inputs to fixed shapes.
#[derive(Debug, Clone)]
pub struct ImageResizer {
    size: [i64; 2],
    secondary_size: Option<[i64; 2]>,
}

impl ImageResizer {
    /// The `[height, width]` images are resized to.
    pub fn size(&self) -> [i64; 2] {
        self.size
    }

    /// Resize `[B, C, H, W]` images.
    pub fn resize(&self, images: &Tensor) -> Result<Tensor> {
        let [height, width] = self.size;
        images.f_resize_bilinear(height, width)
    }

    /// Resize a `[B, 1, H, W]` secondary input. Inputs pass through when the
    /// extractor does not consume one.
    pub fn resize_secondary(&self, inputs: &Tensor) -> Result<Tensor> {
        match self.secondary_size {
            Some([height, width]) => inputs.f_resize_bilinear(height, width),
            None => Ok(inputs.shallow_clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_to_fixed_shapes() {
        let resizer = ImageResizerConfig {
            height: 64,
            width: 48,
        }
        .build(Some([20, 9]))
        .unwrap();

        let images = Tensor::rand(&[2, 3, 100, 80], (Kind::Float, Device::Cpu));
        assert_eq!(resizer.resize(&images).unwrap().size(), vec![2, 3, 64, 48]);

        let audio = Tensor::rand(&[2, 1, 40, 12], (Kind::Float, Device::Cpu));
        assert_eq!(
            resizer.resize_secondary(&audio).unwrap().size(),
            vec![2, 1, 20, 9]
        );
    }

    #[test]
    fn reject_empty_size() {
        let config = ImageResizerConfig {
            height: 0,
            width: 10,
        };
        assert!(config.build(None).is_err());
    }
}
