use crate::common::*;

pub trait TensorExt {
    fn unzip_first(&self) -> Option<Vec<Tensor>>;

    /// Resize a float `[batch, channels, height, width]` tensor with
    /// bilinear interpolation.
    fn f_resize_bilinear(&self, new_height: i64, new_width: i64) -> Result<Tensor>;

    /// Zero-pad the bottom and right sides of a `[batch, channels, height, width]`
    /// tensor so that the height and width are multiples of `multiple`.
    fn f_pad_to_multiple(&self, multiple: i64) -> Result<Tensor>;

    /// Repeat a tensor `batch_size` times along a new leading dimension.
    fn f_tile_batch(&self, batch_size: i64) -> Result<Tensor>;

    /// Returns the size of the tensor, or an error mentioning `name` if the
    /// rank does not match.
    fn f_size_of_rank(&self, rank: usize, name: &str) -> Result<Vec<i64>>;
}

impl TensorExt for Tensor {
    fn unzip_first(&self) -> Option<Vec<Tensor>> {
        let first_dim = *self.size().first()?;
        let tensors: Vec<_> = (0..first_dim).map(|index| self.select(0, index)).collect();
        Some(tensors)
    }

    fn f_resize_bilinear(&self, new_height: i64, new_width: i64) -> Result<Tensor> {
        ensure!(
            new_height > 0 && new_width > 0,
            "the target size must be positive"
        );
        let (_batch_size, _channels, height, width) = self.size4()?;
        if (height, width) == (new_height, new_width) {
            return Ok(self.shallow_clone());
        }
        let resized = self.to_kind(Kind::Float).f_upsample_bilinear2d(
            &[new_height, new_width],
            false,
            None::<f64>,
            None::<f64>,
        )?;
        Ok(resized)
    }

    fn f_pad_to_multiple(&self, multiple: i64) -> Result<Tensor> {
        ensure!(multiple > 0, "multiple must be positive");
        let (batch_size, channels, height, width) = self.size4()?;
        let padded_height = (height + multiple - 1) / multiple * multiple;
        let padded_width = (width + multiple - 1) / multiple * multiple;
        if (padded_height, padded_width) == (height, width) {
            return Ok(self.shallow_clone());
        }

        let padded = Tensor::f_zeros(
            &[batch_size, channels, padded_height, padded_width],
            (self.kind(), self.device()),
        )?;
        let mut region = padded.f_narrow(2, 0, height)?.f_narrow(3, 0, width)?;
        region.f_copy_(self)?;
        Ok(padded)
    }

    fn f_tile_batch(&self, batch_size: i64) -> Result<Tensor> {
        ensure!(batch_size > 0, "batch_size must be positive");
        let mut shape = vec![batch_size];
        shape.extend(self.size());
        let tiled = self.f_unsqueeze(0)?.f_expand(&shape, false)?.contiguous();
        Ok(tiled)
    }

    fn f_size_of_rank(&self, rank: usize, name: &str) -> Result<Vec<i64>> {
        let size = self.size();
        ensure!(
            size.len() == rank,
            "{} must be a rank {} tensor, but get shape {:?}",
            name,
            rank,
            size
        );
        Ok(size)
    }
}
