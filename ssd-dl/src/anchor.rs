//! Anchor generation over multiple feature map grids.

use crate::common::*;
use bbox::{prelude::*, CyCxHW, TLBR};

/// Produces the anchor boxes for a list of feature map grids.
pub trait AnchorGenerator: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// The number of anchors placed at each grid cell, one entry per
    /// feature map.
    fn num_anchors_per_location(&self) -> Vec<i64>;

    /// Generate `[A, 4]` anchors in normalized coordinates for the
    /// `(height, width)` feature map grids of an `im_height` x `im_width`
    /// input.
    ///
    /// Anchors are ordered by feature map, then grid row, then grid
    /// column, then anchor spec.
    fn generate(
        &self,
        feature_map_shape_list: &[(i64, i64)],
        im_height: i64,
        im_width: i64,
        device: Device,
    ) -> Result<BoxList>;
}

/// A `(scale, aspect_ratio)` pair placed at every cell of a grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxSpec {
    pub scale: f64,
    pub aspect_ratio: f64,
}

impl BoxSpec {
    pub fn new(scale: f64, aspect_ratio: f64) -> Self {
        Self {
            scale,
            aspect_ratio,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultipleGridAnchorGeneratorInit {
    pub box_specs_list: Vec<Vec<BoxSpec>>,
    pub base_anchor_size: [f64; 2],
    /// Per-grid `(stride_y, stride_x)`. Defaults to one cell in
    /// normalized coordinates.
    pub anchor_strides: Option<Vec<[f64; 2]>>,
    /// Per-grid `(offset_y, offset_x)`. Defaults to half a stride.
    pub anchor_offsets: Option<Vec<[f64; 2]>>,
}

impl MultipleGridAnchorGeneratorInit {
    pub fn build(self) -> Result<MultipleGridAnchorGenerator> {
        let Self {
            box_specs_list,
            base_anchor_size,
            anchor_strides,
            anchor_offsets,
        } = self;

        ensure!(!box_specs_list.is_empty(), "box_specs_list must not be empty");
        ensure!(
            box_specs_list.iter().all(|specs| !specs.is_empty()),
            "every feature map must have at least one box spec"
        );
        ensure!(
            box_specs_list.iter().flatten().all(|spec| spec.scale > 0.0 && spec.aspect_ratio > 0.0),
            "scales and aspect ratios must be positive"
        );
        ensure!(
            base_anchor_size.iter().all(|&size| size > 0.0),
            "base_anchor_size must be positive"
        );
        let num_layers = box_specs_list.len();
        if let Some(strides) = &anchor_strides {
            ensure!(
                strides.len() == num_layers,
                "expect {} anchor strides, but get {}",
                num_layers,
                strides.len()
            );
        }
        if let Some(offsets) = &anchor_offsets {
            ensure!(
                offsets.len() == num_layers,
                "expect {} anchor offsets, but get {}",
                num_layers,
                offsets.len()
            );
        }

        Ok(MultipleGridAnchorGenerator {
            box_specs_list,
            base_anchor_size,
            anchor_strides,
            anchor_offsets,
        })
    }
}

/// Tiles the box specs of each feature map over its grid.
#[derive(Debug, Clone)]
pub struct MultipleGridAnchorGenerator {
    box_specs_list: Vec<Vec<BoxSpec>>,
    base_anchor_size: [f64; 2],
    anchor_strides: Option<Vec<[f64; 2]>>,
    anchor_offsets: Option<Vec<[f64; 2]>>,
}

impl MultipleGridAnchorGenerator {
    pub fn box_specs_list(&self) -> &[Vec<BoxSpec>] {
        &self.box_specs_list
    }
}

impl AnchorGenerator for MultipleGridAnchorGenerator {
    fn name(&self) -> &str {
        "MultipleGridAnchorGenerator"
    }

    fn num_anchors_per_location(&self) -> Vec<i64> {
        self.box_specs_list
            .iter()
            .map(|specs| specs.len() as i64)
            .collect()
    }

    fn generate(
        &self,
        feature_map_shape_list: &[(i64, i64)],
        im_height: i64,
        im_width: i64,
        device: Device,
    ) -> Result<BoxList> {
        ensure!(
            feature_map_shape_list.len() == self.box_specs_list.len(),
            "expect {} feature map shapes, but get {}",
            self.box_specs_list.len(),
            feature_map_shape_list.len()
        );
        ensure!(
            feature_map_shape_list.iter().all(|&(h, w)| h > 0 && w > 0),
            "feature map shapes must be positive, but get {:?}",
            feature_map_shape_list
        );
        ensure!(
            im_height > 0 && im_width > 0,
            "image size must be positive, but get {}x{}",
            im_height,
            im_width
        );

        // rescale the base size so that anchors stay square on non-square inputs
        let min_im_size = im_height.min(im_width) as f64;
        let base_anchor_size = [
            min_im_size / im_height as f64 * self.base_anchor_size[0],
            min_im_size / im_width as f64 * self.base_anchor_size[1],
        ];

        let mut coords: Vec<f32> = vec![];

        for (index, (&(grid_h, grid_w), specs)) in feature_map_shape_list
            .iter()
            .zip_eq(&self.box_specs_list)
            .enumerate()
        {
            let [stride_y, stride_x] = self
                .anchor_strides
                .as_ref()
                .map(|strides| strides[index])
                .unwrap_or([1.0 / grid_h as f64, 1.0 / grid_w as f64]);
            let [offset_y, offset_x] = self
                .anchor_offsets
                .as_ref()
                .map(|offsets| offsets[index])
                .unwrap_or([0.5 * stride_y, 0.5 * stride_x]);

            for row in 0..grid_h {
                let cy = row as f64 * stride_y + offset_y;

                for col in 0..grid_w {
                    let cx = col as f64 * stride_x + offset_x;

                    for spec in specs {
                        let anchor = CyCxHW::try_from_scale_aspect_ratio(
                            cy,
                            cx,
                            spec.scale,
                            spec.aspect_ratio,
                            base_anchor_size,
                        )?;
                        let tlbr: TLBR<f64> = anchor.into();
                        coords.extend(tlbr.tlbr().iter().map(|&value| value as f32));
                    }
                }
            }
        }

        let anchors = Tensor::of_slice(&coords).view([-1, 4]).to_device(device);
        BoxList::new(anchors)
    }
}

/// Builds the box specs of the standard SSD anchor layout.
#[derive(Debug, Clone)]
pub struct SsdAnchorsInit {
    pub num_layers: usize,
    pub min_scale: f64,
    pub max_scale: f64,
    /// Explicit per-layer scales. Overrides `min_scale` and `max_scale`.
    pub scales: Option<Vec<f64>>,
    pub aspect_ratios: Vec<f64>,
    /// Aspect ratio of the extra anchor whose scale is the geometric mean of
    /// adjacent layer scales. Disabled when not positive.
    pub interpolated_scale_aspect_ratio: f64,
    pub base_anchor_size: [f64; 2],
    pub anchor_strides: Option<Vec<[f64; 2]>>,
    pub anchor_offsets: Option<Vec<[f64; 2]>>,
    /// Use only three fixed anchors on the first layer.
    pub reduce_boxes_in_lowest_layer: bool,
}

impl Default for SsdAnchorsInit {
    fn default() -> Self {
        Self {
            num_layers: 6,
            min_scale: 0.2,
            max_scale: 0.95,
            scales: None,
            aspect_ratios: vec![1.0, 2.0, 3.0, 1.0 / 2.0, 1.0 / 3.0],
            interpolated_scale_aspect_ratio: 1.0,
            base_anchor_size: [1.0, 1.0],
            anchor_strides: None,
            anchor_offsets: None,
            reduce_boxes_in_lowest_layer: true,
        }
    }
}

impl SsdAnchorsInit {
    /// The per-layer scales followed by the trailing scale `1.0`.
    pub fn layer_scales(&self) -> Result<Vec<f64>> {
        let Self {
            num_layers,
            min_scale,
            max_scale,
            ref scales,
            ..
        } = *self;

        ensure!(num_layers > 0, "num_layers must be positive");

        let mut scales = match scales {
            Some(scales) if !scales.is_empty() => {
                ensure!(
                    scales.len() == num_layers,
                    "expect {} scales, but get {}",
                    num_layers,
                    scales.len()
                );
                scales.clone()
            }
            _ => {
                ensure!(
                    0.0 < min_scale && min_scale <= max_scale,
                    "expect 0 < min_scale <= max_scale, but get min_scale={} and max_scale={}",
                    min_scale,
                    max_scale
                );
                if num_layers == 1 {
                    vec![min_scale]
                } else {
                    (0..num_layers)
                        .map(|layer| {
                            min_scale
                                + (max_scale - min_scale) * layer as f64 / (num_layers - 1) as f64
                        })
                        .collect()
                }
            }
        };
        scales.push(1.0);
        Ok(scales)
    }

    pub fn box_specs_list(&self) -> Result<Vec<Vec<BoxSpec>>> {
        let scales = self.layer_scales()?;

        let box_specs_list = scales
            .iter()
            .tuple_windows()
            .enumerate()
            .map(|(layer, (&scale, &scale_next))| {
                if layer == 0 && self.reduce_boxes_in_lowest_layer {
                    vec![
                        BoxSpec::new(0.1, 1.0),
                        BoxSpec::new(scale, 2.0),
                        BoxSpec::new(scale, 0.5),
                    ]
                } else {
                    let mut specs: Vec<_> = self
                        .aspect_ratios
                        .iter()
                        .map(|&aspect_ratio| BoxSpec::new(scale, aspect_ratio))
                        .collect();
                    if self.interpolated_scale_aspect_ratio > 0.0 {
                        specs.push(BoxSpec::new(
                            (scale * scale_next).sqrt(),
                            self.interpolated_scale_aspect_ratio,
                        ));
                    }
                    specs
                }
            })
            .collect();
        Ok(box_specs_list)
    }

    pub fn build(self) -> Result<MultipleGridAnchorGenerator> {
        let box_specs_list = self.box_specs_list()?;
        let Self {
            base_anchor_size,
            anchor_strides,
            anchor_offsets,
            ..
        } = self;

        MultipleGridAnchorGeneratorInit {
            box_specs_list,
            base_anchor_size,
            anchor_strides,
            anchor_offsets,
        }
        .build()
    }
}

/// Serialized form of [SsdAnchorsInit].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorGeneratorConfig {
    pub num_layers: usize,
    pub min_scale: R64,
    pub max_scale: R64,
    pub scales: Option<Vec<R64>>,
    pub aspect_ratios: Vec<R64>,
    pub interpolated_scale_aspect_ratio: R64,
    pub base_anchor_size: [R64; 2],
    pub anchor_strides: Option<Vec<[R64; 2]>>,
    pub anchor_offsets: Option<Vec<[R64; 2]>>,
    pub reduce_boxes_in_lowest_layer: bool,
}

impl Default for AnchorGeneratorConfig {
    fn default() -> Self {
        let init = SsdAnchorsInit::default();
        Self {
            num_layers: init.num_layers,
            min_scale: r64(init.min_scale),
            max_scale: r64(init.max_scale),
            scales: None,
            aspect_ratios: init.aspect_ratios.into_iter().map(r64).collect(),
            interpolated_scale_aspect_ratio: r64(init.interpolated_scale_aspect_ratio),
            base_anchor_size: init.base_anchor_size.map(r64),
            anchor_strides: None,
            anchor_offsets: None,
            reduce_boxes_in_lowest_layer: init.reduce_boxes_in_lowest_layer,
        }
    }
}

impl AnchorGeneratorConfig {
    pub fn build(&self) -> Result<Box<dyn AnchorGenerator>> {
        let raw_pairs = |pairs: &Option<Vec<[R64; 2]>>| {
            pairs
                .as_ref()
                .map(|pairs| pairs.iter().map(|pair| pair.map(|v| v.raw())).collect())
        };

        let generator = SsdAnchorsInit {
            num_layers: self.num_layers,
            min_scale: self.min_scale.raw(),
            max_scale: self.max_scale.raw(),
            scales: self
                .scales
                .as_ref()
                .map(|scales| scales.iter().map(|scale| scale.raw()).collect()),
            aspect_ratios: self.aspect_ratios.iter().map(|ratio| ratio.raw()).collect(),
            interpolated_scale_aspect_ratio: self.interpolated_scale_aspect_ratio.raw(),
            base_anchor_size: self.base_anchor_size.map(|size| size.raw()),
            anchor_strides: raw_pairs(&self.anchor_strides),
            anchor_offsets: raw_pairs(&self.anchor_offsets),
            reduce_boxes_in_lowest_layer: self.reduce_boxes_in_lowest_layer,
        }
        .build()?;
        Ok(Box::new(generator))
    }
}
