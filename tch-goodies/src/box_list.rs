//! Box collections with attached per-box fields.

use crate::common::*;

/// Well-known field names attached to a [BoxList].
pub mod fields {
    pub const SCORES: &str = "scores";
    pub const CLASSES: &str = "classes";
    pub const KEYPOINTS: &str = "keypoints";
}

/// An ordered collection of `N` boxes in `(ymin, xmin, ymax, xmax)` order,
/// together with named per-box tensors.
///
/// Every field tensor has leading dimension `N`. Fields can be added but
/// never removed.
#[derive(Debug, Getters)]
pub struct BoxList {
    /// The `[N, 4]` box tensor.
    #[get = "pub"]
    boxes: Tensor,
    fields: IndexMap<String, Tensor>,
}

impl BoxList {
    pub fn new(boxes: Tensor) -> Result<Self> {
        let (_num_boxes, num_coords) = boxes
            .size2()
            .map_err(|_| format_err!("boxes must be a 2D tensor, but get shape {:?}", boxes.size()))?;
        ensure!(
            num_coords == 4,
            "boxes must have 4 coordinates per row, but get {}",
            num_coords
        );
        ensure!(
            matches!(boxes.kind(), Kind::Float | Kind::Double | Kind::Half),
            "boxes must be a floating point tensor, but get {:?}",
            boxes.kind()
        );

        Ok(Self {
            boxes,
            fields: IndexMap::new(),
        })
    }

    /// Create an empty box list on the device.
    pub fn empty(device: Device) -> Self {
        Self {
            boxes: Tensor::zeros(&[0, 4], (Kind::Float, device)),
            fields: IndexMap::new(),
        }
    }

    pub fn num_boxes(&self) -> i64 {
        self.boxes.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.num_boxes() == 0
    }

    pub fn device(&self) -> Device {
        self.boxes.device()
    }

    pub fn add_field(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<()> {
        let name = name.into();
        let num_boxes = self.num_boxes();
        let leading_dim = tensor.size().first().cloned();

        ensure!(
            leading_dim == Some(num_boxes),
            "the leading dimension of field '{}' must be {}, but get shape {:?}",
            name,
            num_boxes,
            tensor.size()
        );
        ensure!(
            !self.fields.contains_key(&name),
            "the field '{}' already exists",
            name
        );

        self.fields.insert(name, tensor);
        Ok(())
    }

    pub fn with_field(mut self, name: impl Into<String>, tensor: Tensor) -> Result<Self> {
        self.add_field(name, tensor)?;
        Ok(self)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    pub fn get_field(&self, name: &str) -> Result<&Tensor> {
        self.fields
            .get(name)
            .ok_or_else(|| format_err!("the field '{}' does not exist", name))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|name| name.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.fields
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Select the boxes at `indices` along with all fields.
    pub fn gather(&self, indices: &Tensor) -> Result<Self> {
        let indices = indices.to_kind(Kind::Int64).to_device(self.device());
        let boxes = self.boxes.f_index_select(0, &indices)?;
        let fields: IndexMap<_, _> = self
            .fields
            .iter()
            .map(|(name, tensor)| -> Result<_> {
                Ok((name.clone(), tensor.f_index_select(0, &indices)?))
            })
            .try_collect()?;
        Ok(Self { boxes, fields })
    }

    /// Select the boxes where `mask` is true.
    pub fn boolean_mask(&self, mask: &Tensor) -> Result<Self> {
        ensure!(
            mask.size() == [self.num_boxes()],
            "the mask must have shape [{}], but get {:?}",
            self.num_boxes(),
            mask.size()
        );
        let indices = mask.nonzero().view([-1]);
        self.gather(&indices)
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            boxes: self.boxes.shallow_clone(),
            fields: self
                .fields
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.shallow_clone()))
                .collect(),
        }
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            boxes: self.boxes.to_device(device),
            fields: self
                .fields
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.to_device(device)))
                .collect(),
        }
    }

    /// The `(ymin, xmin, ymax, xmax)` columns, each of shape `[N]`.
    pub fn coordinates(&self) -> (Tensor, Tensor, Tensor, Tensor) {
        let boxes = &self.boxes;
        (
            boxes.select(1, 0),
            boxes.select(1, 1),
            boxes.select(1, 2),
            boxes.select(1, 3),
        )
    }

    /// The `(ycenter, xcenter, height, width)` columns, each of shape `[N]`.
    pub fn center_coordinates_and_sizes(&self) -> (Tensor, Tensor, Tensor, Tensor) {
        let (ymin, xmin, ymax, xmax) = self.coordinates();
        let height = &ymax - &ymin;
        let width = &xmax - &xmin;
        let ycenter = &ymin + &height / 2.0;
        let xcenter = &xmin + &width / 2.0;
        (ycenter, xcenter, height, width)
    }

    /// Box areas of shape `[N]`.
    pub fn area(&self) -> Tensor {
        let (ymin, xmin, ymax, xmax) = self.coordinates();
        (ymax - ymin) * (xmax - xmin)
    }

    /// Clip boxes to the `[ymin, xmin, ymax, xmax]` window. If
    /// `filter_nonoverlapping` is set, boxes left with zero area are
    /// removed along with their fields.
    pub fn clip_to_window(&self, window: [f64; 4], filter_nonoverlapping: bool) -> Result<Self> {
        let [win_ymin, win_xmin, win_ymax, win_xmax] = window;
        ensure!(
            win_ymin <= win_ymax && win_xmin <= win_xmax,
            "invalid clip window {:?}",
            window
        );

        let (ymin, xmin, ymax, xmax) = self.coordinates();
        let clipped = Tensor::f_stack(
            &[
                ymin.clamp(win_ymin, win_ymax),
                xmin.clamp(win_xmin, win_xmax),
                ymax.clamp(win_ymin, win_ymax),
                xmax.clamp(win_xmin, win_xmax),
            ],
            1,
        )?;
        let clipped = Self {
            boxes: clipped,
            fields: self
                .fields
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.shallow_clone()))
                .collect(),
        };

        if filter_nonoverlapping {
            let keep = clipped.area().gt(0.0);
            clipped.boolean_mask(&keep)
        } else {
            Ok(clipped)
        }
    }

    /// Re-express the boxes relative to the window, so that the window
    /// itself becomes `[0, 0, 1, 1]`.
    pub fn change_coordinate_frame(&self, window: [f64; 4]) -> Result<Self> {
        let [win_ymin, win_xmin, win_ymax, win_xmax] = window;
        let win_height = win_ymax - win_ymin;
        let win_width = win_xmax - win_xmin;
        ensure!(
            win_height > 0.0 && win_width > 0.0,
            "the window must have positive area, but get {:?}",
            window
        );

        let device = self.device();
        let kind = self.boxes.kind();
        let offset = Tensor::of_slice(&[win_ymin, win_xmin, win_ymin, win_xmin])
            .to_kind(kind)
            .to_device(device);
        let scale = Tensor::of_slice(&[win_height, win_width, win_height, win_width])
            .to_kind(kind)
            .to_device(device);
        let boxes = (&self.boxes - offset.view([1, 4])) / scale.view([1, 4]);

        Ok(Self {
            boxes,
            fields: self
                .fields
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.shallow_clone()))
                .collect(),
        })
    }

    /// Concatenate box lists that share the same field names.
    pub fn concatenate(lists: &[BoxList]) -> Result<Self> {
        let first = lists
            .first()
            .ok_or_else(|| format_err!("the list of box lists must not be empty"))?;
        let names: Vec<_> = first.field_names().map(|name| name.to_string()).collect();
        ensure!(
            lists
                .iter()
                .all(|list| list.field_names().eq(names.iter().map(|name| name.as_str()))),
            "all box lists must have the same fields"
        );

        let boxes: Vec<_> = lists.iter().map(|list| list.boxes.shallow_clone()).collect();
        let boxes = Tensor::f_cat(&boxes, 0)?;
        let fields: IndexMap<_, _> = names
            .into_iter()
            .map(|name| -> Result<_> {
                let tensors: Vec<_> = lists
                    .iter()
                    .map(|list| list.fields[&name].shallow_clone())
                    .collect();
                let tensor = Tensor::f_cat(&tensors, 0)?;
                Ok((name, tensor))
            })
            .try_collect()?;

        Ok(Self { boxes, fields })
    }
}

/// Pairwise intersection areas between the boxes of `lhs` and `rhs`, of
/// shape `[N, M]`.
pub fn pairwise_intersection(lhs: &BoxList, rhs: &BoxList) -> Tensor {
    let column = |boxes: &Tensor, index: i64| boxes.i((.., index..(index + 1)));
    let lhs_boxes = lhs.boxes();
    let rhs_boxes = rhs.boxes();

    let (ymin1, xmin1, ymax1, xmax1) = (
        column(lhs_boxes, 0),
        column(lhs_boxes, 1),
        column(lhs_boxes, 2),
        column(lhs_boxes, 3),
    );
    let (ymin2, xmin2, ymax2, xmax2) = (
        column(rhs_boxes, 0).transpose(0, 1),
        column(rhs_boxes, 1).transpose(0, 1),
        column(rhs_boxes, 2).transpose(0, 1),
        column(rhs_boxes, 3).transpose(0, 1),
    );

    let intersect_heights = (ymax1.minimum(&ymax2) - ymin1.maximum(&ymin2)).clamp_min(0.0);
    let intersect_widths = (xmax1.minimum(&xmax2) - xmin1.maximum(&xmin2)).clamp_min(0.0);
    intersect_heights * intersect_widths
}

/// Pairwise intersection-over-union of shape `[N, M]`. Pairs without
/// intersection have zero IoU.
pub fn pairwise_iou(lhs: &BoxList, rhs: &BoxList) -> Tensor {
    let intersections = pairwise_intersection(lhs, rhs);
    let areas1 = lhs.area().unsqueeze(1);
    let areas2 = rhs.area().unsqueeze(0);
    let unions = areas1 + areas2 - &intersections;
    let no_overlap = intersections.le(0.0);
    (intersections / unions).masked_fill(&no_overlap, 0.0)
}

/// Pairwise intersection over the area of the `rhs` boxes, of shape `[N, M]`.
pub fn pairwise_ioa(lhs: &BoxList, rhs: &BoxList) -> Tensor {
    let intersections = pairwise_intersection(lhs, rhs);
    let areas2 = rhs.area().unsqueeze(0);
    let no_overlap = intersections.le(0.0);
    (intersections / areas2).masked_fill(&no_overlap, 0.0)
}

/// Pairwise squared distances between the coordinate vectors of `lhs` and
/// `rhs`, of shape `[N, M]`.
pub fn pairwise_sq_dist(lhs: &BoxList, rhs: &BoxList) -> Tensor {
    let sqnorm1 = (lhs.boxes() * lhs.boxes())
        .sum_dim_intlist(&[1], true, Kind::Float);
    let sqnorm2 = (rhs.boxes() * rhs.boxes())
        .sum_dim_intlist(&[1], true, Kind::Float)
        .transpose(0, 1);
    let innerprod = lhs
        .boxes()
        .to_kind(Kind::Float)
        .matmul(&rhs.boxes().to_kind(Kind::Float).transpose(0, 1));
    sqnorm1 + sqnorm2 - innerprod * 2.0
}
