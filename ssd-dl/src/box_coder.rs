//! Box encoding relative to anchors.

use crate::common::*;

/// Added to anchor and box sizes before division and logarithm.
pub const EPSILON: f64 = 1e-8;

/// Converts boxes to fixed-length codes relative to anchors and back.
///
/// `decode(encode(boxes, anchors), anchors)` reproduces `boxes` up to
/// floating point error.
pub trait BoxCoder: Debug + Send + Sync {
    /// The length of one box code.
    fn code_size(&self) -> i64;

    /// Encode `[N, 4]` boxes against `[N, 4]` anchors into `[N, code_size]` codes.
    fn encode(&self, boxes: &BoxList, anchors: &BoxList) -> Result<Tensor>;

    /// Decode `[N, code_size]` codes against `[N, 4]` anchors.
    ///
    /// Coders carrying keypoints attach a `[N, K, 2]` keypoints field to the
    /// returned list.
    fn decode(&self, rel_codes: &Tensor, anchors: &BoxList) -> Result<BoxList>;

    fn num_keypoints(&self) -> i64 {
        0
    }
}

/// Selects and parameterizes a [BoxCoder].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoxCoderConfig {
    FasterRcnn {
        #[serde(default)]
        scale_factors: Option<[R64; 4]>,
    },
    Keypoint {
        num_keypoints: usize,
        #[serde(default)]
        scale_factors: Option<[R64; 4]>,
    },
    MeanStddev {
        #[serde(default = "default_stddev")]
        stddev: R64,
    },
}

impl Default for BoxCoderConfig {
    fn default() -> Self {
        Self::FasterRcnn {
            scale_factors: Some([r64(10.0), r64(10.0), r64(5.0), r64(5.0)]),
        }
    }
}

fn default_stddev() -> R64 {
    r64(0.01)
}

impl BoxCoderConfig {
    pub fn build(&self) -> Result<Arc<dyn BoxCoder>> {
        let to_f64 = |factors: &Option<[R64; 4]>| factors.map(|factors| factors.map(|f| f.raw()));

        let coder: Arc<dyn BoxCoder> = match self {
            Self::FasterRcnn { scale_factors } => {
                Arc::new(FasterRcnnBoxCoder::new(to_f64(scale_factors))?)
            }
            Self::Keypoint {
                num_keypoints,
                scale_factors,
            } => Arc::new(KeypointBoxCoder::new(
                *num_keypoints as i64,
                to_f64(scale_factors),
            )?),
            Self::MeanStddev { stddev } => Arc::new(MeanStddevBoxCoder::new(stddev.raw())?),
        };
        Ok(coder)
    }
}

fn check_scale_factors(scale_factors: &Option<[f64; 4]>) -> Result<()> {
    if let Some(factors) = scale_factors {
        ensure!(
            factors.iter().all(|&factor| factor > 0.0),
            "scale factors must be positive, but get {:?}",
            factors
        );
    }
    Ok(())
}

fn check_same_length(boxes: &BoxList, anchors: &BoxList) -> Result<()> {
    ensure!(
        boxes.num_boxes() == anchors.num_boxes(),
        "boxes and anchors must have the same length, but get {} and {}",
        boxes.num_boxes(),
        anchors.num_boxes()
    );
    Ok(())
}

fn check_codes(rel_codes: &Tensor, anchors: &BoxList, code_size: i64) -> Result<()> {
    let size = rel_codes.f_size_of_rank(2, "rel_codes")?;
    ensure!(
        size[1] == code_size,
        "expect codes of length {}, but get shape {:?}",
        code_size,
        size
    );
    ensure!(
        size[0] == anchors.num_boxes(),
        "the number of codes {} does not match the number of anchors {}",
        size[0],
        anchors.num_boxes()
    );
    Ok(())
}

/// Center offset and log scale encoding `[ty, tx, th, tw]`.
#[derive(Debug, Clone)]
pub struct FasterRcnnBoxCoder {
    scale_factors: Option<[f64; 4]>,
}

impl FasterRcnnBoxCoder {
    pub fn new(scale_factors: Option<[f64; 4]>) -> Result<Self> {
        check_scale_factors(&scale_factors)?;
        Ok(Self { scale_factors })
    }

    fn encode_boxes(&self, boxes: &BoxList, anchors: &BoxList) -> [Tensor; 4] {
        let (ycenter_a, xcenter_a, ha, wa) = anchors.center_coordinates_and_sizes();
        let (ycenter, xcenter, h, w) = boxes.center_coordinates_and_sizes();
        let ha = ha + EPSILON;
        let wa = wa + EPSILON;
        let h = h + EPSILON;
        let w = w + EPSILON;

        let mut ty = (ycenter - ycenter_a) / &ha;
        let mut tx = (xcenter - xcenter_a) / &wa;
        let mut th = (h / &ha).log();
        let mut tw = (w / &wa).log();

        if let Some([sy, sx, sh, sw]) = self.scale_factors {
            ty *= sy;
            tx *= sx;
            th *= sh;
            tw *= sw;
        }
        [ty, tx, th, tw]
    }

    fn decode_boxes(&self, rel_codes: &Tensor, anchors: &BoxList) -> Result<BoxList> {
        let (ycenter_a, xcenter_a, ha, wa) = anchors.center_coordinates_and_sizes();
        let mut ty = rel_codes.select(1, 0);
        let mut tx = rel_codes.select(1, 1);
        let mut th = rel_codes.select(1, 2);
        let mut tw = rel_codes.select(1, 3);

        if let Some([sy, sx, sh, sw]) = self.scale_factors {
            ty /= sy;
            tx /= sx;
            th /= sh;
            tw /= sw;
        }

        let w = tw.exp() * &wa;
        let h = th.exp() * &ha;
        let ycenter = ty * &ha + ycenter_a;
        let xcenter = tx * &wa + xcenter_a;

        let ymin = &ycenter - &h / 2.0;
        let xmin = &xcenter - &w / 2.0;
        let ymax = &ycenter + &h / 2.0;
        let xmax = &xcenter + &w / 2.0;
        BoxList::new(Tensor::f_stack(&[ymin, xmin, ymax, xmax], 1)?)
    }
}

impl BoxCoder for FasterRcnnBoxCoder {
    fn code_size(&self) -> i64 {
        4
    }

    fn encode(&self, boxes: &BoxList, anchors: &BoxList) -> Result<Tensor> {
        check_same_length(boxes, anchors)?;
        let codes = Tensor::f_stack(&self.encode_boxes(boxes, anchors), 1)?;
        Ok(codes)
    }

    fn decode(&self, rel_codes: &Tensor, anchors: &BoxList) -> Result<BoxList> {
        check_codes(rel_codes, anchors, self.code_size())?;
        self.decode_boxes(rel_codes, anchors)
    }
}

/// Extends [FasterRcnnBoxCoder] with `K` keypoints, each encoded as an
/// offset from the anchor center scaled by the anchor size.
///
/// The code layout is `[ty, tx, th, tw, y_0, x_0, ..., y_{K-1}, x_{K-1}]`.
#[derive(Debug, Clone)]
pub struct KeypointBoxCoder {
    num_keypoints: i64,
    box_coder: FasterRcnnBoxCoder,
}

impl KeypointBoxCoder {
    pub fn new(num_keypoints: i64, scale_factors: Option<[f64; 4]>) -> Result<Self> {
        ensure!(num_keypoints > 0, "num_keypoints must be positive");
        Ok(Self {
            num_keypoints,
            box_coder: FasterRcnnBoxCoder::new(scale_factors)?,
        })
    }

    /// The `[1, 2]` keypoint scale factors, or `None` if unscaled.
    fn keypoint_scale(&self, device: Device) -> Option<Tensor> {
        self.box_coder.scale_factors.map(|[sy, sx, _, _]| {
            Tensor::of_slice(&[sy as f32, sx as f32])
                .view([1, 1, 2])
                .to_device(device)
        })
    }
}

impl BoxCoder for KeypointBoxCoder {
    fn code_size(&self) -> i64 {
        4 + self.num_keypoints * 2
    }

    fn num_keypoints(&self) -> i64 {
        self.num_keypoints
    }

    fn encode(&self, boxes: &BoxList, anchors: &BoxList) -> Result<Tensor> {
        check_same_length(boxes, anchors)?;
        let keypoints = boxes.get_field(fields::KEYPOINTS)?;
        let num_boxes = boxes.num_boxes();
        ensure!(
            keypoints.size() == [num_boxes, self.num_keypoints, 2],
            "keypoints must have shape [{}, {}, 2], but get {:?}",
            num_boxes,
            self.num_keypoints,
            keypoints.size()
        );

        let [ty, tx, th, tw] = self.box_coder.encode_boxes(boxes, anchors);

        let (ycenter_a, xcenter_a, ha, wa) = anchors.center_coordinates_and_sizes();
        let centers = Tensor::f_stack(&[ycenter_a, xcenter_a], 1)?.unsqueeze(1);
        let sizes = (Tensor::f_stack(&[ha, wa], 1)? + EPSILON).unsqueeze(1);
        let mut tkeypoints = (keypoints - centers) / sizes;
        if let Some(scale) = self.keypoint_scale(keypoints.device()) {
            tkeypoints *= scale;
        }

        let box_codes = Tensor::f_stack(&[ty, tx, th, tw], 1)?;
        let codes = Tensor::f_cat(
            &[box_codes, tkeypoints.view([num_boxes, self.num_keypoints * 2])],
            1,
        )?;
        Ok(codes)
    }

    fn decode(&self, rel_codes: &Tensor, anchors: &BoxList) -> Result<BoxList> {
        check_codes(rel_codes, anchors, self.code_size())?;
        let num_boxes = anchors.num_boxes();
        let mut decoded = self.box_coder.decode_boxes(rel_codes, anchors)?;

        let (ycenter_a, xcenter_a, ha, wa) = anchors.center_coordinates_and_sizes();
        let centers = Tensor::f_stack(&[ycenter_a, xcenter_a], 1)?.unsqueeze(1);
        let sizes = Tensor::f_stack(&[ha, wa], 1)?.unsqueeze(1);

        let mut tkeypoints = rel_codes
            .narrow(1, 4, self.num_keypoints * 2)
            .view([num_boxes, self.num_keypoints, 2]);
        if let Some(scale) = self.keypoint_scale(rel_codes.device()) {
            tkeypoints = tkeypoints / scale;
        }
        let keypoints = tkeypoints * sizes + centers;

        decoded.add_field(fields::KEYPOINTS, keypoints)?;
        Ok(decoded)
    }
}

/// Encodes box corners as the difference to anchor corners divided by a
/// fixed standard deviation.
#[derive(Debug, Clone)]
pub struct MeanStddevBoxCoder {
    stddev: f64,
}

impl MeanStddevBoxCoder {
    pub fn new(stddev: f64) -> Result<Self> {
        ensure!(stddev > 0.0, "stddev must be positive, but get {}", stddev);
        Ok(Self { stddev })
    }
}

impl BoxCoder for MeanStddevBoxCoder {
    fn code_size(&self) -> i64 {
        4
    }

    fn encode(&self, boxes: &BoxList, anchors: &BoxList) -> Result<Tensor> {
        check_same_length(boxes, anchors)?;
        Ok((boxes.boxes() - anchors.boxes()) / self.stddev)
    }

    fn decode(&self, rel_codes: &Tensor, anchors: &BoxList) -> Result<BoxList> {
        check_codes(rel_codes, anchors, self.code_size())?;
        BoxList::new(rel_codes * self.stddev + anchors.boxes())
    }
}
