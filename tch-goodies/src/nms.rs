use crate::{box_list::BoxList, common::*};
use bbox::{prelude::*, TLBR};

/// Greedy non-maximum suppression.
///
/// Boxes are visited by descending score. On equal scores the box with the
/// lower index is visited first. A box is kept unless its IoU with an
/// already kept box is greater than `iou_threshold`. At most `max_output_size`
/// boxes are kept. Returns the kept indices in visiting order.
pub fn non_max_suppression(
    boxes: &BoxList,
    scores: &Tensor,
    iou_threshold: f64,
    max_output_size: usize,
) -> Result<Tensor> {
    tch::no_grad(|| -> Result<_> {
        ensure!(
            (0.0..=1.0).contains(&iou_threshold),
            "iou_threshold must be in range [0, 1]"
        );
        let num_boxes = boxes.num_boxes();
        let num_scores = scores
            .size1()
            .map_err(|_| format_err!("scores should be a 1d tensor"))?;
        ensure!(
            num_boxes == num_scores,
            "boxes and scores should have same number of elements in dimension 0"
        );
        let device = boxes.device();

        let score_vec = Vec::<f32>::from(&scores.to_kind(Kind::Float).to_device(Device::Cpu));
        let coord_vec =
            Vec::<f32>::from(&boxes.boxes().to_kind(Kind::Float).to_device(Device::Cpu).view([-1]));
        let rects: Vec<TLBR<f32>> = coord_vec
            .chunks(4)
            .map(|tlbr| {
                let [t, l, b, r]: [f32; 4] = tlbr.try_into()?;
                // flipped corners are reordered, non-finite boxes become empty
                Fallible::Ok(
                    TLBR::try_from_tlbr([t.min(b), l.min(r), t.max(b), l.max(r)])
                        .unwrap_or_else(|_| TLBR::from_tlbr([0.0, 0.0, 0.0, 0.0])),
                )
            })
            .try_collect()?;

        let order = {
            let mut order: Vec<usize> = (0..score_vec.len()).collect();
            // stable sort keeps lower indices first on ties
            order.sort_by(|&lhs, &rhs| {
                score_vec[rhs]
                    .partial_cmp(&score_vec[lhs])
                    .unwrap_or(Ordering::Equal)
            });
            order
        };

        let mut suppressed = vec![false; rects.len()];
        let mut keep: Vec<i64> = vec![];

        for (pos, &li) in order.iter().enumerate() {
            if keep.len() >= max_output_size {
                break;
            }
            if suppressed[li] {
                continue;
            }
            keep.push(li as i64);
            let lhs_rect = &rects[li];

            for &ri in &order[(pos + 1)..] {
                if suppressed[ri] {
                    continue;
                }
                let iou = lhs_rect.iou_with(&rects[ri], 0.0);
                if iou as f64 > iou_threshold {
                    suppressed[ri] = true;
                }
            }
        }

        Ok(Tensor::of_slice(&keep)
            .set_requires_grad(false)
            .to_device(device))
    })
}
