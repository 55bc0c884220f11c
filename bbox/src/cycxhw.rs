use super::{Rect, TLBR};
use crate::common::*;

/// Bounding box in CyCxHW format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CyCxHW<T> {
    pub(crate) cy: T,
    pub(crate) cx: T,
    pub(crate) h: T,
    pub(crate) w: T,
}

impl<T> CyCxHW<T>
where
    T: Float,
{
    /// Build the box of an anchor centered at `(cy, cx)` with the given
    /// scale and aspect ratio (width over height).
    pub fn try_from_scale_aspect_ratio(
        cy: T,
        cx: T,
        scale: T,
        aspect_ratio: T,
        base_size: [T; 2],
    ) -> Result<Self> {
        let zero = T::zero();
        ensure!(scale >= zero, "scale must be non-negative");
        ensure!(aspect_ratio > zero, "aspect ratio must be positive");

        let [base_h, base_w] = base_size;
        let ratio_sqrt = aspect_ratio.sqrt();
        let h = scale / ratio_sqrt * base_h;
        let w = scale * ratio_sqrt * base_w;
        Ok(Self { cy, cx, h, w })
    }
}

impl<T> Rect for CyCxHW<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn t(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cy - self.h / two
    }

    fn l(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cx - self.w / two
    }

    fn b(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cy + self.h / two
    }

    fn r(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.cx + self.w / two
    }

    fn cy(&self) -> Self::Type {
        self.cy
    }

    fn cx(&self) -> Self::Type {
        self.cx
    }

    fn h(&self) -> Self::Type {
        self.h
    }

    fn w(&self) -> Self::Type {
        self.w
    }

    fn try_from_tlbr(tlbr: [T; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        let zero = T::zero();
        let two = T::one() + T::one();
        let h = b - t;
        let w = r - l;
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );

        Ok(Self {
            cy: t + h / two,
            cx: l + w / two,
            h,
            w,
        })
    }

    fn try_from_cycxhw(cycxhw: [T; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "box height and width must be non-negative"
        );

        Ok(Self { cy, cx, h, w })
    }
}

impl<T> From<TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: TLBR<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&TLBR<T>> for CyCxHW<T>
where
    T: Copy + Num,
{
    fn from(from: &TLBR<T>) -> Self {
        let two = T::one() + T::one();
        let TLBR { t, l, b, r } = *from;
        let h = b - t;
        let w = r - l;
        Self {
            cy: t + h / two,
            cx: l + w / two,
            h,
            w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectNum;
    use approx::assert_abs_diff_eq;

    #[test]
    fn square_anchor_of_unit_aspect_ratio() {
        let anchor = CyCxHW::try_from_scale_aspect_ratio(0.5, 0.5, 0.2, 1.0, [1.0, 1.0]).unwrap();
        let [t, l, b, r] = anchor.tlbr();
        assert_abs_diff_eq!(t, 0.4, epsilon = 1e-9);
        assert_abs_diff_eq!(l, 0.4, epsilon = 1e-9);
        assert_abs_diff_eq!(b, 0.6, epsilon = 1e-9);
        assert_abs_diff_eq!(r, 0.6, epsilon = 1e-9);
    }

    #[test]
    fn wide_anchor_keeps_area() {
        let anchor = CyCxHW::try_from_scale_aspect_ratio(0.5, 0.5, 0.2, 2.0, [1.0, 1.0]).unwrap();
        assert_abs_diff_eq!(anchor.w() / anchor.h(), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(anchor.area(), 0.04, epsilon = 1e-9);
    }

    #[test]
    fn tlbr_conversion() {
        let tlbr = TLBR::from_tlbr([0.1, 0.2, 0.5, 0.8]);
        let cycxhw = CyCxHW::from(&tlbr);
        let [cy, cx, h, w] = cycxhw.cycxhw();
        assert_abs_diff_eq!(cy, 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(cx, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(h, 0.4, epsilon = 1e-9);
        assert_abs_diff_eq!(w, 0.6, epsilon = 1e-9);
        assert_eq!(TLBR::from(&cycxhw), cycxhw.to_tlbr());
    }
}
