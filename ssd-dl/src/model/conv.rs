use crate::common::*;

/// How a convolution pads its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Keep `ceil(input / stride)` output cells.
    Same,
    /// No padding.
    Valid,
}

#[derive(Debug, Clone)]
pub struct ConvBn2DInit {
    pub in_c: i64,
    pub out_c: i64,
    /// `[height, width]` of the kernel.
    pub ksize: [i64; 2],
    pub stride: i64,
    pub padding: Padding,
    pub bias: bool,
    pub batch_norm: bool,
    pub activation: Activation,
}

impl ConvBn2DInit {
    pub fn new(in_c: i64, out_c: i64, ksize: i64) -> Self {
        Self {
            in_c,
            out_c,
            ksize: [ksize, ksize],
            stride: 1,
            padding: Padding::Same,
            bias: true,
            batch_norm: false,
            activation: Activation::Relu6,
        }
    }

    pub fn build<'p, P>(self, path: P) -> Result<ConvBn2D>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_c,
            out_c,
            ksize: [kh, kw],
            stride,
            padding,
            bias,
            batch_norm,
            activation,
        } = self;

        ensure!(
            in_c > 0 && out_c > 0,
            "channels must be positive, but get in_c={} and out_c={}",
            in_c,
            out_c
        );
        ensure!(
            kh > 0 && kw > 0 && stride > 0,
            "kernel size and stride must be positive"
        );
        ensure!(
            padding == Padding::Valid || (kh % 2 == 1 && kw % 2 == 1),
            "same padding requires odd kernel sizes, but get {}x{}",
            kh,
            kw
        );

        let padding = match padding {
            Padding::Same => [kh / 2, kw / 2],
            Padding::Valid => [0, 0],
        };
        let ws = path.var("weight", &[out_c, in_c, kh, kw], nn::Init::KaimingUniform);
        let bs = (bias && !batch_norm).then(|| path.zeros("bias", &[out_c]));
        let bn = batch_norm.then(|| nn::batch_norm2d(path / "bn", out_c, Default::default()));

        Ok(ConvBn2D {
            ws,
            bs,
            stride: [stride, stride],
            padding,
            bn,
            activation,
        })
    }
}

/// A 2D convolution with optional batch normalization and an activation.
#[derive(Debug)]
pub struct ConvBn2D {
    ws: Tensor,
    bs: Option<Tensor>,
    stride: [i64; 2],
    padding: [i64; 2],
    bn: Option<nn::BatchNorm>,
    activation: Activation,
}

impl ConvBn2D {
    pub fn out_channels(&self) -> i64 {
        self.ws.size()[0]
    }

    /// `[height, width]` of the kernel.
    pub fn kernel_size(&self) -> [i64; 2] {
        let size = self.ws.size();
        [size[2], size[3]]
    }
}

impl nn::ModuleT for ConvBn2D {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            ref ws,
            ref bs,
            stride,
            padding,
            ref bn,
            activation,
        } = *self;

        let xs = xs.conv2d(ws, bs.as_ref(), &stride, &padding, &[1, 1], 1);
        let xs = match bn {
            Some(bn) => bn.forward_t(&xs, train),
            None => xs,
        };
        xs.activation(activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let same = ConvBn2DInit {
            stride: 2,
            batch_norm: true,
            ..ConvBn2DInit::new(3, 8, 3)
        }
        .build(&root / "same")
        .unwrap();
        let valid = ConvBn2DInit {
            ksize: [5, 3],
            padding: Padding::Valid,
            ..ConvBn2DInit::new(3, 4, 1)
        }
        .build(&root / "valid")
        .unwrap();

        let xs = Tensor::rand(&[2, 3, 33, 20], (Kind::Float, Device::Cpu));
        assert_eq!(same.forward_t(&xs, true).size(), vec![2, 8, 17, 10]);
        assert_eq!(valid.forward_t(&xs, false).size(), vec![2, 4, 29, 18]);
        assert_eq!(valid.kernel_size(), [5, 3]);
        assert_eq!(valid.out_channels(), 4);
    }

    #[test]
    fn same_padding_requires_odd_kernels() {
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(ConvBn2DInit::new(3, 4, 2).build(&vs.root()).is_err());
    }
}
