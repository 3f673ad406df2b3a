//! Tensor descriptors and typed operator attributes.

use smallvec::SmallVec;

use crate::arith::{checked_mul_add, Overflow};

/// Ordered dimension list of a tensor descriptor.
///
/// Shapes in this crate are at most rank 5 (the NC1HWC0 physical layout), so
/// they are stored inline.
pub type Dims = SmallVec<[i64; 5]>;

/// Width of the channel tile in the NC1HWC0 physical layout.
pub const C0: i64 = 16;

/// Physical or logical layout of a tensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Format {
    Nchw,
    Nhwc,
    Hwcn,
    /// Channel-tiled 5-D hardware layout, C0 elements per tile.
    Nc1hwc0,
    /// Tiled filter layout used for convolution weights.
    FractalZ,
    /// Layout-less n-dimensional data (eg. bias vectors).
    Nd,
}

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DataType {
    Float16,
    Float32,
    Int8,
    Int32,
}

/// Describes one input or output value of a graph node.
///
/// `shape`/`format` describe the physical layout of the value, while
/// `origin_shape`/`origin_format` describe the logical layout set by the user
/// graph. The two agree until a pass retiles the value (eg. NHWC → NC1HWC0).
#[derive(Clone, Debug, PartialEq)]
pub struct TensorDesc {
    pub shape: Dims,
    pub origin_shape: Dims,
    pub format: Format,
    pub origin_format: Format,
    pub dtype: DataType,
}

impl TensorDesc {
    /// Create a descriptor whose physical layout matches its logical one.
    pub fn new(shape: &[i64], format: Format, dtype: DataType) -> TensorDesc {
        TensorDesc {
            shape: shape.into(),
            origin_shape: shape.into(),
            format,
            origin_format: format,
            dtype,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total element count of the physical shape, or `Overflow` if the
    /// product exceeds the i64 range.
    pub fn element_count(&self) -> Result<i64, Overflow> {
        let mut count = 1i64;
        for &dim in &self.shape {
            count = checked_mul_add(count, dim)?;
        }
        Ok(count)
    }

    /// Index of a named axis in the origin (logical) shape.
    ///
    /// Returns `None` for formats without named 4-D axes.
    fn origin_axis(&self, axis: Axis) -> Option<usize> {
        let order = match self.origin_format {
            Format::Nchw => [0, 1, 2, 3],
            Format::Nhwc => [0, 3, 1, 2],
            Format::Hwcn => [3, 2, 0, 1],
            _ => return None,
        };
        Some(order[axis as usize])
    }

    fn origin_dim(&self, axis: Axis) -> Option<i64> {
        let idx = self.origin_axis(axis)?;
        self.origin_shape.get(idx).copied()
    }

    pub fn batch(&self) -> Option<i64> {
        self.origin_dim(Axis::N)
    }

    pub fn channels(&self) -> Option<i64> {
        self.origin_dim(Axis::C)
    }

    pub fn height(&self) -> Option<i64> {
        self.origin_dim(Axis::H)
    }

    pub fn width(&self) -> Option<i64> {
        self.origin_dim(Axis::W)
    }

    /// Replace the origin shape, keeping the physical shape in sync.
    pub fn set_origin_shape(&mut self, shape: &[i64]) {
        self.origin_shape = shape.into();
        if self.format == self.origin_format {
            self.shape = shape.into();
        }
    }

    /// Retile this descriptor into the 5-D NC1HWC0 physical layout, derived
    /// from the 4-D origin shape. The origin shape and format are preserved.
    pub fn retile_nc1hwc0(&mut self) -> Result<(), UnsupportedLayout> {
        let (Some(n), Some(c), Some(h), Some(w)) =
            (self.batch(), self.channels(), self.height(), self.width())
        else {
            return Err(UnsupportedLayout(self.origin_format));
        };
        let c1 = (c + C0 - 1) / C0;
        self.shape = [n, c1, h, w, C0].as_slice().into();
        self.format = Format::Nc1hwc0;
        Ok(())
    }
}

#[derive(Copy, Clone)]
enum Axis {
    N = 0,
    C = 1,
    H = 2,
    W = 3,
}

/// Error retiling a descriptor whose origin format has no named 4-D axes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UnsupportedLayout(pub Format);

impl std::fmt::Display for UnsupportedLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unsupported origin layout {:?}", self.0)
    }
}

impl std::error::Error for UnsupportedLayout {}

/// A typed attribute value on an [`OpDesc`](crate::graph::OpDesc).
///
/// Reading an absent or differently-typed attribute is a normal `None`, never
/// an error.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    IntList(Vec<i64>),
    Float(f32),
    Bool(bool),
    Str(String),
}

#[cfg(test)]
mod tests {
    use super::{DataType, Format, TensorDesc};

    #[test]
    fn test_named_axes() {
        struct Case {
            format: Format,
            shape: [i64; 4],
        }

        // Shapes describing the same logical [n=2, c=8, h=4, w=5] tensor.
        let cases = [
            Case {
                format: Format::Nchw,
                shape: [2, 8, 4, 5],
            },
            Case {
                format: Format::Nhwc,
                shape: [2, 4, 5, 8],
            },
            Case {
                format: Format::Hwcn,
                shape: [4, 5, 8, 2],
            },
        ];

        for Case { format, shape } in cases {
            let desc = TensorDesc::new(&shape, format, DataType::Float16);
            assert_eq!(desc.batch(), Some(2), "batch for {:?}", format);
            assert_eq!(desc.channels(), Some(8), "channels for {:?}", format);
            assert_eq!(desc.height(), Some(4), "height for {:?}", format);
            assert_eq!(desc.width(), Some(5), "width for {:?}", format);
        }
    }

    #[test]
    fn test_retile_nc1hwc0() {
        let mut desc = TensorDesc::new(&[1, 4, 4, 17], Format::Nhwc, DataType::Float16);
        desc.retile_nc1hwc0().unwrap();
        assert_eq!(desc.shape.as_slice(), &[1, 2, 4, 4, 16]);
        assert_eq!(desc.format, Format::Nc1hwc0);
        // Logical view is untouched.
        assert_eq!(desc.origin_shape.as_slice(), &[1, 4, 4, 17]);
        assert_eq!(desc.origin_format, Format::Nhwc);
    }

    #[test]
    fn test_retile_requires_named_axes() {
        let mut desc = TensorDesc::new(&[16], Format::Nd, DataType::Float32);
        assert!(desc.retile_nc1hwc0().is_err());
    }

    #[test]
    fn test_element_count_overflow() {
        let desc = TensorDesc::new(&[i64::MAX, 2], Format::Nd, DataType::Float32);
        assert!(desc.element_count().is_err());
        let desc = TensorDesc::new(&[3, 4, 5], Format::Nd, DataType::Float32);
        assert_eq!(desc.element_count(), Ok(60));
    }
}
