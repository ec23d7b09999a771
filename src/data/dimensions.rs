//! Code in this submodule deals strictly with attention to
//! image dimensions and the types of things that can go wrong
//! with `Dimensions`.
//!

/// `Dimensions` is a simple struct that holds the dimensions
/// of a frame
///
/// `xdim` is the width of the frame
/// `ydim` is the height of the frame
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct Dimensions {
    pub xdim : usize,
    pub ydim : usize,
}

#[derive(Debug, Clone)]
pub enum DimensionsError {
    MismatchedDimensions{required : Dimensions, requested : Dimensions},
    IncorrectFrames,
    EmptyStack,
}

impl Dimensions {
    pub fn new(xdim : usize, ydim : usize) -> Dimensions {
        Dimensions {
            xdim,
            ydim,
        }
    }

    /// Dimensions of a single 2d frame from an array shape,
    /// `(.., y, x)` order.
    pub fn from_shape(shape : &[usize]) -> Dimensions {
        Dimensions {
            ydim : shape[shape.len() - 2],
            xdim : shape[shape.len() - 1],
        }
    }

    /// Returns the dimensions as a tuple (y, x)
    pub fn to_tuple(&self) -> (usize, usize) {
        (self.ydim, self.xdim)
    }

    /// Number of pixels in one frame.
    pub fn n_pixels(&self) -> usize {
        self.ydim * self.xdim
    }

    /// Errors if `other` is not the same shape as `self`.
    pub fn check_matches(&self, other : &Dimensions) -> Result<(), DimensionsError> {
        if self == other {
            Ok(())
        } else {
            Err(DimensionsError::MismatchedDimensions {
                required : *self,
                requested : *other,
            })
        }
    }

    /// Whether the coordinate lies inside the frame.
    pub fn contains(&self, y : i64, x : i64) -> bool {
        y >= 0 && x >= 0 && (y as usize) < self.ydim && (x as usize) < self.xdim
    }
}

impl std::error::Error for DimensionsError {}

impl std::fmt::Display for DimensionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DimensionsError::MismatchedDimensions{required, requested} => {
                write!(f, "Mismatched dimensions. Requested: ({}, {}), Required: ({}, {})",
                    requested.xdim, requested.ydim, required.xdim, required.ydim)
            },
            DimensionsError::IncorrectFrames => {
                write!(f, "Requested frames are out of bounds.")
            },
            DimensionsError::EmptyStack => {
                write!(f, "Requested data contains no frames.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_checks() {
        let dims = Dimensions::new(128, 64);
        assert_eq!(dims.to_tuple(), (64, 128));
        assert_eq!(dims.n_pixels(), 128*64);

        assert!(dims.check_matches(&Dimensions::new(128, 64)).is_ok());
        assert!(dims.check_matches(&Dimensions::new(64, 128)).is_err());

        assert!(dims.contains(0, 0));
        assert!(dims.contains(63, 127));
        assert!(!dims.contains(64, 0));
        assert!(!dims.contains(0, -1));
    }
}
