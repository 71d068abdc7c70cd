use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// A dense, row-major `f32` tensor. This is the only payload type neurons
/// exchange: contexts and inputs go out as tensors, synapse outputs come back
/// as tensors.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[archive(check_bytes)]
pub struct Tensor {
    shape: Vec<u32>,
    data: Vec<f32>,
}

/// Returned when the element count doesn't match the shape, or when two
/// tensors that must line up don't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub expected: Vec<u32>,
    pub found: Vec<u32>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shape mismatch: expected {:?}, found {:?}",
            self.expected, self.found
        )
    }
}

impl std::error::Error for ShapeMismatch {}

impl Tensor {
    pub fn new(shape: Vec<u32>, data: Vec<f32>) -> Result<Self, ShapeMismatch> {
        if element_count(&shape) != Some(data.len()) {
            return Err(ShapeMismatch {
                expected: shape,
                found: vec![data.len() as u32],
            });
        }
        Ok(Self { shape, data })
    }

    /// Checks that shape and element count agree. Tensors that came off the
    /// wire skipped `new`, so they have to be checked before use.
    pub fn validate(&self) -> Result<(), ShapeMismatch> {
        if element_count(&self.shape) != Some(self.data.len()) {
            return Err(ShapeMismatch {
                expected: self.shape.clone(),
                found: vec![self.data.len() as u32],
            });
        }
        Ok(())
    }

    /// A one-dimensional tensor.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len() as u32],
            data,
        }
    }

    /// Fails if the element count doesn't fit in `usize`.
    pub fn zeros(shape: Vec<u32>) -> Result<Self, ShapeMismatch> {
        let Some(numel) = element_count(&shape) else {
            return Err(ShapeMismatch {
                expected: shape,
                found: vec![],
            });
        };
        Ok(Self {
            shape,
            data: vec![0.0; numel],
        })
    }

    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// `self += weight * other`, element-wise.
    pub fn scaled_add(&mut self, other: &Tensor, weight: f32) -> Result<(), ShapeMismatch> {
        if self.shape != other.shape {
            return Err(ShapeMismatch {
                expected: self.shape.clone(),
                found: other.shape.clone(),
            });
        }
        for (acc, x) in self.data.iter_mut().zip(&other.data) {
            *acc += weight * x;
        }
        Ok(())
    }

    /// Returns a copy with every element multiplied by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|x| x * factor).collect(),
        }
    }
}

/// Element count of `shape`, or `None` if it overflows.
fn element_count(shape: &[u32]) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checks_element_count() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn validate_catches_inconsistent_tensors() {
        let bad = Tensor {
            shape: vec![4],
            data: vec![1.0],
        };
        assert!(bad.validate().is_err());
        assert!(Tensor::zeros(vec![2, 2]).unwrap().validate().is_ok());
    }

    #[test]
    fn overflowing_shapes_are_mismatches() {
        let huge = Tensor {
            shape: vec![u32::MAX; 3],
            data: vec![],
        };
        assert!(huge.validate().is_err());
        assert!(Tensor::new(vec![u32::MAX; 3], vec![]).is_err());
        assert!(Tensor::zeros(vec![u32::MAX; 3]).is_err());
    }

    #[test]
    fn scaled_add_accumulates() {
        let mut acc = Tensor::zeros(vec![3]).unwrap();
        acc.scaled_add(&Tensor::vector(vec![1.0, 2.0, 3.0]), 0.5)
            .unwrap();
        acc.scaled_add(&Tensor::vector(vec![2.0, 2.0, 2.0]), 0.25)
            .unwrap();
        assert_eq!(acc.data(), &[1.0, 1.5, 2.0]);
    }

    #[test]
    fn scaled_add_rejects_other_shapes() {
        let mut acc = Tensor::zeros(vec![3]).unwrap();
        let err = acc
            .scaled_add(&Tensor::zeros(vec![1, 3]).unwrap(), 1.0)
            .unwrap_err();
        assert_eq!(err.expected, vec![3]);
        assert_eq!(err.found, vec![1, 3]);
    }
}
