//! Minimal dynamic-rank, row-major tensor used by the reference interpreter.

/// An owned tensor with dynamic rank and contiguous row-major storage.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Copy> Tensor<T> {
    /// Create a tensor from a shape and elements in row-major order.
    ///
    /// Panics if the element count does not match the shape.
    pub fn from_data(shape: &[usize], data: Vec<T>) -> Tensor<T> {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} does not match element count {}",
            shape,
            data.len()
        );
        Tensor {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Create a zero-rank tensor holding a single element.
    pub fn from_scalar(value: T) -> Tensor<T> {
        Tensor {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Create a tensor with every element set to `value`.
    pub fn full(shape: &[usize], value: T) -> Tensor<T> {
        Tensor {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Return the element of a single-element tensor.
    pub fn item(&self) -> Option<&T> {
        match self.data.len() {
            1 => Some(&self.data[0]),
            _ => None,
        }
    }

    /// Return the linear offset of an index in row-major order.
    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.shape.len());
        let mut offset = 0;
        for (i, &idx) in index.iter().enumerate() {
            debug_assert!(idx < self.shape[i]);
            offset = offset * self.shape[i] + idx;
        }
        offset
    }

    pub fn get(&self, index: &[usize]) -> T {
        self.data[self.offset(index)]
    }

    pub fn set(&mut self, index: &[usize], value: T) {
        let offset = self.offset(index);
        self.data[offset] = value;
    }

    /// Read an element using an index which is broadcast against this
    /// tensor's shape: the index is right-aligned and size-1 dimensions
    /// repeat.
    pub fn broadcast_get(&self, index: &[usize]) -> T {
        let offset_base = index.len() - self.shape.len();
        let mut offset = 0;
        for (i, &size) in self.shape.iter().enumerate() {
            let idx = if size == 1 { 0 } else { index[offset_base + i] };
            offset = offset * size + idx;
        }
        self.data[offset]
    }

    /// Apply a function to every element, producing a new tensor of the
    /// same shape.
    pub fn map<U: Copy, F: Fn(T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Reinterpret this tensor's elements with a new shape of equal length.
    pub fn reshaped(&self, shape: &[usize]) -> Tensor<T> {
        Tensor::from_data(shape, self.data.clone())
    }
}

/// Compute the broadcast of two shapes using right-aligned numpy rules, or
/// `None` if the shapes are incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i + a.len() >= rank {
            a[i + a.len() - rank]
        } else {
            1
        };
        let db = if i + b.len() >= rank {
            b[i + b.len() - rank]
        } else {
            1
        };
        match (da, db) {
            (x, y) if x == y => out.push(x),
            (1, y) => out.push(y),
            (x, 1) => out.push(x),
            _ => return None,
        }
    }
    Some(out)
}

/// Iterator over all indices of a shape in row-major order.
pub struct Indices {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl Indices {
    pub fn new(shape: &[usize]) -> Indices {
        let next = if shape.iter().all(|&d| d > 0) {
            Some(vec![0; shape.len()])
        } else {
            None
        };
        Indices {
            shape: shape.to_vec(),
            next,
        }
    }
}

impl Iterator for Indices {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.clone()?;
        // Advance the odometer from the last dimension.
        let mut next = current.clone();
        let mut dim = self.shape.len();
        loop {
            if dim == 0 {
                self.next = None;
                break;
            }
            dim -= 1;
            next[dim] += 1;
            if next[dim] < self.shape[dim] {
                self.next = Some(next);
                break;
            }
            next[dim] = 0;
        }
        Some(current)
    }
}

/// Shorthand for `Indices::new`.
pub fn indices(shape: &[usize]) -> Indices {
    Indices::new(shape)
}

#[cfg(test)]
mod tests {
    use super::{broadcast_shapes, indices, Tensor};

    #[test]
    fn test_offsets_row_major() {
        let t = Tensor::from_data(&[2, 3], (0..6).collect());
        assert_eq!(t.get(&[0, 0]), 0);
        assert_eq!(t.get(&[0, 2]), 2);
        assert_eq!(t.get(&[1, 0]), 3);
        assert_eq!(t.get(&[1, 2]), 5);
    }

    #[test]
    fn test_broadcast_get() {
        let t = Tensor::from_data(&[1, 3], vec![10, 20, 30]);
        assert_eq!(t.broadcast_get(&[0, 5, 1]), 20);
        let s = Tensor::from_scalar(7);
        assert_eq!(s.broadcast_get(&[3, 4]), 7);
    }

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shapes(&[2, 1], &[1, 4]), Some(vec![2, 4]));
        assert_eq!(broadcast_shapes(&[2, 3], &[4]), None);
    }

    #[test]
    fn test_indices_order() {
        let idx: Vec<_> = indices(&[2, 2]).collect();
        assert_eq!(
            idx,
            [vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        assert_eq!(indices(&[]).count(), 1);
        assert_eq!(indices(&[0, 2]).count(), 0);
    }
}
