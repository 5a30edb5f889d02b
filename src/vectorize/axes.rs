//! Axis algebra: where does an axis of an operand end up after an
//! operator?
//!
//! The per-operator rules use these mappings to relocate packed axes and
//! pad records from an operator's input to its output.

/// How an input axis maps through a reshape.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReshapeAxisMap {
    /// The axis maps to exactly one output axis of the same extent.
    One2One(usize),
    /// The axis maps to a group of output axes of which at most one has
    /// extent > 1 (an unsqueeze in disguise); the payload is that axis.
    UnsqueezeLike(usize),
    /// The axis is the fastest-varying factor of a merge into the given
    /// output axis. Packing may carry through if the extent divides the
    /// lane width evenly.
    MergeFastest(usize),
    /// A true fragmenting split or merge; packing cannot carry through.
    Fragmenting,
}

/// Classify how `axis` of `old_shape` maps through a reshape to
/// `new_shape`.
///
/// The shapes are segmented into minimal groups of equal element count;
/// each group is then a 1:1 carry, an unsqueeze-like split, a merge, or an
/// opaque many-to-many mapping.
pub fn reshape_axis_map(old_shape: &[usize], new_shape: &[usize], axis: usize) -> ReshapeAxisMap {
    debug_assert!(axis < old_shape.len());
    debug_assert_eq!(
        old_shape.iter().product::<usize>(),
        new_shape.iter().product::<usize>()
    );

    let mut i = 0;
    let mut j = 0;
    while i < old_shape.len() {
        let (group_i0, group_j0) = (i, j);
        let mut old_prod = old_shape[i];
        i += 1;
        let mut new_prod = if j < new_shape.len() {
            let d = new_shape[j];
            j += 1;
            d
        } else {
            1
        };
        // Grow the smaller side until element counts agree.
        while old_prod != new_prod {
            if old_prod < new_prod {
                old_prod *= old_shape[i];
                i += 1;
            } else {
                new_prod *= new_shape[j];
                j += 1;
            }
        }
        // Trailing size-1 dims belong to the current group.
        while i < old_shape.len() && old_shape[i] == 1 {
            i += 1;
        }
        while j < new_shape.len() && new_shape[j] == 1 {
            j += 1;
        }

        if axis >= i {
            continue;
        }
        let old_count = i - group_i0;
        let new_count = j - group_j0;
        return match (old_count, new_count) {
            (1, 1) => ReshapeAxisMap::One2One(group_j0),
            (1, _) => {
                let wide: Vec<usize> = (group_j0..j).filter(|&n| new_shape[n] > 1).collect();
                match wide[..] {
                    [] => ReshapeAxisMap::UnsqueezeLike(j - 1),
                    [n] => ReshapeAxisMap::UnsqueezeLike(n),
                    _ => ReshapeAxisMap::Fragmenting,
                }
            }
            (_, 1) => {
                // Only the fastest-varying non-trivial factor of a merge
                // keeps its element adjacency.
                let last_wide = (group_i0..i).rev().find(|&n| old_shape[n] > 1);
                if last_wide == Some(axis) {
                    ReshapeAxisMap::MergeFastest(group_j0)
                } else {
                    ReshapeAxisMap::Fragmenting
                }
            }
            _ => ReshapeAxisMap::Fragmenting,
        };
    }
    ReshapeAxisMap::Fragmenting
}

/// Return the output axis a transposed input axis ends up at:
/// the position of `old_axis` within `perm`.
pub fn transpose_axis(perm: &[usize], old_axis: usize) -> usize {
    perm.iter()
        .position(|&src| src == old_axis)
        .expect("axis not present in permutation")
}

/// Return where an input axis lands after reducing `reduce_axes`, or
/// `None` if the axis itself was reduced away.
pub fn axis_after_reduce(axis: usize, reduce_axes: &[usize], keep_dims: bool) -> Option<usize> {
    if reduce_axes.contains(&axis) {
        return None;
    }
    if keep_dims {
        return Some(axis);
    }
    let removed_before = reduce_axes.iter().filter(|&&r| r < axis).count();
    Some(axis - removed_before)
}

/// Return where a data axis lands in the output of `Gather{axis}` with
/// indices of the given rank, or `None` for the gathered axis itself.
pub fn axis_after_gather(axis: usize, gather_axis: usize, indices_rank: usize) -> Option<usize> {
    use std::cmp::Ordering;
    match axis.cmp(&gather_axis) {
        Ordering::Less => Some(axis),
        Ordering::Equal => None,
        Ordering::Greater => Some(axis - 1 + indices_rank),
    }
}

/// Return where an input axis lands after `Unsqueeze{inserted}`.
/// `inserted` are positions in the output shape.
pub fn axis_after_unsqueeze(axis: usize, inserted: &[usize]) -> usize {
    let mut out = 0;
    let mut remaining = axis;
    loop {
        if !inserted.contains(&out) {
            if remaining == 0 {
                return out;
            }
            remaining -= 1;
        }
        out += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        axis_after_gather, axis_after_reduce, axis_after_unsqueeze, reshape_axis_map,
        transpose_axis, ReshapeAxisMap,
    };

    #[test]
    fn test_reshape_axis_map() {
        struct Case {
            old: Vec<usize>,
            new: Vec<usize>,
            axis: usize,
            expected: ReshapeAxisMap,
        }

        let cases = [
            // Pure unsqueeze: the original axis 2 carries through.
            Case {
                old: vec![1, 384, 128],
                new: vec![1, 1, 384, 128],
                axis: 2,
                expected: ReshapeAxisMap::One2One(3),
            },
            // The leading 1s collapse into their own group, so axis 1 maps
            // directly rather than via an unsqueeze-like group.
            Case {
                old: vec![1, 384, 128],
                new: vec![1, 1, 384, 128],
                axis: 1,
                expected: ReshapeAxisMap::One2One(2),
            },
            Case {
                old: vec![384, 128],
                new: vec![384, 1, 1, 128],
                axis: 0,
                expected: ReshapeAxisMap::UnsqueezeLike(0),
            },
            // Merge: the fastest-varying factor carries...
            Case {
                old: vec![1, 384, 32, 128],
                new: vec![1, 384, 4096],
                axis: 3,
                expected: ReshapeAxisMap::MergeFastest(2),
            },
            // ...but the slower factor does not.
            Case {
                old: vec![1, 384, 32, 128],
                new: vec![1, 384, 4096],
                axis: 2,
                expected: ReshapeAxisMap::Fragmenting,
            },
            // True split of one axis into two non-trivial factors.
            Case {
                old: vec![6, 4],
                new: vec![2, 3, 4],
                axis: 0,
                expected: ReshapeAxisMap::Fragmenting,
            },
            Case {
                old: vec![6, 4],
                new: vec![2, 3, 4],
                axis: 1,
                expected: ReshapeAxisMap::One2One(2),
            },
            Case {
                old: vec![4, 8],
                new: vec![4, 8],
                axis: 0,
                expected: ReshapeAxisMap::One2One(0),
            },
        ];

        for (i, case) in cases.iter().enumerate() {
            assert_eq!(
                reshape_axis_map(&case.old, &case.new, case.axis),
                case.expected,
                "case {}",
                i
            );
        }
    }

    #[test]
    fn test_transpose_axis() {
        let perm = [2, 0, 1];
        assert_eq!(transpose_axis(&perm, 0), 1);
        assert_eq!(transpose_axis(&perm, 1), 2);
        assert_eq!(transpose_axis(&perm, 2), 0);
    }

    #[test]
    fn test_axis_after_reduce() {
        assert_eq!(axis_after_reduce(0, &[1], false), Some(0));
        assert_eq!(axis_after_reduce(2, &[1], false), Some(1));
        assert_eq!(axis_after_reduce(1, &[1], false), None);
        assert_eq!(axis_after_reduce(2, &[1], true), Some(2));
    }

    #[test]
    fn test_axis_after_gather() {
        // data rank 3, gather on axis 1, indices rank 2.
        assert_eq!(axis_after_gather(0, 1, 2), Some(0));
        assert_eq!(axis_after_gather(1, 1, 2), None);
        assert_eq!(axis_after_gather(2, 1, 2), Some(3));
    }

    #[test]
    fn test_axis_after_unsqueeze() {
        // [a, b] -> [1, a, 1, b]
        assert_eq!(axis_after_unsqueeze(0, &[0, 2]), 1);
        assert_eq!(axis_after_unsqueeze(1, &[0, 2]), 3);
        assert_eq!(axis_after_unsqueeze(0, &[]), 0);
    }
}
