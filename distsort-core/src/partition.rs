/// Splits `data` into `parts` contiguous chunks whose sizes differ by at most
/// one; the first `len % parts` chunks get the extra element.
///
/// Returns an empty vector when `parts` is zero. Chunks are empty when
/// `data.len() < parts`, which the sort itself rejects.
pub fn split_even<T>(data: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    if parts == 0 {
        return Vec::new();
    }
    let base_chunk_size = data.len() / parts;
    let remainder = data.len() % parts;
    let sizes: Vec<usize> = (0..parts)
        .map(|i| {
            if i < remainder {
                base_chunk_size + 1
            } else {
                base_chunk_size
            }
        })
        .collect();
    split_contiguous(data, &sizes)
}

/// Splits `data` into consecutive chunks of the given sizes. `None` when the
/// sizes do not add up to `data.len()`.
pub fn split_by_sizes<T>(data: Vec<T>, sizes: &[usize]) -> Option<Vec<Vec<T>>> {
    if sizes.iter().sum::<usize>() != data.len() {
        return None;
    }
    Some(split_contiguous(data, sizes))
}

fn split_contiguous<T>(data: Vec<T>, sizes: &[usize]) -> Vec<Vec<T>> {
    let mut chunks = Vec::with_capacity(sizes.len());
    let mut rest = data.into_iter();
    for &size in sizes {
        chunks.push(rest.by_ref().take(size).collect());
    }
    chunks
}

/// Concatenates partitions in rank order.
pub fn concat<T: Clone>(parts: &[Vec<T>]) -> Vec<T> {
    let mut combined = Vec::with_capacity(parts.iter().map(Vec::len).sum());
    for part in parts {
        combined.extend_from_slice(part);
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_even_spreads_remainder_first() {
        let parts = split_even((0..7).collect::<Vec<_>>(), 3);
        assert_eq!(parts, vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]);
        assert!(split_even(vec![1, 2], 0).is_empty());
    }

    #[test]
    fn test_split_by_sizes() {
        let parts = split_by_sizes(vec!['a', 'b', 'c', 'd'], &[1, 3]).unwrap();
        assert_eq!(parts, vec![vec!['a'], vec!['b', 'c', 'd']]);
        assert!(split_by_sizes(vec![1, 2, 3], &[1, 1]).is_none());
    }

    #[test]
    fn test_concat_restores_split() {
        let data: Vec<u32> = (0..10).collect();
        assert_eq!(concat(&split_even(data.clone(), 4)), data);
    }
}
