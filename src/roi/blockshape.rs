//! Heuristics for choosing block shapes.
//!
//! Streaming and caching both work in units of blocks. When an upstream
//! operator does not advertise an ideal block shape, these functions derive
//! one from a pixel budget.

/// Choose a block shape close to `target_block_volume` pixels, never larger
/// than `max_shape` on any axis.
///
/// The result is as isometric as possible. Axes constrained by a small
/// `max_shape` are filled first so the remaining axes can pick up the slack.
///
/// ```
/// use blockflow::roi::determine_block_shape;
///
/// assert_eq!(determine_block_shape(&[1000, 2000, 3000, 1], 1e6), vec![100, 100, 100, 1]);
/// assert_eq!(determine_block_shape(&[1, 100, 5, 200, 3], 1000.0), vec![1, 8, 5, 8, 3]);
/// ```
pub fn determine_block_shape(max_shape: &[usize], target_block_volume: f64) -> Vec<usize> {
    let ndim = max_shape.len();

    // Smallest axes first, ties broken by axis position
    let mut sorted: Vec<(usize, usize)> = max_shape
        .iter()
        .enumerate()
        .map(|(axis, &m)| (m, axis))
        .collect();
    sorted.sort();

    let mut block_shape = vec![0usize; ndim];
    let mut volume_so_far = 1.0f64;
    for (position, &(max_side, axis)) in sorted.iter().enumerate() {
        let remaining_axes = (ndim - position) as f64;
        let remaining_factor = (target_block_volume / volume_so_far).floor();
        let side = (remaining_factor.max(0.0).powf(1.0 / remaining_axes) + 0.5) as usize;
        let side = side.min(max_side).max(1);
        block_shape[axis] = side;
        volume_so_far *= side as f64;
    }
    block_shape
}

/// Choose a request block shape for streaming a whole array.
///
/// * `max_blockshape` - upper bound on every axis (usually the array shape)
/// * `ideal_blockshape` - preferred atomic shape; a `0` entry means "as much
///   of this axis as possible"
/// * `ram_usage_per_requested_pixel` - bytes consumed per requested pixel
/// * `num_threads` - number of blocks expected to be in flight at once
/// * `available_ram` - total bytes the in-flight blocks may use
///
/// The ideal shape is first completed and clipped, then an atomic block is
/// derived for the per-thread pixel budget. If the budget allows, the block is
/// grown in whole multiples of the ideal shape, each step picking the axis
/// whose expansion leaves the smallest surface-to-volume ratio.
///
/// ```
/// use blockflow::roi::determine_optimal_request_blockshape;
///
/// let shape = determine_optimal_request_blockshape(&[1000, 1000, 100], &[0, 0, 1], 4.0, 10, 1e6);
/// assert_eq!(shape, vec![158, 158, 1]);
///
/// let shape = determine_optimal_request_blockshape(&[1000, 1000, 100], &[0, 0, 1], 4.0, 10, 1e9);
/// assert_eq!(shape, vec![1000, 1000, 24]);
/// ```
pub fn determine_optimal_request_blockshape(
    max_blockshape: &[usize],
    ideal_blockshape: &[usize],
    ram_usage_per_requested_pixel: f64,
    num_threads: usize,
    available_ram: f64,
) -> Vec<usize> {
    assert_eq!(max_blockshape.len(), ideal_blockshape.len());

    let target_bytes = (available_ram / num_threads.max(1) as f64).floor();
    let target_pixels = (target_bytes / ram_usage_per_requested_pixel.max(f64::MIN_POSITIVE)).floor();

    let clipped_ideal: Vec<usize> = ideal_blockshape
        .iter()
        .zip(max_blockshape)
        .map(|(&ideal, &max)| if ideal == 0 { max } else { ideal.min(max) })
        .collect();

    let atomic = determine_block_shape(&clipped_ideal, target_pixels);

    let ideal_volume: f64 = clipped_ideal.iter().map(|&s| s as f64).product();
    if ideal_volume >= target_pixels {
        // The budget can't hold more than one atomic block anyway
        return atomic;
    }

    let mut block_shape: Vec<usize> = determine_block_shape(&clipped_ideal, target_pixels)
        .iter()
        .zip(&atomic)
        .map(|(&b, &a)| (b - b % a).max(a))
        .collect();

    loop {
        let candidates: Vec<Vec<usize>> = (0..block_shape.len())
            .filter_map(|axis| {
                let mut candidate = block_shape.clone();
                candidate[axis] += clipped_ideal[axis];
                let fits = candidate.iter().zip(max_blockshape).all(|(c, m)| c <= m);
                let volume: f64 = candidate.iter().map(|&s| s as f64).product();
                (fits && volume < target_pixels).then_some(candidate)
            })
            .collect();

        let best = candidates.into_iter().min_by(|a, b| {
            normalized_surface_area(a).total_cmp(&normalized_surface_area(b))
        });
        match best {
            Some(shape) => block_shape = shape,
            None => break,
        }
    }

    block_shape
}

fn normalized_surface_area(shape: &[usize]) -> f64 {
    let mut surface = 0.0;
    for i in 0..shape.len() {
        for j in (i + 1)..shape.len() {
            surface += (shape[i] * shape[j]) as f64;
        }
    }
    let volume: f64 = shape.iter().map(|&s| s as f64).product();
    2.0 * surface / volume
}

/// Clip `block_shape` so no axis exceeds `array_shape` (keeping at least 1).
pub fn clip_block_shape(block_shape: &[usize], array_shape: &[usize]) -> Vec<usize> {
    block_shape
        .iter()
        .zip(array_shape)
        .map(|(&b, &m)| b.min(m.max(1)).max(1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_shape_respects_max() {
        let shape = determine_block_shape(&[10, 10, 10], 1e9);
        assert_eq!(shape, vec![10, 10, 10]);
    }

    #[test]
    fn test_block_shape_small_target() {
        let shape = determine_block_shape(&[100, 100], 0.5);
        assert_eq!(shape, vec![1, 1]);
    }

    #[test]
    fn test_block_shape_examples() {
        assert_eq!(
            determine_block_shape(&[1000, 2000, 3000, 1], 1e6),
            vec![100, 100, 100, 1]
        );
        assert_eq!(
            determine_block_shape(&[1, 100, 5, 200, 3], 1000.0),
            vec![1, 8, 5, 8, 3]
        );
    }

    #[test]
    fn test_optimal_blockshape_small_budget() {
        let shape = determine_optimal_request_blockshape(&[1000, 1000, 100], &[0, 0, 1], 4.0, 10, 1e6);
        assert_eq!(shape, vec![158, 158, 1]);
    }

    #[test]
    fn test_optimal_blockshape_stacks_ideal() {
        let shape = determine_optimal_request_blockshape(&[1000, 1000, 100], &[0, 0, 1], 4.0, 10, 1e9);
        assert_eq!(shape, vec![1000, 1000, 24]);
    }

    #[test]
    fn test_clip_block_shape() {
        assert_eq!(clip_block_shape(&[32, 32, 32], &[1, 100, 0]), vec![1, 32, 1]);
    }
}
