use std::cmp::Ordering;

/// In-place softmax. Entries must be finite except for banned ones at -inf, which map
/// to 0; at least one entry has to be finite.
pub fn softmax(x: &mut [f32]) {
    let Some(max) = x.iter().copied().reduce(f32::max) else {
        return;
    };
    let mut sum = 0.0;
    for logit in x.iter_mut() {
        *logit = (*logit - max).exp();
        sum += *logit;
    }
    divide(x, sum);
}

fn divide(x: &mut [f32], by: f32) {
    x.iter_mut().for_each(|val| *val /= by);
}

/// Rescales `x` to sum to 1. Leaves it untouched when the sum is not positive.
pub fn normalize(x: &mut [f32]) {
    let sum: f32 = x.iter().sum();
    if sum > 0.0 {
        divide(x, sum);
    }
}

/// Index of the largest value; the first one wins on ties.
pub fn argmax(x: &[f32]) -> usize {
    x.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &val)| match best {
            Some((_, b)) if val.partial_cmp(&b) != Some(Ordering::Greater) => best,
            _ => Some((i, val)),
        })
        .map(|(index, _)| index)
        .unwrap_or(0)
}
