//! Fixed-width power bins, used when clustering is unavailable or the history is small.

const BIN_WIDTH_WATTS: f64 = 200.0;
const LINEAR_LIMIT_WATTS: f64 = 2000.0;

fn bin_index(watts: f64) -> usize {
    if watts < LINEAR_LIMIT_WATTS {
        (watts.max(0.0) / BIN_WIDTH_WATTS).floor() as usize
    } else {
        (LINEAR_LIMIT_WATTS / BIN_WIDTH_WATTS) as usize
    }
}

/// Bin label per sample: 200 W bins up to 2 kW, then one open-ended bin. Negative readings
/// fall into the first bin.
pub(crate) fn bin_labels(powers: &[f64]) -> Vec<usize> {
    powers.iter().map(|p| bin_index(*p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bins_are_200_watts_then_open_ended() {
        assert_eq!(bin_labels(&[0.0, 199.9, 200.0, 1999.0, 2000.0, 9000.0, -5.0]), vec![0, 0, 1, 9, 10, 10, 0]);
    }
}
