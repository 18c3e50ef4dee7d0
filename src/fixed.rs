// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed polynomial predictors (orders 0 to 4).

use super::constant::fixed::MAX_ORDER;

/// Computes the residual of the fixed predictor with the given order.
///
/// The first `order` elements of `dest` are the warm-up samples copied
/// verbatim.
///
/// # Panics
///
/// Panics if `order > 4` or the buffers are shorter than `order`.
pub fn compute_residual(order: usize, samples: &[i32], dest: &mut [i32]) {
    assert!(order <= MAX_ORDER);
    let n = samples.len();
    debug_assert!(dest.len() >= n);
    dest[..order].copy_from_slice(&samples[..order]);
    match order {
        0 => dest[..n].copy_from_slice(samples),
        1 => {
            for i in 1..n {
                dest[i] = samples[i] - samples[i - 1];
            }
        }
        2 => {
            for i in 2..n {
                dest[i] = samples[i] - 2 * samples[i - 1] + samples[i - 2];
            }
        }
        3 => {
            for i in 3..n {
                dest[i] = samples[i] - 3 * samples[i - 1] + 3 * samples[i - 2] - samples[i - 3];
            }
        }
        4 => {
            for i in 4..n {
                dest[i] = samples[i] - 4 * samples[i - 1] + 6 * samples[i - 2]
                    - 4 * samples[i - 3]
                    + samples[i - 4];
            }
        }
        _ => unreachable!(),
    }
}

/// Reconstructs samples from a fixed-predictor residual, in place.
///
/// The first `order` elements of `data` must already contain the warm-up
/// samples; the rest contains residuals on input and samples on output.
pub fn restore_signal(order: usize, data: &mut [i32]) {
    assert!(order <= MAX_ORDER);
    let n = data.len();
    match order {
        0 => {}
        1 => {
            for i in 1..n {
                data[i] += data[i - 1];
            }
        }
        2 => {
            for i in 2..n {
                data[i] += 2 * data[i - 1] - data[i - 2];
            }
        }
        3 => {
            for i in 3..n {
                data[i] += 3 * data[i - 1] - 3 * data[i - 2] + data[i - 3];
            }
        }
        4 => {
            for i in 4..n {
                data[i] += 4 * data[i - 1] - 6 * data[i - 2] + 4 * data[i - 3] - data[i - 4];
            }
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Distribution;
    use rand::distributions::Uniform;

    #[test]
    fn polynomial_signals_are_annihilated() {
        let ramp: Vec<i32> = (0..64).map(|t| 3 * t - 17).collect();
        let mut res = vec![0i32; 64];
        compute_residual(2, &ramp, &mut res);
        assert!(res[2..].iter().all(|&r| r == 0));

        let quad: Vec<i32> = (0..64).map(|t| t * t - 5 * t).collect();
        compute_residual(3, &quad, &mut res);
        assert!(res[3..].iter().all(|&r| r == 0));

        let cubic: Vec<i32> = (0..64).map(|t| t * t * t).collect();
        compute_residual(4, &cubic, &mut res);
        assert!(res[4..].iter().all(|&r| r == 0));
    }

    #[test]
    fn constant_signal_yields_zero_first_difference() {
        let flat = vec![42i32; 33];
        let mut res = vec![0i32; 33];
        compute_residual(1, &flat, &mut res);
        assert_eq!(res[0], 42);
        assert!(res[1..].iter().all(|&r| r == 0));
    }

    #[test]
    fn residual_round_trip() {
        let mut rng = rand::thread_rng();
        let dist = Uniform::from(-(1 << 15)..(1 << 15));
        let samples: Vec<i32> = (0..256).map(|_| dist.sample(&mut rng)).collect();
        for order in 0..=4 {
            let mut buf = vec![0i32; 256];
            compute_residual(order, &samples, &mut buf);
            restore_signal(order, &mut buf);
            assert_eq!(buf, samples, "order {order}");
        }
    }
}
