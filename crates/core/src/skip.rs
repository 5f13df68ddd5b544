// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Counter-based frame-rate reduction.

/// Decides which buffers to skip so that `input_fps` buffers per second come out
/// as `output_fps`.
///
/// Only counters are kept; no buffer is ever referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSkip {
    input_fps: u32,
    output_fps: u32,
    in_count: u64,
    out_count: u64,
    multiple: u64,
    first: bool,
}

impl Default for FrameSkip {
    fn default() -> Self {
        Self::new(30, 30)
    }
}

impl FrameSkip {
    pub const fn new(input_fps: u32, output_fps: u32) -> Self {
        Self { input_fps, output_fps, in_count: 0, out_count: 0, multiple: 0, first: true }
    }

    /// Changes the rates; counters restart on the next buffer.
    pub const fn reset(&mut self, input_fps: u32, output_fps: u32) {
        self.input_fps = input_fps;
        self.output_fps = output_fps;
        self.first = true;
    }

    pub const fn rates(&self) -> (u32, u32) {
        (self.input_fps, self.output_fps)
    }

    /// Returns true if the current buffer should be skipped.
    pub fn should_skip(&mut self) -> bool {
        let input = u64::from(self.input_fps);
        let output = u64::from(self.output_fps);

        if self.first {
            self.in_count = 0;
            self.out_count = 0;
            self.multiple = input * output;
            self.first = false;
        }

        if self.in_count > self.out_count {
            self.out_count += output;
            return true;
        }

        if self.in_count == self.multiple {
            self.in_count = 0;
            self.out_count = 0;
        }

        self.in_count += input;
        self.out_count += output;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kept(skip: &mut FrameSkip, n: usize) -> usize {
        (0..n).filter(|_| !skip.should_skip()).count()
    }

    #[test]
    fn test_equal_rates_never_skip() {
        let mut skip = FrameSkip::new(30, 30);
        assert_eq!(kept(&mut skip, 300), 300);
    }

    #[test]
    fn test_halving_keeps_every_other() {
        let mut skip = FrameSkip::new(30, 15);
        let pattern: Vec<bool> = (0..6).map(|_| skip.should_skip()).collect();
        assert_eq!(pattern, vec![false, true, false, true, false, true]);
    }

    #[test]
    fn test_thirty_to_ten_over_one_second() {
        let mut skip = FrameSkip::new(30, 10);
        assert_eq!(kept(&mut skip, 30), 10);
        assert_eq!(kept(&mut skip, 30), 10);
    }

    #[test]
    fn test_reset_applies_new_rates() {
        let mut skip = FrameSkip::new(30, 15);
        assert_eq!(kept(&mut skip, 30), 15);
        skip.reset(30, 30);
        assert_eq!(kept(&mut skip, 30), 30);
        assert_eq!(skip.rates(), (30, 30));
    }

    #[test]
    fn test_upsampling_request_never_skips() {
        let mut skip = FrameSkip::new(15, 30);
        assert_eq!(kept(&mut skip, 60), 60);
    }
}
