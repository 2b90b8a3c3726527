//! Loss-driven reliability control.
//!
//! The training loop publishes its latest loss as one ASCII decimal in a
//! per-node file. Each round the sender re-reads it and scales the
//! reliability fraction `k` by how far the loss has fallen from the first
//! observation: early training (loss near its starting point) keeps most
//! fragments on the reliable channel, late training lets more of them ride
//! the lossy ones, down to a configured floor.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

/// Handle on the loss side-channel file.
///
/// The file is created if absent so a worker can come up before its trainer
/// writes the first loss. Reads are non-destructive: the cursor rewinds so
/// the next round sees the freshest value.
#[derive(Debug)]
pub struct LossFile {
    file: File,
    path: PathBuf,
}

impl LossFile {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open loss file {}", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current loss: first line of the file, parsed as `f32`.
    ///
    /// An empty or unparsable file reads as `0.0`, matching a trainer that
    /// has not produced a loss yet.
    pub fn read_current(&mut self) -> f32 {
        if self.file.seek(SeekFrom::Start(0)).is_err() {
            return 0.0;
        }
        let mut buf = String::new();
        if self.file.read_to_string(&mut buf).is_err() {
            return 0.0;
        }
        match buf
            .lines()
            .next()
            .and_then(|line| line.trim().parse::<f32>().ok())
        {
            Some(loss) => loss,
            None => {
                debug!(path = %self.path.display(), "loss file empty or unparsable");
                0.0
            }
        }
    }
}

/// Adaptive reliability-fraction state.
#[derive(Clone, Debug)]
pub struct AdaptiveK {
    k_init: f32,
    k_min: f32,
    adaptive: bool,
    first_loss: f32,
    rt_loss: f32,
    pre_loss: f32,
    delta_l: f32,
}

impl AdaptiveK {
    pub fn new(k_init: f32, k_min: f32, adaptive: bool) -> Self {
        Self {
            k_init,
            k_min,
            adaptive,
            first_loss: 0.0,
            rt_loss: 0.0,
            pre_loss: 0.0,
            delta_l: 0.0,
        }
    }

    /// Fold one loss observation into the controller.
    ///
    /// The first non-zero observation becomes the baseline every later `k`
    /// is scaled against.
    pub fn observe(&mut self, cur_loss: f32) {
        self.delta_l = if self.pre_loss != 0.0 {
            self.pre_loss - cur_loss
        } else {
            1.0
        };
        self.pre_loss = cur_loss;
        self.rt_loss = cur_loss;
        if self.first_loss == 0.0 {
            self.first_loss = cur_loss;
        }
    }

    /// Current reliability fraction.
    ///
    /// `k_init * rt_loss / first_loss`, floored at `k_min`, when adaptation
    /// is on and a baseline exists; plain `k_init` otherwise.
    pub fn k(&self) -> f32 {
        if !self.adaptive || self.first_loss == 0.0 {
            return self.k_init;
        }
        (self.k_init * self.rt_loss / self.first_loss).max(self.k_min)
    }

    pub fn k_init(&self) -> f32 {
        self.k_init
    }

    pub fn k_min(&self) -> f32 {
        self.k_min
    }

    pub fn first_loss(&self) -> f32 {
        self.first_loss
    }

    pub fn rt_loss(&self) -> f32 {
        self.rt_loss
    }

    /// Loss improvement since the previous round (1.0 before any history).
    pub fn delta(&self) -> f32 {
        self.delta_l
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loss_file_reads_first_line_and_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loss.csv");
        std::fs::write(&path, "2.5\n9.9\n").unwrap();
        let mut loss = LossFile::open(&path).unwrap();
        assert_eq!(loss.read_current(), 2.5);
        // Re-reads pick up rewritten contents.
        std::fs::write(&path, "1.25\n").unwrap();
        assert_eq!(loss.read_current(), 1.25);
    }

    #[test]
    fn missing_or_garbled_loss_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loss.csv");
        let mut loss = LossFile::open(&path).unwrap();
        assert_eq!(loss.read_current(), 0.0);
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        f.write_all(b"not-a-number\n").unwrap();
        assert_eq!(loss.read_current(), 0.0);
    }

    #[test]
    fn k_scales_with_loss_descent() {
        let mut ctl = AdaptiveK::new(0.5, 0.1, true);
        ctl.observe(4.0);
        assert_eq!(ctl.first_loss(), 4.0);
        assert!((ctl.k() - 0.5).abs() < 1e-6);
        ctl.observe(2.0);
        assert!((ctl.k() - 0.25).abs() < 1e-6);
        assert!((ctl.delta() - 2.0).abs() < 1e-6);
        ctl.observe(1.0);
        assert!((ctl.k() - 0.125).abs() < 1e-6);
    }

    #[test]
    fn k_is_floored_at_minimum() {
        let mut ctl = AdaptiveK::new(0.5, 0.1, true);
        ctl.observe(10.0);
        ctl.observe(0.1);
        assert!((ctl.k() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn fixed_mode_ignores_loss() {
        let mut ctl = AdaptiveK::new(0.4, 0.1, false);
        ctl.observe(10.0);
        ctl.observe(1.0);
        assert!((ctl.k() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn first_delta_defaults_to_one() {
        let mut ctl = AdaptiveK::new(0.5, 0.1, true);
        ctl.observe(4.0);
        assert!((ctl.delta() - 1.0).abs() < 1e-6);
    }
}
