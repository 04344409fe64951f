//! Detected-photon capture: the sphere test against the detector list and
//! the fixed-width record buffer the workers write into through an atomic
//! cursor. Overflowing records are dropped but still counted so the host
//! can report the loss.

use crate::config::{Config, Detector};
use crate::math::random::RAND_STATE_WORDS;
use crate::math::vector::Vec3;

use log::warn;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-worker scratch tracking one photon's per-medium statistics. The
/// medium index is 1-based in the mesh tables; entry `i` here belongs to
/// medium `i + 1`.
pub struct PartialPath {
    pub scat: Vec<f32>,
    pub path: Vec<f32>,
    pub momentum: Vec<f32>,
}

impl PartialPath {
    pub fn new(num_media: usize) -> Self {
        PartialPath {
            scat: vec![0.0; num_media],
            path: vec![0.0; num_media],
            momentum: vec![0.0; num_media],
        }
    }

    /// Clears the scratch for the next photon.
    pub fn reset(&mut self) {
        for x in self.scat.iter_mut() {
            *x = 0.0;
        }
        for x in self.path.iter_mut() {
            *x = 0.0;
        }
        for x in self.momentum.iter_mut() {
            *x = 0.0;
        }
    }
}

/// The shared detected-photon buffer.
pub struct DetectorBank {
    dets: Vec<Detector>,
    reclen: usize,
    max_detected: usize,
    num_media: usize,
    save_exit: bool,
    save_momentum: bool,
    save_seed: bool,
    cursor: AtomicUsize,
    records: UnsafeCell<Vec<f32>>,
    seeds: UnsafeCell<Vec<[u64; RAND_STATE_WORDS]>>,
}

// The cursor hands every record index to exactly one worker, so no two
// threads ever write the same slot.
unsafe impl Sync for DetectorBank {}

impl DetectorBank {
    /// Allocates the buffer for `cfg`; `num_media` is the number of
    /// non-background media (one scatter/pathlength column each).
    pub fn new(cfg: &Config, num_media: usize) -> Self {
        let reclen = cfg.reclen(num_media);
        let cap = if cfg.is_save_det { cfg.max_detected } else { 0 };
        DetectorBank {
            dets: cfg.detectors.clone(),
            reclen,
            max_detected: cap,
            num_media,
            save_exit: cfg.is_save_exit,
            save_momentum: cfg.is_momentum,
            save_seed: cfg.is_save_seed,
            cursor: AtomicUsize::new(0),
            records: UnsafeCell::new(vec![0.0; cap * reclen]),
            seeds: UnsafeCell::new(vec![[0u64; RAND_STATE_WORDS]; if cfg.is_save_seed { cap } else { 0 }]),
        }
    }

    /// Width in floats of one record.
    pub fn reclen(&self) -> usize {
        self.reclen
    }

    /// First detector whose sphere contains `p`; ids are 1-based.
    pub fn find_detector(&self, p: Vec3<f64>) -> Option<u32> {
        for (i, det) in self.dets.iter().enumerate() {
            if (p - det.pos).length2() <= det.r * det.r {
                return Some((i + 1) as u32);
            }
        }
        None
    }

    /// Writes one detected-photon record if a detector captures the exit
    /// position. Returns whether the photon hit a detector (even when the
    /// record itself was dropped on overflow).
    pub fn capture(
        &self,
        p: Vec3<f64>,
        v: Vec3<f64>,
        w0: f64,
        seed: [u64; RAND_STATE_WORDS],
        partial: &PartialPath,
    ) -> bool {
        if self.max_detected == 0 {
            return false;
        }
        let det_id = match self.find_detector(p) {
            Some(id) => id,
            None => return false,
        };

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        if idx >= self.max_detected {
            // Dropped; the cursor keeps counting so overflow stays
            // reportable.
            return true;
        }

        let rec = unsafe {
            let buf = &mut *self.records.get();
            &mut buf[idx * self.reclen..(idx + 1) * self.reclen]
        };
        let mut at = 0;
        rec[at] = det_id as f32;
        at += 1;
        rec[at..at + self.num_media].copy_from_slice(&partial.scat);
        at += self.num_media;
        rec[at..at + self.num_media].copy_from_slice(&partial.path);
        at += self.num_media;
        if self.save_momentum {
            rec[at..at + self.num_media].copy_from_slice(&partial.momentum);
            at += self.num_media;
        }
        if self.save_exit {
            rec[at] = p.x as f32;
            rec[at + 1] = p.y as f32;
            rec[at + 2] = p.z as f32;
            rec[at + 3] = v.x as f32;
            rec[at + 4] = v.y as f32;
            rec[at + 5] = v.z as f32;
            at += 6;
        }
        rec[at] = w0 as f32;

        if self.save_seed {
            unsafe {
                (&mut *self.seeds.get())[idx] = seed;
            }
        }
        true
    }

    /// Tears the bank down into `(records, seeds, total_hits)`. The
    /// record buffer is truncated to what was actually stored; the total
    /// includes dropped records.
    pub fn finish(self) -> (Vec<f32>, Vec<[u64; RAND_STATE_WORDS]>, usize) {
        let total = self.cursor.into_inner();
        let stored = total.min(self.max_detected);
        if total > stored {
            warn!(
                "detected-photon buffer overflow: {} of {} records dropped",
                total - stored,
                total
            );
        }
        let mut records = self.records.into_inner();
        records.truncate(stored * self.reclen);
        let mut seeds = self.seeds.into_inner();
        seeds.truncate(stored);
        (records, seeds, total)
    }
}
