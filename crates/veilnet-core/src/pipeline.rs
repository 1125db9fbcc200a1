//! The frame pipeline: device frame in, DATA_FRAME out, and back.
//!
//! One pipeline per peer, shared by the relay and direct paths: counters and
//! the replay window are session-wide, not path-wide, so in-flight frames
//! from the old path remain valid across a migration.
//!
//! Egress acquires the next counter, seals the raw Ethernet frame under the
//! TX key, and emits `counter || ciphertext || tag`. Ingress checks the
//! replay window, opens the ciphertext, and validates the frame bounds.
//! Individual frame failures are counted and never tear the session down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use veilnet_crypto::aead::FrameCipher;
use veilnet_crypto::{SessionKeySet, COUNTER_LIMIT, NONCE_SALT_SIZE};
use veilnet_device::MIN_FRAME_SIZE;
use veilnet_proto::payload::DataFrame;

use crate::error::PipelineError;
use crate::replay::ReplayWindow;

/// Margin below the 2^48 counter ceiling at which rotation is requested
const ROTATION_MARGIN: u64 = 1 << 16;

/// Drop and delivery counters, readable without locks
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Frames sealed and handed to the transport
    pub frames_sent: AtomicU64,
    /// Frames opened and written to the device
    pub frames_received: AtomicU64,
    /// Ingress frames rejected by the replay window
    pub replay_rejected: AtomicU64,
    /// Ingress frames dropped on AEAD failure
    pub decrypt_failures: AtomicU64,
    /// Frames dropped for violating the size bounds
    pub size_dropped: AtomicU64,
    /// Egress frames dropped because the writer queue was full
    pub queue_dropped: AtomicU64,
}

struct TxState {
    cipher: FrameCipher,
    salt: [u8; NONCE_SALT_SIZE],
    counter: u64,
}

struct RxState {
    cipher: FrameCipher,
    salt: [u8; NONCE_SALT_SIZE],
    window: ReplayWindow,
}

/// Encrypt/decrypt engine for one peer session
pub struct FramePipeline {
    mtu: u16,
    tx: Mutex<Option<TxState>>,
    rx: Mutex<Option<RxState>>,
    stats: PipelineStats,
}

impl FramePipeline {
    /// Create a pipeline with no keys yet; frames are refused until
    /// [`Self::install_keys`] runs.
    #[must_use]
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu,
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            stats: PipelineStats::default(),
        }
    }

    /// Create a pipeline with keys installed
    #[must_use]
    pub fn with_keys(keys: &SessionKeySet, mtu: u16) -> Self {
        let pipeline = Self::new(mtu);
        pipeline.install_keys(keys);
        pipeline
    }

    /// Install (or replace, on re-key) the session keys.
    ///
    /// Counters reset and the replay window clears; the salts come from the
    /// new key set.
    pub fn install_keys(&self, keys: &SessionKeySet) {
        *self.tx.lock().expect("tx lock") = Some(TxState {
            cipher: FrameCipher::new(&keys.tx_key),
            salt: keys.tx_salt,
            counter: 0,
        });
        *self.rx.lock().expect("rx lock") = Some(RxState {
            cipher: FrameCipher::new(&keys.rx_key),
            salt: keys.rx_salt,
            window: ReplayWindow::new(),
        });
    }

    /// Whether keys are installed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.tx.lock().expect("tx lock").is_some()
    }

    /// Negotiated device MTU
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Whether the TX counter is close enough to 2^48 that a key-rotation
    /// HELLO must run before further frames.
    #[must_use]
    pub fn needs_rotation(&self) -> bool {
        self.tx
            .lock()
            .expect("tx lock")
            .as_ref()
            .is_some_and(|tx| tx.counter >= COUNTER_LIMIT - ROTATION_MARGIN)
    }

    /// Seal one Ethernet frame for transmission.
    ///
    /// # Errors
    ///
    /// Size violations and counter exhaustion are returned to the caller,
    /// which drops the frame and bumps the matching counter.
    pub fn encrypt_frame(&self, frame: &[u8]) -> Result<DataFrame, PipelineError> {
        self.validate_len(frame.len())?;

        let mut guard = self.tx.lock().expect("tx lock");
        let tx = guard.as_mut().ok_or(PipelineError::NotReady)?;

        if tx.counter + 1 >= COUNTER_LIMIT {
            return Err(PipelineError::CounterExhausted);
        }
        tx.counter += 1;
        let counter = tx.counter;

        let ciphertext = tx
            .cipher
            .seal(counter, &tx.salt, frame)
            .map_err(|_| PipelineError::CounterExhausted)?;

        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(DataFrame {
            counter,
            ciphertext,
        })
    }

    /// Open one received DATA_FRAME.
    ///
    /// The replay window is consulted before decryption but only committed
    /// after the tag verifies, so a forged counter cannot block the
    /// legitimate frame.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Replay`] for stale or duplicate counters,
    /// [`PipelineError::Decrypt`] on tag mismatch, size errors for frames
    /// outside `[14, mtu + 14]`. All are drop-and-count conditions.
    pub fn decrypt_frame(&self, frame: &DataFrame) -> Result<Vec<u8>, PipelineError> {
        let mut guard = self.rx.lock().expect("rx lock");
        let rx = guard.as_mut().ok_or(PipelineError::NotReady)?;

        if !rx.window.check(frame.counter) {
            self.stats.replay_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::Replay(frame.counter));
        }

        let plaintext = rx
            .cipher
            .open(frame.counter, &rx.salt, &frame.ciphertext)
            .map_err(|_| {
                self.stats.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                PipelineError::Decrypt
            })?;

        rx.window.commit(frame.counter);
        drop(guard);

        self.validate_len(plaintext.len())?;
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        Ok(plaintext)
    }

    /// Record an egress drop caused by writer-queue backpressure
    pub fn note_queue_drop(&self) {
        self.stats.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Delivery and drop counters
    #[must_use]
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    fn validate_len(&self, len: usize) -> Result<(), PipelineError> {
        if len < MIN_FRAME_SIZE {
            self.stats.size_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::FrameTooShort(len));
        }
        if len > usize::from(self.mtu) + MIN_FRAME_SIZE {
            self.stats.size_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::FrameTooLarge(len));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilnet_crypto::SessionKeySet;

    fn key_pair() -> (SessionKeySet, SessionKeySet) {
        let a = SessionKeySet {
            tx_key: [1u8; 32],
            rx_key: [2u8; 32],
            proof_key: [3u8; 32],
            tx_salt: [4u8; 6],
            rx_salt: [5u8; 6],
        };
        let b = SessionKeySet {
            tx_key: [2u8; 32],
            rx_key: [1u8; 32],
            proof_key: [3u8; 32],
            tx_salt: [5u8; 6],
            rx_salt: [4u8; 6],
        };
        (a, b)
    }

    fn sample_frame(len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[..6].copy_from_slice(&[0xFF; 6]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        frame
    }

    #[test]
    fn test_roundtrip() {
        let (ka, kb) = key_pair();
        let a = FramePipeline::with_keys(&ka, 1500);
        let b = FramePipeline::with_keys(&kb, 1500);

        let frame = sample_frame(42);
        let df = a.encrypt_frame(&frame).unwrap();
        assert_eq!(df.counter, 1);

        let out = b.decrypt_frame(&df).unwrap();
        assert_eq!(out, frame);
        assert_eq!(b.stats().frames_received.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_counters_strictly_increasing() {
        let (ka, _) = key_pair();
        let a = FramePipeline::with_keys(&ka, 1500);

        let mut last = 0;
        for _ in 0..100 {
            let df = a.encrypt_frame(&sample_frame(60)).unwrap();
            assert!(df.counter > last);
            last = df.counter;
        }
    }

    #[test]
    fn test_replay_rejected() {
        let (ka, kb) = key_pair();
        let a = FramePipeline::with_keys(&ka, 1500);
        let b = FramePipeline::with_keys(&kb, 1500);

        let df = a.encrypt_frame(&sample_frame(60)).unwrap();
        b.decrypt_frame(&df).unwrap();

        assert_eq!(b.decrypt_frame(&df), Err(PipelineError::Replay(1)));
        assert_eq!(b.stats().replay_rejected.load(Ordering::Relaxed), 1);

        // The legitimate sequence continues unaffected
        let df2 = a.encrypt_frame(&sample_frame(60)).unwrap();
        assert!(b.decrypt_frame(&df2).is_ok());
    }

    #[test]
    fn test_tampered_frame_dropped_session_survives() {
        let (ka, kb) = key_pair();
        let a = FramePipeline::with_keys(&ka, 1500);
        let b = FramePipeline::with_keys(&kb, 1500);

        let mut df = a.encrypt_frame(&sample_frame(60)).unwrap();
        df.ciphertext[10] ^= 0x01;

        assert_eq!(b.decrypt_frame(&df), Err(PipelineError::Decrypt));
        assert_eq!(b.stats().decrypt_failures.load(Ordering::Relaxed), 1);

        let df2 = a.encrypt_frame(&sample_frame(60)).unwrap();
        assert!(b.decrypt_frame(&df2).is_ok());
    }

    #[test]
    fn test_forged_counter_does_not_poison_window() {
        let (ka, kb) = key_pair();
        let a = FramePipeline::with_keys(&ka, 1500);
        let b = FramePipeline::with_keys(&kb, 1500);

        let df = a.encrypt_frame(&sample_frame(60)).unwrap();

        let forged = DataFrame {
            counter: df.counter,
            ciphertext: vec![0u8; df.ciphertext.len()],
        };
        assert_eq!(b.decrypt_frame(&forged), Err(PipelineError::Decrypt));

        // The real frame with the same counter still goes through
        assert!(b.decrypt_frame(&df).is_ok());
    }

    #[test]
    fn test_size_bounds() {
        let (ka, _) = key_pair();
        let a = FramePipeline::with_keys(&ka, 1500);

        assert!(a.encrypt_frame(&sample_frame(14)).is_ok());
        assert!(a.encrypt_frame(&sample_frame(1514)).is_ok());
        assert_eq!(
            a.encrypt_frame(&[0u8; 13]),
            Err(PipelineError::FrameTooShort(13))
        );
        assert_eq!(
            a.encrypt_frame(&sample_frame(1515)),
            Err(PipelineError::FrameTooLarge(1515))
        );
        assert_eq!(a.stats().size_dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_not_ready() {
        let p = FramePipeline::new(1500);
        assert!(!p.is_ready());
        assert_eq!(
            p.encrypt_frame(&sample_frame(60)),
            Err(PipelineError::NotReady)
        );
    }

    #[test]
    fn test_rekey_resets_counters() {
        let (ka, kb) = key_pair();
        let a = FramePipeline::with_keys(&ka, 1500);
        let b = FramePipeline::with_keys(&kb, 1500);

        for _ in 0..10 {
            let df = a.encrypt_frame(&sample_frame(60)).unwrap();
            b.decrypt_frame(&df).unwrap();
        }

        a.install_keys(&ka);
        b.install_keys(&kb);

        let df = a.encrypt_frame(&sample_frame(60)).unwrap();
        assert_eq!(df.counter, 1);
        assert!(b.decrypt_frame(&df).is_ok());
    }
}
