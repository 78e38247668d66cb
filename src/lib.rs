//! Aligns several recordings of the same event on a shared timeline.
//!
//! Files are fingerprinted from spectrogram peak constellations, every file
//! is matched against every other one, and the pairwise offsets are resolved
//! into one shift per file. Cross-correlation and spectrogram-image
//! comparison are available as alternative matchers.
//!
//! ```no_run
//! use echosync::{AlignInput, Aligner};
//!
//! let aligner = Aligner::default();
//! let result = aligner.align(AlignInput::Directory("takes/".into()), "fingerprints", None)?;
//! for (file, shift) in &result.shifts {
//!     println!("{file}: {shift:.3}s");
//! }
//! # Ok::<(), echosync::AlignError>(())
//! ```

pub mod audio;
pub mod config;
pub mod consensus;
pub mod correlation;
pub mod db;
pub mod error;
pub mod hashing;
pub mod matching;
pub mod recognizer;
pub mod resolve;
pub mod session;
pub mod spectrogram;
pub mod types;
pub mod visual;
pub mod writer;

pub use audio::{AudioDecoder, DecodedAudio, WavDecoder};
pub use config::{
    AlignerConfig, CorrelationConfig, FingerprintConfig, RecognizeOptions, VisualConfig,
};
pub use db::{FingerprintRecord, Store};
pub use error::{AlignError, Result};
pub use hashing::Fingerprints;
pub use resolve::ShiftTable;
pub use session::{
    AlignInput, Aligner, AlignmentResult, BatchReport, FailedFile, recalc_shifts_index,
};
pub use types::{Hypothesis, MatchInfo, MatchResult, Technique};
