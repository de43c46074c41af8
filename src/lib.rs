// Core modules
pub mod config;
pub mod detector;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod recognizer;
pub mod server;
pub mod session;
pub mod store;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use detector::{FaceBox, FaceDetector};
pub use error::{Result, VerifyError};
pub use protocol::{Ack, MessageDecoder, ScanMessage};
pub use recognizer::{euclidean_distance, Embedding, FaceRecognizer};
pub use server::CccdServer;
pub use session::{SessionState, VerificationSession};
pub use store::{ObserverId, ScanEvent, ScanRecord, ScanStore, ScanWatcher};
pub use verify::{FaceComparisonResult, FaceVerifier, MatchOutcome};
