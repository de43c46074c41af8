use chrono::Local;
use std::path::{Path, PathBuf};

pub fn timestamp_for_filename() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Destination for a received card photo: `cccd_<citizenId>_<timestamp>.jpg`.
///
/// The citizen id comes from an untrusted peer, so anything that is not
/// alphanumeric is stripped before it becomes part of a filename.
pub fn cccd_image_path(dir: &Path, citizen_id: &str) -> PathBuf {
    let safe_id: String = citizen_id.chars().filter(|c| c.is_alphanumeric()).collect();
    dir.join(format!("cccd_{}_{}.jpg", safe_id, timestamp_for_filename()))
}

/// Destination for a live capture: `face_<timestamp>.jpg`.
pub fn captured_face_path(dir: &Path) -> PathBuf {
    dir.join(format!("face_{}.jpg", timestamp_for_filename()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cccd_filename_is_keyed_by_id_and_timestamp() {
        let path = cccd_image_path(Path::new("/data/cccd_images"), "001204038012");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("cccd_001204038012_"));
        assert!(name.ends_with(".jpg"));
    }

    #[test]
    fn path_traversal_in_citizen_id_is_neutralized() {
        let path = cccd_image_path(Path::new("/data/cccd_images"), "../../etc/passwd");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("cccd_etcpasswd_{}.jpg", timestamp_for_filename()));
        assert!(path.starts_with("/data/cccd_images"));
    }

    #[test]
    fn captured_face_filename_is_timestamp_only() {
        let path = captured_face_path(Path::new("/data/captured_faces"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("face_"));
        assert!(name.ends_with(".jpg"));
    }
}
