//! Interface to the GUI automation layer.
//!
//! The real screen backend lives outside this crate; the VM only ever
//! talks through [`ActionBackend`]. [`DryRunBackend`] is the built-in
//! stand-in used by the CLI and for rehearsing macros without a screen.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Image match parameters for one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSpec {
    /// Match on a grayscale capture; faster, slightly less accurate.
    pub grayscale: bool,
    /// Pixel stride while scanning; higher is faster, coarser.
    pub step: u8,
}

impl MatchSpec {
    /// Exact matching as forced by the PCLICK/PFIND opcodes.
    pub const PRECISE: MatchSpec = MatchSpec {
        grayscale: false,
        step: 1,
    };
}

impl Default for MatchSpec {
    fn default() -> Self {
        Self {
            grayscale: true,
            step: 2,
        }
    }
}

pub trait ActionBackend {
    /// Press the mouse `clicks` times at a screen position.
    fn click(&mut self, x: i32, y: i32, clicks: u8);

    /// Search the screen for `image` until it appears or `timeout_secs`
    /// elapse. Returns the center of the match, or `None` on timeout.
    fn locate_center(
        &mut self,
        image: &Path,
        timeout_secs: u64,
        spec: MatchSpec,
    ) -> Option<(i32, i32)>;

    fn sleep(&mut self, seconds: u64);
}

/// Resolves an image reference the same way for validation and
/// execution: relative paths live in the implicit `images` directory
/// next to the macro file.
pub fn resolve_image(base_dir: &Path, image: &str) -> PathBuf {
    let path = Path::new(image);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    base_dir.join("images").join(path)
}

/// Backend that performs no screen interaction: clicks are dropped and
/// every image is reported found at the screen origin. Waits are real.
#[derive(Debug, Default)]
pub struct DryRunBackend;

impl ActionBackend for DryRunBackend {
    fn click(&mut self, _x: i32, _y: i32, _clicks: u8) {}

    fn locate_center(
        &mut self,
        _image: &Path,
        _timeout_secs: u64,
        _spec: MatchSpec,
    ) -> Option<(i32, i32)> {
        Some((0, 0))
    }

    fn sleep(&mut self, seconds: u64) {
        thread::sleep(Duration::from_secs(seconds));
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::resolve_image;

    #[test]
    fn relative_images_resolve_into_the_images_directory() {
        assert_eq!(
            resolve_image(Path::new("/macros"), "ok.png"),
            Path::new("/macros/images/ok.png")
        );
    }

    #[test]
    fn absolute_images_are_left_alone() {
        assert_eq!(
            resolve_image(Path::new("/macros"), "/srv/shots/ok.png"),
            Path::new("/srv/shots/ok.png")
        );
    }
}
